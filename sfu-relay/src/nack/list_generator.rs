use super::{MAX_NACK_BLOCKS, NackGenerator, NackStatus};
use bytes::BytesMut;
use log::trace;
use rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use rtp::sequence::{is_newer_sequence_number, sequence_number_distance};
use shared::error::Result;
use shared::marshal::Marshal;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_NACK_INFOS: usize = 150;
pub const DEFAULT_MAX_RETRANSMITS: u8 = 2;
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NackInfo {
    seq_num: u16,
    retransmits: u8,
    sent_time: Option<Instant>,
}

impl NackInfo {
    fn new(seq_num: u16) -> Self {
        Self {
            seq_num,
            retransmits: 0,
            sent_time: None,
        }
    }
}

pub struct ListNackGeneratorBuilder {
    sender_ssrc: u32,
    max_nack_infos: usize,
    max_retransmits: u8,
    retransmit_interval: Duration,
    max_blocks: usize,
}

impl Default for ListNackGeneratorBuilder {
    fn default() -> Self {
        Self {
            sender_ssrc: 0,
            max_nack_infos: DEFAULT_MAX_NACK_INFOS,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
            max_blocks: MAX_NACK_BLOCKS,
        }
    }
}

impl ListNackGeneratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sender_ssrc(mut self, sender_ssrc: u32) -> Self {
        self.sender_ssrc = sender_ssrc;
        self
    }

    pub fn with_max_nack_infos(mut self, max_nack_infos: usize) -> Self {
        self.max_nack_infos = max_nack_infos.max(1);
        self
    }

    pub fn with_max_retransmits(mut self, max_retransmits: u8) -> Self {
        self.max_retransmits = max_retransmits;
        self
    }

    /// Minimum spacing between two requests for the same packet.
    pub fn with_retransmit_interval(mut self, retransmit_interval: Duration) -> Self {
        self.retransmit_interval = retransmit_interval;
        self
    }

    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks.clamp(1, MAX_NACK_BLOCKS);
        self
    }

    pub fn build(self, media_ssrc: u32) -> ListNackGenerator {
        ListNackGenerator {
            sender_ssrc: self.sender_ssrc,
            media_ssrc,
            max_nack_infos: self.max_nack_infos,
            max_retransmits: self.max_retransmits,
            retransmit_interval: self.retransmit_interval,
            max_blocks: self.max_blocks,
            nack_infos: VecDeque::new(),
            latest: None,
        }
    }
}

/// Loss detector keeping a bounded list of outstanding packets.
///
/// Each lost packet is requested at most `max_retransmits` times, spaced by
/// the retransmit interval. The oldest entries fall off when the list is full.
pub struct ListNackGenerator {
    sender_ssrc: u32,
    media_ssrc: u32,
    max_nack_infos: usize,
    max_retransmits: u8,
    retransmit_interval: Duration,
    max_blocks: usize,

    nack_infos: VecDeque<NackInfo>,
    latest: Option<u16>,
}

impl ListNackGenerator {
    pub fn new(sender_ssrc: u32, media_ssrc: u32) -> Self {
        ListNackGeneratorBuilder::new()
            .with_sender_ssrc(sender_ssrc)
            .build(media_ssrc)
    }

    fn is_eligible(&self, info: &NackInfo, now: Instant) -> bool {
        info.retransmits < self.max_retransmits
            && info.sent_time.is_none_or(|sent| {
                now.saturating_duration_since(sent) >= self.retransmit_interval
            })
    }

    fn any_eligible(&self, now: Instant) -> bool {
        self.nack_infos.iter().any(|info| self.is_eligible(info, now))
    }
}

impl NackGenerator for ListNackGenerator {
    fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    fn handle_rtp_packet(
        &mut self,
        now: Instant,
        sequence_number: u16,
        _is_keyframe: bool,
    ) -> NackStatus {
        let Some(latest) = self.latest else {
            self.latest = Some(sequence_number);
            return NackStatus::default();
        };

        if is_newer_sequence_number(sequence_number, latest) {
            let gap = sequence_number_distance(latest, sequence_number) as usize - 1;
            let skipped = gap.saturating_sub(self.max_nack_infos) as u16;
            let mut seq = latest.wrapping_add(1).wrapping_add(skipped);
            while seq != sequence_number {
                self.nack_infos.push_back(NackInfo::new(seq));
                seq = seq.wrapping_add(1);
            }
            while self.nack_infos.len() > self.max_nack_infos {
                if let Some(dropped) = self.nack_infos.pop_front() {
                    trace!("ssrc {} gave up on {}", self.media_ssrc, dropped.seq_num);
                }
            }
            self.latest = Some(sequence_number);
        } else {
            self.nack_infos.retain(|info| info.seq_num != sequence_number);
        }

        NackStatus {
            nack_due: self.any_eligible(now),
            pli_due: false,
        }
    }

    fn add_nack_to_report(&mut self, now: Instant, report: &mut BytesMut) -> Result<bool> {
        let eligible: Vec<u16> = self
            .nack_infos
            .iter()
            .filter(|info| self.is_eligible(info, now))
            .map(|info| info.seq_num)
            .collect();
        if eligible.is_empty() {
            return Ok(false);
        }

        let mut nacks = nack_pairs_from_sequence_numbers(&eligible);
        nacks.truncate(self.max_blocks);
        let requested: Vec<u16> = nacks.iter().flat_map(|pair| pair.packet_list()).collect();

        let nack = TransportLayerNack {
            sender_ssrc: self.sender_ssrc,
            media_ssrc: self.media_ssrc,
            nacks,
        };
        report.extend_from_slice(&nack.marshal()?);

        for info in self.nack_infos.iter_mut() {
            if requested.contains(&info.seq_num) {
                info.retransmits += 1;
                info.sent_time = Some(now);
            }
        }
        let max_retransmits = self.max_retransmits;
        self.nack_infos
            .retain(|info| info.retransmits < max_retransmits);

        Ok(true)
    }

    fn missing(&self) -> Vec<u16> {
        self.nack_infos.iter().map(|info| info.seq_num).collect()
    }
}
