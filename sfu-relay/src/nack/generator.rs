use super::{MAX_NACK_BLOCKS, NackGenerator, NackStatus};
use bytes::BytesMut;
use log::{debug, trace};
use rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use rtp::sequence::SequenceUnwrapper;
use shared::error::Result;
use shared::marshal::Marshal;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_NACK_PACKETS: usize = 200;
pub const DEFAULT_MAX_PACKET_AGE: i64 = 300;
pub const DEFAULT_MIN_NACK_INTERVAL: Duration = Duration::from_millis(50);

pub struct SetNackGeneratorBuilder {
    sender_ssrc: u32,
    max_nack_packets: usize,
    max_packet_age: i64,
    min_interval: Duration,
    max_blocks: usize,
}

impl Default for SetNackGeneratorBuilder {
    fn default() -> Self {
        Self {
            sender_ssrc: 0,
            max_nack_packets: DEFAULT_MAX_NACK_PACKETS,
            max_packet_age: DEFAULT_MAX_PACKET_AGE,
            min_interval: DEFAULT_MIN_NACK_INTERVAL,
            max_blocks: MAX_NACK_BLOCKS,
        }
    }
}

impl SetNackGeneratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sender_ssrc(mut self, sender_ssrc: u32) -> Self {
        self.sender_ssrc = sender_ssrc;
        self
    }

    /// Size bound of the missing set before recycling.
    pub fn with_max_nack_packets(mut self, max_nack_packets: usize) -> Self {
        self.max_nack_packets = max_nack_packets;
        self
    }

    /// Age bound, in sequence numbers behind the newest packet.
    pub fn with_max_packet_age(mut self, max_packet_age: u16) -> Self {
        self.max_packet_age = max_packet_age as i64;
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks.clamp(1, MAX_NACK_BLOCKS);
        self
    }

    pub fn build(self, media_ssrc: u32) -> SetNackGenerator {
        SetNackGenerator {
            sender_ssrc: self.sender_ssrc,
            media_ssrc,
            max_nack_packets: self.max_nack_packets,
            max_packet_age: self.max_packet_age,
            min_interval: self.min_interval,
            max_blocks: self.max_blocks,
            unwrapper: SequenceUnwrapper::new(),
            missing: BTreeSet::new(),
            keyframes: BTreeSet::new(),
            latest: None,
            last_rtcp_send_time: None,
        }
    }
}

/// Per-SSRC loss detector backed by an ordered missing set.
///
/// Sequence numbers are unwrapped into 64 bits so the sets keep a total order
/// across 16-bit wraparound.
pub struct SetNackGenerator {
    sender_ssrc: u32,
    media_ssrc: u32,
    max_nack_packets: usize,
    max_packet_age: i64,
    min_interval: Duration,
    max_blocks: usize,

    unwrapper: SequenceUnwrapper,
    missing: BTreeSet<i64>,
    keyframes: BTreeSet<i64>,
    latest: Option<i64>,
    last_rtcp_send_time: Option<Instant>,
}

impl SetNackGenerator {
    pub fn new(sender_ssrc: u32, media_ssrc: u32) -> Self {
        SetNackGeneratorBuilder::new()
            .with_sender_ssrc(sender_ssrc)
            .build(media_ssrc)
    }

    pub fn missing_len(&self) -> usize {
        self.missing.len()
    }

    fn rate_allows(&self, now: Instant) -> bool {
        self.last_rtcp_send_time
            .is_none_or(|last| now.saturating_duration_since(last) >= self.min_interval)
    }

    fn over_bounds(&self, latest: i64) -> bool {
        if self.missing.len() > self.max_nack_packets {
            return true;
        }
        self.missing
            .first()
            .is_some_and(|&oldest| oldest < latest - self.max_packet_age)
    }

    /// Drops missing entries older than the oldest useful keyframe.
    ///
    /// Returns false when no keyframe cuts anything off.
    fn recycle_until_keyframe(&mut self) -> bool {
        while let Some(&keyframe) = self.keyframes.first() {
            let newer = self.missing.split_off(&keyframe);
            let dropped = self.missing.len();
            self.missing = newer;
            if dropped > 0 {
                trace!(
                    "ssrc {} dropped {} missing packets before keyframe",
                    self.media_ssrc, dropped
                );
                return true;
            }
            self.keyframes.pop_first();
        }
        false
    }
}

impl NackGenerator for SetNackGenerator {
    fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    fn handle_rtp_packet(
        &mut self,
        now: Instant,
        sequence_number: u16,
        is_keyframe: bool,
    ) -> NackStatus {
        let seq = self.unwrapper.unwrap(sequence_number);
        if is_keyframe {
            self.keyframes.insert(seq);
        }

        let Some(latest) = self.latest else {
            self.latest = Some(seq);
            return NackStatus::default();
        };

        let newest = latest.max(seq);
        self.keyframes = self.keyframes.split_off(&(newest - self.max_packet_age));

        if seq > latest {
            self.missing.extend(latest + 1..seq);
            self.latest = Some(seq);
        } else {
            self.missing.remove(&seq);
        }

        let mut pli_due = false;
        while self.over_bounds(newest) {
            if !self.recycle_until_keyframe() {
                debug!(
                    "ssrc {} lost {} packets with no keyframe to recover from",
                    self.media_ssrc,
                    self.missing.len()
                );
                self.missing.clear();
                pli_due = true;
                break;
            }
        }

        NackStatus {
            nack_due: !self.missing.is_empty() && self.rate_allows(now),
            pli_due,
        }
    }

    fn add_nack_to_report(&mut self, now: Instant, report: &mut BytesMut) -> Result<bool> {
        if self.missing.is_empty() || !self.rate_allows(now) {
            return Ok(false);
        }

        let mut nacks = nack_pairs_from_sequence_numbers(&self.missing());
        nacks.truncate(self.max_blocks);

        let nack = TransportLayerNack {
            sender_ssrc: self.sender_ssrc,
            media_ssrc: self.media_ssrc,
            nacks,
        };
        report.extend_from_slice(&nack.marshal()?);
        self.last_rtcp_send_time = Some(now);

        Ok(true)
    }

    fn missing(&self) -> Vec<u16> {
        self.missing.iter().map(|&seq| seq as u16).collect()
    }
}
