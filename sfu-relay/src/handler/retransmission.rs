use crate::nack::SendBuffer;
use crate::packet::DataPacket;
use crate::pipeline::{Handler, HandlerContext};
use crate::services::Stats;
use crate::stream_info::MediaStream;
use bytes::BytesMut;
use log::{debug, trace};
use rtcp::header::{FORMAT_TLN, PacketType};
use rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use shared::error::Result;
use shared::marshal::{Marshal, Unmarshal};
use std::rc::Rc;

pub const RTP_RETRANSMISSION_HANDLER_NAME: &str = "rtp-retransmission";
pub const DEFAULT_RETRANSMISSION_BUFFER_SIZE: u16 = 256;

pub struct RtpRetransmissionHandlerBuilder {
    buffer_size: u16,
}

impl Default for RtpRetransmissionHandlerBuilder {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_RETRANSMISSION_BUFFER_SIZE,
        }
    }
}

impl RtpRetransmissionHandlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets kept per sink SSRC, rounded up to a power of two.
    pub fn with_buffer_size(mut self, buffer_size: u16) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn build(self) -> RtpRetransmissionHandler {
        RtpRetransmissionHandler {
            enabled: true,
            buffer_size: self.buffer_size,
            stats: None,
            video: None,
            audio: None,
        }
    }
}

struct SinkBuffer {
    ssrc: u32,
    packets: SendBuffer,
}

/// Answers receiver NACKs from the packets this pipeline already sent.
///
/// Outbound RTP on the stream's sink SSRCs is kept in one bounded buffer
/// per kind. Requested packets found there are written again toward the
/// network; only the sequence numbers that missed travel on inbound, so
/// upstream handlers and the publisher never see repaired losses.
pub struct RtpRetransmissionHandler {
    enabled: bool,
    buffer_size: u16,
    stats: Option<Rc<Stats>>,
    video: Option<SinkBuffer>,
    audio: Option<SinkBuffer>,
}

impl Default for RtpRetransmissionHandler {
    fn default() -> Self {
        RtpRetransmissionHandlerBuilder::new().build()
    }
}

impl RtpRetransmissionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn rebind(&self, current: Option<SinkBuffer>, ssrc: Option<u32>) -> Option<SinkBuffer> {
        let ssrc = ssrc?;
        match current {
            Some(buffer) if buffer.ssrc == ssrc => Some(buffer),
            _ => {
                let packets = SendBuffer::new(self.buffer_size);
                debug!("ssrc {} keeps the last {} sent packets", ssrc, packets.capacity());
                Some(SinkBuffer { ssrc, packets })
            }
        }
    }

    fn buffer_mut(&mut self, ssrc: u32) -> Option<&mut SendBuffer> {
        [self.video.as_mut(), self.audio.as_mut()]
            .into_iter()
            .flatten()
            .find(|buffer| buffer.ssrc == ssrc)
            .map(|buffer| &mut buffer.packets)
    }

    fn buffer(&self, ssrc: u32) -> Option<&SendBuffer> {
        [self.video.as_ref(), self.audio.as_ref()]
            .into_iter()
            .flatten()
            .find(|buffer| buffer.ssrc == ssrc)
            .map(|buffer| &buffer.packets)
    }

    /// Resends what the buffer holds and returns the sequence numbers it lacked.
    fn repair(
        &self,
        ctx: &mut HandlerContext<'_>,
        packet: &DataPacket,
        nack: &TransportLayerNack,
    ) -> Option<Vec<u16>> {
        let buffer = self.buffer(nack.media_ssrc)?;
        let mut missed = vec![];
        for sequence_number in nack.nacks.iter().flat_map(|pair| pair.packet_list()) {
            match buffer.get(sequence_number) {
                Some(sent) => {
                    let mut resent = sent.clone();
                    resent.now = packet.now;
                    if let Some(stats) = &self.stats {
                        stats.record_retransmission(nack.media_ssrc, resent.len());
                    }
                    ctx.fire_write(resent);
                }
                None => {
                    debug!(
                        "ssrc {} seq {} missed in send buffer",
                        nack.media_ssrc, sequence_number
                    );
                    missed.push(sequence_number);
                }
            }
        }
        Some(missed)
    }
}

impl Handler for RtpRetransmissionHandler {
    fn name(&self) -> &'static str {
        RTP_RETRANSMISSION_HANDLER_NAME
    }

    fn notify_update(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.stats = ctx.get_service::<Stats>();
        let stream = ctx.get_service::<MediaStream>();
        let video_sink = stream.as_ref().and_then(|stream| stream.video_sink_ssrc);
        let audio_sink = stream.as_ref().and_then(|stream| stream.audio_sink_ssrc);
        let (video, audio) = (self.video.take(), self.audio.take());
        self.video = self.rebind(video, video_sink);
        self.audio = self.rebind(audio, audio_sink);
        Ok(())
    }

    fn detach(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.video = None;
        self.audio = None;
        Ok(())
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if !self.enabled || !packet.is_rtcp() {
            ctx.fire_read(packet);
            return Ok(());
        }

        let mut contains_nack = false;
        let mut kept = BytesMut::new();
        for (header, block) in rtcp::packet::blocks(&packet.data) {
            if header.packet_type != PacketType::TransportSpecificFeedback
                || header.count != FORMAT_TLN
            {
                kept.extend_from_slice(block);
                continue;
            }
            let mut reader = block;
            let nack = match TransportLayerNack::unmarshal(&mut reader) {
                Ok(nack) => nack,
                Err(err) => {
                    debug!("malformed NACK forwarded as is: {}", err);
                    kept.extend_from_slice(block);
                    continue;
                }
            };
            contains_nack = true;
            match self.repair(ctx, &packet, &nack) {
                Some(missed) if missed.is_empty() => {
                    trace!("ssrc {} NACK fully repaired", nack.media_ssrc);
                }
                Some(missed) => {
                    let remaining = TransportLayerNack {
                        nacks: nack_pairs_from_sequence_numbers(&missed),
                        ..nack
                    };
                    kept.extend_from_slice(&remaining.marshal()?);
                }
                None => kept.extend_from_slice(block),
            }
        }

        if !contains_nack {
            ctx.fire_read(packet);
        } else if !kept.is_empty() {
            ctx.fire_read(DataPacket::rtcp(packet.now, packet.kind, kept));
        }
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if !packet.is_rtcp()
            && let (Ok(ssrc), Ok(sequence_number)) = (packet.ssrc(), packet.sequence_number())
            && let Some(buffer) = self.buffer_mut(ssrc)
        {
            buffer.insert(sequence_number, packet.clone());
        }
        ctx.fire_write(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_util::{media_packet, pipeline_with};
    use crate::packet::MediaKind;
    use crate::pipeline::Pipeline;
    use rtcp::packet::unmarshal;
    use rtcp::receiver_report::ReceiverReport;
    use sansio::Protocol;
    use std::time::Instant;

    const SINK: u32 = 0x5151;
    const AUDIO_SINK: u32 = 0x5252;
    const RECEIVER: u32 = 0x7777;

    fn subscriber(buffer_size: u16) -> (Pipeline, Rc<Stats>) {
        let handler = RtpRetransmissionHandlerBuilder::new()
            .with_buffer_size(buffer_size)
            .build();
        let mut pipeline = pipeline_with(Box::new(handler));
        let stats = Rc::new(Stats::new());
        pipeline
            .register_service(Rc::new(MediaStream {
                video_sink_ssrc: Some(SINK),
                audio_sink_ssrc: Some(AUDIO_SINK),
                ..MediaStream::new("subscriber")
            }))
            .unwrap();
        pipeline.register_service(Rc::clone(&stats)).unwrap();
        pipeline.notify_update();
        (pipeline, stats)
    }

    fn send(pipeline: &mut Pipeline, now: Instant, ssrc: u32, seqs: impl Iterator<Item = u16>) {
        for seq in seqs {
            pipeline
                .handle_write(media_packet(now, MediaKind::Video, ssrc, seq))
                .unwrap();
        }
        while pipeline.poll_write().is_some() {}
    }

    fn nack(now: Instant, media_ssrc: u32, seqs: &[u16]) -> DataPacket {
        let nack = TransportLayerNack {
            sender_ssrc: RECEIVER,
            media_ssrc,
            nacks: nack_pairs_from_sequence_numbers(seqs),
        };
        DataPacket::rtcp(now, MediaKind::Video, BytesMut::from(&nack.marshal().unwrap()[..]))
    }

    fn resent(pipeline: &mut Pipeline) -> Vec<u16> {
        std::iter::from_fn(|| pipeline.poll_write())
            .map(|packet| packet.sequence_number().unwrap())
            .collect()
    }

    fn forwarded_nack(pipeline: &mut Pipeline) -> Option<Vec<u16>> {
        let packet = pipeline.poll_read()?;
        let packets = unmarshal(&mut packet.data.freeze()).unwrap();
        let nack = packets
            .iter()
            .find_map(|p| p.as_any().downcast_ref::<TransportLayerNack>())
            .expect("Expected TransportLayerNack");
        Some(nack.nacks.iter().flat_map(|pair| pair.packet_list()).collect())
    }

    #[test]
    fn test_buffered_packets_are_resent() {
        let now = Instant::now();
        let (mut pipeline, stats) = subscriber(64);
        send(&mut pipeline, now, SINK, 100..110);

        let later = now + std::time::Duration::from_millis(40);
        pipeline.handle_read(nack(later, SINK, &[103, 105])).unwrap();
        let out: Vec<DataPacket> = std::iter::from_fn(|| pipeline.poll_write()).collect();
        let seqs: Vec<u16> = out.iter().map(|p| p.sequence_number().unwrap()).collect();
        assert_eq!(seqs, vec![103, 105]);
        assert!(out.iter().all(|p| p.now == later && p.ssrc().unwrap() == SINK));

        // fully repaired, nothing goes upstream
        assert!(pipeline.poll_read().is_none());
        assert_eq!(stats.get(SINK).retransmitted_packets, 2);
    }

    #[test]
    fn test_misses_are_forwarded_upstream() {
        let now = Instant::now();
        let (mut pipeline, _) = subscriber(64);
        send(&mut pipeline, now, SINK, [1u16, 2, 4].into_iter());

        pipeline.handle_read(nack(now, SINK, &[2, 3])).unwrap();
        assert_eq!(resent(&mut pipeline), vec![2]);
        assert_eq!(forwarded_nack(&mut pipeline), Some(vec![3]));
    }

    #[test]
    fn test_evicted_packets_are_not_resent() {
        let now = Instant::now();
        let (mut pipeline, _) = subscriber(8);
        send(&mut pipeline, now, SINK, 0..20);

        pipeline.handle_read(nack(now, SINK, &[5, 12, 19])).unwrap();
        assert_eq!(resent(&mut pipeline), vec![12, 19]);
        assert_eq!(forwarded_nack(&mut pipeline), Some(vec![5]));
    }

    #[test]
    fn test_unknown_ssrc_and_other_feedback_pass_through() {
        let now = Instant::now();
        let (mut pipeline, _) = subscriber(64);
        send(&mut pipeline, now, 0x9999, 1..5);

        // not a sink of this stream, so never buffered
        pipeline.handle_read(nack(now, 0x9999, &[2])).unwrap();
        assert!(resent(&mut pipeline).is_empty());
        assert_eq!(forwarded_nack(&mut pipeline), Some(vec![2]));

        let rr = ReceiverReport {
            ssrc: RECEIVER,
            ..Default::default()
        };
        let raw = BytesMut::from(&rr.marshal().unwrap()[..]);
        pipeline
            .handle_read(DataPacket::rtcp(now, MediaKind::Video, raw.clone()))
            .unwrap();
        assert_eq!(pipeline.poll_read().unwrap().data, raw);
    }

    #[test]
    fn test_disabled_handler_forwards_nacks() {
        let now = Instant::now();
        let (mut pipeline, _) = subscriber(64);
        send(&mut pipeline, now, SINK, 1..5);
        pipeline.disable(RTP_RETRANSMISSION_HANDLER_NAME);

        pipeline.handle_read(nack(now, SINK, &[2])).unwrap();
        assert!(resent(&mut pipeline).is_empty());
        assert_eq!(forwarded_nack(&mut pipeline), Some(vec![2]));
    }
}
