use crate::event::MediaEvent;
use crate::nack::{NackGenerator, NackPolicy, new_nack_generator};
use crate::packet::{DataPacket, MediaKind};
use crate::pipeline::{Direction, Handler, HandlerContext};
use crate::report::{
    DEFAULT_AUDIO_INTERVAL, DEFAULT_VIDEO_INTERVAL, ReceiverReportGenerator,
    ReceiverReportGeneratorBuilder,
};
use crate::stream_info::MediaStream;
use bytes::BytesMut;
use log::{debug, trace};
use rtcp::header::PacketType;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::sender_report::SenderReport;
use shared::error::Result;
use shared::marshal::{Marshal, Unmarshal};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const FEEDBACK_GENERATION_HANDLER_NAME: &str = "rtcp-feedback-generation";

/// SSRCs tracked while no [`MediaStream`] is registered.
pub const MAX_UNRESOLVED_SSRCS: usize = 8;

pub struct FeedbackGenerationHandlerBuilder {
    nacks_enabled: bool,
    nack_policy: NackPolicy,
    sender_ssrc: Option<u32>,
    video_interval: Duration,
    audio_interval: Duration,
}

impl Default for FeedbackGenerationHandlerBuilder {
    fn default() -> Self {
        Self {
            nacks_enabled: true,
            nack_policy: NackPolicy::default(),
            sender_ssrc: None,
            video_interval: DEFAULT_VIDEO_INTERVAL,
            audio_interval: DEFAULT_AUDIO_INTERVAL,
        }
    }
}

impl FeedbackGenerationHandlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nacks_enabled(mut self, nacks_enabled: bool) -> Self {
        self.nacks_enabled = nacks_enabled;
        self
    }

    pub fn with_nack_policy(mut self, nack_policy: NackPolicy) -> Self {
        self.nack_policy = nack_policy;
        self
    }

    /// SSRC used as sender of generated feedback. Random when unset.
    pub fn with_sender_ssrc(mut self, sender_ssrc: u32) -> Self {
        self.sender_ssrc = Some(sender_ssrc);
        self
    }

    pub fn with_video_interval(mut self, interval: Duration) -> Self {
        self.video_interval = interval;
        self
    }

    pub fn with_audio_interval(mut self, interval: Duration) -> Self {
        self.audio_interval = interval;
        self
    }

    pub fn build(self) -> FeedbackGenerationHandler {
        FeedbackGenerationHandler {
            enabled: true,
            nacks_enabled: self.nacks_enabled,
            nack_policy: self.nack_policy,
            sender_ssrc: self.sender_ssrc.unwrap_or_else(rand::random::<u32>),
            video_interval: self.video_interval,
            audio_interval: self.audio_interval,
            stream: None,
            generators: HashMap::new(),
        }
    }
}

struct SsrcFeedback {
    kind: MediaKind,
    report: ReceiverReportGenerator,
    nack: Option<Box<dyn NackGenerator>>,
}

/// Generates receiver reports, NACKs and PLIs for the media arriving on the
/// inbound path and sends them back toward the sender on the outbound path.
///
/// Media packets continue inbound untouched. Sender reports are consumed
/// for round-trip accounting and forwarded as well.
///
/// Once a [`MediaStream`] is registered only its source SSRCs get feedback,
/// and NACKs and PLIs are only sent when the stream negotiated them. Until
/// then at most [`MAX_UNRESOLVED_SSRCS`] SSRCs are tracked.
pub struct FeedbackGenerationHandler {
    enabled: bool,
    nacks_enabled: bool,
    nack_policy: NackPolicy,
    sender_ssrc: u32,
    video_interval: Duration,
    audio_interval: Duration,

    stream: Option<Rc<MediaStream>>,
    generators: HashMap<u32, SsrcFeedback>,
}

impl Default for FeedbackGenerationHandler {
    fn default() -> Self {
        FeedbackGenerationHandlerBuilder::new().build()
    }
}

impl FeedbackGenerationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    fn media_kind(&self, packet: &DataPacket, ssrc: u32) -> MediaKind {
        match (packet.kind, &self.stream) {
            (MediaKind::Other, Some(stream)) => stream.kind_of(ssrc),
            (kind, _) => kind,
        }
    }

    fn create_feedback(&self, ssrc: u32, kind: MediaKind) -> SsrcFeedback {
        let mut builder = ReceiverReportGeneratorBuilder::new()
            .with_sender_ssrc(self.sender_ssrc)
            .with_interval(match kind {
                MediaKind::Audio => self.audio_interval,
                _ => self.video_interval,
            });
        if let Some(stream) = &self.stream {
            builder = builder.with_clock_rate(stream.clock_rate(kind));
        }

        let negotiated = self.stream.as_ref().is_none_or(|stream| stream.supports_nack());
        let nack = (self.nacks_enabled && negotiated && kind == MediaKind::Video)
            .then(|| new_nack_generator(self.nack_policy, self.sender_ssrc, ssrc));

        debug!("ssrc {} observed, kind {:?}, nack {}", ssrc, kind, nack.is_some());
        SsrcFeedback {
            kind,
            report: builder.build(ssrc, kind),
            nack,
        }
    }

    fn accepts(&self, ssrc: u32) -> bool {
        match &self.stream {
            Some(stream) => stream.is_source_ssrc(ssrc),
            None => self.generators.len() < MAX_UNRESOLVED_SSRCS,
        }
    }

    fn pli_negotiated(&self) -> bool {
        self.stream.as_ref().is_none_or(|stream| stream.supports_pli())
    }

    fn handle_rtcp(&mut self, now: Instant, packet: &DataPacket) {
        let mut blocks = rtcp::packet::blocks(&packet.data);
        for (header, block) in blocks.by_ref() {
            if header.packet_type != PacketType::SenderReport {
                continue;
            }
            let mut reader = block;
            match SenderReport::unmarshal(&mut reader) {
                Ok(sr) => {
                    if let Some(feedback) = self.generators.get_mut(&sr.ssrc) {
                        feedback.report.handle_sender_report(now, &sr);
                    }
                }
                Err(err) => debug!("malformed sender report: {}", err),
            }
        }
        if blocks.is_truncated() {
            debug!("compound RTCP truncated, ignored the remainder");
        }
    }

    fn handle_rtp(&mut self, ctx: &mut HandlerContext<'_>, packet: &DataPacket) -> Result<()> {
        let now = packet.now;
        let ssrc = packet.ssrc()?;
        let sequence_number = packet.sequence_number()?;
        let timestamp = packet.timestamp()?;

        if !self.generators.contains_key(&ssrc) {
            if !self.accepts(ssrc) {
                trace!("ssrc {} not tracked, no feedback", ssrc);
                return Ok(());
            }
            let kind = self.media_kind(packet, ssrc);
            let feedback = self.create_feedback(ssrc, kind);
            self.generators.insert(ssrc, feedback);
        }
        let pli_negotiated = self.pli_negotiated();
        let Some(feedback) = self.generators.get_mut(&ssrc) else {
            return Ok(());
        };

        let status = feedback
            .nack
            .as_mut()
            .map(|nack| nack.handle_rtp_packet(now, sequence_number, packet.is_keyframe))
            .unwrap_or_default();
        let report_due = feedback
            .report
            .handle_rtp_packet(now, sequence_number, timestamp);

        if report_due || status.nack_due {
            send_report(ctx, now, ssrc, feedback)?;
        }
        if status.pli_due && pli_negotiated {
            send_pli(ctx, now, self.sender_ssrc, ssrc, feedback.kind)?;
        }
        Ok(())
    }
}

fn send_report(
    ctx: &mut HandlerContext<'_>,
    now: Instant,
    ssrc: u32,
    feedback: &mut SsrcFeedback,
) -> Result<()> {
    let rr = feedback.report.generate_report(now);
    let mut compound = BytesMut::from(&rr.marshal()?[..]);
    if let Some(nack) = feedback.nack.as_mut() {
        nack.add_nack_to_report(now, &mut compound)?;
    }
    trace!("ssrc {} feedback of {} bytes", ssrc, compound.len());

    ctx.fire_write(DataPacket::rtcp(now, feedback.kind, compound));
    ctx.fire_event(MediaEvent::FractionLost {
        ssrc,
        kind: feedback.kind,
        fraction_lost: feedback.report.fraction_lost(),
    });
    Ok(())
}

fn send_pli(
    ctx: &mut HandlerContext<'_>,
    now: Instant,
    sender_ssrc: u32,
    media_ssrc: u32,
    kind: MediaKind,
) -> Result<()> {
    let pli = PictureLossIndication {
        sender_ssrc,
        media_ssrc,
    };
    debug!("ssrc {} unrecoverable loss, requesting keyframe", media_ssrc);
    ctx.fire_write(DataPacket::rtcp(now, kind, BytesMut::from(&pli.marshal()?[..])));
    Ok(())
}

impl Handler for FeedbackGenerationHandler {
    fn name(&self) -> &'static str {
        FEEDBACK_GENERATION_HANDLER_NAME
    }

    fn direction(&self) -> Direction {
        Direction::In
    }

    fn notify_update(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.stream = ctx.get_service::<MediaStream>();
        if let Some(stream) = &self.stream {
            self.generators.retain(|ssrc, _| stream.is_source_ssrc(*ssrc));
        }
        Ok(())
    }

    fn detach(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.generators.clear();
        Ok(())
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if !self.enabled {
            ctx.fire_read(packet);
            return Ok(());
        }

        if packet.is_rtcp() {
            self.handle_rtcp(packet.now, &packet);
        } else if let Err(err) = self.handle_rtp(ctx, &packet) {
            debug!("drop malformed media packet: {}", err);
            return Ok(());
        }

        ctx.fire_read(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_util::{media_packet, pipeline_with};
    use rtcp::packet::unmarshal;
    use rtcp::receiver_report::ReceiverReport;
    use crate::pipeline::Pipeline;
    use crate::stream_info::RTCPFeedback;
    use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
    use sansio::Protocol;

    const SSRC: u32 = 0xAABB;

    fn handler() -> Box<dyn Handler> {
        Box::new(
            FeedbackGenerationHandlerBuilder::new()
                .with_sender_ssrc(1)
                .build(),
        )
    }

    fn feedback(packet: DataPacket) -> Vec<Box<dyn rtcp::packet::Packet>> {
        unmarshal(&mut packet.data.freeze()).unwrap()
    }

    fn register_stream(pipeline: &mut Pipeline, rtcp_feedback: Vec<RTCPFeedback>) {
        pipeline
            .register_service(Rc::new(MediaStream {
                video_source_ssrcs: vec![SSRC],
                rtcp_feedback,
                ..MediaStream::new("publisher")
            }))
            .unwrap();
        pipeline.notify_update();
    }

    fn negotiated() -> Vec<RTCPFeedback> {
        vec![RTCPFeedback::new("nack", ""), RTCPFeedback::new("nack", "pli")]
    }

    fn read_with_gap(pipeline: &mut Pipeline, now: Instant, ssrc: u32) {
        for seq in [1u16, 2, 4] {
            pipeline
                .handle_read(media_packet(now, MediaKind::Video, ssrc, seq))
                .unwrap();
        }
    }

    #[test]
    fn test_media_passes_through() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        for seq in 1..=5u16 {
            pipeline
                .handle_read(media_packet(now, MediaKind::Video, SSRC, seq))
                .unwrap();
            assert_eq!(pipeline.poll_read().unwrap().sequence_number().unwrap(), seq);
        }
        assert!(pipeline.poll_write().is_none());
    }

    #[test]
    fn test_gap_emits_report_with_nack() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        for seq in [1u16, 2, 4] {
            pipeline
                .handle_read(media_packet(now, MediaKind::Video, SSRC, seq))
                .unwrap();
        }

        let packets = feedback(pipeline.poll_write().unwrap());
        assert_eq!(packets.len(), 2);
        let rr = packets[0]
            .as_any()
            .downcast_ref::<ReceiverReport>()
            .expect("Expected ReceiverReport");
        assert_eq!(rr.ssrc, 1);
        assert_eq!(rr.reports[0].ssrc, SSRC);
        let nack = packets[1]
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .expect("Expected TransportLayerNack");
        assert_eq!(nack.media_ssrc, SSRC);
        assert_eq!(nack.nacks[0].packet_id, 3);
        assert_eq!(nack.nacks[0].lost_packets, 0);

        assert!(matches!(
            pipeline.poll_event(),
            Some(MediaEvent::FractionLost { ssrc: SSRC, kind: MediaKind::Video, .. })
        ));
    }

    #[test]
    fn test_audio_gets_reports_without_nack() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        pipeline
            .handle_read(media_packet(now, MediaKind::Audio, SSRC, 1))
            .unwrap();
        pipeline
            .handle_read(media_packet(now, MediaKind::Audio, SSRC, 5))
            .unwrap();
        assert!(pipeline.poll_write().is_none());

        let later = now + DEFAULT_AUDIO_INTERVAL;
        pipeline
            .handle_read(media_packet(later, MediaKind::Audio, SSRC, 6))
            .unwrap();
        let packets = feedback(pipeline.poll_write().unwrap());
        assert_eq!(packets.len(), 1);
        let rr = packets[0].as_any().downcast_ref::<ReceiverReport>().unwrap();
        assert_eq!(rr.reports[0].total_lost, 3);
    }

    #[test]
    fn test_unrecoverable_loss_requests_pli() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        pipeline
            .handle_read(media_packet(now, MediaKind::Video, SSRC, 1))
            .unwrap();
        pipeline
            .handle_read(media_packet(now, MediaKind::Video, SSRC, 500))
            .unwrap();

        let mut plis = 0;
        while let Some(packet) = pipeline.poll_write() {
            for rtcp in feedback(packet) {
                if let Some(pli) = rtcp.as_any().downcast_ref::<PictureLossIndication>() {
                    assert_eq!(pli.media_ssrc, SSRC);
                    plis += 1;
                }
            }
        }
        assert_eq!(plis, 1);
    }

    #[test]
    fn test_sender_report_is_forwarded_and_used() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        pipeline
            .handle_read(media_packet(now, MediaKind::Video, SSRC, 1))
            .unwrap();
        pipeline.poll_read();

        let sr = SenderReport {
            ssrc: SSRC,
            ntp_time: 0x0000_1234_5678_0000,
            ..Default::default()
        };
        let raw = BytesMut::from(&sr.marshal().unwrap()[..]);
        pipeline
            .handle_read(DataPacket::rtcp(now, MediaKind::Video, raw))
            .unwrap();
        assert!(pipeline.poll_read().unwrap().is_rtcp());

        let later = now + DEFAULT_VIDEO_INTERVAL;
        pipeline
            .handle_read(media_packet(later, MediaKind::Video, SSRC, 2))
            .unwrap();
        let packets = feedback(pipeline.poll_write().unwrap());
        let rr = packets[0].as_any().downcast_ref::<ReceiverReport>().unwrap();
        assert_eq!(rr.reports[0].last_sender_report, 0x1234_5678);
        assert_eq!(rr.reports[0].delay, 65536);
    }

    #[test]
    fn test_malformed_media_is_dropped() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        let truncated =
            DataPacket::new(now, MediaKind::Video, BytesMut::from(&[0x80u8, 0x60][..]));
        pipeline.handle_read(truncated).unwrap();
        assert!(pipeline.poll_read().is_none());
    }

    #[test]
    fn test_disabled_handler_passes_through() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        pipeline.disable(FEEDBACK_GENERATION_HANDLER_NAME);
        for seq in [1u16, 5] {
            pipeline
                .handle_read(media_packet(now, MediaKind::Video, SSRC, seq))
                .unwrap();
        }
        assert!(pipeline.poll_write().is_none());
        assert_eq!(pipeline.poll_read().unwrap().sequence_number().unwrap(), 1);
    }

    #[test]
    fn test_foreign_ssrcs_get_no_feedback() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        register_stream(&mut pipeline, negotiated());

        for foreign in 0..64u32 {
            read_with_gap(&mut pipeline, now, 0x1000 + foreign);
        }
        assert!(pipeline.poll_write().is_none());
        assert_eq!(pipeline.poll_read().unwrap().ssrc().unwrap(), 0x1000);

        read_with_gap(&mut pipeline, now, SSRC);
        let packets = feedback(pipeline.poll_write().unwrap());
        assert_eq!(packets.len(), 2);
    }

    #[test]
    fn test_unresolved_stream_tracks_bounded_ssrcs() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        for ssrc in 0..MAX_UNRESOLVED_SSRCS as u32 + 4 {
            read_with_gap(&mut pipeline, now, ssrc);
        }

        let mut reported = vec![];
        while let Some(packet) = pipeline.poll_write() {
            let packets = feedback(packet);
            let rr = packets[0].as_any().downcast_ref::<ReceiverReport>().unwrap();
            reported.push(rr.reports[0].ssrc);
        }
        let expected: Vec<u32> = (0..MAX_UNRESOLVED_SSRCS as u32).collect();
        assert_eq!(reported, expected);
    }

    #[test]
    fn test_stream_without_nack_feedback_gets_reports_only() {
        let now = Instant::now();
        let mut pipeline = pipeline_with(handler());
        register_stream(&mut pipeline, vec![RTCPFeedback::new("goog-remb", "")]);

        read_with_gap(&mut pipeline, now, SSRC);
        pipeline
            .handle_read(media_packet(now, MediaKind::Video, SSRC, 500))
            .unwrap();
        assert!(pipeline.poll_write().is_none());

        let later = now + DEFAULT_VIDEO_INTERVAL;
        pipeline
            .handle_read(media_packet(later, MediaKind::Video, SSRC, 501))
            .unwrap();
        let packets = feedback(pipeline.poll_write().unwrap());
        assert_eq!(packets.len(), 1);
        assert!(packets[0].as_any().downcast_ref::<ReceiverReport>().is_some());
        assert!(pipeline.poll_write().is_none());
    }
}
