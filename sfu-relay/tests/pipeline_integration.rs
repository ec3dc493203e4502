//! Integration tests driving a [`Pipeline`] through `sansio::Protocol`.
//!
//! These tests verify that:
//! - Handlers see reads head to tail and writes tail to head
//! - A publisher pipeline answers loss with receiver reports and NACKs
//! - Repaired losses are not requested again
//! - Keyframe requests are paced and escalated

use bytes::{Bytes, BytesMut};
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use sansio::Protocol;
use sfu_relay::{
    DataPacket, Handler, HandlerContext, HandlerRegistry, MediaEvent, MediaKind, MediaStream,
    Pipeline, PipelineConfig, RTCPFeedback, Stats,
};
use shared::error::Result;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

// =============================================================================
// Helper Functions
// =============================================================================

const SOURCE: u32 = 0xbc5e9a40;
const SENDER: u32 = 0x902f9e2e;

fn rtp(now: Instant, seq: u16) -> DataPacket {
    let packet = rtp::Packet {
        header: rtp::Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: seq as u32 * 3000,
            ssrc: SOURCE,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0x42; 100]),
        padding_size: 0,
    };
    DataPacket::from_rtp(now, MediaKind::Video, &packet).unwrap()
}

fn publisher(handlers: &[&str]) -> (Pipeline, Rc<Stats>) {
    let registry = HandlerRegistry::with_defaults();
    let mut config = PipelineConfig {
        handlers: handlers.iter().map(|name| name.to_string()).collect(),
        ..Default::default()
    };
    config.handler.sender_ssrc = Some(SENDER);
    let mut pipeline = registry.build_pipeline(&config).unwrap();

    let stats = Rc::new(Stats::new());
    pipeline
        .register_service(Rc::new(MediaStream {
            video_source_ssrcs: vec![SOURCE],
            rtcp_feedback: vec![RTCPFeedback::new("nack", ""), RTCPFeedback::new("nack", "pli")],
            ..MediaStream::new("publisher")
        }))
        .unwrap();
    pipeline.register_service(Rc::clone(&stats)).unwrap();
    pipeline.notify_update();
    (pipeline, stats)
}

fn feedback(pipeline: &mut Pipeline) -> Vec<Vec<Box<dyn rtcp::packet::Packet>>> {
    let mut compounds = vec![];
    while let Some(packet) = pipeline.poll_write() {
        compounds.push(rtcp::packet::unmarshal(&mut packet.data.freeze()).unwrap());
    }
    compounds
}

fn count<T: 'static>(compounds: &[Vec<Box<dyn rtcp::packet::Packet>>]) -> usize {
    compounds
        .iter()
        .flatten()
        .filter(|packet| packet.as_any().downcast_ref::<T>().is_some())
        .count()
}

/// Appends its name to a shared log for every packet it sees.
struct Tracer {
    name: &'static str,
    log: Rc<RefCell<Vec<String>>>,
}

impl Handler for Tracer {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        self.log.borrow_mut().push(format!("{}:read", self.name));
        ctx.fire_read(packet);
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        self.log.borrow_mut().push(format!("{}:write", self.name));
        ctx.fire_write(packet);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_traversal_order() {
    let log = Rc::new(RefCell::new(vec![]));
    let registry = HandlerRegistry::new()
        .with("a", {
            let log = Rc::clone(&log);
            move |_| Box::new(Tracer { name: "a", log: Rc::clone(&log) })
        })
        .with("b", {
            let log = Rc::clone(&log);
            move |_| Box::new(Tracer { name: "b", log: Rc::clone(&log) })
        });
    let mut pipeline = registry
        .build_pipeline(&PipelineConfig {
            handlers: vec!["a".into(), "b".into()],
            ..Default::default()
        })
        .unwrap();

    let now = Instant::now();
    pipeline.handle_read(rtp(now, 1)).unwrap();
    pipeline.handle_write(rtp(now, 2)).unwrap();

    assert_eq!(pipeline.poll_read().unwrap().sequence_number().unwrap(), 1);
    assert_eq!(pipeline.poll_write().unwrap().sequence_number().unwrap(), 2);
    assert_eq!(
        *log.borrow(),
        vec!["a:read", "b:read", "b:write", "a:write"]
    );

    pipeline.close().unwrap();
    assert!(pipeline.handle_read(rtp(now, 3)).is_err());
}

#[test]
fn test_single_loss_is_nacked_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let now = Instant::now();
    let (mut pipeline, stats) = publisher(&["stats", "pli-pacer", "rtcp-feedback-generation"]);

    for seq in 1..=10u16 {
        pipeline.handle_read(rtp(now, seq)).unwrap();
    }
    assert!(feedback(&mut pipeline).is_empty());

    pipeline.handle_read(rtp(now, 12)).unwrap();
    let compounds = feedback(&mut pipeline);
    assert_eq!(compounds.len(), 1);
    let rr = compounds[0][0]
        .as_any()
        .downcast_ref::<ReceiverReport>()
        .expect("Expected ReceiverReport");
    assert_eq!(rr.ssrc, SENDER);
    assert_eq!(rr.reports[0].ssrc, SOURCE);
    assert_eq!(rr.reports[0].last_sequence_number, 12);
    let nack = compounds[0][1]
        .as_any()
        .downcast_ref::<TransportLayerNack>()
        .expect("Expected TransportLayerNack");
    assert_eq!(nack.nacks.len(), 1);
    assert_eq!(nack.nacks[0].packet_id, 11);
    assert_eq!(nack.nacks[0].lost_packets, 0);

    // retransmission fills the hole
    pipeline.handle_read(rtp(now + Duration::from_millis(30), 11)).unwrap();
    assert!(feedback(&mut pipeline).is_empty());

    // the next periodic report carries no NACK
    pipeline.handle_read(rtp(now + Duration::from_secs(2), 13)).unwrap();
    let compounds = feedback(&mut pipeline);
    assert_eq!(compounds.len(), 1);
    assert_eq!(compounds[0].len(), 1);
    assert_eq!(count::<TransportLayerNack>(&compounds), 0);

    let delivered = std::iter::from_fn(|| pipeline.poll_read()).count();
    assert_eq!(delivered, 13);
    assert_eq!(stats.get(SOURCE).inbound_packets, 13);

    let mut fraction_events = 0;
    while let Some(event) = pipeline.poll_event() {
        if matches!(event, MediaEvent::FractionLost { ssrc: SOURCE, .. }) {
            fraction_events += 1;
        }
    }
    assert_eq!(fraction_events, 2);
}

#[test]
fn test_unrecoverable_loss_requests_paced_keyframe() {
    let now = Instant::now();
    let (mut pipeline, _) = publisher(&["stats", "pli-pacer", "rtcp-feedback-generation"]);

    pipeline.handle_read(rtp(now, 1)).unwrap();
    pipeline.handle_read(rtp(now, 500)).unwrap();
    pipeline.handle_read(rtp(now, 1000)).unwrap();
    let compounds = feedback(&mut pipeline);
    assert_eq!(count::<PictureLossIndication>(&compounds), 1);

    // resent while no keyframe shows up
    let tick = pipeline.poll_timeout().unwrap();
    assert_eq!(tick, now + Duration::from_millis(200));
    pipeline.handle_timeout(tick).unwrap();
    assert_eq!(count::<PictureLossIndication>(&feedback(&mut pipeline)), 1);

    let mut keyframe = rtp(now + Duration::from_millis(250), 1001);
    keyframe.is_keyframe = true;
    pipeline.handle_read(keyframe).unwrap();
    assert_eq!(pipeline.poll_timeout(), None);
}

#[test]
fn test_missing_keyframe_escalates_to_fir() {
    let now = Instant::now();
    let (mut pipeline, _) = publisher(&["pli-pacer", "rtcp-feedback-generation"]);

    pipeline.handle_read(rtp(now, 1)).unwrap();
    pipeline.handle_read(rtp(now, 500)).unwrap();
    feedback(&mut pipeline);

    let mut firs = 0;
    while let Some(deadline) = pipeline.poll_timeout() {
        pipeline.handle_timeout(deadline).unwrap();
        firs += count::<FullIntraRequest>(&feedback(&mut pipeline));
    }
    assert_eq!(firs, 1);

    let escalated = std::iter::from_fn(|| pipeline.poll_event())
        .any(|event| event == MediaEvent::KeyframeRequestEscalated { ssrc: SOURCE });
    assert!(escalated);
}

#[test]
fn test_disabled_feedback_stays_silent() {
    let now = Instant::now();
    let (mut pipeline, _) = publisher(&["rtcp-feedback-generation"]);
    assert!(pipeline.disable("rtcp-feedback-generation"));

    for seq in [1u16, 5, 9] {
        pipeline.handle_read(rtp(now, seq)).unwrap();
    }
    assert!(feedback(&mut pipeline).is_empty());
    assert_eq!(std::iter::from_fn(|| pipeline.poll_read()).count(), 3);

    let raw = BytesMut::from(&[0x81u8, 0xc9, 0x00, 0x01, 0, 0, 0, 1][..]);
    pipeline
        .handle_read(DataPacket::rtcp(now, MediaKind::Video, raw))
        .unwrap();
    assert!(pipeline.poll_read().is_some());
}
