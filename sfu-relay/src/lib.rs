//! SFU Relay - Sans-IO packet pipeline and loss recovery for a selective forwarding unit.
//!
//! This crate provides the per-stream media core of a relay: an ordered chain
//! of handlers that every RTP/RTCP packet of one stream passes through, plus
//! the loss recovery pieces those handlers are built from. It performs no I/O;
//! the owner feeds packets and time in and polls packets, events and timers
//! out through [`sansio::Protocol`].
//!
//! # Available Handlers
//!
//! | Handler | Name | Description |
//! |---------|------|-------------|
//! | [`FeedbackGenerationHandler`] | `rtcp-feedback-generation` | Receiver reports, NACKs and PLIs for inbound media |
//! | [`LayerFilterHandler`] | `layer-filter` | Forwards selected spatial/temporal layers with contiguous numbering |
//! | [`PaddingGeneratorHandler`] | `padding-generator` | Inserts padding-only packets after frames |
//! | [`PliPacerHandler`] | `pli-pacer` | Keeps one keyframe request in flight, escalating to FIR |
//! | [`RtpRetransmissionHandler`] | `rtp-retransmission` | Answers receiver NACKs from a bounded send buffer |
//! | [`StatsHandler`] | `stats` | Per-SSRC packet and byte counters |
//!
//! # Building Blocks
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SequenceNumberTranslator`] | Maps source to receiver sequence numbers across skips, gaps and wraparound |
//! | [`SetNackGenerator`] / [`ListNackGenerator`] | Loss tracking and generic NACK emission (RFC 4585) |
//! | [`ReceiverReportGenerator`] | RFC 3550 reception statistics and receiver reports |
//! | [`FrameAssembler`] | Bounded reassembly of one frame's payloads (standalone, not used by the handlers) |
//! | [`Worker`] | Single-owner timer queue driving handler timeouts |
//!
//! # Direction
//!
//! The pipeline head faces the network and the tail faces the application:
//! ```text
//! Read:  Network → HandlerA → HandlerB → HandlerC → Application
//! Write: Application → HandlerC → HandlerB → HandlerA → Network
//! ```
//!
//! A handler may turn a read into a write (e.g. answer media with feedback);
//! the new packet starts from that handler's position.
//!
//! # Quick Start
//!
//! ```ignore
//! use sansio::Protocol;
//! use sfu_relay::{HandlerRegistry, MediaStream, PipelineConfig, RTCPFeedback};
//! use std::rc::Rc;
//!
//! let mut pipeline = HandlerRegistry::with_defaults().build_pipeline(&PipelineConfig {
//!     handlers: vec!["stats".into(), "rtcp-feedback-generation".into(), "pli-pacer".into()],
//!     ..Default::default()
//! })?;
//! pipeline.register_service(Rc::new(MediaStream {
//!     video_source_ssrcs: vec![0x1234],
//!     rtcp_feedback: vec![RTCPFeedback::new("nack", ""), RTCPFeedback::new("nack", "pli")],
//!     ..MediaStream::new("publisher")
//! }))?;
//! pipeline.notify_update();
//!
//! pipeline.handle_read(packet)?;
//! while let Some(feedback) = pipeline.poll_write() {
//!     // send toward the publisher
//! }
//! if let Some(deadline) = pipeline.poll_timeout() {
//!     // call pipeline.handle_timeout(deadline) when it passes
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod config;
pub mod event;
pub mod frame;
pub mod handler;
pub mod nack;
pub mod packet;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod services;
pub mod stream_info;
pub mod translator;
pub mod worker;

pub use config::{HandlerConfig, PipelineConfig};
pub use event::MediaEvent;
pub use frame::{Frame, FrameAssembler};
pub use handler::{
    FeedbackGenerationHandler, FeedbackGenerationHandlerBuilder, LayerFilterHandler,
    LayerFilterHandlerBuilder, PaddingGeneratorHandler, PaddingGeneratorHandlerBuilder,
    PliPacerHandler, PliPacerHandlerBuilder, RtpRetransmissionHandler,
    RtpRetransmissionHandlerBuilder, StatsHandler,
};
pub use nack::{
    ListNackGenerator, ListNackGeneratorBuilder, NackGenerator, NackPolicy, NackStatus,
    SetNackGenerator, SetNackGeneratorBuilder,
};
pub use packet::{DataPacket, MediaKind};
pub use pipeline::{Direction, Handler, HandlerContext, HandlerId, Pipeline, ServiceRegistry};
pub use registry::{HandlerFactory, HandlerRegistry};
pub use report::{ReceiverReportGenerator, ReceiverReportGeneratorBuilder};
pub use services::{LayerSelection, Stats, StreamCounters};
pub use stream_info::{MediaStream, RTCPFeedback};
pub use translator::{
    SequenceNumber, SequenceNumberKind, SequenceNumberTranslator,
    SequenceNumberTranslatorBuilder,
};
pub use worker::{TaskHandle, Worker};
