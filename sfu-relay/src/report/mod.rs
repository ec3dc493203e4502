//! RTCP receiver report generation (RFC 3550 section 6.4.2 and appendix A.3).

mod generator;

pub use generator::{
    DEFAULT_AUDIO_INTERVAL, DEFAULT_VIDEO_INTERVAL, ReceiverReportGenerator,
    ReceiverReportGeneratorBuilder,
};
