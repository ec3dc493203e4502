//! RTCP packets consumed and produced by the relay's feedback path: sender and
//! receiver reports, generic NACK, PLI and FIR, plus a raw fallback for
//! everything else.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod header;
pub mod packet;
pub mod payload_feedbacks;
pub mod raw_packet;
pub mod receiver_report;
pub mod reception_report;
pub mod sender_report;
pub mod transport_feedbacks;
mod util;
