//! Loss detection and generic NACK (RFC 4585) generation.
//!
//! Two policies are provided behind the [`NackGenerator`] trait:
//!
//! - [`SetNackGenerator`]: the default. Tracks missing sequence numbers in an
//!   ordered set bounded by size and age, and anchors recovery on keyframes.
//!   When the set overflows with no keyframe to cut at, it asks for a PLI.
//! - [`ListNackGenerator`]: a fixed list of outstanding losses, each requested
//!   a limited number of times. It never asks for a PLI.
//!
//! Both append their NACK blocks to a caller-supplied compound report buffer,
//! normally right after a receiver report.
//!
//! The answering side keeps sent packets in a bounded send buffer so NACKs
//! from a receiver can be repaired locally.

mod generator;
mod list_generator;
mod send_buffer;

pub use generator::{SetNackGenerator, SetNackGeneratorBuilder};
pub use list_generator::{ListNackGenerator, ListNackGeneratorBuilder};
pub use send_buffer::MAX_SEND_BUFFER_SIZE;
pub(crate) use send_buffer::SendBuffer;

use bytes::BytesMut;
use serde::Deserialize;
use shared::error::Result;
use std::time::Instant;

/// RTCP compound-packet limit on NACK blocks per emission.
pub const MAX_NACK_BLOCKS: usize = 10;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NackPolicy {
    #[default]
    Set,
    List,
}

/// What a generator wants after observing a packet.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct NackStatus {
    /// Losses are outstanding and the rate limit allows a NACK now.
    pub nack_due: bool,
    /// Losses could not be bounded; a full intra refresh is needed.
    pub pli_due: bool,
}

pub trait NackGenerator {
    fn media_ssrc(&self) -> u32;

    /// Feeds one received media packet.
    fn handle_rtp_packet(
        &mut self,
        now: Instant,
        sequence_number: u16,
        is_keyframe: bool,
    ) -> NackStatus;

    /// Appends a NACK packet to `report` if one is due.
    ///
    /// Returns `Ok(false)` when nothing is missing or the rate limit applies.
    fn add_nack_to_report(&mut self, now: Instant, report: &mut BytesMut) -> Result<bool>;

    /// Currently outstanding sequence numbers, oldest first.
    fn missing(&self) -> Vec<u16>;
}

/// Builds the generator selected by `policy` with that policy's defaults.
pub fn new_nack_generator(
    policy: NackPolicy,
    sender_ssrc: u32,
    media_ssrc: u32,
) -> Box<dyn NackGenerator> {
    match policy {
        NackPolicy::Set => Box::new(
            SetNackGeneratorBuilder::new()
                .with_sender_ssrc(sender_ssrc)
                .build(media_ssrc),
        ),
        NackPolicy::List => Box::new(
            ListNackGeneratorBuilder::new()
                .with_sender_ssrc(sender_ssrc)
                .build(media_ssrc),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_nack_generator_policies() {
        let now = Instant::now();
        for policy in [NackPolicy::Set, NackPolicy::List] {
            let mut generator = new_nack_generator(policy, 1, 2);
            assert_eq!(generator.media_ssrc(), 2);
            generator.handle_rtp_packet(now, 10, false);
            let status = generator.handle_rtp_packet(now, 12, false);
            assert!(status.nack_due, "{policy:?}");
            assert!(!status.pli_due);
            assert_eq!(generator.missing(), vec![11]);
        }
    }

    #[test]
    fn test_nack_policy_deserialize() {
        let policy: NackPolicy = serde_json::from_str("\"list\"").unwrap();
        assert_eq!(policy, NackPolicy::List);
        assert_eq!(NackPolicy::default(), NackPolicy::Set);
    }
}
