//! Reassembly of RTP payloads into whole frames.
//!
//! [`FrameAssembler`] is a standalone utility for owners that need whole
//! frames next to a pipeline, such as recorders or keyframe inspection.
//! No built-in handler uses it; forwarding works packet by packet.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use shared::error::{Error, Result};

pub const DEFAULT_FRAME_CAPACITY: usize = 1 << 20;

/// A complete frame: every payload sharing one RTP timestamp, up to the marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub timestamp: u32,
    pub data: Bytes,
    pub packets: usize,
}

/// Accumulates payloads of one frame into a bounded buffer.
pub struct FrameAssembler {
    buffer: BytesMut,
    capacity: usize,
    timestamp: Option<u32>,
    packets: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FRAME_CAPACITY)
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            capacity,
            timestamp: None,
            packets: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held for the frame in progress.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.timestamp = None;
        self.packets = 0;
    }

    /// Appends one packet's payload, returning the frame once its marker arrives.
    ///
    /// A packet with a new timestamp discards an unfinished frame. A payload
    /// that would exceed capacity fails with `ErrReassemblyOverflow` and
    /// discards the frame in progress.
    pub fn push(&mut self, packet: &rtp::Packet) -> Result<Option<Frame>> {
        let timestamp = packet.header.timestamp;
        if self.timestamp.is_some_and(|current| current != timestamp) {
            debug!(
                "frame {:?} incomplete after {} packets, discarded",
                self.timestamp, self.packets
            );
            self.reset();
        }

        let needed = self.buffer.len() + packet.payload.len();
        if needed > self.capacity {
            self.reset();
            return Err(Error::ErrReassemblyOverflow {
                needed,
                capacity: self.capacity,
            });
        }

        self.timestamp = Some(timestamp);
        self.buffer.put_slice(&packet.payload);
        self.packets += 1;

        if !packet.header.marker {
            return Ok(None);
        }

        let frame = Frame {
            timestamp,
            data: self.buffer.split().freeze(),
            packets: self.packets,
        };
        self.reset();
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(timestamp: u32, payload: &'static [u8], marker: bool) -> rtp::Packet {
        rtp::Packet {
            header: rtp::Header {
                version: 2,
                timestamp,
                marker,
                ..Default::default()
            },
            payload: Bytes::from_static(payload),
            padding_size: 0,
        }
    }

    #[test]
    fn test_frame_completes_on_marker() -> Result<()> {
        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push(&packet(90, b"ab", false))?, None);
        assert_eq!(assembler.push(&packet(90, b"cd", false))?, None);
        let frame = assembler.push(&packet(90, b"e", true))?.unwrap();
        assert_eq!(frame.timestamp, 90);
        assert_eq!(&frame.data[..], b"abcde");
        assert_eq!(frame.packets, 3);
        assert!(assembler.is_empty());
        Ok(())
    }

    #[test]
    fn test_new_timestamp_drops_unfinished_frame() -> Result<()> {
        let mut assembler = FrameAssembler::new();
        assembler.push(&packet(90, b"lost", false))?;
        let frame = assembler.push(&packet(180, b"next", true))?.unwrap();
        assert_eq!(&frame.data[..], b"next");
        assert_eq!(frame.packets, 1);
        Ok(())
    }

    #[test]
    fn test_overflow_clears_and_recovers() -> Result<()> {
        let mut assembler = FrameAssembler::with_capacity(4);
        assembler.push(&packet(90, b"abc", false))?;
        assert_eq!(
            assembler.push(&packet(90, b"de", false)),
            Err(Error::ErrReassemblyOverflow {
                needed: 5,
                capacity: 4
            })
        );
        assert!(assembler.is_empty());

        let frame = assembler.push(&packet(180, b"wxyz", true))?.unwrap();
        assert_eq!(&frame.data[..], b"wxyz");
        Ok(())
    }
}
