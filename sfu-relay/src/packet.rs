//! Packets as they travel through a [`Pipeline`](crate::pipeline::Pipeline).

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, Unmarshal};
use shared::util::is_rtcp;
use std::time::Instant;

const RTP_FIXED_HEADER_LENGTH: usize = 12;

/// Media type carried by a packet, used by handlers to pick policies
/// (e.g. NACK only for video, RTCP intervals, clock rates).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    #[default]
    Other,
}

impl MediaKind {
    /// Default RTP clock rate for the kind, in Hz.
    pub fn default_clock_rate(&self) -> u32 {
        match self {
            MediaKind::Video => 90_000,
            MediaKind::Audio => 48_000,
            MediaKind::Other => 90_000,
        }
    }
}

/// A serialized RTP or RTCP packet plus the metadata handlers need to route it.
///
/// The buffer is owned; forwarding a packet moves it to the next handler.
#[derive(Debug, Clone)]
pub struct DataPacket {
    /// Arrival time, or creation time for synthesized packets.
    pub now: Instant,
    pub kind: MediaKind,
    pub data: BytesMut,
    pub is_keyframe: bool,
    pub is_padding: bool,
    /// Spatial layers able to decode this packet.
    pub compatible_spatial_layers: Vec<u8>,
    /// Temporal layers able to decode this packet.
    pub compatible_temporal_layers: Vec<u8>,
    /// Last packet of a frame within its spatial layer.
    pub ending_of_layer_frame: bool,
}

impl DataPacket {
    pub fn new(now: Instant, kind: MediaKind, data: BytesMut) -> Self {
        Self {
            now,
            kind,
            data,
            is_keyframe: false,
            is_padding: false,
            compatible_spatial_layers: vec![],
            compatible_temporal_layers: vec![],
            ending_of_layer_frame: false,
        }
    }

    /// Wraps a synthesized RTCP datagram.
    pub fn rtcp(now: Instant, kind: MediaKind, data: BytesMut) -> Self {
        Self::new(now, kind, data)
    }

    /// Serializes an RTP packet into a new `DataPacket`.
    pub fn from_rtp(now: Instant, kind: MediaKind, packet: &rtp::Packet) -> Result<Self> {
        let raw = packet.marshal()?;
        Ok(Self::new(now, kind, BytesMut::from(&raw[..])))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_rtcp(&self) -> bool {
        is_rtcp(&self.data)
    }

    pub fn rtp_header(&self) -> Result<rtp::Header> {
        rtp::Header::unmarshal(&mut &self.data[..])
    }

    pub fn rtp_packet(&self) -> Result<rtp::Packet> {
        rtp::Packet::unmarshal(&mut &self.data[..])
    }

    fn fixed_header(&self) -> Result<&[u8]> {
        if self.data.len() < RTP_FIXED_HEADER_LENGTH {
            return Err(Error::ErrHeaderSizeInsufficient);
        }
        Ok(&self.data[..RTP_FIXED_HEADER_LENGTH])
    }

    pub fn ssrc(&self) -> Result<u32> {
        let h = self.fixed_header()?;
        Ok(u32::from_be_bytes([h[8], h[9], h[10], h[11]]))
    }

    pub fn sequence_number(&self) -> Result<u16> {
        let h = self.fixed_header()?;
        Ok(u16::from_be_bytes([h[2], h[3]]))
    }

    pub fn timestamp(&self) -> Result<u32> {
        let h = self.fixed_header()?;
        Ok(u32::from_be_bytes([h[4], h[5], h[6], h[7]]))
    }

    pub fn marker(&self) -> Result<bool> {
        let h = self.fixed_header()?;
        Ok(h[1] & 0x80 != 0)
    }

    pub fn set_sequence_number(&mut self, sequence_number: u16) -> Result<()> {
        rtp::header::rewrite_sequence_number(&mut self.data, sequence_number)
    }

    pub fn set_timestamp(&mut self, timestamp: u32) -> Result<()> {
        rtp::header::rewrite_timestamp(&mut self.data, timestamp)
    }

    pub fn set_ssrc(&mut self, ssrc: u32) -> Result<()> {
        rtp::header::rewrite_ssrc(&mut self.data, ssrc)
    }

    pub fn set_marker(&mut self, marker: bool) -> Result<()> {
        rtp::header::rewrite_marker(&mut self.data, marker)
    }

    pub fn belongs_to_spatial_layer(&self, layer: u8) -> bool {
        self.compatible_spatial_layers.contains(&layer)
    }

    pub fn belongs_to_temporal_layer(&self, layer: u8) -> bool {
        self.compatible_temporal_layers.contains(&layer)
    }

    /// True when the packet carries layer tags, i.e. the stream is scalable.
    pub fn is_layered(&self) -> bool {
        !self.compatible_spatial_layers.is_empty() || !self.compatible_temporal_layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn rtp_packet(seq: u16) -> rtp::Packet {
        rtp::Packet {
            header: rtp::Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 3000,
                ssrc: 0x1234,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1, 2, 3]),
            padding_size: 0,
        }
    }

    #[test]
    fn test_data_packet_accessors() -> Result<()> {
        let now = Instant::now();
        let mut packet = DataPacket::from_rtp(now, MediaKind::Video, &rtp_packet(100))?;
        assert!(!packet.is_rtcp());
        assert_eq!(packet.len(), 15);
        assert_eq!(packet.ssrc()?, 0x1234);
        assert_eq!(packet.sequence_number()?, 100);
        assert_eq!(packet.timestamp()?, 3000);
        assert!(!packet.marker()?);

        packet.set_sequence_number(7)?;
        packet.set_ssrc(0x9999)?;
        packet.set_timestamp(42)?;
        packet.set_marker(true)?;

        let parsed = packet.rtp_packet()?;
        assert_eq!(parsed.header.sequence_number, 7);
        assert_eq!(parsed.header.ssrc, 0x9999);
        assert_eq!(parsed.header.timestamp, 42);
        assert!(parsed.header.marker);
        assert_eq!(&parsed.payload[..], &[1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_data_packet_truncated() {
        let packet = DataPacket::new(
            Instant::now(),
            MediaKind::Audio,
            BytesMut::from(&[0x80u8, 0x60, 0x00][..]),
        );
        assert_eq!(packet.ssrc(), Err(Error::ErrHeaderSizeInsufficient));
        assert_eq!(packet.sequence_number(), Err(Error::ErrHeaderSizeInsufficient));
    }

    #[test]
    fn test_layer_membership() {
        let mut packet = DataPacket::new(Instant::now(), MediaKind::Video, BytesMut::new());
        assert!(!packet.is_layered());
        packet.compatible_spatial_layers = vec![1, 2];
        packet.compatible_temporal_layers = vec![0, 1, 2];
        assert!(packet.is_layered());
        assert!(packet.belongs_to_spatial_layer(2));
        assert!(!packet.belongs_to_spatial_layer(0));
        assert!(packet.belongs_to_temporal_layer(0));
    }

    #[test]
    fn test_rtcp_detection() {
        let packet = DataPacket::rtcp(
            Instant::now(),
            MediaKind::Video,
            BytesMut::from(&[0x81u8, 0xc9, 0x00, 0x01, 0, 0, 0, 1][..]),
        );
        assert!(packet.is_rtcp());
    }
}
