use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LENGTH: usize = 4;
pub const VERSION_SHIFT: u8 = 6;
pub const VERSION_MASK: u8 = 0x3;
pub const PADDING_SHIFT: u8 = 5;
pub const PADDING_MASK: u8 = 0x1;
pub const EXTENSION_SHIFT: u8 = 4;
pub const EXTENSION_MASK: u8 = 0x1;
pub const CC_MASK: u8 = 0xF;
pub const MARKER_SHIFT: u8 = 7;
pub const MARKER_MASK: u8 = 0x1;
pub const PT_MASK: u8 = 0x7F;
pub const SEQ_NUM_OFFSET: usize = 2;
pub const TIMESTAMP_OFFSET: usize = 4;
pub const SSRC_OFFSET: usize = 8;
pub const CSRC_OFFSET: usize = 12;
pub const CSRC_LENGTH: usize = 4;

/// Fixed RTP header (RFC 3550 §5.1) plus an opaque header extension.
#[derive(Debug, Eq, PartialEq, Default, Clone)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension_profile: u16,
    /// Extension body, a multiple of 4 bytes on the wire.
    pub extension_payload: Bytes,
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let raw_packet_len = raw_packet.remaining();
        if raw_packet_len < CSRC_OFFSET {
            return Err(Error::ErrHeaderSizeInsufficient);
        }
        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |V=2|P|X|  CC   |M|     PT      |       sequence number         |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                           timestamp                           |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |           synchronization source (SSRC) identifier            |
         * +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * |            contributing source (CSRC) identifiers             |
         * |                             ....                              |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let b0 = raw_packet.get_u8();
        let version = (b0 >> VERSION_SHIFT) & VERSION_MASK;
        if version != 2 {
            return Err(Error::BadVersion);
        }
        let padding = (b0 >> PADDING_SHIFT) & PADDING_MASK > 0;
        let extension = (b0 >> EXTENSION_SHIFT) & EXTENSION_MASK > 0;
        let cc = (b0 & CC_MASK) as usize;

        let b1 = raw_packet.get_u8();
        let marker = (b1 >> MARKER_SHIFT) & MARKER_MASK > 0;
        let payload_type = b1 & PT_MASK;

        let sequence_number = raw_packet.get_u16();
        let timestamp = raw_packet.get_u32();
        let ssrc = raw_packet.get_u32();

        if raw_packet.remaining() < cc * CSRC_LENGTH {
            return Err(Error::ErrHeaderSizeInsufficient);
        }
        let mut csrc = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrc.push(raw_packet.get_u32());
        }

        let (extension_profile, extension_payload) = if extension {
            if raw_packet.remaining() < HEADER_LENGTH {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            let extension_profile = raw_packet.get_u16();
            let extension_length = raw_packet.get_u16() as usize * 4;
            if raw_packet.remaining() < extension_length {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            (
                extension_profile,
                raw_packet.copy_to_bytes(extension_length),
            )
        } else {
            (0, Bytes::new())
        };

        Ok(Header {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extension_payload,
        })
    }
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        let mut head_size = CSRC_OFFSET + self.csrc.len() * CSRC_LENGTH;
        if self.extension {
            head_size += HEADER_LENGTH + self.extension_payload_len();
        }
        head_size
    }
}

impl Marshal for Header {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferTooSmall);
        }
        if self.csrc.len() > CC_MASK as usize {
            return Err(Error::ErrTooManyCsrcs);
        }

        let mut b0 = (2 << VERSION_SHIFT) | self.csrc.len() as u8;
        if self.padding {
            b0 |= 1 << PADDING_SHIFT;
        }
        if self.extension {
            b0 |= 1 << EXTENSION_SHIFT;
        }
        buf.put_u8(b0);

        let mut b1 = self.payload_type & PT_MASK;
        if self.marker {
            b1 |= 1 << MARKER_SHIFT;
        }
        buf.put_u8(b1);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if self.extension {
            let extension_payload_len = self.extension_payload_len();
            buf.put_u16(self.extension_profile);
            buf.put_u16((extension_payload_len / 4) as u16);
            buf.put_slice(&self.extension_payload);
            for _ in self.extension_payload.len()..extension_payload_len {
                buf.put_u8(0);
            }
        }

        Ok(size)
    }
}

impl Header {
    fn extension_payload_len(&self) -> usize {
        self.extension_payload.len().div_ceil(4) * 4
    }
}

fn check_fixed_header(raw: &[u8]) -> Result<()> {
    if raw.len() < CSRC_OFFSET {
        Err(Error::ErrHeaderSizeInsufficient)
    } else {
        Ok(())
    }
}

/// Rewrites the sequence number of a serialized RTP packet in place.
pub fn rewrite_sequence_number(raw: &mut [u8], sequence_number: u16) -> Result<()> {
    check_fixed_header(raw)?;
    raw[SEQ_NUM_OFFSET..SEQ_NUM_OFFSET + 2].copy_from_slice(&sequence_number.to_be_bytes());
    Ok(())
}

pub fn rewrite_timestamp(raw: &mut [u8], timestamp: u32) -> Result<()> {
    check_fixed_header(raw)?;
    raw[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&timestamp.to_be_bytes());
    Ok(())
}

pub fn rewrite_ssrc(raw: &mut [u8], ssrc: u32) -> Result<()> {
    check_fixed_header(raw)?;
    raw[SSRC_OFFSET..SSRC_OFFSET + 4].copy_from_slice(&ssrc.to_be_bytes());
    Ok(())
}

pub fn rewrite_marker(raw: &mut [u8], marker: bool) -> Result<()> {
    check_fixed_header(raw)?;
    if marker {
        raw[1] |= 1 << MARKER_SHIFT;
    } else {
        raw[1] &= !(1 << MARKER_SHIFT);
    }
    Ok(())
}
