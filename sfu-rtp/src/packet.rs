use crate::header::Header;
use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use std::fmt;

/// An RTP packet: header, payload and trailing padding length.
#[derive(Debug, Eq, PartialEq, Default, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
    pub padding_size: u8,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = "RTP PACKET:\n".to_string();

        out += format!("\tVersion: {}\n", self.header.version).as_str();
        out += format!("\tMarker: {}\n", self.header.marker).as_str();
        out += format!("\tPayload Type: {}\n", self.header.payload_type).as_str();
        out += format!("\tSequence Number: {}\n", self.header.sequence_number).as_str();
        out += format!("\tTimestamp: {}\n", self.header.timestamp).as_str();
        out += format!("\tSSRC: {} ({:x})\n", self.header.ssrc, self.header.ssrc).as_str();
        out += format!("\tPayload Length: {}\n", self.payload.len()).as_str();

        write!(f, "{out}")
    }
}

impl Unmarshal for Packet {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        let payload_len = raw_packet.remaining();
        let mut payload = raw_packet.copy_to_bytes(payload_len);
        let padding_size = if header.padding {
            if payload_len == 0 {
                return Err(Error::ErrShortPacket);
            }
            let padding_size = payload[payload_len - 1] as usize;
            if padding_size == 0 || padding_size > payload_len {
                return Err(Error::ErrShortPacket);
            }
            payload.truncate(payload_len - padding_size);
            padding_size as u8
        } else {
            0
        };

        Ok(Packet {
            header,
            payload,
            padding_size,
        })
    }
}

impl MarshalSize for Packet {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len() + self.padding_size as usize
    }
}

impl Marshal for Packet {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }

        let mut header = self.header.clone();
        header.padding = self.padding_size != 0;
        let n = header.marshal_to(buf)?;
        let mut writer = &mut buf[n..];

        writer.put_slice(&self.payload);
        let padding_size = self.padding_size as usize;
        if padding_size > 0 {
            writer.put_bytes(0, padding_size - 1);
            writer.put_u8(self.padding_size);
        }

        Ok(n + self.payload.len() + padding_size)
    }
}
