use crate::header::*;
use crate::payload_feedbacks::full_intra_request::FullIntraRequest;
use crate::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use crate::raw_packet::RawPacket;
use crate::receiver_report::ReceiverReport;
use crate::sender_report::SenderReport;
use crate::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use bytes::{Buf, BytesMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, Unmarshal};

use std::any::Any;
use std::fmt;

/// Packet represents an RTCP packet, a protocol used for out-of-band statistics
/// and control information for an RTP session
pub trait Packet: Marshal + Unmarshal + fmt::Debug {
    fn header(&self) -> Header;
    fn destination_ssrc(&self) -> Vec<u32>;
    fn raw_size(&self) -> usize;
    fn as_any(&self) -> &(dyn Any);
    fn equal(&self, other: &(dyn Packet)) -> bool;
    fn cloned(&self) -> Box<dyn Packet>;
}

impl PartialEq for dyn Packet {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Clone for Box<dyn Packet> {
    fn clone(&self) -> Box<dyn Packet> {
        self.cloned()
    }
}

/// Iterator over the blocks of a compound RTCP packet.
///
/// Yields each block's header together with the block bytes (header included).
/// Iteration ends at the first block with a bad header or whose declared length
/// runs past the end of the buffer; [`Blocks::is_truncated`] reports that case.
#[derive(Debug, Clone)]
pub struct Blocks<'a> {
    remaining: &'a [u8],
    truncated: bool,
}

impl<'a> Blocks<'a> {
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn stop(&mut self) -> Option<(Header, &'a [u8])> {
        self.truncated = true;
        self.remaining = &[];
        None
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = (Header, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        let mut reader = self.remaining;
        let header = match Header::unmarshal(&mut reader) {
            Ok(header) => header,
            Err(_) => return self.stop(),
        };

        let block_size = header.block_size();
        if block_size > self.remaining.len() {
            return self.stop();
        }

        let (block, rest) = self.remaining.split_at(block_size);
        self.remaining = rest;
        Some((header, block))
    }
}

/// Walks the blocks of a compound packet without trusting declared lengths.
pub fn blocks(raw: &[u8]) -> Blocks<'_> {
    Blocks {
        remaining: raw,
        truncated: false,
    }
}

/// Unmarshal takes an entire udp datagram (which may consist of multiple RTCP packets) and
/// returns the unmarshaled packets it contains.
///
/// If this is a reduced-size RTCP packet a feedback packet (Goodbye, SliceLossIndication, etc)
/// will be returned. Otherwise, the underlying type of the returned packet will be
/// CompoundPacket.
pub fn unmarshal<B>(raw_data: &mut B) -> Result<Vec<Box<dyn Packet>>>
where
    B: Buf,
{
    let raw = raw_data.copy_to_bytes(raw_data.remaining());
    let mut iter = blocks(&raw);
    let mut packets = vec![];

    for (header, block) in iter.by_ref() {
        packets.push(unmarshaller(&header, block)?);
    }

    if iter.is_truncated() {
        return Err(Error::BlockLengthOverrun);
    }

    match packets.len() {
        // Empty packet
        0 => Err(Error::InvalidHeader),
        // Multiple Packet
        _ => Ok(packets),
    }
}

/// Concatenates packets into a compound datagram.
pub fn marshal(packets: &[Box<dyn Packet>]) -> Result<BytesMut> {
    let mut out = BytesMut::new();
    for p in packets {
        let data = p.marshal()?;
        out.extend_from_slice(&data);
    }
    Ok(out)
}

/// unmarshaller is a factory which pulls the first RTCP packet from a bytestream,
/// and returns it's parsed representation, and the amount of data that was processed.
pub(crate) fn unmarshaller(h: &Header, mut block: &[u8]) -> Result<Box<dyn Packet>> {
    let packet: Box<dyn Packet> = match h.packet_type {
        PacketType::SenderReport => Box::new(SenderReport::unmarshal(&mut block)?),
        PacketType::ReceiverReport => Box::new(ReceiverReport::unmarshal(&mut block)?),
        PacketType::TransportSpecificFeedback => match h.count {
            FORMAT_TLN => Box::new(TransportLayerNack::unmarshal(&mut block)?),
            _ => Box::new(RawPacket::unmarshal(&mut block)?),
        },
        PacketType::PayloadSpecificFeedback => match h.count {
            FORMAT_PLI => Box::new(PictureLossIndication::unmarshal(&mut block)?),
            FORMAT_FIR => Box::new(FullIntraRequest::unmarshal(&mut block)?),
            _ => Box::new(RawPacket::unmarshal(&mut block)?),
        },
        _ => Box::new(RawPacket::unmarshal(&mut block)?),
    };

    Ok(packet)
}
