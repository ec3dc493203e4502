use super::translate_nack;
use crate::packet::{DataPacket, MediaKind};
use crate::pipeline::{Handler, HandlerContext};
use crate::translator::{SequenceNumberKind, SequenceNumberTranslator};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use rtcp::header::{FORMAT_TLN, PacketType};
use shared::error::Result;
use shared::marshal::Marshal;

pub const PADDING_GENERATOR_HANDLER_NAME: &str = "padding-generator";
pub const DEFAULT_PADDING_PACKETS: usize = 1;
const MAX_PADDING_SIZE: u8 = 255;

pub struct PaddingGeneratorHandlerBuilder {
    enabled: bool,
    padding_packets: usize,
}

impl Default for PaddingGeneratorHandlerBuilder {
    fn default() -> Self {
        Self {
            enabled: false,
            padding_packets: DEFAULT_PADDING_PACKETS,
        }
    }
}

impl PaddingGeneratorHandlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Padding-only packets sent after each frame.
    pub fn with_padding_packets(mut self, padding_packets: usize) -> Self {
        self.padding_packets = padding_packets;
        self
    }

    pub fn build(self) -> PaddingGeneratorHandler {
        PaddingGeneratorHandler {
            enabled: self.enabled,
            padding_packets: self.padding_packets,
            translator: SequenceNumberTranslator::new(),
        }
    }
}

/// Adds padding-only packets after every frame-ending video packet.
///
/// Video is always renumbered through a translator so padding can be
/// inserted at any time; NACKs for padding are dropped on the way back.
pub struct PaddingGeneratorHandler {
    enabled: bool,
    padding_packets: usize,
    translator: SequenceNumberTranslator,
}

impl Default for PaddingGeneratorHandler {
    fn default() -> Self {
        PaddingGeneratorHandlerBuilder::new().build()
    }
}

impl PaddingGeneratorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn padding_packet(&mut self, template: &DataPacket) -> Result<DataPacket> {
        let header = template.rtp_header()?;
        let sequence = self.translator.generate();
        let padding = rtp::Packet {
            header: rtp::Header {
                marker: false,
                padding: true,
                sequence_number: sequence.output,
                ..header
            },
            payload: Bytes::new(),
            padding_size: MAX_PADDING_SIZE,
        };
        let mut packet = DataPacket::from_rtp(template.now, MediaKind::Video, &padding)?;
        packet.is_padding = true;
        Ok(packet)
    }
}

impl Handler for PaddingGeneratorHandler {
    fn name(&self) -> &'static str {
        PADDING_GENERATOR_HANDLER_NAME
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if !packet.is_rtcp() || !self.translator.is_initialized() {
            ctx.fire_read(packet);
            return Ok(());
        }

        let mut kept = BytesMut::new();
        for (header, block) in rtcp::packet::blocks(&packet.data) {
            if header.packet_type == PacketType::TransportSpecificFeedback
                && header.count == FORMAT_TLN
            {
                match translate_nack(&self.translator, block, None) {
                    Ok(Some(nack)) => kept.extend_from_slice(&nack.marshal()?),
                    Ok(None) => trace!("NACK only asked for padding"),
                    Err(err) => debug!("malformed NACK dropped: {}", err),
                }
            } else {
                kept.extend_from_slice(block);
            }
        }
        if !kept.is_empty() {
            ctx.fire_read(DataPacket::rtcp(packet.now, packet.kind, kept));
        }
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext<'_>, mut packet: DataPacket) -> Result<()> {
        if packet.kind != MediaKind::Video || packet.is_rtcp() {
            ctx.fire_write(packet);
            return Ok(());
        }

        let sequence = self.translator.get(packet.sequence_number()?, false);
        if sequence.kind != SequenceNumberKind::Valid {
            trace!("drop {} translated as {:?}", sequence.input, sequence.kind);
            return Ok(());
        }
        packet.set_sequence_number(sequence.output)?;

        let frame_end = self.enabled && packet.marker()?;
        let template = if frame_end { Some(packet.clone()) } else { None };
        ctx.fire_write(packet);

        if let Some(template) = template {
            for _ in 0..self.padding_packets {
                let padding = self.padding_packet(&template)?;
                ctx.fire_write(padding);
            }
        }
        Ok(())
    }
}
