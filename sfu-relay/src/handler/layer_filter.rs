use super::translate_nack;
use crate::event::MediaEvent;
use crate::packet::{DataPacket, MediaKind};
use crate::pipeline::{Handler, HandlerContext};
use crate::services::LayerSelection;
use crate::stream_info::MediaStream;
use crate::translator::{SequenceNumberKind, SequenceNumberTranslator};
use bytes::BytesMut;
use log::{debug, trace};
use rtcp::header::{FORMAT_FIR, FORMAT_PLI, FORMAT_SLI, FORMAT_TLN, PacketType};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use shared::error::Result;
use shared::marshal::Marshal;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const LAYER_FILTER_HANDLER_NAME: &str = "layer-filter";
pub const DEFAULT_SWITCH_TIMEOUT: Duration = Duration::from_secs(4);

pub struct LayerFilterHandlerBuilder {
    spatial_layer: u8,
    temporal_layer: u8,
    switch_timeout: Duration,
}

impl Default for LayerFilterHandlerBuilder {
    fn default() -> Self {
        Self {
            spatial_layer: 0,
            temporal_layer: 0,
            switch_timeout: DEFAULT_SWITCH_TIMEOUT,
        }
    }
}

impl LayerFilterHandlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layers forwarded until a [`LayerSelection`] service says otherwise.
    pub fn with_target_layers(mut self, spatial_layer: u8, temporal_layer: u8) -> Self {
        self.spatial_layer = spatial_layer;
        self.temporal_layer = temporal_layer;
        self
    }

    /// How long a spatial switch waits for a keyframe before switching anyway.
    pub fn with_switch_timeout(mut self, switch_timeout: Duration) -> Self {
        self.switch_timeout = switch_timeout;
        self
    }

    pub fn build(self) -> LayerFilterHandler {
        LayerFilterHandler {
            enabled: true,
            switch_timeout: self.switch_timeout,
            translator: SequenceNumberTranslator::new(),
            stream: None,
            selection: None,
            is_scalable: false,
            receiving_multiple_ssrc: false,
            last_ssrc_received: None,
            video_sink_ssrc: None,
            target_spatial_layer: self.spatial_layer,
            target_temporal_layer: self.temporal_layer,
            future_spatial_layer: None,
            change_started: None,
            last_timestamp_sent: None,
            timestamp_offset: 0,
        }
    }
}

/// Forwards only the selected spatial/temporal layers of scalable video.
///
/// Sits on the outbound (toward the receiver) media path. Dropped packets are
/// reported to a [`SequenceNumberTranslator`] so the receiver sees contiguous
/// sequence numbers, and NACKs coming back are mapped to the original
/// numbering. Spatial switches wait for a keyframe of the new layer.
pub struct LayerFilterHandler {
    enabled: bool,
    switch_timeout: Duration,
    translator: SequenceNumberTranslator,

    stream: Option<Rc<MediaStream>>,
    selection: Option<Rc<LayerSelection>>,

    is_scalable: bool,
    receiving_multiple_ssrc: bool,
    last_ssrc_received: Option<u32>,
    video_sink_ssrc: Option<u32>,

    target_spatial_layer: u8,
    target_temporal_layer: u8,
    future_spatial_layer: Option<u8>,
    change_started: Option<Instant>,

    last_timestamp_sent: Option<u32>,
    timestamp_offset: u32,
}

impl Default for LayerFilterHandler {
    fn default() -> Self {
        LayerFilterHandlerBuilder::new().build()
    }
}

impl LayerFilterHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(spatial, temporal)` currently forwarded.
    pub fn target_layers(&self) -> (u8, u8) {
        (self.target_spatial_layer, self.target_temporal_layer)
    }

    fn video_source_ssrc(&self) -> Option<u32> {
        let layer = self
            .future_spatial_layer
            .unwrap_or(self.target_spatial_layer);
        self.stream
            .as_ref()
            .and_then(|stream| stream.video_source_ssrc(layer))
            .or(self.last_ssrc_received)
    }

    fn send_pli(&self, ctx: &mut HandlerContext<'_>, now: Instant) -> Result<()> {
        let Some(media_ssrc) = self.video_source_ssrc() else {
            trace!("no video source known yet, PLI not sent");
            return Ok(());
        };
        let pli = PictureLossIndication {
            sender_ssrc: self.video_sink_ssrc.unwrap_or_default(),
            media_ssrc,
        };
        ctx.fire_read(DataPacket::rtcp(
            now,
            MediaKind::Video,
            BytesMut::from(&pli.marshal()?[..]),
        ));
        Ok(())
    }

    fn check_layers(&mut self, ctx: &mut HandlerContext<'_>, now: Instant) -> Result<()> {
        let Some(selection) = self.selection.clone() else {
            return Ok(());
        };
        let (spatial, temporal) = selection.target();
        if spatial != self.target_spatial_layer && self.future_spatial_layer.is_none() {
            debug!(
                "switching spatial layer {} -> {}",
                self.target_spatial_layer, spatial
            );
            self.future_spatial_layer = Some(spatial);
            self.change_started = Some(now);
            self.send_pli(ctx, now)?;
        }
        self.target_temporal_layer = temporal;
        Ok(())
    }

    fn complete_switch(&mut self, ctx: &mut HandlerContext<'_>, ssrc: u32, spatial_layer: u8) {
        self.target_spatial_layer = spatial_layer;
        self.future_spatial_layer = None;
        self.change_started = None;
        ctx.fire_event(MediaEvent::LayerSwitched {
            ssrc,
            spatial_layer,
            temporal_layer: self.target_temporal_layer,
        });
    }

    fn change_spatial_layer_on_keyframe(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        packet: &DataPacket,
        ssrc: u32,
    ) -> Result<()> {
        let Some(future) = self.future_spatial_layer else {
            return Ok(());
        };

        if packet.is_keyframe
            && packet.belongs_to_spatial_layer(future)
            && packet.belongs_to_temporal_layer(self.target_temporal_layer)
        {
            self.complete_switch(ctx, ssrc, future);
        } else if self.change_started.is_some_and(|started| {
            packet.now.saturating_duration_since(started) > self.switch_timeout
        }) {
            debug!("no keyframe for layer {}, switching anyway", future);
            self.send_pli(ctx, packet.now)?;
            self.complete_switch(ctx, ssrc, future);
        }
        Ok(())
    }

    fn check_ssrc_change(&mut self, ssrc: u32) -> bool {
        let changed = self.last_ssrc_received != Some(ssrc);
        self.last_ssrc_received = Some(ssrc);
        changed
    }

    fn filter(&mut self, ctx: &mut HandlerContext<'_>, mut packet: DataPacket) -> Result<()> {
        self.check_layers(ctx, packet.now)?;

        let ssrc = packet.ssrc()?;
        let sequence_number = packet.sequence_number()?;
        let timestamp = packet.timestamp()?;

        if self.last_ssrc_received.is_some_and(|last| last != ssrc) {
            self.receiving_multiple_ssrc = true;
        }

        self.change_spatial_layer_on_keyframe(ctx, &packet, ssrc)?;

        if !packet.belongs_to_spatial_layer(self.target_spatial_layer) {
            // other simulcast streams have their own numbering
            if !self.receiving_multiple_ssrc {
                self.translator.get(sequence_number, true);
            }
            return Ok(());
        }

        if self.check_ssrc_change(ssrc) {
            self.translator.reset();
            if let Some(last_sent) = self.last_timestamp_sent {
                self.timestamp_offset = last_sent.wrapping_sub(timestamp).wrapping_add(1);
            }
        }

        if !packet.belongs_to_temporal_layer(self.target_temporal_layer) {
            self.translator.get(sequence_number, true);
            return Ok(());
        }

        let sequence = self.translator.get(sequence_number, false);
        if sequence.kind != SequenceNumberKind::Valid {
            trace!("drop {} translated as {:?}", sequence_number, sequence.kind);
            return Ok(());
        }

        if packet.ending_of_layer_frame
            && packet.compatible_spatial_layers.last() == Some(&self.target_spatial_layer)
        {
            packet.set_marker(true)?;
        }
        if let Some(sink_ssrc) = self.video_sink_ssrc {
            packet.set_ssrc(sink_ssrc)?;
        }
        packet.set_sequence_number(sequence.output)?;

        let sent = timestamp.wrapping_add(self.timestamp_offset);
        self.last_timestamp_sent = Some(sent);
        packet.set_timestamp(sent)?;

        ctx.fire_write(packet);
        Ok(())
    }

    fn handle_feedback(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        let mut kept = BytesMut::new();
        let mut wants_keyframe = false;

        let mut blocks = rtcp::packet::blocks(&packet.data);
        for (header, block) in blocks.by_ref() {
            match header.packet_type {
                PacketType::TransportSpecificFeedback if header.count == FORMAT_TLN => {
                    match translate_nack(&self.translator, block, self.last_ssrc_received) {
                        Ok(Some(nack)) => kept.extend_from_slice(&nack.marshal()?),
                        Ok(None) => trace!("NACK had nothing left after translation"),
                        Err(err) => debug!("malformed NACK dropped: {}", err),
                    }
                }
                PacketType::PayloadSpecificFeedback
                    if matches!(header.count, FORMAT_PLI | FORMAT_SLI | FORMAT_FIR) =>
                {
                    wants_keyframe = true;
                }
                _ => kept.extend_from_slice(block),
            }
        }
        if blocks.is_truncated() {
            debug!("compound RTCP from receiver truncated");
        }

        if !kept.is_empty() {
            ctx.fire_read(DataPacket::rtcp(packet.now, packet.kind, kept));
        }
        if wants_keyframe {
            self.send_pli(ctx, packet.now)?;
        }
        Ok(())
    }
}

impl Handler for LayerFilterHandler {
    fn name(&self) -> &'static str {
        LAYER_FILTER_HANDLER_NAME
    }

    fn notify_update(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.stream = ctx.get_service::<MediaStream>();
        self.selection = ctx.get_service::<LayerSelection>();
        self.video_sink_ssrc = self.stream.as_ref().and_then(|stream| stream.video_sink_ssrc);
        Ok(())
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if self.enabled && self.is_scalable && packet.is_rtcp() {
            return self.handle_feedback(ctx, packet);
        }
        ctx.fire_read(packet);
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if !self.enabled || packet.kind != MediaKind::Video || packet.is_rtcp() {
            ctx.fire_write(packet);
            return Ok(());
        }
        if !self.is_scalable && packet.is_layered() {
            debug!("scalable video detected");
            self.is_scalable = true;
        }
        if !self.is_scalable {
            ctx.fire_write(packet);
            return Ok(());
        }
        self.filter(ctx, packet)
    }
}
