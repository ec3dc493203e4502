use crate::packet::DataPacket;
use crate::pipeline::{Handler, HandlerContext};
use crate::services::Stats;
use crate::stream_info::MediaStream;
use shared::error::Result;
use std::rc::Rc;

pub const STATS_HANDLER_NAME: &str = "stats";

/// Counts RTP packets per SSRC into the [`Stats`] service.
///
/// With a [`MediaStream`] registered, SSRCs that are neither a source nor a
/// sink of the stream are not counted.
pub struct StatsHandler {
    enabled: bool,
    stats: Option<Rc<Stats>>,
    stream: Option<Rc<MediaStream>>,
}

impl Default for StatsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsHandler {
    pub fn new() -> Self {
        Self {
            enabled: true,
            stats: None,
            stream: None,
        }
    }

    fn counted(&self, packet: &DataPacket) -> Option<(&Stats, u32)> {
        if !self.enabled || packet.is_rtcp() {
            return None;
        }
        let stats = self.stats.as_deref()?;
        let ssrc = packet.ssrc().ok()?;
        match &self.stream {
            Some(stream) if !stream.is_source_ssrc(ssrc) && !stream.is_sink_ssrc(ssrc) => None,
            _ => Some((stats, ssrc)),
        }
    }
}

impl Handler for StatsHandler {
    fn name(&self) -> &'static str {
        STATS_HANDLER_NAME
    }

    fn notify_update(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.stats = ctx.get_service::<Stats>();
        self.stream = ctx.get_service::<MediaStream>();
        Ok(())
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if let Some((stats, ssrc)) = self.counted(&packet) {
            stats.record_inbound(ssrc, packet.len());
        }
        ctx.fire_read(packet);
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        if let Some((stats, ssrc)) = self.counted(&packet) {
            stats.record_outbound(ssrc, packet.len());
        }
        ctx.fire_write(packet);
        Ok(())
    }
}
