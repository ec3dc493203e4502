use super::context::HandlerContext;
use crate::event::MediaEvent;
use crate::packet::DataPacket;
use serde::Deserialize;
use shared::error::Result;

/// Which traversals a handler takes part in.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    #[default]
    Both,
}

impl Direction {
    pub fn is_inbound(&self) -> bool {
        matches!(self, Direction::In | Direction::Both)
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, Direction::Out | Direction::Both)
    }
}

/// One stage of a [`Pipeline`](super::Pipeline).
///
/// Inbound packets reach `handle_read` head to tail, outbound packets reach
/// `handle_write` tail to head. A handler continues the chain by calling
/// [`HandlerContext::fire_read`] or [`HandlerContext::fire_write`] zero or
/// more times; not calling them drops the packet. Errors are logged by the
/// pipeline and never stop traversal of other packets.
///
/// Whether a disabled handler passes packets through or drops them is up to
/// the handler; the pipeline keeps delivering to it.
pub trait Handler {
    /// Name used by `enable`/`disable`/`remove` and in logs.
    fn name(&self) -> &'static str;

    fn direction(&self) -> Direction {
        Direction::Both
    }

    /// Called once after the handler joins a finalized pipeline.
    fn attach(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once when the handler leaves the pipeline. Timers are cancelled afterwards.
    fn detach(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Topology or services changed; re-resolve anything looked up through the context.
    fn notify_update(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    fn enable(&mut self) {}

    fn disable(&mut self) {}

    fn handle_read(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        ctx.fire_read(packet);
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext<'_>, packet: DataPacket) -> Result<()> {
        ctx.fire_write(packet);
        Ok(())
    }

    /// Events injected into the pipeline from outside, broadcast head to tail.
    fn handle_event(&mut self, _ctx: &mut HandlerContext<'_>, _event: &MediaEvent) -> Result<()> {
        Ok(())
    }

    /// A timer scheduled through the context fired; `token` is the value given when scheduling.
    fn handle_timeout(&mut self, _ctx: &mut HandlerContext<'_>, _token: u64) -> Result<()> {
        Ok(())
    }
}
