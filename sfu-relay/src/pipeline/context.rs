use super::service::ServiceRegistry;
use crate::event::MediaEvent;
use crate::packet::DataPacket;
use crate::worker::{TaskHandle, Worker};
use shared::error::Result;
use std::any::Any;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Stable identity of a handler inside one pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// A handler timer as stored on the pipeline's worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct TimerTask {
    pub(crate) handler: HandlerId,
    pub(crate) token: u64,
}

/// What a handler sees of its pipeline during one call.
///
/// Packets fired here are routed by the pipeline after the call returns:
/// reads continue to the next inbound handler after this one, writes to the
/// next outbound handler before it.
pub struct HandlerContext<'a> {
    now: Instant,
    handler: HandlerId,
    services: &'a mut ServiceRegistry,
    worker: &'a mut Worker<TimerTask>,

    pub(crate) read_outs: VecDeque<DataPacket>,
    pub(crate) write_outs: VecDeque<DataPacket>,
    pub(crate) event_outs: VecDeque<MediaEvent>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        now: Instant,
        handler: HandlerId,
        services: &'a mut ServiceRegistry,
        worker: &'a mut Worker<TimerTask>,
    ) -> Self {
        Self {
            now,
            handler,
            services,
            worker,
            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler
    }

    /// Continues inbound traversal with `packet`.
    pub fn fire_read(&mut self, packet: DataPacket) {
        self.read_outs.push_back(packet);
    }

    /// Sends `packet` down the outbound chain from this handler's position.
    pub fn fire_write(&mut self, packet: DataPacket) {
        self.write_outs.push_back(packet);
    }

    /// Surfaces an event to the pipeline's owner.
    pub fn fire_event(&mut self, event: MediaEvent) {
        self.event_outs.push_back(event);
    }

    pub fn get_service<T: Any>(&self) -> Option<Rc<T>> {
        self.services.get::<T>()
    }

    pub fn register_service<T: Any>(&mut self, service: Rc<T>) -> Result<()> {
        self.services.register(service)
    }

    /// Runs `handle_timeout(token)` on this handler once, `delay` from now.
    pub fn schedule_after(&mut self, delay: Duration, token: u64) -> TaskHandle {
        let task = TimerTask {
            handler: self.handler,
            token,
        };
        self.worker.schedule_after(self.now, delay, task)
    }

    /// Runs `handle_timeout(token)` on this handler every `period` until cancelled.
    pub fn schedule_every(&mut self, period: Duration, token: u64) -> TaskHandle {
        let task = TimerTask {
            handler: self.handler,
            token,
        };
        self.worker.schedule_every(self.now, period, task)
    }

    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.worker.cancel(handle)
    }

    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.worker.is_scheduled(handle)
    }
}
