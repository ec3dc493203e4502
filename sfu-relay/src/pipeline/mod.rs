//! Ordered chain of packet handlers for one media stream.
//!
//! ```text
//! handle_read:  network -> H0 -> H1 -> ... -> Hn -> poll_read
//! handle_write: poll_write <- H0 <- H1 <- ... <- Hn <- application
//! ```
//!
//! The pipeline owns every handler in an arena. Handlers never hold references
//! to each other: a [`HandlerContext`] collects what a handler fires, and the
//! pipeline routes it to the neighbour in the matching direction after the call
//! returns. Traversal of one packet runs to completion inside the call that
//! injected it.

mod context;
mod handler;
mod service;

pub use context::{HandlerContext, HandlerId};
pub use handler::{Direction, Handler};
pub use service::ServiceRegistry;

use crate::event::MediaEvent;
use crate::packet::DataPacket;
use crate::worker::Worker;
use context::TimerTask;
use log::{debug, trace, warn};
use shared::error::{Error, Result, flatten_errs};
use std::any::Any;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

struct HandlerRecord {
    id: HandlerId,
    name: &'static str,
    enabled: bool,
    direction: Direction,
    owner: bool,
    attached: bool,
    /// Empty only while the handler is being called.
    handler: Option<Box<dyn Handler>>,
}

enum Job {
    Read(usize, DataPacket),
    Write(usize, DataPacket),
}

/// Collected output of one handler call.
struct Fired {
    reads: VecDeque<DataPacket>,
    writes: VecDeque<DataPacket>,
    events: VecDeque<MediaEvent>,
}

#[derive(Default)]
pub struct Pipeline {
    records: Vec<HandlerRecord>,
    inbound: Vec<usize>,
    outbound: Vec<usize>,
    next_id: u64,
    finalized: bool,
    closed: bool,
    last_now: Option<Instant>,

    services: ServiceRegistry,
    worker: Worker<TimerTask>,

    read_outs: VecDeque<DataPacket>,
    write_outs: VecDeque<DataPacket>,
    event_outs: VecDeque<MediaEvent>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, handler: Box<dyn Handler>) -> HandlerRecord {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        HandlerRecord {
            id,
            name: handler.name(),
            enabled: true,
            direction: handler.direction(),
            owner: false,
            attached: false,
            handler: Some(handler),
        }
    }

    /// Appends a handler at the tail (closest to the application).
    pub fn add_back(&mut self, handler: Box<dyn Handler>) -> HandlerId {
        let record = self.record(handler);
        let id = record.id;
        self.records.push(record);
        self.topology_changed();
        id
    }

    /// Inserts a handler at the head (closest to the network).
    pub fn add_front(&mut self, handler: Box<dyn Handler>) -> HandlerId {
        let record = self.record(handler);
        let id = record.id;
        self.records.insert(0, record);
        self.topology_changed();
        id
    }

    fn topology_changed(&mut self) {
        if self.finalized {
            self.derive_views();
            self.attach_pending();
        }
    }

    fn derive_views(&mut self) {
        self.inbound = (0..self.records.len())
            .filter(|&i| self.records[i].direction.is_inbound())
            .collect();
        self.outbound = (0..self.records.len())
            .filter(|&i| self.records[i].direction.is_outbound())
            .collect();
    }

    fn attach_pending(&mut self) {
        let now = self.now();
        for index in (0..self.records.len()).rev() {
            if self.records[index].attached {
                continue;
            }
            self.records[index].attached = true;
            let fired = self.call(index, now, "attach", |handler, ctx| handler.attach(ctx));
            self.route(now, index, fired);
        }
    }

    /// Derives the inbound and outbound views and attaches handlers tail to head.
    ///
    /// Calling it again only attaches handlers that were not attached yet.
    pub fn finalize(&mut self) {
        if self.closed {
            return;
        }
        self.finalized = true;
        self.derive_views();
        self.attach_pending();
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Handler names head to tail.
    pub fn names(&self) -> Vec<&'static str> {
        self.records.iter().map(|record| record.name).collect()
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.records
            .iter()
            .find(|record| record.name == name)
            .map(|record| record.enabled)
    }

    /// Enables every handler called `name`. Returns false if none matched.
    pub fn enable(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut matched = false;
        for record in self.records.iter_mut().filter(|record| record.name == name) {
            matched = true;
            record.enabled = enabled;
            if let Some(handler) = record.handler.as_mut() {
                if enabled {
                    handler.enable();
                } else {
                    handler.disable();
                }
            }
        }
        matched
    }

    /// Delays releasing the handler called `name` until every other handler
    /// has been detached when the pipeline closes.
    pub fn mark_owner(&mut self, name: &str) -> Result<()> {
        let record = self
            .records
            .iter_mut()
            .find(|record| record.name == name)
            .ok_or(Error::ErrHandlerNotFound)?;
        record.owner = true;
        Ok(())
    }

    /// Detaches and drops the first handler called `name`; its timers are cancelled.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let index = self
            .records
            .iter()
            .position(|record| record.name == name)
            .ok_or(Error::ErrHandlerNotFound)?;
        let result = self.detach(index);
        self.records.remove(index);
        if self.finalized {
            self.derive_views();
        }
        result
    }

    fn detach(&mut self, index: usize) -> Result<()> {
        let now = self.now();
        let id = self.records[index].id;
        let mut result = Ok(());
        if self.records[index].attached {
            self.records[index].attached = false;
            let name = self.records[index].name;
            let fired = self.call(index, now, "detach", |handler, ctx| {
                result = handler.detach(ctx);
                Ok(())
            });
            if let Some(fired) = fired {
                if !fired.reads.is_empty() || !fired.writes.is_empty() {
                    debug!("{} fired packets while detaching, dropped", name);
                }
                self.event_outs.extend(fired.events);
            }
        }
        self.worker.retain(|task| task.handler != id);
        result
    }

    /// Broadcasts `notify_update` head to tail.
    pub fn notify_update(&mut self) {
        let now = self.now();
        for index in 0..self.records.len() {
            let fired = self.call(index, now, "notify_update", |handler, ctx| {
                handler.notify_update(ctx)
            });
            self.route(now, index, fired);
        }
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn register_service<T: Any>(&mut self, service: Rc<T>) -> Result<()> {
        self.services.register(service)
    }

    pub fn get_service<T: Any>(&self) -> Option<Rc<T>> {
        self.services.get::<T>()
    }

    fn now(&self) -> Instant {
        self.last_now.unwrap_or_else(Instant::now)
    }

    fn observe(&mut self, now: Instant) {
        self.last_now = Some(self.last_now.map_or(now, |last| last.max(now)));
    }

    /// Runs one handler hook with the handler temporarily taken out of its slot.
    fn call<F>(&mut self, index: usize, now: Instant, op: &str, f: F) -> Option<Fired>
    where
        F: FnOnce(&mut dyn Handler, &mut HandlerContext<'_>) -> Result<()>,
    {
        let record = &mut self.records[index];
        let id = record.id;
        let name = record.name;
        let Some(mut handler) = record.handler.take() else {
            debug!("{}.{} skipped: handler busy", name, op);
            return None;
        };

        let mut ctx = HandlerContext::new(now, id, &mut self.services, &mut self.worker);
        if let Err(err) = f(handler.as_mut(), &mut ctx) {
            warn!("{}.{} got error: {}", name, op, err);
        }
        let fired = Fired {
            reads: ctx.read_outs,
            writes: ctx.write_outs,
            events: ctx.event_outs,
        };

        self.records[index].handler = Some(handler);
        Some(fired)
    }

    fn next_inbound_after(&self, index: Option<usize>) -> Option<usize> {
        self.inbound
            .iter()
            .copied()
            .find(|&i| index.is_none_or(|index| i > index))
    }

    fn next_outbound_before(&self, index: Option<usize>) -> Option<usize> {
        self.outbound
            .iter()
            .rev()
            .copied()
            .find(|&i| index.is_none_or(|index| i < index))
    }

    fn enqueue_read(&mut self, jobs: &mut VecDeque<Job>, from: Option<usize>, packet: DataPacket) {
        match self.next_inbound_after(from) {
            Some(next) => jobs.push_back(Job::Read(next, packet)),
            None => self.read_outs.push_back(packet),
        }
    }

    fn enqueue_write(&mut self, jobs: &mut VecDeque<Job>, from: Option<usize>, packet: DataPacket) {
        match self.next_outbound_before(from) {
            Some(next) => jobs.push_back(Job::Write(next, packet)),
            None => self.write_outs.push_back(packet),
        }
    }

    fn enqueue_fired(&mut self, jobs: &mut VecDeque<Job>, index: usize, fired: Option<Fired>) {
        let Some(fired) = fired else {
            return;
        };
        for packet in fired.reads {
            self.enqueue_read(jobs, Some(index), packet);
        }
        for packet in fired.writes {
            self.enqueue_write(jobs, Some(index), packet);
        }
        self.event_outs.extend(fired.events);
    }

    fn route(&mut self, now: Instant, index: usize, fired: Option<Fired>) {
        let mut jobs = VecDeque::new();
        self.enqueue_fired(&mut jobs, index, fired);
        self.run(now, jobs);
    }

    fn run(&mut self, now: Instant, mut jobs: VecDeque<Job>) {
        while let Some(job) = jobs.pop_front() {
            let (index, fired) = match job {
                Job::Read(index, packet) => (
                    index,
                    self.call(index, now, "handle_read", |handler, ctx| {
                        handler.handle_read(ctx, packet)
                    }),
                ),
                Job::Write(index, packet) => (
                    index,
                    self.call(index, now, "handle_write", |handler, ctx| {
                        handler.handle_write(ctx, packet)
                    }),
                ),
            };
            self.enqueue_fired(&mut jobs, index, fired);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ErrPipelineClosed)
        } else {
            Ok(())
        }
    }
}

impl sansio::Protocol<DataPacket, DataPacket, MediaEvent> for Pipeline {
    type Rout = DataPacket;
    type Wout = DataPacket;
    type Eout = MediaEvent;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: DataPacket) -> Result<()> {
        self.check_open()?;
        if !self.finalized || self.inbound.is_empty() {
            trace!("pipeline has no inbound handler, dropping packet");
            return Ok(());
        }
        self.observe(msg.now);
        let now = msg.now;
        let mut jobs = VecDeque::new();
        self.enqueue_read(&mut jobs, None, msg);
        self.run(now, jobs);
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: DataPacket) -> Result<()> {
        self.check_open()?;
        if !self.finalized || self.outbound.is_empty() {
            trace!("pipeline has no outbound handler, dropping packet");
            return Ok(());
        }
        self.observe(msg.now);
        let now = msg.now;
        let mut jobs = VecDeque::new();
        self.enqueue_write(&mut jobs, None, msg);
        self.run(now, jobs);
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.write_outs.pop_front()
    }

    fn handle_event(&mut self, evt: MediaEvent) -> Result<()> {
        self.check_open()?;
        if !self.finalized {
            return Ok(());
        }
        let now = self.now();
        for index in 0..self.records.len() {
            let fired = self.call(index, now, "handle_event", |handler, ctx| {
                handler.handle_event(ctx, &evt)
            });
            self.route(now, index, fired);
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.check_open()?;
        self.observe(now);
        while let Some((_, task)) = self.worker.pop_due(now) {
            let Some(index) = self
                .records
                .iter()
                .position(|record| record.id == task.handler)
            else {
                continue;
            };
            let fired = self.call(index, now, "handle_timeout", |handler, ctx| {
                handler.handle_timeout(ctx, task.token)
            });
            self.route(now, index, fired);
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.worker.poll_timeout()
    }

    /// Detaches every handler head to tail, owners last, and drops them.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut close_errs = vec![];
        for owner_pass in [false, true] {
            for index in 0..self.records.len() {
                if self.records[index].owner != owner_pass {
                    continue;
                }
                if let Err(err) = self.detach(index) {
                    warn!("{}.detach got error: {}", self.records[index].name, err);
                    close_errs.push(err);
                }
            }
        }

        self.records.clear();
        self.inbound.clear();
        self.outbound.clear();
        self.worker = Worker::default();

        flatten_errs(close_errs)
    }
}
