//! Shared state registered on a pipeline and looked up by handlers.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// Target layers a receiver wants, changed from outside the pipeline.
#[derive(Debug, Default)]
pub struct LayerSelection {
    spatial: Cell<u8>,
    temporal: Cell<u8>,
    version: Cell<u64>,
}

impl LayerSelection {
    pub fn new(spatial: u8, temporal: u8) -> Self {
        Self {
            spatial: Cell::new(spatial),
            temporal: Cell::new(temporal),
            version: Cell::new(0),
        }
    }

    pub fn set_target(&self, spatial: u8, temporal: u8) {
        if self.target() != (spatial, temporal) {
            self.spatial.set(spatial);
            self.temporal.set(temporal);
            self.version.set(self.version.get() + 1);
        }
    }

    /// `(spatial, temporal)`.
    pub fn target(&self) -> (u8, u8) {
        (self.spatial.get(), self.temporal.get())
    }

    /// Bumped on every change of target.
    pub fn version(&self) -> u64 {
        self.version.get()
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StreamCounters {
    pub inbound_packets: u64,
    pub inbound_bytes: u64,
    pub outbound_packets: u64,
    pub outbound_bytes: u64,
    /// Packets resent from the send buffer in answer to NACKs.
    pub retransmitted_packets: u64,
    pub retransmitted_bytes: u64,
}

/// Per-SSRC packet and byte counters.
#[derive(Debug, Default)]
pub struct Stats {
    counters: RefCell<HashMap<u32, StreamCounters>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_inbound(&self, ssrc: u32, bytes: usize) {
        let mut counters = self.counters.borrow_mut();
        let entry = counters.entry(ssrc).or_default();
        entry.inbound_packets += 1;
        entry.inbound_bytes += bytes as u64;
    }

    pub fn record_outbound(&self, ssrc: u32, bytes: usize) {
        let mut counters = self.counters.borrow_mut();
        let entry = counters.entry(ssrc).or_default();
        entry.outbound_packets += 1;
        entry.outbound_bytes += bytes as u64;
    }

    pub fn record_retransmission(&self, ssrc: u32, bytes: usize) {
        let mut counters = self.counters.borrow_mut();
        let entry = counters.entry(ssrc).or_default();
        entry.retransmitted_packets += 1;
        entry.retransmitted_bytes += bytes as u64;
    }

    pub fn get(&self, ssrc: u32) -> StreamCounters {
        self.counters
            .borrow()
            .get(&ssrc)
            .copied()
            .unwrap_or_default()
    }

    pub fn ssrcs(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self.counters.borrow().keys().copied().collect();
        ssrcs.sort_unstable();
        ssrcs
    }
}
