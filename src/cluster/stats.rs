//! Membership event counters
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Diagnostic counters updated from concurrently invoked provider callbacks
#[derive(Debug, Default)]
pub struct EventCounters {
    pub joins: AtomicU64,
    pub leaves: AtomicU64,
    pub updates: AtomicU64,
}

impl EventCounters {
    pub fn record_join(&self) -> u64 {
        self.joins.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_leave(&self) -> u64 {
        self.leaves.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_update(&self) -> u64 {
        self.updates.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn freeze(&self) -> EventCounts {
        EventCounts {
            joins: self.joins.load(Ordering::Relaxed),
            leaves: self.leaves.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `EventCounters`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub joins: u64,
    pub leaves: u64,
    pub updates: u64,
}
