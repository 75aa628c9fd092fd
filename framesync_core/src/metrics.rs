//! Rendezvous metrics
//! ==================
//!
//! Lock-free counters updated by sensor producer threads and read by the
//! coordination thread when it reports.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between every lane of one rendezvous queue.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    accepted: AtomicU64,
    overflow_drops: AtomicU64,
    future_rejects: AtomicU64,
    closed_pushes: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow_drop(&self) {
        self.overflow_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_future_reject(&self) {
        self.future_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed_push(&self) {
        self.closed_pushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> QueueStats {
        QueueStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            future_rejects: self.future_rejects.load(Ordering::Relaxed),
            closed_pushes: self.closed_pushes.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of [`QueueMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Records accepted into a lane
    pub accepted: u64,

    /// Oldest records evicted because a lane was full
    pub overflow_drops: u64,

    /// Records rejected for referencing an unissued step
    pub future_rejects: u64,

    /// Pushes after the lane was closed
    pub closed_pushes: u64,
}
