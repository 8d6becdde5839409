//! Ticket factory counters.
//!
//! All counters are independent and monotonically increasing, so every
//! update uses `Ordering::Relaxed`. A [`MetricsSnapshot`] reads them one by
//! one and may be slightly inconsistent across counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters maintained by a [`TgtFactory`](crate::TgtFactory).
#[derive(Debug, Default)]
pub struct FactoryMetrics {
    created: AtomicU64,
    updated: AtomicU64,
    removed: AtomicU64,
    expired: AtomicU64,
    capacity_rejections: AtomicU64,
    id_collisions: AtomicU64,
    listener_failures: AtomicU64,
    sweeps: AtomicU64,
}

/// Point-in-time copy of [`FactoryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Tickets persisted for the first time.
    pub created: u64,
    /// Live tickets persisted again.
    pub updated: u64,
    /// Tickets removed on explicit logout or `clean`.
    pub removed: u64,
    /// Tickets removed because they expired.
    pub expired: u64,
    /// New tickets rejected by the capacity limit.
    pub capacity_rejections: u64,
    /// Generated IDs that collided with an existing ticket.
    pub id_collisions: u64,
    /// Individual listener failures observed.
    pub listener_failures: u64,
    /// Completed reaper sweeps.
    pub sweeps: u64,
}

impl FactoryMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_updated(&self) {
        self.updated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removed(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_capacity_rejection(&self) {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_id_collision(&self) {
        self.id_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_listener_failures(&self, count: usize) {
        self.listener_failures.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            id_collisions: self.id_collisions.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}
