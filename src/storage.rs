//! Counter storage.
//!
//! Provides:
//! - `CounterStore`: the single writer of the aggregate, owned by the listener
//! - `CounterHandle`: a read-only view of the aggregate for other threads
//! - `ListenerStats`: datagram/command accounting
//! - `LocalCounter` and `merge`: per-worker partial counts combined without a network

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Returned when an increment would overflow the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub current: i64,
    pub amount: i64,
}

impl std::fmt::Display for Overflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Adding {} to {} overflows", self.amount, self.current)
    }
}

impl std::error::Error for Overflow {}

/// Owner of the aggregate value.
///
/// Not `Clone`: exactly one store exists per server, and it lives on the
/// listener thread. Other threads observe the value through `CounterHandle`.
#[derive(Debug)]
pub struct CounterStore {
    value: Arc<AtomicI64>,
}

impl CounterStore {
    /// Create a store starting at zero.
    pub fn new() -> Self {
        Self {
            value: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Create a read-only handle to this store's value.
    pub fn handle(&self) -> CounterHandle {
        CounterHandle {
            value: Arc::clone(&self.value),
        }
    }

    /// Current aggregate.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Add `amount` to the aggregate, returning the new value.
    ///
    /// An overflowing addition is rejected and leaves the value unchanged.
    pub fn apply(&mut self, amount: i64) -> Result<i64, Overflow> {
        let current = self.get();
        let next = current
            .checked_add(amount)
            .ok_or(Overflow { current, amount })?;
        self.value.store(next, Ordering::Release);
        trace!(amount, value = next, "Applied increment");
        Ok(next)
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a `CounterStore`.
#[derive(Debug, Clone)]
pub struct CounterHandle {
    value: Arc<AtomicI64>,
}

impl CounterHandle {
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}

/// Listener accounting, written by the listener thread only.
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicU64,
    applied: AtomicU64,
    local: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of `ListenerStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Datagrams read from the socket
    pub received: u64,
    /// Datagrams decoded and applied
    pub applied: u64,
    /// Local increments applied
    pub local: u64,
    /// Datagrams or local increments dropped (decode failure or overflow)
    pub rejected: u64,
}

impl ListenerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_local(&self) {
        self.local.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            local: self.local.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Combine two partial counts.
///
/// Saturates at the `i64` bounds instead of wrapping.
pub fn merge(a: i64, b: i64) -> i64 {
    let sum = a.saturating_add(b);
    if a.checked_add(b).is_none() {
        warn!(a, b, "Counter merge saturated");
    }
    sum
}

/// Per-worker counter with no network and no sharing.
///
/// Workers return their `LocalCounter` to the aggregating thread, which
/// folds them together with `LocalCounter::merge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalCounter {
    value: i64,
}

impl LocalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increase(&mut self, amount: i64) {
        self.value = merge(self.value, amount);
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    /// Combine two counters into a new one, leaving both inputs untouched.
    pub fn merge(a: LocalCounter, b: LocalCounter) -> LocalCounter {
        LocalCounter {
            value: merge(a.value, b.value),
        }
    }
}
