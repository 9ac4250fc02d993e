//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent; the two process-wide gauges may briefly disagree
//! with the sum of every provider's `allocated_byte_count()`.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers use `get()`, which clamps negative
/// values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Address space reserved by every Virtual Block Provider in the process
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Pages committed by every Virtual Block Provider in the process
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

/// Point-in-time view of one size class, summed over every thread pool
/// plus the shared cache pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Bytes per unit, framing header included.
    pub unit_size: usize,
    pub units_per_page: usize,
    /// Pages currently subdivided by pools of this class.
    pub page_count: usize,
    /// Free units across thread pools and the cache.
    pub free_units: usize,
    /// Free units parked in the cache pool alone.
    pub cache_free_units: usize,
    /// Units handed out since construction.
    pub allocated: u64,
    /// Units returned since construction.
    pub freed: u64,
    /// Sum of each pool's own high-water mark of live units. A unit freed
    /// into a different pool than it came from still counts as live in its
    /// source pool, so this bounds the true class peak from above.
    pub peak_live_units: u64,
}

impl ClassStats {
    /// Units handed out and not yet returned.
    pub fn live_units(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }
}

/// Snapshot returned by `PoolMultiplexer::stats`.
#[derive(Clone, Debug, Default)]
pub struct MultiplexerStats {
    /// Bytes committed by the page source backing the multiplexer.
    pub committed_bytes: usize,
    /// Pool sets registered, bound to a thread or not.
    pub pool_sets: usize,
    /// Pool sets currently bound to a thread.
    pub attached_pool_sets: usize,
    pub classes: Vec<ClassStats>,
}

impl MultiplexerStats {
    pub fn live_units(&self) -> u64 {
        self.classes.iter().map(ClassStats::live_units).sum()
    }

    pub fn page_count(&self) -> usize {
        self.classes.iter().map(|c| c.page_count).sum()
    }
}
