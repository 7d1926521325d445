//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., committed may briefly lag the sum of live heap bytes).
//! This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
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
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    #[inline]
    pub fn fetch_add(&self, val: usize, ordering: Ordering) -> usize {
        self.0.fetch_add(Self::delta(val), ordering).max(0).cast_unsigned()
    }
}

// Total address space reserved by heap growth providers
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Total physical memory committed by heap growth providers
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}
// Bytes held by in-use chunks, summed over every live heap
crate::sync::static_atomic! {
    pub static HEAP_IN_USE: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Process-wide snapshot of the diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub heap_in_use: usize,
}

impl GlobalStats {
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            total_reserved: TOTAL_RESERVED.get(),
            total_committed: TOTAL_COMMITTED.get(),
            heap_in_use: HEAP_IN_USE.get(),
        }
    }
}

/// Point-in-time statistics of a single heap.
///
/// `footprint` is the arena size currently obtained from the growth provider.
/// `in_use_bytes + free_bytes + top_size == footprint` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently obtained from the growth provider.
    pub footprint: usize,
    /// Largest footprint ever reached.
    pub max_footprint: usize,
    /// Sum of the sizes of in-use chunks, headers included.
    pub in_use_bytes: usize,
    /// Sum of the sizes of binned free chunks.
    pub free_bytes: usize,
    /// Size of the top chunk.
    pub top_size: usize,
    pub live_allocations: usize,
    pub free_chunks: usize,
    /// Successful calls into the growth provider.
    pub grow_count: u64,
    /// Successful trims that returned memory.
    pub trim_count: u64,
}
