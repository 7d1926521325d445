use super::bins::SmallBins;
use super::chunk::{
    ALIGNMENT, Arena, CHUNK_OVERHEAD, MAX_REQUEST, MIN_CHUNK_SIZE, Offset, PAYLOAD_OFFSET,
    PREV_IN_USE, bit_index, is_small, least_bit, left_bits, pad_request, small_index,
    small_index_to_size,
};
use super::config::HeapConfig;
use super::error::{HeapError, InvalidFreeReason};
use super::growth::{HeapGrowth, VmGrowth};
use super::stats::{self, HeapStats};
use super::tree::TreeBins;
use super::vm::{PlatformVmOps, VmOps};
use fixedbitset::FixedBitSet;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Segregated-free-list heap over one contiguous, growable arena.
///
/// Requests below 256 bytes are served from exact-size LIFO bins, larger ones
/// by best fit from the tree bins, and everything else is carved from the top
/// chunk at the end of the arena, growing it through `G` when needed. Freed
/// chunks merge with free neighbours immediately, so no two free chunks are
/// ever adjacent.
///
/// A heap is single-threaded; wrap it in a [`LockedHeap`](super::global::LockedHeap)
/// to share it.
pub struct Heap<G: HeapGrowth = VmGrowth> {
    growth: G,
    config: HeapConfig,
    granularity: usize,
    page_size: usize,

    arena: Arena,
    top: Offset,
    top_size: usize,
    small: SmallBins,
    tree: TreeBins,

    // One bit per 8-byte unit, set at the payload offset of every live chunk.
    live: FixedBitSet,
    poisoned: bool,

    in_use_bytes: usize,
    live_allocations: usize,
    free_chunks: usize,
    max_footprint: usize,
    grow_count: u64,
    trim_count: u64,
}

// Safety: the heap exclusively owns its arena and growth provider, so moving
// it to another thread moves that ownership along.
unsafe impl<G: HeapGrowth + Send> Send for Heap<G> {}

impl Heap<VmGrowth> {
    /// Creates a heap over a fresh `VmGrowth` reservation of
    /// `config.reserve_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::InvalidConfig` if `config` does not validate.
    pub fn with_vm(config: HeapConfig) -> Result<Self, HeapError> {
        config.validate(PlatformVmOps::page_size())?;
        Ok(Self::build(VmGrowth::new(config.reserve_size), config))
    }

    /// Creates a heap over `growth` with the default configuration. No memory
    /// is obtained until the first allocation.
    ///
    /// Other providers go through [`with_config`](Heap::with_config), which
    /// checks their page size.
    #[must_use]
    pub fn new(growth: VmGrowth) -> Self {
        Self::build(growth, HeapConfig::default())
    }
}

impl<G: HeapGrowth> Heap<G> {
    /// Creates a heap with `config`.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::InvalidConfig` if `config` does not validate
    /// against the provider's page size.
    pub fn with_config(growth: G, config: HeapConfig) -> Result<Self, HeapError> {
        config.validate(growth.page_size())?;
        Ok(Self::build(growth, config))
    }

    fn build(growth: G, config: HeapConfig) -> Self {
        let page_size = growth.page_size();
        let granularity = config.resolved_granularity(page_size);
        log::debug!(
            "heap created: granularity {granularity:#x}, trim threshold {:#x}",
            config.trim_threshold
        );
        Self {
            growth,
            config,
            granularity,
            page_size,
            arena: Arena::empty(),
            top: 0,
            top_size: 0,
            small: SmallBins::new(),
            tree: TreeBins::new(),
            live: FixedBitSet::new(),
            poisoned: false,
            in_use_bytes: 0,
            live_allocations: 0,
            free_chunks: 0,
            max_footprint: 0,
            grow_count: 0,
            trim_count: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub fn growth(&self) -> &G {
        &self.growth
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn growth_mut(&mut self) -> &mut G {
        &mut self.growth
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Allocates at least `size` bytes, 8-byte aligned. A zero-byte request
    /// gets a minimum chunk.
    ///
    /// # Errors
    ///
    /// - `OutOfMemory` if the arena cannot grow enough or `size` is too large
    ///   to represent. The heap stays usable.
    /// - `StructuralCorruption` if a free list turns out to be damaged.
    /// - `Poisoned` after an earlier fatal error.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.ensure_usable()?;
        let result = self.allocate_inner(size);
        self.poison_on_fatal(result)
    }

    /// Like [`allocate`](Self::allocate), with the first `size` bytes zeroed.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.allocate(size)?;
        // Safety: the payload of a fresh chunk holds at least `size` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Returns a live allocation to the heap.
    ///
    /// The address is checked against the live-payload map before any header
    /// is trusted, so a foreign, interior or already released address is
    /// reported instead of corrupting the heap.
    ///
    /// # Errors
    ///
    /// - `InvalidFree` if `ptr` is not the payload of a live allocation.
    /// - `StructuralCorruption` if merging meets a damaged neighbour.
    /// - `Poisoned` after an earlier fatal error.
    ///
    /// Both fatal errors poison the heap.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.ensure_usable()?;
        let result = self.release_inner(ptr);
        self.poison_on_fatal(result)
    }

    /// Resizes a live allocation, in place when the chunk already fits, its
    /// successor is free, or it borders the top chunk; otherwise moves it.
    /// On failure the original allocation is untouched.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate) and [`release`](Self::release).
    pub fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        self.ensure_usable()?;
        let result = self.reallocate_inner(ptr, new_size);
        self.poison_on_fatal(result)
    }

    /// Bytes usable at `ptr`, at least what was requested.
    ///
    /// # Errors
    ///
    /// `InvalidFree` if `ptr` is not live. A failed query does not poison.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        self.ensure_usable()?;
        let c = self.live_chunk(ptr)?;
        Ok(self.arena.size(c) - CHUNK_OVERHEAD)
    }

    /// Returns whole pages at the end of the top chunk to the provider,
    /// keeping `trim_retain` bytes. Returns true if anything was released.
    pub fn trim(&mut self) -> bool {
        if self.poisoned {
            return false;
        }
        self.trim_to(self.config.trim_retain)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let footprint = self.arena.len();
        HeapStats {
            footprint,
            max_footprint: self.max_footprint,
            in_use_bytes: self.in_use_bytes,
            free_bytes: footprint - self.in_use_bytes - self.top_size,
            top_size: self.top_size,
            live_allocations: self.live_allocations,
            free_chunks: self.free_chunks,
            grow_count: self.grow_count,
            trim_count: self.trim_count,
        }
    }

    /// Verifies every chunk, bin and tree invariant.
    ///
    /// # Errors
    ///
    /// `StructuralCorruption` describing the first violation found; this
    /// poisons the heap.
    pub fn check(&mut self) -> Result<(), HeapError> {
        self.ensure_usable()?;
        let result = self.verify();
        self.poison_on_fatal(result)
    }

    /// Walks the arena in address order, ending with the top chunk.
    #[must_use]
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            arena: self.arena,
            top: self.top,
            top_size: self.top_size,
            at: 0,
            done: false,
            _heap: PhantomData,
        }
    }

    // ------------------------------------------------------------------
    // Allocation path
    // ------------------------------------------------------------------

    fn ensure_usable(&self) -> Result<(), HeapError> {
        if self.poisoned { Err(HeapError::Poisoned) } else { Ok(()) }
    }

    fn poison_on_fatal<T>(&mut self, result: Result<T, HeapError>) -> Result<T, HeapError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("heap disabled: {e}");
                self.poisoned = true;
            }
        }
        result
    }

    fn allocate_inner(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size > MAX_REQUEST {
            return Err(HeapError::out_of_memory(size));
        }
        let nb = pad_request(size);
        let c = self.take_chunk(nb, size)?;
        Ok(self.mark_live(c))
    }

    fn take_chunk(&mut self, nb: usize, requested: usize) -> Result<Offset, HeapError> {
        let a = self.arena;
        if is_small(nb) {
            let idx = small_index(nb);
            if self.small.is_marked(idx) {
                let c = self.small.pop(a, idx)?;
                self.free_chunks -= 1;
                a.set_in_use_and_prev_in_use(c, nb);
                return Ok(c);
            }

            let larger = self.small.map() & left_bits(1 << idx);
            if larger != 0 {
                let i = bit_index(least_bit(larger));
                let c = self.small.pop(a, i)?;
                self.free_chunks -= 1;
                self.split(c, small_index_to_size(i), nb)?;
                return Ok(c);
            }

            if let Some(c) = self.tree.take_smallest(a)? {
                self.free_chunks -= 1;
                log::trace!("small request {nb:#x} served from tree chunk {c:#x}");
                self.split(c, a.size(c), nb)?;
                return Ok(c);
            }
        } else if let Some(c) = self.tree.take_best_fit(a, nb)? {
            self.free_chunks -= 1;
            log::trace!("best fit {c:#x} ({:#x} bytes) for {nb:#x}", a.size(c));
            self.split(c, a.size(c), nb)?;
            return Ok(c);
        }

        self.take_from_top(nb, requested)
    }

    /// Hands out the first `nb` bytes of free chunk `c` and bins the rest when
    /// it can stand as a chunk of its own.
    fn split(&mut self, c: Offset, csize: usize, nb: usize) -> Result<(), HeapError> {
        let a = self.arena;
        let rem = csize - nb;
        if rem < MIN_CHUNK_SIZE {
            a.set_in_use_and_prev_in_use(c, csize);
        } else {
            a.set_in_use_head(c, nb);
            let r = c + nb;
            a.set_free(r, rem);
            self.bin_chunk(r, rem)?;
        }
        Ok(())
    }

    fn take_from_top(&mut self, nb: usize, requested: usize) -> Result<Offset, HeapError> {
        if self.top_size < nb + MIN_CHUNK_SIZE {
            self.grow(nb, requested)?;
        }
        let a = self.arena;
        let c = self.top;
        self.top = c + nb;
        self.top_size -= nb;
        a.set_head(self.top, self.top_size | PREV_IN_USE);
        a.set_in_use_head(c, nb);
        Ok(c)
    }

    /// Extends the arena so the top chunk can give `nb` bytes and still keep
    /// a minimum chunk.
    fn grow(&mut self, nb: usize, requested: usize) -> Result<(), HeapError> {
        let needed = nb + MIN_CHUNK_SIZE - self.top_size;
        let bytes = needed
            .checked_add(self.config.top_pad)
            .and_then(|n| n.checked_next_multiple_of(self.granularity))
            .ok_or_else(|| HeapError::out_of_memory(requested))?;

        let span = match self.growth.grow(bytes) {
            Ok(span) => span,
            Err(e) => {
                log::warn!("heap growth by {bytes:#x} bytes failed: {e}");
                return Err(HeapError::OutOfMemory {
                    requested,
                    source: Some(e),
                });
            }
        };

        if self.arena.is_empty() {
            if !(span.as_ptr() as usize).is_multiple_of(ALIGNMENT) {
                log::warn!("growth provider returned a misaligned span at {span:p}");
                self.give_back(bytes);
                return Err(HeapError::out_of_memory(requested));
            }
            self.arena = Arena::new(span, bytes);
            log::debug!("heap arena created at {span:p} with {bytes:#x} bytes");
        } else {
            let expected = self.arena.base_addr() + self.arena.len();
            if span.as_ptr() as usize != expected {
                log::warn!(
                    "growth provider returned {span:p}, not contiguous with arena end {expected:#x}"
                );
                self.give_back(bytes);
                return Err(HeapError::out_of_memory(requested));
            }
            self.arena = Arena::new(self.arena.base(), self.arena.len() + bytes);
            log::debug!("heap grew by {bytes:#x} bytes to {:#x}", self.arena.len());
        }

        self.top_size += bytes;
        self.arena.set_head(self.top, self.top_size | PREV_IN_USE);
        self.live.grow(self.arena.len() / ALIGNMENT);
        self.max_footprint = self.max_footprint.max(self.arena.len());
        self.grow_count += 1;
        Ok(())
    }

    fn give_back(&mut self, bytes: usize) {
        if let Err(e) = self.growth.shrink(bytes) {
            log::warn!("could not return an unusable span of {bytes:#x} bytes: {e}");
        }
    }

    fn mark_live(&mut self, c: Offset) -> NonNull<u8> {
        let a = self.arena;
        let size = a.size(c);
        let payload = c + PAYLOAD_OFFSET;
        self.live.insert(payload / ALIGNMENT);
        self.in_use_bytes += size;
        self.live_allocations += 1;
        stats::HEAP_IN_USE.add(size);
        a.ptr_at(payload)
    }

    fn unmark_live(&mut self, c: Offset, size: usize) {
        self.live.set((c + PAYLOAD_OFFSET) / ALIGNMENT, false);
        self.in_use_bytes -= size;
        self.live_allocations -= 1;
        stats::sub_saturating(&stats::HEAP_IN_USE, size);
    }

    fn resize_accounting(&mut self, old: usize, new: usize) {
        self.in_use_bytes = self.in_use_bytes - old + new;
        if new > old {
            stats::HEAP_IN_USE.add(new - old);
        } else {
            stats::sub_saturating(&stats::HEAP_IN_USE, old - new);
        }
    }

    fn bin_chunk(&mut self, c: Offset, size: usize) -> Result<(), HeapError> {
        if is_small(size) {
            self.small.push(self.arena, c, size);
        } else {
            self.tree.insert(self.arena, c, size)?;
        }
        self.free_chunks += 1;
        Ok(())
    }

    fn unbin_chunk(&mut self, c: Offset, size: usize) -> Result<(), HeapError> {
        if is_small(size) {
            self.small.unlink(self.arena, c, size)?;
        } else {
            self.tree.unlink(self.arena, c)?;
        }
        self.free_chunks -= 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Free path
    // ------------------------------------------------------------------

    /// Maps `ptr` to the chunk of a live allocation.
    fn live_chunk(&self, ptr: NonNull<u8>) -> Result<Offset, HeapError> {
        let addr = ptr.as_ptr() as usize;
        let invalid = |reason| HeapError::InvalidFree { addr, reason };
        let a = self.arena;
        let base = a.base_addr();

        if a.is_empty() || addr < base + PAYLOAD_OFFSET || addr - base >= a.len() {
            return Err(invalid(InvalidFreeReason::OutOfBounds));
        }
        let payload = addr - base;
        if !payload.is_multiple_of(ALIGNMENT) {
            return Err(invalid(InvalidFreeReason::Misaligned));
        }
        if !self.live.contains(payload / ALIGNMENT) {
            return Err(invalid(InvalidFreeReason::NotLive));
        }

        let c = payload - PAYLOAD_OFFSET;
        let size = a.size(c);
        let fits = c.checked_add(size).is_some_and(|end| end <= self.top);
        if !a.in_use(c) || size < MIN_CHUNK_SIZE || !fits {
            return Err(invalid(InvalidFreeReason::CorruptHeader));
        }
        Ok(c)
    }

    fn release_inner(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let c = self.live_chunk(ptr)?;
        let size = self.arena.size(c);
        self.unmark_live(c, size);
        self.free_chunk(c, size)
    }

    /// Merges in-use chunk `c` with its free neighbours and bins the result,
    /// or folds it into the top chunk.
    fn free_chunk(&mut self, c: Offset, size: usize) -> Result<(), HeapError> {
        let a = self.arena;
        let mut p = c;
        let mut psize = size;

        if !a.prev_in_use(p) {
            let prevsize = a.prev_size(p);
            let prev = p
                .checked_sub(prevsize)
                .filter(|&q| prevsize >= MIN_CHUNK_SIZE && a.contains_chunk(q))
                .ok_or_else(|| HeapError::corruption(p, "prev_size points outside the arena"))?;
            if a.size(prev) != prevsize || a.in_use(prev) {
                return Err(HeapError::corruption(
                    prev,
                    "free predecessor header disagrees with its footer",
                ));
            }
            self.unbin_chunk(prev, prevsize)?;
            p = prev;
            psize += prevsize;
        }

        let next = p + psize;
        if next == self.top {
            self.top = p;
            self.top_size += psize;
            a.set_head(p, self.top_size | PREV_IN_USE);
            if self.top_size > self.config.trim_threshold {
                self.trim_to(self.config.trim_retain);
            }
            return Ok(());
        }

        if a.in_use(next) {
            a.clear_prev_in_use(next);
        } else {
            let nsize = a.size(next);
            self.unbin_chunk(next, nsize)?;
            psize += nsize;
        }
        a.set_free(p, psize);
        self.bin_chunk(p, psize)
    }

    // ------------------------------------------------------------------
    // Reallocation
    // ------------------------------------------------------------------

    fn reallocate_inner(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        let c = self.live_chunk(ptr)?;
        if new_size > MAX_REQUEST {
            return Err(HeapError::out_of_memory(new_size));
        }
        let nb = pad_request(new_size);
        if self.resize_in_place(c, nb, new_size)? {
            return Ok(ptr);
        }

        let old_usable = self.arena.size(c) - CHUNK_OVERHEAD;
        let fresh = self.allocate_inner(new_size)?;
        // Safety: both are payloads of distinct live chunks in the same arena,
        // each at least as long as the copied length.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_usable.min(new_size));
        }
        let size = self.arena.size(c);
        self.unmark_live(c, size);
        self.free_chunk(c, size)?;
        Ok(fresh)
    }

    /// Tries to make live chunk `c` exactly `nb` bytes without moving it.
    fn resize_in_place(&mut self, c: Offset, nb: usize, requested: usize) -> Result<bool, HeapError> {
        let a = self.arena;
        let old = a.size(c);

        if old >= nb {
            let rem = old - nb;
            if rem >= MIN_CHUNK_SIZE {
                a.set_in_use(c, nb);
                let r = c + nb;
                a.set_in_use_and_prev_in_use(r, rem);
                self.resize_accounting(old, nb);
                self.free_chunk(r, rem)?;
                log::trace!("shrunk chunk {c:#x} in place from {old:#x} to {nb:#x}");
            }
            return Ok(true);
        }

        let next = c + old;
        let extra = nb - old;

        if next == self.top {
            if self.top_size < extra + MIN_CHUNK_SIZE && self.grow(extra, requested).is_err() {
                // A move may still find room in the bins.
                return Ok(false);
            }
            let a = self.arena;
            a.set_in_use(c, nb);
            self.top = c + nb;
            self.top_size -= extra;
            a.set_head(self.top, self.top_size | PREV_IN_USE);
            self.resize_accounting(old, nb);
            log::trace!("grew chunk {c:#x} into top from {old:#x} to {nb:#x}");
            return Ok(true);
        }

        if !a.in_use(next) {
            let nsize = a.size(next);
            if old + nsize >= nb {
                self.unbin_chunk(next, nsize)?;
                let total = old + nsize;
                let rem = total - nb;
                if rem >= MIN_CHUNK_SIZE {
                    a.set_in_use(c, nb);
                    let r = c + nb;
                    a.set_free(r, rem);
                    self.bin_chunk(r, rem)?;
                } else {
                    a.set_in_use(c, total);
                }
                self.resize_accounting(old, a.size(c));
                log::trace!("grew chunk {c:#x} into free successor, now {:#x}", a.size(c));
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Trim
    // ------------------------------------------------------------------

    fn trim_to(&mut self, retain: usize) -> bool {
        if self.arena.is_empty() {
            return false;
        }
        let keep = MIN_CHUNK_SIZE.saturating_add(retain);
        if self.top_size <= keep {
            return false;
        }
        let extra = (self.top_size - keep) / self.page_size * self.page_size;
        if extra == 0 {
            return false;
        }
        match self.growth.shrink(extra) {
            Ok(()) => {
                self.arena = Arena::new(self.arena.base(), self.arena.len() - extra);
                self.top_size -= extra;
                self.arena.set_head(self.top, self.top_size | PREV_IN_USE);
                self.trim_count += 1;
                log::debug!(
                    "heap trimmed {extra:#x} bytes, footprint now {:#x}",
                    self.arena.len()
                );
                true
            }
            Err(e) => {
                log::warn!("heap trim of {extra:#x} bytes failed: {e}");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    fn verify(&self) -> Result<(), HeapError> {
        let a = self.arena;
        if a.is_empty() {
            if self.small.map() != 0 || self.tree.map() != 0 || self.live_allocations != 0 {
                return Err(HeapError::corruption(0, "empty heap holds chunks"));
            }
            return Ok(());
        }

        let top = self.top;
        if !a.contains_chunk(top)
            || top + self.top_size != a.len()
            || self.top_size < MIN_CHUNK_SIZE
            || a.size(top) != self.top_size
        {
            return Err(HeapError::corruption(top, "top chunk is inconsistent"));
        }

        let mut c = 0;
        let mut prev_free = false;
        let mut free_chunks = 0;
        let mut free_bytes = 0;
        let mut in_use = 0;
        let mut live = 0;
        while c < top {
            let size = a.size(c);
            if size < MIN_CHUNK_SIZE || c + size > top {
                return Err(HeapError::corruption(c, "chunk size runs past the top chunk"));
            }
            if a.prev_in_use(c) == prev_free {
                return Err(HeapError::corruption(c, "PREV_IN_USE disagrees with predecessor"));
            }
            let live_bit = self.live.contains((c + PAYLOAD_OFFSET) / ALIGNMENT);
            if a.in_use(c) {
                if !live_bit {
                    return Err(HeapError::corruption(c, "in-use chunk is not marked live"));
                }
                in_use += size;
                live += 1;
                prev_free = false;
            } else {
                if prev_free {
                    return Err(HeapError::corruption(c, "adjacent free chunks"));
                }
                if live_bit {
                    return Err(HeapError::corruption(c, "free chunk is marked live"));
                }
                if a.prev_size(c + size) != size {
                    return Err(HeapError::corruption(c, "footer disagrees with header"));
                }
                free_chunks += 1;
                free_bytes += size;
                prev_free = true;
            }
            c += size;
        }
        if c != top || prev_free || !a.prev_in_use(top) {
            return Err(HeapError::corruption(top, "chunk walk does not end cleanly at top"));
        }

        let (small_count, small_bytes) = self.small.verify(a)?;
        let (tree_count, tree_bytes) = self.tree.verify(a)?;
        if small_count + tree_count != free_chunks
            || small_bytes + tree_bytes != free_bytes
            || free_chunks != self.free_chunks
        {
            return Err(HeapError::corruption(0, "binned chunks disagree with the arena walk"));
        }
        if in_use != self.in_use_bytes
            || live != self.live_allocations
            || self.live.count_ones(..) != live
        {
            return Err(HeapError::corruption(0, "usage counters disagree with the arena walk"));
        }
        Ok(())
    }
}

impl<G: HeapGrowth> Drop for Heap<G> {
    fn drop(&mut self) {
        stats::sub_saturating(&stats::HEAP_IN_USE, self.in_use_bytes);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    InUse,
    Free,
    Top,
}

/// One chunk seen by [`Heap::chunks`]. `offset` is relative to the arena base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub offset: usize,
    pub size: usize,
    pub kind: ChunkKind,
}

/// Address-order iterator over a heap's chunks.
pub struct Chunks<'a> {
    arena: Arena,
    top: Offset,
    top_size: usize,
    at: Offset,
    done: bool,
    _heap: PhantomData<&'a ()>,
}

impl Iterator for Chunks<'_> {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<ChunkInfo> {
        if self.done {
            return None;
        }
        if self.at == self.top {
            self.done = true;
            if self.arena.is_empty() {
                return None;
            }
            return Some(ChunkInfo {
                offset: self.top,
                size: self.top_size,
                kind: ChunkKind::Top,
            });
        }
        let size = self.arena.size(self.at);
        if size < MIN_CHUNK_SIZE || self.at + size > self.top {
            self.done = true;
            return None;
        }
        let kind = if self.arena.in_use(self.at) {
            ChunkKind::InUse
        } else {
            ChunkKind::Free
        };
        let info = ChunkInfo {
            offset: self.at,
            size,
            kind,
        };
        self.at += size;
        Some(info)
    }
}
