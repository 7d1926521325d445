use super::chunk::{ALIGNMENT, WORD};
use super::config::HeapConfig;
use super::error::HeapError;
use super::growth::{HeapGrowth, VmGrowth};
use super::heap::Heap;
use super::stats::HeapStats;
use crate::sync::{Mutex, OnceLock};
use std::alloc::Layout;
use std::ptr::NonNull;

/// A heap behind a mutex, shareable between threads.
///
/// Every operation holds the lock for its whole duration; the heap itself
/// stays single-threaded.
pub struct LockedHeap<G: HeapGrowth = VmGrowth> {
    inner: Mutex<Heap<G>>,
}

impl<G: HeapGrowth> LockedHeap<G> {
    pub fn new(heap: Heap<G>) -> Self {
        Self {
            inner: Mutex::new(heap),
        }
    }

    /// Runs `f` with exclusive access to the heap.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<G>) -> R) -> R {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Allocates memory for `layout`.
    ///
    /// Alignments up to 8 come straight from the heap. Larger ones are served
    /// by over-allocating and keeping the heap's address in the word just
    /// below the aligned pointer.
    ///
    /// # Errors
    ///
    /// Same as [`Heap::allocate`]; `OutOfMemory` also covers layouts whose
    /// padded size overflows.
    pub fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if layout.align() <= ALIGNMENT {
            return self.with_heap(|heap| heap.allocate(layout.size()));
        }
        let total = layout
            .size()
            .checked_add(layout.align())
            .and_then(|n| n.checked_add(WORD))
            .ok_or_else(|| HeapError::out_of_memory(layout.size()))?;
        let raw = self.with_heap(|heap| heap.allocate(total))?;

        let aligned = (raw.as_ptr() as usize + WORD).next_multiple_of(layout.align());
        let offset = aligned - raw.as_ptr() as usize;
        // Safety: `offset + layout.size() <= total`, and the back-pointer word
        // sits at `offset - WORD >= 0`, 8-aligned since both addresses are.
        unsafe {
            let ptr = raw.as_ptr().add(offset);
            ptr.sub(WORD).cast::<*mut u8>().write(raw.as_ptr());
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    /// Releases memory obtained from [`alloc`](Self::alloc).
    ///
    /// # Errors
    ///
    /// Same as [`Heap::release`].
    ///
    /// # Safety
    ///
    /// If `layout.align() > 8`, `ptr` must have come from `alloc` with the
    /// same alignment, since its back-pointer word is read unchecked.
    pub unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) -> Result<(), HeapError> {
        let raw = if layout.align() <= ALIGNMENT {
            ptr
        } else {
            // Safety: the caller guarantees the word below `ptr` is ours.
            let raw = unsafe { ptr.as_ptr().sub(WORD).cast::<*mut u8>().read() };
            NonNull::new(raw).ok_or(HeapError::InvalidFree {
                addr: ptr.as_ptr() as usize,
                reason: super::error::InvalidFreeReason::CorruptHeader,
            })?
        };
        self.with_heap(|heap| heap.release(raw))
    }

    pub fn trim(&self) -> bool {
        self.with_heap(Heap::trim)
    }

    pub fn stats(&self) -> HeapStats {
        self.with_heap(|heap| heap.stats())
    }
}

// Safety: null is returned on every failure, and blocks never overlap because
// the heap hands out disjoint chunks under the lock. The live map grows through
// the system allocator, so this impl must not be installed as
// `#[global_allocator]`.
unsafe impl<G: HeapGrowth + Send> std::alloc::GlobalAlloc for LockedHeap<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match LockedHeap::alloc(self, layout) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: the caller passes the layout used to allocate `ptr`.
            // A failed release leaves the heap poisoned and already logged.
            let _ = unsafe { LockedHeap::free(self, ptr, layout) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return std::ptr::null_mut();
        };
        if layout.align() <= ALIGNMENT {
            return match self.with_heap(|heap| heap.reallocate(old, new_size)) {
                Ok(p) => p.as_ptr(),
                Err(_) => std::ptr::null_mut(),
            };
        }

        // Safety: the caller guarantees `new_size`, rounded to `layout.align()`,
        // does not overflow.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let Ok(fresh) = LockedHeap::alloc(self, new_layout) else {
            return std::ptr::null_mut();
        };
        // Safety: distinct live blocks, each at least `min` bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), layout.size().min(new_size));
            let _ = LockedHeap::free(self, old, layout);
        }
        fresh.as_ptr()
    }
}

static GLOBAL_HEAP: OnceLock<LockedHeap<VmGrowth>> = OnceLock::new();

/// Process-wide heap over a `VmGrowth` reservation.
///
/// Created on first use with [`HeapConfig::default`] unless [`init`](Self::init)
/// or [`init_with_config`](Self::init_with_config) ran first.
///
/// The heap keeps its live-allocation map in memory from the system
/// allocator, so `GlobalHeap` must not itself be installed as
/// `#[global_allocator]`.
pub struct GlobalHeap;

impl GlobalHeap {
    /// Installs the process-wide heap with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::InvalidConfig` if the heap already exists.
    pub fn init() -> Result<(), HeapError> {
        Self::init_with_config(HeapConfig::default())
    }

    /// Installs the process-wide heap with `config`.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::InvalidConfig` if `config` does not validate or the
    /// heap already exists.
    pub fn init_with_config(config: HeapConfig) -> Result<(), HeapError> {
        let heap = Heap::with_vm(config)?;
        GLOBAL_HEAP
            .set(LockedHeap::new(heap))
            .map_err(|_| HeapError::InvalidConfig("global heap already initialized".to_string()))
    }

    pub fn get() -> &'static LockedHeap<VmGrowth> {
        GLOBAL_HEAP.get_or_init(|| LockedHeap::new(Heap::new(VmGrowth::default())))
    }

    /// # Errors
    ///
    /// See [`LockedHeap::alloc`].
    pub fn alloc(layout: Layout) -> Result<NonNull<u8>, HeapError> {
        Self::get().alloc(layout)
    }

    /// # Errors
    ///
    /// See [`LockedHeap::free`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc) with the same `layout`.
    pub unsafe fn free(ptr: NonNull<u8>, layout: Layout) -> Result<(), HeapError> {
        // Safety: forwarded from the caller.
        unsafe { Self::get().free(ptr, layout) }
    }

    pub fn trim() -> bool {
        Self::get().trim()
    }

    pub fn stats() -> HeapStats {
        Self::get().stats()
    }
}

// Safety: forwards to the process-wide `LockedHeap`, which upholds the
// `GlobalAlloc` contract while the system allocator stays installed. Under
// `#[global_allocator]` the live map's `FixedBitSet::grow` would allocate
// through this impl while the heap mutex is held, re-entering the lock. Use it
// as an explicit allocator handle only.
unsafe impl std::alloc::GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Safety: forwarded from the caller.
        unsafe { std::alloc::GlobalAlloc::alloc(Self::get(), layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Safety: forwarded from the caller.
        unsafe { std::alloc::GlobalAlloc::dealloc(Self::get(), ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Safety: forwarded from the caller.
        unsafe { std::alloc::GlobalAlloc::realloc(Self::get(), ptr, layout, new_size) }
    }
}
