use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::Ordering;
use std::ptr::NonNull;

/// Source of contiguous memory for a heap arena.
///
/// The heap asks for more memory with [`grow`](Self::grow) and expects every
/// span after the first to start exactly where the previous one ended. It hands
/// memory back from the end with [`shrink`](Self::shrink).
///
/// # Safety
///
/// Implementors must guarantee that a successful `grow(n)` returns a pointer
/// to `n` readable and writable bytes, 8-byte aligned, that stay valid and
/// unaliased until they are given back by `shrink` or the provider is dropped.
/// `page_size` must return the same value for the provider's whole lifetime.
pub unsafe trait HeapGrowth {
    /// Extends the memory by `bytes` (a multiple of the page size) and
    /// returns the start of the new span.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if no more memory can be obtained.
    fn grow(&mut self, bytes: usize) -> Result<NonNull<u8>, VmError>;

    /// Gives back the last `bytes` (a multiple of the page size).
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the memory could not be returned; the heap keeps
    /// using it in that case.
    fn shrink(&mut self, bytes: usize) -> Result<(), VmError>;

    /// Unit of growth and shrinkage. A heap refuses to build over a provider
    /// whose page size is not a power of two of at least 8 bytes.
    fn page_size(&self) -> usize;
}

/// Grows a heap inside a single virtual-memory reservation.
///
/// The address range is reserved on the first `grow` and committed front to
/// back on demand, so every span is contiguous with the previous one.
pub struct VmGrowth {
    base: Option<NonNull<u8>>,
    reserved: usize,
    committed: usize,
}

// Safety: VmGrowth owns its reservation exclusively.
unsafe impl Send for VmGrowth {}

impl VmGrowth {
    /// Creates a provider that will reserve `reserve_size` bytes (rounded up
    /// to the page size) the first time it grows. A size too large to round
    /// is clamped to the last whole page, and the reservation then fails.
    #[must_use]
    pub fn new(reserve_size: usize) -> Self {
        let page_size = PlatformVmOps::page_size();
        let reserved = reserve_size
            .max(1)
            .checked_next_multiple_of(page_size)
            .unwrap_or(usize::MAX - (page_size - 1));
        Self {
            base: None,
            reserved,
            committed: 0,
        }
    }

    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed
    }

    fn ensure_reserved(&mut self) -> Result<NonNull<u8>, VmError> {
        if let Some(base) = self.base {
            return Ok(base);
        }
        // Safety: FFI call to reserve.
        let base = unsafe { PlatformVmOps::reserve(self.reserved)? };
        stats::TOTAL_RESERVED.fetch_add(self.reserved, Ordering::Relaxed);
        log::debug!("reserved {:#x} bytes of address space at {base:p}", self.reserved);
        self.base = Some(base);
        Ok(base)
    }
}

impl Default for VmGrowth {
    fn default() -> Self {
        Self::new(super::config::HeapConfig::DEFAULT_RESERVE_SIZE)
    }
}

// Safety: spans are committed inside one reservation, in order, and only
// decommitted from the end.
unsafe impl HeapGrowth for VmGrowth {
    fn grow(&mut self, bytes: usize) -> Result<NonNull<u8>, VmError> {
        let base = self.ensure_reserved()?;
        let page_size = PlatformVmOps::page_size();
        let bytes = bytes.next_multiple_of(page_size);

        let target_commit = self.committed.checked_add(bytes).ok_or_else(|| {
            VmError::CommitFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "VmGrowth commit size overflow",
            ))
        })?;
        if target_commit > self.reserved {
            return Err(VmError::CommitFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "VmGrowth exhausted reserved space",
            )));
        }

        let commit_start =
            // Safety: committed offset is within reserved range.
            unsafe { NonNull::new_unchecked(base.as_ptr().add(self.committed)) };

        // Safety: FFI call to commit; the range lies inside the reservation.
        unsafe {
            PlatformVmOps::commit(commit_start, bytes)?;
        }

        stats::TOTAL_COMMITTED.fetch_add(bytes, Ordering::Relaxed);
        self.committed = target_commit;
        Ok(commit_start)
    }

    fn shrink(&mut self, bytes: usize) -> Result<(), VmError> {
        let Some(base) = self.base else {
            return Err(VmError::DecommitFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "VmGrowth shrink before any growth",
            )));
        };
        if bytes > self.committed || !bytes.is_multiple_of(PlatformVmOps::page_size()) {
            return Err(VmError::DecommitFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "VmGrowth cannot shrink {bytes:#x} bytes of {:#x} committed",
                    self.committed
                ),
            )));
        }
        let retain = self.committed - bytes;
        // Safety: retain offset is within committed range.
        let decommit_start = unsafe { NonNull::new_unchecked(base.as_ptr().add(retain)) };

        // Safety: FFI call to decommit memory the heap no longer uses.
        unsafe {
            PlatformVmOps::decommit(decommit_start, bytes)?;
        }
        stats::sub_saturating(&stats::TOTAL_COMMITTED, bytes);
        self.committed = retain;
        Ok(())
    }

    fn page_size(&self) -> usize {
        PlatformVmOps::page_size()
    }
}

impl Drop for VmGrowth {
    fn drop(&mut self) {
        let Some(base) = self.base else {
            return;
        };
        // Safety: FFI call to release the whole reservation.
        if let Err(e) = unsafe { PlatformVmOps::release(base, self.reserved) } {
            log::warn!("failed to release heap reservation at {base:p}: {e}");
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.reserved);
        if self.committed > 0 {
            stats::sub_saturating(&stats::TOTAL_COMMITTED, self.committed);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_grow_is_lazy_and_contiguous() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut g = VmGrowth::new(page * 8);
        assert_eq!(g.committed_bytes(), 0);

        let a = g.grow(page).unwrap();
        let b = g.grow(page * 2).unwrap();
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + page);
        assert_eq!(g.committed_bytes(), page * 3);

        // Safety: Test code; both spans are committed.
        unsafe {
            a.as_ptr().write(1);
            b.as_ptr().add(page * 2 - 1).write(2);
        }
    }

    #[test]
    fn test_grow_past_reservation_fails() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut g = VmGrowth::new(page * 2);
        g.grow(page * 2).unwrap();
        assert!(matches!(g.grow(page), Err(VmError::CommitFailed(_))));
        // Still usable after the failure.
        g.shrink(page).unwrap();
        assert!(g.grow(page).is_ok());
    }

    #[test]
    fn test_shrink_then_regrow_same_address() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut g = VmGrowth::new(page * 4);
        let a = g.grow(page * 3).unwrap();
        g.shrink(page * 2).unwrap();
        assert_eq!(g.committed_bytes(), page);

        let b = g.grow(page).unwrap();
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + page);
    }

    #[test]
    fn test_shrink_rejects_bad_sizes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut g = VmGrowth::new(page * 4);
        assert!(g.shrink(page).is_err());
        g.grow(page).unwrap();
        assert!(g.shrink(page * 2).is_err());
        assert!(g.shrink(page / 2).is_err());
        assert_eq!(g.committed_bytes(), page);
    }

    #[test]
    fn test_huge_reserve_fails_without_panicking() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut g = VmGrowth::new(usize::MAX - 1);
        assert!(g.reserved_bytes().is_multiple_of(page));
        assert!(g.grow(page).is_err());
        assert_eq!(g.committed_bytes(), 0);
    }

    #[test]
    fn test_stats_track_commit_and_release() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let page = PlatformVmOps::page_size();
        let reserved_before = stats::TOTAL_RESERVED.get();
        let committed_before = stats::TOTAL_COMMITTED.get();
        {
            let mut g = VmGrowth::new(page * 4);
            g.grow(page * 2).unwrap();
            assert_eq!(stats::TOTAL_RESERVED.get(), reserved_before + page * 4);
            assert_eq!(stats::TOTAL_COMMITTED.get(), committed_before + page * 2);
            g.shrink(page).unwrap();
            assert_eq!(stats::TOTAL_COMMITTED.get(), committed_before + page);
        }
        assert_eq!(stats::TOTAL_RESERVED.get(), reserved_before);
        assert_eq!(stats::TOTAL_COMMITTED.get(), committed_before);
    }
}
