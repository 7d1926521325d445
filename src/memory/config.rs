use super::chunk::ALIGNMENT;
use super::error::HeapError;

/// Tuning knobs for a [`Heap`](super::heap::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Unit in which the arena grows. `0` means the provider's page size.
    /// Must be a power of two and a multiple of the page size once resolved.
    pub granularity: usize,

    /// Extra bytes requested on every growth beyond what the triggering
    /// allocation needs.
    pub top_pad: usize,

    /// Automatic trim runs when a release leaves the top chunk larger than
    /// this. `usize::MAX` disables automatic trimming.
    pub trim_threshold: usize,

    /// Bytes of top kept back (beyond the minimum chunk) whenever trimming.
    pub trim_retain: usize,

    /// Address space reserved by [`VmGrowth`](super::growth::VmGrowth); the
    /// arena can never grow beyond it.
    pub reserve_size: usize,
}

impl HeapConfig {
    pub const DEFAULT_TRIM_THRESHOLD: usize = 2 * 1024 * 1024;
    pub const DEFAULT_RESERVE_SIZE: usize = 1024 * 1024 * 1024;

    /// Checks the configuration against the provider's page size.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::InvalidConfig` if `page_size` is not a power of two
    /// of at least 8, if the granularity is neither zero nor a power-of-two
    /// multiple of `page_size`, or if `reserve_size` is zero or cannot be
    /// rounded up to whole pages within `isize::MAX`.
    pub fn validate(&self, page_size: usize) -> Result<(), HeapError> {
        if !page_size.is_power_of_two() || page_size < ALIGNMENT {
            return Err(HeapError::InvalidConfig(format!(
                "page size {page_size:#x} is not a power of two of at least {ALIGNMENT}"
            )));
        }
        if self.granularity != 0 {
            if !self.granularity.is_power_of_two() {
                return Err(HeapError::InvalidConfig(format!(
                    "granularity {:#x} is not a power of two",
                    self.granularity
                )));
            }
            if self.granularity < page_size {
                return Err(HeapError::InvalidConfig(format!(
                    "granularity {:#x} is smaller than the page size {page_size:#x}",
                    self.granularity
                )));
            }
        }
        if self.reserve_size == 0 {
            return Err(HeapError::InvalidConfig("reserve_size must be non-zero".into()));
        }
        match self.reserve_size.checked_next_multiple_of(page_size) {
            Some(rounded) if rounded <= isize::MAX as usize => {}
            _ => {
                return Err(HeapError::InvalidConfig(format!(
                    "reserve_size {:#x} exceeds isize::MAX once rounded to pages",
                    self.reserve_size
                )));
            }
        }
        Ok(())
    }

    /// Granularity with `0` resolved to `page_size`.
    #[must_use]
    pub fn resolved_granularity(&self, page_size: usize) -> usize {
        if self.granularity == 0 { page_size } else { self.granularity }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            granularity: 0,
            top_pad: 0,
            trim_threshold: Self::DEFAULT_TRIM_THRESHOLD,
            trim_retain: 0,
            reserve_size: Self::DEFAULT_RESERVE_SIZE,
        }
    }
}
