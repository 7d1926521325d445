use super::vm::VmError;

/// Why a pointer handed to `release`/`reallocate` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFreeReason {
    #[error("address lies outside the arena")]
    OutOfBounds,
    #[error("address is not 8-byte aligned")]
    Misaligned,
    #[error("address is not the payload of a live allocation")]
    NotLive,
    #[error("chunk header is damaged")]
    CorruptHeader,
}

#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    /// The request could not be satisfied. The heap stays usable.
    #[error("out of memory: cannot satisfy a request of {requested} bytes")]
    OutOfMemory {
        requested: usize,
        #[source]
        source: Option<VmError>,
    },
    /// The pointer was never returned by this heap, or was already released.
    #[error("invalid free of {addr:#x}: {reason}")]
    InvalidFree {
        addr: usize,
        reason: InvalidFreeReason,
    },
    /// A free-list or tree link failed validation.
    #[error("heap structure corrupted at offset {offset:#x}: {detail}")]
    StructuralCorruption { offset: usize, detail: &'static str },
    /// An earlier fatal error disabled the heap.
    #[error("heap is disabled after an earlier fatal error")]
    Poisoned,
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),
}

impl HeapError {
    /// Fatal errors poison the heap; every later call returns [`HeapError::Poisoned`].
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HeapError::InvalidFree { .. } | HeapError::StructuralCorruption { .. }
        )
    }

    pub(crate) fn corruption(offset: usize, detail: &'static str) -> Self {
        HeapError::StructuralCorruption { offset, detail }
    }

    pub(crate) fn out_of_memory(requested: usize) -> Self {
        HeapError::OutOfMemory {
            requested,
            source: None,
        }
    }
}
