#[cfg(not(target_pointer_width = "64"))]
compile_error!("segheap supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// heap
pub use memory::chunk::{ALIGNMENT, MIN_CHUNK_SIZE, MIN_LARGE_SIZE};
pub use memory::config::HeapConfig;
pub use memory::heap::{ChunkInfo, ChunkKind, Chunks, Heap};

// growth providers
pub use memory::growth::{HeapGrowth, VmGrowth};

// process-wide surface
pub use memory::global::{GlobalHeap, LockedHeap};

// stats
pub use memory::stats::{GlobalStats, HeapStats};

// errors
pub use memory::error::{HeapError, InvalidFreeReason};
pub use memory::vm::VmError;
