pub(crate) mod bins;
pub(crate) mod chunk;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod global;
pub(crate) mod growth;
pub(crate) mod heap;
pub(crate) mod integration;
pub(crate) mod stats;
pub(crate) mod tree;
pub(crate) mod vm;

// Tests touching the process-wide counters take it for writing; the rest read.
#[cfg(all(test, not(loom)))]
pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
