#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::chunk::{MIN_CHUNK_SIZE, pad_request};
    use crate::memory::config::HeapConfig;
    use crate::memory::error::HeapError;
    use crate::memory::growth::{HeapGrowth, VmGrowth};
    use crate::memory::heap::{ChunkKind, Heap};
    use crate::memory::stats::{self, GlobalStats};
    use crate::memory::vm::VmError;
    use proptest::prelude::*;
    use std::ptr::NonNull;

    const PAGE: usize = 4096;

    /// Growth provider over a fixed buffer, with knobs to misbehave.
    struct BufferGrowth {
        buf: Vec<u64>,
        used: usize,
        // Handed out instead of the next contiguous span when `detach_next` is set.
        stray: Vec<u64>,
        stray_out: bool,
        detach_next: bool,
        refuse_shrink: bool,
        given_back: Vec<usize>,
    }

    impl BufferGrowth {
        fn new(capacity: usize) -> Self {
            Self {
                buf: vec![0; capacity / 8],
                used: 0,
                stray: vec![0; 1024 * 1024 / 8],
                stray_out: false,
                detach_next: false,
                refuse_shrink: false,
                given_back: Vec::new(),
            }
        }

        fn capacity(&self) -> usize {
            self.buf.len() * 8
        }
    }

    // Safety: spans come from `buf`, in order, and stay valid while `self` lives.
    unsafe impl HeapGrowth for BufferGrowth {
        fn grow(&mut self, bytes: usize) -> Result<NonNull<u8>, VmError> {
            if self.detach_next {
                self.detach_next = false;
                self.stray_out = true;
                assert!(bytes <= self.stray.len() * 8);
                return Ok(NonNull::new(self.stray.as_mut_ptr().cast::<u8>()).unwrap());
            }
            if self.used + bytes > self.capacity() {
                return Err(VmError::CommitFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "buffer exhausted",
                )));
            }
            // Safety: Test code; `used + bytes` is within `buf`.
            let span = unsafe { self.buf.as_mut_ptr().cast::<u8>().add(self.used) };
            self.used += bytes;
            Ok(NonNull::new(span).unwrap())
        }

        fn shrink(&mut self, bytes: usize) -> Result<(), VmError> {
            if self.refuse_shrink {
                return Err(VmError::DecommitFailed(std::io::Error::other("refused")));
            }
            if self.stray_out {
                self.stray_out = false;
            } else {
                self.used -= bytes;
            }
            self.given_back.push(bytes);
            Ok(())
        }

        fn page_size(&self) -> usize {
            PAGE
        }
    }

    fn quiet() -> HeapConfig {
        HeapConfig {
            trim_threshold: usize::MAX,
            ..HeapConfig::default()
        }
    }

    #[test]
    fn test_non_contiguous_growth_is_refused() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let _ = env_logger::builder().is_test(true).try_init();
        let mut heap = Heap::with_config(BufferGrowth::new(64 * 1024), quiet()).unwrap();
        let a = heap.allocate(100).unwrap();

        // The next span comes from elsewhere; the heap must hand it back.
        heap.growth_mut().detach_next = true;
        let err = heap.allocate(3 * PAGE).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { source: None, .. }));
        assert_eq!(heap.growth().given_back, vec![3 * PAGE]);
        assert!(!heap.is_poisoned());
        assert_eq!(heap.stats().footprint, PAGE);

        // Contiguous growth works again afterwards.
        let b = heap.allocate(3 * PAGE).unwrap();
        assert_eq!(heap.stats().grow_count, 2);
        heap.release(a).unwrap();
        heap.release(b).unwrap();
        heap.check().unwrap();
    }

    #[test]
    fn test_exhausted_provider_reports_source() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = Heap::with_config(BufferGrowth::new(2 * PAGE), quiet()).unwrap();
        let _a = heap.allocate(PAGE).unwrap();
        let err = heap.allocate(2 * PAGE).unwrap_err();
        match err {
            HeapError::OutOfMemory { requested, source: Some(VmError::CommitFailed(_)) } => {
                assert_eq!(requested, 2 * PAGE);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // What is left still serves small requests.
        let b = heap.allocate(64).unwrap();
        heap.release(b).unwrap();
        heap.check().unwrap();
    }

    #[test]
    fn test_refused_shrink_keeps_memory() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = Heap::with_config(BufferGrowth::new(64 * 1024), quiet()).unwrap();
        let a = heap.allocate(8 * PAGE).unwrap();
        heap.release(a).unwrap();
        heap.growth_mut().refuse_shrink = true;
        let before = heap.stats();

        assert!(!heap.trim());
        assert_eq!(heap.stats(), before);
        heap.check().unwrap();

        heap.growth_mut().refuse_shrink = false;
        assert!(heap.trim());
        assert_eq!(heap.growth().given_back.iter().sum::<usize>(), 8 * PAGE);
        assert_eq!(heap.stats().footprint, PAGE);
    }

    #[test]
    fn test_mixed_workload_stays_consistent() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = Heap::with_vm(HeapConfig {
            reserve_size: 64 * 1024 * 1024,
            ..HeapConfig::default()
        })
        .unwrap();

        let mut live = Vec::new();
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for round in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let size = match seed % 4 {
                0 => (seed >> 8) as usize % 64,
                1 => (seed >> 8) as usize % 256,
                2 => (seed >> 8) as usize % 4096,
                _ => (seed >> 8) as usize % 200_000,
            };
            if live.is_empty() || seed % 3 != 0 {
                live.push(heap.allocate(size).unwrap());
            } else {
                let idx = (seed >> 20) as usize % live.len();
                heap.release(live.swap_remove(idx)).unwrap();
            }
            if round % 250 == 0 {
                heap.check().unwrap();
            }
        }
        for p in live.drain(..) {
            heap.release(p).unwrap();
        }
        heap.check().unwrap();

        let s = heap.stats();
        assert_eq!(s.in_use_bytes, 0);
        assert_eq!(s.free_chunks, 0);
        assert_eq!(s.top_size, s.footprint);
        assert!(s.footprint <= HeapConfig::DEFAULT_TRIM_THRESHOLD + 4096 * 16);
    }

    #[test]
    fn test_heap_in_use_counter_tracks_live_chunks() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = stats::HEAP_IN_USE.get();
        {
            let mut heap = Heap::with_vm(HeapConfig {
                reserve_size: 16 * 1024 * 1024,
                ..HeapConfig::default()
            })
            .unwrap();
            let a = heap.allocate(100).unwrap();
            let _b = heap.allocate(1000).unwrap();
            assert_eq!(stats::HEAP_IN_USE.get(), before + pad_request(100) + pad_request(1000));
            heap.release(a).unwrap();
            assert_eq!(stats::HEAP_IN_USE.get(), before + pad_request(1000));

            let snap = GlobalStats::snapshot();
            assert!(snap.total_committed >= heap.stats().footprint);
            assert!(snap.total_reserved >= 16 * 1024 * 1024);
        }
        assert_eq!(stats::HEAP_IN_USE.get(), before);
    }

    #[test]
    fn test_heap_moves_between_threads() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = Heap::new(VmGrowth::new(8 * 1024 * 1024));
        let p = heap.allocate(256).unwrap();
        let addr = p.as_ptr() as usize;

        let heap = crate::sync::thread::spawn(move || {
            let p = NonNull::new(addr as *mut u8).unwrap();
            heap.release(p).unwrap();
            heap
        })
        .join()
        .unwrap();
        assert_eq!(heap.stats().live_allocations, 0);
    }

    #[test]
    fn test_reallocate_chain_preserves_prefix() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = Heap::with_vm(HeapConfig {
            reserve_size: 16 * 1024 * 1024,
            ..quiet()
        })
        .unwrap();
        let mut p = heap.allocate(16).unwrap();
        // Safety: Test code.
        unsafe { std::ptr::copy_nonoverlapping(b"segregated heap!".as_ptr(), p.as_ptr(), 16) };
        let blocker = heap.allocate(8).unwrap();

        for size in [40, 300, 5000, 120, 70_000, 24] {
            p = heap.reallocate(p, size).unwrap();
            // Safety: Test code.
            let prefix = unsafe { std::slice::from_raw_parts(p.as_ptr(), 16) };
            assert_eq!(prefix, b"segregated heap!");
            heap.check().unwrap();
        }
        heap.release(blocker).unwrap();
        heap.release(p).unwrap();
        assert!(heap.chunks().all(|c| c.kind == ChunkKind::Top));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Alloc(usize),
        Release(prop::sample::Index),
        Realloc(prop::sample::Index, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        let size = prop_oneof![0usize..256, 256usize..4096, 4096usize..100_000];
        prop_oneof![
            3 => size.clone().prop_map(Op::Alloc),
            2 => any::<prop::sample::Index>().prop_map(Op::Release),
            1 => (any::<prop::sample::Index>(), size).prop_map(|(i, s)| Op::Realloc(i, s)),
        ]
    }

    fn stamp(p: NonNull<u8>, size: usize, tag: u8) {
        // Safety: Test code; `size` bytes are usable at `p`.
        unsafe { std::ptr::write_bytes(p.as_ptr(), tag, size.min(32)) };
    }

    fn stamped(p: NonNull<u8>, size: usize, tag: u8) -> bool {
        // Safety: Test code.
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size.min(32)) };
        bytes.iter().all(|&b| b == tag)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever the interleaving, live blocks never overlap, the heap
        /// verifies after every step, and once everything is released the
        /// arena collapses back into the single top chunk.
        #[test]
        #[cfg_attr(miri, ignore)]
        fn check_no_fragmentation(ops in prop::collection::vec(op(), 1..120)) {
            let _ = env_logger::try_init();
            let _guard = crate::memory::TEST_MUTEX.read().unwrap();
            let mut heap = Heap::with_vm(HeapConfig {
                reserve_size: 256 * 1024 * 1024,
                ..HeapConfig::default()
            })
            .unwrap();

            let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
            let mut tag = 0u8;
            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        let p = heap.allocate(size).unwrap();
                        tag = tag.wrapping_add(1);
                        stamp(p, size, tag);
                        live.push((p, size, tag));
                    }
                    Op::Release(i) if !live.is_empty() => {
                        let (p, size, t) = live.swap_remove(i.index(live.len()));
                        prop_assert!(stamped(p, size, t));
                        heap.release(p).unwrap();
                    }
                    Op::Realloc(i, new_size) if !live.is_empty() => {
                        let idx = i.index(live.len());
                        let (p, size, t) = live[idx];
                        let q = heap.reallocate(p, new_size).unwrap();
                        prop_assert!(stamped(q, size.min(new_size), t));
                        stamp(q, new_size, t);
                        live[idx] = (q, new_size, t);
                    }
                    _ => {}
                }
                prop_assert!(heap.check().is_ok());
            }

            for (p, size, t) in live.drain(..) {
                prop_assert!(stamped(p, size, t));
                heap.release(p).unwrap();
            }
            heap.check().unwrap();

            let s = heap.stats();
            prop_assert_eq!(s.in_use_bytes, 0);
            prop_assert_eq!(s.free_chunks, 0);
            prop_assert_eq!(s.top_size, s.footprint);
            prop_assert!(s.footprint == 0 || s.top_size >= MIN_CHUNK_SIZE);
        }
    }
}
