// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cmp;
use std::ptr::write_bytes;
use std::sync::mpsc::channel;
use std::thread;

use env_logger;
use num_cpus;
use quickcheck::QuickCheck;
use rand;
use rand::seq::SliceRandom;

use local::{self, class_index, LocalAllocator};
use {LARGEST_ALLOC, SIZE_CLASSES};

fn test_heap() -> LocalAllocator {
    let _ = env_logger::try_init();
    LocalAllocator::new()
}

/// Raw chunk pointers handed between test threads.
struct Sendable(*mut u8);
unsafe impl Send for Sendable {}

#[test]
fn bucket_fill_and_drain() {
    let mut heap = test_heap();
    unsafe {
        let ptrs: Vec<*mut u8> = (0..50).map(|_| heap.alloc(2000).unwrap()).collect();
        for &it in &ptrs {
            write_bytes(it, 0xFF, 2000);
        }
        // 2000 lands in the 2048 class: four chunks per slab, 13 slabs
        assert_eq!(heap.attached_in_class(2000), 13);
        for it in ptrs {
            heap.free(it, 2000);
        }
    }
    assert_eq!(heap.attached_in_class(2000), 0);
    assert_eq!(heap.pooled(), 13);
}

#[test]
fn fill_and_drain_shuffled() {
    let mut heap = test_heap();
    unsafe {
        let mut ptrs: Vec<*mut u8> = (0..200).map(|_| heap.alloc(160).unwrap()).collect();
        ptrs.shuffle(&mut rand::thread_rng());
        for it in ptrs {
            heap.free(it, 160);
        }
    }
    assert_eq!(heap.attached_in_class(160), 0);
    assert!(heap.pooled() > 0);
}

#[test]
fn pool_is_capped() {
    let mut heap = test_heap();
    // 21 slabs' worth of 64-byte chunks; the pool keeps 20 of them
    let count = 21 * (8192 / 64);
    unsafe {
        let ptrs: Vec<*mut u8> = (0..count).map(|_| heap.alloc(64).unwrap()).collect();
        assert_eq!(heap.attached_in_class(64), 21);
        for it in ptrs {
            heap.free(it, 64);
        }
    }
    assert_eq!(heap.attached_in_class(64), 0);
    assert_eq!(heap.pooled(), 20);
}

#[test]
fn small_allocations_land_in_class_slabs() {
    let mut heap = test_heap();
    unsafe {
        for &len in &[1usize, 63, 64, 65, 1000, 2047, 2048] {
            let it = heap.alloc(len).unwrap();
            assert!(heap.class_claims(len, it), "len {} not in its class bucket", len);
            let class = SIZE_CLASSES[class_index(len)];
            assert_eq!(it as usize % class, 0, "len {} misaligned", len);
            heap.free(it, len);
        }
    }
}

#[test]
fn large_allocations_bypass_slabs() {
    let mut heap = test_heap();
    unsafe {
        let it = heap.alloc(10_000).unwrap();
        write_bytes(it, 0xFF, 10_000);
        assert!(!heap.any_class_claims(it));
        heap.free(it, 10_000);
    }
}

#[test]
fn reuse_returns_zeroed_chunks() {
    let mut heap = test_heap();
    unsafe {
        for _ in 0..64 {
            let it = heap.alloc(256).unwrap();
            for i in 0..256 {
                assert_eq!(*it.offset(i), 0);
            }
            write_bytes(it, 0xFF, 256);
            heap.free(it, 256);
        }
    }
}

#[test]
fn zero_length_requests() {
    let mut heap = test_heap();
    unsafe {
        let it = heap.alloc(0).unwrap();
        heap.free(it, 0);
        let (it, len) = heap.resize(it, 0, 0).unwrap();
        assert_eq!(len, 0);
        let (it, len) = heap.resize(it, 0, 100).unwrap();
        assert_eq!(len, 100);
        let (_, len) = heap.resize(it, 100, 0).unwrap();
        assert_eq!(len, 0);
    }
}

// The next two mirror the two directions across the size-class boundary.

#[test]
fn boundary_relocation_reports_synthetic_length() {
    let mut heap = test_heap();
    unsafe {
        let it = heap.alloc(10_000).unwrap();
        write_bytes(it, 0x42, 10_000);
        let (kept, len) = heap.resize(it, 10_000, 1_000).unwrap();
        assert_eq!(kept, it);
        assert_eq!(len, LARGEST_ALLOC + 1);
        for i in 0..1_000 {
            assert_eq!(*kept.offset(i), 0x42);
        }
        heap.free(kept, len);
    }
}

#[test]
fn growth_across_the_boundary_copies() {
    let mut heap = test_heap();
    unsafe {
        let first = heap.alloc(1_000).unwrap();
        write_bytes(first, 0x01, 1_000);
        // fence the first range in place
        let second = heap.alloc(1_000).unwrap();
        write_bytes(second, 0x02, 1_000);

        let (grown, len) = heap.resize(first, 1_000, 10_000).unwrap();
        assert_eq!(len, 10_000);
        for i in 0..1_000 {
            assert_eq!(*grown.offset(i), 0x01);
            assert_eq!(*second.offset(i), 0x02);
        }
        heap.free(grown, 10_000);
        heap.free(second, 1_000);
    }
}

#[test]
fn same_class_resize_preserves_pointer() {
    let mut heap = test_heap();
    unsafe {
        let (it, len) = heap.alloc_aligned(1, 4).unwrap();
        assert_eq!(it as usize % 4, 0);
        *it = 0x12;
        let (same, len) = heap.resize(it, len, 2).unwrap();
        assert_eq!(same, it);
        assert_eq!(len, 2);
        *same.offset(1) = 0x34;
        // 17 still fits the smallest class
        let (same, len) = heap.resize(same, len, 17).unwrap();
        assert_eq!(same, it);
        assert_eq!(*same, 0x12);
        assert_eq!(*same.offset(1), 0x34);
        // 100 does not; the chunk moves and the prefix survives
        let (moved, len) = heap.resize(same, len, 100).unwrap();
        assert_eq!(*moved, 0x12);
        assert_eq!(*moved.offset(1), 0x34);
        heap.free(moved, len);
    }
}

#[test]
fn shrink_preserves_content() {
    let mut heap = test_heap();
    unsafe {
        let it = heap.alloc(20).unwrap();
        write_bytes(it, 0x11, 20);
        let (it, len) = heap.resize(it, 20, 17).unwrap();
        assert_eq!(len, 17);
        for i in 0..17 {
            assert_eq!(*it.offset(i), 0x11);
        }
        let (it, len) = heap.resize(it, 17, 16).unwrap();
        assert_eq!(len, 16);
        for i in 0..16 {
            assert_eq!(*it.offset(i), 0x11);
        }
        heap.free(it, len);
    }
}

#[test]
fn cross_class_resize_copies_min_of_lengths() {
    let mut heap = test_heap();
    unsafe {
        let it = heap.alloc(500).unwrap();
        write_bytes(it, 0x7E, 500);
        let (shrunk, len) = heap.resize(it, 500, 100).unwrap();
        assert_eq!(len, 100);
        for i in 0..100 {
            assert_eq!(*shrunk.offset(i), 0x7E);
        }
        heap.free(shrunk, 100);
    }
}

#[test]
fn cross_thread_free_is_reclaimed() {
    let mut heap = test_heap();
    let depot = heap.depot_handle();
    let class = class_index(1_000);
    unsafe {
        let it = heap.alloc(1_000).unwrap();
        let send = Sendable(it);
        thread::spawn(move || {
            let mut other = LocalAllocator::new();
            unsafe {
                other.free(send.0, 1_000);
            }
            // `other` tears down here; the parked chunk belongs to the
            // spawning thread and must survive
        })
        .join()
        .unwrap();
        assert_eq!(depot.parked(class), 1);

        // one more free in the same class adopts the stray back
        let fence = heap.alloc(1_000).unwrap();
        heap.free(fence, 1_000);
        assert_eq!(depot.parked(class), 0);
    }
    assert_eq!(heap.attached_in_class(1_000), 0);
}

#[test]
fn producer_consumer_frees() {
    let _ = env_logger::try_init();
    local::init();
    let (tx, rx) = channel();
    let consumer = thread::spawn(move || {
        local::init();
        for it in rx {
            let it: Sendable = it;
            unsafe {
                local::free(it.0, 500);
            }
        }
        local::deinit();
    });
    unsafe {
        for _ in 0..100 {
            tx.send(Sendable(local::alloc(500).unwrap())).unwrap();
        }
    }
    drop(tx);
    consumer.join().unwrap();
    unsafe {
        // the next allocation in the class adopts the strays, and the free
        // empties the bucket again
        let it = local::alloc(500).unwrap();
        local::free(it, 500);
    }
    local::deinit();
}

#[test]
fn hammer_many_threads() {
    let _ = env_logger::try_init();
    let n_threads = cmp::max(4, num_cpus::get());
    let mut threads = Vec::with_capacity(n_threads);
    for t in 0..n_threads {
        threads.push(
            thread::Builder::new()
                .name(t.to_string())
                .spawn(move || unsafe {
                    local::init();
                    for len in 1..4097 {
                        let it = local::alloc(len).unwrap();
                        write_bytes(it, 0xFF, len);
                        local::free(it, len);
                    }
                    local::deinit();
                })
                .unwrap(),
        );
    }
    for t in threads {
        t.join().expect("threads should exit successfully");
    }
}

#[test]
fn pre_seeded_pool_serves_first() {
    let _ = env_logger::try_init();
    let mut heap = LocalAllocator::with_source(::sources::MmapSource::new(), 4);
    assert_eq!(heap.pooled(), 4);
    unsafe {
        let it = heap.alloc(128).unwrap();
        assert_eq!(heap.pooled(), 3);
        heap.free(it, 128);
    }
    assert_eq!(heap.pooled(), 4);
}

#[test]
fn random_interleavings_leave_buckets_empty() {
    fn prop(ops: Vec<(u16, bool)>) -> bool {
        let mut heap = LocalAllocator::new();
        let mut live: Vec<(*mut u8, usize)> = Vec::new();
        unsafe {
            for (raw, push) in ops {
                if push || live.is_empty() {
                    let len = (raw as usize % LARGEST_ALLOC) + 1;
                    let it = heap.alloc(len).unwrap();
                    write_bytes(it, 0xAA, len);
                    live.push((it, len));
                } else {
                    let pick = raw as usize % live.len();
                    let (it, len) = live.swap_remove(pick);
                    heap.free(it, len);
                }
            }
            for (it, len) in live {
                heap.free(it, len);
            }
        }
        SIZE_CLASSES.iter().all(|&class| heap.attached_in_class(class) == 0)
    }
    let _ = env_logger::try_init();
    QuickCheck::new()
        .tests(50)
        .quickcheck(prop as fn(Vec<(u16, bool)>) -> bool);
}
