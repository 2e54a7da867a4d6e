// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread allocator and its thread-local entry points.
//!
//! One could be forgiven for thinking that a process-wide allocator with
//! per-thread handles would serve here; instead, every thread owns a
//! complete [`LocalAllocator`] - buckets, pool, and page source - and the
//! only shared structure is the lost-and-found depot. The instance lives in
//! thread-local storage, held in place rather than boxed: its address is
//! stable for the life of the thread, must never escape to another thread,
//! and is torn down either by an explicit [`deinit`] or by the TLS
//! destructor at thread exit.
//!
//! The module-level functions [`alloc`], [`alloc_aligned`], [`free`], and
//! [`resize`] operate on the calling thread's instance, constructing it on
//! first use. `free` accepts pointers allocated on any thread; everything
//! else is strictly thread-local.

use std::cell::UnsafeCell;
use std::cmp;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use big;
use bucket::{Bucket, SlabPool, POOLED_MAX};
use depot::{self, Depot};
use slab::Slab;
use sources::{MmapSource, PageSource};
use {OutOfMemory, LARGEST_ALLOC, N_CLASSES, SIZE_CLASSES};

/// Index of the smallest class that fits `len`.
#[inline]
pub(crate) fn class_index(len: usize) -> usize {
    debug_assert!(len > 0 && len <= LARGEST_ALLOC);
    let class = cmp::max(len.next_power_of_two(), SIZE_CLASSES[0]);
    (class.trailing_zeros() - SIZE_CLASSES[0].trailing_zeros()) as usize
}

/// The canonical empty range: a well-aligned pointer that is never
/// dereferenced and never owned by any slab.
#[inline]
fn empty_range() -> *mut u8 {
    NonNull::<u8>::dangling().as_ptr()
}

/// A thread's private allocator.
///
/// All methods except the deposit half of `free` touch only thread-local
/// state. The struct is deliberately not `Send`: its address must not cross
/// threads, and `resize` enforces this at runtime.
pub struct LocalAllocator<S: PageSource = MmapSource> {
    buckets: [Bucket; N_CLASSES],
    pool: SlabPool,
    source: S,
    depot: Arc<Depot>,
    home: ThreadId,
}

impl LocalAllocator<MmapSource> {
    pub fn new() -> LocalAllocator<MmapSource> {
        LocalAllocator::with_source(MmapSource::new(), 0)
    }
}

impl Default for LocalAllocator<MmapSource> {
    fn default() -> LocalAllocator<MmapSource> {
        LocalAllocator::new()
    }
}

impl<S: PageSource> LocalAllocator<S> {
    /// Build an allocator over `source`, optionally pre-seeding the slab
    /// pool with up to `initial_slabs` empty slabs.
    pub fn with_source(source: S, initial_slabs: usize) -> LocalAllocator<S> {
        let mut res = LocalAllocator {
            buckets: [
                Bucket::new(SIZE_CLASSES[0]),
                Bucket::new(SIZE_CLASSES[1]),
                Bucket::new(SIZE_CLASSES[2]),
                Bucket::new(SIZE_CLASSES[3]),
                Bucket::new(SIZE_CLASSES[4]),
                Bucket::new(SIZE_CLASSES[5]),
            ],
            pool: SlabPool::new(),
            depot: depot::attach(),
            home: thread::current().id(),
            source: source,
        };
        for _ in 0..cmp::min(initial_slabs, POOLED_MAX) {
            match Slab::create(&res.source) {
                Ok(slab) => res.pool.put(slab, &res.source),
                Err(OutOfMemory) => break,
            }
        }
        res
    }

    /// Allocate `len` bytes at the natural alignment of `len`'s size class.
    ///
    /// A zero `len` returns the canonical empty range. Lengths beyond
    /// [`LARGEST_ALLOC`] come straight from the page source and are not
    /// tracked by any bucket. The first bytes of a size-class chunk are
    /// always zero on hand-out.
    pub unsafe fn alloc(&mut self, len: usize) -> Result<*mut u8, OutOfMemory> {
        if len == 0 {
            return Ok(empty_range());
        }
        if len > LARGEST_ALLOC {
            return big::alloc(&self.source, len).map(|p| p.as_ptr());
        }
        let idx = class_index(len);
        let LocalAllocator { ref mut buckets, ref mut pool, ref source, ref depot, .. } = *self;
        let chunk = buckets[idx].alloc_chunk(pool, source, depot.class(idx))?;
        debug_assert_eq!(chunk.as_ptr() as usize % SIZE_CLASSES[idx], 0);
        Ok(chunk.as_ptr())
    }

    /// `alloc` with an explicit alignment requirement.
    ///
    /// Returns the range as a `(pointer, length)` pair; the returned length
    /// is what must later be passed to `free` or `resize`, and may exceed
    /// `len` when the alignment forced a larger size class. Classes are
    /// aligned to their own size, so the core serves alignments up to
    /// [`LARGEST_ALLOC`]; oversized requests get page alignment from the
    /// source. Stricter alignment than that is a usage error.
    pub unsafe fn alloc_aligned(
        &mut self,
        len: usize,
        align: usize,
    ) -> Result<(*mut u8, usize), OutOfMemory> {
        if !align.is_power_of_two() {
            fatal!("alloc_aligned: alignment {} is not a power of two", align);
        }
        if len == 0 {
            return Ok((empty_range(), 0));
        }
        if len > LARGEST_ALLOC {
            if align > self.source.page_size() {
                fatal!(
                    "alloc_aligned: alignment {} exceeds the page source's {}",
                    align,
                    self.source.page_size()
                );
            }
            return big::alloc(&self.source, len).map(|p| (p.as_ptr(), len));
        }
        if align > LARGEST_ALLOC {
            fatal!(
                "alloc_aligned: alignment {} exceeds the largest size class; \
                 request more than {} bytes to go through the page source",
                align,
                LARGEST_ALLOC
            );
        }
        // Chunks of class c are c-aligned, so serving from the class that
        // fits max(len, align) satisfies both constraints at once.
        let effective = cmp::max(len, align);
        self.alloc(effective).map(|p| (p, effective))
    }

    /// Release a range previously obtained from this allocator - or, with
    /// the `cross-thread` feature, from any thread's allocator.
    ///
    /// `len` must be the length the range was handed out with.
    pub unsafe fn free(&mut self, it: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        if len > LARGEST_ALLOC {
            // the synthetic boundary length is the one legal mismatch
            debug_assert!(
                big::usable_size(&self.source, it) == len || len == LARGEST_ALLOC + 1
            );
            return big::free(&self.source, it);
        }
        let idx = class_index(len);
        let LocalAllocator { ref mut buckets, ref mut pool, ref source, ref depot, .. } = *self;
        let list = depot.class(idx);
        // Adopt whatever the lost-and-found holds for this class before
        // scanning, so parked chunks come home ahead of new slab demand.
        buckets[idx].drain(list, false, pool, source);
        if buckets[idx].free_chunk(it, pool, source) {
            return;
        }
        // No local slab claims the pointer: it was allocated by another
        // thread, and its owner reclaims it from the depot later.
        #[cfg(feature = "cross-thread")]
        {
            trace!("free({:p}, {}): foreign chunk, parking", it, len);
            list.deposit(it);
        }
        #[cfg(not(feature = "cross-thread"))]
        fatal!(
            "free({:p}, {}): no slab in this thread's {}-byte bucket claims the pointer",
            it,
            len,
            SIZE_CLASSES[idx]
        );
    }

    /// Change the length of the range at `it` from `old_len` to `new_len`,
    /// returning the range's new location and the length to use for
    /// subsequent calls.
    ///
    /// Within one size class the pointer never moves. Crossing classes, or
    /// crossing between the class window and the page-source regime,
    /// relocates and copies `min(old_len, new_len)` bytes - with one
    /// exception: shrinking a page-source range into the class window keeps
    /// it in place and reports the synthetic length `LARGEST_ALLOC + 1`,
    /// which pins the range to the page-source regime for later calls. On
    /// error the original range is untouched and still valid.
    pub unsafe fn resize(
        &mut self,
        it: *mut u8,
        old_len: usize,
        new_len: usize,
    ) -> Result<(*mut u8, usize), OutOfMemory> {
        self.assert_home("resize");
        if old_len == 0 {
            if new_len == 0 {
                return Ok((empty_range(), 0));
            }
            return self.alloc(new_len).map(|p| (p, new_len));
        }
        if new_len == 0 {
            self.free(it, old_len);
            return Ok((empty_range(), 0));
        }
        if old_len <= LARGEST_ALLOC && new_len <= LARGEST_ALLOC {
            if class_index(old_len) == class_index(new_len) {
                // same chunk, new bookkeeping length; no bytes move
                return Ok((it, new_len));
            }
            let fresh = self.alloc(new_len)?;
            ptr::copy_nonoverlapping(it, fresh, cmp::min(old_len, new_len));
            self.free(it, old_len);
            return Ok((fresh, new_len));
        }
        if old_len <= LARGEST_ALLOC {
            // class window -> page source
            let fresh = big::alloc(&self.source, new_len)?;
            ptr::copy_nonoverlapping(it, fresh.as_ptr(), old_len);
            self.free(it, old_len);
            return Ok((fresh.as_ptr(), new_len));
        }
        if new_len <= LARGEST_ALLOC {
            // Page source -> class window. The range stays where it is (its
            // region header still records the real mapping) and the
            // reported length keeps later calls routed to the page source.
            let kept = big::resize(&self.source, it, new_len)?;
            debug_assert_eq!(kept.as_ptr(), it);
            return Ok((it, LARGEST_ALLOC + 1));
        }
        big::resize(&self.source, it, new_len).map(|p| (p.as_ptr(), new_len))
    }

    fn assert_home(&self, what: &str) {
        if thread::current().id() != self.home {
            fatal!("{} called on an allocator owned by another thread", what);
        }
    }

    #[cfg(test)]
    pub(crate) fn attached_in_class(&self, len: usize) -> usize {
        self.buckets[class_index(len)].attached()
    }

    #[cfg(test)]
    pub(crate) fn class_claims(&self, len: usize, it: *mut u8) -> bool {
        self.buckets[class_index(len)].contains(it)
    }

    #[cfg(test)]
    pub(crate) fn any_class_claims(&self, it: *mut u8) -> bool {
        self.buckets.iter().any(|b| b.contains(it))
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.pool.len()
    }

    #[cfg(test)]
    pub(crate) fn depot_handle(&self) -> Arc<Depot> {
        self.depot.clone()
    }
}

impl<S: PageSource> Drop for LocalAllocator<S> {
    fn drop(&mut self) {
        let LocalAllocator { ref mut buckets, ref mut pool, ref source, ref depot, .. } = *self;
        for (idx, bucket) in buckets.iter_mut().enumerate() {
            bucket.teardown(depot.class(idx), pool, source);
        }
        pool.drain_to(source);
        // `depot` drops with the struct; the last allocator's handle runs
        // the depot's empty-lists teardown check.
    }
}

thread_local! {
    static LOCAL_HEAP: UnsafeCell<Option<LocalAllocator<MmapSource>>> = UnsafeCell::new(None);
}

fn with_heap<R, F>(f: F) -> R
where
    F: FnOnce(&mut LocalAllocator<MmapSource>) -> R,
{
    LOCAL_HEAP
        .try_with(|slot| unsafe {
            let heap = &mut *slot.get();
            if heap.is_none() {
                *heap = Some(LocalAllocator::new());
            }
            f(heap.as_mut().unwrap())
        })
        .unwrap_or_else(|_| fatal!("thread allocator used during thread teardown"))
}

/// Construct this thread's allocator if it does not exist yet. Idempotent;
/// later calls on the same thread see the same instance.
pub fn init() {
    with_heap(|_| {});
}

/// Like [`init`], but over a caller-supplied page source, with the slab pool
/// pre-seeded. Has no effect if this thread's allocator already exists.
pub fn init_with(source: MmapSource, initial_slabs: usize) {
    LOCAL_HEAP
        .try_with(|slot| unsafe {
            let heap = &mut *slot.get();
            if heap.is_none() {
                *heap = Some(LocalAllocator::with_source(source, initial_slabs));
            }
        })
        .unwrap_or_else(|_| fatal!("init_with during thread teardown"))
}

/// Tear down this thread's allocator now. Runs the bucket teardown drains
/// and releases every slab. Also happens automatically at thread exit.
pub fn deinit() {
    let _ = LOCAL_HEAP.try_with(|slot| unsafe { (*slot.get()).take() });
}

/// Allocate from the calling thread's instance. See
/// [`LocalAllocator::alloc`].
pub unsafe fn alloc(len: usize) -> Result<*mut u8, OutOfMemory> {
    with_heap(|heap| heap.alloc(len))
}

/// See [`LocalAllocator::alloc_aligned`].
pub unsafe fn alloc_aligned(len: usize, align: usize) -> Result<(*mut u8, usize), OutOfMemory> {
    with_heap(|heap| heap.alloc_aligned(len, align))
}

/// Free through the calling thread's instance. See
/// [`LocalAllocator::free`].
pub unsafe fn free(it: *mut u8, len: usize) {
    with_heap(|heap| heap.free(it, len))
}

/// See [`LocalAllocator::resize`].
pub unsafe fn resize(it: *mut u8, old_len: usize, new_len: usize) -> Result<(*mut u8, usize), OutOfMemory> {
    with_heap(|heap| heap.resize(it, old_len, new_len))
}
