// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Size-class buckets and the per-thread pool of empty slabs.

use std::ptr;
use std::ptr::NonNull;

use smallvec::SmallVec;

use depot::DepotList;
use slab::{Slab, SlabState};
use sources::PageSource;
use OutOfMemory;

/// Cap on the number of empty slabs a thread keeps around. Beyond this,
/// released slabs go back to the page source; the cap trades memory held
/// idle against repeated system calls during bursty workloads.
pub const POOLED_MAX: usize = 20;

/// A fixed-capacity cache of empty slabs shared by all of a thread's
/// buckets. Pooled slabs are unbound; the bucket that takes one binds it to
/// its own size class.
pub struct SlabPool {
    slabs: [*mut Slab; POOLED_MAX],
    len: usize,
}

impl SlabPool {
    pub fn new() -> SlabPool {
        SlabPool {
            slabs: [ptr::null_mut(); POOLED_MAX],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn take(&mut self) -> Option<NonNull<Slab>> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        NonNull::new(self.slabs[self.len])
    }

    /// Park an empty slab, or destroy it if the pool is already at capacity.
    pub fn put<S: PageSource>(&mut self, slab: NonNull<Slab>, source: &S) {
        unsafe {
            debug_assert_eq!((*slab.as_ptr()).state(), SlabState::Empty);
            if self.len == POOLED_MAX {
                Slab::destroy(slab, source);
                return;
            }
        }
        self.slabs[self.len] = slab.as_ptr();
        self.len += 1;
    }

    /// Destroy every pooled slab.
    pub fn drain_to<S: PageSource>(&mut self, source: &S) {
        while let Some(slab) = self.take() {
            unsafe {
                Slab::destroy(slab, source);
            }
        }
    }
}

/// The slabs of one size class within one thread's allocator.
///
/// Slabs are kept in insertion order and searched front to back; no best-fit
/// heuristic is needed since every chunk in a bucket has the same size.
/// Giving older slabs first pick encourages the newest ones to drain empty
/// and fall back into the pool.
pub struct Bucket {
    chunk_size: usize,
    slabs: SmallVec<[NonNull<Slab>; 4]>,
}

impl Bucket {
    pub fn new(chunk_size: usize) -> Bucket {
        Bucket {
            chunk_size: chunk_size,
            slabs: SmallVec::new(),
        }
    }

    /// Number of attached slabs. None of them is empty at rest.
    pub fn attached(&self) -> usize {
        self.slabs.len()
    }

    /// Does any attached slab's data region contain `it`?
    pub fn contains(&self, it: *mut u8) -> bool {
        self.slabs.iter().any(|s| unsafe { (*s.as_ptr()).contains(it) })
    }

    fn chunk_from_attached(&mut self) -> Option<NonNull<u8>> {
        for slab in &self.slabs {
            if let Some(chunk) = unsafe { (*slab.as_ptr()).next_chunk() } {
                return Some(chunk);
            }
        }
        None
    }

    /// Serve one chunk. The attached slabs get first crack; after that the
    /// lost-and-found might hand some chunks back; only then is a slab
    /// pulled from the pool (or mapped fresh) and attached.
    pub fn alloc_chunk<S: PageSource>(
        &mut self,
        pool: &mut SlabPool,
        source: &S,
        list: &DepotList,
    ) -> Result<NonNull<u8>, OutOfMemory> {
        if let Some(chunk) = self.chunk_from_attached() {
            return Ok(chunk);
        }
        self.drain(list, false, pool, source);
        if let Some(chunk) = self.chunk_from_attached() {
            return Ok(chunk);
        }
        let slab = match pool.take() {
            Some(slab) => slab,
            None => Slab::create(source)?,
        };
        unsafe {
            (*slab.as_ptr()).bind(self.chunk_size);
            self.slabs.push(slab);
            match (*slab.as_ptr()).next_chunk() {
                Some(chunk) => Ok(chunk),
                None => fatal!("fresh {}-byte slab refused to yield a chunk", self.chunk_size),
            }
        }
    }

    /// Give `it` back to the slab that owns it. Returns false if no attached
    /// slab claims the pointer, in which case nothing was mutated.
    pub fn free_chunk<S: PageSource>(&mut self, it: *mut u8, pool: &mut SlabPool, source: &S) -> bool {
        for i in 0..self.slabs.len() {
            let slab = self.slabs[i];
            unsafe {
                if (*slab.as_ptr()).free_chunk(it) {
                    if (*slab.as_ptr()).state() == SlabState::Empty {
                        // empty slabs never stay attached
                        self.slabs.remove(i);
                        pool.put(slab, source);
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Adopt every parked chunk belonging to this bucket's slabs. Chunks the
    /// bucket does not recognize stay parked for their real owner.
    pub fn drain<S: PageSource>(
        &mut self,
        list: &DepotList,
        block: bool,
        pool: &mut SlabPool,
        source: &S,
    ) {
        unsafe {
            list.drain(block, |chunk| self.free_chunk(chunk, pool, source));
        }
    }

    /// Teardown: a blocking drain, so no parked chunk still references the
    /// slabs about to be released, followed by a check that nothing is left
    /// attached. Empty slabs were pooled as they drained, so a survivor
    /// still holds chunks the caller never freed.
    pub fn teardown<S: PageSource>(&mut self, list: &DepotList, pool: &mut SlabPool, source: &S) {
        self.drain(list, true, pool, source);
        if !self.slabs.is_empty() {
            fatal!(
                "tearing down the {}-byte bucket with {} slab(s) still holding live chunks",
                self.chunk_size,
                self.slabs.len()
            );
        }
    }
}
