// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The slab: a pinned, fixed-layout region of chunk-bearing memory.
//!
//! A slab is two classic 4 KiB pages of chunk storage plus a small inline
//! header tracking which chunks are in use. While attached to a bucket a slab
//! is bound to exactly one size class; rebinding happens only when the slab
//! is empty and parked in the pool. There are no per-chunk headers: the
//! metadata is a byte per chunk in the header, and a pointer is attributed to
//! a slab purely by landing inside its data region. That containment test is
//! also the index computation, so the layout below is load-bearing.
//!
//! Slabs are self-referential (`slab_start`/`slab_end` cache the address of
//! the inline data region) and therefore must never move once created. They
//! are only ever manipulated through the pointer handed back by `create`.

use std::mem;
use std::ptr::{self, NonNull};

use sources::PageSource;
use {OutOfMemory, SIZE_CLASSES};

/// Bytes of chunk storage in one slab: two classic 4 KiB pages. This is a
/// compile-time constant (not the runtime page size) so that the metadata
/// array below has a fixed length; on systems with larger pages the slack is
/// absorbed by the page source's rounding.
pub const SLAB_BYTES: usize = 2 * 4096;

/// Metadata slots per slab: enough for the smallest size class.
pub const MAX_CHUNKS: usize = SLAB_BYTES / SIZE_CLASSES[0];

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlabState {
    /// No chunk is in use. Only empty slabs may be rebound or released.
    Empty = 0,
    Partial = 1,
    Full = 2,
}

/// Chunk storage, aligned to the largest size class so that chunk `i` of a
/// class `c` slab (at byte offset `i * c`) is itself `c`-aligned.
#[repr(align(2048))]
struct SlabData([u8; SLAB_BYTES]);

#[repr(C)]
pub struct Slab {
    state: SlabState,
    /// The size class this slab is bound to while attached to a bucket.
    chunk_size: usize,
    /// Index at which the next free-chunk scan starts.
    next_chunk: usize,
    chunks_left: usize,
    /// Cached bounds of `data`. Recomputed on every `bind`; stale bounds
    /// would misattribute every pointer, which is why slabs are pinned.
    slab_start: usize,
    slab_end: usize,
    /// `meta[i]` is 1 iff chunk `i` is in use.
    meta: [u8; MAX_CHUNKS],
    data: SlabData,
}

impl Slab {
    /// Map a fresh slab from `source`. The slab comes back empty and
    /// unbound; `bind` must run before the first allocation.
    pub fn create<S: PageSource>(source: &S) -> Result<NonNull<Slab>, OutOfMemory> {
        let mem = match source.alloc(mem::size_of::<Slab>()) {
            Some(mem) => mem,
            None => return Err(OutOfMemory),
        };
        debug_assert_eq!(mem.as_ptr() as usize % mem::align_of::<Slab>(), 0);
        let slab = mem.cast::<Slab>();
        unsafe {
            // Initialize the header only; `data` is caller-visible bytes and
            // gets zeroed chunk by chunk on hand-out.
            let s = slab.as_ptr();
            (*s).state = SlabState::Empty;
            (*s).chunk_size = 0;
            (*s).next_chunk = 0;
            (*s).chunks_left = 0;
            (*s).slab_start = 0;
            (*s).slab_end = 0;
            ptr::write_bytes((*s).meta.as_mut_ptr(), 0, MAX_CHUNKS);
        }
        trace!("created slab {:p}", slab.as_ptr());
        Ok(slab)
    }

    /// Hand the slab's memory back to `source`. The slab must be empty.
    pub unsafe fn destroy<S: PageSource>(slab: NonNull<Slab>, source: &S) {
        debug_assert_eq!((*slab.as_ptr()).state, SlabState::Empty);
        trace!("destroying slab {:p}", slab.as_ptr());
        source.free(slab.cast(), mem::size_of::<Slab>());
    }

    /// Bind the slab to `chunk_size`, resetting the metadata and the cached
    /// data bounds.
    pub fn bind(&mut self, chunk_size: usize) {
        debug_assert_eq!(self.state, SlabState::Empty);
        debug_assert!(SIZE_CLASSES.contains(&chunk_size));
        self.chunk_size = chunk_size;
        self.next_chunk = 0;
        self.chunks_left = SLAB_BYTES / chunk_size;
        self.slab_start = self.data.0.as_ptr() as usize;
        self.slab_end = self.slab_start + SLAB_BYTES;
        for m in self.meta.iter_mut() {
            *m = 0;
        }
        self.state = SlabState::Empty;
    }

    pub fn state(&self) -> SlabState {
        self.state
    }

    fn max_chunks(&self) -> usize {
        SLAB_BYTES / self.chunk_size
    }

    /// Does `it` point into this slab's data region?
    pub fn contains(&self, it: *mut u8) -> bool {
        let addr = it as usize;
        addr >= self.slab_start && addr < self.slab_end
    }

    /// Hand out the next free chunk, zeroed, or `None` if the slab is full.
    ///
    /// The scan starts at the last hand-out's index and wraps once around
    /// the metadata array.
    pub fn next_chunk(&mut self) -> Option<NonNull<u8>> {
        if self.state == SlabState::Full {
            return None;
        }
        debug_assert!(self.chunks_left > 0);
        let max = self.max_chunks();
        let mut idx = if self.next_chunk >= max { 0 } else { self.next_chunk };
        loop {
            if self.meta[idx] == 0 {
                break;
            }
            idx += 1;
            if idx == max {
                idx = 0;
            }
            // chunks_left > 0 guarantees termination
        }
        self.meta[idx] = 1;
        self.next_chunk = idx;
        self.chunks_left -= 1;
        self.state = if self.chunks_left == 0 {
            SlabState::Full
        } else {
            SlabState::Partial
        };
        let chunk = (self.slab_start + idx * self.chunk_size) as *mut u8;
        unsafe {
            ptr::write_bytes(chunk, 0, self.chunk_size);
            Some(NonNull::new_unchecked(chunk))
        }
    }

    /// Release the chunk at `it`, if it lies in this slab. Foreign pointers
    /// are refused without any mutation, which is how buckets discover which
    /// slab a pointer belongs to.
    pub fn free_chunk(&mut self, it: *mut u8) -> bool {
        let addr = it as usize;
        if addr < self.slab_start || addr >= self.slab_end {
            return false;
        }
        debug_assert_eq!((addr - self.slab_start) % self.chunk_size, 0);
        let idx = (addr - self.slab_start) / self.chunk_size;
        debug_assert_eq!(self.meta[idx], 1, "double free of chunk {}", idx);
        self.meta[idx] = 0;
        self.chunks_left += 1;
        self.state = if self.chunks_left == self.max_chunks() {
            SlabState::Empty
        } else {
            SlabState::Partial
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sources::MmapSource;

    fn with_slab<F: FnOnce(&mut Slab)>(chunk_size: usize, f: F) {
        let source = MmapSource::new();
        let slab = Slab::create(&source).expect("mmap should not fail");
        unsafe {
            (*slab.as_ptr()).bind(chunk_size);
            f(&mut *slab.as_ptr());
            Slab::destroy(slab, &source);
        }
    }

    #[test]
    fn fill_then_drain() {
        with_slab(2048, |slab| {
            assert_eq!(slab.state(), SlabState::Empty);
            let chunks: Vec<_> = (0..4).map(|_| slab.next_chunk().unwrap()).collect();
            assert_eq!(slab.state(), SlabState::Full);
            assert!(slab.next_chunk().is_none());
            for (i, c) in chunks.iter().enumerate() {
                assert!(slab.free_chunk(c.as_ptr()));
                let expect = if i == 3 { SlabState::Empty } else { SlabState::Partial };
                assert_eq!(slab.state(), expect);
            }
        });
    }

    #[test]
    fn chunks_are_aligned_and_zeroed() {
        with_slab(256, |slab| {
            let a = slab.next_chunk().unwrap();
            assert_eq!(a.as_ptr() as usize % 256, 0);
            unsafe {
                for i in 0..256 {
                    assert_eq!(*a.as_ptr().offset(i), 0);
                    *a.as_ptr().offset(i) = 0xAB;
                }
            }
            assert!(slab.free_chunk(a.as_ptr()));
            // the same slot comes back, scrubbed
            let b = slab.next_chunk().unwrap();
            assert_eq!(a, b);
            unsafe {
                for i in 0..256 {
                    assert_eq!(*b.as_ptr().offset(i), 0);
                }
            }
            assert!(slab.free_chunk(b.as_ptr()));
        });
    }

    #[test]
    fn scan_wraps_around_the_hint() {
        with_slab(64, |slab| {
            let chunks: Vec<_> = (0..128).map(|_| slab.next_chunk().unwrap()).collect();
            assert_eq!(slab.state(), SlabState::Full);
            // free an early chunk; the hint sits at the end of the array
            assert!(slab.free_chunk(chunks[5].as_ptr()));
            let reused = slab.next_chunk().unwrap();
            assert_eq!(reused, chunks[5]);
            for c in chunks {
                assert!(slab.free_chunk(c.as_ptr()));
            }
        });
    }

    #[test]
    fn foreign_pointers_are_refused() {
        with_slab(64, |slab| {
            let mut outside = 0u8;
            assert!(!slab.free_chunk(&mut outside as *mut u8));
            assert_eq!(slab.state(), SlabState::Empty);
        });
    }

    #[test]
    fn rebinding_changes_geometry() {
        with_slab(64, |slab| {
            let a = slab.next_chunk().unwrap();
            assert!(slab.free_chunk(a.as_ptr()));
            slab.bind(1024);
            let chunks: Vec<_> = (0..8).map(|_| slab.next_chunk().unwrap()).collect();
            assert_eq!(slab.state(), SlabState::Full);
            for c in chunks {
                assert!(slab.free_chunk(c.as_ptr()));
            }
        });
    }
}
