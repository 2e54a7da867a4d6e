// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page-level memory sources backing the allocator.

use std::ptr::{self, NonNull};

use errno::errno;
use libc;

use util::round_up;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("localloc only supports Linux and Mac");

/// A provider of raw memory underneath the slab machinery.
///
/// The allocator obtains slab storage and oversized allocations from a
/// `PageSource`, and hands both back through it. Implementations must return
/// ranges aligned to at least the system page size; the slab code relies on
/// this for the natural alignment of its chunks.
///
/// Sources use a `Clone`-based interface so that per-thread allocators can
/// share one underlying provider, as with the memory sources in scalable
/// malloc designs.
pub trait PageSource: Clone {
    /// The granularity of the underlying mappings.
    fn page_size(&self) -> usize;

    /// Obtain at least `len` fresh bytes, or `None` if the system is out of
    /// memory.
    fn alloc(&self, len: usize) -> Option<NonNull<u8>>;

    /// Release a range previously obtained from `alloc` with the same
    /// length.
    unsafe fn free(&self, it: NonNull<u8>, len: usize);

    /// Grow or shrink a range in place. Returns `false` when the request
    /// cannot be served without moving the range; the caller then falls back
    /// to alloc-copy-free.
    unsafe fn resize(&self, it: NonNull<u8>, old_len: usize, new_len: usize) -> bool;
}

/// A `PageSource` that calls straight into `mmap`.
#[derive(Copy, Clone)]
pub struct MmapSource {
    page_size: usize,
}

impl MmapSource {
    pub fn new() -> MmapSource {
        MmapSource { page_size: ::sysconf::page::pagesize() }
    }
}

impl Default for MmapSource {
    fn default() -> MmapSource {
        MmapSource::new()
    }
}

impl PageSource for MmapSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc(&self, len: usize) -> Option<NonNull<u8>> {
        let rounded = round_up(len, self.page_size);
        trace!("map({})", rounded);
        unsafe {
            let mem = libc::mmap(
                ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if mem == libc::MAP_FAILED {
                debug!("mmap of {} bytes failed: {}", rounded, errno());
                return None;
            }
            NonNull::new(mem as *mut u8)
        }
    }

    unsafe fn free(&self, it: NonNull<u8>, len: usize) {
        let rounded = round_up(len, self.page_size);
        trace!("unmap({:p}, {})", it.as_ptr(), rounded);
        if libc::munmap(it.as_ptr() as *mut libc::c_void, rounded) != 0 {
            fatal!("munmap({:p}, {}) failed: {}", it.as_ptr(), rounded, errno());
        }
    }

    unsafe fn resize(&self, _it: NonNull<u8>, old_len: usize, new_len: usize) -> bool {
        // The mapping is made of whole pages; any request within the same
        // rounded length is already in place.
        round_up(old_len, self.page_size) == round_up(new_len, self.page_size)
    }
}
