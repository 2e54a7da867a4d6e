// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocations beyond the largest size class.
//!
//! These bypass the slab machinery entirely: the page source maps a region
//! of the requested size plus one leading page, and that page records the
//! region's base and true extent. `free` and `resize` read the record back
//! from the pointer alone, so they stay correct no matter what length the
//! caller reports - in particular the synthetic boundary length produced by
//! shrinking a region into the size-class window.

use std::cmp;
use std::mem;
use std::ptr::{self, NonNull};

use sources::PageSource;
use util::round_up;
use OutOfMemory;

/// Bookkeeping written at the base of the mapped region, one page ahead of
/// the pointer handed to the caller.
#[repr(C)]
struct RegionInfo {
    base: *mut u8,
    region_size: usize,
    user_size: usize,
}

unsafe fn info_for(it: *mut u8, page: usize) -> *mut RegionInfo {
    (it as usize - page) as *mut RegionInfo
}

pub fn alloc<S: PageSource>(source: &S, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
    let page = source.page_size();
    debug_assert!(page >= mem::size_of::<RegionInfo>());
    let region_size = round_up(size, page) + page;
    let base = match source.alloc(region_size) {
        Some(base) => base,
        None => return Err(OutOfMemory),
    };
    unsafe {
        ptr::write(
            base.as_ptr() as *mut RegionInfo,
            RegionInfo {
                base: base.as_ptr(),
                region_size: region_size,
                user_size: size,
            },
        );
        let it = base.as_ptr().offset(page as isize);
        debug_assert_eq!(it as usize % page, 0);
        trace!("big alloc({}) -> {:p} in {}-byte region", size, it, region_size);
        Ok(NonNull::new_unchecked(it))
    }
}

pub unsafe fn free<S: PageSource>(source: &S, it: *mut u8) {
    let page = source.page_size();
    let info = ptr::read(info_for(it, page));
    debug_assert_eq!(info.base as usize + page, it as usize);
    trace!("big free({:p}): {}-byte region", it, info.region_size);
    source.free(NonNull::new_unchecked(info.base), info.region_size);
}

/// The length the caller most recently asked for.
pub unsafe fn usable_size<S: PageSource>(source: &S, it: *mut u8) -> usize {
    (*info_for(it, source.page_size())).user_size
}

/// Resize in place when the region (or the source) allows it, otherwise
/// alloc-copy-free. On failure the original region is untouched.
pub unsafe fn resize<S: PageSource>(
    source: &S,
    it: *mut u8,
    new_size: usize,
) -> Result<NonNull<u8>, OutOfMemory> {
    let page = source.page_size();
    let info = info_for(it, page);
    let capacity = (*info).region_size - page;
    if new_size <= capacity {
        (*info).user_size = new_size;
        return Ok(NonNull::new_unchecked(it));
    }
    let grown = round_up(new_size, page) + page;
    if source.resize(NonNull::new_unchecked((*info).base), (*info).region_size, grown) {
        (*info).region_size = grown;
        (*info).user_size = new_size;
        return Ok(NonNull::new_unchecked(it));
    }
    let fresh = alloc(source, new_size)?;
    ptr::copy_nonoverlapping(it, fresh.as_ptr(), cmp::min((*info).user_size, new_size));
    free(source, it);
    Ok(fresh)
}
