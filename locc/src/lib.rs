// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C-compatible entry points over the `localloc` core.
//!
//! The core's interface is length-parameterized: `free` and `resize` must be
//! told how long the range is. C callers only hand back bare pointers, so
//! this crate keeps a side table from pointer to the length the core
//! reported, serialized on a single mutex. The table makes no attempt to be
//! clever; it exists to translate, not to scale.
//!
//! With the `preload` feature the entry points are exported under their
//! unmangled C names so the cdylib can be injected with `LD_PRELOAD`. Be
//! warned that the table below lives in Rust collections: a process whose
//! Rust global allocator is itself routed through these symbols will
//! recurse. The feature is off by default, which leaves the symbols mangled
//! and the crate safe to link and test like any other.

#[macro_use]
extern crate lazy_static;
extern crate libc;
extern crate localloc;
extern crate spin;

use std::cmp;
use std::collections::HashMap;
use std::ptr;

use libc::{c_int, c_void, size_t};
use localloc::{local, LARGEST_ALLOC};

lazy_static! {
    static ref LENGTHS: spin::Mutex<HashMap<usize, usize>> = spin::Mutex::new(HashMap::new());
}

fn remember(it: *mut u8, len: usize) {
    LENGTHS.lock().insert(it as usize, len);
}

fn recall(it: *mut u8) -> Option<usize> {
    LENGTHS.lock().remove(&(it as usize))
}

#[cfg_attr(feature = "preload", no_mangle)]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    if size == 0 {
        return ptr::null_mut();
    }
    // glibc promises at least 8-byte alignment; the smallest size class and
    // the page source both over-deliver, so no rounding is needed here.
    match local::alloc(size) {
        Ok(it) => {
            remember(it, size);
            it as *mut c_void
        }
        Err(_) => ptr::null_mut(),
    }
}

#[cfg_attr(feature = "preload", no_mangle)]
pub unsafe extern "C" fn free(it: *mut c_void) {
    if it.is_null() {
        return;
    }
    match recall(it as *mut u8) {
        Some(len) => local::free(it as *mut u8, len),
        None => {
            eprintln!("free(): invalid pointer {:p}", it);
            ::std::process::abort();
        }
    }
}

#[cfg_attr(feature = "preload", no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let bytes = match nmemb.checked_mul(size) {
        Some(0) | None => return ptr::null_mut(),
        Some(bytes) => bytes,
    };
    let it = malloc(bytes);
    if !it.is_null() {
        // size-class chunks come back zeroed, but that is not part of the
        // core's contract; write the zeros either way
        ptr::write_bytes(it as *mut u8, 0, bytes);
    }
    it
}

#[cfg_attr(feature = "preload", no_mangle)]
pub unsafe extern "C" fn realloc(it: *mut c_void, new_size: size_t) -> *mut c_void {
    if it.is_null() {
        return malloc(new_size);
    }
    if new_size == 0 {
        free(it);
        return ptr::null_mut();
    }
    let old_len = match recall(it as *mut u8) {
        Some(len) => len,
        None => {
            eprintln!("realloc(): invalid pointer {:p}", it);
            ::std::process::abort();
        }
    };
    match local::resize(it as *mut u8, old_len, new_size) {
        Ok((moved, reported)) => {
            remember(moved, reported);
            moved as *mut c_void
        }
        Err(_) => {
            // the original range is still valid; put its entry back
            remember(it as *mut u8, old_len);
            ptr::null_mut()
        }
    }
}

#[cfg_attr(feature = "preload", no_mangle)]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    if align == 0 || !align.is_power_of_two() || size == 0 {
        return ptr::null_mut();
    }
    if align > LARGEST_ALLOC {
        // The core serves alignment up to its largest class; beyond that
        // the page source's mappings are page-aligned, so route the request
        // there by asking for an oversized range.
        if align > libc::sysconf(libc::_SC_PAGESIZE) as usize {
            return ptr::null_mut();
        }
        let len = cmp::max(size, 2 * LARGEST_ALLOC);
        return match local::alloc(len) {
            Ok(it) => {
                remember(it, len);
                it as *mut c_void
            }
            Err(_) => ptr::null_mut(),
        };
    }
    match local::alloc_aligned(size, align) {
        Ok((it, len)) => {
            remember(it, len);
            it as *mut c_void
        }
        Err(_) => ptr::null_mut(),
    }
}

#[cfg_attr(feature = "preload", no_mangle)]
pub extern "C" fn exit(code: c_int) -> ! {
    // bypass atexit machinery, which may call back into a torn-down heap
    unsafe { libc::_exit(code) }
}

#[cfg_attr(feature = "preload", no_mangle)]
pub extern "C" fn abort() -> ! {
    ::std::process::abort();
}
