// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A slab allocator with per-thread instances and a cross-thread free hand-off.
//!
//! # Design
//!
//! Requests up to [`LARGEST_ALLOC`] bytes are served from slabs - fixed-size
//! regions carved into equally sized chunks - in the tradition of the SunOS 5.4
//! slab allocator described in [The Slab Allocator: An Object-Caching Kernel
//! Memory Allocator][1]. Each of the six size classes has a bucket owning the
//! slabs currently bound to that class. A slab whose chunks are all free is
//! eagerly detached from its bucket and parked in a small per-thread pool,
//! from which any bucket can later rebind it to its own class; only when the
//! pool overflows does a slab go back to the page provider. Requests larger
//! than the largest class bypass the slab machinery entirely and are mapped
//! directly by the page provider (see [`PageSource`]).
//!
//! Every thread owns a private allocator, reachable through the functions in
//! [`local`], so the hot paths never take a lock. A free of a chunk that was
//! allocated on a different thread is parked in a process-wide lost-and-found
//! keyed by size class; the owning thread adopts parked chunks back the next
//! time it works in the same bucket.
//!
//! Chunks carry no headers. A bucket attributes a pointer to a slab by
//! address-range containment, which doubles as the index computation for the
//! chunk's metadata slot, and the full chunk is available to the caller.
//! The price is that `free` must name the length it was given, so the caller
//! (or a veneer such as the `locc` crate) is responsible for remembering it.
//!
//! [1]: http://www.usenix.org/publications/library/proceedings/bos94/full_papers/bonwick.ps

extern crate errno;
#[macro_use]
extern crate lazy_static;
extern crate libc;
#[macro_use]
extern crate log;
extern crate smallvec;
extern crate sysconf;

#[cfg(test)]
extern crate env_logger;
#[cfg(test)]
extern crate num_cpus;
#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
extern crate rand;

#[macro_use]
mod util;

mod big;
mod bucket;
mod depot;
pub mod local;
mod slab;
mod sources;
#[cfg(test)]
mod tests;

use std::error::Error;
use std::fmt;

pub use local::LocalAllocator;
pub use sources::{MmapSource, PageSource};

/// The chunk sizes served from slabs, smallest first. Each class is a power
/// of two, and chunks of a class are aligned to the class size.
pub const SIZE_CLASSES: [usize; 6] = [64, 128, 256, 512, 1024, 2048];

pub(crate) const N_CLASSES: usize = SIZE_CLASSES.len();

/// The largest length served from a size-class bucket. Anything bigger goes
/// straight to the page provider.
pub const LARGEST_ALLOC: usize = SIZE_CLASSES[N_CLASSES - 1];

/// The page provider could not serve a request for a fresh slab or an
/// oversized allocation. The operation had no effect.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "page provider out of memory")
    }
}

impl Error for OutOfMemory {}
