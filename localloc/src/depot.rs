// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide lost-and-found for cross-thread frees.
//!
//! A free on thread T of a chunk allocated on thread U must not touch U's
//! slabs. Instead, T parks the chunk in a per-size-class list guarded by a
//! one-byte spin lock, and U adopts matching chunks back the next time it
//! works in the same size class. The lists are intrusive: the link lives in
//! the first word of the parked chunk itself (every chunk is at least 64
//! bytes, and the chunk is dead), so parking never allocates and the code
//! here can safely run inside any allocation path.
//!
//! Lock operations use acquire on the taking side and release on the
//! releasing side, so list writes made under the lock are visible to the
//! next holder. Nothing stronger is promised: in particular there is no
//! ordering between allocations on unrelated threads.
//!
//! The depot itself is created by the first thread allocator to come up and
//! torn down when the last one goes away; every live allocator holds a
//! strong reference. At teardown every list must be empty - a parked chunk
//! with no live owner means the owning thread leaked it.

use std::cell::UnsafeCell;
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use {N_CLASSES, SIZE_CLASSES};

/// A one-byte lock: 1 is available, 0 is held.
struct ByteLock(AtomicU8);

impl ByteLock {
    fn new() -> ByteLock {
        ByteLock(AtomicU8::new(1))
    }

    /// A single exchange; success is the observation of a 1.
    fn try_acquire(&self) -> bool {
        self.0.swap(0, Ordering::Acquire) == 1
    }

    fn acquire(&self) {
        while !self.try_acquire() {
            hint::spin_loop();
        }
    }

    fn release(&self) {
        self.0.store(1, Ordering::Release);
    }
}

/// The link written into the head of a parked chunk.
#[repr(C)]
struct Link {
    next: *mut u8,
}

/// One size class's worth of parked chunks.
pub struct DepotList {
    lock: ByteLock,
    head: UnsafeCell<*mut u8>,
}

unsafe impl Send for DepotList {}
unsafe impl Sync for DepotList {}

impl DepotList {
    fn new() -> DepotList {
        DepotList {
            lock: ByteLock::new(),
            head: UnsafeCell::new(ptr::null_mut()),
        }
    }

    /// Park `it`. Blocks on the lock; the critical section on every path is
    /// a handful of stores, so the wait is short.
    pub unsafe fn deposit(&self, it: *mut u8) {
        trace!("parking {:p}", it);
        self.lock.acquire();
        (*(it as *mut Link)).next = *self.head.get();
        *self.head.get() = it;
        self.lock.release();
    }

    /// Walk the list with the lock held, unlinking every chunk for which
    /// `reclaim` returns true. When `block` is unset and the lock is
    /// contended the walk is skipped entirely - the chunks are not going
    /// anywhere, and a later call will get them.
    pub unsafe fn drain<F: FnMut(*mut u8) -> bool>(&self, block: bool, mut reclaim: F) {
        if block {
            self.lock.acquire();
        } else if !self.lock.try_acquire() {
            return;
        }
        let mut link: *mut *mut u8 = self.head.get();
        while !(*link).is_null() {
            let chunk = *link;
            let next = (*(chunk as *mut Link)).next;
            if reclaim(chunk) {
                trace!("adopted {:p}", chunk);
                *link = next;
            } else {
                link = &mut (*(chunk as *mut Link)).next;
            }
        }
        self.lock.release();
    }

    fn parked(&self) -> usize {
        self.lock.acquire();
        let mut n = 0;
        unsafe {
            let mut cur = *self.head.get();
            while !cur.is_null() {
                n += 1;
                cur = (*(cur as *mut Link)).next;
            }
        }
        self.lock.release();
        n
    }
}

/// The lists, one per size class.
pub struct Depot {
    lists: [DepotList; N_CLASSES],
}

impl Depot {
    fn new() -> Depot {
        Depot {
            lists: [
                DepotList::new(),
                DepotList::new(),
                DepotList::new(),
                DepotList::new(),
                DepotList::new(),
                DepotList::new(),
            ],
        }
    }

    pub fn class(&self, idx: usize) -> &DepotList {
        &self.lists[idx]
    }

    /// Number of chunks currently parked for class `idx`.
    pub fn parked(&self, idx: usize) -> usize {
        self.lists[idx].parked()
    }
}

impl Drop for Depot {
    fn drop(&mut self) {
        for (idx, list) in self.lists.iter().enumerate() {
            let parked = list.parked();
            if parked != 0 {
                fatal!(
                    "lost-and-found torn down with {} chunk(s) of class {} still parked",
                    parked,
                    SIZE_CLASSES[idx]
                );
            }
        }
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<Weak<Depot>> = Mutex::new(Weak::new());
}

/// Attach to the process-wide depot, creating it if this is the first live
/// allocator. The returned handle keeps the depot alive; the count of live
/// handles is the count of live thread allocators.
pub fn attach() -> Arc<Depot> {
    let mut registry = REGISTRY.lock().unwrap();
    if let Some(depot) = registry.upgrade() {
        return depot;
    }
    info!("creating the cross-thread free depot");
    let depot = Arc::new(Depot::new());
    *registry = Arc::downgrade(&depot);
    depot
}
