//! Pre-allocated connection slots and the lock-free free list that recycles
//! them.
//!
//! The slab is a fixed, contiguous array of [`Slot`] records allocated once
//! at pool startup. Every slot is either LIVE (socket attached, registered
//! with the poller) or chained onto an intrusive LIFO free list. Acquire and
//! release are single compare-exchange operations; the pool never allocates
//! on the accept path.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Free-list terminator.
const NIL: u32 = u32::MAX;

/// One connection record.
///
/// `uuid` is assigned at slab construction and identifies the slot for the
/// life of the pool; a recycled slot carries the same `uuid` for a later
/// connection. The socket descriptor doubles as the liveness flag: 0 means
/// the slot is idle.
pub struct Slot {
    uuid: u32,
    sfd: AtomicI32,
    next: AtomicU32,
}

impl Slot {
    pub fn uuid(&self) -> u32 {
        self.uuid
    }

    pub fn fd(&self) -> RawFd {
        self.sfd.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, sfd: RawFd) {
        self.sfd.store(sfd, Ordering::Release);
    }

    /// Claim the descriptor, leaving the slot idle. Exactly one caller
    /// observes the live descriptor; everyone else gets 0.
    pub(crate) fn take_fd(&self) -> RawFd {
        self.sfd.swap(0, Ordering::AcqRel)
    }
}

/// Contiguous arena backing every slot's inbound buffer.
///
/// Sized to a whole number of memory pages. Regions are disjoint per slot;
/// the one-shot registration discipline means at most one worker touches a
/// given region at a time.
struct RecvArena {
    base: *mut u8,
    bytes: usize,
    slot_size: usize,
}

// Safety: disjoint regions are handed out per slot index, and per-slot
// exclusivity is enforced by one-shot event delivery.
unsafe impl Send for RecvArena {}
unsafe impl Sync for RecvArena {}

impl RecvArena {
    fn new(capacity: usize, slot_size: usize) -> Self {
        let bytes = round_to_page(capacity * slot_size);
        let storage: Box<[u8]> = vec![0u8; bytes].into_boxed_slice();
        let base = Box::into_raw(storage) as *mut u8;
        RecvArena {
            base,
            bytes,
            slot_size,
        }
    }

    /// # Safety
    ///
    /// The caller must hold the slot's event exclusively (one-shot delivery
    /// not yet re-armed). Two live references to the same region are never
    /// created under that discipline.
    unsafe fn region(&self, index: u32) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(index as usize * self.slot_size),
                self.slot_size,
            )
        }
    }
}

impl Drop for RecvArena {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.base, self.bytes,
            )));
        }
    }
}

/// Intrusive LIFO over slot indices.
///
/// Treiber stack with release on the winning exchange. No generation tags:
/// slots never move and the index set is closed, so a recycled index
/// reappearing at the head leaves a stale pop's already-observed next link
/// intact.
struct FreeStack {
    head: AtomicU32,
}

impl FreeStack {
    fn push(&self, slots: &[Slot], index: u32) {
        let slot = &slots[index as usize];
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            slot.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, index, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    fn pop(&self, slots: &[Slot]) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == NIL {
                return None;
            }
            let next = slots[head as usize].next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return Some(head),
                Err(observed) => head = observed,
            }
        }
    }
}

/// Fixed-capacity slot store.
pub struct Slab {
    slots: Box<[Slot]>,
    arena: RecvArena,
    free: FreeStack,
}

impl Slab {
    /// Allocate `capacity` slots, chain all of them onto the free list, and
    /// reserve a page-rounded receive arena of `buffer_size` bytes per slot.
    pub fn new(capacity: usize, buffer_size: usize) -> Slab {
        let slots: Box<[Slot]> = (0..capacity)
            .map(|i| Slot {
                uuid: i as u32,
                sfd: AtomicI32::new(0),
                next: AtomicU32::new(if i == 0 { NIL } else { i as u32 - 1 }),
            })
            .collect();

        Slab {
            slots,
            arena: RecvArena::new(capacity, buffer_size),
            free: FreeStack {
                head: AtomicU32::new(if capacity == 0 { NIL } else { capacity as u32 - 1 }),
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: u32) -> &Slot {
        &self.slots[index as usize]
    }

    /// Pop a free slot. `None` means the pool is at capacity.
    pub fn acquire(&self) -> Option<u32> {
        self.free.pop(&self.slots)
    }

    /// Return a slot to the free list.
    pub fn release(&self, index: u32) {
        self.free.push(&self.slots, index);
    }

    /// # Safety
    ///
    /// See [`RecvArena::region`]: the caller must be the worker holding the
    /// slot's un-rearmed event.
    pub(crate) unsafe fn recv_buf(&self, index: u32) -> &mut [u8] {
        unsafe { self.arena.region(index) }
    }
}

fn round_to_page(bytes: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    match bytes % page {
        0 => bytes.max(page),
        rem => bytes + page - rem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn acquire_drains_to_capacity() {
        let slab = Slab::new(4, 64);
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let index = slab.acquire().unwrap();
            assert!(seen.insert(index), "index {index} handed out twice");
        }
        assert!(slab.acquire().is_none());
    }

    #[test]
    fn release_makes_slot_reacquirable() {
        let slab = Slab::new(2, 64);
        let a = slab.acquire().unwrap();
        let b = slab.acquire().unwrap();
        assert!(slab.acquire().is_none());

        slab.release(a);
        assert_eq!(slab.acquire(), Some(a));

        slab.release(b);
        slab.release(a);
        assert_eq!(slab.capacity(), 2);
    }

    #[test]
    fn uuid_matches_index_and_is_stable() {
        let slab = Slab::new(8, 64);
        for i in 0..8u32 {
            assert_eq!(slab.get(i).uuid(), i);
        }
        let index = slab.acquire().unwrap();
        let uuid = slab.get(index).uuid();
        slab.release(index);
        let again = slab.acquire().unwrap();
        assert_eq!(slab.get(again).uuid(), uuid);
    }

    #[test]
    fn take_fd_claims_once() {
        let slab = Slab::new(1, 64);
        let slot = slab.get(0);
        slot.attach(42);
        assert_eq!(slot.take_fd(), 42);
        assert_eq!(slot.take_fd(), 0);
        assert_eq!(slot.fd(), 0);
    }

    #[test]
    fn concurrent_churn_never_duplicates_a_slot() {
        const CAPACITY: usize = 64;
        const ROUNDS: usize = 2_000;

        let slab = Slab::new(CAPACITY, 16);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut held = Vec::new();
                    for round in 0..ROUNDS {
                        if let Some(index) = slab.acquire() {
                            held.push(index);
                        }
                        if round % 3 == 0 {
                            for index in held.drain(..) {
                                slab.release(index);
                            }
                        }
                    }
                    for index in held {
                        slab.release(index);
                    }
                });
            }
        });

        // Every slot must be back exactly once.
        let mut seen = HashSet::new();
        for _ in 0..CAPACITY {
            let index = slab.acquire().expect("free list lost a slot");
            assert!(seen.insert(index), "free list duplicated slot {index}");
        }
        assert!(slab.acquire().is_none());
    }
}
