//! Resident-page list of a process.
//!
//! A fixed pool of slots, pre-allocated when the process is created. Slots
//! in use form a doubly-linked list ordered by when the page became
//! resident: newest at the head, oldest at the tail. The tail is always the
//! next eviction victim (FIFO, not LRU). Unused slots are chained on a free
//! list through the same `next` link.

use alloc::vec::Vec;
use x86_64::VirtAddr;

const NIL: u32 = u32::MAX;

/// Index of a slot in the resident pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(u32);

#[derive(Debug, Clone, Copy)]
struct Slot {
    va: Option<VirtAddr>,
    prev: u32,
    next: u32,
}

/// A slot unlinked from the tail of the list.
///
/// It is neither resident nor free until handed back through
/// [`ResidentTable::relink_head`] or [`ResidentTable::free`].
#[must_use]
#[derive(Debug)]
pub struct Evicted {
    slot: u32,
    va: VirtAddr,
}

impl Evicted {
    /// The page that was resident in this slot.
    pub fn va(&self) -> VirtAddr {
        self.va
    }
}

/// Per-process FIFO of resident pages.
pub struct ResidentTable {
    slots: Vec<Slot>,
    head: u32,
    tail: u32,
    free_head: u32,
    len: usize,
}

impl ResidentTable {
    /// Pool with room for `capacity` resident pages.
    pub fn new(capacity: usize) -> Self {
        let mut table = ResidentTable {
            slots: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            free_head: NIL,
            len: 0,
        };
        table.slots.resize(capacity, Slot { va: None, prev: NIL, next: NIL });
        table.reset_free_list();
        table
    }

    fn reset_free_list(&mut self) {
        self.free_head = NIL;
        for index in (0..self.slots.len()).rev() {
            self.slots[index] = Slot { va: None, prev: NIL, next: self.free_head };
            self.free_head = index as u32;
        }
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Pages linked into the list.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// No free slot left; the next page needs an eviction first.
    pub fn is_full(&self) -> bool {
        self.free_head == NIL
    }

    fn take_free(&mut self) -> Option<u32> {
        if self.free_head == NIL {
            return None;
        }
        let index = self.free_head;
        self.free_head = self.slots[index as usize].next;
        Some(index)
    }

    fn link_head(&mut self, index: u32, va: VirtAddr) {
        let old_head = self.head;
        self.slots[index as usize] = Slot { va: Some(va), prev: NIL, next: old_head };
        if old_head == NIL {
            self.tail = index;
        } else {
            self.slots[old_head as usize].prev = index;
        }
        self.head = index;
        self.len += 1;
    }

    fn link_tail(&mut self, index: u32, va: VirtAddr) {
        let old_tail = self.tail;
        self.slots[index as usize] = Slot { va: Some(va), prev: old_tail, next: NIL };
        if old_tail == NIL {
            self.head = index;
        } else {
            self.slots[old_tail as usize].next = index;
        }
        self.tail = index;
        self.len += 1;
    }

    fn unlink(&mut self, index: u32) -> VirtAddr {
        let slot = self.slots[index as usize];
        let va = match slot.va {
            Some(va) => va,
            None => panic!("[VM] unlinking free resident slot {}", index),
        };
        if slot.prev == NIL {
            self.head = slot.next;
        } else {
            self.slots[slot.prev as usize].next = slot.next;
        }
        if slot.next == NIL {
            self.tail = slot.prev;
        } else {
            self.slots[slot.next as usize].prev = slot.prev;
        }
        self.slots[index as usize] = Slot { va: None, prev: NIL, next: NIL };
        self.len -= 1;
        va
    }

    fn release_slot(&mut self, index: u32) {
        self.slots[index as usize].next = self.free_head;
        self.free_head = index;
    }

    /// Record `va` as the newest resident page.
    ///
    /// Panics when the pool is full; callers evict first.
    pub fn record(&mut self, va: VirtAddr) -> SlotId {
        match self.take_free() {
            Some(index) => {
                self.link_head(index, va);
                SlotId(index)
            }
            None => panic!("[VM] no free resident slot for {:#x}", va.as_u64()),
        }
    }

    /// Oldest resident page, without unlinking it.
    pub fn tail(&self) -> Option<VirtAddr> {
        if self.tail == NIL {
            return None;
        }
        self.slots[self.tail as usize].va
    }

    /// Unlink the oldest resident page.
    pub fn evict_tail(&mut self) -> Option<Evicted> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        let va = self.unlink(slot);
        Some(Evicted { slot, va })
    }

    /// Reuse an evicted slot for `va` at the head of the list.
    pub fn relink_head(&mut self, evicted: Evicted, va: VirtAddr) -> SlotId {
        self.link_head(evicted.slot, va);
        SlotId(evicted.slot)
    }

    /// Return an evicted slot to the free pool.
    pub fn free(&mut self, evicted: Evicted) {
        self.release_slot(evicted.slot);
    }

    /// Detach `slot` from anywhere in the list and free it.
    pub fn remove(&mut self, slot: SlotId) -> VirtAddr {
        let va = self.unlink(slot.0);
        self.release_slot(slot.0);
        va
    }

    /// Slot holding `va`, scanning the list.
    pub fn find(&self, va: VirtAddr) -> Option<SlotId> {
        let mut cursor = self.head;
        while cursor != NIL {
            let slot = &self.slots[cursor as usize];
            if slot.va == Some(va) {
                return Some(SlotId(cursor));
            }
            cursor = slot.next;
        }
        None
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.find(va).is_some()
    }

    /// Resident pages from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let slot = &self.slots[cursor as usize];
            cursor = slot.next;
            slot.va
        })
    }

    /// Make this list a copy of `src`: same pages, same order.
    ///
    /// Panics if `src` holds more pages than this pool can.
    pub fn copy_from(&mut self, src: &ResidentTable) {
        if src.len() > self.capacity() {
            panic!("[VM] resident copy of {} pages into pool of {}", src.len(), self.capacity());
        }
        self.reset_free_list();
        for va in src.iter() {
            let index = match self.take_free() {
                Some(index) => index,
                None => unreachable!(),
            };
            self.link_tail(index, va);
        }
    }

    /// Forget every resident page.
    pub fn clear(&mut self) {
        self.reset_free_list();
    }
}
