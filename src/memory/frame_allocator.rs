//! Reference-counted physical frame allocator.
//!
//! Frames come from the usable regions of the bootloader memory map and
//! are chained into a free list. Every frame carries a reference count:
//! one per present page-table entry (or kernel owner) that points at it.
//! `release` drops one reference and only puts the frame back on the free
//! list when the count reaches zero, which is what lets copy-on-write share
//! a frame between processes without a separate sharing table.
//!
//! The free list, the counts and the frame contents all sit behind one
//! spinlock. Critical sections are a list push/pop, a counter update or a
//! single page copy.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{PAGE_SIZE, POISON};

/// Raw bytes of one frame.
pub type FrameBytes = [u8; PAGE_SIZE as usize];

/// End-of-list marker for the free list.
const NIL: u32 = u32::MAX;

// ─── Physical memory access ─────────────────────────────────────

/// Access to the bytes of physical frames.
///
/// The allocator only calls this while holding its lock, so an
/// implementation never sees two overlapping borrows.
pub trait PhysicalMemory: Send {
    fn frame_mut(&mut self, frame: PhysFrame) -> &mut FrameBytes;
}

/// Physical memory mapped at a fixed offset by the bootloader.
pub struct DirectMap {
    offset: VirtAddr,
}

impl DirectMap {
    /// # Safety
    /// `offset` must be the offset at which the bootloader mapped all of
    /// physical memory, and the frames handed to the allocator must not be
    /// accessed through any other path.
    pub unsafe fn new(offset: VirtAddr) -> Self {
        DirectMap { offset }
    }
}

impl PhysicalMemory for DirectMap {
    fn frame_mut(&mut self, frame: PhysFrame) -> &mut FrameBytes {
        let virt = self.offset + frame.start_address().as_u64();
        // SAFETY: `new` guarantees the mapping; the allocator lock
        // guarantees exclusive access.
        unsafe { &mut *virt.as_mut_ptr::<FrameBytes>() }
    }
}

/// Frames kept on the kernel heap. Used by hosted builds and tests; a
/// frame's storage is only created the first time it is touched.
pub struct HeapBacked {
    base: u64,
    frames: Vec<Option<Box<FrameBytes>>>,
}

impl HeapBacked {
    /// Back `count` frames starting at physical address `base`.
    pub fn new(base: PhysAddr, count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        frames.resize_with(count, || None);
        HeapBacked { base: base.as_u64(), frames }
    }
}

impl PhysicalMemory for HeapBacked {
    fn frame_mut(&mut self, frame: PhysFrame) -> &mut FrameBytes {
        let index = ((frame.start_address().as_u64() - self.base) / PAGE_SIZE) as usize;
        self.frames[index].get_or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]))
    }
}

// ─── Allocator ──────────────────────────────────────────────────

struct FrameTable {
    memory: Box<dyn PhysicalMemory>,
    /// Physical address of frame index 0.
    base: u64,
    /// Reference count per frame index.
    refs: Vec<u32>,
    /// Free-list link per frame index.
    next: Vec<u32>,
    free_head: u32,
    free_count: usize,
    in_use: usize,
}

impl FrameTable {
    fn index(&self, frame: PhysFrame) -> usize {
        let addr = frame.start_address().as_u64();
        let end = self.base + self.refs.len() as u64 * PAGE_SIZE;
        if addr < self.base || addr >= end {
            panic!("[FRAME] {:#x} outside managed range {:#x}..{:#x}", addr, self.base, end);
        }
        ((addr - self.base) / PAGE_SIZE) as usize
    }

    fn frame_at(&self, index: u32) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(self.base + index as u64 * PAGE_SIZE))
    }

    fn push_free(&mut self, index: usize) {
        self.next[index] = self.free_head;
        self.free_head = index as u32;
        self.free_count += 1;
    }

    fn pop_free(&mut self) -> Option<usize> {
        if self.free_head == NIL {
            return None;
        }
        let index = self.free_head as usize;
        self.free_head = self.next[index];
        self.next[index] = NIL;
        self.free_count -= 1;
        Some(index)
    }

    /// Drop one reference, reclaiming the frame when none remain.
    fn put(&mut self, frame: PhysFrame) -> u32 {
        let index = self.index(frame);
        match self.refs[index] {
            0 => panic!("[FRAME] release of unreferenced frame {:#x}", frame.start_address().as_u64()),
            1 => {
                self.refs[index] = 0;
                self.memory.frame_mut(frame).fill(POISON);
                self.push_free(index);
                self.in_use -= 1;
                0
            }
            n => {
                self.refs[index] = n - 1;
                n - 1
            }
        }
    }
}

/// The kernel's physical frame allocator.
pub struct FrameAllocator {
    table: Mutex<FrameTable>,
}

impl FrameAllocator {
    /// Manage the frames of every usable region in `regions`.
    ///
    /// The counted range spans from the lowest to the highest usable
    /// address; holes between regions are tracked but never handed out.
    pub fn from_memory_regions(regions: &[MemoryRegion], memory: Box<dyn PhysicalMemory>) -> Self {
        let usable = || {
            regions
                .iter()
                .filter(|r| r.kind == MemoryRegionKind::Usable)
                .map(|r| (align_up(r.start), r.end & !(PAGE_SIZE - 1)))
                .filter(|(start, end)| start < end)
        };
        let base = usable().map(|(start, _)| start).min().unwrap_or(0);
        let end = usable().map(|(_, end)| end).max().unwrap_or(base);
        let count = ((end - base) / PAGE_SIZE) as usize;

        let mut table = FrameTable {
            memory,
            base,
            refs: vec![0; count],
            next: vec![NIL; count],
            free_head: NIL,
            free_count: 0,
            in_use: 0,
        };
        // Push in reverse so the lowest frame is handed out first.
        let mut ranges: Vec<(u64, u64)> = usable().collect();
        ranges.sort_unstable();
        for (start, end) in ranges.into_iter().rev() {
            let mut addr = end;
            while addr > start {
                addr -= PAGE_SIZE;
                table.push_free(((addr - base) / PAGE_SIZE) as usize);
            }
        }
        FrameAllocator { table: Mutex::new(table) }
    }

    /// Manage the `count` frames starting at `base` (a single usable range).
    pub fn with_range(base: PhysAddr, count: usize, memory: Box<dyn PhysicalMemory>) -> Self {
        let mut region = MemoryRegion::empty();
        region.start = base.as_u64();
        region.end = base.as_u64() + count as u64 * PAGE_SIZE;
        region.kind = MemoryRegionKind::Usable;
        Self::from_memory_regions(&[region], memory)
    }

    /// Host allocator over `count` heap-backed frames at `base`.
    pub fn heap_backed(base: PhysAddr, count: usize) -> Self {
        Self::with_range(base, count, Box::new(HeapBacked::new(base, count)))
    }

    /// Take a frame off the free list with a reference count of one.
    /// The contents are whatever was there before (poison, usually).
    pub fn allocate(&self) -> Option<PhysFrame> {
        let mut table = self.table.lock();
        let index = table.pop_free()?;
        table.refs[index] = 1;
        table.in_use += 1;
        Some(table.frame_at(index as u32))
    }

    /// Allocate and zero a frame.
    pub fn allocate_zeroed(&self) -> Option<PhysFrame> {
        let frame = self.allocate()?;
        self.zero(frame);
        Some(frame)
    }

    /// Drop one reference to `frame`; the frame is poisoned and returned to
    /// the free list when this was the last one.
    ///
    /// Panics if `frame` lies outside the managed range or is not referenced.
    pub fn release(&self, frame: PhysFrame) {
        self.table.lock().put(frame);
    }

    /// Current reference count of `frame`.
    pub fn ref_count(&self, frame: PhysFrame) -> u32 {
        let table = self.table.lock();
        let index = table.index(frame);
        table.refs[index]
    }

    /// Add a reference to an allocated frame.
    pub fn increment(&self, frame: PhysFrame) {
        let mut table = self.table.lock();
        let index = table.index(frame);
        if table.refs[index] == 0 {
            panic!("[FRAME] increment of free frame {:#x}", frame.start_address().as_u64());
        }
        table.refs[index] += 1;
    }

    /// Drop a sharing reference. Same semantics as [`release`](Self::release);
    /// returns the remaining count.
    pub fn decrement(&self, frame: PhysFrame) -> u32 {
        self.table.lock().put(frame)
    }

    /// Frames currently handed out.
    pub fn in_use(&self) -> usize {
        self.table.lock().in_use
    }

    /// Frames on the free list.
    pub fn free_count(&self) -> usize {
        self.table.lock().free_count
    }

    // ─── Frame contents ──────────────────────────────────────────

    /// Fill `frame` with zeroes.
    pub fn zero(&self, frame: PhysFrame) {
        self.with_frame_mut(frame, |bytes| bytes.fill(0));
    }

    /// Copy the whole of `src` into `dst`.
    pub fn copy_frame(&self, src: PhysFrame, dst: PhysFrame) {
        let mut table = self.table.lock();
        table.index(src);
        table.index(dst);
        let mut buffer = [0u8; PAGE_SIZE as usize];
        buffer.copy_from_slice(table.memory.frame_mut(src));
        table.memory.frame_mut(dst).copy_from_slice(&buffer);
    }

    /// Run `f` over the bytes of `frame`.
    pub fn with_frame<R>(&self, frame: PhysFrame, f: impl FnOnce(&FrameBytes) -> R) -> R {
        let mut table = self.table.lock();
        table.index(frame);
        f(table.memory.frame_mut(frame))
    }

    /// Run `f` over the bytes of `frame`, mutably.
    pub fn with_frame_mut<R>(&self, frame: PhysFrame, f: impl FnOnce(&mut FrameBytes) -> R) -> R {
        let mut table = self.table.lock();
        table.index(frame);
        f(table.memory.frame_mut(frame))
    }
}

fn align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;
    use proptest::prelude::*;

    const BASE: u64 = 0x10_0000;

    fn allocator(frames: usize) -> FrameAllocator {
        FrameAllocator::heap_backed(PhysAddr::new(BASE), frames)
    }

    #[test]
    fn hands_out_lowest_frame_first() {
        let frames = allocator(4);
        let frame = frames.allocate().expect("frame");
        assert_eq!(frame.start_address().as_u64(), BASE);
        assert_eq!(frames.ref_count(frame), 1);
        assert_eq!(frames.in_use(), 1);
        assert_eq!(frames.free_count(), 3);
    }

    #[test]
    fn exhaustion_returns_none() {
        let frames = allocator(2);
        assert!(frames.allocate().is_some());
        assert!(frames.allocate().is_some());
        assert!(frames.allocate().is_none());
    }

    #[test]
    fn shared_frame_survives_one_release() {
        let frames = allocator(2);
        let frame = frames.allocate_zeroed().expect("frame");
        frames.increment(frame);
        assert_eq!(frames.ref_count(frame), 2);

        frames.release(frame);
        assert_eq!(frames.ref_count(frame), 1);
        assert_eq!(frames.in_use(), 1);
        frames.with_frame(frame, |bytes| assert!(bytes.iter().all(|b| *b == 0)));

        frames.release(frame);
        assert_eq!(frames.ref_count(frame), 0);
        assert_eq!(frames.in_use(), 0);
        frames.with_frame(frame, |bytes| assert!(bytes.iter().all(|b| *b == POISON)));
    }

    #[test]
    fn copy_frame_duplicates_contents() {
        let frames = allocator(2);
        let a = frames.allocate_zeroed().unwrap();
        let b = frames.allocate_zeroed().unwrap();
        frames.with_frame_mut(a, |bytes| bytes[..5].copy_from_slice(b"hello"));
        frames.copy_frame(a, b);
        frames.with_frame(b, |bytes| assert_eq!(&bytes[..5], b"hello"));
    }

    #[test]
    fn skips_unusable_regions() {
        let mut low = MemoryRegion::empty();
        low.start = BASE;
        low.end = BASE + 2 * PAGE_SIZE;
        low.kind = MemoryRegionKind::Usable;
        let mut hole = MemoryRegion::empty();
        hole.start = BASE + 2 * PAGE_SIZE;
        hole.end = BASE + 4 * PAGE_SIZE;
        hole.kind = MemoryRegionKind::Bootloader;
        let mut high = MemoryRegion::empty();
        high.start = BASE + 4 * PAGE_SIZE;
        high.end = BASE + 5 * PAGE_SIZE;
        high.kind = MemoryRegionKind::Usable;

        let frames = FrameAllocator::from_memory_regions(
            &[low, hole, high],
            Box::new(HeapBacked::new(PhysAddr::new(BASE), 5)),
        );
        assert_eq!(frames.free_count(), 3);
        let handed: Vec<u64> = core::iter::from_fn(|| frames.allocate())
            .map(|f| f.start_address().as_u64())
            .collect();
        assert_eq!(handed, vec![BASE, BASE + PAGE_SIZE, BASE + 4 * PAGE_SIZE]);
    }

    #[test]
    #[should_panic]
    fn release_outside_range_is_fatal() {
        let frames = allocator(2);
        frames.release(PhysFrame::containing_address(PhysAddr::new(BASE + 64 * PAGE_SIZE)));
    }

    #[test]
    #[should_panic]
    fn double_release_is_fatal() {
        let frames = allocator(2);
        let frame = frames.allocate().unwrap();
        frames.release(frame);
        frames.release(frame);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc,
        Share(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Alloc),
            any::<usize>().prop_map(Op::Share),
            any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn never_hands_out_a_referenced_frame(ops in proptest::collection::vec(op(), 1..200)) {
            let frames = allocator(16);
            // One entry per outstanding reference.
            let mut refs: Vec<PhysFrame> = Vec::new();
            for op in ops {
                match op {
                    Op::Alloc => {
                        if let Some(frame) = frames.allocate() {
                            prop_assert!(!refs.contains(&frame));
                            refs.push(frame);
                        } else {
                            let distinct: BTreeSet<u64> =
                                refs.iter().map(|f| f.start_address().as_u64()).collect();
                            prop_assert_eq!(distinct.len(), 16);
                        }
                    }
                    Op::Share(i) if !refs.is_empty() => {
                        let frame = refs[i % refs.len()];
                        frames.increment(frame);
                        refs.push(frame);
                    }
                    Op::Release(i) if !refs.is_empty() => {
                        let frame = refs.swap_remove(i % refs.len());
                        frames.release(frame);
                    }
                    _ => {}
                }
                let distinct: BTreeSet<u64> =
                    refs.iter().map(|f| f.start_address().as_u64()).collect();
                prop_assert_eq!(frames.in_use(), distinct.len());
                for frame in &refs {
                    let held = refs.iter().filter(|f| *f == frame).count() as u32;
                    prop_assert_eq!(frames.ref_count(*frame), held);
                }
            }
        }
    }
}
