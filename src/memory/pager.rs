//! Moving pages between frames and the backing store.
//!
//! Each process keeps at most `resident_capacity` pages in memory. When a
//! new page needs a slot and the resident list is full, the oldest page
//! (the list tail) is written to the backing store and its slot reused.
//! Swapping a page back in when the list is full trades places with that
//! same victim: the incoming page is staged in a buffer, the victim is
//! written into the incoming page's store slot, and the victim's frame then
//! takes the incoming contents. No extra frame or store space is needed.

use alloc::boxed::Box;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use super::frame_allocator::FrameBytes;
use super::paging::USER_RW;
use super::process::Process;
use super::resident::Evicted;
use super::store::{read_exact, write_all, BackingStore, SwapError};
use super::{VirtualMemory, VmError};
use crate::config::{PAGE_SIZE, SWAP_CHUNK};
use crate::println;

const CHUNKS: usize = PAGE_SIZE as usize / SWAP_CHUNK;

/// Frame behind a present entry. Panics on a malformed entry.
pub(crate) fn entry_frame(entry: &PageTableEntry, va: VirtAddr) -> PhysFrame {
    match entry.frame() {
        Ok(frame) => frame,
        Err(_) => panic!("[VM] entry for {:#x} does not name a 4 KiB frame", va.as_u64()),
    }
}

impl VirtualMemory {
    fn resident_frame(&self, process: &Process, va: VirtAddr) -> PhysFrame {
        match process.directory.present(va) {
            Some(entry) => entry_frame(entry, va),
            None => panic!("[VM] {} resident page {:#x} is not mapped", process.pid(), va.as_u64()),
        }
    }

    /// Write `frame` to the store at `offset`.
    fn write_out(&self, store: &mut dyn BackingStore, offset: usize, frame: PhysFrame) -> Result<(), SwapError> {
        let mut chunk = [0u8; SWAP_CHUNK];
        for i in 0..CHUNKS {
            let range = i * SWAP_CHUNK..(i + 1) * SWAP_CHUNK;
            self.frames.with_frame(frame, |bytes| chunk.copy_from_slice(&bytes[range]));
            write_all(store, offset + i * SWAP_CHUNK, &chunk)?;
        }
        Ok(())
    }

    /// Fill `frame` from the store at `offset`.
    fn read_in(&self, store: &mut dyn BackingStore, offset: usize, frame: PhysFrame) -> Result<(), SwapError> {
        let mut chunk = [0u8; SWAP_CHUNK];
        for i in 0..CHUNKS {
            read_exact(store, offset + i * SWAP_CHUNK, &mut chunk)?;
            let range = i * SWAP_CHUNK..(i + 1) * SWAP_CHUNK;
            self.frames.with_frame_mut(frame, |bytes| bytes[range].copy_from_slice(&chunk));
        }
        Ok(())
    }

    /// Write the oldest resident page to the backing store and hand back its
    /// slot.
    ///
    /// On failure nothing changes: the page stays resident and mapped.
    pub(crate) fn evict(&self, process: &mut Process) -> Result<Evicted, VmError> {
        let victim = match process.resident.tail() {
            Some(va) => va,
            None => panic!("[SWAP] {} has nothing resident to evict", process.pid()),
        };
        let frame = self.resident_frame(process, victim);
        let offset = process.swap.claim(victim)?;
        if let Err(err) = self.write_out(process.store.as_mut(), offset, frame) {
            process.swap.remove(victim);
            println!("[SWAP] {} writing out {:#x} failed: {}", process.pid(), victim.as_u64(), err);
            return Err(err.into());
        }

        let evicted = match process.resident.evict_tail() {
            Some(evicted) => evicted,
            None => unreachable!(),
        };
        process.directory.mark_paged_out(victim);
        self.frames.release(frame);
        process.directory.flush();
        println!("[SWAP] {} evicted {:#x} to offset {:#x}", process.pid(), victim.as_u64(), offset);
        Ok(evicted)
    }

    /// Record `va` as the newest resident page, evicting the oldest first
    /// if the list is full.
    fn make_resident(&self, process: &mut Process, va: VirtAddr) -> Result<(), VmError> {
        if process.resident.is_full() {
            let evicted = self.evict(process)?;
            process.resident.relink_head(evicted, va);
        } else {
            process.resident.record(va);
        }
        Ok(())
    }

    /// Back `va` with a fresh zeroed frame, mapped user read/write.
    pub(crate) fn map_fresh_page(&self, process: &mut Process, va: VirtAddr) -> Result<(), VmError> {
        let frame = self.frames.allocate_zeroed().ok_or(VmError::OutOfMemory)?;
        if let Err(err) = self.make_resident(process, va) {
            self.frames.release(frame);
            return Err(err);
        }
        if let Err(err) = process.directory.map(va, frame, USER_RW) {
            if let Some(slot) = process.resident.find(va) {
                process.resident.remove(slot);
            }
            self.frames.release(frame);
            return Err(err.into());
        }
        Ok(())
    }

    /// Bring the swapped-out page `page` back into memory.
    pub(crate) fn swap_in(&self, process: &mut Process, page: VirtAddr) -> Result<(), VmError> {
        let offset = match process.swap.find(page) {
            Some(offset) => offset,
            None => panic!(
                "[SWAP] {} page {:#x} is marked paged out but has no swap entry",
                process.pid(),
                page.as_u64()
            ),
        };

        let frame = if process.resident.is_full() {
            self.trade_with_victim(process, page, offset)?
        } else {
            let frame = self.frames.allocate().ok_or(VmError::OutOfMemory)?;
            if let Err(err) = self.read_in(process.store.as_mut(), offset, frame) {
                self.frames.release(frame);
                return Err(err.into());
            }
            process.swap.remove(page);
            process.store.discard(offset, PAGE_SIZE as usize);
            process.resident.record(page);
            frame
        };

        match process.directory.entry_mut(page) {
            Some(entry) => entry.set_frame(frame, USER_RW),
            None => unreachable!(),
        }
        process.directory.flush();
        println!("[SWAP] {} swapped in {:#x} from offset {:#x}", process.pid(), page.as_u64(), offset);
        Ok(())
    }

    /// Exchange `page` (in the store at `offset`) with the FIFO victim.
    /// Returns the frame now holding `page`.
    ///
    /// The victim's frame is reused unless another address space still
    /// shares it, in which case `page` gets a frame of its own. The frame
    /// is only overwritten once the victim is safely in the store. If the
    /// victim cannot be written and the incoming page cannot be put back in
    /// its slot, the process has lost a page and is killed.
    fn trade_with_victim(&self, process: &mut Process, page: VirtAddr, offset: usize) -> Result<PhysFrame, VmError> {
        let victim = match process.resident.tail() {
            Some(va) => va,
            None => panic!("[SWAP] {} has a full but empty resident list", process.pid()),
        };
        let victim_frame = self.resident_frame(process, victim);
        let shared = self.frames.ref_count(victim_frame) > 1;
        let target = if shared {
            self.frames.allocate().ok_or(VmError::OutOfMemory)?
        } else {
            victim_frame
        };

        let mut incoming: Box<FrameBytes> = Box::new([0u8; PAGE_SIZE as usize]);
        let staged = incoming
            .chunks_exact_mut(SWAP_CHUNK)
            .enumerate()
            .try_for_each(|(i, chunk)| read_exact(process.store.as_mut(), offset + i * SWAP_CHUNK, chunk));
        let traded = staged.and_then(|()| match self.write_out(process.store.as_mut(), offset, victim_frame) {
            Ok(()) => Ok(()),
            Err(err) => {
                if write_all(process.store.as_mut(), offset, &incoming[..]).is_err() {
                    println!(
                        "[SWAP] {} lost {:#x} trading it for {:#x}; killed",
                        process.pid(),
                        page.as_u64(),
                        victim.as_u64()
                    );
                    process.kill();
                }
                Err(err)
            }
        });
        if let Err(err) = traded {
            if shared {
                self.frames.release(target);
            }
            return Err(err.into());
        }
        self.frames.with_frame_mut(target, |bytes| bytes.copy_from_slice(&incoming[..]));

        process.swap.replace(offset, victim);
        let evicted = match process.resident.evict_tail() {
            Some(evicted) => evicted,
            None => unreachable!(),
        };
        process.resident.relink_head(evicted, page);
        process.directory.mark_paged_out(victim);
        if shared {
            self.frames.release(victim_frame);
        }
        println!("[SWAP] {} traded {:#x} out for {:#x}", process.pid(), victim.as_u64(), page.as_u64());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::memory::store::MemoryBackingStore;
    use crate::memory::testing::{process, vm_with};
    use crate::memory::Pid;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn va(page: u64) -> VirtAddr {
        VirtAddr::new(page * PAGE_SIZE)
    }

    fn fill(vm: &VirtualMemory, p: &Process, page: VirtAddr, byte: u8) {
        let frame = vm.resident_frame(p, page);
        vm.frames.with_frame_mut(frame, |bytes| bytes.fill(byte));
    }

    fn first_byte(vm: &VirtualMemory, p: &Process, page: VirtAddr) -> u8 {
        let frame = vm.resident_frame(p, page);
        vm.frames.with_frame(frame, |bytes| {
            assert!(bytes.iter().all(|b| *b == bytes[0]), "page contents torn");
            bytes[0]
        })
    }

    #[test]
    fn fourth_page_evicts_the_oldest() {
        let vm = vm_with(VmConfig::new().with_resident_capacity(3), 16);
        let mut p = process(&vm, 1);
        for n in 1..=3 {
            vm.map_fresh_page(&mut p, va(n)).unwrap();
            fill(&vm, &p, va(n), n as u8);
        }
        vm.map_fresh_page(&mut p, va(4)).unwrap();

        assert!(p.directory.is_paged_out(va(1)));
        assert_eq!(p.swap.find(va(1)), Some(0));
        let resident: Vec<VirtAddr> = p.resident_pages().collect();
        assert_eq!(resident, [va(4), va(3), va(2)]);
        assert_eq!(vm.frames.in_use(), 3);
    }

    #[test]
    fn swap_in_trades_with_victim() {
        let vm = vm_with(VmConfig::new().with_resident_capacity(2), 16);
        let mut p = process(&vm, 1);
        for n in 1..=3 {
            vm.map_fresh_page(&mut p, va(n)).unwrap();
            fill(&vm, &p, va(n), 0x10 + n as u8);
        }
        // Page 1 was evicted when page 3 arrived.
        let frames_before = vm.frames.in_use();
        vm.swap_in(&mut p, va(1)).unwrap();

        assert_eq!(first_byte(&vm, &p, va(1)), 0x11);
        assert!(p.directory.is_paged_out(va(2)));
        assert_eq!(p.swap.find(va(2)), Some(0));
        assert_eq!(p.swapped_count(), 1);
        assert_eq!(vm.frames.in_use(), frames_before);

        vm.swap_in(&mut p, va(2)).unwrap();
        assert_eq!(first_byte(&vm, &p, va(2)), 0x12);
        assert_eq!(first_byte(&vm, &p, va(1)), 0x11);
        assert!(p.directory.is_paged_out(va(3)));
    }

    #[test]
    fn swap_in_with_room_frees_the_slot() {
        let vm = vm_with(VmConfig::new().with_resident_capacity(2), 16);
        let mut p = process(&vm, 1);
        for n in 1..=3 {
            vm.map_fresh_page(&mut p, va(n)).unwrap();
            fill(&vm, &p, va(n), n as u8);
        }
        let slot = p.resident.find(va(3)).unwrap();
        p.resident.remove(slot);
        let frame = vm.resident_frame(&p, va(3));
        p.directory.unmap(va(3));
        vm.frames.release(frame);

        vm.swap_in(&mut p, va(1)).unwrap();
        assert_eq!(first_byte(&vm, &p, va(1)), 1);
        assert_eq!(p.swapped_count(), 0);
        assert_eq!(p.resident_count(), 2);
    }

    #[test]
    fn failed_write_out_leaves_victim_resident() {
        let vm = vm_with(VmConfig::new().with_resident_capacity(1), 8);
        let mut p = vm.create_process(Pid(1), "full-swap", Box::new(MemoryBackingStore::with_capacity(0)));
        vm.map_fresh_page(&mut p, va(1)).unwrap();
        let err = vm.map_fresh_page(&mut p, va(2)).unwrap_err();

        assert!(matches!(err, VmError::Swap(SwapError::ShortTransfer { .. })));
        assert!(p.directory.present(va(1)).is_some());
        assert!(p.directory.present(va(2)).is_none());
        assert_eq!(p.resident_count(), 1);
        assert_eq!(p.swapped_count(), 0);
        assert_eq!(vm.frames.in_use(), 1);
    }

    /// Memory store whose writes fail from the `fail_from`th on, for
    /// `failures` writes.
    struct FlakyStore {
        inner: MemoryBackingStore,
        writes: usize,
        fail_from: usize,
        failures: usize,
    }

    impl FlakyStore {
        fn new(fail_from: usize, failures: usize) -> Self {
            FlakyStore { inner: MemoryBackingStore::new(), writes: 0, fail_from, failures }
        }
    }

    impl BackingStore for FlakyStore {
        fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, SwapError> {
            self.inner.read(offset, buf)
        }

        fn write(&mut self, offset: usize, buf: &[u8]) -> Result<usize, SwapError> {
            self.writes += 1;
            if self.writes >= self.fail_from && self.writes - self.fail_from < self.failures {
                return Err(SwapError::Io);
            }
            self.inner.write(offset, buf)
        }

        fn duplicate(&self) -> Result<Box<dyn BackingStore>, SwapError> {
            Err(SwapError::Unsupported)
        }
    }

    /// Page 1 (0x11) swapped out behind page 2 (0x22). The eviction took
    /// the first four writes.
    fn one_resident_page(vm: &VirtualMemory, store: FlakyStore) -> Process {
        let mut p = vm.create_process(Pid(1), "flaky", Box::new(store));
        vm.map_fresh_page(&mut p, va(1)).unwrap();
        fill(vm, &p, va(1), 0x11);
        vm.map_fresh_page(&mut p, va(2)).unwrap();
        fill(vm, &p, va(2), 0x22);
        assert!(p.directory.is_paged_out(va(1)));
        p
    }

    #[test]
    fn failed_trade_leaves_victim_intact() {
        let vm = vm_with(VmConfig::new().with_resident_capacity(1), 8);
        // The third chunk of the victim's write-out fails once.
        let mut p = one_resident_page(&vm, FlakyStore::new(7, 1));

        let mut buf = [0u8; 1];
        assert_eq!(vm.copy_in(&mut p, va(1), &mut buf), Err(VmError::Swap(SwapError::Io)));
        assert!(!p.is_killed());
        assert_eq!(first_byte(&vm, &p, va(2)), 0x22);
        assert!(p.directory.is_paged_out(va(1)));
        assert_eq!(vm.frames.in_use(), 1);

        // The slot was restored, so the next attempt goes through.
        vm.copy_in(&mut p, va(1), &mut buf).unwrap();
        assert_eq!(first_byte(&vm, &p, va(1)), 0x11);
        vm.copy_in(&mut p, va(2), &mut buf).unwrap();
        assert_eq!(first_byte(&vm, &p, va(2)), 0x22);
    }

    #[test]
    fn trade_that_loses_a_page_kills_the_process() {
        let vm = vm_with(VmConfig::new().with_resident_capacity(1), 8);
        let mut p = one_resident_page(&vm, FlakyStore::new(7, usize::MAX));

        assert_eq!(vm.swap_in(&mut p, va(1)), Err(VmError::Swap(SwapError::Io)));
        assert!(p.is_killed());
        // The victim is still mapped and whole, so teardown stays consistent.
        assert_eq!(first_byte(&vm, &p, va(2)), 0x22);
        assert_eq!(p.resident_count(), 1);
        assert_eq!(p.swapped_count(), 1);
    }

    #[test]
    fn exhausted_frames_report_out_of_memory() {
        let vm = vm_with(VmConfig::new(), 1);
        let mut p = process(&vm, 1);
        vm.map_fresh_page(&mut p, va(1)).unwrap();
        assert_eq!(vm.map_fresh_page(&mut p, va(2)), Err(VmError::OutOfMemory));
        assert_eq!(p.resident_count(), 1);
    }
}
