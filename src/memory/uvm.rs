//! User address-space lifecycle: heap growth and shrinking, stack growth,
//! fork, teardown and kernel copies to and from user memory.
//!
//! Layout of a user address space:
//!
//! ```text
//! 0            PAGE_SIZE                heap_top       user_top - stack_size   user_top
//! | null guard | heap (grows up) ------>|   (gap)      |<------ stack          |
//! ```
//!
//! The heap always stays at least one page clear of the stack.

use alloc::vec::Vec;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use super::pager::entry_frame;
use super::paging::TABLE_SPAN;
use super::process::{Pid, Process};
use super::{page_align_down, page_align_up, VirtualMemory, VmError};
use crate::config::PAGE_SIZE;
use crate::println;

impl VirtualMemory {
    /// Grow the heap to end at `new_top` (`sbrk` with a positive increment).
    ///
    /// Every new page is backed immediately. A page that a fault already
    /// backed above the old top is taken over as it is. If any page cannot
    /// be backed, the pages mapped by this call are released again and the
    /// heap keeps its old size. Returns the new heap top.
    pub fn grow_heap(&self, process: &mut Process, new_top: u64) -> Result<u64, VmError> {
        let old_top = process.heap_top;
        let stack_border = self.config.user_top - process.stack_size;
        if new_top > stack_border.saturating_sub(PAGE_SIZE) {
            return Err(VmError::LimitExceeded);
        }
        if new_top <= old_top {
            return Ok(old_top);
        }

        let mut added = Vec::new();
        let mut page = page_align_up(old_top);
        while page < new_top {
            let va = VirtAddr::new(page);
            if !self.is_backed(process, va) {
                if let Err(err) = self.map_fresh_page(process, va) {
                    println!("[VM] {} heap growth to {:#x} failed: {}", process.pid(), new_top, err);
                    for va in added {
                        self.release_page(process, va);
                    }
                    process.directory.flush();
                    return Err(err);
                }
                added.push(va);
            }
            page += PAGE_SIZE;
        }
        process.heap_top = new_top;
        Ok(new_top)
    }

    /// Shrink the heap to end at `new_top` (`sbrk` with a negative
    /// increment). The heap never shrinks into the null guard. Returns the
    /// new heap top.
    pub fn shrink_heap(&self, process: &mut Process, new_top: u64) -> u64 {
        let new_top = new_top.max(PAGE_SIZE);
        if new_top >= process.heap_top {
            return process.heap_top;
        }
        let old_top = process.heap_top;
        process.heap_top = self.dealloc_range(process, old_top, new_top);
        process.heap_top
    }

    /// Resize the heap by `delta` bytes. Returns the previous heap top.
    pub fn sbrk(&self, process: &mut Process, delta: i64) -> Result<u64, VmError> {
        let old_top = process.heap_top;
        if delta >= 0 {
            let new_top = old_top.checked_add(delta as u64).ok_or(VmError::LimitExceeded)?;
            self.grow_heap(process, new_top)?;
        } else {
            let new_top = match old_top.checked_sub(delta.unsigned_abs()) {
                Some(top) if top >= PAGE_SIZE => top,
                _ => return Err(VmError::LimitExceeded),
            };
            self.shrink_heap(process, new_top);
        }
        Ok(old_top)
    }

    /// Whether `va` is mapped, resident or paged out.
    fn is_backed(&self, process: &Process, va: VirtAddr) -> bool {
        process.directory.present(va).is_some() || process.directory.is_paged_out(va)
    }

    /// Release every page in `[page_align_up(new_top), old_top)`.
    ///
    /// Present pages drop a frame reference (the frame is freed only when
    /// no other address space shares it) and leave the resident list.
    /// Paged-out pages leave the swap table and their store slot is
    /// discarded. Ranges with no leaf table are skipped a table at a time.
    /// Returns `new_top`.
    pub fn dealloc_range(&self, process: &mut Process, old_top: u64, new_top: u64) -> u64 {
        if new_top >= old_top {
            return old_top;
        }
        let end = old_top.min(self.config.user_top);
        let mut addr = page_align_up(new_top);
        while addr < end {
            let va = VirtAddr::new(addr);
            if !process.directory.table_present(va) {
                addr = (addr / TABLE_SPAN + 1) * TABLE_SPAN;
                continue;
            }
            self.release_page(process, va);
            addr += PAGE_SIZE;
        }
        process.directory.flush();
        new_top
    }

    /// Drop whatever backs `va`: a frame reference and resident slot, or a
    /// swap entry and its store slot. Does not flush.
    fn release_page(&self, process: &mut Process, va: VirtAddr) {
        if let Some(entry) = process.directory.present(va) {
            let frame = entry_frame(entry, va);
            match process.resident.find(va) {
                Some(slot) => {
                    process.resident.remove(slot);
                }
                None => panic!(
                    "[VM] {} present page {:#x} missing from resident list",
                    process.pid(),
                    va.as_u64()
                ),
            }
            process.directory.unmap(va);
            self.frames.release(frame);
        } else if process.directory.is_paged_out(va) {
            match process.swap.remove(va) {
                Some(offset) => process.store.discard(offset, PAGE_SIZE as usize),
                None => panic!(
                    "[VM] {} paged-out page {:#x} missing from swap table",
                    process.pid(),
                    va.as_u64()
                ),
            }
            process.directory.unmap(va);
        }
    }

    /// Map one more stack page just below the current stack.
    ///
    /// Fails if the new page would touch the page above the heap. A page
    /// a fault already backed there joins the stack as it is. Returns the
    /// new lowest stack address.
    pub fn grow_stack(&self, process: &mut Process) -> Result<VirtAddr, VmError> {
        let stack_border = self.config.user_top - process.stack_size;
        if page_align_up(process.heap_top) + PAGE_SIZE > stack_border {
            return Err(VmError::StackOverflow);
        }
        let page = VirtAddr::new(stack_border - PAGE_SIZE);
        if !self.is_backed(process, page) {
            self.map_fresh_page(process, page)?;
        }
        process.stack_size += PAGE_SIZE;
        process.directory.flush();
        println!("[VM] {} stack grown to {:#x}", process.pid(), page.as_u64());
        Ok(page)
    }

    /// Duplicate `parent` into a new address space for `child_pid`.
    ///
    /// Present pages are shared copy-on-write: both sides map the same
    /// frame read-only and the frame gains a reference. Paged-out pages
    /// stay paged out in the child, backed by a copy of the parent's store.
    /// Shared-memory handles are not inherited. On failure the child is
    /// torn down and the parent is left with its pages write-protected,
    /// which its next write fault undoes.
    pub fn fork(&self, parent: &mut Process, child_pid: Pid) -> Result<Process, VmError> {
        let store = parent.store.duplicate()?;
        let mut child = Process::new(child_pid, parent.name(), &self.config, store);
        #[cfg(any(test, feature = "failpoints"))]
        if let Some(successes) = self.fork_map_budget.lock().take() {
            child.directory.deny_map_after(successes);
        }
        child.heap_top = parent.heap_top;
        child.stack_size = parent.stack_size;
        child.resident.copy_from(&parent.resident);
        child.swap.copy_from(&parent.swap)?;

        let pages: Vec<VirtAddr> = parent.directory.mappings().map(|(va, _)| va).collect();
        for va in pages {
            let result = if parent.directory.is_paged_out(va) {
                child.directory.map_paged_out(va)
            } else {
                let entry = match parent.directory.entry_mut(va) {
                    Some(entry) => entry,
                    None => unreachable!(),
                };
                let flags = entry.flags() - PageTableFlags::WRITABLE;
                entry.set_flags(flags);
                let frame = entry_frame(entry, va);
                child.directory.map(va, frame, flags).map(|()| self.frames.increment(frame))
            };
            if let Err(err) = result {
                println!("[VM] fork of {} failed at {:#x}: {}", parent.pid(), va.as_u64(), err);
                parent.directory.flush();
                self.free_address_space(&mut child);
                return Err(err.into());
            }
        }
        parent.directory.flush();
        println!(
            "[VM] {} forked {}: {} resident, {} swapped",
            parent.pid(),
            child_pid,
            child.resident.len(),
            child.swap.len()
        );
        Ok(child)
    }

    /// Release everything an address space holds: mapped and swapped pages,
    /// shared-memory handles and the bookkeeping tables.
    pub fn free_address_space(&self, process: &mut Process) {
        self.dealloc_range(process, self.config.user_top, 0);
        self.shm.leave_all(&mut process.shared, &self.frames);
        process.resident.clear();
        process.swap.clear();
        process.heap_top = PAGE_SIZE;
        process.stack_size = 0;
    }

    /// Copy `data` into user memory at `va`.
    ///
    /// Paged-out pages are brought back in and copy-on-write pages are
    /// broken first, the same as a user write would.
    pub fn copy_out(&self, process: &mut Process, va: VirtAddr, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let addr = va.as_u64() + done as u64;
            let page = VirtAddr::new(page_align_down(addr));
            let within = (addr - page.as_u64()) as usize;
            let count = (PAGE_SIZE as usize - within).min(data.len() - done);

            self.user_page(process, page, addr)?;
            let mut frame = self.user_frame(process, page, addr)?;
            let writable = process
                .directory
                .present(page)
                .map_or(false, |e| e.flags().contains(PageTableFlags::WRITABLE));
            if !writable {
                self.break_cow(process, page)?;
                frame = self.user_frame(process, page, addr)?;
            }
            let src = &data[done..done + count];
            self.frames.with_frame_mut(frame, |bytes| bytes[within..within + count].copy_from_slice(src));
            done += count;
        }
        Ok(())
    }

    /// Copy user memory at `va` into `buf`.
    pub fn copy_in(&self, process: &mut Process, va: VirtAddr, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va.as_u64() + done as u64;
            let page = VirtAddr::new(page_align_down(addr));
            let within = (addr - page.as_u64()) as usize;
            let count = (PAGE_SIZE as usize - within).min(buf.len() - done);

            self.user_page(process, page, addr)?;
            let frame = self.user_frame(process, page, addr)?;
            let dst = &mut buf[done..done + count];
            self.frames.with_frame(frame, |bytes| dst.copy_from_slice(&bytes[within..within + count]));
            done += count;
        }
        Ok(())
    }

    /// Make sure `page` is present, swapping it in if needed.
    fn user_page(&self, process: &mut Process, page: VirtAddr, addr: u64) -> Result<(), VmError> {
        if page.as_u64() < PAGE_SIZE || page.as_u64() >= self.config.user_top {
            return Err(VmError::BadAddress(VirtAddr::new(addr)));
        }
        if process.directory.is_paged_out(page) {
            self.swap_in(process, page)?;
        }
        Ok(())
    }

    fn user_frame(&self, process: &Process, page: VirtAddr, addr: u64) -> Result<PhysFrame, VmError> {
        match process.directory.present(page) {
            Some(entry) if entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) => Ok(entry_frame(entry, page)),
            _ => Err(VmError::BadAddress(VirtAddr::new(addr))),
        }
    }
}
