//! User page-fault handling.
//!
//! Not-present faults are resolved by swapping the page back in, growing
//! the stack, or backing a heap page on first touch. Protection faults on
//! write-protected user pages break copy-on-write sharing. Anything else
//! kills the faulting process; kernel bookkeeping inconsistencies panic.

use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use super::pager::entry_frame;
use super::paging::USER_RW;
use super::process::Process;
use super::{page_align_down, VirtualMemory, VmError};
use crate::config::PAGE_SIZE;
use crate::println;

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A paged-out page was read back from the backing store.
    SwappedIn,
    /// A heap page was backed on first touch.
    LazyAllocated,
    /// One more stack page was mapped.
    StackGrown,
    /// The page was shared; the process got a private copy.
    CopiedOnWrite,
    /// The process was the page's only user; write access was restored.
    WriteEnabled,
    /// The page was already mapped; nothing to do.
    Spurious,
}

/// Fault the process cannot recover from. The process has been marked
/// killed by the time this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Access to the null-guard page.
    NullPointer(VirtAddr),
    /// Access outside anything the process may touch.
    IllegalAccess(VirtAddr),
    Vm(VmError),
}

impl From<VmError> for FaultError {
    fn from(e: VmError) -> Self {
        FaultError::Vm(e)
    }
}

impl core::fmt::Display for FaultError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            FaultError::NullPointer(va) => write!(f, "null pointer dereference at {:#x}", va.as_u64()),
            FaultError::IllegalAccess(va) => write!(f, "illegal access at {:#x}", va.as_u64()),
            FaultError::Vm(e) => write!(f, "{}", e),
        }
    }
}

impl VirtualMemory {
    /// Resolve a page fault raised by `process` at `addr`.
    ///
    /// On error the process is marked killed. On success the translation
    /// cache has been flushed.
    pub fn handle_page_fault(
        &self,
        process: &mut Process,
        addr: VirtAddr,
        code: PageFaultErrorCode,
    ) -> Result<FaultOutcome, FaultError> {
        let result = if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
            self.protection_fault(process, addr, code)
        } else {
            self.missing_page_fault(process, addr)
        };
        match result {
            Ok(outcome) => {
                process.directory.flush();
                Ok(outcome)
            }
            Err(err) => {
                println!("[FAULT] {} ({}) killed: {}", process.name(), process.pid(), err);
                process.kill();
                Err(err)
            }
        }
    }

    fn missing_page_fault(&self, process: &mut Process, addr: VirtAddr) -> Result<FaultOutcome, FaultError> {
        let page = VirtAddr::new(page_align_down(addr.as_u64()));
        if process.directory.is_paged_out(page) {
            self.swap_in(process, page)?;
            return Ok(FaultOutcome::SwappedIn);
        }
        if addr.as_u64() < PAGE_SIZE {
            return Err(FaultError::NullPointer(addr));
        }
        if addr.as_u64() >= self.config.user_top {
            return Err(FaultError::IllegalAccess(addr));
        }

        let heap_border = process.heap_top + PAGE_SIZE;
        let stack_border = self.config.user_top - process.stack_size;
        if addr.as_u64() >= heap_border && addr.as_u64() < stack_border {
            self.grow_stack(process)?;
            return Ok(FaultOutcome::StackGrown);
        }

        if process.directory.present(page).is_some() {
            return Ok(FaultOutcome::Spurious);
        }
        self.map_fresh_page(process, page)?;
        println!("[VM] {} lazily backed {:#x}", process.pid(), page.as_u64());
        Ok(FaultOutcome::LazyAllocated)
    }

    fn protection_fault(
        &self,
        process: &mut Process,
        addr: VirtAddr,
        code: PageFaultErrorCode,
    ) -> Result<FaultOutcome, FaultError> {
        if addr.as_u64() >= self.config.user_top || !code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            return Err(FaultError::IllegalAccess(addr));
        }
        let page = VirtAddr::new(page_align_down(addr.as_u64()));
        let flags = match process.directory.present(page) {
            Some(entry) if entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) => entry.flags(),
            _ => return Err(FaultError::IllegalAccess(addr)),
        };
        if flags.contains(PageTableFlags::WRITABLE) {
            panic!(
                "[COW] {} write fault on writable page {:#x}",
                process.pid(),
                page.as_u64()
            );
        }
        Ok(self.break_cow(process, page)?)
    }

    /// Give `process` a writable copy of the write-protected page `page`.
    ///
    /// If nobody else references the frame it is simply made writable;
    /// otherwise its contents move to a new frame and the shared one loses
    /// a reference.
    pub(crate) fn break_cow(&self, process: &mut Process, page: VirtAddr) -> Result<FaultOutcome, VmError> {
        let frame = match process.directory.present(page) {
            Some(entry) => entry_frame(entry, page),
            None => panic!("[COW] {} breaking unmapped page {:#x}", process.pid(), page.as_u64()),
        };
        let outcome = match self.frames.ref_count(frame) {
            0 => panic!(
                "[COW] {} page {:#x} maps free frame {:#x}",
                process.pid(),
                page.as_u64(),
                frame.start_address().as_u64()
            ),
            1 => {
                if let Some(entry) = process.directory.entry_mut(page) {
                    entry.set_flags(entry.flags() | PageTableFlags::WRITABLE);
                }
                FaultOutcome::WriteEnabled
            }
            _ => {
                let copy = self.frames.allocate().ok_or(VmError::OutOfMemory)?;
                self.frames.copy_frame(frame, copy);
                if let Some(entry) = process.directory.entry_mut(page) {
                    entry.set_frame(copy, USER_RW);
                }
                self.frames.release(frame);
                println!("[COW] {} copied {:#x}", process.pid(), page.as_u64());
                FaultOutcome::CopiedOnWrite
            }
        };
        process.directory.flush();
        Ok(outcome)
    }
}
