//! The parts of a process record the VM subsystem owns.
//!
//! Process creation and scheduling live elsewhere; they hand the VM a
//! `Process` and call back into it on faults, `sbrk`, fork and exit. A
//! process's tables are only ever touched on that process's behalf, so
//! they carry no lock of their own.

use alloc::boxed::Box;
use alloc::string::String;
use x86_64::VirtAddr;

use super::paging::PageDirectory;
use super::resident::ResidentTable;
use super::shm::SharedHandles;
use super::store::BackingStore;
use super::swap::SwapTable;
use crate::config::{VmConfig, PAGE_SIZE};

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "PID#{}", self.0)
    }
}

/// A user address space and its paging bookkeeping.
pub struct Process {
    pid: Pid,
    name: String,
    pub(crate) directory: PageDirectory,
    /// End of the data/heap region. Page 0 is never mapped.
    pub(crate) heap_top: u64,
    /// Bytes of stack mapped just below the top of user space.
    pub(crate) stack_size: u64,
    pub(crate) resident: ResidentTable,
    pub(crate) swap: SwapTable,
    pub(crate) store: Box<dyn BackingStore>,
    pub(crate) shared: SharedHandles,
    killed: bool,
}

impl Process {
    /// Empty address space: nothing mapped, heap starting after the
    /// null-guard page, no stack yet.
    pub fn new(pid: Pid, name: &str, config: &VmConfig, store: Box<dyn BackingStore>) -> Self {
        Process {
            pid,
            name: String::from(name),
            directory: PageDirectory::new(config.user_top),
            heap_top: PAGE_SIZE,
            stack_size: 0,
            resident: ResidentTable::new(config.resident_capacity),
            swap: SwapTable::new(config.swap_entries_per_page, config.swap_table_page_limit),
            store,
            shared: SharedHandles::new(),
            killed: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current heap top (`sbrk(0)`).
    pub fn heap_size(&self) -> u64 {
        self.heap_top
    }

    pub fn stack_size(&self) -> u64 {
        self.stack_size
    }

    /// Lowest mapped stack address.
    pub fn stack_bottom(&self) -> VirtAddr {
        VirtAddr::new(self.directory.user_top() - self.stack_size)
    }

    /// Pages currently resident.
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Pages currently in the backing store.
    pub fn swapped_count(&self) -> usize {
        self.swap.len()
    }

    /// Pages of swap table allocated.
    pub fn swap_table_pages(&self) -> usize {
        self.swap.page_count()
    }

    /// Resident pages, newest first.
    pub fn resident_pages(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.resident.iter()
    }

    /// Swapped-out pages with their backing-store offsets.
    pub fn swapped_pages(&self) -> impl Iterator<Item = (usize, VirtAddr)> + '_ {
        self.swap.iter()
    }

    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    pub fn shared(&self) -> &SharedHandles {
        &self.shared
    }

    /// Whether a fault has marked this process for termination.
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Mark the process for termination; the scheduler reaps it later.
    pub fn kill(&mut self) {
        self.killed = true;
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("heap_top", &self.heap_top)
            .field("stack_size", &self.stack_size)
            .field("resident", &self.resident.len())
            .field("swapped", &self.swap.len())
            .field("killed", &self.killed)
            .finish()
    }
}
