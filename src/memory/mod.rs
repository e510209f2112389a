//! User virtual memory.
//!
//! Provides:
//! - Reference-counted physical frames shared copy-on-write across fork
//! - Per-process page directories, resident FIFO and swap table
//! - Demand paging: lazy heap pages, stack growth, swap in/out
//! - Signature-keyed shared memory segments
//!
//! [`VirtualMemory`] ties the system-wide pieces together; the per-process
//! pieces live in [`Process`]. Lock order is shared-memory table, then
//! frame allocator. Per-process state is only touched on behalf of its
//! owner and is not locked.

pub mod fault;
pub mod frame_allocator;
pub mod meminfo;
pub mod pager;
pub mod paging;
pub mod process;
pub mod resident;
pub mod shm;
pub mod store;
pub mod swap;
pub mod uvm;

pub use fault::{FaultError, FaultOutcome};
pub use frame_allocator::{DirectMap, FrameAllocator, FrameBytes, HeapBacked, PhysicalMemory};
pub use meminfo::InfoError;
pub use paging::{MapError, PageDirectory};
pub use process::{Pid, Process};
pub use shm::{SharedHandles, SharedMemory, ShmError, Signature};
pub use store::{BackingStore, MemoryBackingStore, SwapError};
pub use swap::TableError;

use alloc::boxed::Box;
use bootloader_api::BootInfo;
use spin::Once;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{ConfigError, VmConfig};
use crate::println;

/// Errors from address-space operations.
///
/// All of them are recoverable for the kernel; at worst the process
/// involved is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free physical frame.
    OutOfMemory,
    /// Heap growth would run into the stack (or past user space).
    LimitExceeded,
    /// Stack growth would run into the heap.
    StackOverflow,
    /// Address not mapped for user access.
    BadAddress(VirtAddr),
    Map(MapError),
    Table(TableError),
    Swap(SwapError),
}

impl From<MapError> for VmError {
    fn from(e: MapError) -> Self {
        VmError::Map(e)
    }
}

impl From<TableError> for VmError {
    fn from(e: TableError) -> Self {
        VmError::Table(e)
    }
}

impl From<SwapError> for VmError {
    fn from(e: SwapError) -> Self {
        VmError::Swap(e)
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of physical memory"),
            VmError::LimitExceeded => write!(f, "heap would overlap the stack"),
            VmError::StackOverflow => write!(f, "stack would overlap the heap"),
            VmError::BadAddress(va) => write!(f, "bad user address {:#x}", va.as_u64()),
            VmError::Map(e) => write!(f, "map: {}", e),
            VmError::Table(e) => write!(f, "swap table: {}", e),
            VmError::Swap(e) => write!(f, "swap: {}", e),
        }
    }
}

/// Errors from bringing up the VM subsystem at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The bootloader did not map physical memory.
    NoPhysicalMapping,
    Config(ConfigError),
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            InitError::NoPhysicalMapping => write!(f, "bootloader did not map physical memory"),
            InitError::Config(e) => write!(f, "config: {}", e),
        }
    }
}

/// System-wide VM state: configuration, physical frames and shared memory.
pub struct VirtualMemory {
    config: VmConfig,
    frames: FrameAllocator,
    shm: SharedMemory,
    #[cfg(any(test, feature = "failpoints"))]
    fork_map_budget: spin::Mutex<Option<usize>>,
}

impl VirtualMemory {
    pub fn new(config: VmConfig, frames: FrameAllocator) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::assemble(config, frames))
    }

    fn assemble(config: VmConfig, frames: FrameAllocator) -> Self {
        VirtualMemory {
            config,
            frames,
            shm: SharedMemory::new(),
            #[cfg(any(test, feature = "failpoints"))]
            fork_map_budget: spin::Mutex::new(None),
        }
    }

    /// VM over `count` heap-backed frames starting at `base`.
    pub fn hosted(config: VmConfig, base: PhysAddr, count: usize) -> Result<Self, ConfigError> {
        Self::new(config, FrameAllocator::heap_backed(base, count))
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn shared_memory(&self) -> &SharedMemory {
        &self.shm
    }

    /// Make the next fork fail after mapping `successes` pages into the
    /// child.
    #[cfg(any(test, feature = "failpoints"))]
    pub fn deny_fork_maps_after(&self, successes: usize) {
        *self.fork_map_budget.lock() = Some(successes);
    }

    /// A fresh, empty address space configured for this VM.
    pub fn create_process(&self, pid: Pid, name: &str, store: Box<dyn BackingStore>) -> Process {
        Process::new(pid, name, &self.config, store)
    }

    // ─── Shared memory on behalf of a process ────────────────────

    pub fn shm_join(&self, process: &mut Process, signature: Signature) -> Result<(), ShmError> {
        self.shm.join(&mut process.shared, signature, &self.frames)
    }

    pub fn shm_leave(&self, process: &mut Process, signature: Signature) -> Result<(), ShmError> {
        self.shm.leave(&mut process.shared, signature, &self.frames)
    }

    pub fn shm_read(&self, process: &Process, signature: Signature, buf: &mut FrameBytes) -> Result<(), ShmError> {
        self.shm.read(&process.shared, signature, &self.frames, buf)
    }

    pub fn shm_write(&self, process: &Process, signature: Signature, content: &[u8]) -> Result<(), ShmError> {
        self.shm.write(&process.shared, signature, &self.frames, content)
    }
}

static VM: Once<VirtualMemory> = Once::new();

/// Bring up the VM subsystem over the bootloader's memory map.
///
/// Must be called once, after the kernel heap is up and before the first
/// user process is created. Later calls return the existing instance.
pub fn init(boot_info: &'static BootInfo, config: VmConfig) -> Result<&'static VirtualMemory, InitError> {
    if let Some(vm) = VM.get() {
        return Ok(vm);
    }
    crate::serial::init();
    config.validate().map_err(InitError::Config)?;
    let offset = boot_info
        .physical_memory_offset
        .into_option()
        .ok_or(InitError::NoPhysicalMapping)?;
    // SAFETY: the bootloader maps all of physical memory at `offset`, and
    // usable frames are only reached through the allocator from here on.
    let memory = unsafe { DirectMap::new(VirtAddr::new(offset)) };
    let frames = FrameAllocator::from_memory_regions(&boot_info.memory_regions, Box::new(memory));
    let free = frames.free_count();

    let vm = VM.call_once(|| VirtualMemory::assemble(config, frames));
    println!(
        "[OK] VM initialized ({} frames, {} MiB, {} resident pages per process)",
        free,
        free as u64 * crate::config::PAGE_SIZE / 1024 / 1024,
        vm.config.resident_capacity
    );
    Ok(vm)
}

/// The VM subsystem, once [`init`] has run.
pub fn get() -> Option<&'static VirtualMemory> {
    VM.get()
}

/// Round `addr` up to a page boundary.
pub(crate) fn page_align_up(addr: u64) -> u64 {
    (addr + crate::config::PAGE_SIZE - 1) & !(crate::config::PAGE_SIZE - 1)
}

/// Round `addr` down to a page boundary.
pub(crate) fn page_align_down(addr: u64) -> u64 {
    addr & !(crate::config::PAGE_SIZE - 1)
}
