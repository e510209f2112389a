//! Virtual memory tunables.
//!
//! The constants are the layout the kernel boots with. `VmConfig` carries
//! the subset that can be changed at boot (and that the host tests shrink
//! so eviction kicks in after a handful of pages instead of thousands).

use static_assertions::const_assert;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Pages backing a process's resident-entry pool.
pub const RESIDENT_TABLE_PAGES: usize = 25;

/// Resident entries that fit in one pool page.
pub const RESIDENT_ENTRIES_PER_PAGE: usize = 340;

/// Default number of pages a process may keep resident before FIFO eviction.
pub const RESIDENT_CAPACITY: usize = RESIDENT_TABLE_PAGES * RESIDENT_ENTRIES_PER_PAGE;

/// Swap entries per swap-table page.
pub const SWAP_ENTRIES_PER_PAGE: usize = 1022;

/// Backing-store transfers are done in quarter-page chunks.
pub const SWAP_CHUNK: usize = PAGE_SIZE as usize / 4;

/// Shared-memory handles a single process may hold.
pub const SHARED_PER_PROCESS: usize = 8;

/// Shared-memory segments the whole system may hold.
pub const SHARED_GLOBAL: usize = 256;

/// First address above user space.
pub const USER_TOP: u64 = 0x8000_0000;

/// Byte pattern written over a frame when it goes back on the free list.
pub const POISON: u8 = 0x01;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(PAGE_SIZE as usize % SWAP_CHUNK == 0);
const_assert!(USER_TOP % (2 * 1024 * 1024) == 0);
const_assert!(RESIDENT_CAPACITY == 8500);

// ─── Runtime configuration ──────────────────────────────────────

/// Boot-time virtual memory configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Resident pages per process before the FIFO victim is evicted.
    pub resident_capacity: usize,
    /// Slots in one swap-table page.
    pub swap_entries_per_page: usize,
    /// Upper bound on swap-table pages per process (`None` = unbounded).
    pub swap_table_page_limit: Option<usize>,
    /// First address above user space.
    pub user_top: u64,
}

impl VmConfig {
    pub const fn new() -> Self {
        VmConfig {
            resident_capacity: RESIDENT_CAPACITY,
            swap_entries_per_page: SWAP_ENTRIES_PER_PAGE,
            swap_table_page_limit: None,
            user_top: USER_TOP,
        }
    }

    /// Builder: override the resident capacity.
    pub const fn with_resident_capacity(mut self, capacity: usize) -> Self {
        self.resident_capacity = capacity;
        self
    }

    /// Builder: override the swap-table page width.
    pub const fn with_swap_entries_per_page(mut self, entries: usize) -> Self {
        self.swap_entries_per_page = entries;
        self
    }

    /// Builder: cap the number of swap-table pages per process.
    pub const fn with_swap_table_page_limit(mut self, pages: usize) -> Self {
        self.swap_table_page_limit = Some(pages);
        self
    }

    /// Builder: override the top of user space.
    pub const fn with_user_top(mut self, user_top: u64) -> Self {
        self.user_top = user_top;
        self
    }

    /// Bytes of backing store covered by one swap-table page.
    pub const fn swap_page_span(&self) -> usize {
        self.swap_entries_per_page * PAGE_SIZE as usize
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Swap-in needs at least one resident slot.
        if self.resident_capacity == 0 {
            return Err(ConfigError::ZeroResidentCapacity);
        }
        if self.resident_capacity > u32::MAX as usize {
            return Err(ConfigError::ResidentCapacityTooLarge);
        }
        if self.swap_entries_per_page == 0 {
            return Err(ConfigError::ZeroSwapPageWidth);
        }
        if self.user_top == 0 || self.user_top % (2 * 1024 * 1024) != 0 || self.user_top > USER_TOP {
            return Err(ConfigError::BadUserTop(self.user_top));
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ZeroResidentCapacity,
    ResidentCapacityTooLarge,
    ZeroSwapPageWidth,
    BadUserTop(u64),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ConfigError::ZeroResidentCapacity => write!(f, "resident capacity must be non-zero"),
            ConfigError::ResidentCapacityTooLarge => write!(f, "resident capacity too large"),
            ConfigError::ZeroSwapPageWidth => write!(f, "swap table page must hold entries"),
            ConfigError::BadUserTop(top) => write!(f, "bad user top 0x{:x}", top),
        }
    }
}
