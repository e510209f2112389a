//! Per-process two-level page directory.
//!
//! The directory holds one leaf table per 2 MiB of user space, allocated
//! the first time something is mapped in that range. Leaves are the x86_64
//! crate's 512-entry `PageTable`, so entries carry the hardware flag
//! layout. A swapped-out page keeps a non-present entry with the
//! OS-available bit 9 set ([`PAGED_OUT`]).

use alloc::boxed::Box;
use alloc::vec::Vec;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::PAGE_SIZE;

/// Marks a non-present entry whose page lives in the backing store.
pub const PAGED_OUT: PageTableFlags = PageTableFlags::BIT_9;

/// Bytes covered by one leaf table.
pub const TABLE_SPAN: u64 = 512 * PAGE_SIZE;

/// Flags of an ordinary private user page.
pub const USER_RW: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address is not page aligned.
    Unaligned,
    /// Address is at or above the top of user space.
    OutOfRange,
    /// An entry already exists for the address.
    Overlap,
    /// Flags do not describe a present mapping.
    InvalidFlags,
    /// Mapping refused (injected failure).
    PermissionDenied,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            MapError::Unaligned => write!(f, "unaligned address"),
            MapError::OutOfRange => write!(f, "address outside user space"),
            MapError::Overlap => write!(f, "address already mapped"),
            MapError::InvalidFlags => write!(f, "invalid mapping flags"),
            MapError::PermissionDenied => write!(f, "mapping denied"),
        }
    }
}

/// A process's user page tables.
pub struct PageDirectory {
    tables: Vec<Option<Box<PageTable>>>,
    user_top: u64,
    flushes: u64,
    #[cfg(any(test, feature = "failpoints"))]
    deny_after: Option<usize>,
}

impl PageDirectory {
    /// Empty directory covering `[0, user_top)`.
    pub fn new(user_top: u64) -> Self {
        let slots = (user_top / TABLE_SPAN) as usize;
        let mut tables = Vec::with_capacity(slots);
        tables.resize_with(slots, || None);
        PageDirectory {
            tables,
            user_top,
            flushes: 0,
            #[cfg(any(test, feature = "failpoints"))]
            deny_after: None,
        }
    }

    pub fn user_top(&self) -> u64 {
        self.user_top
    }

    fn slot(&self, va: VirtAddr) -> Option<usize> {
        if va.as_u64() >= self.user_top {
            return None;
        }
        Some((va.as_u64() / TABLE_SPAN) as usize)
    }

    /// Whether a leaf table exists for the 2 MiB range containing `va`.
    pub fn table_present(&self, va: VirtAddr) -> bool {
        self.slot(va).map_or(false, |slot| self.tables[slot].is_some())
    }

    /// Entry for `va`, if its leaf table exists. The entry may be unused.
    pub fn entry(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        let slot = self.slot(va)?;
        let table = self.tables[slot].as_deref()?;
        Some(&table[va.p1_index()])
    }

    /// Mutable entry for `va`, if its leaf table exists.
    pub fn entry_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        let slot = self.slot(va)?;
        let table = self.tables[slot].as_deref_mut()?;
        Some(&mut table[va.p1_index()])
    }

    /// Present entry for `va`, if any.
    pub fn present(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        self.entry(va)
            .filter(|entry| entry.flags().contains(PageTableFlags::PRESENT))
    }

    /// Install `va -> frame` with `flags`, allocating the leaf table if
    /// needed.
    pub fn map(&mut self, va: VirtAddr, frame: PhysFrame, flags: PageTableFlags) -> Result<(), MapError> {
        if !flags.contains(PageTableFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        self.install(va, frame.start_address(), flags)
    }

    /// Install a swapped-out marker for `va` (fork of a paged-out page).
    pub fn map_paged_out(&mut self, va: VirtAddr) -> Result<(), MapError> {
        self.install(
            va,
            PhysAddr::new(0),
            PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE | PAGED_OUT,
        )
    }

    fn install(&mut self, va: VirtAddr, addr: PhysAddr, flags: PageTableFlags) -> Result<(), MapError> {
        if !va.is_aligned(PAGE_SIZE) {
            return Err(MapError::Unaligned);
        }
        let slot = self.slot(va).ok_or(MapError::OutOfRange)?;
        if let Some(entry) = self.entry(va) {
            if !entry.is_unused() {
                return Err(MapError::Overlap);
            }
        }
        #[cfg(any(test, feature = "failpoints"))]
        match self.deny_after {
            Some(0) => {
                self.deny_after = None;
                return Err(MapError::PermissionDenied);
            }
            Some(n) => self.deny_after = Some(n - 1),
            None => {}
        }
        let table = self.tables[slot].get_or_insert_with(|| Box::new(PageTable::new()));
        table[va.p1_index()].set_addr(addr, flags);
        Ok(())
    }

    /// Turn the entry for `va` into a swapped-out marker.
    ///
    /// Panics if there is no entry for `va`.
    pub fn mark_paged_out(&mut self, va: VirtAddr) {
        match self.entry_mut(va) {
            Some(entry) if !entry.is_unused() => entry.set_addr(
                PhysAddr::new(0),
                PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE | PAGED_OUT,
            ),
            _ => panic!("[VM] paging out {:#x} with no page table entry", va.as_u64()),
        }
    }

    /// Whether `va` is recorded as swapped out.
    pub fn is_paged_out(&self, va: VirtAddr) -> bool {
        self.entry(va).map_or(false, |entry| {
            let flags = entry.flags();
            !flags.contains(PageTableFlags::PRESENT) && flags.contains(PAGED_OUT)
        })
    }

    /// Clear the entry for `va`, returning what it held.
    pub fn unmap(&mut self, va: VirtAddr) -> Option<PageTableEntry> {
        let entry = self.entry_mut(va)?;
        if entry.is_unused() {
            return None;
        }
        let old = entry.clone();
        entry.set_unused();
        Some(old)
    }

    /// Every used entry (present or paged out), in address order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, &PageTableEntry)> + '_ {
        self.tables.iter().enumerate().flat_map(|(slot, table)| {
            table.iter().flat_map(move |table| {
                table.iter().enumerate().filter(|(_, e)| !e.is_unused()).map(move |(i, e)| {
                    (VirtAddr::new(slot as u64 * TABLE_SPAN + i as u64 * PAGE_SIZE), e)
                })
            })
        })
    }

    /// Number of leaf tables currently allocated.
    pub fn table_count(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    /// Invalidate cached translations for this address space.
    pub fn flush(&mut self) {
        self.flushes += 1;
        #[cfg(target_os = "none")]
        x86_64::instructions::tlb::flush_all();
    }

    /// Translation-cache flushes issued so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Let `successes` more maps through, then fail the next one with
    /// [`MapError::PermissionDenied`].
    #[cfg(any(test, feature = "failpoints"))]
    pub fn deny_map_after(&mut self, successes: usize) {
        self.deny_after = Some(successes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_TOP;

    fn frame(n: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(0x10_0000 + n * PAGE_SIZE))
    }

    #[test]
    fn rejects_unaligned_and_out_of_range() {
        let mut dir = PageDirectory::new(USER_TOP);
        assert_eq!(dir.map(VirtAddr::new(1), frame(0), USER_RW), Err(MapError::Unaligned));
        assert_eq!(dir.map(VirtAddr::new(USER_TOP), frame(0), USER_RW), Err(MapError::OutOfRange));
        assert_eq!(
            dir.map(VirtAddr::new(PAGE_SIZE), frame(0), PageTableFlags::WRITABLE),
            Err(MapError::InvalidFlags)
        );
    }

    #[test]
    fn detects_overlap() {
        let mut dir = PageDirectory::new(USER_TOP);
        let va = VirtAddr::new(3 * PAGE_SIZE);
        dir.map(va, frame(0), USER_RW).expect("first mapping");
        assert_eq!(dir.map(va, frame(1), USER_RW), Err(MapError::Overlap));
    }

    #[test]
    fn lookup_observes_mapping() {
        let mut dir = PageDirectory::new(USER_TOP);
        let va = VirtAddr::new(TABLE_SPAN + 5 * PAGE_SIZE);
        assert!(!dir.table_present(va));
        dir.map(va, frame(7), USER_RW).expect("map");
        assert!(dir.table_present(va));
        let entry = dir.present(va).expect("present");
        assert_eq!(entry.addr(), frame(7).start_address());
        assert!(dir.present(va + PAGE_SIZE).is_none());
        assert_eq!(dir.table_count(), 1);
    }

    #[test]
    fn paged_out_marker_round_trip() {
        let mut dir = PageDirectory::new(USER_TOP);
        let va = VirtAddr::new(8 * PAGE_SIZE);
        dir.map(va, frame(2), USER_RW).unwrap();
        dir.mark_paged_out(va);
        assert!(dir.is_paged_out(va));
        assert!(dir.present(va).is_none());
        assert_eq!(dir.mappings().count(), 1);
        assert!(dir.unmap(va).is_some());
        assert_eq!(dir.mappings().count(), 0);
    }

    #[test]
    fn paged_out_marker_can_be_installed_directly() {
        let mut dir = PageDirectory::new(USER_TOP);
        let va = VirtAddr::new(4 * PAGE_SIZE);
        dir.map_paged_out(va).unwrap();
        assert!(dir.is_paged_out(va));
        assert_eq!(dir.map(va, frame(0), USER_RW), Err(MapError::Overlap));
    }

    #[test]
    fn mappings_are_in_address_order() {
        let mut dir = PageDirectory::new(USER_TOP);
        let high = VirtAddr::new(USER_TOP - PAGE_SIZE);
        let low = VirtAddr::new(PAGE_SIZE);
        dir.map(high, frame(1), USER_RW).unwrap();
        dir.map(low, frame(0), USER_RW).unwrap();
        let vas: Vec<u64> = dir.mappings().map(|(va, _)| va.as_u64()).collect();
        assert_eq!(vas, vec![low.as_u64(), high.as_u64()]);
    }

    #[test]
    fn failpoint_denies_after_budget() {
        let mut dir = PageDirectory::new(USER_TOP);
        dir.deny_map_after(1);
        dir.map(VirtAddr::new(PAGE_SIZE), frame(0), USER_RW).unwrap();
        assert_eq!(
            dir.map(VirtAddr::new(2 * PAGE_SIZE), frame(1), USER_RW),
            Err(MapError::PermissionDenied)
        );
        dir.map(VirtAddr::new(2 * PAGE_SIZE), frame(1), USER_RW).unwrap();
    }
}
