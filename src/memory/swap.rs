//! Swap table of a process.
//!
//! Each entry remembers which virtual page was written out. An entry's
//! position is its backing-store offset: `(page * entries_per_page + index)
//! * PAGE_SIZE`. The table grows a whole page of entries at a time and
//! never shrinks while the process lives.

use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::config::PAGE_SIZE;

/// Errors from per-process table bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// The configured swap-table page limit was reached.
    SwapTableFull,
    /// The kernel heap could not hold another table page.
    OutOfMemory,
}

impl core::fmt::Display for TableError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            TableError::SwapTableFull => write!(f, "swap table full"),
            TableError::OutOfMemory => write!(f, "out of memory for swap table"),
        }
    }
}

/// Per-process record of swapped-out pages.
pub struct SwapTable {
    pages: Vec<Vec<Option<VirtAddr>>>,
    entries_per_page: usize,
    page_limit: Option<usize>,
    len: usize,
}

impl SwapTable {
    pub fn new(entries_per_page: usize, page_limit: Option<usize>) -> Self {
        SwapTable {
            pages: Vec::new(),
            entries_per_page,
            page_limit,
            len: 0,
        }
    }

    /// Swap-table pages allocated so far.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Pages currently swapped out.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn offset_of(&self, page: usize, index: usize) -> usize {
        (page * self.entries_per_page + index) * PAGE_SIZE as usize
    }

    fn position(&self, offset: usize) -> (usize, usize) {
        let slot = offset / PAGE_SIZE as usize;
        (slot / self.entries_per_page, slot % self.entries_per_page)
    }

    /// Append one page of empty entries.
    pub fn grow(&mut self) -> Result<(), TableError> {
        if let Some(limit) = self.page_limit {
            if self.pages.len() >= limit {
                return Err(TableError::SwapTableFull);
            }
        }
        let mut page = Vec::new();
        page.try_reserve_exact(self.entries_per_page)
            .map_err(|_| TableError::OutOfMemory)?;
        page.resize(self.entries_per_page, None);
        self.pages.try_reserve(1).map_err(|_| TableError::OutOfMemory)?;
        self.pages.push(page);
        Ok(())
    }

    /// Record `va` in the first empty entry, growing the table if needed.
    /// Returns the entry's backing-store offset.
    pub fn claim(&mut self, va: VirtAddr) -> Result<usize, TableError> {
        let free = self.pages.iter().enumerate().find_map(|(page, entries)| {
            entries.iter().position(|e| e.is_none()).map(|index| (page, index))
        });
        let (page, index) = match free {
            Some(position) => position,
            None => {
                self.grow()?;
                (self.pages.len() - 1, 0)
            }
        };
        self.pages[page][index] = Some(va);
        self.len += 1;
        Ok(self.offset_of(page, index))
    }

    /// Backing-store offset of `va`, if it is swapped out.
    pub fn find(&self, va: VirtAddr) -> Option<usize> {
        self.pages.iter().enumerate().find_map(|(page, entries)| {
            entries
                .iter()
                .position(|e| *e == Some(va))
                .map(|index| self.offset_of(page, index))
        })
    }

    /// Page recorded at `offset`.
    pub fn at(&self, offset: usize) -> Option<VirtAddr> {
        let (page, index) = self.position(offset);
        self.pages.get(page).and_then(|entries| entries[index])
    }

    /// Overwrite the entry at `offset` with `va` (swap-in trade).
    ///
    /// Panics if the entry is empty.
    pub fn replace(&mut self, offset: usize, va: VirtAddr) -> VirtAddr {
        let (page, index) = self.position(offset);
        match self.pages.get_mut(page).and_then(|entries| entries[index].replace(va)) {
            Some(old) => old,
            None => panic!("[SWAP] replacing empty swap entry at offset {:#x}", offset),
        }
    }

    /// Forget `va`, returning the offset it occupied.
    pub fn remove(&mut self, va: VirtAddr) -> Option<usize> {
        let offset = self.find(va)?;
        let (page, index) = self.position(offset);
        self.pages[page][index] = None;
        self.len -= 1;
        Some(offset)
    }

    /// `(offset, va)` for every swapped-out page.
    pub fn iter(&self) -> impl Iterator<Item = (usize, VirtAddr)> + '_ {
        self.pages.iter().enumerate().flat_map(move |(page, entries)| {
            entries.iter().enumerate().filter_map(move |(index, e)| {
                e.map(|va| (self.offset_of(page, index), va))
            })
        })
    }

    /// Make this table a copy of `src`, entry by entry. Grows first so
    /// every offset in `src` exists here too.
    pub fn copy_from(&mut self, src: &SwapTable) -> Result<(), TableError> {
        if self.entries_per_page != src.entries_per_page {
            panic!("[SWAP] copying between tables of different page width");
        }
        while self.pages.len() < src.pages.len() {
            self.grow()?;
        }
        for entries in &mut self.pages {
            entries.iter_mut().for_each(|e| *e = None);
        }
        for (dst, src) in self.pages.iter_mut().zip(&src.pages) {
            dst.copy_from_slice(src);
        }
        self.len = src.len;
        Ok(())
    }

    /// Empty every entry, keeping the allocated pages.
    pub fn clear(&mut self) {
        for entries in &mut self.pages {
            entries.iter_mut().for_each(|e| *e = None);
        }
        self.len = 0;
    }
}
