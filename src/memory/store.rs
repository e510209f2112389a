//! Backing store for swapped-out pages.
//!
//! The swap file itself lives outside the VM subsystem; this is the
//! interface it is driven through. Transfers report how many bytes moved,
//! and anything short of the requested length is treated as a failure.

use alloc::boxed::Box;
use alloc::vec::Vec;

/// Backing-store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// The device reported an error.
    Io,
    /// Fewer bytes than requested were transferred.
    ShortTransfer { expected: usize, actual: usize },
    /// The store cannot be duplicated for a child process.
    Unsupported,
}

impl core::fmt::Display for SwapError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            SwapError::Io => write!(f, "backing store I/O error"),
            SwapError::ShortTransfer { expected, actual } => {
                write!(f, "short transfer ({} of {} bytes)", actual, expected)
            }
            SwapError::Unsupported => write!(f, "operation not supported by backing store"),
        }
    }
}

/// A process's swap file.
pub trait BackingStore: Send {
    /// Read into `buf` from byte `offset`; returns the bytes read.
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, SwapError>;

    /// Write `buf` at byte `offset`; returns the bytes written.
    fn write(&mut self, offset: usize, buf: &[u8]) -> Result<usize, SwapError>;

    /// An independent copy of the store's contents, for a forked child.
    fn duplicate(&self) -> Result<Box<dyn BackingStore>, SwapError>;

    /// The range `[offset, offset + len)` no longer holds a page.
    fn discard(&mut self, _offset: usize, _len: usize) {}
}

/// Read exactly `buf.len()` bytes.
pub fn read_exact(store: &mut dyn BackingStore, offset: usize, buf: &mut [u8]) -> Result<(), SwapError> {
    let actual = store.read(offset, buf)?;
    if actual != buf.len() {
        return Err(SwapError::ShortTransfer { expected: buf.len(), actual });
    }
    Ok(())
}

/// Write exactly `buf.len()` bytes.
pub fn write_all(store: &mut dyn BackingStore, offset: usize, buf: &[u8]) -> Result<(), SwapError> {
    let actual = store.write(offset, buf)?;
    if actual != buf.len() {
        return Err(SwapError::ShortTransfer { expected: buf.len(), actual });
    }
    Ok(())
}

// ─── In-memory store ────────────────────────────────────────────

/// Swap file kept in kernel memory, optionally bounded.
///
/// Reads of never-written ranges return zeroes. Writes past the capacity
/// are truncated (and so reported short).
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    data: Vec<u8>,
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that holds at most `bytes` bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        MemoryBackingStore { data: Vec::new(), capacity: Some(bytes) }
    }

    /// Bytes currently materialised.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl BackingStore for MemoryBackingStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, SwapError> {
        let end = offset + buf.len();
        if let Some(capacity) = self.capacity {
            if end > capacity {
                return Ok(capacity.saturating_sub(offset).min(buf.len()));
            }
        }
        buf.fill(0);
        if offset < self.data.len() {
            let available = self.data.len().min(end) - offset;
            buf[..available].copy_from_slice(&self.data[offset..offset + available]);
        }
        Ok(buf.len())
    }

    fn write(&mut self, offset: usize, buf: &[u8]) -> Result<usize, SwapError> {
        let limit = self.capacity.unwrap_or(usize::MAX);
        if offset >= limit {
            return Ok(0);
        }
        let count = buf.len().min(limit - offset);
        if self.data.len() < offset + count {
            self.data.resize(offset + count, 0);
        }
        self.data[offset..offset + count].copy_from_slice(&buf[..count]);
        Ok(count)
    }

    fn duplicate(&self) -> Result<Box<dyn BackingStore>, SwapError> {
        Ok(Box::new(self.clone()))
    }

    fn discard(&mut self, offset: usize, len: usize) {
        if offset >= self.data.len() {
            return;
        }
        let end = (offset + len).min(self.data.len());
        if end == self.data.len() {
            self.data.truncate(offset);
        } else {
            self.data[offset..end].fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_ranges_read_as_zero() {
        let mut store = MemoryBackingStore::new();
        let mut buf = [0xffu8; 16];
        read_exact(&mut store, 4096, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn write_then_read_back() {
        let mut store = MemoryBackingStore::new();
        write_all(&mut store, 8192, b"swapped").unwrap();
        let mut buf = [0u8; 7];
        read_exact(&mut store, 8192, &mut buf).unwrap();
        assert_eq!(&buf, b"swapped");
    }

    #[test]
    fn bounded_store_reports_short_write() {
        let mut store = MemoryBackingStore::with_capacity(4096);
        let page = [7u8; 4096];
        write_all(&mut store, 0, &page).unwrap();
        assert_eq!(
            write_all(&mut store, 2048, &page),
            Err(SwapError::ShortTransfer { expected: 4096, actual: 2048 })
        );
        assert_eq!(
            write_all(&mut store, 4096, &page),
            Err(SwapError::ShortTransfer { expected: 4096, actual: 0 })
        );
    }

    #[test]
    fn duplicate_is_independent() {
        let mut store = MemoryBackingStore::new();
        write_all(&mut store, 0, b"parent").unwrap();
        let mut child = store.duplicate().unwrap();
        write_all(child.as_mut(), 0, b"child!").unwrap();
        let mut buf = [0u8; 6];
        read_exact(&mut store, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn discard_reclaims_tail() {
        let mut store = MemoryBackingStore::new();
        write_all(&mut store, 0, &[1u8; 8192]).unwrap();
        store.discard(4096, 4096);
        assert_eq!(store.len(), 4096);
        store.discard(0, 1024);
        let mut buf = [9u8; 1024];
        read_exact(&mut store, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }
}
