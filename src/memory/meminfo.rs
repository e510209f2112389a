//! Memory usage report for the diagnostics syscall.
//!
//! Layout, all fields big-endian `u32`:
//!
//! ```text
//! offset 0   process count
//!        4   physical frames in use (whole system)
//!        8   shared segments in use (whole system)
//!       12   reserved, zero
//! then one 16-byte record per process:
//!        0   pid
//!        4   resident pages
//!        8   swapped pages
//!       12   shared-memory handles held
//! ```

use static_assertions::const_assert_eq;

use super::process::Process;
use super::VirtualMemory;

/// Size of the header and of each per-process record.
pub const RECORD_LEN: usize = 16;

const_assert_eq!(RECORD_LEN, 4 * core::mem::size_of::<u32>());

/// Errors from [`VirtualMemory::memory_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoError {
    /// The caller's buffer cannot hold the report.
    BufferTooSmall { needed: usize, available: usize },
}

impl core::fmt::Display for InfoError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            InfoError::BufferTooSmall { needed, available } => {
                write!(f, "report needs {} bytes, buffer has {}", needed, available)
            }
        }
    }
}

/// Bytes needed to report on `processes` processes.
pub fn report_len(processes: usize) -> usize {
    RECORD_LEN * (processes + 1)
}

fn put_record(buf: &mut [u8], fields: [u32; 4]) {
    for (chunk, field) in buf.chunks_exact_mut(4).zip(fields) {
        chunk.copy_from_slice(&field.to_be_bytes());
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl VirtualMemory {
    /// Write the memory report for `processes` into `buf`. Returns the
    /// number of bytes written.
    pub fn memory_info<'a, I>(&self, processes: I, buf: &mut [u8]) -> Result<usize, InfoError>
    where
        I: IntoIterator<Item = &'a Process>,
        I::IntoIter: ExactSizeIterator,
    {
        let processes = processes.into_iter();
        let needed = report_len(processes.len());
        if buf.len() < needed {
            return Err(InfoError::BufferTooSmall { needed, available: buf.len() });
        }

        let header = [
            count(processes.len()),
            count(self.frames.in_use()),
            count(self.shm.segments_in_use()),
            0,
        ];
        put_record(&mut buf[..RECORD_LEN], header);
        for (record, process) in buf[RECORD_LEN..needed].chunks_exact_mut(RECORD_LEN).zip(processes) {
            put_record(
                record,
                [
                    process.pid().0,
                    count(process.resident_count()),
                    count(process.swapped_count()),
                    count(process.shared().count()),
                ],
            );
        }
        Ok(needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VmConfig, PAGE_SIZE};
    use crate::memory::testing::{process, vm, vm_with};
    use crate::memory::{Pid, Signature};
    use alloc::vec;

    fn field(buf: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
    }

    #[test]
    fn reports_header_and_records() {
        let vm = vm_with(VmConfig::new().with_resident_capacity(2), 16);
        let mut parent = process(&vm, 7);
        vm.grow_heap(&mut parent, 5 * PAGE_SIZE).unwrap();
        vm.shm_join(&mut parent, Signature::new(114514).unwrap()).unwrap();
        let child = vm.fork(&mut parent, Pid(8)).unwrap();

        let mut buf = vec![0xAAu8; 64];
        let written = vm.memory_info([&parent, &child], &mut buf).unwrap();
        assert_eq!(written, 48);

        assert_eq!(field(&buf, 0), 2);
        // Two shared heap frames plus the segment page.
        assert_eq!(field(&buf, 4), 3);
        assert_eq!(field(&buf, 8), 1);
        assert_eq!(field(&buf, 12), 0);

        assert_eq!(field(&buf, 16), 7);
        assert_eq!(field(&buf, 20), 2);
        assert_eq!(field(&buf, 24), 2);
        assert_eq!(field(&buf, 28), 1);

        assert_eq!(field(&buf, 32), 8);
        assert_eq!(field(&buf, 36), 2);
        assert_eq!(field(&buf, 40), 2);
        assert_eq!(field(&buf, 44), 0);
        // Bytes past the report are untouched.
        assert_eq!(buf[48], 0xAA);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let vm = vm(4);
        let p = process(&vm, 1);
        let mut buf = [0u8; 20];
        assert_eq!(
            vm.memory_info([&p], &mut buf),
            Err(InfoError::BufferTooSmall { needed: 32, available: 20 })
        );
    }

    #[test]
    fn empty_report_is_just_the_header() {
        let vm = vm(4);
        let mut buf = [0xFFu8; 16];
        assert_eq!(vm.memory_info(core::iter::empty::<&Process>(), &mut buf), Ok(16));
        assert_eq!(buf, [0u8; 16]);
    }
}
