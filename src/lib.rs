//! ParyantaOS virtual memory
//!
//! User address spaces for the kernel:
//! - Reference-counted physical frames
//! - Copy-on-write fork
//! - Lazy heap allocation and on-demand stack growth
//! - Per-process FIFO paging to a backing store
//! - Signature-keyed shared memory
//!
//! The trap path calls [`memory::VirtualMemory::handle_page_fault`]; process
//! management calls the `grow_heap`/`fork`/`free_address_space` family.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod memory;
pub mod serial;

pub use config::VmConfig;
pub use memory::{FaultError, FaultOutcome, Pid, Process, VirtualMemory, VmError};
