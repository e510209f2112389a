//! Signature-keyed shared memory.
//!
//! A segment is one physical page named by a caller-chosen 32-bit
//! signature. Processes join and leave segments through a fixed set of
//! handles; the segment's page is released when its last user leaves.
//! Data moves by copy (`read`/`write`), the page is never mapped into user
//! space.
//!
//! Every operation runs under the table lock. Frame access nests the
//! allocator lock inside it, never the other way round.

use core::num::NonZeroU32;
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;

use super::frame_allocator::{FrameAllocator, FrameBytes};
use crate::config::{PAGE_SIZE, SHARED_GLOBAL, SHARED_PER_PROCESS};
use crate::println;

// ─── Core types ──────────────────────────────────────────────────

/// Name of a shared segment. Zero is reserved for "empty handle".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(NonZeroU32);

impl Signature {
    /// Signature from a raw value supplied by user space.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Signature)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

impl core::fmt::Display for Signature {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Shm#{}", self.0)
    }
}

/// Segments a process has joined.
#[derive(Debug, Clone, Default)]
pub struct SharedHandles {
    slots: [Option<Signature>; SHARED_PER_PROCESS],
}

impl SharedHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, signature: Signature) -> bool {
        self.position(signature).is_some()
    }

    /// Handles in use.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Signature> + '_ {
        self.slots.iter().flatten().copied()
    }

    fn position(&self, signature: Signature) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(signature))
    }

    fn empty_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }
}

/// Shared-memory errors. None of these are fatal to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    /// The process already holds this signature.
    AlreadyJoined,
    /// All of the process's handles are in use.
    HandlesFull,
    /// No free global segment slot.
    TableFull,
    /// The process does not hold this signature.
    NotJoined,
    /// No global segment carries this signature.
    NoSuchSegment,
    /// No physical page for a new segment.
    OutOfMemory,
    /// Content (plus terminator) does not fit in one page.
    TooLarge { len: usize },
}

impl core::fmt::Display for ShmError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ShmError::AlreadyJoined => write!(f, "already joined"),
            ShmError::HandlesFull => write!(f, "no free shared-memory handle"),
            ShmError::TableFull => write!(f, "shared-memory table full"),
            ShmError::NotJoined => write!(f, "signature not joined"),
            ShmError::NoSuchSegment => write!(f, "no such segment"),
            ShmError::OutOfMemory => write!(f, "out of memory"),
            ShmError::TooLarge { len } => write!(f, "{} bytes do not fit in a page", len),
        }
    }
}

// ─── Global table ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Segment {
    signature: Signature,
    frame: PhysFrame,
    users: u32,
}

/// System-wide table of shared segments.
pub struct SharedMemory {
    segments: Mutex<[Option<Segment>; SHARED_GLOBAL]>,
}

impl SharedMemory {
    pub const fn new() -> Self {
        SharedMemory { segments: Mutex::new([None; SHARED_GLOBAL]) }
    }

    /// Join the segment named `signature`, creating it if nobody holds it.
    pub fn join(
        &self,
        handles: &mut SharedHandles,
        signature: Signature,
        frames: &FrameAllocator,
    ) -> Result<(), ShmError> {
        let mut segments = self.segments.lock();
        if handles.contains(signature) {
            return Err(ShmError::AlreadyJoined);
        }
        let handle = handles.empty_slot().ok_or(ShmError::HandlesFull)?;

        if let Some(segment) = segments.iter_mut().flatten().find(|s| s.signature == signature) {
            segment.users += 1;
            handles.slots[handle] = Some(signature);
            return Ok(());
        }

        let slot = segments.iter().position(|s| s.is_none()).ok_or(ShmError::TableFull)?;
        let frame = frames.allocate_zeroed().ok_or(ShmError::OutOfMemory)?;
        segments[slot] = Some(Segment { signature, frame, users: 1 });
        handles.slots[handle] = Some(signature);
        println!("[SHM] created {} at {:#x}", signature, frame.start_address().as_u64());
        Ok(())
    }

    /// Leave `signature`; the segment's page goes back to the allocator
    /// when this was the last user.
    pub fn leave(
        &self,
        handles: &mut SharedHandles,
        signature: Signature,
        frames: &FrameAllocator,
    ) -> Result<(), ShmError> {
        let mut segments = self.segments.lock();
        let handle = handles.position(signature).ok_or(ShmError::NotJoined)?;
        let slot = segments
            .iter()
            .position(|s| s.map_or(false, |s| s.signature == signature))
            .ok_or(ShmError::NoSuchSegment)?;

        handles.slots[handle] = None;
        let last = match segments[slot].as_mut() {
            Some(segment) => {
                segment.users -= 1;
                segment.users == 0
            }
            None => false,
        };
        if last {
            if let Some(segment) = segments[slot].take() {
                frames.release(segment.frame);
                println!("[SHM] destroyed {}", signature);
            }
        }
        Ok(())
    }

    /// Leave every segment `handles` holds (process exit).
    pub fn leave_all(&self, handles: &mut SharedHandles, frames: &FrameAllocator) {
        let held: [Option<Signature>; SHARED_PER_PROCESS] = handles.slots;
        for signature in held.into_iter().flatten() {
            if let Err(err) = self.leave(handles, signature, frames) {
                println!("[SHM] leaving {} at exit: {}", signature, err);
            }
        }
    }

    fn frame_of(&self, segments: &[Option<Segment>], handles: &SharedHandles, signature: Signature) -> Result<PhysFrame, ShmError> {
        if !handles.contains(signature) {
            return Err(ShmError::NotJoined);
        }
        segments
            .iter()
            .flatten()
            .find(|s| s.signature == signature)
            .map(|s| s.frame)
            .ok_or(ShmError::NoSuchSegment)
    }

    /// Copy the whole segment page into `buf`.
    pub fn read(
        &self,
        handles: &SharedHandles,
        signature: Signature,
        frames: &FrameAllocator,
        buf: &mut FrameBytes,
    ) -> Result<(), ShmError> {
        let segments = self.segments.lock();
        let frame = self.frame_of(&segments[..], handles, signature)?;
        frames.with_frame(frame, |bytes| buf.copy_from_slice(bytes));
        Ok(())
    }

    /// Store a NUL-terminated string at the start of the segment page.
    ///
    /// `content` is cut at its first NUL, if any; the bytes before it plus
    /// one terminating NUL are written. The rest of the page is untouched.
    pub fn write(
        &self,
        handles: &SharedHandles,
        signature: Signature,
        frames: &FrameAllocator,
        content: &[u8],
    ) -> Result<(), ShmError> {
        let segments = self.segments.lock();
        let frame = self.frame_of(&segments[..], handles, signature)?;
        let len = content.iter().position(|b| *b == 0).unwrap_or(content.len());
        if len + 1 > PAGE_SIZE as usize {
            return Err(ShmError::TooLarge { len });
        }
        frames.with_frame_mut(frame, |bytes| {
            bytes[..len].copy_from_slice(&content[..len]);
            bytes[len] = 0;
        });
        Ok(())
    }

    /// Segments currently allocated.
    pub fn segments_in_use(&self) -> usize {
        self.segments.lock().iter().flatten().count()
    }

    /// Users of `signature`, if the segment exists.
    pub fn users(&self, signature: Signature) -> Option<u32> {
        self.segments
            .lock()
            .iter()
            .flatten()
            .find(|s| s.signature == signature)
            .map(|s| s.users)
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}
