//! Shared memory bridge for passing large task data between workers.
//!
//! A [`SharedMemoryManager`] lives for exactly one top-level resolution. It
//! hands out named POSIX shared memory segments that any worker in the
//! resolution tree can create, return by handle, and attach to. Segment names
//! are derived from a per-manager prefix and a counter stored in an anonymous
//! `MAP_SHARED` page, so the owning process can unlink segments created by
//! forked children when the manager is dropped.
//!
//! ```text
//!   owner process                     forked worker
//!   ┌──────────────────────┐          ┌──────────────────────┐
//!   │ manager (prefix, ctr)│ ──fork──▶│ manager (same page)  │
//!   │ attach(handle) ◀─────┼── JSON ──┼─ create(len).handle()│
//!   └──────────────────────┘          └──────────────────────┘
//! ```

use crate::error::{EngineError, Result};
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{Pid, ftruncate, getpid};
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of the anonymous page that holds the segment counter.
const COUNTER_PAGE: NonZeroUsize = NonZeroUsize::new(4096).unwrap();

/// Serializable reference to a segment, suitable as a task result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHandle {
    /// POSIX shared memory object name (starts with `/`).
    pub name: String,
    /// Mapped length in bytes.
    pub len: usize,
}

/// Scoped allocator of named shared memory segments.
pub struct SharedMemoryManager {
    prefix: String,
    counter: NonNull<AtomicU64>,
    owner: Pid,
}

// The counter page is only accessed through the atomic.
unsafe impl Send for SharedMemoryManager {}
unsafe impl Sync for SharedMemoryManager {}

impl SharedMemoryManager {
    /// Create a manager owned by the current process.
    pub fn new() -> Result<Self> {
        let page = unsafe {
            mman::mmap_anonymous(
                None,
                COUNTER_PAGE,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| EngineError::SharedMemory(format!("Failed to map counter page: {}", e)))?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let prefix = format!("/entangle-{}", &id[..12]);
        tracing::debug!(prefix = %prefix, "Shared memory manager created");

        Ok(Self {
            prefix,
            counter: page.cast(),
            owner: getpid(),
        })
    }

    fn counter(&self) -> &AtomicU64 {
        // Safety: the page is zero-initialized, aligned, and mapped until drop.
        unsafe { self.counter.as_ref() }
    }

    fn segment_name(&self, index: u64) -> String {
        format!("{}-{}", self.prefix, index)
    }

    /// Number of segments created so far by any process sharing this manager.
    pub fn segments_created(&self) -> u64 {
        self.counter().load(Ordering::Acquire)
    }

    /// Create and map a new zero-filled segment of `len` bytes.
    pub fn create(&self, len: usize) -> Result<Segment> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| EngineError::SharedMemory("segment length must be non-zero".into()))?;
        let index = self.counter().fetch_add(1, Ordering::AcqRel);
        let name = self.segment_name(index);

        let fd = mman::shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| EngineError::SharedMemory(format!("shm_open {} failed: {}", name, e)))?;
        ftruncate(&fd, len as nix::libc::off_t)
            .map_err(|e| EngineError::SharedMemory(format!("ftruncate {} failed: {}", name, e)))?;

        let segment = Segment::map(&fd, SegmentHandle { name, len }, size)?;
        tracing::trace!(name = %segment.handle.name, len, "Created shared memory segment");
        Ok(segment)
    }

    /// Map a segment previously created by this manager, possibly in another process.
    pub fn attach(&self, handle: &SegmentHandle) -> Result<Segment> {
        if !handle.name.starts_with(&self.prefix) {
            return Err(EngineError::SharedMemory(format!(
                "segment {} does not belong to this resolution",
                handle.name
            )));
        }
        let size = NonZeroUsize::new(handle.len)
            .ok_or_else(|| EngineError::SharedMemory("segment length must be non-zero".into()))?;
        let fd = mman::shm_open(handle.name.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|e| {
            EngineError::SharedMemory(format!("shm_open {} failed: {}", handle.name, e))
        })?;
        Segment::map(&fd, handle.clone(), size)
    }
}

impl Drop for SharedMemoryManager {
    fn drop(&mut self) {
        if getpid() == self.owner {
            let created = self.segments_created();
            for index in 0..created {
                let name = self.segment_name(index);
                if let Err(e) = mman::shm_unlink(name.as_str()) {
                    tracing::trace!(name = %name, error = %e, "Segment already unlinked");
                }
            }
            tracing::debug!(prefix = %self.prefix, segments = created, "Shared memory released");
        }
        unsafe {
            let _ = mman::munmap(self.counter.cast::<c_void>(), COUNTER_PAGE.get());
        }
    }
}

impl std::fmt::Debug for SharedMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryManager")
            .field("prefix", &self.prefix)
            .field("segments_created", &self.segments_created())
            .finish()
    }
}

/// A mapped shared memory segment. Unmapped on drop; unlinked by the manager.
pub struct Segment {
    handle: SegmentHandle,
    ptr: NonNull<c_void>,
}

unsafe impl Send for Segment {}

impl Segment {
    fn map(fd: &std::os::fd::OwnedFd, handle: SegmentHandle, size: NonZeroUsize) -> Result<Self> {
        let ptr = unsafe {
            mman::mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| EngineError::SharedMemory(format!("mmap {} failed: {}", handle.name, e)))?;
        Ok(Self { handle, ptr })
    }

    /// Handle to return from a task so another worker can attach.
    pub fn handle(&self) -> &SegmentHandle {
        &self.handle
    }

    pub fn len(&self) -> usize {
        self.handle.len
    }

    pub fn is_empty(&self) -> bool {
        self.handle.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.handle.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.handle.len) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let _ = mman::munmap(self.ptr, self.handle.len);
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("handle", &self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_attach_share_bytes() {
        let manager = SharedMemoryManager::new().unwrap();
        let mut segment = manager.create(16).unwrap();
        segment.as_mut_slice()[..5].copy_from_slice(b"hello");

        let attached = manager.attach(segment.handle()).unwrap();
        assert_eq!(&attached.as_slice()[..5], b"hello");
        assert_eq!(attached.len(), 16);
        assert_eq!(manager.segments_created(), 1);
    }

    #[test]
    fn test_zero_length_rejected() {
        let manager = SharedMemoryManager::new().unwrap();
        let err = manager.create(0).unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn test_attach_rejects_foreign_segment() {
        let manager = SharedMemoryManager::new().unwrap();
        let foreign = SegmentHandle {
            name: "/someone-else-0".into(),
            len: 8,
        };
        assert!(manager.attach(&foreign).is_err());
    }

    #[test]
    fn test_drop_unlinks_segments() {
        let manager = SharedMemoryManager::new().unwrap();
        let handle = manager.create(8).unwrap().handle().clone();
        drop(manager);

        let reopened = mman::shm_open(handle.name.as_str(), OFlag::O_RDWR, Mode::empty());
        assert!(reopened.is_err(), "segment should be unlinked after drop");
    }

    #[test]
    fn test_handle_serializes_as_json() {
        let handle = SegmentHandle {
            name: "/entangle-abc-0".into(),
            len: 32,
        };
        let value = serde_json::to_value(&handle).unwrap();
        assert_eq!(value["len"], 32);
        let parsed: SegmentHandle = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, handle);
    }
}
