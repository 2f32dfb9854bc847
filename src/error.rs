//! Error tiers of the manager.
//!
//! A `PageFault` is recoverable: the page belongs to the process but is not
//! resident, and the caller is expected to retry after fault handling. Every
//! other variant is fatal for the current call only; the tables and
//! allocators stay consistent because preconditions are checked before any
//! allocation happens.

use thiserror::Error;

use crate::mm::address::VirtAddr;
use crate::mm::page_table::AccessType;

pub type ClusterNo = u32;
pub type Pid = u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    /// The page exists but is not resident; retry after fault handling.
    #[error("page fault at {0:?}")]
    PageFault(VirtAddr),
    #[error("segment start {0:?} is not page aligned")]
    Misaligned(VirtAddr),
    #[error("segment size must be at least one page")]
    ZeroSize,
    #[error("segment at {0:?} extends past the virtual memory ceiling")]
    OutOfRange(VirtAddr),
    #[error("segment overlaps an allocated page at {0:?}")]
    Overlap(VirtAddr),
    #[error("no process with id {0}")]
    UnknownProcess(Pid),
    #[error("page at {0:?} was never allocated to the process")]
    NotAllocated(VirtAddr),
    #[error("{0:?} is not the first page of a segment")]
    NotSegmentStart(VirtAddr),
    #[error("segment at {0:?} is shared; detach it instead")]
    DeleteShared(VirtAddr),
    #[error("{requested:?} access denied on page with {granted:?} rights")]
    Permission {
        requested: AccessType,
        granted: AccessType,
    },
    #[error("no shared segment named {0:?}")]
    UnknownSharedSegment(String),
    #[error("process is not attached to shared segment {0:?}")]
    NotAttached(String),
    #[error("shared segment {0:?} exists with a different page count")]
    SharedSizeMismatch(String),
    #[error("shared segment {0:?} exists with incompatible access rights")]
    SharedRightsMismatch(String),
    #[error("initial content length does not match the segment size")]
    ContentSize,
    #[error("kernel space exhausted while allocating a page table node")]
    TableSpaceExhausted,
    #[error("the frame pool is empty and has no page to evict")]
    OutOfFrames,
    #[error("no free disk clusters")]
    OutOfClusters,
    #[error("disk write failed for cluster {0}")]
    DiskWrite(ClusterNo),
    #[error("disk read failed for cluster {0}")]
    DiskRead(ClusterNo),
}

pub type VmResult<T> = Result<T, VmError>;

/// Flattened call status reported by the façades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    PageFault,
    Trap,
}

impl From<VmResult<()>> for Status {
    fn from(res: VmResult<()>) -> Self {
        match res {
            Ok(()) => Status::Ok,
            Err(VmError::PageFault(_)) => Status::PageFault,
            Err(e) => {
                log::warn!("trap: {e}");
                Status::Trap
            }
        }
    }
}
