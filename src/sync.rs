//! Thread-safe façades over the kernel.
//!
//! Every operation takes the single global lock for its whole duration, so
//! operations from any number of threads serialize; there is no finer
//! locking anywhere. Fallible operations flatten to a [`Status`] at this
//! boundary, with the recoverable page fault kept distinct from traps.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Pid, Status, VmResult};
use crate::mm::address::{PhysAddr, VirtAddr};
use crate::mm::page_table::AccessType;
use crate::mm::system::VmKernel;
use crate::partition::Partition;

/// Handle to one virtual memory system instance.
#[derive(Clone)]
pub struct VmSystem {
    kernel: Arc<Mutex<VmKernel>>,
}

/// Handle to one process of a [`VmSystem`].
pub struct VmProcess {
    pid: Pid,
    kernel: Arc<Mutex<VmKernel>>,
}

impl VmSystem {
    /// Build a system over `frames` physical frames, `table_pages` pages of
    /// page-table storage and a swap partition.
    pub fn new(
        frames: usize,
        table_pages: usize,
        partition: Box<dyn Partition + Send>,
    ) -> Self {
        crate::logging::init();
        Self {
            kernel: Arc::new(Mutex::new(VmKernel::new(frames, table_pages, partition))),
        }
    }

    fn kernel(&self) -> MutexGuard<'_, VmKernel> {
        self.kernel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_process(&self) -> VmProcess {
        let pid = self.kernel().create_process();
        VmProcess {
            pid,
            kernel: self.kernel.clone(),
        }
    }

    /// Eagerly duplicate a process. The clone owns copies of every private
    /// segment and shares every shared segment, at the same addresses.
    pub fn clone_process(&self, process: &VmProcess) -> VmResult<VmProcess> {
        let pid = self.kernel().clone_process(process.pid)?;
        Ok(VmProcess {
            pid,
            kernel: self.kernel.clone(),
        })
    }

    /// Tear the process down, releasing all of its private resources and
    /// detaching it from shared segments.
    pub fn delete_process(&self, process: VmProcess) -> Status {
        self.kernel().delete_process(process.pid).into()
    }

    /// Destroy a shared segment system-wide, force-detaching every process
    /// still attached.
    pub fn delete_shared_segment(&self, name: &str) -> Status {
        self.kernel().delete_shared_segment(name).into()
    }

    /// Read simulated RAM at a resolved physical address.
    pub fn read_physical(&self, at: PhysAddr, buf: &mut [u8]) {
        self.kernel().read_physical(at, buf);
    }

    /// Write simulated RAM at a resolved physical address.
    pub fn write_physical(&self, at: PhysAddr, buf: &[u8]) {
        self.kernel().write_physical(at, buf);
    }
}

impl VmProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn kernel(&self) -> MutexGuard<'_, VmKernel> {
        self.kernel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a zero-filled segment.
    pub fn create_segment(&self, start: VirtAddr, pages: usize, rights: AccessType) -> Status {
        self.kernel()
            .create_segment(self.pid, start, pages, rights)
            .into()
    }

    /// Allocate a segment initialized from `content`, which must be exactly
    /// `pages` pages long.
    pub fn load_segment(
        &self,
        start: VirtAddr,
        pages: usize,
        rights: AccessType,
        content: &[u8],
    ) -> Status {
        self.kernel()
            .load_segment(self.pid, start, pages, rights, content)
            .into()
    }

    /// Delete the private segment starting at `start`.
    pub fn delete_segment(&self, start: VirtAddr) -> Status {
        self.kernel().delete_segment(self.pid, start).into()
    }

    /// Check one memory access. `Status::PageFault` asks the caller to run
    /// [`VmProcess::page_fault`] and retry.
    pub fn access(&self, va: VirtAddr, requested: AccessType) -> Status {
        self.kernel().access(self.pid, va, requested).into()
    }

    /// Handle a page fault at `va` by bringing the page into memory.
    pub fn page_fault(&self, va: VirtAddr) -> Status {
        self.kernel().page_fault(self.pid, va).into()
    }

    /// Resolve `va` to its physical address, faulting the page in first if
    /// needed.
    ///
    /// # Panics
    /// Panics if `va` was never allocated to this process.
    pub fn physical_address(&self, va: VirtAddr) -> VmResult<PhysAddr> {
        self.kernel().physical_address(self.pid, va)
    }

    /// Create the named shared segment, or attach to it if it already
    /// exists with the same size and compatible rights.
    pub fn create_shared_segment(
        &self,
        start: VirtAddr,
        pages: usize,
        name: &str,
        rights: AccessType,
    ) -> Status {
        self.kernel()
            .create_shared_segment(self.pid, start, pages, name, rights)
            .into()
    }

    /// Detach this process from the named shared segment.
    pub fn disconnect_shared_segment(&self, name: &str) -> Status {
        self.kernel().disconnect_shared_segment(self.pid, name).into()
    }
}
