//! A software-simulated virtual memory manager.
//!
//! Pages are 1 KiB, virtual addresses are 24 bits wide, and every process
//! owns a two-level page table built lazily from a fixed kernel pool.
//! Physical frames are simulated RAM; when they run out, a second-chance
//! clock picks victims and swaps dirty pages to a [`Partition`]. Processes
//! can share named segments and be cloned eagerly.
//!
//! [`VmSystem`] and [`VmProcess`] are the thread-safe entry points; the
//! whole system serializes on one global lock.

pub mod config;
pub mod error;
pub mod logging;
pub mod mm;
pub mod partition;
pub mod sync;

pub use config::PAGE_SIZE;
pub use error::{ClusterNo, Pid, Status, VmError, VmResult};
pub use mm::address::{FrameNum, PhysAddr, VirtAddr};
pub use mm::page_table::AccessType;
pub use mm::system::VmKernel;
pub use partition::{MemPartition, Partition};
pub use sync::{VmProcess, VmSystem};
