//! Free-space bookkeeping for the three resource pools: physical page
//! frames, kernel space for page-table nodes, and disk swap clusters.
//!
//! All three share one strategy, first fit over an address-ordered list of
//! free runs. Ordering on reinsertion is mandatory so later scans see a
//! consistent ascending list; merging adjacent runs is not.

use super::address::FrameNum;
use crate::error::ClusterNo;

/// A run of free page frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameRun {
    first: usize,
    len: usize,
}

/// A free byte range in the kernel pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KernelArea {
    base: usize,
    size: usize,
}

/// A run of free disk clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClusterRun {
    first: ClusterNo,
    len: ClusterNo,
}

/// A byte range carved out of the kernel pool for one page-table node.
///
/// The node itself lives on the Rust heap; the span charges its storage
/// against the fixed kernel space and must be handed back on free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSpan {
    pub base: usize,
    pub size: usize,
}

pub struct SpaceAllocator {
    frame_free: Vec<FrameRun>,
    kernel_free: Vec<KernelArea>,
    cluster_free: Vec<ClusterRun>,
}

impl SpaceAllocator {
    /// Set up the allocator over `frames` page frames, `kernel_bytes` of
    /// page-table storage and `clusters` swap clusters, all fully free.
    pub fn new(frames: usize, kernel_bytes: usize, clusters: ClusterNo) -> Self {
        Self {
            frame_free: if frames > 0 {
                vec![FrameRun { first: 0, len: frames }]
            } else {
                Vec::new()
            },
            kernel_free: if kernel_bytes > 0 {
                vec![KernelArea { base: 0, size: kernel_bytes }]
            } else {
                Vec::new()
            },
            cluster_free: if clusters > 0 {
                vec![ClusterRun { first: 0, len: clusters }]
            } else {
                Vec::new()
            },
        }
    }

    pub fn frames_exhausted(&self) -> bool {
        self.frame_free.is_empty()
    }

    /// Take one frame from the first free run. `None` means the pool is
    /// empty and the caller has to evict a victim first.
    pub fn alloc_frame(&mut self) -> Option<FrameNum> {
        let run = self.frame_free.first_mut()?;
        let frame = FrameNum(run.first);
        run.first += 1;
        run.len -= 1;
        if run.len == 0 {
            self.frame_free.remove(0);
        }
        Some(frame)
    }

    /// Return a frame to the pool, spliced in ascending address order.
    pub fn free_frame(&mut self, frame: FrameNum) {
        let pos = self
            .frame_free
            .iter()
            .position(|run| run.first > frame.0)
            .unwrap_or(self.frame_free.len());
        self.frame_free.insert(pos, FrameRun { first: frame.0, len: 1 });
    }

    /// First-fit carve-out from the kernel pool. `None` when no free block
    /// is large enough; the caller treats that as a fatal allocation error.
    pub fn alloc_node(&mut self, size: usize) -> Option<KernelSpan> {
        let idx = self.kernel_free.iter().position(|area| area.size >= size);
        let Some(idx) = idx else {
            log::warn!("kernel pool exhausted; no block of {size} bytes");
            return None;
        };

        let area = &mut self.kernel_free[idx];
        let span = KernelSpan { base: area.base, size };
        if area.size > size {
            area.base += size;
            area.size -= size;
        } else {
            self.kernel_free.remove(idx);
        }
        Some(span)
    }

    /// Return a node span to the kernel pool, in ascending base order.
    pub fn free_node(&mut self, span: KernelSpan) {
        let pos = self
            .kernel_free
            .iter()
            .position(|area| area.base > span.base)
            .unwrap_or(self.kernel_free.len());
        self.kernel_free.insert(pos, KernelArea { base: span.base, size: span.size });
    }

    /// Take the first cluster of the first free run. `None` when the disk
    /// has no swap space left.
    pub fn alloc_cluster(&mut self) -> Option<ClusterNo> {
        let run = self.cluster_free.first_mut()?;
        let cluster = run.first;
        run.first += 1;
        run.len -= 1;
        if run.len == 0 {
            self.cluster_free.remove(0);
        }
        Some(cluster)
    }

    /// Push a freed cluster as a singleton run at the head. Cluster identity
    /// is all that matters for swap, so the run list is left unordered.
    pub fn free_cluster(&mut self, cluster: ClusterNo) {
        self.cluster_free.insert(0, ClusterRun { first: cluster, len: 1 });
    }
}
