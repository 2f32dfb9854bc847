//! The swap partition collaborator.
//!
//! The core only ever moves whole clusters, each exactly one page. Failures
//! are reported as booleans and surface in the core as fatal allocation or
//! eviction errors; nothing is retried.

use crate::config::PAGE_SIZE;
use crate::error::ClusterNo;

pub trait Partition {
    /// Number of clusters on the partition.
    fn cluster_count(&self) -> ClusterNo;

    /// Read one cluster into `buf` (exactly one page). `false` on failure.
    fn read_cluster(&mut self, cluster: ClusterNo, buf: &mut [u8]) -> bool;

    /// Write one page from `buf` to a cluster. `false` on failure.
    fn write_cluster(&mut self, cluster: ClusterNo, buf: &[u8]) -> bool;
}

/// An in-memory partition for tests and demos.
pub struct MemPartition {
    clusters: Vec<u8>,
    count: ClusterNo,
}

impl MemPartition {
    pub fn new(count: ClusterNo) -> Self {
        Self {
            clusters: vec![0; count as usize * PAGE_SIZE],
            count,
        }
    }
}

impl Partition for MemPartition {
    fn cluster_count(&self) -> ClusterNo {
        self.count
    }

    fn read_cluster(&mut self, cluster: ClusterNo, buf: &mut [u8]) -> bool {
        if cluster >= self.count || buf.len() != PAGE_SIZE {
            return false;
        }
        let base = cluster as usize * PAGE_SIZE;
        buf.copy_from_slice(&self.clusters[base..base + PAGE_SIZE]);
        true
    }

    fn write_cluster(&mut self, cluster: ClusterNo, buf: &[u8]) -> bool {
        if cluster >= self.count || buf.len() != PAGE_SIZE {
            return false;
        }
        let base = cluster as usize * PAGE_SIZE;
        self.clusters[base..base + PAGE_SIZE].copy_from_slice(buf);
        true
    }
}
