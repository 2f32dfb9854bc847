//! Named shared memory segments.
//!
//! A shared segment owns the canonical descriptor table for its pages; the
//! registry key is the segment name. Attaching processes install local alias
//! slots carrying the SHARED flag and a `SharedRef` back into the canonical
//! table. The canonical descriptors are the only source of truth for
//! residency, dirtiness and rights; aliases are resolved by lookup on every
//! use and never overwritten.

use std::collections::HashMap;
use std::sync::Arc;

use super::address::VirtAddr;
use super::allocator::KernelSpan;
use super::page_table::{AccessType, Backing, DescFlags, Descriptor, SharedRef};
use super::system::VmKernel;
use crate::config::DESCRIPTOR_BYTES;
use crate::error::{Pid, VmError, VmResult};

pub struct SharedSegment {
    pub(crate) name: Arc<str>,
    pub(crate) pages: usize,
    pub(crate) rights: AccessType,
    /// Canonical per-page descriptors, allocated once at creation.
    pub(crate) table: Vec<Descriptor>,
    /// Kernel-pool charge for the canonical table.
    pub(crate) span: KernelSpan,
    /// Attached process -> virtual start address chosen by that process.
    pub(crate) attached: HashMap<Pid, VirtAddr>,
}

impl SharedSegment {
    /// Reference count: number of currently attached processes.
    pub fn attach_count(&self) -> usize {
        self.attached.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }

    pub fn rights(&self) -> AccessType {
        self.rights
    }
}

impl VmKernel {
    /// Create a shared segment named `name`, or attach to the existing one.
    ///
    /// Creation allocates the canonical table and one frame per page, then
    /// installs alias slots in the caller. Attaching requires the exact page
    /// count and compatible rights: an exact match, or anything weaker when
    /// the segment was created READ_WRITE.
    pub fn create_shared_segment(
        &mut self,
        pid: Pid,
        start: VirtAddr,
        pages: usize,
        name: &str,
        rights: AccessType,
    ) -> VmResult<()> {
        self.check_segment(pid, start, pages)?;

        if !self.shared.contains_key(name) {
            self.create_shared(pid, start, pages, name, rights)
        } else {
            self.attach_shared(pid, start, pages, name, rights)
        }
    }

    fn create_shared(
        &mut self,
        pid: Pid,
        start: VirtAddr,
        pages: usize,
        name: &str,
        rights: AccessType,
    ) -> VmResult<()> {
        let arc: Arc<str> = Arc::from(name);
        let span = self
            .allocator
            .alloc_node(pages * DESCRIPTOR_BYTES)
            .ok_or(VmError::TableSpaceExhausted)?;

        // registered before the first frame is taken: eviction's owner scan
        // must see every canonical page the moment its frame exists
        let mut attached = HashMap::new();
        attached.insert(pid, start);
        self.shared.insert(
            arc.clone(),
            SharedSegment {
                name: arc.clone(),
                pages,
                rights,
                table: Vec::with_capacity(pages),
                span,
                attached,
            },
        );

        for i in 0..pages {
            let frame = match self.alloc_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    self.unwind_shared_create(name, pid, start, pages);
                    return Err(e);
                }
            };
            self.shared
                .get_mut(name)
                .expect("segment vanished")
                .table
                .push(Descriptor {
                    flags: DescFlags::VALID | DescFlags::LOADED,
                    rights,
                    ordinal: i as u16,
                    frame,
                    backing: Backing::None,
                });
            let alias = Descriptor {
                flags: DescFlags::VALID | DescFlags::LOADED | DescFlags::SHARED,
                rights,
                ordinal: i as u16,
                frame,
                backing: Backing::Shared(SharedRef {
                    name: arc.clone(),
                    page: i,
                }),
            };
            if let Err(e) = self.map_page(pid, start.add_pages(i), alias) {
                self.unwind_shared_create(name, pid, start, pages);
                return Err(e);
            }
        }

        log::debug!("shared segment {name:?} created: {pages} pages at {start:?} for pid {pid}");
        Ok(())
    }

    /// Take back everything a failed creation handed out: the caller's alias
    /// slots, the canonical frames and clusters, the table span, and the
    /// registry entry itself.
    fn unwind_shared_create(&mut self, name: &str, pid: Pid, start: VirtAddr, pages: usize) {
        self.clear_alias_run(pid, start, pages);
        if let Some(seg) = self.shared.remove(name) {
            for desc in &seg.table {
                if desc.is_valid() {
                    self.allocator.free_frame(desc.frame);
                }
                if desc.is_swapped() {
                    if let Some(cluster) = desc.cluster() {
                        self.allocator.free_cluster(cluster);
                    }
                }
            }
            self.allocator.free_node(seg.span);
        }
    }

    fn clear_alias_run(&mut self, pid: Pid, start: VirtAddr, pages: usize) {
        for i in 0..pages {
            if let Ok(space) = self.space_mut(pid) {
                let released = space.clear_slot(start.add_pages(i));
                self.recycle(released);
            }
        }
    }

    fn attach_shared(
        &mut self,
        pid: Pid,
        start: VirtAddr,
        pages: usize,
        name: &str,
        rights: AccessType,
    ) -> VmResult<()> {
        let seg = &self.shared[name];
        if seg.pages != pages {
            return Err(VmError::SharedSizeMismatch(name.into()));
        }
        let compatible = seg.rights == rights
            || (seg.rights == AccessType::ReadWrite
                && matches!(rights, AccessType::Read | AccessType::Write));
        if !compatible {
            return Err(VmError::SharedRightsMismatch(name.into()));
        }

        let arc = seg.name.clone();
        let frames: Vec<_> = seg.table.iter().map(|d| d.frame).collect();
        // the registry sees the attachment before any alias exists, and a
        // mid-install failure removes both, never leaving live alias slots
        // the registry does not know about
        self.shared
            .get_mut(name)
            .expect("attach target vanished")
            .attached
            .insert(pid, start);
        if let Err(e) = self.install_aliases(pid, start, pages, &arc, rights, &frames) {
            self.clear_alias_run(pid, start, pages);
            self.shared
                .get_mut(name)
                .expect("attach target vanished")
                .attached
                .remove(&pid);
            return Err(e);
        }
        log::debug!("pid {pid} attached to shared segment {name:?} at {start:?}");
        Ok(())
    }

    fn install_aliases(
        &mut self,
        pid: Pid,
        start: VirtAddr,
        pages: usize,
        name: &Arc<str>,
        rights: AccessType,
        frames: &[super::address::FrameNum],
    ) -> VmResult<()> {
        for i in 0..pages {
            let desc = Descriptor {
                flags: DescFlags::VALID | DescFlags::LOADED | DescFlags::SHARED,
                rights,
                ordinal: i as u16,
                frame: frames[i],
                backing: Backing::Shared(SharedRef {
                    name: name.clone(),
                    page: i,
                }),
            };
            self.map_page(pid, start.add_pages(i), desc)?;
        }
        Ok(())
    }

    /// Detach `pid` from the named segment: clear its local alias slots and
    /// drop it from the attachment map. Canonical frames are untouched.
    pub fn disconnect_shared_segment(&mut self, pid: Pid, name: &str) -> VmResult<()> {
        let seg = self
            .shared
            .get(name)
            .ok_or_else(|| VmError::UnknownSharedSegment(name.into()))?;
        let Some(&start) = seg.attached.get(&pid) else {
            return Err(VmError::NotAttached(name.into()));
        };
        let pages = seg.pages;

        for i in 0..pages {
            let released = self.space_mut(pid)?.clear_slot(start.add_pages(i));
            self.recycle(released);
        }
        self.shared
            .get_mut(name)
            .expect("segment vanished during detach")
            .attached
            .remove(&pid);
        log::debug!("pid {pid} detached from shared segment {name:?}");
        Ok(())
    }

    /// Destroy the named segment: force-detach every attached process, then
    /// release the canonical table's kernel span, frames and swap clusters.
    pub fn delete_shared_segment(&mut self, name: &str) -> VmResult<()> {
        if !self.shared.contains_key(name) {
            return Err(VmError::UnknownSharedSegment(name.into()));
        }

        let pids: Vec<Pid> = self.shared[name].attached.keys().copied().collect();
        for pid in pids {
            if self.processes.contains_key(&pid) {
                self.disconnect_shared_segment(pid, name)?;
            } else {
                // stale attachment of an already-deleted process
                self.shared
                    .get_mut(name)
                    .expect("segment vanished")
                    .attached
                    .remove(&pid);
            }
        }

        let seg = self.shared.remove(name).expect("segment vanished");
        for desc in &seg.table {
            if desc.is_valid() {
                self.allocator.free_frame(desc.frame);
            }
            if desc.is_swapped() {
                if let Some(cluster) = desc.cluster() {
                    self.allocator.free_cluster(cluster);
                }
            }
        }
        self.allocator.free_node(seg.span);
        log::debug!("shared segment {name:?} destroyed");
        Ok(())
    }

    /// The shared segment `pid` has attached at `start`, if any.
    pub(crate) fn shared_attachment_at(&self, pid: Pid, start: VirtAddr) -> Option<Arc<str>> {
        self.shared.values().find_map(|seg| {
            (seg.attached.get(&pid) == Some(&start)).then(|| seg.name.clone())
        })
    }
}
