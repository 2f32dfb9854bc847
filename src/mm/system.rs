//! The system-wide manager: process lifecycle, segment operations, the
//! access state machine, demand faulting and clock eviction.
//!
//! All mutation funnels through `VmKernel`. Callers hold the single global
//! lock (see `crate::sync`) for the duration of each operation; the kernel
//! itself is lock-free and single-threaded by construction.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace, warn};

use super::address::{FrameNum, PhysAddr, VirtAddr};
use super::allocator::SpaceAllocator;
use super::memory::PhysMemory;
use super::page_table::{
    AccessType, AddressSpace, Backing, DescFlags, Descriptor, ReleasedTables, SharedRef,
};
use super::shared::SharedSegment;
use crate::config::{L1_NODE_BYTES, L2_NODE_BYTES, PAGE_SIZE, REF_BITS_PER_BYTE,
    VIRTUAL_MEMORY_LAST_ADDRESS};
use crate::error::{Pid, VmError, VmResult};
use crate::partition::Partition;

/// Where an effective descriptor lives: a process's private slot, or a page
/// of a shared segment's canonical table.
#[derive(Clone)]
pub(crate) enum SlotRef {
    Private(Pid, VirtAddr),
    Shared(SharedRef),
}

pub struct VmKernel {
    pub(crate) memory: PhysMemory,
    pub(crate) allocator: SpaceAllocator,
    pub(crate) partition: Box<dyn Partition + Send>,
    pub(crate) processes: HashMap<Pid, AddressSpace>,
    pub(crate) shared: HashMap<Arc<str>, SharedSegment>,
    /// One reference bit per frame, packed 8 per byte.
    ref_bits: Vec<u8>,
    /// Next frame the clock algorithm will consider.
    clock_hand: usize,
    next_pid: Pid,
}

impl VmKernel {
    /// Build a manager over `frames` physical page frames, `table_pages`
    /// pages of kernel space for page-table nodes, and a swap partition.
    pub fn new(frames: usize, table_pages: usize, partition: Box<dyn Partition + Send>) -> Self {
        let clusters = partition.cluster_count();
        Self {
            memory: PhysMemory::new(frames),
            allocator: SpaceAllocator::new(frames, table_pages * PAGE_SIZE, clusters),
            partition,
            processes: HashMap::new(),
            shared: HashMap::new(),
            ref_bits: vec![0; frames.div_ceil(REF_BITS_PER_BYTE)],
            clock_hand: 0,
            next_pid: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.memory.frame_count()
    }

    // ------------------------------------------------------------------
    // process lifecycle

    /// Register a new process with an empty address space.
    pub fn create_process(&mut self) -> Pid {
        self.next_pid += 1;
        let pid = self.next_pid;
        self.processes.insert(pid, AddressSpace::new());
        debug!("process {pid} created");
        pid
    }

    /// Tear down a process: delete its private segments, detach its shared
    /// ones, and unregister it.
    pub fn delete_process(&mut self, pid: Pid) -> VmResult<()> {
        let runs = self.space(pid)?.segments();
        for run in runs {
            if run.shared {
                match self.shared_attachment_at(pid, run.start) {
                    Some(name) => self.disconnect_shared_segment(pid, &name)?,
                    None => warn!("pid {pid}: shared run at {:?} has no attachment", run.start),
                }
            } else {
                self.delete_segment(pid, run.start)?;
            }
        }
        self.processes.remove(&pid);
        debug!("process {pid} deleted");
        Ok(())
    }

    /// Eagerly duplicate a process's address space into a new process.
    ///
    /// Segments are rediscovered from ordinal runs. Private segments get
    /// fresh frames and a full page-by-page copy of any content that was
    /// ever written or swapped; shared segments are re-attached at the same
    /// virtual address, so both processes keep aliasing the same frames.
    pub fn clone_process(&mut self, pid: Pid) -> VmResult<Pid> {
        let runs = self.space(pid)?.segments();
        let new_pid = self.create_process();
        debug!("cloning process {pid} into {new_pid} ({} segments)", runs.len());

        for run in runs {
            if run.shared {
                let Some(name) = self.shared_attachment_at(pid, run.start) else {
                    warn!("pid {pid}: shared run at {:?} has no attachment", run.start);
                    continue;
                };
                self.create_shared_segment(new_pid, run.start, run.pages, &name, run.rights)?;
            } else {
                self.create_segment(new_pid, run.start, run.pages, run.rights)?;
                for k in 0..run.pages {
                    self.clone_page(pid, new_pid, run.start.add_pages(k))?;
                }
            }
        }
        Ok(new_pid)
    }

    /// Copy one private page from `src_pid` to the same address in
    /// `dst_pid`, faulting pages back in as needed.
    fn clone_page(&mut self, src_pid: Pid, dst_pid: Pid, va: VirtAddr) -> VmResult<()> {
        // allocating frames for later pages may have evicted this one
        if !self.private_descriptor(dst_pid, va)?.is_valid() {
            self.page_fault(dst_pid, va)?;
        }
        let dst_frame = self.private_descriptor(dst_pid, va)?.frame;

        let src = self.private_descriptor(src_pid, va)?.clone();
        if src.is_swapped() && !src.is_valid() {
            // source lives on disk; restore it straight into the new frame
            let cluster = src.cluster().ok_or(VmError::DiskRead(0))?;
            if !self.partition.read_cluster(cluster, self.memory.frame_mut(dst_frame)) {
                return Err(VmError::DiskRead(cluster));
            }
            self.private_descriptor_mut(dst_pid, va)?.flags.insert(DescFlags::DIRTY);
        } else if src.is_valid() && (src.is_dirty() || src.is_swapped()) {
            self.memory.copy_frame(src.frame, dst_frame);
            self.private_descriptor_mut(dst_pid, va)?.flags.insert(DescFlags::DIRTY);
        }
        // a clean, never-swapped source holds zeros, as does the fresh frame
        Ok(())
    }

    // ------------------------------------------------------------------
    // segment operations

    /// Allocate a segment of `pages` pages starting at `start`.
    ///
    /// Every page gets a frame immediately (allocation is eager, residency
    /// is what faults manage later). On allocator exhaustion mid-loop the
    /// call fails but pages already granted stay granted.
    pub fn create_segment(
        &mut self,
        pid: Pid,
        start: VirtAddr,
        pages: usize,
        rights: AccessType,
    ) -> VmResult<()> {
        self.check_segment(pid, start, pages)?;
        for i in 0..pages {
            self.grant_page(pid, start.add_pages(i), i as u16, rights, false)?;
        }
        debug!("pid {pid}: created {pages}-page segment at {start:?}");
        Ok(())
    }

    /// Like `create_segment`, but fills each page from `content` and marks
    /// it dirty so eviction will persist it.
    pub fn load_segment(
        &mut self,
        pid: Pid,
        start: VirtAddr,
        pages: usize,
        rights: AccessType,
        content: &[u8],
    ) -> VmResult<()> {
        self.check_segment(pid, start, pages)?;
        if content.len() != pages * PAGE_SIZE {
            return Err(VmError::ContentSize);
        }
        for (i, chunk) in content.chunks(PAGE_SIZE).enumerate() {
            let frame = self.grant_page(pid, start.add_pages(i), i as u16, rights, true)?;
            self.memory.frame_mut(frame).copy_from_slice(chunk);
        }
        debug!("pid {pid}: loaded {pages}-page segment at {start:?}");
        Ok(())
    }

    /// Allocate one frame and install one fresh descriptor.
    fn grant_page(
        &mut self,
        pid: Pid,
        va: VirtAddr,
        ordinal: u16,
        rights: AccessType,
        dirty: bool,
    ) -> VmResult<FrameNum> {
        let frame = self.alloc_frame()?;
        let mut flags = DescFlags::VALID | DescFlags::LOADED;
        if dirty {
            flags |= DescFlags::DIRTY;
        }
        let desc = Descriptor {
            flags,
            rights,
            ordinal,
            frame,
            backing: Backing::None,
        };
        if let Err(e) = self.map_page(pid, va, desc) {
            self.allocator.free_frame(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Delete the private segment whose first page is at `start`.
    ///
    /// Walks ascending ordinals while slots stay loaded, releasing frames
    /// of resident pages and clusters of ever-swapped ones, and freeing
    /// table nodes as they empty.
    pub fn delete_segment(&mut self, pid: Pid, start: VirtAddr) -> VmResult<()> {
        if !start.aligned() {
            return Err(VmError::Misaligned(start));
        }
        {
            let space = self.space(pid)?;
            let desc = space
                .descriptor(start)
                .filter(|d| d.is_loaded())
                .ok_or(VmError::NotAllocated(start))?;
            if desc.ordinal != 0 {
                return Err(VmError::NotSegmentStart(start));
            }
            if desc.is_shared() {
                return Err(VmError::DeleteShared(start));
            }
        }

        let mut pages = 0usize;
        loop {
            let va = start.add_pages(pages);
            let desc = match self.space(pid)?.descriptor(va) {
                Some(d) if d.is_loaded() && d.ordinal as usize == pages => d.clone(),
                _ => break,
            };

            if desc.is_valid() {
                self.allocator.free_frame(desc.frame);
            }
            if desc.is_swapped() {
                if let Some(cluster) = desc.cluster() {
                    self.allocator.free_cluster(cluster);
                }
            }
            let released = self.space_mut(pid)?.clear_slot(va);
            self.recycle(released);
            pages += 1;
        }

        debug!("pid {pid}: deleted {pages}-page segment at {start:?}");
        Ok(())
    }

    // ------------------------------------------------------------------
    // access and fault handling

    /// The access-control state machine.
    ///
    /// Recoverable outcomes surface as `VmError::PageFault`; everything
    /// else is a per-call trap. A successful WRITE marks the effective
    /// descriptor dirty, and every success sets the frame's reference bit,
    /// giving the resident page a second chance at the clock.
    pub fn access(&mut self, pid: Pid, va: VirtAddr, requested: AccessType) -> VmResult<()> {
        let space = self
            .processes
            .get(&pid)
            .ok_or(VmError::UnknownProcess(pid))?;

        // missing table levels are a recoverable condition
        let Some(desc) = space.descriptor(va) else {
            return Err(VmError::PageFault(va));
        };
        if !desc.is_loaded() {
            return Err(VmError::NotAllocated(va));
        }

        // an alias checks the rights it attached with, not the canonical ones
        let granted = desc.rights;
        let slot = match desc.shared_ref() {
            Some(r) => SlotRef::Shared(r.clone()),
            None => SlotRef::Private(pid, va),
        };
        let eff = self.effective(&slot)?;
        if !eff.is_valid() {
            trace!("pid {pid}: page fault on {va:?}");
            return Err(VmError::PageFault(va));
        }

        let frame = eff.frame;
        if !granted.grants(requested) {
            return Err(VmError::Permission { requested, granted });
        }
        if requested == AccessType::Write {
            self.effective_mut(&slot)?.flags.insert(DescFlags::DIRTY);
        }
        self.set_ref_bit(frame);
        Ok(())
    }

    /// Bring the page at `va` into memory.
    ///
    /// A no-op when the page is already resident. Otherwise allocates a
    /// frame (evicting if necessary) and restores the page's last-swapped
    /// contents when it has a cluster; a page never written comes back
    /// zeroed.
    pub fn page_fault(&mut self, pid: Pid, va: VirtAddr) -> VmResult<()> {
        let slot = self.resolve(pid, va)?;
        if self.effective(&slot)?.is_valid() {
            return Ok(());
        }

        let frame = self.alloc_frame()?;
        let eff = self.effective(&slot)?;
        if eff.is_swapped() {
            let cluster = eff.cluster().ok_or(VmError::DiskRead(0))?;
            trace!("pid {pid}: reading {va:?} back from cluster {cluster}");
            if !self.partition.read_cluster(cluster, self.memory.frame_mut(frame)) {
                self.allocator.free_frame(frame);
                return Err(VmError::DiskRead(cluster));
            }
        }

        let desc = self.effective_mut(&slot)?;
        desc.frame = frame;
        desc.flags.insert(DescFlags::VALID);
        desc.flags.remove(DescFlags::DIRTY);
        Ok(())
    }

    /// Resolve `va` to a physical address, faulting the page in first when
    /// it is not resident.
    ///
    /// # Panics
    /// Panics if `pid` is unknown or `va` was never allocated to the
    /// process. There is no safe address to return for an unmapped page, so
    /// this is a caller programming error, not a reportable status.
    pub fn physical_address(&mut self, pid: Pid, va: VirtAddr) -> VmResult<PhysAddr> {
        let Some(space) = self.processes.get(&pid) else {
            panic!("physical_address: no process with id {pid}");
        };
        let mapped = space.descriptor(va).is_some_and(Descriptor::is_loaded);
        if !mapped {
            panic!("physical_address: {va:?} is not mapped into process {pid}");
        }

        let slot = self.resolve(pid, va)?;
        if !self.effective(&slot)?.is_valid() {
            self.page_fault(pid, va)?;
        }
        let frame = self.effective(&slot)?.frame;
        Ok(PhysAddr(frame.base().bits() | va.page_offset()))
    }

    // ------------------------------------------------------------------
    // physical memory windows (the simulated RAM)

    /// Read simulated RAM at a resolved physical address.
    pub fn read_physical(&self, at: PhysAddr, buf: &mut [u8]) {
        self.memory.read(at, buf);
    }

    /// Write simulated RAM at a resolved physical address.
    pub fn write_physical(&mut self, at: PhysAddr, buf: &[u8]) {
        self.memory.write(at, buf);
    }

    // ------------------------------------------------------------------
    // frame supply and the clock

    /// Take a free frame, manufacturing one by eviction when the pool is
    /// exhausted. The returned frame is zeroed.
    pub(crate) fn alloc_frame(&mut self) -> VmResult<FrameNum> {
        let frame = match self.allocator.alloc_frame() {
            Some(frame) => frame,
            // the clock has nothing to scan in a zero-frame system
            None if self.memory.frame_count() == 0 => return Err(VmError::OutOfFrames),
            None => self.evict()?,
        };
        self.memory.zero(frame);
        Ok(frame)
    }

    /// Second-chance eviction: pick a victim frame, write it out if dirty,
    /// invalidate its owner's descriptor, and return the frame.
    fn evict(&mut self) -> VmResult<FrameNum> {
        let frames = self.memory.frame_count();

        // frames with their reference bit set get a second chance
        while self.ref_bit(FrameNum(self.clock_hand)) {
            self.clear_ref_bit(FrameNum(self.clock_hand));
            self.clock_hand = (self.clock_hand + 1) % frames;
        }
        let victim = FrameNum(self.clock_hand);
        self.clock_hand = (self.clock_hand + 1) % frames;

        let Some(slot) = self.find_owner(victim) else {
            // only reachable if a frame leaked out of every table
            warn!("clock victim {victim:?} has no owning descriptor");
            return Ok(victim);
        };

        let eff = self.effective(&slot)?.clone();
        if eff.is_dirty() {
            let (cluster, fresh) = match eff.cluster() {
                Some(c) if eff.is_swapped() => (c, false),
                _ => (
                    self.allocator.alloc_cluster().ok_or(VmError::OutOfClusters)?,
                    true,
                ),
            };
            trace!("evicting dirty {victim:?} to cluster {cluster}");
            if !self.partition.write_cluster(cluster, self.memory.frame(victim)) {
                if fresh {
                    self.allocator.free_cluster(cluster);
                }
                return Err(VmError::DiskWrite(cluster));
            }
            let desc = self.effective_mut(&slot)?;
            desc.backing = Backing::Cluster(cluster);
            desc.flags.insert(DescFlags::SWAPPED);
        } else {
            trace!("evicting clean {victim:?}");
        }

        let desc = self.effective_mut(&slot)?;
        desc.flags.remove(DescFlags::VALID | DescFlags::DIRTY);
        Ok(victim)
    }

    /// Locate the descriptor currently owning `frame`: canonical shared
    /// tables first, then every process's private slots.
    fn find_owner(&self, frame: FrameNum) -> Option<SlotRef> {
        for seg in self.shared.values() {
            for (page, desc) in seg.table.iter().enumerate() {
                if desc.is_valid() && desc.frame == frame {
                    return Some(SlotRef::Shared(SharedRef {
                        name: seg.name.clone(),
                        page,
                    }));
                }
            }
        }
        for (&pid, space) in &self.processes {
            if let Some(va) = space.owner_of(frame) {
                return Some(SlotRef::Private(pid, va));
            }
        }
        None
    }

    fn ref_bit(&self, frame: FrameNum) -> bool {
        self.ref_bits[frame.0 / REF_BITS_PER_BYTE] & (1 << (frame.0 % REF_BITS_PER_BYTE)) != 0
    }

    fn set_ref_bit(&mut self, frame: FrameNum) {
        self.ref_bits[frame.0 / REF_BITS_PER_BYTE] |= 1 << (frame.0 % REF_BITS_PER_BYTE);
    }

    fn clear_ref_bit(&mut self, frame: FrameNum) {
        self.ref_bits[frame.0 / REF_BITS_PER_BYTE] &= !(1 << (frame.0 % REF_BITS_PER_BYTE));
    }

    // ------------------------------------------------------------------
    // table plumbing

    pub(crate) fn space(&self, pid: Pid) -> VmResult<&AddressSpace> {
        self.processes.get(&pid).ok_or(VmError::UnknownProcess(pid))
    }

    pub(crate) fn space_mut(&mut self, pid: Pid) -> VmResult<&mut AddressSpace> {
        self.processes
            .get_mut(&pid)
            .ok_or(VmError::UnknownProcess(pid))
    }

    fn private_descriptor(&self, pid: Pid, va: VirtAddr) -> VmResult<&Descriptor> {
        self.space(pid)?
            .descriptor(va)
            .filter(|d| d.is_loaded())
            .ok_or(VmError::NotAllocated(va))
    }

    fn private_descriptor_mut(&mut self, pid: Pid, va: VirtAddr) -> VmResult<&mut Descriptor> {
        self.space_mut(pid)?
            .descriptor_mut(va)
            .filter(|d| d.is_loaded())
            .ok_or(VmError::NotAllocated(va))
    }

    /// The effective slot for `va`: the local slot itself, or the canonical
    /// shared descriptor the local alias defers to.
    fn resolve(&self, pid: Pid, va: VirtAddr) -> VmResult<SlotRef> {
        let desc = self.private_descriptor(pid, va)?;
        Ok(match desc.shared_ref() {
            Some(r) => SlotRef::Shared(r.clone()),
            None => SlotRef::Private(pid, va),
        })
    }

    fn effective(&self, slot: &SlotRef) -> VmResult<&Descriptor> {
        match slot {
            SlotRef::Private(pid, va) => self.private_descriptor(*pid, *va),
            SlotRef::Shared(r) => self
                .shared
                .get(&*r.name)
                .and_then(|seg| seg.table.get(r.page))
                .ok_or_else(|| VmError::UnknownSharedSegment(r.name.to_string())),
        }
    }

    fn effective_mut(&mut self, slot: &SlotRef) -> VmResult<&mut Descriptor> {
        match slot {
            SlotRef::Private(pid, va) => self.private_descriptor_mut(*pid, *va),
            SlotRef::Shared(r) => self
                .shared
                .get_mut(&*r.name)
                .and_then(|seg| seg.table.get_mut(r.page))
                .ok_or_else(|| VmError::UnknownSharedSegment(r.name.to_string())),
        }
    }

    /// Pure validation run before any allocation: alignment, ceiling,
    /// nonzero size, no overlap with loaded slots.
    pub(crate) fn check_segment(&self, pid: Pid, start: VirtAddr, pages: usize) -> VmResult<()> {
        let space = self.space(pid)?;
        if !start.aligned() {
            return Err(VmError::Misaligned(start));
        }
        if pages == 0 {
            return Err(VmError::ZeroSize);
        }
        if start.bits() + pages * PAGE_SIZE - 1 > VIRTUAL_MEMORY_LAST_ADDRESS {
            return Err(VmError::OutOfRange(start));
        }
        for i in 0..pages {
            let va = start.add_pages(i);
            if space.is_allocated(va) {
                return Err(VmError::Overlap(va));
            }
        }
        Ok(())
    }

    /// Install `desc` at `va`, creating table nodes (charged to the kernel
    /// pool) as needed.
    pub(crate) fn map_page(&mut self, pid: Pid, va: VirtAddr, desc: Descriptor) -> VmResult<()> {
        if !self.space(pid)?.has_root() {
            let span = self
                .allocator
                .alloc_node(L1_NODE_BYTES)
                .ok_or(VmError::TableSpaceExhausted)?;
            self.space_mut(pid)?.install_root(span);
        }
        if !self.space(pid)?.has_table(va) {
            let span = self
                .allocator
                .alloc_node(L2_NODE_BYTES)
                .ok_or(VmError::TableSpaceExhausted)?;
            self.space_mut(pid)?.install_table(va, span);
        }
        self.space_mut(pid)?.map_slot(va, desc);
        Ok(())
    }

    /// Return table-node spans freed by a slot clear to the kernel pool.
    pub(crate) fn recycle(&mut self, released: ReleasedTables) {
        if let Some(span) = released.table {
            self.allocator.free_node(span);
        }
        if let Some(span) = released.root {
            self.allocator.free_node(span);
        }
    }
}
