use std::sync::Arc;

use bitflags::bitflags;

use super::address::{FrameNum, VirtAddr};
use super::allocator::KernelSpan;
use crate::config::{L1_ENTRIES, L2_ENTRIES};

bitflags! {
    /// Per-page descriptor flags.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct DescFlags: u8 {
        /// Resident in a physical frame.
        const VALID = 1 << 0;
        /// Modified since it was last loaded or swapped in.
        const DIRTY = 1 << 1;
        /// A disk cluster has been assigned at least once.
        const SWAPPED = 1 << 2;
        /// The slot belongs to an allocated segment.
        const LOADED = 1 << 3;
        /// The slot is an alias of a canonical shared descriptor.
        const SHARED = 1 << 4;
    }
}

/// Access rights of a page, and the type of a requested access.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AccessType {
    Read,
    Write,
    ReadWrite,
    Execute,
}

impl AccessType {
    /// Whether a page granted `self` permits a `requested` access.
    ///
    /// READ_WRITE covers READ and WRITE; everything else, EXECUTE included,
    /// must match exactly.
    pub fn grants(self, requested: AccessType) -> bool {
        self == requested
            || (self == AccessType::ReadWrite
                && matches!(requested, AccessType::Read | AccessType::Write))
    }
}

/// Names one page of a shared segment's canonical descriptor table.
///
/// Aliasing slots resolve through this by registry lookup on every use; the
/// local slot itself is never overwritten with canonical state, so the alias
/// cannot fall out of sync.
#[derive(Clone, Debug)]
pub struct SharedRef {
    pub name: Arc<str>,
    pub page: usize,
}

/// What backs a page when it is not resident.
#[derive(Clone, Debug, Default)]
pub enum Backing {
    /// Never swapped and not shared.
    #[default]
    None,
    /// The disk cluster holding (or reserved for) the swapped page.
    Cluster(crate::error::ClusterNo),
    /// Alias of a canonical shared descriptor.
    Shared(SharedRef),
}

/// One virtual page slot.
///
/// When LOADED is clear every other field is meaningless. When VALID is set
/// `frame` names a physical frame currently owned by this page.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub flags: DescFlags,
    pub rights: AccessType,
    /// 0-based position of this page within its segment; segment boundaries
    /// are rediscovered by scanning ordinals, there is no segment table.
    pub ordinal: u16,
    pub frame: FrameNum,
    pub backing: Backing,
}

impl Descriptor {
    pub fn empty() -> Self {
        Self {
            flags: DescFlags::empty(),
            rights: AccessType::Read,
            ordinal: 0,
            frame: FrameNum(0),
            backing: Backing::None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.flags.contains(DescFlags::LOADED)
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(DescFlags::VALID)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(DescFlags::DIRTY)
    }

    pub fn is_swapped(&self) -> bool {
        self.flags.contains(DescFlags::SWAPPED)
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(DescFlags::SHARED)
    }

    /// The assigned swap cluster, if one was ever assigned.
    pub fn cluster(&self) -> Option<crate::error::ClusterNo> {
        match self.backing {
            Backing::Cluster(c) => Some(c),
            _ => None,
        }
    }

    pub fn shared_ref(&self) -> Option<&SharedRef> {
        match &self.backing {
            Backing::Shared(r) => Some(r),
            _ => None,
        }
    }
}

/// A level-2 page table node: 128 descriptors plus a used-count.
pub struct Level2Table {
    entries: Box<[Descriptor; L2_ENTRIES]>,
    used: usize,
    span: KernelSpan,
}

impl Level2Table {
    fn new(span: KernelSpan) -> Self {
        Self {
            entries: Box::new(std::array::from_fn(|_| Descriptor::empty())),
            used: 0,
            span,
        }
    }
}

/// A level-1 page table node: 128 level-2 references plus a used-count.
struct Level1Table {
    slots: Box<[Option<Box<Level2Table>>; L1_ENTRIES]>,
    used: usize,
    span: KernelSpan,
}

impl Level1Table {
    fn new(span: KernelSpan) -> Self {
        Self {
            slots: Box::new([const { None }; L1_ENTRIES]),
            used: 0,
            span,
        }
    }
}

/// Kernel spans handed back when `clear_slot` empties a table node.
#[derive(Default)]
pub struct ReleasedTables {
    pub table: Option<KernelSpan>,
    pub root: Option<KernelSpan>,
}

/// One contiguous run of loaded pages sharing rights, rediscovered from
/// ordinals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRun {
    pub start: VirtAddr,
    pub pages: usize,
    pub rights: AccessType,
    pub shared: bool,
}

/// A per-process two-level page table.
///
/// A process with no allocated segments has no level-1 table at all. Table
/// node storage is charged to the kernel pool through `KernelSpan`s; the
/// caller allocates spans before `install_*` and recycles the spans returned
/// by `clear_slot`.
pub struct AddressSpace {
    root: Option<Level1Table>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn has_table(&self, va: VirtAddr) -> bool {
        let [e1, _] = va.indexes();
        self.root
            .as_ref()
            .is_some_and(|root| root.slots[e1].is_some())
    }

    /// Install a freshly charged level-1 table. The space must be empty.
    pub fn install_root(&mut self, span: KernelSpan) {
        assert!(self.root.is_none(), "level-1 table already present");
        self.root = Some(Level1Table::new(span));
    }

    /// Install a level-2 table for the slot covering `va`.
    pub fn install_table(&mut self, va: VirtAddr, span: KernelSpan) {
        let [e1, _] = va.indexes();
        let root = self.root.as_mut().expect("no level-1 table");
        assert!(root.slots[e1].is_none(), "level-2 table already present");
        root.slots[e1] = Some(Box::new(Level2Table::new(span)));
        root.used += 1;
    }

    /// The descriptor for `va`, if both table levels exist.
    pub fn descriptor(&self, va: VirtAddr) -> Option<&Descriptor> {
        let [e1, e2] = va.indexes();
        let table = self.root.as_ref()?.slots[e1].as_ref()?;
        Some(&table.entries[e2])
    }

    pub fn descriptor_mut(&mut self, va: VirtAddr) -> Option<&mut Descriptor> {
        let [e1, e2] = va.indexes();
        let table = self.root.as_mut()?.slots[e1].as_mut()?;
        Some(&mut table.entries[e2])
    }

    /// Whether `va` lies in an allocated segment.
    pub fn is_allocated(&self, va: VirtAddr) -> bool {
        self.descriptor(va).is_some_and(Descriptor::is_loaded)
    }

    /// Fill the slot for `va`. Both table levels must already exist and the
    /// slot must be free.
    pub fn map_slot(&mut self, va: VirtAddr, desc: Descriptor) {
        let [e1, e2] = va.indexes();
        let table = self.root.as_mut().expect("no level-1 table").slots[e1]
            .as_mut()
            .expect("no level-2 table");
        assert!(!table.entries[e2].is_loaded(), "slot {va:?} already mapped");
        table.entries[e2] = desc;
        table.used += 1;
    }

    /// Clear the slot for `va` and release table nodes that become empty.
    ///
    /// Returns the kernel spans of any freed nodes so the caller can return
    /// them to the pool allocator.
    pub fn clear_slot(&mut self, va: VirtAddr) -> ReleasedTables {
        let [e1, e2] = va.indexes();
        let mut released = ReleasedTables::default();

        let Some(root) = self.root.as_mut() else {
            return released;
        };
        let Some(table) = root.slots[e1].as_mut() else {
            return released;
        };
        if !table.entries[e2].is_loaded() {
            return released;
        }

        table.entries[e2] = Descriptor::empty();
        table.used -= 1;
        if table.used == 0 {
            released.table = Some(table.span);
            root.slots[e1] = None;
            root.used -= 1;
        }
        if root.used == 0 {
            released.root = Some(root.span);
            self.root = None;
        }
        released
    }

    /// The private slot owning `frame`, if any. Shared aliases are skipped;
    /// their canonical descriptor is scanned through the registry instead.
    pub fn owner_of(&self, frame: FrameNum) -> Option<VirtAddr> {
        let root = self.root.as_ref()?;
        for (e1, slot) in root.slots.iter().enumerate() {
            let Some(table) = slot else { continue };
            for (e2, desc) in table.entries.iter().enumerate() {
                if desc.is_loaded() && !desc.is_shared() && desc.is_valid() && desc.frame == frame
                {
                    return Some(VirtAddr::from_indexes(e1, e2));
                }
            }
        }
        None
    }

    /// Rediscover every segment by walking ordinal runs in address order.
    pub fn segments(&self) -> Vec<SegmentRun> {
        let mut runs = Vec::new();
        let Some(root) = self.root.as_ref() else {
            return runs;
        };

        let mut current: Option<SegmentRun> = None;
        for e1 in 0..L1_ENTRIES {
            let Some(table) = root.slots[e1].as_ref() else {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
                continue;
            };
            let mut e2 = 0;
            while e2 < L2_ENTRIES {
                let desc = &table.entries[e2];
                let len = current.as_ref().map_or(0, |run| run.pages);
                if desc.is_loaded() && desc.ordinal as usize == len {
                    match current.as_mut() {
                        Some(run) => run.pages += 1,
                        None => {
                            current = Some(SegmentRun {
                                start: VirtAddr::from_indexes(e1, e2),
                                pages: 1,
                                rights: desc.rights,
                                shared: desc.is_shared(),
                            });
                        }
                    }
                } else if let Some(run) = current.take() {
                    runs.push(run);
                    // re-examine: this slot may start the next segment
                    continue;
                }
                e2 += 1;
            }
        }
        if let Some(run) = current {
            runs.push(run);
        }
        runs
    }
}
