use core::fmt::{self, Debug, Formatter};

use crate::config::{ENTRY_MASK, L1_SHIFT, L2_SHIFT, PAGE_OFFSET_BITS, PAGE_SIZE};

/// Definition

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct VirtAddr(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct PhysAddr(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct FrameNum(pub usize);

/// Debugging
impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}(VA)", self.0))
    }
}
impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}(PA)", self.0))
    }
}
impl Debug for FrameNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}(FRAME)", self.0))
    }
}

impl From<usize> for VirtAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<usize> for PhysAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl VirtAddr {
    pub fn bits(&self) -> usize {
        self.0
    }

    /// Returns the offset within the page for this virtual address.
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    pub fn aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// Returns the two page table indexes for this address.
    ///
    /// The result is `[level-1 index, level-2 index]`.
    pub fn indexes(&self) -> [usize; 2] {
        [
            (self.0 >> L1_SHIFT) & ENTRY_MASK,
            (self.0 >> L2_SHIFT) & ENTRY_MASK,
        ]
    }

    /// Returns the address `pages` pages past this one.
    pub fn add_pages(&self, pages: usize) -> VirtAddr {
        VirtAddr(self.0 + pages * PAGE_SIZE)
    }

    /// Reassembles the start address of the page selected by two table indexes.
    pub fn from_indexes(e1: usize, e2: usize) -> VirtAddr {
        VirtAddr((e1 << L1_SHIFT) | (e2 << L2_SHIFT))
    }
}

impl PhysAddr {
    pub fn bits(&self) -> usize {
        self.0
    }

    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    pub fn aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// Returns the frame containing this address.
    pub fn frame(&self) -> FrameNum {
        FrameNum(self.0 >> PAGE_OFFSET_BITS)
    }
}

impl FrameNum {
    pub fn bits(&self) -> usize {
        self.0
    }

    /// Returns the starting physical address of this frame.
    pub fn base(&self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_OFFSET_BITS)
    }
}
