//! Fixed geometry of the simulated machine.

/// Size of one page / frame / disk cluster in bytes.
pub const PAGE_SIZE: usize = 1024;
/// Width of the in-page offset field of a virtual address.
pub const PAGE_OFFSET_BITS: usize = 10;

/// Entries in a level-1 page table.
pub const L1_ENTRIES: usize = 128;
/// Entries in a level-2 page table.
pub const L2_ENTRIES: usize = 128;
/// Shift of the level-1 index field within a virtual address.
pub const L1_SHIFT: usize = 17;
/// Shift of the level-2 index field within a virtual address.
pub const L2_SHIFT: usize = 10;
/// Mask for one table index field (7 bits).
pub const ENTRY_MASK: usize = 0x7F;

/// Last byte addressable in a virtual address space (24-bit addresses).
pub const VIRTUAL_MEMORY_LAST_ADDRESS: usize = 0xFF_FFFF;

// Accounting sizes for the kernel-pool allocator. Table nodes live on the
// Rust heap; these sizes charge them against the fixed kernel space.
pub const DESCRIPTOR_BYTES: usize = 16;
pub const L2_NODE_BYTES: usize = 8 + L2_ENTRIES * DESCRIPTOR_BYTES;
pub const L1_NODE_BYTES: usize = 8 + L1_ENTRIES * 8;

/// Reference bits are packed 8 per byte.
pub const REF_BITS_PER_BYTE: usize = 8;
