//! Memory management: typed addresses, the physical frame arena, free-space
//! allocators, two-level page tables, shared segments and the kernel that
//! ties them together.

pub mod address;
pub mod allocator;
pub mod memory;
pub mod page_table;
pub mod shared;
pub mod system;
