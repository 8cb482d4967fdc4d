//! The basic memory layout that the runtime assumes.

use static_assertions::const_assert;

/// The lower 12 bits of an address are the offset into its page frame.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The largest block order handed out by the buddy page allocator.
/// Orders `0..=MAX_ORDER` are valid, so the largest block is 8MiB.
pub const MAX_ORDER: usize = 11;

/// No slab may span more than one maximally-sized buddy block.
pub const MAX_SLAB_SIZE: usize = PAGE_SIZE << MAX_ORDER;

/// Smallest object and alignment the slab allocator hands out.
pub const MIN_SLAB_OBJECT: usize = 8;

/// The default size classes of the general-purpose allocator, ascending.
pub const GP_SIZE_CLASSES: [usize; 23] = [
    8, 16, 32, 64, 96, 128, 192, 256, 512,
    1 << 10, 1 << 11, 1 << 12, 1 << 13, 1 << 14, 1 << 15, 1 << 16,
    1 << 17, 1 << 18, 1 << 19, 1 << 20, 1 << 21, 1 << 22, 1 << 23,
];

/// Upper limit on the number of NUMA nodes the allocators track.
pub const MAX_NUMA_NODES: usize = 8;

/// The start of the kernel half of the virtual address space.
/// Actual value: 0xFFFF800000000000.
pub const KERNEL_VMEM_START: usize = 0xFFFF_8000_0000_0000;

/// Virtual memory at and above this address is reserved for the Ebb
/// translation region and is never handed out by the vmem allocator.
/// Actual value: 0xFFFFFFFF00000000.
pub const VMEM_START: usize = 0xFFFF_FFFF_0000_0000;

/// The size in pages of an event stack: 8MiB, mapped lazily on fault.
pub const STACK_PAGES: usize = 2048;

const_assert!(MAX_SLAB_SIZE == 1 << (PAGE_SHIFT + MAX_ORDER));
const_assert!(GP_SIZE_CLASSES[GP_SIZE_CLASSES.len() - 1] <= MAX_SLAB_SIZE);
const_assert!(KERNEL_VMEM_START % PAGE_SIZE == 0 && VMEM_START % PAGE_SIZE == 0);
