//! The general-purpose allocator.
//!
//! Requests are served by one [`SlabAllocatorRoot`] per size class, picking
//! the smallest class that fits. Each class keeps per-core and per-node
//! caches, so the general-purpose allocator itself holds no lock.
//!
//! When the requested node is out of memory the other nodes are tried in
//! round-robin order starting after it. A free finds its size class through
//! the memory map tag of the object's slab.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
mod test;

use alloc::{sync::Arc, vec::Vec};
use kernel_config::memory::{GP_SIZE_CLASSES, MAX_SLAB_SIZE};
use memory_structs::{Nid, PhysicalAddress};
use page_allocator::PageAllocator;
use slabmalloc::SlabAllocatorRoot;

/// Possible allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// The request is larger than the largest size class.
    TooLarge { size: usize },
    /// Every node is out of memory for this size class.
    OutOfMemory { size: usize, nid: Nid },
}
impl From<AllocationError> for &'static str {
    fn from(alloc_err: AllocationError) -> &'static str {
        match alloc_err {
            AllocationError::TooLarge { .. } => "gp allocator: request exceeds the largest size class",
            AllocationError::OutOfMemory { .. } => "gp allocator: out of memory on every node",
        }
    }
}

pub struct GpAllocator {
    /// Ascending by object size; a class's index is its slab root id.
    classes: Vec<SlabAllocatorRoot>,
    num_nodes: usize,
}

impl GpAllocator {
    /// Creates an allocator with the given size classes, which must be
    /// strictly ascending and no larger than [`MAX_SLAB_SIZE`].
    pub fn new(
        sizes: &[usize],
        page_allocator: Arc<PageAllocator>,
        cpu_nodes: &[Nid],
    ) -> Result<GpAllocator, &'static str> {
        if sizes.is_empty() {
            return Err("GpAllocator::new(): no size classes");
        }
        if sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err("GpAllocator::new(): size classes must be strictly ascending");
        }
        if sizes.iter().any(|&s| s == 0 || s > MAX_SLAB_SIZE) {
            return Err("GpAllocator::new(): size class exceeds the largest slab");
        }
        let num_nodes = page_allocator.num_nodes();
        let classes = sizes.iter().enumerate()
            .map(|(id, &size)| SlabAllocatorRoot::new(id, size, 0, page_allocator.clone(), cpu_nodes))
            .collect::<Result<Vec<_>, _>>()?;
        info!("gp allocator: {} size classes up to {} bytes", classes.len(), sizes[sizes.len() - 1]);
        Ok(GpAllocator { classes, num_nodes })
    }

    /// Creates an allocator with the default size classes, 8 bytes to 8MiB.
    pub fn with_default_classes(page_allocator: Arc<PageAllocator>, cpu_nodes: &[Nid]) -> Result<GpAllocator, &'static str> {
        GpAllocator::new(&GP_SIZE_CLASSES, page_allocator, cpu_nodes)
    }

    /// Returns the index of the smallest size class holding `size` bytes.
    pub fn size_class(&self, size: usize) -> Result<usize, AllocationError> {
        self.classes.iter()
            .position(|class| class.size() >= size)
            .ok_or(AllocationError::TooLarge { size })
    }

    /// Returns the object size of size class `index`.
    pub fn class_size(&self, index: usize) -> Option<usize> {
        self.classes.get(index).map(|c| c.size())
    }

    /// Allocates `size` bytes, preferably on node `nid`.
    ///
    /// [`Nid::ANY`] prefers the current core's node.
    pub fn try_alloc(&self, size: usize, nid: Nid) -> Result<PhysicalAddress, AllocationError> {
        let class = &self.classes[self.size_class(size)?];
        let first = if nid.is_any() { cpu::current_node() } else { nid };
        for i in 0..self.num_nodes {
            let node = Nid::new(((first.index() + i) % self.num_nodes) as u8);
            if let Some(obj) = class.alloc_on(node) {
                if i > 0 {
                    debug!("gp allocator: {} bytes for {} served by {}", size, first, node);
                }
                return Ok(obj);
            }
        }
        Err(AllocationError::OutOfMemory { size, nid: first })
    }

    /// Allocates `size` bytes, preferably on node `nid`.
    ///
    /// Failure is fatal, like running out of memory in the kernel heap.
    pub fn alloc(&self, size: usize, nid: Nid) -> PhysicalAddress {
        match self.try_alloc(size, nid) {
            Ok(obj) => obj,
            Err(e) => {
                error!("gp allocator: failed to allocate {} bytes on {}: {:?}", size, nid, e);
                panic!("{}", <&'static str>::from(e));
            }
        }
    }

    /// Frees an object, which may have been allocated on any core.
    pub fn free(&self, obj: PhysicalAddress) -> Result<(), &'static str> {
        let class = self.class_of(obj)?;
        class.free(obj)
    }

    /// Returns the usable size of the object at `obj`, which must be allocated.
    pub fn usable_size(&self, obj: PhysicalAddress) -> Result<usize, &'static str> {
        let class = self.class_of(obj)?;
        if !class.is_live(obj) {
            return Err("gp allocator: address is not an allocated object");
        }
        Ok(class.size())
    }

    /// Number of frames held in slabs across all size classes.
    pub fn slab_pages(&self) -> usize {
        self.classes.iter().map(|class| class.slab_count() << class.order()).sum()
    }

    /// Number of objects currently allocated across all size classes.
    pub fn live_count(&self) -> usize {
        self.classes.iter().map(|class| class.live_count()).sum()
    }

    fn class_of(&self, obj: PhysicalAddress) -> Result<&SlabAllocatorRoot, &'static str> {
        let mem_map = self.classes[0].mem_map();
        let tag = mem_map.addr_to_page(obj)
            .and_then(|page| page.slab())
            .ok_or("gp allocator: freed address was not allocated here")?;
        self.classes.get(tag.root).ok_or("gp allocator: freed object has an unknown size class")
    }

    /// Returns every cached free object and empty slab to the page allocator.
    pub fn drain(&self) {
        for class in self.classes.iter() {
            class.drain();
        }
    }
}
