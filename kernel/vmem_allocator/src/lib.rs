//! The virtual memory allocator.
//!
//! The kernel half of the address space, from [`KERNEL_VMEM_START`] up to
//! [`VMEM_START`], is divided into regions. A region is either free or
//! allocated, and an allocated region may carry a [`PageFaultHandler`] that
//! maps its pages on demand. Allocations carve from the high end of the
//! highest free region that is large enough.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

mod page_table;
mod stack;

pub use page_table::PageTable;
pub use stack::StackFaultHandler;

use alloc::{collections::BTreeMap, sync::Arc};
use kernel_config::memory::{KERNEL_VMEM_START, VMEM_START};
use memory_structs::{Page, PageRange, VirtualAddress};
use spin::Mutex;

/// Resolves page faults within an allocated region.
pub trait PageFaultHandler: Send + Sync {
    fn handle_fault(&self, addr: VirtualAddress) -> Result<(), &'static str>;
}

enum RegionState {
    Free,
    Allocated(Option<Arc<dyn PageFaultHandler>>),
}

struct Region {
    end: Page,
    state: RegionState,
}

pub struct VMemAllocator {
    /// Keyed by start page; iterated from the highest start down.
    regions: Mutex<BTreeMap<Page, Region>>,
}

impl Default for VMemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl VMemAllocator {
    pub fn new() -> VMemAllocator {
        let start = Page::round_up(VirtualAddress::new(KERNEL_VMEM_START));
        let end = Page::containing_address(VirtualAddress::new(VMEM_START));
        let mut regions = BTreeMap::new();
        regions.insert(start, Region { end, state: RegionState::Free });
        VMemAllocator { regions: Mutex::new(regions) }
    }

    /// Allocates `npages` contiguous virtual pages whose faults go to `handler`.
    pub fn try_alloc(
        &self,
        npages: usize,
        handler: Option<Arc<dyn PageFaultHandler>>,
    ) -> Result<PageRange, &'static str> {
        let mut regions = self.regions.lock();
        let found = regions.iter_mut().rev().find(|(start, region)| {
            matches!(region.state, RegionState::Free) && region.end - **start >= npages
        });
        let (start, region) = found.ok_or("VMemAllocator: out of virtual memory")?;
        let start = *start;
        let ret = region.end - npages;
        if ret == start {
            region.state = RegionState::Allocated(handler);
        } else {
            let end = region.end;
            region.end = ret;
            regions.insert(ret, Region { end, state: RegionState::Allocated(handler) });
        }
        trace!("VMemAllocator: allocated {} pages at {:?}", npages, ret.start_address());
        Ok(PageRange::with_len(ret, npages))
    }

    /// Allocates `npages` contiguous virtual pages whose faults go to `handler`.
    ///
    /// Running out of virtual address space is fatal.
    pub fn alloc(&self, npages: usize, handler: Option<Arc<dyn PageFaultHandler>>) -> PageRange {
        match self.try_alloc(npages, handler) {
            Ok(range) => range,
            Err(e) => {
                error!("VMemAllocator: unable to allocate {} virtual pages", npages);
                panic!("{}", e);
            }
        }
    }

    /// Runs the fault handler of the region containing `addr`.
    pub fn try_handle_page_fault(&self, addr: VirtualAddress) -> Result<(), &'static str> {
        let page = Page::containing_address(addr);
        let handler = {
            let regions = self.regions.lock();
            let (_, region) = regions.range(..=page).next_back()
                .filter(|(_, region)| page < region.end)
                .ok_or("could not find region for faulting address")?;
            match &region.state {
                RegionState::Free => return Err("fault on a free region"),
                RegionState::Allocated(None) => return Err("fault on a region without a fault handler"),
                RegionState::Allocated(Some(handler)) => handler.clone(),
            }
        };
        handler.handle_fault(addr)
    }

    /// Runs the fault handler of the region containing `addr`.
    ///
    /// A fault that no handler can resolve is fatal.
    pub fn handle_page_fault(&self, addr: VirtualAddress) {
        if let Err(e) = self.try_handle_page_fault(addr) {
            error!("unhandled page fault at {:?}: {}", addr, e);
            panic!("unhandled page fault at {:?}: {}", addr, e);
        }
    }

    /// Returns the regions as `(pages, allocated)` from the highest address down.
    pub fn regions(&self) -> alloc::vec::Vec<(PageRange, bool)> {
        self.regions.lock().iter().rev()
            .map(|(start, r)| (PageRange::new(*start, r.end), matches!(r.state, RegionState::Allocated(_))))
            .collect()
    }
}
