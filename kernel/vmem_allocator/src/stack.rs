use alloc::sync::Arc;
use hashbrown::HashMap;
use kernel_config::memory::STACK_PAGES;
use memory_structs::{Frame, Nid, Page, VirtualAddress};
use page_allocator::PageAllocator;
use spin::Mutex;

use crate::{PageFaultHandler, PageTable};

/// Backs an event stack region with physical pages as it is touched.
///
/// Frames stay with the stack until the handler is dropped, at which point
/// they are unmapped and returned to the page allocator.
pub struct StackFaultHandler {
    page_table: Arc<PageTable>,
    page_allocator: Arc<PageAllocator>,
    nid: Nid,
    mappings: Mutex<HashMap<Page, Frame>>,
}

impl StackFaultHandler {
    pub fn new(page_table: Arc<PageTable>, page_allocator: Arc<PageAllocator>, nid: Nid) -> StackFaultHandler {
        StackFaultHandler { page_table, page_allocator, nid, mappings: Mutex::new(HashMap::new()) }
    }

    /// Number of stack pages currently backed by a frame.
    pub fn mapped_pages(&self) -> usize {
        self.mappings.lock().len()
    }
}

impl PageFaultHandler for StackFaultHandler {
    fn handle_fault(&self, addr: VirtualAddress) -> Result<(), &'static str> {
        let page = Page::containing_address(addr);
        let mut mappings = self.mappings.lock();
        if let Some(&frame) = mappings.get(&page) {
            return self.page_table.map_to(page, frame);
        }
        if mappings.len() + 1 >= STACK_PAGES {
            error!("stack overflow at {:?}", addr);
            return Err("stack overflow");
        }
        let frame = self.page_allocator.alloc(0, self.nid)
            .ok_or("failed to allocate page for stack")?;
        self.page_table.map_to(page, frame)?;
        mappings.insert(page, frame);
        trace!("stack page {:?} backed by {:?}", page, frame);
        Ok(())
    }
}

impl Drop for StackFaultHandler {
    fn drop(&mut self) {
        for (page, frame) in self.mappings.lock().drain() {
            self.page_table.unmap(page);
            if let Err(e) = self.page_allocator.free(frame, 0) {
                error!("StackFaultHandler::drop(): failed to free {:?}: {}", frame, e);
            }
        }
    }
}
