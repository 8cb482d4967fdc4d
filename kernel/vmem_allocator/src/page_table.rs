use alloc::collections::BTreeMap;
use memory_structs::{Frame, Page, PhysicalAddress, VirtualAddress};
use spin::Mutex;

/// The page-to-frame translations of the runtime's single address space.
#[derive(Default)]
pub struct PageTable {
    entries: Mutex<BTreeMap<Page, Frame>>,
}

impl PageTable {
    pub fn new() -> PageTable {
        PageTable::default()
    }

    /// Maps `page` to `frame`.
    ///
    /// Mapping a page again to the frame it already maps to is allowed,
    /// mapping it to a different frame is not.
    pub fn map_to(&self, page: Page, frame: Frame) -> Result<(), &'static str> {
        let mut entries = self.entries.lock();
        match entries.get(&page) {
            Some(existing) if *existing != frame => {
                error!("PageTable::map_to(): {:?} already maps to {:?}, not {:?}", page, existing, frame);
                Err("page was already mapped")
            }
            Some(_) => Ok(()),
            None => {
                entries.insert(page, frame);
                Ok(())
            }
        }
    }

    /// Removes the mapping of `page`, returning the frame it mapped to.
    pub fn unmap(&self, page: Page) -> Option<Frame> {
        self.entries.lock().remove(&page)
    }

    /// Translates a VirtualAddress to a PhysicalAddress.
    pub fn translate(&self, virtual_address: VirtualAddress) -> Option<PhysicalAddress> {
        let offset = virtual_address.page_offset();
        self.translate_page(Page::containing_address(virtual_address))
            .map(|frame| frame.start_address() + offset)
    }

    pub fn translate_page(&self, page: Page) -> Option<Frame> {
        self.entries.lock().get(&page).copied()
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }
}
