//! The buddy page allocator, which takes over from the early page allocator
//! once the memory map exists.
//!
//! Every NUMA node has its own set of free lists, one per block order
//! `0..=MAX_ORDER`. A block of order `k` is `2^k` frames aligned to `2^k`.
//! Allocation splits the smallest sufficiently large free block, and freeing
//! merges a block with its buddy (`pfn ^ (1 << order)`) for as long as the
//! buddy is itself a free block of the same order on the same node.
//!
//! The head frame of every block records its state in the [`MemMap`], which
//! is what a free consults to find the block's node and its buddy's state.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;


use alloc::{collections::BTreeSet, sync::Arc, vec::Vec};
use core::cmp::min;
use early_page_allocator::EarlyPageAllocator;
use kernel_config::memory::MAX_ORDER;
use mem_map::{MemMap, PageUsage};
use memory_structs::{Frame, FrameRange, Nid};
use spin::Mutex;

/// Returns the smallest order whose blocks hold at least `npages` frames.
pub fn order_for(npages: usize) -> usize {
    npages.max(1).next_power_of_two().trailing_zeros() as usize
}

struct FreeLists {
    /// `free[k]` holds the head frame of every free block of order `k`.
    free: [BTreeSet<Frame>; MAX_ORDER + 1],
    nfree: usize,
}

impl FreeLists {
    fn new() -> FreeLists {
        FreeLists {
            free: core::array::from_fn(|_| BTreeSet::new()),
            nfree: 0,
        }
    }
}

pub struct PageAllocator {
    mem_map: Arc<MemMap>,
    nodes: Vec<Mutex<FreeLists>>,
}

impl PageAllocator {
    /// Creates an empty allocator for `num_nodes` NUMA nodes.
    pub fn new(mem_map: Arc<MemMap>, num_nodes: usize) -> PageAllocator {
        PageAllocator {
            mem_map,
            nodes: (0..num_nodes.max(1)).map(|_| Mutex::new(FreeLists::new())).collect(),
        }
    }

    /// Creates an allocator owning every page the early allocator still has free.
    ///
    /// The early allocator is left empty.
    pub fn from_early(
        early: &EarlyPageAllocator,
        mem_map: Arc<MemMap>,
        num_nodes: usize,
    ) -> Result<PageAllocator, &'static str> {
        let allocator = PageAllocator::new(mem_map, num_nodes);
        let mut ranges = Vec::new();
        early.release_free_pages(|range, nid| ranges.push((range, nid)));
        for (range, nid) in ranges {
            allocator.add_free_range(range, nid)?;
        }
        info!("page allocator: {} free pages across {} nodes",
            allocator.free_page_count(Nid::ANY), allocator.nodes.len());
        Ok(allocator)
    }

    pub fn mem_map(&self) -> &Arc<MemMap> {
        &self.mem_map
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Adds the frames in `range` to node `nid`'s free lists as maximal aligned blocks.
    pub fn add_free_range(&self, range: FrameRange, nid: Nid) -> Result<(), &'static str> {
        let node = self.nodes.get(nid.index()).ok_or("page allocator: no such NUMA node")?;
        if range.iter().any(|f| self.mem_map.nid(f) != Some(nid)) {
            return Err("page allocator: free range is not covered by the memory map on that node");
        }
        let mut lists = node.lock();
        let mut start = range.start().number();
        let end = range.end().number();
        while start < end {
            let mut order = if start == 0 {
                MAX_ORDER
            } else {
                min(MAX_ORDER, start.trailing_zeros() as usize)
            };
            while (1 << order) > end - start {
                order -= 1;
            }
            self.insert(&mut lists, Frame::new(start), order);
            self.mark_tail(Frame::new(start), order);
            start += 1 << order;
        }
        Ok(())
    }

    /// Allocates a block of `2^order` frames on node `nid`.
    ///
    /// With [`Nid::ANY`] every node is tried in order. Returns `None` when no
    /// acceptable node has a large enough block.
    pub fn alloc(&self, order: usize, nid: Nid) -> Option<Frame> {
        if order > MAX_ORDER {
            warn!("page allocator: order {} exceeds the maximum of {}", order, MAX_ORDER);
            return None;
        }
        if nid.is_any() {
            return (0..self.nodes.len()).find_map(|n| self.alloc_on(order, n));
        }
        self.alloc_on(order, nid.index())
    }

    fn alloc_on(&self, order: usize, node: usize) -> Option<Frame> {
        let mut lists = self.nodes.get(node)?.lock();
        let mut found = None;
        for o in order..=MAX_ORDER {
            if let Some(frame) = lists.free[o].pop_first() {
                found = Some((frame, o));
                break;
            }
        }
        let (frame, mut o) = found?;
        lists.nfree -= 1 << o;

        while o > order {
            o -= 1;
            self.insert(&mut lists, frame + (1 << o), o);
        }
        if let Some(page) = self.mem_map.page(frame) {
            page.set_usage(PageUsage::InUse { order: order as u8 });
        }
        trace!("page allocator: allocated {:?} order {} on node{}", frame, order, node);
        Some(frame)
    }

    /// Returns the block of order `order` that starts at `frame`.
    ///
    /// The block must have been allocated with the same order. A slab has to
    /// be marked [`PageUsage::InUse`] again by its owner before it is freed.
    pub fn free(&self, frame: Frame, order: usize) -> Result<(), &'static str> {
        if order > MAX_ORDER || !frame.is_aligned(order) {
            return Err("page allocator: freed block is misaligned for its order");
        }
        let page = self.mem_map.page(frame).ok_or("page allocator: freed frame is not in the memory map")?;
        match page.usage() {
            PageUsage::InUse { order: o } if o as usize == order => {}
            PageUsage::InUse { .. } => return Err("page allocator: freed block with the wrong order"),
            PageUsage::Slab(_) => return Err("page allocator: freed a slab that is still live"),
            PageUsage::Tail => return Err("page allocator: freed frame is inside a block"),
            PageUsage::Free { .. } => {
                error!("page allocator: double free of {:?}", frame);
                return Err("page allocator: double free");
            }
            PageUsage::Reserved => return Err("page allocator: freed a reserved frame"),
        }
        let nid = page.nid();
        let node = self.nodes.get(nid.index()).ok_or("page allocator: no such NUMA node")?;
        let mut lists = node.lock();

        let mut frame = frame;
        let mut order = order;
        while order < MAX_ORDER {
            let buddy = Frame::new(frame.number() ^ (1 << order));
            let buddy_free = self.mem_map.page(buddy).map_or(false, |p| {
                p.nid() == nid && p.usage() == PageUsage::Free { order: order as u8 }
            });
            if !buddy_free || !lists.free[order].remove(&buddy) {
                break;
            }
            lists.nfree -= 1 << order;
            let merged = frame.align_down(order + 1);
            // whichever of the two heads is not the merged head is now inside it
            let absorbed = if merged == frame { buddy } else { frame };
            if let Some(page) = self.mem_map.page(absorbed) {
                page.set_usage(PageUsage::Tail);
            }
            frame = merged;
            order += 1;
        }
        self.insert(&mut lists, frame, order);
        Ok(())
    }

    fn insert(&self, lists: &mut FreeLists, frame: Frame, order: usize) {
        if let Some(page) = self.mem_map.page(frame) {
            page.set_usage(PageUsage::Free { order: order as u8 });
        }
        lists.free[order].insert(frame);
        lists.nfree += 1 << order;
    }

    /// Marks every frame of the block at `head` except the head itself as [`PageUsage::Tail`].
    pub fn mark_tail(&self, head: Frame, order: usize) {
        for frame in (1..1usize << order).map(|i| head + i) {
            if let Some(page) = self.mem_map.page(frame) {
                page.set_usage(PageUsage::Tail);
            }
        }
    }

    /// Returns the number of free frames on node `nid`, or on all nodes for [`Nid::ANY`].
    pub fn free_page_count(&self, nid: Nid) -> usize {
        self.nodes.iter().enumerate()
            .filter(|(n, _)| nid.is_any() || nid.index() == *n)
            .map(|(_, node)| node.lock().nfree)
            .sum()
    }

    /// Returns every free block of node `nid` as `(head, order)`, sorted by head frame.
    pub fn free_blocks(&self, nid: Nid) -> Vec<(Frame, usize)> {
        let mut blocks = Vec::new();
        if let Some(node) = self.nodes.get(nid.index()) {
            let lists = node.lock();
            for (order, list) in lists.free.iter().enumerate() {
                blocks.extend(list.iter().map(|f| (*f, order)));
            }
        }
        blocks.sort();
        blocks
    }
}
