//! The early page allocator hands out physical page frames before the buddy
//! allocator exists.
//!
//! Free memory is kept as a red-black tree of `(start, end, nid)` page ranges
//! ordered by start frame. Allocations are carved from the high end of the
//! first range (in address order) on an acceptable NUMA node. Freed ranges are
//! always coalesced with adjacent free ranges of the same node, so no two free
//! ranges of one node ever touch.
//!
//! Bring-up feeds the allocator with [`EarlyPageAllocator::free_memory_range()`],
//! which skips anything registered with [`EarlyPageAllocator::reserve_range()`],
//! and finally drains it into the buddy allocator with
//! [`EarlyPageAllocator::release_free_pages()`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

mod free_tree;
#[cfg(test)]
mod test;

use alloc::vec::Vec;
use core::cmp::{max, min};
use free_tree::{RangeAdapter, RangeNode};
use intrusive_collections::{Bound, RBTree};
use kernel_config::memory::PAGE_SIZE;
use memory_structs::{Frame, FrameRange, Nid, PhysicalAddress};
use spin::Mutex;

/// Possible allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// No free range on an acceptable node held this many pages.
    OutOfMemory { npages: usize, nid: Nid },
}
impl From<AllocationError> for &'static str {
    fn from(alloc_err: AllocationError) -> &'static str {
        match alloc_err {
            AllocationError::OutOfMemory { .. } => "early page allocator: out of physical memory",
        }
    }
}

pub struct EarlyPageAllocator {
    inner: Mutex<Inner>,
}

struct Inner {
    free: RBTree<RangeAdapter>,
    /// Half-open physical address intervals that must never be handed out.
    reserved: Vec<(usize, usize)>,
}

impl Default for EarlyPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl EarlyPageAllocator {
    pub fn new() -> EarlyPageAllocator {
        EarlyPageAllocator {
            inner: Mutex::new(Inner {
                free: RBTree::new(RangeAdapter::new()),
                reserved: Vec::new(),
            }),
        }
    }

    /// Marks the physical addresses `[start, end)` as in use.
    ///
    /// Only memory freed with [`free_memory_range()`](Self::free_memory_range)
    /// after this call is affected.
    pub fn reserve_range(&self, start: PhysicalAddress, end: PhysicalAddress) {
        debug!("early page allocator: reserve {:#X}-{:#X}", start, end.value().saturating_sub(1));
        self.inner.lock().reserved.push((start.value(), end.value()));
    }

    /// Adds the physical memory `[start, start + length)` on node `nid` to the free pool,
    /// minus any reserved intervals, shrunk inwards to whole frames.
    pub fn free_memory_range(&self, start: PhysicalAddress, length: usize, nid: Nid) -> Result<(), &'static str> {
        let mut inner = self.inner.lock();
        let mut pending = Vec::new();
        pending.push((start.value(), start.value().saturating_add(length)));

        'next_interval: while let Some((mut lo, mut hi)) = pending.pop() {
            for &(rlo, rhi) in inner.reserved.iter() {
                if !(rlo < hi && lo < rhi) {
                    continue;
                }
                let left = (lo, min(hi, rlo));
                let right = (max(lo, rhi), hi);
                let left_empty = left.0 >= left.1;
                let right_empty = right.0 >= right.1;
                match (left_empty, right_empty) {
                    (true, true) => continue 'next_interval,
                    (true, false) => (lo, hi) = right,
                    (false, true) => (lo, hi) = left,
                    (false, false) => {
                        (lo, hi) = left;
                        pending.push(right);
                    }
                }
            }

            if hi - lo < PAGE_SIZE {
                continue;
            }
            let first = Frame::round_up(PhysicalAddress::new(lo));
            let last = Frame::containing_address(PhysicalAddress::new(hi));
            if last <= first {
                continue;
            }
            info!("early page allocator: free {:#X}-{:#X} on {}",
                first.start_address(), last.start_address().value() - 1, nid);
            inner.free_page_range(FrameRange::new(first, last), nid)?;
        }
        Ok(())
    }

    /// Returns the frames in `range` on node `nid` to the allocator.
    ///
    /// The range is merged with any free neighbour of the same node that it touches.
    /// Freeing frames that are already free is an error.
    pub fn free_page_range(&self, range: FrameRange, nid: Nid) -> Result<(), &'static str> {
        self.inner.lock().free_page_range(range, nid)
    }

    /// Allocates `npages` contiguous frames on node `nid`, or on any node if `nid` is [`Nid::ANY`].
    pub fn try_allocate_page(&self, npages: usize, nid: Nid) -> Result<Frame, AllocationError> {
        self.inner.lock().allocate_page(npages, nid)
    }

    /// Allocates `npages` contiguous frames on node `nid`, or on any node if `nid` is [`Nid::ANY`].
    ///
    /// Running out of memory this early cannot be recovered from, so failure is fatal.
    pub fn allocate_page(&self, npages: usize, nid: Nid) -> Frame {
        match self.try_allocate_page(npages, nid) {
            Ok(frame) => frame,
            Err(e) => {
                error!("early page allocator: unable to allocate {} pages on {}", npages, nid);
                panic!("{}", <&'static str>::from(e));
            }
        }
    }

    /// Assigns every free frame in `range` to node `nid`, splitting free ranges that straddle its bounds.
    pub fn set_nid_range(&self, range: FrameRange, nid: Nid) -> Result<(), &'static str> {
        let mut inner = self.inner.lock();

        let mut overlapping = Vec::new();
        {
            let mut cursor = inner.free.upper_bound_mut(Bound::Included(&range.start()));
            if cursor.is_null() {
                cursor.move_next();
            }
            while let Some(node) = cursor.get() {
                if node.start() >= range.end() {
                    break;
                }
                if node.end() > range.start() {
                    match cursor.remove() {
                        Some(removed) => overlapping.push((removed.range(), removed.nid())),
                        None => break,
                    }
                } else {
                    cursor.move_next();
                }
            }
        }

        for (free, old_nid) in overlapping {
            let below = FrameRange::new(free.start(), min(free.end(), range.start()));
            let inside = FrameRange::new(max(free.start(), range.start()), min(free.end(), range.end()));
            let above = FrameRange::new(max(free.start(), range.end()), free.end());
            if !below.is_empty() {
                inner.free_page_range(below, old_nid)?;
            }
            if !inside.is_empty() {
                debug!("early page allocator: NUMA mapping {:?} -> {}", inside, nid);
                inner.free_page_range(inside, nid)?;
            }
            if !above.is_empty() {
                inner.free_page_range(above, old_nid)?;
            }
        }
        Ok(())
    }

    /// Empties the allocator, passing every free range to `f` in address order.
    pub fn release_free_pages<F: FnMut(FrameRange, Nid)>(&self, mut f: F) {
        let mut inner = self.inner.lock();
        let tree = inner.free.take();
        for node in tree.into_iter() {
            f(node.range(), node.nid());
        }
    }

    /// Returns a snapshot of the free ranges in address order.
    pub fn free_ranges(&self) -> Vec<(FrameRange, Nid)> {
        self.inner.lock().free.iter().map(|node| (node.range(), node.nid())).collect()
    }

    /// Returns the total number of free frames on node `nid` (or all nodes for [`Nid::ANY`]).
    pub fn free_page_count(&self, nid: Nid) -> usize {
        self.inner.lock().free.iter()
            .filter(|node| nid.accepts(node.nid()))
            .map(|node| node.npages())
            .sum()
    }
}

impl Inner {
    fn allocate_page(&mut self, npages: usize, nid: Nid) -> Result<Frame, AllocationError> {
        let mut cursor = self.free.front_mut();
        while let Some(node) = cursor.get() {
            if !nid.accepts(node.nid()) || node.npages() < npages {
                cursor.move_next();
                continue;
            }
            let ret = node.end() - npages;
            if ret == node.start() {
                cursor.remove();
            } else {
                node.set_end(ret);
            }
            trace!("early page allocator: allocated {} pages at {:?}", npages, ret);
            return Ok(ret);
        }
        Err(AllocationError::OutOfMemory { npages, nid })
    }

    fn free_page_range(&mut self, range: FrameRange, nid: Nid) -> Result<(), &'static str> {
        if range.is_empty() {
            return Ok(());
        }

        // the free range at or below `range`, and the one after it
        let (prev, next) = {
            let mut cursor = self.free.upper_bound(Bound::Included(&range.start()));
            let prev = cursor.get().map(|n| (n.range(), n.nid()));
            if prev.is_some() {
                cursor.move_next();
            } else {
                cursor = self.free.front();
            }
            let next = cursor.get().map(|n| (n.range(), n.nid()));
            (prev, next)
        };

        if prev.map_or(false, |(p, _)| p.end() > range.start())
            || next.map_or(false, |(n, _)| n.start() < range.end())
        {
            error!("early page allocator: freeing {:?} overlaps a free range", range);
            return Err("early page allocator: double free of a page range");
        }

        let merge_prev = prev.filter(|&(p, pnid)| pnid == nid && p.end() == range.start());
        let merge_next = next.filter(|&(n, nnid)| nnid == nid && n.start() == range.end());

        let mut end = range.end();
        if let Some((n, _)) = merge_next {
            if let Some(removed) = self.free.find_mut(&n.start()).remove() {
                end = removed.end();
            }
        }
        match merge_prev {
            Some((p, _)) => {
                if let Some(node) = self.free.find(&p.start()).get() {
                    node.set_end(end);
                }
            }
            None => {
                self.free.insert(RangeNode::new_link(FrameRange::new(range.start(), end), nid));
            }
        }
        Ok(())
    }
}
