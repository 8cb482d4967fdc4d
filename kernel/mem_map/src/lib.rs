//! The memory map: one [`PageMeta`] for every physical frame the runtime manages.
//!
//! The page and slab allocators record here who currently owns each frame,
//! which lets a free on any core find the allocator and cache an object or
//! block came from without any per-object header.
//!
//! Frames are grouped into sections, one per contiguous physical memory range
//! reported at boot; lookups binary-search the sections by frame number.

#![no_std]

extern crate alloc;


use alloc::{boxed::Box, vec::Vec};
use cpu::CpuId;
use memory_structs::{Frame, FrameRange, Nid, PhysicalAddress};
use spin::Mutex;

/// The slab cache a slab page belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheOwner {
    /// The per-core cache of the given core.
    Cpu(CpuId),
    /// The shared cache of the given NUMA node.
    Node(Nid),
}

/// Bookkeeping for a frame that is part of a slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabTag {
    /// Identifies the slab allocator root (size class) the slab belongs to.
    pub root: usize,
    /// The cache that carved the slab and will take its objects back.
    pub owner: CacheOwner,
    /// The first frame of the slab.
    pub head: Frame,
}

/// What a frame is currently used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageUsage {
    /// Not available to any allocator.
    Reserved,
    /// The head of a free buddy block of the given order.
    Free { order: u8 },
    /// The head of a block of the given order handed out by the page allocator.
    InUse { order: u8 },
    /// Inside a buddy block, free or allocated. The block's head frame records its state.
    Tail,
    /// Part of a slab.
    Slab(SlabTag),
}

/// The metadata of one physical frame.
#[derive(Debug)]
pub struct PageMeta {
    nid: Nid,
    usage: Mutex<PageUsage>,
}

impl PageMeta {
    fn new(nid: Nid) -> PageMeta {
        PageMeta { nid, usage: Mutex::new(PageUsage::Reserved) }
    }

    /// The NUMA node this frame belongs to.
    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn usage(&self) -> PageUsage {
        *self.usage.lock()
    }

    pub fn set_usage(&self, usage: PageUsage) {
        *self.usage.lock() = usage;
    }

    /// Returns the slab tag if this frame is part of a slab.
    pub fn slab(&self) -> Option<SlabTag> {
        match self.usage() {
            PageUsage::Slab(tag) => Some(tag),
            _ => None,
        }
    }
}

struct Section {
    frames: FrameRange,
    pages: Box<[PageMeta]>,
}

pub struct MemMap {
    /// Sorted by start frame, never overlapping.
    sections: Vec<Section>,
}

impl MemMap {
    /// Creates a memory map covering the given ranges of frames.
    pub fn new<I>(ranges: I) -> Result<MemMap, &'static str>
    where
        I: IntoIterator<Item = (FrameRange, Nid)>,
    {
        let mut sections: Vec<Section> = ranges
            .into_iter()
            .filter(|(frames, _)| !frames.is_empty())
            .map(|(frames, nid)| Section {
                frames,
                pages: (0..frames.size_in_frames()).map(|_| PageMeta::new(nid)).collect(),
            })
            .collect();
        sections.sort_by_key(|s| s.frames.start());
        if sections.windows(2).any(|w| w[0].frames.overlaps(&w[1].frames)) {
            return Err("MemMap::new(): overlapping memory ranges");
        }
        log::debug!("mem_map: {} sections, {} frames",
            sections.len(), sections.iter().map(|s| s.pages.len()).sum::<usize>());
        Ok(MemMap { sections })
    }

    /// Returns the metadata of `frame`, or `None` if the frame is not managed.
    pub fn page(&self, frame: Frame) -> Option<&PageMeta> {
        let idx = match self.sections.binary_search_by(|s| {
            if s.frames.end() <= frame {
                core::cmp::Ordering::Less
            } else if s.frames.start() > frame {
                core::cmp::Ordering::Greater
            } else {
                core::cmp::Ordering::Equal
            }
        }) {
            Ok(idx) => idx,
            Err(_) => return None,
        };
        let section = &self.sections[idx];
        section.pages.get(frame - section.frames.start())
    }

    /// Returns the metadata of the frame containing `addr`.
    pub fn addr_to_page(&self, addr: PhysicalAddress) -> Option<&PageMeta> {
        self.page(Frame::containing_address(addr))
    }

    /// Returns the NUMA node of `frame`, if managed.
    pub fn nid(&self, frame: Frame) -> Option<Nid> {
        self.page(frame).map(|p| p.nid())
    }

    /// Iterates over the frame ranges this map covers.
    pub fn ranges(&self) -> impl Iterator<Item = FrameRange> + '_ {
        self.sections.iter().map(|s| s.frames)
    }
}
