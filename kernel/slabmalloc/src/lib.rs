//! A NUMA-aware slab allocator for objects of one size.
//!
//! # Overview
//!
//! The organization is as follows:
//!
//!  * A [`SlabAllocatorRoot`] describes one object size: its alignment, the
//!    buddy order of each slab, and the batching thresholds. It owns one
//!    [`SlabAllocator`] per core and, installed on first use, one
//!    [`SlabAllocatorNode`] per NUMA node.
//!  * A [`SlabAllocator`] serves its core from a private cache that grows by
//!    whole slabs taken from the page allocator on the core's own node.
//!  * A [`SlabAllocatorNode`] serves requests for memory on a node other than
//!    the caller's, behind a lock.
//!
//! Every frame of a slab is tagged in the memory map with the root and the
//! cache that carved it, so any core can free any object. Objects freed on
//! the object's own node go into the freeing core's cache; objects of other
//! nodes are batched and handed back to the owning cache's remote list,
//! which the owner claims once enough have piled up.
//!
//! Objects are addresses. The allocator never reads or writes the memory, so
//! which objects are handed out is kept in a bitmap per slab beside it. A
//! free of an object that is not handed out is refused.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

mod cache;
#[cfg(test)]
mod test;

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use cache::{CacheState, SlabCache};
use core::sync::atomic::{AtomicU64, Ordering};
use cpu_local::CpuLocal;
use kernel_config::memory::{MAX_ORDER, MAX_SLAB_SIZE, MIN_SLAB_OBJECT, PAGE_SHIFT, PAGE_SIZE};
use mem_map::{CacheOwner, MemMap, PageUsage};
use memory_structs::{Frame, Nid, PhysicalAddress};
use page_allocator::PageAllocator;
use spin::{Mutex, Once, RwLock};

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Index of the highest set bit of a nonzero `x`.
fn fls(x: usize) -> usize {
    (usize::BITS - 1 - x.leading_zeros()) as usize
}

/// The smallest order up to `max_order` at which the space left over after
/// packing objects of `size` is at most `1/frac` of the slab.
fn slab_order(size: usize, max_order: usize, frac: usize) -> usize {
    let mut order = if fls(size - 1) < PAGE_SHIFT {
        0
    } else {
        fls(size - 1) - PAGE_SHIFT + 1
    };
    while order <= max_order {
        let slab_size = PAGE_SIZE << order;
        let waste = slab_size - (slab_size / size) * size;
        if waste * frac <= slab_size {
            break;
        }
        order += 1;
    }
    order
}

/// Slabs of at most two pages may waste a quarter of their space;
/// beyond that the smallest order that fits one object is used.
fn calculate_order(size: usize) -> usize {
    let order = slab_order(size, 1, 4);
    if order <= 1 {
        return order;
    }
    slab_order(size, MAX_ORDER, 0)
}

fn calculate_free_batch(size: usize) -> usize {
    let batch = core::cmp::max(4 * PAGE_SIZE / size, core::cmp::min(256, 64 * PAGE_SIZE / size));
    batch.max(1)
}

/// One bit per object of a slab, set while the object is handed out.
struct LiveBits(Box<[AtomicU64]>);

impl LiveBits {
    fn new(objects: usize) -> LiveBits {
        LiveBits((0..objects.div_ceil(64)).map(|_| AtomicU64::new(0)).collect())
    }

    /// Sets bit `index` and returns its previous value.
    fn set(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        self.0[index / 64].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears bit `index` and returns its previous value.
    fn clear(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        self.0[index / 64].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }
}

pub struct SlabAllocatorRoot {
    id: usize,
    align: usize,
    size: usize,
    order: usize,
    free_batch: usize,
    hiwater: usize,
    page_allocator: Arc<PageAllocator>,
    cpus: CpuLocal<SlabAllocator>,
    nodes: Vec<Once<SlabAllocatorNode>>,
    /// Keyed by the head frame of every slab this root currently owns.
    live: RwLock<BTreeMap<Frame, LiveBits>>,
}

impl SlabAllocatorRoot {
    /// Creates the allocator for objects of `size` bytes aligned to `align`,
    /// with one per-core allocator for each entry of `cpu_nodes`.
    ///
    /// `id` is recorded in the memory map for every slab, which is how a free
    /// finds its way back to this root.
    pub fn new(
        id: usize,
        size: usize,
        align: usize,
        page_allocator: Arc<PageAllocator>,
        cpu_nodes: &[Nid],
    ) -> Result<SlabAllocatorRoot, &'static str> {
        let align = round_up(core::cmp::max(align, MIN_SLAB_OBJECT), MIN_SLAB_OBJECT);
        let size = round_up(core::cmp::max(size, MIN_SLAB_OBJECT), align);
        if size > MAX_SLAB_SIZE {
            return Err("SlabAllocatorRoot::new(): object size exceeds the largest slab");
        }
        let order = calculate_order(size);
        if order > MAX_ORDER {
            return Err("SlabAllocatorRoot::new(): request for too big a slab");
        }
        let free_batch = calculate_free_batch(size);
        let cpus = CpuLocal::new_with(cpu_nodes.len(), |cpu| SlabAllocator {
            nid: cpu_nodes[cpu.index()],
            cache: SlabCache::new(CacheOwner::Cpu(cpu)),
            remote: Mutex::new(RemoteBatch { objects: Vec::new(), owner: None }),
        })?;
        let nodes = (0..page_allocator.num_nodes()).map(|_| Once::new()).collect();
        debug!("slab root {}: size {} align {} order {} free_batch {}", id, size, align, order, free_batch);
        Ok(SlabAllocatorRoot {
            id,
            align,
            size,
            order,
            free_batch,
            hiwater: 4 * free_batch,
            page_allocator,
            cpus,
            nodes,
            live: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// The buddy order of every slab.
    pub fn order(&self) -> usize {
        self.order
    }

    /// How many objects move at once between a cache and its slabs or remote list.
    pub fn free_batch(&self) -> usize {
        self.free_batch
    }

    /// A cache holding more free objects than this returns a batch to their slabs.
    pub fn hiwater(&self) -> usize {
        self.hiwater
    }

    pub fn objects_per_slab(&self) -> usize {
        (PAGE_SIZE << self.order) / self.size
    }

    pub fn page_allocator(&self) -> &Arc<PageAllocator> {
        &self.page_allocator
    }

    pub fn mem_map(&self) -> &Arc<MemMap> {
        self.page_allocator.mem_map()
    }

    /// Allocates an object on the current core's node.
    pub fn alloc(&self) -> Option<PhysicalAddress> {
        self.cpus.with(|allocator| allocator.alloc(self))
    }

    /// Allocates an object on node `nid`.
    pub fn alloc_on(&self, nid: Nid) -> Option<PhysicalAddress> {
        self.cpus.with(|allocator| allocator.alloc_on(self, nid))
    }

    /// Frees an object allocated from this root, on any core.
    pub fn free(&self, obj: PhysicalAddress) -> Result<(), &'static str> {
        self.cpus.with(|allocator| allocator.free(self, obj))
    }

    /// Returns whether `obj` is currently handed out by this root.
    pub fn is_live(&self, obj: PhysicalAddress) -> bool {
        self.object_index(obj).map_or(false, |(head, index)| {
            self.live.read().get(&head).map_or(false, |bits| {
                bits.0[index / 64].load(Ordering::Acquire) & (1u64 << (index % 64)) != 0
            })
        })
    }

    /// Number of objects currently handed out by this root.
    pub fn live_count(&self) -> usize {
        self.live.read().values()
            .flat_map(|bits| bits.0.iter())
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Returns the head frame of the slab holding `obj` and the object's index in it.
    fn object_index(&self, obj: PhysicalAddress) -> Result<(Frame, usize), &'static str> {
        let tag = self.mem_map().addr_to_page(obj)
            .and_then(|p| p.slab())
            .ok_or("slab free: address is not a slab object")?;
        if tag.root != self.id {
            return Err("slab free: object belongs to a different slab allocator");
        }
        let offset = obj.value() - tag.head.start_address().value();
        if offset % self.size != 0 || offset / self.size >= self.objects_per_slab() {
            return Err("slab free: address is not the start of an object");
        }
        Ok((tag.head, offset / self.size))
    }

    fn mark_live(&self, obj: PhysicalAddress) {
        let already = match self.object_index(obj) {
            Ok((head, index)) => self.live.read().get(&head).map(|bits| bits.set(index)),
            Err(_) => None,
        };
        if already != Some(false) {
            error!("slab root {}: handed out {:?}, which was not free", self.id, obj);
        }
    }

    /// Clears the live bit of `obj`, failing if the object is not handed out.
    fn mark_free(&self, obj: PhysicalAddress) -> Result<(), &'static str> {
        let (head, index) = self.object_index(obj)?;
        let was_live = self.live.read().get(&head).map_or(false, |bits| bits.clear(index));
        if !was_live {
            error!("slab root {}: double free of {:?}", self.id, obj);
            return Err("slab free: object is not allocated");
        }
        Ok(())
    }

    /// Starts tracking the objects of the slab at `head`.
    fn track_slab(&self, head: Frame) {
        self.live.write().insert(head, LiveBits::new(self.objects_per_slab()));
    }

    /// Hands the empty slab at `head` back to the page allocator.
    fn release_slab(&self, head: Frame) -> Result<(), &'static str> {
        if let Some(page) = self.mem_map().page(head) {
            page.set_usage(PageUsage::InUse { order: self.order as u8 });
        }
        self.page_allocator.mark_tail(head, self.order);
        self.live.write().remove(&head);
        self.page_allocator.free(head, self.order)
    }

    /// Returns the allocator of core `cpu`.
    pub fn cpu_allocator(&self, cpu: cpu::CpuId) -> Option<&SlabAllocator> {
        self.cpus.get(cpu)
    }

    /// Returns the allocator of node `nid`, installing it on first use.
    pub fn node_allocator(&self, nid: Nid) -> Option<&SlabAllocatorNode> {
        self.nodes.get(nid.index()).map(|slot| {
            slot.call_once(|| {
                debug!("slab root {}: installing allocator for {}", self.id, nid);
                SlabAllocatorNode { nid, cache: SlabCache::new(CacheOwner::Node(nid)) }
            })
        })
    }

    fn cache(&self, owner: CacheOwner) -> Option<&SlabCache> {
        match owner {
            CacheOwner::Cpu(cpu) => self.cpus.get(cpu).map(|a| &a.cache),
            CacheOwner::Node(nid) => self.nodes.get(nid.index())
                .and_then(|slot| slot.get())
                .map(|n| &n.cache),
        }
    }

    fn caches(&self) -> impl Iterator<Item = &SlabCache> {
        self.cpus.iter().map(|(_, a)| &a.cache)
            .chain(self.nodes.iter().filter_map(|slot| slot.get()).map(|n| &n.cache))
    }

    /// Hands objects that belong to other caches to their owners.
    fn return_foreign(&self, foreign: Vec<PhysicalAddress>) {
        if foreign.is_empty() {
            return;
        }
        match cpu::try_current_cpu().and_then(|cpu| self.cpus.get(cpu)) {
            Some(allocator) => {
                for obj in foreign {
                    if let Err(e) = allocator.free_remote(self, obj) {
                        error!("slab root {}: lost object {:?}: {}", self.id, obj, e);
                    }
                }
            }
            None => self.push_to_owners(foreign),
        }
    }

    fn push_to_owners(&self, foreign: Vec<PhysicalAddress>) {
        for obj in foreign {
            let owner = self.mem_map().addr_to_page(obj).and_then(|p| p.slab()).map(|tag| tag.owner);
            match owner.and_then(|owner| self.cache(owner)) {
                Some(cache) => cache.push_remote(&mut alloc::vec![obj], usize::MAX),
                None => error!("slab root {}: object {:?} has no owning cache", self.id, obj),
            }
        }
    }

    /// Returns every free object to its slab and every empty slab to the page allocator.
    ///
    /// Must only be called once no core is using this root any more.
    pub fn drain(&self) {
        loop {
            for (_, allocator) in self.cpus.iter() {
                let mut batch = allocator.remote.lock();
                allocator.flush_remote_list(self, &mut batch);
            }
            let mut foreign = Vec::new();
            for cache in self.caches() {
                let mut state = cache.state.lock();
                cache.claim_remote_free_list(&mut state);
                cache.flush_free_list(&mut state, self, usize::MAX, &mut foreign);
            }
            if foreign.is_empty() {
                break;
            }
            self.push_to_owners(foreign);
        }
        let leaked: usize = self.caches().map(|c| c.slab_count()).sum();
        if leaked > 0 {
            warn!("slab root {}: {} slabs still hold live objects", self.id, leaked);
        }
    }

    /// Number of slabs currently owned by all caches of this root.
    pub fn slab_count(&self) -> usize {
        self.caches().map(|c| c.slab_count()).sum()
    }
}

/// Pops an object from `cache`, growing it by one slab on node `nid` if it is empty.
fn alloc_or_grow(
    cache: &SlabCache,
    state: &mut CacheState,
    root: &SlabAllocatorRoot,
    nid: Nid,
    foreign: &mut Vec<PhysicalAddress>,
) -> Option<PhysicalAddress> {
    let obj = match cache.alloc(state, root, foreign) {
        Some(obj) => obj,
        None => {
            let head = root.page_allocator.alloc(root.order, nid)?;
            cache.add_slab(state, root, head);
            cache.alloc(state, root, foreign)?
        }
    };
    root.mark_live(obj);
    Some(obj)
}

struct RemoteBatch {
    objects: Vec<PhysicalAddress>,
    /// The cache every object in `objects` belongs to.
    owner: Option<CacheOwner>,
}

/// The slab allocator of one core.
pub struct SlabAllocator {
    nid: Nid,
    cache: SlabCache,
    remote: Mutex<RemoteBatch>,
}

impl SlabAllocator {
    pub fn nid(&self) -> Nid {
        self.nid
    }

    /// Allocates an object on this core's node.
    pub fn alloc(&self, root: &SlabAllocatorRoot) -> Option<PhysicalAddress> {
        let mut foreign = Vec::new();
        let obj = {
            let mut state = self.cache.state.lock();
            alloc_or_grow(&self.cache, &mut state, root, self.nid, &mut foreign)
        };
        root.return_foreign(foreign);
        obj
    }

    /// Allocates an object on node `nid`, through that node's allocator if it is not ours.
    pub fn alloc_on(&self, root: &SlabAllocatorRoot, nid: Nid) -> Option<PhysicalAddress> {
        if nid == self.nid || nid.is_any() {
            return self.alloc(root);
        }
        root.node_allocator(nid)?.alloc(root)
    }

    pub fn free(&self, root: &SlabAllocatorRoot, obj: PhysicalAddress) -> Result<(), &'static str> {
        let page = root.mem_map().addr_to_page(obj).ok_or("slab free: address is not in the memory map")?;
        root.mark_free(obj)?;
        if page.nid() != self.nid {
            return self.free_remote(root, obj);
        }
        let mut foreign = Vec::new();
        {
            let mut state = self.cache.state.lock();
            self.cache.free(&mut state, root, obj, &mut foreign);
        }
        for obj in foreign {
            self.free_remote(root, obj)?;
        }
        Ok(())
    }

    fn free_remote(&self, root: &SlabAllocatorRoot, obj: PhysicalAddress) -> Result<(), &'static str> {
        let owner = root.mem_map().addr_to_page(obj)
            .and_then(|p| p.slab())
            .map(|tag| tag.owner)
            .ok_or("slab free: address is not a slab object")?;
        let mut batch = self.remote.lock();
        if batch.owner != Some(owner) {
            self.flush_remote_list(root, &mut batch);
            batch.owner = Some(owner);
        }
        batch.objects.push(obj);
        if batch.objects.len() > root.free_batch {
            self.flush_remote_list(root, &mut batch);
        }
        Ok(())
    }

    fn flush_remote_list(&self, root: &SlabAllocatorRoot, batch: &mut RemoteBatch) {
        let owner = match batch.owner {
            Some(owner) => owner,
            None => return,
        };
        match root.cache(owner) {
            Some(cache) => cache.push_remote(&mut batch.objects, root.free_batch),
            None => {
                error!("slab allocator: remote cache {:?} does not exist, dropping {} objects", owner, batch.objects.len());
                batch.objects.clear();
            }
        }
    }
}

/// The slab allocator serving one NUMA node to cores of other nodes.
pub struct SlabAllocatorNode {
    nid: Nid,
    cache: SlabCache,
}

impl SlabAllocatorNode {
    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn alloc(&self, root: &SlabAllocatorRoot) -> Option<PhysicalAddress> {
        let mut foreign = Vec::new();
        let obj = {
            let mut state = self.cache.state.lock();
            alloc_or_grow(&self.cache, &mut state, root, self.nid, &mut foreign)
        };
        root.return_foreign(foreign);
        obj
    }
}
