//! A single slab cache: the free objects and partially used slabs owned by
//! one core or one NUMA node, plus the list other cores free into.

use alloc::{collections::{BTreeMap, VecDeque}, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use mem_map::{CacheOwner, PageUsage, SlabTag};
use memory_structs::{Frame, PhysicalAddress};
use spin::Mutex;

use crate::SlabAllocatorRoot;

/// Per-slab bookkeeping, keyed by the slab's head frame.
struct Slab {
    free: Vec<PhysicalAddress>,
    used: usize,
}

pub(crate) struct CacheState {
    /// Free objects ready to hand out, most recently freed last.
    objects: Vec<PhysicalAddress>,
    slabs: BTreeMap<Frame, Slab>,
    /// Slabs with at least one free object.
    partial: VecDeque<Frame>,
}

pub(crate) struct SlabCache {
    owner: CacheOwner,
    pub(crate) state: Mutex<CacheState>,
    remote: Mutex<Vec<PhysicalAddress>>,
    remote_check: AtomicBool,
}

impl SlabCache {
    pub(crate) fn new(owner: CacheOwner) -> SlabCache {
        SlabCache {
            owner,
            state: Mutex::new(CacheState {
                objects: Vec::new(),
                slabs: BTreeMap::new(),
                partial: VecDeque::new(),
            }),
            remote: Mutex::new(Vec::new()),
            remote_check: AtomicBool::new(false),
        }
    }

    pub(crate) fn owner(&self) -> CacheOwner {
        self.owner
    }

    /// Takes one object from the cache, without growing it.
    ///
    /// Objects returned by `flush_free_list` that belong to other caches are
    /// pushed onto `foreign`.
    pub(crate) fn alloc(
        &self,
        state: &mut CacheState,
        root: &SlabAllocatorRoot,
        foreign: &mut Vec<PhysicalAddress>,
    ) -> Option<PhysicalAddress> {
        if let Some(obj) = state.objects.pop() {
            return Some(obj);
        }

        if self.remote_check.swap(false, Ordering::AcqRel) {
            self.claim_remote_free_list(state);
            while state.objects.len() > root.hiwater() {
                self.flush_free_list(state, root, root.free_batch(), foreign);
            }
            if let Some(obj) = state.objects.pop() {
                return Some(obj);
            }
        }

        let head = *state.partial.front()?;
        let slab = state.slabs.get_mut(&head)?;
        debug_assert!(slab.used < root.objects_per_slab());
        if slab.used + 1 == root.objects_per_slab() {
            state.partial.pop_front();
        }
        slab.used += 1;
        slab.free.pop()
    }

    /// Carves the block at `head` into objects and makes it this cache's newest partial slab.
    pub(crate) fn add_slab(&self, state: &mut CacheState, root: &SlabAllocatorRoot, head: Frame) {
        let tag = SlabTag { root: root.id(), owner: self.owner, head };
        root.track_slab(head);
        for frame in (0..1usize << root.order()).map(|i| head + i) {
            if let Some(page) = root.mem_map().page(frame) {
                page.set_usage(PageUsage::Slab(tag));
            }
        }
        let start = head.start_address();
        // objects are handed out lowest address first
        let free = (0..root.objects_per_slab()).rev().map(|i| start + i * root.size()).collect();
        state.slabs.insert(head, Slab { free, used: 0 });
        state.partial.push_front(head);
        trace!("slab cache {:?}: new {}-byte slab at {:?}", self.owner, root.size(), head);
    }

    pub(crate) fn free(
        &self,
        state: &mut CacheState,
        root: &SlabAllocatorRoot,
        obj: PhysicalAddress,
        foreign: &mut Vec<PhysicalAddress>,
    ) {
        state.objects.push(obj);
        if state.objects.len() > root.hiwater() {
            self.flush_free_list(state, root, root.free_batch(), foreign);
        }
    }

    /// Returns up to `amount` free objects to their slabs, releasing slabs that become empty.
    pub(crate) fn flush_free_list(
        &self,
        state: &mut CacheState,
        root: &SlabAllocatorRoot,
        amount: usize,
        foreign: &mut Vec<PhysicalAddress>,
    ) {
        let mut freed = 0;
        while freed < amount {
            let obj = match state.objects.pop() {
                Some(obj) => obj,
                None => break,
            };
            freed += 1;

            let tag = match root.mem_map().addr_to_page(obj).and_then(|p| p.slab()) {
                Some(tag) => tag,
                None => {
                    error!("slab cache {:?}: {:?} is not a slab object", self.owner, obj);
                    continue;
                }
            };
            if tag.owner != self.owner {
                foreign.push(obj);
                continue;
            }
            let slab = match state.slabs.get_mut(&tag.head) {
                Some(slab) => slab,
                None => {
                    error!("slab cache {:?}: no slab at {:?}", self.owner, tag.head);
                    continue;
                }
            };
            slab.free.push(obj);
            slab.used -= 1;

            if slab.used == 0 {
                state.slabs.remove(&tag.head);
                state.partial.retain(|f| *f != tag.head);
                if let Err(e) = root.release_slab(tag.head) {
                    error!("slab cache {:?}: failed to release slab {:?}: {}", self.owner, tag.head, e);
                }
            } else if slab.used + 1 == root.objects_per_slab() {
                state.partial.push_front(tag.head);
            }
        }
    }

    /// Moves every object other cores have freed into this cache back into its free list.
    pub(crate) fn claim_remote_free_list(&self, state: &mut CacheState) {
        let mut remote = self.remote.lock();
        state.objects.append(&mut remote);
    }

    /// Appends a batch of this cache's objects freed elsewhere.
    ///
    /// Sets the remote check flag when the list crosses `watermark`.
    pub(crate) fn push_remote(&self, batch: &mut Vec<PhysicalAddress>, watermark: usize) {
        let mut remote = self.remote.lock();
        let before = remote.len();
        remote.append(batch);
        if before < watermark && remote.len() >= watermark {
            self.remote_check.store(true, Ordering::Release);
        }
    }

    /// Number of slabs currently held, full or partial.
    pub(crate) fn slab_count(&self) -> usize {
        self.state.lock().slabs.len()
    }

    pub(crate) fn free_object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub(crate) fn remote_len(&self) -> usize {
        self.remote.lock().len()
    }
}
