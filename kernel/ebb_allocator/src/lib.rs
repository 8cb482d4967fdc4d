//! The Ebb allocator hands out the ids of dynamically created Ebbs.
//!
//! Local ids come from `[FIRST_FREE_ID, FIRST_STATIC_USER_ID)` and are only
//! meaningful on this node. Global ids come from the id space this node was
//! given when it joined, `[space << 16, ((space + 1) << 16) - 1]`, and are
//! unique across every node sharing the global id map.
//!
//! Both pools always hand out their lowest free id. An id may only be freed
//! once no core holds a cached reference to it anymore, which the caller
//! must guarantee.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

mod id_set;

use alloc::sync::Arc;
use ebb::{shared, Ebb, EbbRef, LocalIdMap};
use ebb_id::{EbbId, EBB_ALLOCATOR_ID, FIRST_FREE_ID};
use id_set::IdSet;
use kernel_config::ebb::{FIRST_GLOBAL_ID_SPACE, FIRST_STATIC_USER_ID};
use spin::{Mutex, Once};

/// The node's Ebb allocator, installed under its static id at boot.
pub const EBB_ALLOCATOR: EbbRef<EbbAllocator> = EbbRef::new(EBB_ALLOCATOR_ID);

/// Possible id allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// Every local id is in use.
    LocalIdsExhausted,
    /// Every id of this node's global id space is in use.
    GlobalIdsExhausted { space: u16 },
    /// No global id space has been assigned yet.
    NoIdSpace,
}
impl From<AllocationError> for &'static str {
    fn from(alloc_err: AllocationError) -> &'static str {
        match alloc_err {
            AllocationError::LocalIdsExhausted => "ebb allocator: out of local ids",
            AllocationError::GlobalIdsExhausted { .. } => "ebb allocator: out of global ids",
            AllocationError::NoIdSpace => "ebb allocator: no global id space assigned",
        }
    }
}

struct GlobalIds {
    space: u16,
    free: Mutex<IdSet>,
}

pub struct EbbAllocator {
    local: Mutex<IdSet>,
    global: Once<GlobalIds>,
}

impl Default for EbbAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl EbbAllocator {
    pub fn new() -> EbbAllocator {
        EbbAllocator {
            local: Mutex::new(IdSet::with_range(FIRST_FREE_ID, FIRST_STATIC_USER_ID - 1)),
            global: Once::new(),
        }
    }

    pub fn try_allocate_local(&self) -> Result<EbbId, AllocationError> {
        let id = self.local.lock().take_lowest().ok_or(AllocationError::LocalIdsExhausted)?;
        trace!("ebb allocator: allocated local id {}", id);
        Ok(EbbId::new(id))
    }

    /// Allocates the lowest free local id.
    ///
    /// Running out of local ids is fatal.
    pub fn allocate_local(&self) -> EbbId {
        match self.try_allocate_local() {
            Ok(id) => id,
            Err(e) => {
                error!("ebb allocator: all {} local ids are in use", FIRST_STATIC_USER_ID - FIRST_FREE_ID);
                panic!("{}", <&'static str>::from(e));
            }
        }
    }

    /// Returns a local id to the pool.
    pub fn free_local(&self, id: EbbId) -> Result<(), &'static str> {
        if !(FIRST_FREE_ID..FIRST_STATIC_USER_ID).contains(&id.value()) {
            return Err("ebb allocator: id is not an allocatable local id");
        }
        if self.local.lock().insert(id.value()) {
            Ok(())
        } else {
            error!("ebb allocator: double free of {:?}", id);
            Err("ebb allocator: local id is already free")
        }
    }

    pub fn local_free_count(&self) -> usize {
        self.local.lock().len()
    }

    pub fn is_local_free(&self, id: EbbId) -> bool {
        self.local.lock().contains(id.value())
    }

    /// Assigns this node's global id space. This may only happen once.
    pub fn set_id_space(&self, space: u16) -> Result<(), &'static str> {
        if space < FIRST_GLOBAL_ID_SPACE {
            return Err("ebb allocator: id space overlaps the local ids");
        }
        let mut assigned = false;
        self.global.call_once(|| {
            assigned = true;
            let (first, last) = ebb_id::global_id_range(space);
            GlobalIds {
                space,
                free: Mutex::new(IdSet::with_range(first.value(), last.value())),
            }
        });
        if assigned {
            info!("ebb allocator: using global id space {}", space);
            Ok(())
        } else {
            Err("ebb allocator: the id space was already set")
        }
    }

    pub fn id_space(&self) -> Option<u16> {
        self.global.get().map(|g| g.space)
    }

    /// Allocates the lowest free id of this node's global id space.
    pub fn allocate_global(&self) -> Result<EbbId, AllocationError> {
        let global = self.global.get().ok_or(AllocationError::NoIdSpace)?;
        let id = global.free.lock().take_lowest()
            .ok_or(AllocationError::GlobalIdsExhausted { space: global.space })?;
        trace!("ebb allocator: allocated global id {:#X}", id);
        Ok(EbbId::new(id))
    }

    pub fn free_global(&self, id: EbbId) -> Result<(), &'static str> {
        let global = self.global.get().ok_or("ebb allocator: no global id space assigned")?;
        if id.id_space() != Some(global.space) {
            return Err("ebb allocator: id is not from this node's id space");
        }
        if global.free.lock().insert(id.value()) {
            Ok(())
        } else {
            Err("ebb allocator: global id is already free")
        }
    }
}

impl Ebb for EbbAllocator {
    fn handle_fault(id: EbbId) -> Arc<EbbAllocator> {
        shared::handle_static_fault(id)
    }
}

/// Creates a shared Ebb around `rep` under a freshly allocated local id.
pub fn create_shared<T: Ebb>(map: &LocalIdMap, rep: T) -> EbbRef<T> {
    let id = EBB_ALLOCATOR.with(|ids| ids.allocate_local());
    match shared::create(map, id, rep) {
        Ok(ebb) => ebb,
        Err(e) => {
            error!("freshly allocated {:?} is already in the local id map", id);
            panic!("{}", e);
        }
    }
}

/// Creates a multicore Ebb with the given root under a freshly allocated local id.
pub fn create_multicore<T: ebb::multicore::MulticoreEbb>(map: &LocalIdMap, root: T::Root) -> EbbRef<T> {
    let id = EBB_ALLOCATOR.with(|ids| ids.allocate_local());
    match ebb::multicore::create::<T>(map, id, root) {
        Ok(ebb) => ebb,
        Err(e) => {
            error!("freshly allocated {:?} is already in the local id map", id);
            panic!("{}", e);
        }
    }
}
