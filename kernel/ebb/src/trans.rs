//! The per-core translation table.
//!
//! Each core caches its representative of every Ebb it has used. Local ids
//! index a vector directly; global ids, which are sparse, go through a map.
//! Only the owning core ever touches its table, so lookups take no lock.
//!
//! Slots are written once and the representatives they hold are only dropped
//! when the core unbinds, so a hit may hand out a plain reference to the
//! representative for as long as a [`PinGuard`] is held.

use core::{any::Any, cell::{Cell, RefCell}};
use ebb_id::EbbId;
use hashbrown::HashMap;
use local_id_map::{LocalIdMap, RootData};
use std::sync::Arc;

struct CoreTable {
    local_id_map: Arc<LocalIdMap>,
    local: Vec<Option<RootData>>,
    global: HashMap<EbbId, RootData>,
    /// Charges for the representatives this core built.
    charges: Vec<usize>,
}

thread_local! {
    static TABLE: RefCell<Option<CoreTable>> = RefCell::new(None);
    /// Number of live [`PinGuard`]s on this core.
    static PINS: Cell<usize> = Cell::new(0);
}

/// Keeps the calling core's representatives alive while references to them are in use.
pub(crate) struct PinGuard(());

impl PinGuard {
    pub(crate) fn new() -> PinGuard {
        PINS.with(|pins| pins.set(pins.get() + 1));
        PinGuard(())
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        PINS.with(|pins| pins.set(pins.get() - 1));
    }
}

/// Gives the calling core an empty translation table backed by `local_id_map`.
pub fn bind_core(local_id_map: Arc<LocalIdMap>) -> Result<(), &'static str> {
    TABLE.with(|table| {
        let mut table = table.borrow_mut();
        if table.is_some() {
            return Err("ebb::bind_core(): this core already has a translation table");
        }
        *table = Some(CoreTable { local_id_map, local: Vec::new(), global: HashMap::new(), charges: Vec::new() });
        Ok(())
    })
}

/// Drops the calling core's translation table and every representative it holds.
///
/// Unbinding while a representative is borrowed through [`crate::EbbRef::with()`] is fatal.
pub fn unbind_core() {
    let pins = PINS.with(|pins| pins.get());
    if pins != 0 {
        error!("unbind_core(): {} representatives are still borrowed", pins);
        panic!("ebb::unbind_core(): representatives are still borrowed");
    }
    // take it out first so representative destructors may use the table
    let old = TABLE.with(|table| table.borrow_mut().take());
    if let Some(old) = old.as_ref() {
        for &addr in old.charges.iter() {
            crate::rep_memory::release(&old.local_id_map, addr);
        }
    }
    drop(old);
}

/// Keeps a representative's charge until the calling core unbinds.
pub(crate) fn keep_charge(addr: usize) {
    TABLE.with(|table| match table.borrow_mut().as_mut() {
        Some(table) => table.charges.push(addr),
        None => error!("no translation table to keep charge {:#X} in", addr),
    });
}

/// Number of representative charges the calling core holds.
pub fn charge_count() -> usize {
    TABLE.with(|table| table.borrow().as_ref().map_or(0, |t| t.charges.len()))
}

/// Returns the local id map of the calling core.
pub fn try_local_id_map() -> Option<Arc<LocalIdMap>> {
    TABLE.with(|table| table.borrow().as_ref().map(|t| t.local_id_map.clone()))
}

/// Returns the local id map of the calling core.
///
/// Ebbs are only usable on a core brought up by the runtime.
pub fn local_id_map() -> Arc<LocalIdMap> {
    match try_local_id_map() {
        Some(map) => map,
        None => {
            error!("no Ebb translation table on this thread");
            panic!("ebb::local_id_map(): the calling thread is not a runtime core");
        }
    }
}

pub(crate) fn lookup(id: EbbId) -> Option<RootData> {
    TABLE.with(|table| {
        let table = table.borrow();
        let table = table.as_ref()?;
        if id.is_local() {
            table.local.get(id.index()).and_then(|slot| slot.clone())
        } else {
            table.global.get(&id).cloned()
        }
    })
}

/// Returns a pointer to the cached representative of `id` without cloning it.
///
/// The pointer stays valid until the core unbinds.
pub(crate) fn lookup_ptr<T: Any + Send + Sync>(id: EbbId) -> Option<*const T> {
    TABLE.with(|table| {
        let table = table.borrow();
        let table = table.as_ref()?;
        let slot = if id.is_local() {
            table.local.get(id.index())?.as_ref()?
        } else {
            table.global.get(&id)?
        };
        match slot.downcast_ref::<T>() {
            Some(rep) => Some(rep as *const T),
            None => {
                error!("{:?} does not hold a {}", id, core::any::type_name::<T>());
                panic!("Ebb type mismatch for {:?}", id);
            }
        }
    })
}

/// Stores `rep` as the calling core's representative of `id`.
///
/// A slot is written once; caching a different representative is a bug.
pub(crate) fn cache(id: EbbId, rep: RootData) {
    let conflict = TABLE.with(|table| {
        let mut table = table.borrow_mut();
        let table = match table.as_mut() {
            Some(t) => t,
            None => return Some("no translation table on this thread"),
        };
        let existing = if id.is_local() {
            if table.local.len() <= id.index() {
                table.local.resize(id.index() + 1, None);
            }
            table.local[id.index()].get_or_insert_with(|| rep.clone())
        } else {
            table.global.entry(id).or_insert_with(|| rep.clone())
        };
        if Arc::ptr_eq(existing, &rep) {
            None
        } else {
            Some("a different representative is already cached")
        }
    });
    if let Some(reason) = conflict {
        error!("cannot cache {:?}: {}", id, reason);
        panic!("ebb translation table: {}", reason);
    }
}

/// Number of representatives the calling core has cached.
pub fn cached_count() -> usize {
    TABLE.with(|table| {
        table.borrow().as_ref().map_or(0, |t| t.local.iter().filter(|s| s.is_some()).count() + t.global.len())
    })
}
