//! The local id map, which holds the root data of every Ebb known on this node.
//!
//! Entries are written at most once: the first insert for an id wins and every
//! later insert is refused, so a core that raced another to construct an
//! Ebb's root discards its copy and reads the winner's.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
mod test;

use alloc::sync::Arc;
use core::any::Any;
use ebb_id::EbbId;
use hashbrown::HashMap;
use spin::RwLock;

/// The type-erased data stored for an Ebb.
pub type RootData = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct LocalIdMap {
    map: RwLock<HashMap<EbbId, RootData>>,
}

impl LocalIdMap {
    pub fn new() -> LocalIdMap {
        LocalIdMap::default()
    }

    /// Returns the data stored for `id`.
    pub fn find(&self, id: EbbId) -> Option<RootData> {
        self.map.read().get(&id).cloned()
    }

    /// Returns the data stored for `id` if it has type `T`.
    pub fn find_as<T: Any + Send + Sync>(&self, id: EbbId) -> Option<Arc<T>> {
        self.find(id).and_then(|data| data.downcast::<T>().ok())
    }

    /// Stores `data` for `id` unless the id already has data.
    ///
    /// Returns true if this insert won.
    pub fn insert(&self, id: EbbId, data: RootData) -> bool {
        let mut map = self.map.write();
        if map.contains_key(&id) {
            debug!("local id map: {:?} already has root data, insert refused", id);
            return false;
        }
        map.insert(id, data);
        true
    }

    /// Stores `data` for `id` unless the id already has data,
    /// and returns whichever data ended up stored along with whether this insert won.
    pub fn insert_or_get(&self, id: EbbId, data: RootData) -> (RootData, bool) {
        let mut map = self.map.write();
        match map.get(&id) {
            Some(existing) => {
                debug!("local id map: lost the race to store {:?}", id);
                (existing.clone(), false)
            }
            None => {
                map.insert(id, data.clone());
                (data, true)
            }
        }
    }

    /// Removes the data for `id`.
    pub fn erase(&self, id: EbbId) -> Option<RootData> {
        self.map.write().remove(&id)
    }

    pub fn contains(&self, id: EbbId) -> bool {
        self.map.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
