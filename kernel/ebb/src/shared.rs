//! Shared Ebbs: a single representative serves every core.
//!
//! The representative itself is the Ebb's entry in the local id map. On a
//! miss a core reads it from there, or if there is none yet builds one
//! without holding any lock and races to insert it. The loser of the race
//! drops its copy and uses the winner.

use crate::{downcast_rep, expect_root, local_id_map, rep_memory, Ebb, EbbId, EbbRef, LocalIdMap};
use std::sync::Arc;

/// An Ebb whose single representative can be built on demand.
pub trait SharedEbb: Ebb {
    fn create_rep(id: EbbId) -> Self;
}

/// The fault handler of a [`SharedEbb`].
pub fn handle_fault<T: SharedEbb>(id: EbbId) -> Arc<T> {
    let map = local_id_map();
    if let Some(root) = map.find(id) {
        let rep = downcast_rep::<T>(id, root);
        EbbRef::cache_ref(id, &rep);
        return rep;
    }

    let charge = rep_memory::charge::<T>(&map);
    let rep = Arc::new(T::create_rep(id));
    let (winner, won) = map.insert_or_get(id, rep.clone());
    if !won {
        debug!("lost the race to construct {:?}, using the winner", id);
    }
    rep_memory::settle(&map, charge, won);
    let rep = downcast_rep::<T>(id, winner);
    EbbRef::cache_ref(id, &rep);
    rep
}

/// Makes `rep` the representative of `id` on every core.
pub fn create<T: Ebb>(map: &LocalIdMap, id: EbbId, rep: T) -> Result<EbbRef<T>, &'static str> {
    install(map, id, Arc::new(rep))
}

/// Makes an existing `rep` the representative of `id` on every core, as is
/// done at boot for the runtime's own Ebbs under their static ids.
pub fn install<T: Ebb>(map: &LocalIdMap, id: EbbId, rep: Arc<T>) -> Result<EbbRef<T>, &'static str> {
    if map.insert(id, rep) {
        Ok(EbbRef::new(id))
    } else {
        Err("shared Ebb: the id is already in use")
    }
}

/// The fault handler of an Ebb installed with [`install()`].
///
/// Such Ebbs are never built on demand, so a missing entry is fatal.
pub fn handle_static_fault<T: Ebb>(id: EbbId) -> Arc<T> {
    let rep = downcast_rep::<T>(id, expect_root(&local_id_map(), id));
    EbbRef::cache_ref(id, &rep);
    rep
}
