//! Multicore Ebbs: every core gets its own representative.
//!
//! The local id map holds a [`MulticoreRoot`], which carries the state all
//! representatives share and records the representative of each core.

use crate::{downcast_rep, expect_root, local_id_map, rep_memory, Ebb, EbbId, EbbRef, LocalIdMap};
use cpu::CpuId;
use spin::Mutex;
use std::{collections::BTreeMap, sync::Arc};

pub struct MulticoreRoot<T, R> {
    root: R,
    reps: Mutex<BTreeMap<CpuId, Arc<T>>>,
}

impl<T, R> MulticoreRoot<T, R> {
    pub fn new(root: R) -> MulticoreRoot<T, R> {
        MulticoreRoot { root, reps: Mutex::new(BTreeMap::new()) }
    }

    /// The state shared by all representatives.
    pub fn root(&self) -> &R {
        &self.root
    }

    /// Returns the representative of every core that has one, in core order.
    pub fn reps(&self) -> Vec<(CpuId, Arc<T>)> {
        self.reps.lock().iter().map(|(cpu, rep)| (*cpu, rep.clone())).collect()
    }

    pub fn rep(&self, cpu: CpuId) -> Option<Arc<T>> {
        self.reps.lock().get(&cpu).cloned()
    }
}

/// An Ebb with one representative per core.
pub trait MulticoreEbb: Ebb {
    type Root: Send + Sync + 'static;

    /// Builds the calling core's representative.
    fn create_rep(root: &Arc<MulticoreRoot<Self, Self::Root>>) -> Self;
}

/// Registers `root` as the root of the multicore Ebb `id`.
pub fn create<T: MulticoreEbb>(map: &LocalIdMap, id: EbbId, root: T::Root) -> Result<EbbRef<T>, &'static str> {
    let entry: Arc<MulticoreRoot<T, T::Root>> = Arc::new(MulticoreRoot::new(root));
    if map.insert(id, entry) {
        Ok(EbbRef::new(id))
    } else {
        Err("multicore Ebb: the id is already in use")
    }
}

/// Returns the root of the multicore Ebb `id`.
pub fn root_of<T: MulticoreEbb>(id: EbbId) -> Arc<MulticoreRoot<T, T::Root>> {
    downcast_rep(id, expect_root(&local_id_map(), id))
}

/// The fault handler of a [`MulticoreEbb`].
pub fn handle_fault<T: MulticoreEbb>(id: EbbId) -> Arc<T> {
    let root = root_of::<T>(id);
    fault_in(id, &root, || T::create_rep(&root))
}

/// Registers the root-less multicore Ebb `id`, whose representatives are built with `Default`.
pub fn create_static<T: Ebb + Default>(map: &LocalIdMap, id: EbbId) -> Result<EbbRef<T>, &'static str> {
    let entry: Arc<MulticoreRoot<T, ()>> = Arc::new(MulticoreRoot::new(()));
    if map.insert(id, entry) {
        Ok(EbbRef::new(id))
    } else {
        Err("multicore Ebb: the id is already in use")
    }
}

/// The fault handler of an Ebb registered with [`create_static()`].
pub fn handle_static_fault<T: Ebb + Default>(id: EbbId) -> Arc<T> {
    let root: Arc<MulticoreRoot<T, ()>> = downcast_rep(id, expect_root(&local_id_map(), id));
    fault_in(id, &root, T::default)
}

fn fault_in<T: Ebb, R, F: FnOnce() -> T>(id: EbbId, root: &MulticoreRoot<T, R>, create: F) -> Arc<T> {
    let cpu = cpu::current_cpu();
    if let Some(rep) = root.rep(cpu) {
        EbbRef::cache_ref(id, &rep);
        return rep;
    }
    let map = local_id_map();
    let charge = rep_memory::charge::<T>(&map);
    // built without the lock held
    let new_rep = Arc::new(create());
    let (rep, built) = {
        let mut reps = root.reps.lock();
        match reps.get(&cpu) {
            Some(rep) => (rep.clone(), false),
            None => {
                reps.insert(cpu, new_rep.clone());
                (new_rep, true)
            }
        }
    };
    rep_memory::settle(&map, charge, built);
    EbbRef::cache_ref(id, &rep);
    rep
}
