//! The global id map holds the data other nodes publish about global Ebbs.
//!
//! All entries live with a frontend on one designated core. A lookup from
//! any core is sent to the frontend as a remote task, and the asking event is
//! suspended until the reply arrives. Entries are written once and then only
//! read.
//!
//! [`resolve()`] is the miss path of a [`GlobalEbb`]: it checks the local id
//! map first, then fetches the published data and builds a representative
//! from it.

#[macro_use] extern crate log;


use cpu::CpuId;
use ebb::{downcast_rep, shared, Ebb, EbbId, EbbRef, LocalIdMap};
use ebb_id::GLOBAL_ID_MAP_ID;
use event_manager::{promise, EVENT_MANAGER};
use hashbrown::{HashMap, HashSet};
use spin::Mutex;
use std::sync::Arc;

pub const GLOBAL_ID_MAP: EbbRef<GlobalIdMap> = EbbRef::new(GLOBAL_ID_MAP_ID);

/// Why a lookup found no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// Nothing is published under the id yet; a later lookup may succeed.
    NotYetPublished,
    /// The id is not a global id, or its entry was retired. Retrying will not help.
    PermanentlyAbsent,
    /// The frontend went away before replying.
    FrontendUnavailable,
}
impl From<LookupError> for &'static str {
    fn from(err: LookupError) -> &'static str {
        match err {
            LookupError::NotYetPublished => "global id map: nothing published under the id yet",
            LookupError::PermanentlyAbsent => "global id map: the id has no entry and never will",
            LookupError::FrontendUnavailable => "global id map: the frontend did not reply",
        }
    }
}

#[derive(Default)]
struct Store {
    entries: HashMap<EbbId, Vec<u8>>,
    retired: HashSet<EbbId>,
}

impl Store {
    fn lookup(&self, id: EbbId) -> Result<Vec<u8>, LookupError> {
        if let Some(data) = self.entries.get(&id) {
            return Ok(data.clone());
        }
        if self.retired.contains(&id) {
            Err(LookupError::PermanentlyAbsent)
        } else {
            Err(LookupError::NotYetPublished)
        }
    }

    fn publish(&mut self, id: EbbId, data: Vec<u8>) -> Result<(), &'static str> {
        if self.retired.contains(&id) {
            return Err("global id map: the id was retired");
        }
        if self.entries.contains_key(&id) {
            return Err("global id map: the id is already published");
        }
        self.entries.insert(id, data);
        Ok(())
    }

    fn retire(&mut self, id: EbbId) -> bool {
        self.entries.remove(&id);
        self.retired.insert(id)
    }
}

pub struct GlobalIdMap {
    frontend: CpuId,
    store: Arc<Mutex<Store>>,
}

/// Registers the global id map, served by the core `frontend`.
pub fn init(map: &LocalIdMap, frontend: CpuId) -> Result<EbbRef<GlobalIdMap>, &'static str> {
    info!("global id map: frontend on {:?}", frontend);
    shared::install(map, GLOBAL_ID_MAP_ID, Arc::new(GlobalIdMap::new(frontend)))
}

impl Ebb for GlobalIdMap {
    fn handle_fault(id: EbbId) -> Arc<GlobalIdMap> {
        shared::handle_static_fault(id)
    }
}

impl GlobalIdMap {
    pub fn new(frontend: CpuId) -> GlobalIdMap {
        GlobalIdMap { frontend, store: Arc::new(Mutex::new(Store::default())) }
    }

    pub fn frontend(&self) -> CpuId {
        self.frontend
    }

    /// Runs `request` on the frontend core and waits for its reply.
    async fn request<R, F>(&self, request: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Store) -> R + Send + 'static,
    {
        let (reply, response) = promise();
        let store = self.store.clone();
        EVENT_MANAGER.with(|em| em.spawn_remote(async move {
            let ret = request(&mut *store.lock());
            reply.set_value(ret);
        }, self.frontend));
        response.await
    }

    /// Fetches the data published under `id`.
    pub async fn get(&self, id: EbbId) -> Result<Vec<u8>, LookupError> {
        if id.is_local() {
            return Err(LookupError::PermanentlyAbsent);
        }
        let ret = self.request(move |store| store.lookup(id)).await
            .unwrap_or(Err(LookupError::FrontendUnavailable));
        if let Err(e) = ret {
            debug!("global id map: lookup of {:?} failed: {:?}", id, e);
        }
        ret
    }

    /// Publishes `data` under the global id `id`. Each id is published at most once.
    pub async fn set(&self, id: EbbId, data: Vec<u8>) -> Result<(), &'static str> {
        if id.is_local() {
            return Err("global id map: cannot publish a local id");
        }
        self.request(move |store| store.publish(id, data)).await
            .unwrap_or(Err(<&'static str>::from(LookupError::FrontendUnavailable)))
    }

    /// Removes the entry of `id` for good; later lookups report it permanently absent.
    pub async fn retire(&self, id: EbbId) -> bool {
        self.request(move |store| store.retire(id)).await.unwrap_or(false)
    }
}

/// An Ebb whose representative is built from data in the global id map.
pub trait GlobalEbb: Ebb {
    fn create_from(id: EbbId, data: &[u8]) -> Self;
}

/// Returns the calling core's representative of a [`GlobalEbb`], fetching
/// its data from the global id map if no core on this node has built one.
///
/// The representative is built without holding any lock; if another core
/// installed one first, ours is dropped and theirs is used.
pub async fn resolve<T: GlobalEbb>(ebb: EbbRef<T>) -> Result<Arc<T>, LookupError> {
    if let Some(rep) = ebb.cached() {
        return Ok(rep);
    }
    let id = ebb.id();
    let map = ebb::local_id_map();
    if let Some(root) = map.find(id) {
        let rep = downcast_rep::<T>(id, root);
        EbbRef::cache_ref(id, &rep);
        return Ok(rep);
    }

    let data = GLOBAL_ID_MAP.get().get(id).await?;
    let rep = Arc::new(T::create_from(id, &data));
    let (winner, won) = map.insert_or_get(id, rep);
    if !won {
        debug!("global id map: another core resolved {:?} first", id);
    }
    let rep = downcast_rep::<T>(id, winner);
    EbbRef::cache_ref(id, &rep);
    Ok(rep)
}

/// The fault handler of a [`GlobalEbb`]: the representative must already
/// have been brought in with [`resolve()`].
pub fn handle_fault<T: GlobalEbb>(id: EbbId) -> Arc<T> {
    shared::handle_static_fault(id)
}
