//! Elastic building blocks: location-transparent objects named by an [`EbbId`].
//!
//! An [`EbbRef`] is just an id. Calling [`EbbRef::with()`] looks the id up in
//! the calling core's translation table; a hit lends the cached
//! representative to the closure without taking a lock or touching a
//! reference count. [`EbbRef::get()`] returns an owned `Arc` instead. A miss
//! calls the Ebb's
//! [`Ebb::handle_fault()`], which finds or builds the representative for this
//! core, caches it with [`EbbRef::cache_ref()`] and returns it.
//!
//! Representatives are owned by the translation tables and the local id map
//! and live until the runtime tears the core down. Each one a fault handler
//! builds is charged to the allocator installed with [`set_rep_allocator()`].
//!
//! The [`shared`] and [`multicore`] modules implement the two common fault
//! handlers: one representative for every core, or one per core around a
//! shared root.

#[macro_use] extern crate log;

pub mod multicore;
mod rep_memory;
pub mod shared;
mod trans;

pub use ebb_id::EbbId;
pub use local_id_map::{LocalIdMap, RootData};
pub use rep_memory::{set_rep_allocator, ChargeFn, ReleaseFn};
pub use trans::{bind_core, cached_count, charge_count, local_id_map, try_local_id_map, unbind_core};

use core::{any::Any, fmt, marker::PhantomData};
use std::sync::Arc;

/// An object reachable through an [`EbbRef`].
pub trait Ebb: Any + Send + Sync + Sized {
    /// Produces the calling core's representative of `id` after a translation miss.
    ///
    /// Implementations should cache the result with [`EbbRef::cache_ref()`]
    /// so that later calls hit.
    fn handle_fault(id: EbbId) -> Arc<Self>;
}

/// A typed reference to the Ebb named `id`.
pub struct EbbRef<T> {
    id: EbbId,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for EbbRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for EbbRef<T> {}

impl<T> PartialEq for EbbRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for EbbRef<T> {}

impl<T> fmt::Debug for EbbRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EbbRef<{}>({:?})", core::any::type_name::<T>(), self.id)
    }
}

impl<T> EbbRef<T> {
    pub const fn new(id: EbbId) -> EbbRef<T> {
        EbbRef { id, _type: PhantomData }
    }

    pub const fn id(&self) -> EbbId {
        self.id
    }
}

impl<T: Ebb> EbbRef<T> {
    /// Runs `f` on the calling core's representative.
    ///
    /// A hit borrows the cached representative in place. Only a miss goes
    /// through [`Ebb::handle_fault()`] and its `Arc`.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let pin = trans::PinGuard::new();
        match trans::lookup_ptr::<T>(self.id) {
            // SAFETY: cached representatives are never replaced, and the table
            // that owns them is not dropped while `pin` is alive.
            Some(rep) => f(unsafe { &*rep }),
            None => {
                drop(pin);
                trace!("translation miss on {:?}", self.id);
                let rep = T::handle_fault(self.id);
                f(&rep)
            }
        }
    }

    /// Returns the calling core's representative.
    pub fn get(&self) -> Arc<T> {
        match self.cached() {
            Some(rep) => rep,
            None => {
                trace!("translation miss on {:?}", self.id);
                T::handle_fault(self.id)
            }
        }
    }

    /// Returns the calling core's representative if it is already cached.
    pub fn cached(&self) -> Option<Arc<T>> {
        trans::lookup(self.id).map(|rep| downcast_rep(self.id, rep))
    }

    /// Caches `rep` as the calling core's representative of `id`.
    pub fn cache_ref(id: EbbId, rep: &Arc<T>) {
        trans::cache(id, rep.clone());
    }
}

/// Converts type-erased Ebb data to `T`.
///
/// Finding data of another type under an id means two Ebb types claim the
/// same id, which is a bug.
pub fn downcast_rep<T: Any + Send + Sync>(id: EbbId, data: RootData) -> Arc<T> {
    match data.downcast::<T>() {
        Ok(rep) => rep,
        Err(_) => {
            error!("{:?} does not hold a {}", id, core::any::type_name::<T>());
            panic!("Ebb type mismatch for {:?}", id);
        }
    }
}

/// Returns the root data of `id` from the local id map, which must exist.
pub(crate) fn expect_root(map: &LocalIdMap, id: EbbId) -> RootData {
    match map.find(id) {
        Some(root) => root,
        None => {
            error!("no root found for {:?}", id);
            panic!("no root found for {:?}", id);
        }
    }
}
