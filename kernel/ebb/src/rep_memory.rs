//! Charges the memory of every representative a fault handler builds to the
//! runtime's allocator.
//!
//! The allocator is reached through function pointers installed once at
//! boot, so this crate does not depend on it. Until they are installed
//! nothing is charged. A charge is taken on the core that builds the
//! representative and is released when that core unbinds.

use crate::{trans, LocalIdMap};
use core::alloc::Layout;
use spin::Once;

/// Allocates room for a representative from the allocator registered in the given map.
pub type ChargeFn = fn(&LocalIdMap, Layout) -> Result<usize, &'static str>;
/// Returns a charge taken with the matching [`ChargeFn`].
pub type ReleaseFn = fn(&LocalIdMap, usize);

static HOOKS: Once<(ChargeFn, ReleaseFn)> = Once::new();

/// Installs the functions representatives are charged with.
///
/// Only the first call has an effect.
pub fn set_rep_allocator(charge: ChargeFn, release: ReleaseFn) {
    HOOKS.call_once(|| (charge, release));
}

/// Takes the charge for one representative of type `T`.
///
/// Running out of memory for a representative is fatal.
pub(crate) fn charge<T>(map: &LocalIdMap) -> Option<usize> {
    let (charge, _) = HOOKS.get()?;
    let layout = Layout::new::<T>();
    match charge(map, layout) {
        Ok(addr) => Some(addr),
        Err(e) => {
            error!("cannot charge a {}-byte {}: {}", layout.size(), core::any::type_name::<T>(), e);
            panic!("ebb: no memory for a representative");
        }
    }
}

/// Hands a charge to the calling core if its representative was kept,
/// otherwise returns it at once.
pub(crate) fn settle(map: &LocalIdMap, charge: Option<usize>, kept: bool) {
    match charge {
        Some(addr) if kept => trans::keep_charge(addr),
        Some(addr) => release(map, addr),
        None => {}
    }
}

pub(crate) fn release(map: &LocalIdMap, addr: usize) {
    if let Some((_, release)) = HOOKS.get() {
        release(map, addr);
    }
}
