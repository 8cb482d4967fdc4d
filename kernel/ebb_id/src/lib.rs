//! Ebb identifiers.
//!
//! Every Ebb is named by an [`EbbId`]. Ids below [`FIRST_FREE_ID`] belong to
//! the runtime's own Ebbs and are the same on every node. Ids up to
//! [`LAST_LOCAL_ID`] are allocated per node, and ids above that belong to a
//! global id space handed to a node when it joins.

#![no_std]

#[cfg(test)]
mod test;

use core::fmt;
use derive_more::{Display, LowerHex, UpperHex};
pub use kernel_config::ebb::{FIRST_LOCAL_ID, FIRST_STATIC_USER_ID, ID_SPACE_SHIFT, LAST_LOCAL_ID};

/// The name of an Ebb, valid on every core.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, LowerHex, UpperHex)]
#[display(fmt = "ebb{}", _0)]
#[repr(transparent)]
pub struct EbbId(u32);

impl EbbId {
    pub const fn new(id: u32) -> EbbId {
        EbbId(id)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns this id's index into a per-core translation table.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns true if this id lies in the per-node id range.
    pub const fn is_local(self) -> bool {
        self.0 <= LAST_LOCAL_ID
    }

    /// Returns true if this id is one of the runtime's own static ids.
    pub const fn is_static(self) -> bool {
        self.0 < FIRST_FREE_ID
    }

    /// Returns the global id space this id belongs to, if it is a global id.
    pub const fn id_space(self) -> Option<u16> {
        if self.is_local() {
            None
        } else {
            Some((self.0 >> ID_SPACE_SHIFT) as u16)
        }
    }
}

impl fmt::Debug for EbbId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match static_name(*self) {
            Some(name) => write!(f, "EbbId({}:{})", self.0, name),
            None => write!(f, "EbbId({})", self.0),
        }
    }
}

impl From<EbbId> for u32 {
    fn from(id: EbbId) -> u32 {
        id.0
    }
}

macro_rules! static_ids {
    ($($(#[$attr:meta])* $name:ident = $value:expr;)*) => {
        $(
            $(#[$attr])*
            pub const $name: EbbId = EbbId::new(FIRST_LOCAL_ID + $value);
        )*

        /// Returns the name of a static id.
        pub fn static_name(id: EbbId) -> Option<&'static str> {
            match id {
                $( $name => Some(stringify!($name)), )*
                _ => None,
            }
        }
    };
}

static_ids! {
    PAGE_ALLOCATOR_ID = 0;
    GP_ALLOCATOR_ID = 1;
    LOCAL_ID_MAP_ID = 2;
    EBB_ALLOCATOR_ID = 3;
    EVENT_MANAGER_ID = 4;
    VMEM_ALLOCATOR_ID = 5;
    TIMER_ID = 6;
    GLOBAL_ID_MAP_ID = 7;
}

/// The first id handed out by the local id allocator.
pub const FIRST_FREE_ID: u32 = FIRST_LOCAL_ID + 8;

/// Returns the inclusive bounds of global id space `space`.
pub const fn global_id_range(space: u16) -> (EbbId, EbbId) {
    let base = (space as u32) << ID_SPACE_SHIFT;
    (EbbId(base), EbbId(base | ((1 << ID_SPACE_SHIFT) - 1)))
}
