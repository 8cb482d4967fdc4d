//! An abstraction for querying about CPUs (cores).
//!
//! In the hosted runtime every core is an OS thread. A core thread binds
//! itself with [`bind_current()`] before it runs any runtime code; from then on
//! [`current_cpu()`] and [`current_node()`] identify it, playing the role of
//! the per-core register that holds this information on bare metal.

use core::{cell::Cell, fmt};
use derive_more::{Binary, Display, LowerHex, Octal, UpperHex};
use kernel_config::scheduler::MAX_CPUS;
use memory_structs::Nid;

#[cfg(test)]
mod test;

/// A unique identifier for a core, numbered densely from zero.
#[derive(
    Clone, Copy, Display, PartialEq, Eq, PartialOrd, Ord,
    Hash, Binary, Octal, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// Returns `None` if `id` is beyond the number of supported cores.
    pub const fn new(id: u32) -> Option<CpuId> {
        if (id as usize) < MAX_CPUS {
            Some(CpuId(id))
        } else {
            None
        }
    }

    /// The first core to run after boot.
    pub const fn bootstrap() -> CpuId {
        CpuId(0)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns this core's index into per-core tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl From<CpuId> for usize {
    fn from(cpu: CpuId) -> usize {
        cpu.index()
    }
}

#[derive(Clone, Copy)]
struct Binding {
    cpu: CpuId,
    node: Nid,
}

thread_local! {
    static CURRENT: Cell<Option<Binding>> = Cell::new(None);
}

/// Binds the calling thread to the given core, which lives on NUMA node `node`.
///
/// A thread may be bound once; rebinding to the same core is a no-op.
pub fn bind_current(cpu: CpuId, node: Nid) -> Result<(), &'static str> {
    CURRENT.with(|current| match current.get() {
        Some(b) if b.cpu == cpu => Ok(()),
        Some(_) => Err("bind_current(): thread is already bound to a different core"),
        None => {
            current.set(Some(Binding { cpu, node }));
            log::trace!("thread {:?} bound to {:?} on {}", std::thread::current().id(), cpu, node);
            Ok(())
        }
    })
}

/// Removes the calling thread's core binding, e.g., when a core shuts down.
pub fn unbind_current() {
    CURRENT.with(|current| current.set(None));
}

/// Returns the ID of the currently executing core, if this thread is a core.
pub fn try_current_cpu() -> Option<CpuId> {
    CURRENT.with(|current| current.get().map(|b| b.cpu))
}

/// Returns the ID of the currently executing core.
///
/// Runtime code only ever runs on a bound core thread, so calling this
/// anywhere else is a bug.
pub fn current_cpu() -> CpuId {
    match try_current_cpu() {
        Some(cpu) => cpu,
        None => panic!("current_cpu(): the calling thread is not a runtime core"),
    }
}

/// Returns the NUMA node of the currently executing core.
pub fn current_node() -> Nid {
    match CURRENT.with(|current| current.get()) {
        Some(b) => b.node,
        None => panic!("current_node(): the calling thread is not a runtime core"),
    }
}

/// Returns true if the currently executing core is the bootstrap core.
pub fn is_bootstrap_cpu() -> bool {
    try_current_cpu() == Some(CpuId::bootstrap())
}
