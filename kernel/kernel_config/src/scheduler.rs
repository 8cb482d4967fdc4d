//! Event manager tunables.

use core::time::Duration;

/// The vector used to ask a core to drain its remote task queue.
pub const IPI_VECTOR: u8 = 32;

/// The first vector handed out by `allocate_vector`.
pub const FIRST_FREE_VECTOR: u8 = 33;

/// Cores are numbered below this, which leaves the low 24 bits of an
/// event id for the per-core counter.
pub const MAX_CPUS: usize = 256;

/// Bits of an event id taken by the per-core counter.
pub const EVENT_ID_CPU_SHIFT: u32 = 24;

/// How long a halted core with pending RCU callbacks sleeps before
/// re-checking the grace period.
pub const RCU_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long a halted core sleeps when nothing else will wake it.
pub const HALT_TIMEOUT: Duration = Duration::from_millis(50);
