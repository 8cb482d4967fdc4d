//! The runtime's clocks.
//!
//! [`monotonic_time()`] counts from the first time any clock is read and is
//! shared by every core, so readings are comparable across cores and never
//! go backwards. [`real_time()`] is wall-clock time since the Unix epoch.

use core::ops::{Add, AddAssign, Sub};
use spin::Once;

pub use core::time::Duration;

#[cfg(test)]
mod test;

static BOOT: Once<std::time::Instant> = Once::new();

/// Returns the time elapsed since the clock was first read.
pub fn monotonic_time() -> Duration {
    BOOT.call_once(std::time::Instant::now).elapsed()
}

/// Returns the wall-clock time since the Unix epoch.
pub fn real_time() -> Duration {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// A point on the monotonic clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(Duration);

impl Instant {
    pub const ZERO: Instant = Instant(Duration::ZERO);

    /// Returns the current time.
    pub fn now() -> Instant {
        Instant(monotonic_time())
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// Returns the time left until `self`, or zero if it has passed.
    pub fn saturating_duration_until(&self) -> Duration {
        self.saturating_duration_since(Instant::now())
    }

    pub fn since_boot(&self) -> Duration {
        self.0
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(rhs))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

/// Returns the current time. Shorthand for [`Instant::now()`].
pub fn now() -> Instant {
    Instant::now()
}
