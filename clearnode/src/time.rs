//! When the `fake_time` feature is disabled, this module just re-exports [std::time::SystemTime].
//!
//! When the `fake_time` feature is enabled, an alternative fake [SystemTime] is exported, which can be paused and
//! advanced with [pause_at_epoch] and [advance]. The fake clock is per thread, so tests running in parallel do not
//! observe each other's time travel.

use std::time::Duration;

#[cfg(not(feature = "fake_time"))]
pub type SystemTime = std::time::SystemTime;

#[cfg(feature = "fake_time")]
pub use time_impl::*;

/// Seconds since the Unix epoch.
pub fn unix_secs() -> u64 {
    since_epoch().as_secs()
}

/// Milliseconds since the Unix epoch. Used for RPC envelope timestamps.
pub fn unix_millis() -> u64 {
    since_epoch().as_millis() as u64
}

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
}

#[cfg(feature = "fake_time")]
mod time_impl {
    use std::{cell::Cell, time::Duration};

    thread_local! {
        static CURRENT_TIME: Cell<Option<Duration>> = const { Cell::new(None) };
    }

    /// A fake implementation of [std::time::SystemTime]. While paused, `SystemTime::now` only moves when [advance] is
    /// called.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SystemTime(std::time::SystemTime);

    impl SystemTime {
        pub const UNIX_EPOCH: SystemTime = SystemTime(std::time::SystemTime::UNIX_EPOCH);

        pub fn now() -> Self {
            match CURRENT_TIME.get() {
                Some(current) => SystemTime(std::time::SystemTime::UNIX_EPOCH + current),
                None => SystemTime(std::time::SystemTime::now()),
            }
        }

        pub fn duration_since(
            &self,
            earlier: SystemTime,
        ) -> Result<Duration, std::time::SystemTimeError> {
            self.0.duration_since(earlier.0)
        }
    }

    /// Stops the clock of the current thread at `offset` after the epoch.
    pub fn pause_at_epoch(offset: Duration) {
        CURRENT_TIME.set(Some(offset));
    }

    /// Advances the paused clock of the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the clock is not paused.
    pub fn advance(duration: Duration) {
        let current = CURRENT_TIME
            .get()
            .expect("time must be paused before it can be advanced");
        CURRENT_TIME.set(Some(current + duration));
    }
}
