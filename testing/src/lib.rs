//! # Warden Testing
//!
//! Testing utilities for the Warden event log and projection engine.
//!
//! This crate provides:
//! - In-memory implementations of every storage contract
//!   ([`InMemoryEventStore`], [`InMemoryViewStore`], [`InMemoryLocker`],
//!   [`InMemoryProjectionStore`])
//! - Deterministic clocks ([`mocks::FixedClock`], [`mocks::ManualClock`])
//! - [`ProjectionTestHarness`] for read-model unit tests
//!
//! ## Example
//!
//! ```ignore
//! use warden_testing::{InMemoryEventStore, InMemoryViewStore};
//!
//! #[tokio::test]
//! async fn test_add_user() {
//!     let eventstore = Eventstore::new(Arc::new(InMemoryEventStore::new()), registry());
//!     let user = eventstore.execute(&AddUser::new("inst", "org", "u-1", "alice")).await.unwrap();
//!     assert_eq!(user.username, "alice");
//! }
//! ```

use chrono::{DateTime, Utc};
use warden_core::environment::Clock;

pub mod event_store;
pub mod projection_mocks;
pub mod view_store;

pub use event_store::InMemoryEventStore;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use projection_mocks::{InMemoryProjectionStore, ProjectionTestHarness, envelope};
pub use view_store::{InMemoryLocker, InMemoryViewStore};

/// Deterministic clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use warden_testing::mocks::FixedClock;
    /// use warden_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }

    /// A clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can advance the clock a
    /// locker or view store reads.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time = time.checked_add_signed(by).unwrap_or(*time);
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_is_new_year_2025() {
        assert_eq!(test_clock().now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn manual_clock_advances_all_clones() {
        let clock = ManualClock::default();
        let view = clock.clone();
        clock.advance(Duration::from_secs(90));
        assert_eq!(view.now() - test_clock().now(), chrono::Duration::seconds(90));
    }
}
