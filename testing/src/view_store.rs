//! In-memory projection bookkeeping: cursors, failures and the lock table.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use crate::mocks::test_clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use warden_core::environment::Clock;
use warden_core::projection::{BoxFuture, Result};
use warden_core::{FailedEvent, InstanceId, LockError, Locker, ViewStore};

type CursorKey = (String, InstanceId);
type FailureKey = (String, InstanceId, u64);

#[derive(Default)]
struct Views {
    cursors: HashMap<CursorKey, u64>,
    failures: HashMap<FailureKey, FailedEvent>,
    last_runs: HashMap<String, DateTime<Utc>>,
}

/// In-memory [`ViewStore`].
///
/// Clones share state, so a test can keep a clone for assertions while the
/// handler owns another.
#[derive(Clone)]
pub struct InMemoryViewStore {
    views: Arc<RwLock<Views>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryViewStore {
    /// Create an empty view store stamping failures with [`test_clock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty view store stamping failures with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            views: Arc::new(RwLock::new(Views::default())),
            clock,
        }
    }

    /// Cursor of `(view, instance)` without going through the async trait.
    #[must_use]
    pub fn cursor(&self, view: &str, instance_id: &InstanceId) -> u64 {
        self.views
            .read()
            .unwrap()
            .cursors
            .get(&(view.to_string(), instance_id.clone()))
            .copied()
            .unwrap_or_default()
    }

    /// Set a cursor directly, e.g. to simulate another processor.
    pub fn set_cursor(&self, view: &str, instance_id: &InstanceId, sequence: u64) {
        self.views
            .write()
            .unwrap()
            .cursors
            .insert((view.to_string(), instance_id.clone()), sequence);
    }

    fn advance(&self, view: &str, instance_id: &InstanceId, sequence: u64, clear_failure: bool) {
        let mut views = self.views.write().unwrap();
        let cursor = views
            .cursors
            .entry((view.to_string(), instance_id.clone()))
            .or_default();
        *cursor = (*cursor).max(sequence);
        if clear_failure {
            views
                .failures
                .remove(&(view.to_string(), instance_id.clone(), sequence));
        }
    }
}

impl Default for InMemoryViewStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewStore for InMemoryViewStore {
    fn current_sequence<'a>(&'a self, view: &'a str, instance_id: &'a InstanceId) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move { Ok(self.cursor(view, instance_id)) })
    }

    fn current_sequences<'a>(
        &'a self,
        view: &'a str,
        instance_ids: &'a [InstanceId],
    ) -> BoxFuture<'a, Result<HashMap<InstanceId, u64>>> {
        Box::pin(async move {
            Ok(instance_ids
                .iter()
                .map(|id| (id.clone(), self.cursor(view, id)))
                .collect())
        })
    }

    fn mark_processed<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.advance(view, instance_id, sequence, true);
            Ok(())
        })
    }

    fn skip_event<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.advance(view, instance_id, sequence, false);
            Ok(())
        })
    }

    fn record_failure<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
        error_message: &'a str,
    ) -> BoxFuture<'a, Result<FailedEvent>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut views = self.views.write().unwrap();
            let failed = views
                .failures
                .entry((view.to_string(), instance_id.clone(), sequence))
                .or_insert_with(|| FailedEvent {
                    view_name: view.to_string(),
                    instance_id: instance_id.clone(),
                    failed_sequence: sequence,
                    failure_count: 0,
                    error_message: String::new(),
                    last_failed: now,
                });
            failed.failure_count += 1;
            failed.error_message = error_message.to_string();
            failed.last_failed = now;
            Ok(failed.clone())
        })
    }

    fn failed_event<'a>(
        &'a self,
        view: &'a str,
        instance_id: &'a InstanceId,
        sequence: u64,
    ) -> BoxFuture<'a, Result<Option<FailedEvent>>> {
        Box::pin(async move {
            Ok(self
                .views
                .read()
                .unwrap()
                .failures
                .get(&(view.to_string(), instance_id.clone(), sequence))
                .cloned())
        })
    }

    fn failed_events<'a>(&'a self, view: &'a str) -> BoxFuture<'a, Result<Vec<FailedEvent>>> {
        Box::pin(async move {
            let mut failed: Vec<FailedEvent> = self
                .views
                .read()
                .unwrap()
                .failures
                .values()
                .filter(|f| f.view_name == view)
                .cloned()
                .collect();
            failed.sort_by(|a, b| {
                (&a.instance_id, a.failed_sequence).cmp(&(&b.instance_id, b.failed_sequence))
            });
            Ok(failed)
        })
    }

    fn record_success<'a>(&'a self, view: &'a str, at: DateTime<Utc>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.views
                .write()
                .unwrap()
                .last_runs
                .insert(view.to_string(), at);
            Ok(())
        })
    }

    fn last_successful_run<'a>(&'a self, view: &'a str) -> BoxFuture<'a, Result<Option<DateTime<Utc>>>> {
        Box::pin(async move { Ok(self.views.read().unwrap().last_runs.get(view).copied()) })
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    locker_id: String,
    locked_until: DateTime<Utc>,
}

/// In-memory lock table.
///
/// Expiry is evaluated against the injected clock, so tests can expire a lock
/// by advancing a [`ManualClock`](crate::mocks::ManualClock).
#[derive(Clone)]
pub struct InMemoryLocker {
    locks: Arc<RwLock<HashMap<(String, String), LockEntry>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLocker {
    /// Create an empty lock table reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Current holder of `(view, scope)`, if the lock is unexpired.
    #[must_use]
    pub fn holder(&self, view: &str, instance_scope: &str) -> Option<String> {
        let now = self.clock.now();
        self.locks
            .read()
            .unwrap()
            .get(&(view.to_string(), instance_scope.to_string()))
            .filter(|entry| entry.locked_until > now)
            .map(|entry| entry.locker_id.clone())
    }
}

impl Locker for InMemoryLocker {
    fn renew<'a>(
        &'a self,
        locker_id: &'a str,
        view: &'a str,
        lock_duration: Duration,
        instance_scope: &'a str,
    ) -> BoxFuture<'a, std::result::Result<(), LockError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let duration = chrono::Duration::from_std(lock_duration)
                .map_err(|e| LockError::Storage(e.to_string()))?;
            let mut locks = self.locks.write().unwrap();
            let key = (view.to_string(), instance_scope.to_string());

            if let Some(entry) = locks.get(&key) {
                if entry.locker_id != locker_id && entry.locked_until > now {
                    return Err(LockError::AlreadyLocked {
                        view: view.to_string(),
                        scope: instance_scope.to_string(),
                    });
                }
            }

            locks.insert(
                key,
                LockEntry {
                    locker_id: locker_id.to_string(),
                    locked_until: now + duration,
                },
            );
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::mocks::ManualClock;
    use warden_core::SYSTEM_SCOPE;

    #[tokio::test]
    async fn cursor_never_regresses() {
        let store = InMemoryViewStore::new();
        let instance = InstanceId::new("inst");

        store.mark_processed("users", &instance, 5).await.unwrap();
        store.mark_processed("users", &instance, 3).await.unwrap();
        assert_eq!(store.current_sequence("users", &instance).await.unwrap(), 5);

        let cursors = store
            .current_sequences("users", &[instance.clone(), InstanceId::new("other")])
            .await
            .unwrap();
        assert_eq!(cursors.get(&InstanceId::new("other")), Some(&0));
    }

    #[tokio::test]
    async fn skip_keeps_failure_record_and_success_clears_it() {
        let store = InMemoryViewStore::new();
        let instance = InstanceId::new("inst");

        let first = store.record_failure("users", &instance, 7, "boom").await.unwrap();
        let second = store.record_failure("users", &instance, 7, "bang").await.unwrap();
        assert_eq!(first.failure_count, 1);
        assert_eq!(second.failure_count, 2);
        assert_eq!(second.error_message, "bang");

        store.skip_event("users", &instance, 7).await.unwrap();
        assert_eq!(store.cursor("users", &instance), 7);
        assert!(store.failed_event("users", &instance, 7).await.unwrap().is_some());

        store.record_failure("users", &instance, 8, "boom").await.unwrap();
        store.mark_processed("users", &instance, 8).await.unwrap();
        assert!(store.failed_event("users", &instance, 8).await.unwrap().is_none());
        assert_eq!(store.failed_events("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_expiry() {
        let clock = Arc::new(ManualClock::default());
        let locker = InMemoryLocker::new(clock.clone());
        let ttl = Duration::from_secs(10);

        locker.renew("w1", "users", ttl, SYSTEM_SCOPE).await.unwrap();
        locker.renew("w1", "users", ttl, SYSTEM_SCOPE).await.unwrap();
        assert!(matches!(
            locker.renew("w2", "users", ttl, SYSTEM_SCOPE).await,
            Err(LockError::AlreadyLocked { .. })
        ));

        clock.advance(Duration::from_secs(11));
        locker.renew("w2", "users", ttl, SYSTEM_SCOPE).await.unwrap();
        assert_eq!(locker.holder("users", SYSTEM_SCOPE).as_deref(), Some("w2"));
    }
}
