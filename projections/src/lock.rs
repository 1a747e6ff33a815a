//! Cycle cancellation and background lock renewal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warden_core::{LockError, Locker, SYSTEM_SCOPE};

/// Minimum pause between two renewals.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// A one-shot cancellation signal shared between a cycle and its helpers.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger the token. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether the token was triggered.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the token is triggered.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only returns once cancelled.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A held view lock kept alive by a background task.
///
/// The task renews every third of the lock duration. When a renewal fails
/// the lock is considered lost and [`LockRenewal::token`] is cancelled.
/// Dropping the guard stops the task; the lock then expires on its own.
#[derive(Debug)]
pub struct LockRenewal {
    token: CancelToken,
    task: JoinHandle<()>,
}

impl LockRenewal {
    /// Acquire the system-scope lock of `view` and start renewing it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyLocked`] if another locker holds the lock,
    /// [`LockError::Storage`] if the lock table is unreachable.
    pub async fn acquire(
        locker: Arc<dyn Locker>,
        locker_id: String,
        view: String,
        lock_duration: Duration,
    ) -> Result<Self, LockError> {
        locker
            .renew(&locker_id, &view, lock_duration, SYSTEM_SCOPE)
            .await?;

        let token = CancelToken::new();
        let task_token = token.clone();
        let interval = (lock_duration / 3).max(MIN_RENEW_INTERVAL);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = task_token.cancelled() => return,
                }
                if let Err(error) = locker
                    .renew(&locker_id, &view, lock_duration, SYSTEM_SCOPE)
                    .await
                {
                    tracing::warn!(
                        view = %view,
                        locker = %locker_id,
                        error = %error,
                        "Lost view lock, cancelling cycle"
                    );
                    task_token.cancel();
                    return;
                }
            }
        });

        Ok(Self { token, task })
    }

    /// Token cancelled when the lock is lost.
    #[must_use]
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Stop renewing.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for LockRenewal {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warden_core::projection::BoxFuture;

    /// Grants the first renewal only.
    #[derive(Default)]
    struct OneShotLocker {
        calls: AtomicUsize,
    }

    impl Locker for OneShotLocker {
        fn renew<'a>(
            &'a self,
            _locker_id: &'a str,
            _view: &'a str,
            _lock_duration: Duration,
            _instance_scope: &'a str,
        ) -> BoxFuture<'a, Result<(), LockError>> {
            Box::pin(async move {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(())
                } else {
                    Err(LockError::Storage("connection reset".to_string()))
                }
            })
        }
    }

    #[tokio::test]
    async fn failed_renewal_cancels_token() {
        let locker = Arc::new(OneShotLocker::default());
        let renewal = LockRenewal::acquire(
            locker.clone(),
            "spooler-1".to_string(),
            "projections.users".to_string(),
            Duration::from_millis(60),
        )
        .await
        .unwrap();
        assert!(!renewal.token().is_cancelled());

        let cancelled =
            tokio::time::timeout(Duration::from_secs(1), renewal.token().cancelled()).await;
        assert!(cancelled.is_ok());
        assert_eq!(locker.calls.load(Ordering::SeqCst), 2);
        renewal.stop();
    }


    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_after_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let waited = tokio::time::timeout(Duration::from_secs(1), token.cancelled()).await;
        assert!(waited.is_ok());
    }
}
