//! The spooler: a pool of workers keeping every registered view up to date.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────── requeue after minimum_cycle_duration ───┐
//!            ▼                                                          │
//! ┌────────────────────┐   dequeue   ┌──────────┐   lock + cycle   ┌────┴────┐
//! │ handler queue (mpsc)├───────────►│ worker n ├─────────────────►│ Handler │
//! └────────────────────┘             └──────────┘                  └─────────┘
//!
//! ┌──────────────┐   pushed event    ┌──────────────────────┐
//! │ Subscription ├──────────────────►│ listener (per view)  ├──► Handler::catch_up
//! └──────────────┘                   └──────────────────────┘
//! ```
//!
//! A cycle for one handler:
//!
//! 1. Acquire the view's system-scope lock as the spooler id; a lock held by
//!    another spooler skips the cycle. Workers of one spooler share the lock
//!    owner since the queue hands each handler to one worker at a time. The
//!    lock is renewed in the background and losing it cancels the cycle.
//! 2. List the instances in the log, chunk them by `concurrent_instances`
//!    and, per chunk, fetch and process events until a fetch returns fewer
//!    than `query_limit` events.
//! 3. A reduce failure that was not skipped waits `retry_failed_after` and
//!    re-queries the chunk from its cursors; any other error ends the cycle.
//! 4. A cycle that completes calls `on_success`.
//!
//! # Example
//!
//! ```ignore
//! let spooler = Spooler::new(SpoolerConfig::from_env()?, eventstore.backend().clone(), locker)
//!     .with_handler(Arc::new(ProjectionHandler::new(users, eventstore, view_store, config)));
//!
//! let handle = spooler.start();
//! // ...
//! handle.shutdown().await;
//! ```

use crate::config::SpoolerConfig;
use crate::lock::LockRenewal;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use warden_core::projection::Result;
use warden_core::{CatchUp, EventStore, Handler, InstanceId, LockError, Locker, ProjectionError};

type HandlerQueue = Arc<Mutex<mpsc::Receiver<Arc<dyn Handler>>>>;

/// Worker pool driving projection handlers.
pub struct Spooler {
    config: SpoolerConfig,
    eventstore: Arc<dyn EventStore>,
    locker: Arc<dyn Locker>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Spooler {
    /// Create a spooler reading from `eventstore` and coordinating through `locker`.
    #[must_use]
    pub fn new(config: SpoolerConfig, eventstore: Arc<dyn EventStore>, locker: Arc<dyn Locker>) -> Self {
        Self {
            config,
            eventstore,
            locker,
            handlers: Vec::new(),
        }
    }

    /// Register a handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Spawn workers and subscription listeners.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(self) -> SpoolerHandle {
        let spooler_id = self.config.spooler_id.clone().unwrap_or_else(generate_spooler_id);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(self.handlers.len().max(1));

        for handler in &self.handlers {
            // Capacity equals the number of handlers, so this cannot be full.
            let _ = queue_tx.try_send(Arc::clone(handler));
        }

        let queue: HandlerQueue = Arc::new(Mutex::new(queue_rx));
        let mut tasks = Vec::with_capacity(self.config.workers + self.handlers.len());

        for worker in 0..self.config.workers {
            let context = WorkerContext {
                worker_id: format!("{spooler_id}:{worker}"),
                locker_id: spooler_id.clone(),
                eventstore: Arc::clone(&self.eventstore),
                locker: Arc::clone(&self.locker),
                queue: Arc::clone(&queue),
                requeue: queue_tx.clone(),
                shutdown: shutdown_rx.clone(),
            };
            tasks.push(tokio::spawn(context.run()));
        }

        for handler in &self.handlers {
            if let Some(subscription) = handler.subscribe() {
                tasks.push(tokio::spawn(listen(
                    Arc::clone(handler),
                    subscription,
                    shutdown_rx.clone(),
                )));
            }
        }

        tracing::info!(
            spooler = %spooler_id,
            workers = self.config.workers,
            handlers = self.handlers.len(),
            "Spooler started"
        );

        SpoolerHandle {
            spooler_id,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle to a running spooler.
#[derive(Debug)]
pub struct SpoolerHandle {
    spooler_id: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SpoolerHandle {
    /// Lock owner of this spooler.
    #[must_use]
    pub fn spooler_id(&self) -> &str {
        &self.spooler_id
    }

    /// Stop workers and listeners and wait for them to exit.
    ///
    /// Running cycles are cancelled; their lock renewals stop and the locks
    /// expire on their own.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::error!(error = %error, "Spooler task failed");
            }
        }
        tracing::info!(spooler = %self.spooler_id, "Spooler stopped");
    }
}

struct WorkerContext {
    worker_id: String,
    locker_id: String,
    eventstore: Arc<dyn EventStore>,
    locker: Arc<dyn Locker>,
    queue: HandlerQueue,
    requeue: mpsc::Sender<Arc<dyn Handler>>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerContext {
    async fn run(mut self) {
        tracing::debug!(worker = %self.worker_id, "Worker started");
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    () = shutdown_requested(&mut self.shutdown) => None,
                    handler = queue.recv() => handler,
                }
            };
            let Some(handler) = next else {
                break;
            };

            let dequeued_at = Instant::now();
            self.run_handler(&handler).await;
            self.schedule(handler, dequeued_at);
        }
        tracing::debug!(worker = %self.worker_id, "Worker stopped");
    }

    fn schedule(&self, handler: Arc<dyn Handler>, dequeued_at: Instant) {
        let requeue = self.requeue.clone();
        let mut shutdown = self.shutdown.clone();
        let due = dequeued_at + handler.minimum_cycle_duration();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(due) => {
                    let _ = requeue.send(handler).await;
                }
                () = shutdown_requested(&mut shutdown) => {}
            }
        });
    }

    async fn run_handler(&self, handler: &Arc<dyn Handler>) {
        let view = handler.view_model();
        let renewal = match LockRenewal::acquire(
            Arc::clone(&self.locker),
            self.locker_id.clone(),
            view.to_string(),
            handler.lock_duration(),
        )
        .await
        {
            Ok(renewal) => renewal,
            Err(LockError::AlreadyLocked { .. }) => {
                metrics::counter!("spooler.lock.contended", "view" => view.to_string()).increment(1);
                tracing::debug!(view, worker = %self.worker_id, "View locked elsewhere, skipping cycle");
                return;
            }
            Err(error) => {
                tracing::warn!(view, worker = %self.worker_id, error = %error, "Failed to lock view");
                return;
            }
        };

        metrics::counter!("spooler.cycles", "view" => view.to_string()).increment(1);
        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = run_cycle(self.eventstore.as_ref(), handler.as_ref()) => result,
            () = renewal.token().cancelled() => Err(ProjectionError::Cancelled),
            () = shutdown_requested(&mut shutdown) => Err(ProjectionError::Cancelled),
        };
        renewal.stop();

        match result {
            Ok(()) => tracing::debug!(view, worker = %self.worker_id, "Cycle completed"),
            Err(ProjectionError::Cancelled) => {
                tracing::info!(view, worker = %self.worker_id, "Cycle cancelled");
            }
            Err(error) => {
                tracing::warn!(view, worker = %self.worker_id, error = %error, "Cycle failed");
            }
        }
    }
}

/// One full pass of a handler over every instance.
///
/// # Errors
///
/// Returns the first non-reduce error; the cursor of every instance stays
/// where the last successful event left it.
pub async fn run_cycle(eventstore: &dyn EventStore, handler: &dyn Handler) -> Result<()> {
    let instance_ids = eventstore.instance_ids().await?;
    for chunk in instance_ids.chunks(handler.concurrent_instances().max(1)) {
        process_instances(eventstore, handler, chunk).await?;
    }
    handler.on_success().await
}

async fn process_instances(
    eventstore: &dyn EventStore,
    handler: &dyn Handler,
    instance_ids: &[InstanceId],
) -> Result<()> {
    loop {
        let query = handler.event_query(instance_ids).await?;
        let events = eventstore.filter(&query).await?;

        match handler.process(&events).await {
            Ok(()) => {}
            Err(error) if error.is_reduce() => {
                tracing::debug!(
                    view = handler.view_model(),
                    error = %error,
                    "Retrying chunk after failure"
                );
                tokio::time::sleep(handler.retry_failed_after()).await;
                continue;
            }
            Err(error) => return Err(error),
        }

        if events.len() < handler.query_limit() {
            return Ok(());
        }
    }
}

async fn listen(
    handler: Arc<dyn Handler>,
    mut subscription: warden_core::Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = subscription.recv() => event,
            () = shutdown_requested(&mut shutdown) => None,
        };
        let Some(event) = event else {
            break;
        };

        match handler.catch_up(&event).await {
            Ok(CatchUp::Applied { events, sequence }) => tracing::debug!(
                view = handler.view_model(),
                instance = %event.aggregate.instance_id,
                events,
                sequence,
                "Caught up"
            ),
            Ok(CatchUp::UpToDate | CatchUp::Deferred(_)) => {}
            Err(error) => tracing::warn!(
                view = handler.view_model(),
                instance = %event.aggregate.instance_id,
                sequence = event.sequence,
                error = %error,
                "Catch-up failed"
            ),
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn generate_spooler_id() -> String {
    format!("spooler-{:08x}", rand::thread_rng().r#gen::<u32>())
}
