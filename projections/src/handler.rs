//! `ProjectionHandler`: the [`Handler`] base every read model is driven through.
//!
//! A handler composes a typed [`Projection`] with the pieces the spooler needs:
//!
//! - the [`Eventstore`] to read and decode events and to subscribe to pushes
//! - the [`ViewStore`] holding the view's cursors and failure ledger
//! - the view's [`HandlerConfig`]
//!
//! # Failure handling
//!
//! A reduce failure increments the event's `FailedEvent` counter. Below
//! `error_count_until_skip` the error is returned and the spooler retries the
//! chunk after `retry_failed_after`; once the counter reaches the threshold
//! the cursor is force-advanced past the event and its record is kept for
//! audit.
//!
//! # Catch-up
//!
//! A pushed event triggers a burst that reduces the unprocessed range
//! `(cursor, event.sequence]` of the event's instance. The burst gives up as
//! soon as anything looks off (too many events, a concurrently moved cursor,
//! a failing reducer) and leaves the work to the next scheduled run.

use crate::config::HandlerConfig;
use std::sync::Arc;
use std::time::Duration;
use warden_core::environment::{Clock, SystemClock};
use warden_core::projection::{BoxFuture, Result};
use warden_core::{
    AggregateType, CatchUp, DeferReason, Eventstore, Handler, InstanceId, Projection,
    ProjectionError, QueryFilter, SearchQuery, StoredEvent, Subscription, ViewStore,
};

/// Drives a [`Projection`] as a spooler [`Handler`].
pub struct ProjectionHandler<P: Projection> {
    projection: Arc<P>,
    eventstore: Eventstore<P::Event>,
    view_store: Arc<dyn ViewStore>,
    clock: Arc<dyn Clock>,
    config: HandlerConfig,
    view_model: String,
    aggregate_types: Vec<AggregateType>,
}

impl<P: Projection> ProjectionHandler<P> {
    /// Create a handler for `projection`.
    #[must_use]
    pub fn new(
        projection: P,
        eventstore: Eventstore<P::Event>,
        view_store: Arc<dyn ViewStore>,
        config: HandlerConfig,
    ) -> Self {
        let view_model = projection.name().to_string();
        let aggregate_types = projection.aggregate_types();
        Self {
            projection: Arc::new(projection),
            eventstore,
            view_store,
            clock: Arc::new(SystemClock),
            config,
            view_model,
            aggregate_types,
        }
    }

    /// Use `clock` for run timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The wrapped projection.
    #[must_use]
    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// The handler's configuration.
    #[must_use]
    pub const fn config(&self) -> &HandlerConfig {
        &self.config
    }

    fn instance_filter(&self, instance_id: &InstanceId, cursor: u64) -> QueryFilter {
        QueryFilter::new()
            .instance(instance_id.clone())
            .aggregate_types(self.aggregate_types.iter().cloned())
            .sequence_greater(cursor)
    }

    async fn reduce_event(&self, event: &StoredEvent) -> Result<()> {
        let reduce_error = |reason: String| ProjectionError::Reduce {
            instance_id: event.aggregate.instance_id.clone(),
            sequence: event.sequence,
            reason,
        };

        let envelope = match self.eventstore.registry().decode(event) {
            Ok(Some(envelope)) => envelope,
            // Not registered: nothing to apply, the cursor still advances.
            Ok(None) => return Ok(()),
            Err(e) => return Err(reduce_error(e.to_string())),
        };

        self.projection
            .reduce(&envelope)
            .await
            .map_err(|e| match e {
                ProjectionError::Reduce { .. } => e,
                other => reduce_error(other.to_string()),
            })
    }

    async fn handle_error(&self, event: &StoredEvent, error: ProjectionError) -> Result<()> {
        if !error.is_reduce() {
            return Err(error);
        }

        let instance_id = &event.aggregate.instance_id;
        let failed = self
            .view_store
            .record_failure(&self.view_model, instance_id, event.sequence, &error.to_string())
            .await?;
        metrics::counter!("projection.events.failed", "view" => self.view_model.clone())
            .increment(1);

        if failed.failure_count < self.config.error_count_until_skip {
            tracing::warn!(
                view = %self.view_model,
                instance = %instance_id,
                sequence = event.sequence,
                failures = failed.failure_count,
                error = %error,
                "Failed to reduce event, will retry"
            );
            return Err(error);
        }

        self.view_store
            .skip_event(&self.view_model, instance_id, event.sequence)
            .await?;
        metrics::counter!("projection.events.skipped", "view" => self.view_model.clone())
            .increment(1);
        tracing::error!(
            view = %self.view_model,
            instance = %instance_id,
            sequence = event.sequence,
            failures = failed.failure_count,
            error = %error,
            "Skipping event after repeated failures"
        );
        Ok(())
    }

    async fn process_events(&self, events: &[StoredEvent]) -> Result<()> {
        for event in events {
            match self.reduce_event(event).await {
                Ok(()) => {
                    self.view_store
                        .mark_processed(&self.view_model, &event.aggregate.instance_id, event.sequence)
                        .await?;
                }
                Err(error) => self.handle_error(event, error).await?,
            }
        }
        Ok(())
    }

    async fn catch_up_to(&self, trigger: &StoredEvent) -> Result<CatchUp> {
        let instance_id = &trigger.aggregate.instance_id;
        let cursor = self
            .view_store
            .current_sequence(&self.view_model, instance_id)
            .await?;
        if trigger.sequence <= cursor {
            return Ok(CatchUp::UpToDate);
        }

        let query = SearchQuery::new()
            .filter(
                self.instance_filter(instance_id, cursor)
                    .sequence_at_most(trigger.sequence),
            )
            .limit(self.config.bulk_limit.saturating_add(1));
        let events = self.eventstore.filter(&query).await?;

        if events.len() > self.config.bulk_limit {
            tracing::debug!(
                view = %self.view_model,
                instance = %instance_id,
                from = cursor,
                to = trigger.sequence,
                "Too many events to catch up, deferring to next run"
            );
            return Ok(CatchUp::Deferred(DeferReason::TooManyEvents));
        }

        let mut sequence = cursor;
        for event in &events {
            let current = self
                .view_store
                .current_sequence(&self.view_model, instance_id)
                .await?;
            if event.sequence <= current {
                tracing::debug!(
                    view = %self.view_model,
                    instance = %instance_id,
                    sequence = event.sequence,
                    current,
                    "Cursor moved during catch-up, deferring to next run"
                );
                return Ok(CatchUp::Deferred(DeferReason::StaleSequence));
            }

            if let Err(error) = self.reduce_event(event).await {
                tracing::warn!(
                    view = %self.view_model,
                    instance = %instance_id,
                    sequence = event.sequence,
                    error = %error,
                    "Catch-up failed, deferring to next run"
                );
                return Ok(CatchUp::Deferred(DeferReason::Failed));
            }

            self.view_store
                .mark_processed(&self.view_model, instance_id, event.sequence)
                .await?;
            sequence = event.sequence;
        }

        if events.is_empty() {
            return Ok(CatchUp::UpToDate);
        }
        Ok(CatchUp::Applied {
            events: events.len(),
            sequence,
        })
    }
}

impl<P: Projection> Handler for ProjectionHandler<P> {
    fn view_model(&self) -> &str {
        &self.view_model
    }

    fn aggregate_types(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    fn query_limit(&self) -> usize {
        self.config.query_limit
    }

    fn minimum_cycle_duration(&self) -> Duration {
        self.config.minimum_cycle_duration()
    }

    fn lock_duration(&self) -> Duration {
        self.config.lock_duration()
    }

    fn concurrent_instances(&self) -> usize {
        self.config.concurrent_instances
    }

    fn retry_failed_after(&self) -> Duration {
        self.config.retry_failed_after()
    }

    fn event_query<'a>(&'a self, instance_ids: &'a [InstanceId]) -> BoxFuture<'a, Result<SearchQuery>> {
        Box::pin(async move {
            let cursors = self
                .view_store
                .current_sequences(&self.view_model, instance_ids)
                .await?;
            let query = instance_ids.iter().fold(
                SearchQuery::new().limit(self.config.query_limit),
                |query, instance_id| {
                    let cursor = cursors.get(instance_id).copied().unwrap_or_default();
                    query.filter(self.instance_filter(instance_id, cursor))
                },
            );
            Ok(query)
        })
    }

    fn reduce<'a>(&'a self, event: &'a StoredEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.reduce_event(event))
    }

    fn on_error<'a>(&'a self, event: &'a StoredEvent, error: ProjectionError) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.handle_error(event, error))
    }

    fn on_success(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.view_store
                .record_success(&self.view_model, self.clock.now())
                .await
        })
    }

    fn process<'a>(&'a self, events: &'a [StoredEvent]) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.process_events(events))
    }

    fn subscribe(&self) -> Option<Subscription> {
        Some(self.eventstore.subscribe(self.aggregate_types.iter().cloned()))
    }

    fn catch_up<'a>(&'a self, event: &'a StoredEvent) -> BoxFuture<'a, Result<CatchUp>> {
        Box::pin(self.catch_up_to(event))
    }
}
