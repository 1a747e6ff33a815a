//! Search queries over the event log.
//!
//! A [`SearchQuery`] is a disjunction of [`QueryFilter`]s plus an optional
//! limit and an ordering. A filter is a conjunction of its set fields; empty
//! lists and `None` mean "any". Projections build one filter per instance so
//! each instance is read from its own cursor in a single round trip.
//!
//! Results are ordered by `(sequence, instance id)`, which keeps every
//! instance's events in log order.
//!
//! # Example
//!
//! ```
//! use warden_core::query::{QueryFilter, SearchQuery};
//!
//! let query = SearchQuery::new()
//!     .filter(
//!         QueryFilter::new()
//!             .instance("inst-1")
//!             .aggregate_types(["user"])
//!             .sequence_greater(42),
//!     )
//!     .limit(100);
//! assert_eq!(query.filters.len(), 1);
//! ```

use crate::aggregate::{AggregateId, AggregateType, EventType, InstanceId, ResourceOwner};
use crate::event::StoredEvent;
use smallvec::SmallVec;

/// Result ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// A conjunction of conditions on an event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Restrict to one instance.
    pub instance_id: Option<InstanceId>,
    /// Restrict to any of these aggregate types.
    pub aggregate_types: SmallVec<[AggregateType; 4]>,
    /// Restrict to any of these aggregate ids.
    pub aggregate_ids: Vec<AggregateId>,
    /// Restrict to one resource owner.
    pub resource_owner: Option<ResourceOwner>,
    /// Restrict to any of these event types.
    pub event_types: Vec<EventType>,
    /// Only events with `sequence > value`.
    pub sequence_greater: Option<u64>,
    /// Only events with `sequence <= value`.
    pub sequence_at_most: Option<u64>,
}

impl QueryFilter {
    /// A filter matching every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one instance.
    #[must_use]
    pub fn instance(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Restrict to any of these aggregate types.
    #[must_use]
    pub fn aggregate_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        self.aggregate_types.extend(types.into_iter().map(Into::into));
        self
    }

    /// Restrict to any of these aggregate ids.
    #[must_use]
    pub fn aggregate_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateId>,
    {
        self.aggregate_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Restrict to one resource owner.
    #[must_use]
    pub fn resource_owner(mut self, owner: impl Into<ResourceOwner>) -> Self {
        self.resource_owner = Some(owner.into());
        self
    }

    /// Restrict to any of these event types.
    #[must_use]
    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.event_types.extend(types.into_iter().map(Into::into));
        self
    }

    /// Only events after `sequence`.
    #[must_use]
    pub const fn sequence_greater(mut self, sequence: u64) -> Self {
        self.sequence_greater = Some(sequence);
        self
    }

    /// Only events up to and including `sequence`.
    #[must_use]
    pub const fn sequence_at_most(mut self, sequence: u64) -> Self {
        self.sequence_at_most = Some(sequence);
        self
    }

    /// Whether `event` satisfies every set condition.
    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        let aggregate = &event.aggregate;
        self.instance_id
            .as_ref()
            .is_none_or(|id| *id == aggregate.instance_id)
            && (self.aggregate_types.is_empty()
                || self.aggregate_types.contains(&aggregate.aggregate_type))
            && (self.aggregate_ids.is_empty() || self.aggregate_ids.contains(&aggregate.id))
            && self
                .resource_owner
                .as_ref()
                .is_none_or(|owner| *owner == aggregate.resource_owner)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.sequence_greater.is_none_or(|seq| event.sequence > seq)
            && self.sequence_at_most.is_none_or(|seq| event.sequence <= seq)
    }
}

/// A disjunction of filters with ordering and limit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Filters; an event matches if any filter matches. No filters matches everything.
    pub filters: Vec<QueryFilter>,
    /// Maximum number of events returned.
    pub limit: Option<usize>,
    /// Result ordering.
    pub order: Order,
}

impl SearchQuery {
    /// An unrestricted ascending query.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter (OR-ed with the others).
    #[must_use]
    pub fn filter(mut self, filter: QueryFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Limit the number of events returned.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Return newest events first.
    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.order = Order::Descending;
        self
    }

    /// Whether `event` matches any filter.
    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(event))
    }

    /// Sort events into query order and apply the limit.
    ///
    /// Backends that cannot order in storage use this after matching.
    pub fn finish(&self, events: &mut Vec<StoredEvent>) {
        events.sort_by(|a, b| {
            (a.sequence, &a.aggregate.instance_id).cmp(&(b.sequence, &b.aggregate.instance_id))
        });
        if self.order == Order::Descending {
            events.reverse();
        }
        if let Some(limit) = self.limit {
            events.truncate(limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;
    use crate::event::Editor;
    use chrono::Utc;

    fn event(instance: &str, aggregate_type: &str, id: &str, sequence: u64) -> StoredEvent {
        StoredEvent {
            aggregate: Aggregate::new(aggregate_type, id, instance, "org", "v1"),
            event_type: EventType::new(format!("{aggregate_type}.added")),
            sequence,
            aggregate_sequence: 1,
            payload: Vec::new(),
            created_at: Utc::now(),
            editor: Editor::default(),
        }
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(SearchQuery::new().matches(&event("i", "user", "u", 1)));
    }

    #[test]
    fn filter_conditions_are_conjunctive() {
        let filter = QueryFilter::new()
            .instance("i1")
            .aggregate_types(["user"])
            .sequence_greater(3)
            .sequence_at_most(5);

        assert!(filter.matches(&event("i1", "user", "u", 4)));
        assert!(filter.matches(&event("i1", "user", "u", 5)));
        assert!(!filter.matches(&event("i1", "user", "u", 3)));
        assert!(!filter.matches(&event("i1", "user", "u", 6)));
        assert!(!filter.matches(&event("i2", "user", "u", 4)));
        assert!(!filter.matches(&event("i1", "org", "u", 4)));
    }

    #[test]
    fn filters_are_disjunctive() {
        let query = SearchQuery::new()
            .filter(QueryFilter::new().instance("i1").sequence_greater(10))
            .filter(QueryFilter::new().instance("i2").sequence_greater(2));

        assert!(query.matches(&event("i1", "user", "u", 11)));
        assert!(!query.matches(&event("i1", "user", "u", 5)));
        assert!(query.matches(&event("i2", "user", "u", 5)));
    }

    #[test]
    fn finish_orders_and_limits() {
        let mut events = vec![
            event("i2", "user", "a", 2),
            event("i1", "user", "b", 3),
            event("i1", "user", "c", 1),
        ];
        SearchQuery::new().limit(2).finish(&mut events);
        let order: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(order, vec![1, 2]);

        let mut events = vec![event("i1", "user", "a", 1), event("i1", "user", "b", 2)];
        SearchQuery::new().descending().finish(&mut events);
        assert_eq!(events[0].sequence, 2);
    }

    proptest::proptest! {
        #[test]
        fn finish_is_sorted_and_bounded(
            sequences in proptest::collection::vec((0_u8..3, 1_u64..50), 0..30),
            limit in 0_usize..40,
        ) {
            let mut events: Vec<StoredEvent> = sequences
                .iter()
                .map(|(instance, seq)| event(&format!("i{instance}"), "user", "u", *seq))
                .collect();
            let total = events.len();
            SearchQuery::new().limit(limit).finish(&mut events);

            proptest::prop_assert_eq!(events.len(), total.min(limit));
            let sorted = events.windows(2).all(|w| {
                (w[0].sequence, &w[0].aggregate.instance_id)
                    <= (w[1].sequence, &w[1].aggregate.instance_id)
            });
            proptest::prop_assert!(sorted);
        }
    }
}
