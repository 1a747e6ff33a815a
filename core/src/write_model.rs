//! Write models: ephemeral folds of one aggregate's events used to validate commands.
//!
//! A concrete write model owns a [`WriteModel`] base (identity, event buffer,
//! last processed aggregate sequence) and implements [`QueryReducer`]:
//!
//! ```ignore
//! struct UserWriteModel {
//!     base: WriteModel<IamEvent>,
//!     username: String,
//!     state: ObjectState,
//! }
//!
//! impl QueryReducer for UserWriteModel {
//!     type Event = IamEvent;
//!
//!     fn query(&self) -> SearchQuery {
//!         SearchQuery::new().filter(self.base.aggregate_filter("user"))
//!     }
//!
//!     fn append_events(&mut self, events: Vec<Envelope<IamEvent>>) {
//!         self.base.append_events(events);
//!     }
//!
//!     fn reduce(&mut self) -> Result<(), EventstoreError> {
//!         for envelope in self.base.take_events() {
//!             match &envelope.event {
//!                 IamEvent::UserAdded(e) => {
//!                     self.username.clone_from(&e.username);
//!                     self.state = self.state.transition(ObjectState::Active);
//!                 }
//!                 _ => {}
//!             }
//!             self.base.processed(&envelope);
//!         }
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Write models are never persisted; they are rebuilt per command.

use crate::aggregate::{AggregateId, AggregateType, InstanceId, ResourceOwner};
use crate::error::EventstoreError;
use crate::event::Envelope;
use crate::query::{QueryFilter, SearchQuery};
use chrono::{DateTime, Utc};

/// Something that can be loaded from the log by filtering and folding.
pub trait QueryReducer: Send {
    /// Decoded event enum this reducer understands.
    type Event;

    /// Scope of events to load.
    fn query(&self) -> SearchQuery;

    /// Buffer events for the next [`QueryReducer::reduce`].
    fn append_events(&mut self, events: Vec<Envelope<Self::Event>>);

    /// Fold buffered events into state. Later events override earlier fields;
    /// events the model does not care about are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffered event cannot be applied.
    fn reduce(&mut self) -> Result<(), EventstoreError>;
}

/// Lifecycle of an aggregate as seen by a write model.
///
/// Transitions are monotonic: once `Removed`, an aggregate never comes back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObjectState {
    /// No event seen yet.
    #[default]
    NotExists,
    /// Created and usable.
    Active,
    /// Created but deactivated.
    Inactive,
    /// Removed; terminal.
    Removed,
}

impl ObjectState {
    /// Apply a transition, ignoring anything after `Removed`.
    #[must_use]
    pub const fn transition(self, next: Self) -> Self {
        match self {
            Self::Removed => Self::Removed,
            _ => next,
        }
    }

    /// Whether the aggregate currently exists.
    #[must_use]
    pub const fn exists(self) -> bool {
        matches!(self, Self::Active | Self::Inactive)
    }
}

/// Base state shared by every write model.
#[derive(Clone, Debug)]
pub struct WriteModel<E> {
    /// Aggregate being folded.
    pub aggregate_id: AggregateId,
    /// Tenant instance.
    pub instance_id: InstanceId,
    /// Owning organisation; empty means "any".
    pub resource_owner: ResourceOwner,
    /// Aggregate sequence of the last folded event (0 if none).
    pub processed_sequence: u64,
    /// Timestamp of the last folded event.
    pub change_date: Option<DateTime<Utc>>,
    events: Vec<Envelope<E>>,
}

impl<E> WriteModel<E> {
    /// Create a base for one aggregate.
    #[must_use]
    pub fn new(
        aggregate_id: impl Into<AggregateId>,
        instance_id: impl Into<InstanceId>,
        resource_owner: impl Into<ResourceOwner>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            instance_id: instance_id.into(),
            resource_owner: resource_owner.into(),
            processed_sequence: 0,
            change_date: None,
            events: Vec::new(),
        }
    }

    /// Buffer events, keeping only those of this model's aggregate.
    pub fn append_events(&mut self, events: Vec<Envelope<E>>) {
        self.events.extend(events.into_iter().filter(|envelope| {
            envelope.aggregate.id == self.aggregate_id
                && envelope.aggregate.instance_id == self.instance_id
        }));
    }

    /// Take the buffered events for folding.
    pub fn take_events(&mut self) -> Vec<Envelope<E>> {
        std::mem::take(&mut self.events)
    }

    /// Record that `envelope` has been folded.
    pub fn processed(&mut self, envelope: &Envelope<E>) {
        self.processed_sequence = self.processed_sequence.max(envelope.aggregate_sequence);
        self.change_date = Some(envelope.created_at);
        if self.resource_owner.is_empty() {
            self.resource_owner = envelope.aggregate.resource_owner.clone();
        }
    }

    /// Filter selecting this model's aggregate.
    #[must_use]
    pub fn aggregate_filter(&self, aggregate_type: impl Into<AggregateType>) -> QueryFilter {
        let filter = QueryFilter::new()
            .instance(self.instance_id.clone())
            .aggregate_types([aggregate_type.into()])
            .aggregate_ids([self.aggregate_id.clone()]);
        if self.resource_owner.is_empty() {
            filter
        } else {
            filter.resource_owner(self.resource_owner.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregate, EventType};
    use crate::event::Editor;

    fn envelope(id: &str, aggregate_sequence: u64) -> Envelope<()> {
        Envelope {
            aggregate: Aggregate::new("user", id, "inst", "org", "v1"),
            event_type: EventType::new("user.added"),
            sequence: aggregate_sequence + 100,
            aggregate_sequence,
            created_at: Utc::now(),
            editor: Editor::default(),
            event: (),
        }
    }

    #[test]
    fn removed_is_terminal() {
        let state = ObjectState::NotExists
            .transition(ObjectState::Active)
            .transition(ObjectState::Removed)
            .transition(ObjectState::Active);
        assert_eq!(state, ObjectState::Removed);
        assert!(!state.exists());
        assert!(ObjectState::Inactive.exists());
    }

    #[test]
    fn base_keeps_only_own_aggregate() {
        let mut base = WriteModel::new("u-1", "inst", "");
        base.append_events(vec![envelope("u-1", 1), envelope("u-2", 1)]);

        let events = base.take_events();
        assert_eq!(events.len(), 1);
        for event in &events {
            base.processed(event);
        }
        assert_eq!(base.processed_sequence, 1);
        assert_eq!(base.resource_owner.as_str(), "org");
        assert!(base.take_events().is_empty());
    }

    #[test]
    fn aggregate_filter_scopes_to_instance_and_id() {
        let base: WriteModel<()> = WriteModel::new("u-1", "inst", "org");
        let filter = base.aggregate_filter("user");
        assert_eq!(filter.instance_id, Some(InstanceId::new("inst")));
        assert_eq!(filter.aggregate_ids, vec![AggregateId::new("u-1")]);
        assert_eq!(filter.resource_owner, Some(ResourceOwner::new("org")));
    }
}
