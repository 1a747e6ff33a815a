//! Tests for projection testing utilities

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use serde::{Deserialize, Serialize};
use warden_core::projection::Result;
use warden_core::{Aggregate, AggregateType, Envelope, Projection, ProjectionError, ProjectionStore};
use warden_testing::{InMemoryProjectionStore, ProjectionTestHarness, envelope};

// Simple projection for testing
#[derive(Clone, Debug)]
struct NotesProjection {
    store: InMemoryProjectionStore,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum NoteEvent {
    Written { text: String },
    Erased,
    Corrupt,
}

impl Projection for NotesProjection {
    type Event = NoteEvent;

    fn name(&self) -> &str {
        "projections.notes"
    }

    fn aggregate_types(&self) -> Vec<AggregateType> {
        vec![AggregateType::new("note")]
    }

    async fn reduce(&self, envelope: &Envelope<NoteEvent>) -> Result<()> {
        let key = format!("note:{}", envelope.aggregate.id);
        match &envelope.event {
            NoteEvent::Written { text } => self.store.save(&key, text.as_bytes()).await,
            NoteEvent::Erased => self.store.delete(&key).await,
            NoteEvent::Corrupt => Err(ProjectionError::Other("corrupt note".to_string())),
        }
    }
}

fn note(id: &str, sequence: u64, event: NoteEvent) -> Envelope<NoteEvent> {
    envelope(
        Aggregate::new("note", id, "inst", "org", "v1"),
        "note.changed",
        sequence,
        sequence,
        event,
    )
}

fn harness() -> ProjectionTestHarness<NotesProjection> {
    let store = InMemoryProjectionStore::new();
    ProjectionTestHarness::new(NotesProjection { store: store.clone() }, store)
}

#[tokio::test]
async fn test_inmemory_projection_store_save_and_get() {
    let store = InMemoryProjectionStore::new();
    assert!(store.is_empty());

    store.save("key1", b"value1").await.unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.get("key1").await.unwrap(), Some(b"value1".to_vec()));
    assert_eq!(store.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_inmemory_projection_store_overwrite_and_delete() {
    let store = InMemoryProjectionStore::new();

    store.save("key1", b"value1").await.unwrap();
    store.save("key1", b"value2").await.unwrap();
    store.save("key2", b"value3").await.unwrap();
    assert_eq!(store.get("key1").await.unwrap(), Some(b"value2".to_vec()));
    assert_eq!(store.keys(), vec!["key1", "key2"]);

    store.delete("key1").await.unwrap();
    store.delete("key1").await.unwrap();
    assert!(!store.exists("key1").await.unwrap());
    assert!(store.contains_key("key2"));

    store.clear();
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_harness_applies_events_in_order() {
    let mut harness = harness();

    harness
        .given_events(vec![
            note("n1", 1, NoteEvent::Written { text: "draft".to_string() }),
            note("n2", 2, NoteEvent::Written { text: "other".to_string() }),
            note("n1", 3, NoteEvent::Written { text: "final".to_string() }),
        ])
        .await
        .unwrap()
        .then_contains("note:n1")
        .await
        .unwrap();

    assert_eq!(harness.get_data("note:n1").await.unwrap(), Some(b"final".to_vec()));
    assert_eq!(harness.store().len(), 2);
}

#[tokio::test]
async fn test_harness_reducing_twice_is_idempotent() {
    let mut harness = harness();
    let written = note("n1", 1, NoteEvent::Written { text: "once".to_string() });

    harness.given_event(written.clone()).await.unwrap();
    harness.given_event(written).await.unwrap();

    assert_eq!(harness.store().keys(), vec!["note:n1"]);
}

#[tokio::test]
async fn test_harness_erase() {
    let mut harness = harness();

    harness
        .given_events(vec![
            note("n1", 1, NoteEvent::Written { text: "x".to_string() }),
            note("n1", 2, NoteEvent::Erased),
        ])
        .await
        .unwrap()
        .then_not_contains("note:n1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_harness_propagates_reduce_errors() {
    let mut harness = harness();

    let result = harness.given_event(note("n1", 1, NoteEvent::Corrupt)).await;
    assert!(matches!(result, Err(ProjectionError::Other(_))));
    assert!(harness.store().is_empty());
}
