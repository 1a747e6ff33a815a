//! In-memory read-model storage and a projection test harness.
//!
//! - [`InMemoryProjectionStore`]: `HashMap`-backed [`ProjectionStore`]
//! - [`ProjectionTestHarness`]: applies envelopes to a projection and asserts
//!   on the resulting store contents
//! - [`envelope`]: builds an envelope with log metadata for harness input

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use crate::mocks::test_clock;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use warden_core::environment::Clock;
use warden_core::projection::Result;
use warden_core::{Aggregate, Editor, Envelope, EventType, Projection, ProjectionStore};

/// In-memory projection store for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use warden_testing::InMemoryProjectionStore;
/// use warden_core::ProjectionStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryProjectionStore::new();
/// store.save("user:inst-1:u-1", b"alice").await?;
/// assert!(store.get("user:inst-1:u-1").await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryProjectionStore {
    /// Create a new empty in-memory projection store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all projection data
    pub fn clear(&self) {
        self.data.write().unwrap().clear();
    }

    /// Get the number of stored rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Check if a key exists in the store
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    /// All keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ProjectionStore for InMemoryProjectionStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        self.data
            .write()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().unwrap().contains_key(key))
    }
}

/// Build an envelope for `event` on `aggregate` at the given sequences.
#[must_use]
pub fn envelope<E>(
    aggregate: Aggregate,
    event_type: &str,
    sequence: u64,
    aggregate_sequence: u64,
    event: E,
) -> Envelope<E> {
    Envelope {
        aggregate,
        event_type: EventType::new(event_type),
        sequence,
        aggregate_sequence,
        created_at: test_clock().now(),
        editor: Editor::new("test", "tester"),
        event,
    }
}

/// Test harness for projections providing a fluent testing API.
///
/// # Example
///
/// ```ignore
/// let store = InMemoryProjectionStore::new();
/// let mut harness = ProjectionTestHarness::new(UserProjection::new(store.clone()), store);
///
/// harness
///     .given_events(vec![added, renamed])
///     .await?
///     .then_contains("user:inst-1:u-1")
///     .await?;
/// ```
pub struct ProjectionTestHarness<P: Projection> {
    projection: P,
    store: InMemoryProjectionStore,
}

impl<P: Projection> ProjectionTestHarness<P> {
    /// Create a harness; `store` must be the store the projection writes to.
    #[must_use]
    pub const fn new(projection: P, store: InMemoryProjectionStore) -> Self {
        Self { projection, store }
    }

    /// Reduce envelopes in order.
    ///
    /// # Errors
    ///
    /// Returns the first reducer error.
    pub async fn given_events(&mut self, events: Vec<Envelope<P::Event>>) -> Result<&mut Self> {
        for event in &events {
            self.projection.reduce(event).await?;
        }
        Ok(self)
    }

    /// Reduce a single envelope.
    ///
    /// # Errors
    ///
    /// Returns the reducer error.
    pub async fn given_event(&mut self, event: Envelope<P::Event>) -> Result<&mut Self> {
        self.projection.reduce(&event).await?;
        Ok(self)
    }

    /// Assert that the store contains `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`](warden_core::ProjectionError) if the lookup fails.
    ///
    /// # Panics
    ///
    /// Panics if the key is missing (this is a test assertion).
    pub async fn then_contains(&self, key: &str) -> Result<&Self> {
        let exists = self.store.exists(key).await?;
        assert!(exists, "Expected projection store to contain key '{key}'");
        Ok(self)
    }

    /// Assert that the store does not contain `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`](warden_core::ProjectionError) if the lookup fails.
    ///
    /// # Panics
    ///
    /// Panics if the key is present (this is a test assertion).
    pub async fn then_not_contains(&self, key: &str) -> Result<&Self> {
        let exists = self.store.exists(key).await?;
        assert!(!exists, "Expected projection store to NOT contain key '{key}'");
        Ok(self)
    }

    /// Raw data stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`](warden_core::ProjectionError) if the lookup fails.
    pub async fn get_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(key).await
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &InMemoryProjectionStore {
        &self.store
    }

    /// The projection under test.
    #[must_use]
    pub const fn projection(&self) -> &P {
        &self.projection
    }
}
