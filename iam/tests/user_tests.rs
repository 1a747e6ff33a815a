//! User command pipeline and users view against the in-memory backends.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use proptest::prelude::*;
use std::sync::Arc;
use warden_core::{
    Aggregate, Editor, EventStore, Eventstore, EventstoreError, InstanceId, ObjectState,
    QueryReducer, SearchQuery, ViewStore, WriteCommand,
};
use warden_iam::{
    AddUser, ChangeUsername, DeactivateUser, IamEvent, ReactivateUser, RemoveUser, USER_AGGREGATE,
    USER_VERSION, USERS_VIEW, UserAdded, UserDeactivated, UserProjection, UserReactivated,
    UserRemoved, UserStatus, UserWriteModel, UsernameChanged, registry,
};
use warden_projections::{HandlerConfig, ProjectionHandler, run_cycle};
use warden_testing::{
    InMemoryEventStore, InMemoryProjectionStore, InMemoryViewStore, ProjectionTestHarness,
    envelope,
};

fn setup() -> (Arc<InMemoryEventStore>, Eventstore<IamEvent>) {
    let backend = Arc::new(InMemoryEventStore::new());
    let eventstore = Eventstore::new(backend.clone(), registry());
    (backend, eventstore)
}

fn change_username(user_id: &str, username: &str) -> ChangeUsername {
    ChangeUsername {
        instance_id: "inst".to_string(),
        user_id: user_id.to_string(),
        username: username.to_string(),
        editor: Editor::default(),
    }
}

fn deactivate(user_id: &str) -> DeactivateUser {
    DeactivateUser {
        instance_id: "inst".to_string(),
        user_id: user_id.to_string(),
        editor: Editor::default(),
    }
}

fn remove(user_id: &str) -> RemoveUser {
    RemoveUser {
        instance_id: "inst".to_string(),
        user_id: user_id.to_string(),
        editor: Editor::default(),
    }
}

#[tokio::test]
async fn test_add_user_returns_folded_model() {
    let (backend, eventstore) = setup();

    let model = eventstore
        .execute(&AddUser::new("inst", "org", "u-1", "alice").with_display_name("Alice"))
        .await
        .unwrap();

    assert_eq!(model.username, "alice");
    assert_eq!(model.display_name, "Alice");
    assert_eq!(model.state, ObjectState::Active);
    assert_eq!(model.base.processed_sequence, 1);
    assert!(backend.has_constraint(&InstanceId::new("inst"), "usernames", "alice"));
}

#[tokio::test]
async fn test_duplicate_user_id_already_exists() {
    let (backend, eventstore) = setup();
    eventstore
        .execute(&AddUser::new("inst", "org", "u-1", "alice"))
        .await
        .unwrap();

    let result = eventstore
        .execute(&AddUser::new("inst", "other-org", "u-1", "bob"))
        .await;

    assert!(matches!(result, Err(EventstoreError::AlreadyExists(_))));
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn test_taken_username_is_rejected_case_insensitively() {
    let (backend, eventstore) = setup();
    eventstore
        .execute(&AddUser::new("inst", "org", "u-1", "alice"))
        .await
        .unwrap();

    let result = eventstore
        .execute(&AddUser::new("inst", "org", "u-2", "ALICE"))
        .await;

    assert!(matches!(
        result,
        Err(EventstoreError::UniqueConstraintViolation { .. })
    ));
    assert_eq!(backend.len(), 1);

    // Another instance has its own namespace.
    eventstore
        .execute(&AddUser::new("other", "org", "u-2", "alice"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_adds_of_one_username_have_one_winner() {
    let (backend, eventstore) = setup();

    let attempts: Vec<_> = (0..10)
        .map(|i| {
            let eventstore = eventstore.clone();
            tokio::spawn(async move {
                eventstore
                    .execute(&AddUser::new("inst", "org", &format!("u-{i}"), "alice"))
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => winners += 1,
            Err(error) => assert!(matches!(
                error,
                EventstoreError::UniqueConstraintViolation { .. }
            )),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn test_unchanged_username_pushes_nothing() {
    let (backend, eventstore) = setup();
    eventstore
        .execute(&AddUser::new("inst", "org", "u-1", "alice"))
        .await
        .unwrap();

    let result = eventstore.execute(&change_username("u-1", "alice")).await;

    assert!(matches!(result, Err(EventstoreError::PreconditionFailed(_))));
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn test_rename_moves_the_username_claim() {
    let (backend, eventstore) = setup();
    eventstore
        .execute(&AddUser::new("inst", "org", "u-1", "alice"))
        .await
        .unwrap();

    let model = eventstore
        .execute(&change_username("u-1", "alicia"))
        .await
        .unwrap();
    assert_eq!(model.username, "alicia");
    assert_eq!(model.base.processed_sequence, 2);

    let instance = InstanceId::new("inst");
    assert!(!backend.has_constraint(&instance, "usernames", "alice"));
    assert!(backend.has_constraint(&instance, "usernames", "alicia"));

    // The released name is free again.
    eventstore
        .execute(&AddUser::new("inst", "org", "u-2", "alice"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lifecycle_preconditions() {
    let (_backend, eventstore) = setup();

    assert!(matches!(
        eventstore.execute(&deactivate("u-1")).await,
        Err(EventstoreError::NotFound(_))
    ));

    eventstore
        .execute(&AddUser::new("inst", "org", "u-1", "alice"))
        .await
        .unwrap();
    let model = eventstore.execute(&deactivate("u-1")).await.unwrap();
    assert_eq!(model.state, ObjectState::Inactive);

    assert!(matches!(
        eventstore.execute(&deactivate("u-1")).await,
        Err(EventstoreError::PreconditionFailed(_))
    ));

    let reactivate = ReactivateUser {
        instance_id: "inst".to_string(),
        user_id: "u-1".to_string(),
        editor: Editor::default(),
    };
    let model = eventstore.execute(&reactivate).await.unwrap();
    assert_eq!(model.state, ObjectState::Active);

    let model = eventstore.execute(&remove("u-1")).await.unwrap();
    assert_eq!(model.state, ObjectState::Removed);
    assert!(matches!(
        eventstore.execute(&remove("u-1")).await,
        Err(EventstoreError::NotFound(_))
    ));
    // Removed ids are never reused.
    assert!(matches!(
        eventstore
            .execute(&AddUser::new("inst", "org", "u-1", "alice"))
            .await,
        Err(EventstoreError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_invalid_command_is_rejected_before_loading() {
    let (backend, eventstore) = setup();

    let result = eventstore.execute(&change_username("", "alice")).await;

    assert!(matches!(result, Err(EventstoreError::InvalidArgument(_))));
    assert!(backend.is_empty());
}

#[tokio::test]
async fn test_stale_decision_conflicts() {
    let (backend, eventstore) = setup();
    eventstore
        .execute(&AddUser::new("inst", "org", "u-1", "alice"))
        .await
        .unwrap();

    let rename = change_username("u-1", "alicia");
    let mut stale = rename.write_model();
    eventstore.filter_to_query_reducer(&mut stale).await.unwrap();

    eventstore.execute(&deactivate("u-1")).await.unwrap();

    let result = eventstore.push(rename.decide(&stale).unwrap()).await;
    assert!(matches!(
        result,
        Err(EventstoreError::ConcurrencyConflict {
            expected: 1,
            actual: 2,
            ..
        })
    ));
    assert_eq!(backend.len(), 2);
}

#[tokio::test]
async fn test_users_view_follows_the_log() {
    let (backend, eventstore) = setup();
    let store = InMemoryProjectionStore::new();
    let users = UserProjection::new(store.clone());
    let views = Arc::new(InMemoryViewStore::new());

    eventstore
        .execute(&AddUser::new("inst", "org", "u-1", "alice"))
        .await
        .unwrap();
    eventstore
        .execute(&AddUser::new("inst", "org", "u-2", "bob"))
        .await
        .unwrap();
    eventstore
        .execute(&change_username("u-1", "alicia"))
        .await
        .unwrap();
    eventstore.execute(&deactivate("u-1")).await.unwrap();
    eventstore.execute(&remove("u-2")).await.unwrap();

    let handler = ProjectionHandler::new(
        users.clone(),
        eventstore.clone(),
        views.clone(),
        HandlerConfig::default().with_query_limit(2),
    );
    run_cycle(backend.as_ref(), &handler).await.unwrap();

    let row = users.get("inst", "u-1").await.unwrap().unwrap();
    assert_eq!(row.username, "alicia");
    assert_eq!(row.status, UserStatus::Inactive);
    assert_eq!(row.sequence, 4);
    assert!(users.get("inst", "u-2").await.unwrap().is_none());
    assert_eq!(
        views
            .current_sequence(USERS_VIEW, &InstanceId::new("inst"))
            .await
            .unwrap(),
        5
    );
    assert_eq!(
        backend.latest_sequence(&SearchQuery::new()).await.unwrap(),
        5
    );
}

fn user_aggregate(id: &str) -> Aggregate {
    Aggregate::new(USER_AGGREGATE, id, "inst", "org", USER_VERSION)
}

#[tokio::test]
async fn test_users_view_ignores_redelivered_events() {
    let store = InMemoryProjectionStore::new();
    let mut harness = ProjectionTestHarness::new(UserProjection::new(store.clone()), store);

    let added = envelope(
        user_aggregate("u-1"),
        "user.added",
        1,
        1,
        IamEvent::UserAdded(UserAdded {
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
        }),
    );
    let renamed = envelope(
        user_aggregate("u-1"),
        "user.username.changed",
        2,
        2,
        IamEvent::UsernameChanged(UsernameChanged {
            old_username: "alice".to_string(),
            username: "alicia".to_string(),
        }),
    );
    let deactivated = envelope(
        user_aggregate("u-1"),
        "user.deactivated",
        3,
        3,
        IamEvent::UserDeactivated(UserDeactivated),
    );

    harness
        .given_events(vec![
            added.clone(),
            renamed.clone(),
            deactivated.clone(),
            added,
            renamed,
            deactivated,
        ])
        .await
        .unwrap()
        .then_contains("user:inst:u-1")
        .await
        .unwrap();

    let row = harness
        .projection()
        .get("inst", "u-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.username, "alicia");
    assert_eq!(row.status, UserStatus::Inactive);
    assert_eq!(row.sequence, 3);
}

#[tokio::test]
async fn test_users_view_keeps_removed_users_removed() {
    let store = InMemoryProjectionStore::new();
    let mut harness = ProjectionTestHarness::new(UserProjection::new(store.clone()), store);

    let added = envelope(
        user_aggregate("u-1"),
        "user.added",
        1,
        1,
        IamEvent::UserAdded(UserAdded {
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
        }),
    );
    let removed = envelope(
        user_aggregate("u-1"),
        "user.removed",
        3,
        2,
        IamEvent::UserRemoved(UserRemoved {
            username: "alice".to_string(),
        }),
    );

    harness
        .given_events(vec![added.clone(), removed, added])
        .await
        .unwrap()
        .then_contains("user:inst:u-1")
        .await
        .unwrap();

    assert!(harness.projection().get("inst", "u-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_users_view_skips_updates_for_unknown_rows() {
    let store = InMemoryProjectionStore::new();
    let mut harness = ProjectionTestHarness::new(UserProjection::new(store.clone()), store);

    harness
        .given_event(envelope(
            user_aggregate("ghost"),
            "user.reactivated",
            7,
            2,
            IamEvent::UserReactivated(UserReactivated),
        ))
        .await
        .unwrap()
        .then_not_contains("user:inst:ghost")
        .await
        .unwrap();
}

#[derive(Clone, Debug)]
enum Step {
    Rename(String),
    Deactivate,
    Reactivate,
    Remove,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Step::Rename),
        Just(Step::Deactivate),
        Just(Step::Reactivate),
        Just(Step::Remove),
    ]
}

fn history(steps: &[Step]) -> Vec<warden_core::Envelope<IamEvent>> {
    let mut events = vec![IamEvent::UserAdded(UserAdded {
        username: "start".to_string(),
        display_name: "Start".to_string(),
    })];
    let mut current = "start".to_string();
    for step in steps {
        events.push(match step {
            Step::Rename(name) => {
                let event = IamEvent::UsernameChanged(UsernameChanged {
                    old_username: current.clone(),
                    username: name.clone(),
                });
                current.clone_from(name);
                event
            }
            Step::Deactivate => IamEvent::UserDeactivated(UserDeactivated),
            Step::Reactivate => IamEvent::UserReactivated(UserReactivated),
            Step::Remove => IamEvent::UserRemoved(warden_iam::UserRemoved {
                username: current.clone(),
            }),
        });
    }
    events
        .into_iter()
        .zip(1_u64..)
        .map(|(event, seq)| envelope(user_aggregate("u-1"), "user.event", seq, seq, event))
        .collect()
}

fn fold(batches: Vec<Vec<warden_core::Envelope<IamEvent>>>) -> UserWriteModel {
    let mut model = UserWriteModel::new("u-1", "inst", "");
    for batch in batches {
        model.append_events(batch);
        model.reduce().unwrap();
    }
    model
}

proptest! {
    #[test]
    fn fold_is_deterministic_and_batch_independent(
        steps in prop::collection::vec(step(), 0..20),
        split in 0_usize..21,
    ) {
        let events = history(&steps);
        let split = split.min(events.len());

        let whole = fold(vec![events.clone()]);
        let again = fold(vec![events.clone()]);
        let (head, tail) = events.split_at(split);
        let batched = fold(vec![head.to_vec(), tail.to_vec()]);

        for model in [&again, &batched] {
            prop_assert_eq!(&model.username, &whole.username);
            prop_assert_eq!(model.state, whole.state);
            prop_assert_eq!(model.base.processed_sequence, whole.base.processed_sequence);
        }
        prop_assert_eq!(whole.base.processed_sequence, events.len() as u64);

        let removed = steps.iter().any(|s| matches!(s, Step::Remove));
        prop_assert_eq!(whole.state == ObjectState::Removed, removed);
    }
}
