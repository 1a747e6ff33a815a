//! Warden demo binary
//!
//! Runs the users view on Postgres:
//! - applies the migrations
//! - starts a spooler with the users projection
//! - pushes a few user commands
//! - prints the projected row, then runs until Ctrl+C
//!
//! Requires `DATABASE_URL`; spooler and handler settings come from the
//! `WARDEN_*` variables.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_core::{Editor, Eventstore, Utc};
use warden_iam::{AddUser, ChangeUsername, DeactivateUser, UserProjection, registry};
use warden_postgres::{
    DEFAULT_TABLE, PostgresConfig, PostgresEventStore, PostgresLocker, PostgresProjectionStore,
    PostgresViewStore, migrate,
};
use warden_projections::{ProjectionHandler, Spooler, SpoolerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info,warden_iam=info,warden_projections=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = PostgresConfig::from_env()?.connect().await?;
    migrate(&pool).await?;

    let backend = Arc::new(PostgresEventStore::from_pool(pool.clone()));
    let eventstore = Eventstore::new(backend.clone(), registry());
    let users = UserProjection::new(PostgresProjectionStore::new(pool.clone(), DEFAULT_TABLE));

    let config = SpoolerConfig::from_env()?;
    let handler = ProjectionHandler::new(
        users.clone(),
        eventstore.clone(),
        Arc::new(PostgresViewStore::new(pool.clone())),
        config.handler.clone(),
    );
    let spooler = Spooler::new(config, backend, Arc::new(PostgresLocker::new(pool)))
        .with_handler(Arc::new(handler))
        .start();

    let instance = "demo";
    let suffix = Utc::now().timestamp_millis();
    let user_id = format!("u-{suffix}");
    let editor = Editor::new("warden-demo", "admin");

    let added = eventstore
        .execute(
            &AddUser::new(instance, "org-demo", &user_id, &format!("alice-{suffix}"))
                .with_display_name("Alice")
                .with_editor(editor.clone()),
        )
        .await?;
    tracing::info!(user = %user_id, sequence = added.base.processed_sequence, "User added");

    eventstore
        .execute(&ChangeUsername {
            instance_id: instance.to_string(),
            user_id: user_id.clone(),
            username: format!("alicia-{suffix}"),
            editor: editor.clone(),
        })
        .await?;
    eventstore
        .execute(&DeactivateUser {
            instance_id: instance.to_string(),
            user_id: user_id.clone(),
            editor,
        })
        .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    match users.get(instance, &user_id).await? {
        Some(row) => tracing::info!(
            user = %row.user_id,
            username = %row.username,
            status = ?row.status,
            sequence = row.sequence,
            "Projected user"
        ),
        None => tracing::info!(user = %user_id, "User not projected yet"),
    }

    tracing::info!("Spooler running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    spooler.shutdown().await;
    Ok(())
}
