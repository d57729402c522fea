//! Integration tests for the sync scheduler
//!
//! Drives single sweeps of the data sync and the health check with explicit clocks.

use chrono::{Duration, Utc};
use integration_hub::connectors::TokenSet;
use integration_hub::events::IntegrationEvent;
use integration_hub::models::{ConnectionStatus, SyncStatus};
use integration_hub::server::AppState;
use sea_orm::ConnectionTrait;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;

async fn state_with_critical_threshold(seconds: u64) -> AppState {
    let mut config = test_utils::test_config();
    config.scheduler.health_critical_threshold_seconds = seconds;
    test_utils::test_state_with(config, test_utils::sandbox_registry())
        .await
        .unwrap()
}

/// Connected sandbox workspace with the echo widget enabled.
async fn connected_with_widget(app: &AppState) -> (Uuid, Uuid) {
    let workspace = Uuid::new_v4();
    let now = Utc::now();
    let connection = test_utils::connect_sandbox(app, workspace, now).await.unwrap();
    app.connections
        .update_widgets(workspace, "sandbox", vec!["echo".to_string()], now)
        .await
        .unwrap();
    (workspace, connection.id)
}

fn tokens(access: &str, refresh: &str, expires_in: Duration) -> TokenSet {
    TokenSet {
        access_token: access.to_string(),
        refresh_token: Some(refresh.to_string()),
        expires_at: Some(Utc::now() + expires_in),
        scopes: vec!["read".to_string()],
    }
}

#[tokio::test]
async fn sync_fills_cache_and_respects_interval() {
    let app = state_with_critical_threshold(600).await;
    let (workspace, id) = connected_with_widget(&app).await;
    let t0 = Utc::now();

    let stats = app.scheduler.sync_due(t0).await.unwrap();
    assert_eq!(stats.connections_polled, 1);
    assert_eq!(stats.synced, 1);

    let synced = app
        .connections
        .repository()
        .get_by_id(id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.sync_state(), SyncStatus::Synced);
    assert!(synced.last_sync_at.is_some());
    assert!(synced.last_error.is_none());

    let payload = app
        .connections
        .widget_data(workspace, "sandbox", "echo", &serde_json::json!({}), t0)
        .await
        .unwrap();
    assert!(payload.cached);

    // Default interval is one hour per connection
    let stats = app
        .scheduler
        .sync_due(t0 + Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(stats.connections_polled, 0);

    let stats = app
        .scheduler
        .sync_due(t0 + Duration::minutes(61))
        .await
        .unwrap();
    assert_eq!(stats.connections_polled, 1);
}

#[tokio::test]
async fn failed_sync_is_recorded_and_waits_a_full_interval() {
    let app = state_with_critical_threshold(600).await;
    let (_, id) = connected_with_widget(&app).await;
    let t0 = Utc::now();
    app.connections
        .repository()
        .update_tokens(
            id,
            &tokens("sandbox-access-old", "revoked", Duration::seconds(-10)),
            t0,
        )
        .await
        .unwrap();

    let stats = app.scheduler.sync_due(t0).await.unwrap();
    assert_eq!(stats.failed, 1);

    let failed = app
        .connections
        .repository()
        .get_by_id(id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.sync_state(), SyncStatus::Failed);
    assert!(failed.last_error.is_some());
    assert!(failed.last_sync_at.is_some());
    assert_eq!(failed.connection_status(), ConnectionStatus::Expired);

    // No longer CONNECTED, so not a sync candidate
    let stats = app
        .scheduler
        .sync_due(t0 + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(stats.connections_polled, 0);
}

#[tokio::test]
async fn health_check_notifies_critical_once_per_error_run() {
    let app = state_with_critical_threshold(600).await;
    let (_, id) = connected_with_widget(&app).await;
    let mut events = app.events.subscribe();
    let repo = app.connections.repository();
    let t0 = Utc::now();

    // Credentials the sandbox does not recognise fail the probe
    repo.update_tokens(
        id,
        &tokens("foreign-token", "sandbox-refresh-x", Duration::hours(2)),
        t0,
    )
    .await
    .unwrap();

    let stats = app.scheduler.health_check_all(t0).await.unwrap();
    assert_eq!(stats.checked, 1);
    assert_eq!(stats.unhealthy, 1);
    assert_eq!(stats.critical_notified, 0);
    let unhealthy = repo.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(unhealthy.connection_status(), ConnectionStatus::Error);
    assert!(unhealthy.error_since.is_some());

    let stats = app
        .scheduler
        .health_check_all(t0 + Duration::seconds(601))
        .await
        .unwrap();
    assert_eq!(stats.critical_notified, 1);

    let stats = app
        .scheduler
        .health_check_all(t0 + Duration::seconds(1200))
        .await
        .unwrap();
    assert_eq!(stats.unhealthy, 1);
    assert_eq!(stats.critical_notified, 0);

    let mut critical = 0;
    loop {
        match events.try_recv() {
            Ok(IntegrationEvent::HealthCritical { connection_id, .. }) => {
                assert_eq!(connection_id, id);
                critical += 1;
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert_eq!(critical, 1);
}

#[tokio::test]
async fn health_check_recovers_connection() {
    let app = state_with_critical_threshold(600).await;
    let (_, id) = connected_with_widget(&app).await;
    let repo = app.connections.repository();
    let t0 = Utc::now();
    repo.mark_failed(id, ConnectionStatus::Error, "provider outage", t0)
        .await
        .unwrap();

    let stats = app
        .scheduler
        .health_check_all(t0 + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(stats.healthy, 1);

    let recovered = repo.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(recovered.connection_status(), ConnectionStatus::Connected);
    assert!(recovered.error_since.is_none());
    assert!(recovered.last_error.is_none());
}

#[tokio::test]
async fn failed_critical_notification_does_not_abort_the_sweep() {
    let app = state_with_critical_threshold(600).await;
    let repo = app.connections.repository();
    let t0 = Utc::now();

    let (broken_workspace, broken) = connected_with_widget(&app).await;
    let (_, healthy_notifier) = connected_with_widget(&app).await;
    for id in [broken, healthy_notifier] {
        repo.update_tokens(
            id,
            &tokens("foreign-token", "sandbox-refresh-x", Duration::hours(2)),
            t0,
        )
        .await
        .unwrap();
    }
    app.connections
        .update_config(
            broken_workspace,
            "sandbox",
            json!({ "label": "broken-notifier" }),
            t0,
        )
        .await
        .unwrap();

    let stats = app.scheduler.health_check_all(t0).await.unwrap();
    assert_eq!(stats.unhealthy, 2);

    app.db
        .execute_unprepared(
            "CREATE TRIGGER reject_critical_mark \
             BEFORE UPDATE OF critical_notified_at ON connections \
             WHEN NEW.critical_notified_at IS NOT NULL AND NEW.config LIKE '%broken-notifier%' \
             BEGIN SELECT RAISE(ABORT, 'notification store unavailable'); END;",
        )
        .await
        .unwrap();

    let stats = app
        .scheduler
        .health_check_all(t0 + Duration::seconds(601))
        .await
        .unwrap();
    assert_eq!(stats.checked, 2);
    assert_eq!(stats.unhealthy, 2);
    assert_eq!(stats.critical_notified, 1);

    let broken = repo.get_by_id(broken).await.unwrap().unwrap();
    let notified = repo.get_by_id(healthy_notifier).await.unwrap().unwrap();
    assert!(broken.critical_notified_at.is_none());
    assert!(notified.critical_notified_at.is_some());
}
