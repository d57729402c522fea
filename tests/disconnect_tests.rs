//! Integration tests for disconnecting connections
//!
//! Disconnect revokes at the provider on a best-effort basis, destroys stored secrets
//! and keeps the row for audit.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use integration_hub::connectors::{GitHubConnector, Registry, SandboxConnector, TokenSet};
use integration_hub::models::ConnectionStatus;
use integration_hub::repositories::NewConnectionTokens;
use uuid::Uuid;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "test_utils/mod.rs"]
mod test_utils;

#[tokio::test]
async fn disconnect_destroys_secrets_and_keeps_the_row() {
    let app = test_utils::test_state().await.unwrap();
    let workspace = Uuid::new_v4();
    let now = Utc::now();
    let connection = test_utils::connect_sandbox(&app, workspace, now).await.unwrap();
    app.connections
        .bind_webhook(workspace, "sandbox", None, Some("whsec".to_string()), now)
        .await
        .unwrap();

    let disconnected = app
        .oauth
        .disconnect(workspace, "sandbox", now + Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(disconnected.id, connection.id);
    assert_eq!(disconnected.connection_status(), ConnectionStatus::Disconnected);
    assert!(disconnected.access_token_encrypted.is_none());
    assert!(disconnected.refresh_token_encrypted.is_none());
    assert!(disconnected.webhook_secret_encrypted.is_none());
    assert!(disconnected.token_expires_at.is_none());
    assert_eq!(
        disconnected.disconnected_at.map(|t| t.timestamp()),
        Some((now + Duration::seconds(5)).timestamp())
    );

    // Still listed for audit
    let listed = app.connections.list(workspace).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let app = test_utils::test_state().await.unwrap();
    let workspace = Uuid::new_v4();
    let now = Utc::now();
    test_utils::connect_sandbox(&app, workspace, now).await.unwrap();

    let first = app.oauth.disconnect(workspace, "sandbox", now).await.unwrap();
    let second = app
        .oauth
        .disconnect(workspace, "sandbox", now + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(
        second.disconnected_at.map(|t| t.timestamp()),
        first.disconnected_at.map(|t| t.timestamp())
    );
}

#[tokio::test]
async fn disconnect_without_connection_is_not_found() {
    let app = test_utils::test_state().await.unwrap();

    let err = app
        .oauth
        .disconnect(Uuid::new_v4(), "sandbox", Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn disconnected_connection_rejects_provider_calls() {
    let app = test_utils::test_state().await.unwrap();
    let workspace = Uuid::new_v4();
    let now = Utc::now();
    test_utils::connect_sandbox(&app, workspace, now).await.unwrap();
    app.oauth.disconnect(workspace, "sandbox", now).await.unwrap();

    let err = app.connections.test(workspace, "sandbox", now).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn provider_revoke_failure_does_not_block_disconnect() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/applications/test_client_id/grant"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let base = server.uri();
    let github = GitHubConnector::new(
        "test_client_id".to_string(),
        "test_client_secret".to_string(),
        Some(base.as_str()),
        Some(base.as_str()),
        StdDuration::from_secs(5),
    )
    .unwrap();
    let mut registry = Registry::new();
    registry.register(Arc::new(SandboxConnector::new()));
    registry.register(Arc::new(github));
    let app = test_utils::test_state_with(test_utils::test_config(), registry)
        .await
        .unwrap();

    let workspace = Uuid::new_v4();
    let now = Utc::now();
    let tokens = TokenSet {
        access_token: "gho_test".to_string(),
        refresh_token: None,
        expires_at: None,
        scopes: vec!["repo".to_string()],
    };
    app.connections
        .repository()
        .upsert_connected(
            NewConnectionTokens {
                workspace_id: workspace,
                provider_slug: "github",
                tokens: &tokens,
                connected_by: Some("user-1".to_string()),
                sync_interval_minutes: 15,
            },
            now,
        )
        .await
        .unwrap();

    let disconnected = app.oauth.disconnect(workspace, "github", now).await.unwrap();
    assert_eq!(disconnected.connection_status(), ConnectionStatus::Disconnected);
    assert!(disconnected.access_token_encrypted.is_none());
}
