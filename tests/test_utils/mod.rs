//! Test utilities for database and application state setup.
//!
//! Provides an in-memory SQLite database with migrations applied and a fully wired
//! [`AppState`] backed by the sandbox connector and the in-process cache.

use anyhow::Result;
use chrono::{DateTime, Utc};
use integration_hub::cache::MemoryCache;
use integration_hub::config::AppConfig;
use integration_hub::connectors::{Registry, SandboxConnector, SignatureScheme};
use integration_hub::crypto::TokenCipher;
use integration_hub::models::connection;
use integration_hub::oauth_flow::CallbackParams;
use integration_hub::server::AppState;
use integration_hub::webhook_verification::sign;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use std::sync::Arc;
use uuid::Uuid;

#[allow(dead_code)]
pub const TEST_OPERATOR_TOKEN: &str = "test-operator-token";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration used across integration tests.
#[allow(dead_code)]
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec![TEST_OPERATOR_TOKEN.to_string()],
        encryption_key: Some("11".repeat(32)),
        database_url: "sqlite::memory:".to_string(),
        callback_base_url: "http://localhost:8080".to_string(),
        client_completion_url: "http://localhost:3000/integrations/complete".to_string(),
        ..AppConfig::default()
    };
    config.oauth_state_ttl_seconds = 300;
    config
}

/// Registry holding only the sandbox connector.
#[allow(dead_code)]
pub fn sandbox_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(Arc::new(SandboxConnector::new()));
    registry
}

/// Builds application state over a fresh migrated database.
#[allow(dead_code)]
pub async fn test_state_with(config: AppConfig, registry: Registry) -> Result<AppState> {
    let db = setup_test_db().await?;
    let cipher = TokenCipher::new(config.encryption_key_bytes()?)?;
    let cache = Arc::new(MemoryCache::new(config.cache_max_entries));
    Ok(AppState::new(Arc::new(config), db, registry, cipher, cache))
}

/// Application state with the default test config and the sandbox registry.
#[allow(dead_code)]
pub async fn test_state() -> Result<AppState> {
    test_state_with(test_config(), sandbox_registry()).await
}

/// Runs the whole sandbox OAuth flow for `workspace_id` at `now`.
#[allow(dead_code)]
pub async fn connect_sandbox(
    state: &AppState,
    workspace_id: Uuid,
    now: DateTime<Utc>,
) -> Result<connection::Model> {
    let start = state
        .oauth
        .initiate(workspace_id, "sandbox", None, Some("user-1".to_string()), now)
        .await?;
    let connection = state
        .oauth
        .handle_callback(
            "sandbox",
            CallbackParams {
                code: Some("sandbox-code".to_string()),
                state: Some(start.state),
                ..CallbackParams::default()
            },
            now,
        )
        .await?;
    Ok(connection)
}

/// Signature header value the sandbox provider would send for `body`.
#[allow(dead_code)]
pub fn sandbox_signature(state: &AppState, secret: &str, body: &[u8]) -> String {
    let scheme: SignatureScheme = state
        .registry
        .get("sandbox")
        .and_then(|c| c.metadata().webhook_signature.clone())
        .expect("sandbox connector signs webhooks");
    sign(&scheme, secret, body).expect("signing succeeds")
}
