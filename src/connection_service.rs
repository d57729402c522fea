//! Connection management
//!
//! Everything that reads or mutates an established connection on behalf of a workspace:
//! token access with inline refresh, widget data, manual health probes and settings.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cache::WidgetCache;
use crate::connectors::{Capability, Connector, Registry, TokenSet, WidgetData};
use crate::error::IntegrationError;
use crate::events::{EventBus, IntegrationEvent};
use crate::models::ConnectionStatus;
use crate::models::connection;
use crate::repositories::ConnectionRepository;

/// Message stored when a refresh fails; shown to users as the reason to reconnect.
pub const RECONNECT_MESSAGE: &str = "Access to the provider expired; please reconnect";

/// Widget data as served to clients
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WidgetPayload {
    pub widget_id: String,
    #[schema(value_type = Object)]
    pub data: Value,
    pub fetched_at: DateTime<Utc>,
    /// Whether the data came from the widget cache
    pub cached: bool,
}

/// Result of probing a connection against its provider
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub connection: connection::Model,
}

#[derive(Clone)]
pub struct ConnectionService {
    registry: Arc<Registry>,
    connections: ConnectionRepository,
    widget_cache: WidgetCache,
    events: EventBus,
}

impl ConnectionService {
    pub fn new(
        registry: Arc<Registry>,
        connections: ConnectionRepository,
        widget_cache: WidgetCache,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            connections,
            widget_cache,
            events,
        }
    }

    pub fn repository(&self) -> &ConnectionRepository {
        &self.connections
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn list(&self, workspace_id: Uuid) -> Result<Vec<connection::Model>, IntegrationError> {
        self.connections.list_by_workspace(workspace_id).await
    }

    pub async fn get(
        &self,
        workspace_id: Uuid,
        provider: &str,
    ) -> Result<connection::Model, IntegrationError> {
        self.connections
            .find_by_workspace_and_provider(workspace_id, provider)
            .await?
            .ok_or_else(|| IntegrationError::connection_not_found(provider))
    }

    /// Like [`Self::get`] but rejects disconnected rows.
    async fn get_active(
        &self,
        workspace_id: Uuid,
        provider: &str,
    ) -> Result<connection::Model, IntegrationError> {
        let connection = self.get(workspace_id, provider).await?;
        if connection.connection_status() == ConnectionStatus::Disconnected {
            return Err(IntegrationError::connection_not_found(provider));
        }
        Ok(connection)
    }

    fn connector(&self, provider: &str) -> Result<Arc<dyn Connector>, IntegrationError> {
        self.registry
            .get(provider)
            .ok_or_else(|| IntegrationError::unknown_provider(provider))
    }

    /// Decrypted tokens ready for a provider call.
    ///
    /// Past-expiry access tokens are refreshed inline when a refresh token exists. A
    /// failed refresh moves the row to EXPIRED; a missing refresh token moves it to
    /// NEEDS_REAUTH. Both surface as [`IntegrationError::TokenExpired`].
    pub async fn usable_tokens(
        &self,
        connection: &connection::Model,
        now: DateTime<Utc>,
    ) -> Result<TokenSet, IntegrationError> {
        let provider = connection.provider_slug.as_str();
        let expired = || IntegrationError::TokenExpired {
            provider: provider.to_string(),
        };

        match connection.connection_status() {
            ConnectionStatus::Expired | ConnectionStatus::NeedsReauth => return Err(expired()),
            ConnectionStatus::Disconnected => {
                return Err(IntegrationError::connection_not_found(provider));
            }
            ConnectionStatus::Connected | ConnectionStatus::Error | ConnectionStatus::Pending => {}
        }

        let tokens = self
            .connections
            .decrypt_tokens(connection)?
            .ok_or_else(expired)?;
        if !tokens.is_expired(now) {
            return Ok(tokens);
        }

        let Some(refresh_token) = tokens.refresh_token.as_deref() else {
            let updated = self
                .connections
                .mark_failed(connection.id, ConnectionStatus::NeedsReauth, RECONNECT_MESSAGE, now)
                .await?;
            self.publish_status(&updated, Some(RECONNECT_MESSAGE.to_string()));
            return Err(expired());
        };

        let connector = self.connector(provider)?;
        match connector.refresh_token(refresh_token).await {
            Ok(refreshed) => {
                self.connections
                    .update_tokens(connection.id, &refreshed, now)
                    .await?;
                info!(connection_id = %connection.id, provider, "Refreshed expired token on access");
                Ok(TokenSet {
                    refresh_token: refreshed.refresh_token.or(tokens.refresh_token),
                    ..refreshed
                })
            }
            Err(e) => {
                warn!(connection_id = %connection.id, provider, error = %e, "Inline token refresh failed");
                let updated = self
                    .connections
                    .mark_failed(connection.id, ConnectionStatus::Expired, RECONNECT_MESSAGE, now)
                    .await?;
                self.publish_status(&updated, Some(RECONNECT_MESSAGE.to_string()));
                Err(expired())
            }
        }
    }

    /// Serves a widget from cache when fresh, otherwise fetches and caches it.
    pub async fn widget_data(
        &self,
        workspace_id: Uuid,
        provider: &str,
        widget_id: &str,
        params: &Value,
        now: DateTime<Utc>,
    ) -> Result<WidgetPayload, IntegrationError> {
        let connector = self.connector(provider)?;
        if connector.metadata().widget(widget_id).is_none() {
            return Err(IntegrationError::validation(format!(
                "{provider} does not provide widget '{widget_id}'"
            )));
        }
        let connection = self.get_active(workspace_id, provider).await?;

        if let Some(cached) = self.widget_cache.get(connection.id, widget_id).await {
            return Ok(WidgetPayload {
                widget_id: cached.widget_id,
                data: cached.data,
                fetched_at: cached.fetched_at,
                cached: true,
            });
        }

        let fresh = self
            .fetch_widget(connector.as_ref(), &connection, widget_id, params, now)
            .await?;
        Ok(WidgetPayload {
            widget_id: fresh.widget_id,
            data: fresh.data,
            fetched_at: fresh.fetched_at,
            cached: false,
        })
    }

    /// Fetches a widget from the provider and stores it for its refresh interval.
    pub async fn fetch_widget(
        &self,
        connector: &dyn Connector,
        connection: &connection::Model,
        widget_id: &str,
        params: &Value,
        now: DateTime<Utc>,
    ) -> Result<WidgetData, IntegrationError> {
        let provider = connection.provider_slug.as_str();
        let definition = connector.metadata().widget(widget_id).ok_or_else(|| {
            IntegrationError::validation(format!("{provider} does not provide widget '{widget_id}'"))
        })?;
        let ttl = StdDuration::from_secs(definition.refresh_interval_seconds);

        let tokens = self.usable_tokens(connection, now).await?;
        let data = connector
            .get_widget_data(&tokens, widget_id, params)
            .await
            .map_err(|e| IntegrationError::from_connector(provider, e))?;
        self.widget_cache.put(connection.id, &data, ttl).await;
        Ok(data)
    }

    /// Manual health probe for one workspace connection.
    pub async fn test(
        &self,
        workspace_id: Uuid,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<ProbeOutcome, IntegrationError> {
        let connection = self.get_active(workspace_id, provider).await?;
        self.probe(&connection, now).await
    }

    /// Runs `test_connection`; success clears ERROR, failure records it.
    pub async fn probe(
        &self,
        connection: &connection::Model,
        now: DateTime<Utc>,
    ) -> Result<ProbeOutcome, IntegrationError> {
        let connector = self.connector(&connection.provider_slug)?;
        let tokens = self.usable_tokens(connection, now).await?;

        let failure = match connector.test_connection(&tokens).await {
            Ok(true) => None,
            Ok(false) => Some("Provider rejected the stored credentials".to_string()),
            Err(e) => Some(format!("Connection test failed: {e}")),
        };

        let previous = connection.connection_status();
        match failure {
            None => {
                let updated = self.connections.mark_healthy(connection.id, now).await?;
                if previous != ConnectionStatus::Connected {
                    info!(connection_id = %connection.id, "Connection recovered");
                    self.publish_status(&updated, None);
                }
                Ok(ProbeOutcome {
                    healthy: true,
                    connection: updated,
                })
            }
            Some(message) => {
                let updated = self
                    .connections
                    .mark_failed(connection.id, ConnectionStatus::Error, &message, now)
                    .await?;
                if previous != ConnectionStatus::Error {
                    self.publish_status(&updated, Some(message));
                }
                Ok(ProbeOutcome {
                    healthy: false,
                    connection: updated,
                })
            }
        }
    }

    /// Replaces the enabled widget list; every id must be one the provider serves.
    pub async fn update_widgets(
        &self,
        workspace_id: Uuid,
        provider: &str,
        widgets: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let connector = self.connector(provider)?;
        let supported = connector.metadata().widget_ids();
        let unknown: Vec<&str> = widgets
            .iter()
            .filter(|w| !supported.contains(w))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(IntegrationError::validation(format!(
                "Unsupported widgets for {provider}: {}",
                unknown.join(", ")
            )));
        }

        let mut seen = HashSet::new();
        let widgets: Vec<String> = widgets
            .into_iter()
            .filter(|w| seen.insert(w.clone()))
            .collect();
        let connection = self.get_active(workspace_id, provider).await?;
        self.connections
            .update_enabled_widgets(connection.id, &widgets, now)
            .await
    }

    pub async fn update_config(
        &self,
        workspace_id: Uuid,
        provider: &str,
        config: Value,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        if !config.is_object() {
            return Err(IntegrationError::validation(
                "Connection config must be a JSON object",
            ));
        }
        let connection = self.get_active(workspace_id, provider).await?;
        self.connections.update_config(connection.id, config, now).await
    }

    /// Binds (or with `secret: None`, unbinds) the provider webhook for a connection.
    pub async fn bind_webhook(
        &self,
        workspace_id: Uuid,
        provider: &str,
        webhook_id: Option<String>,
        secret: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let connector = self.connector(provider)?;
        if !connector.supports(Capability::Webhooks) {
            return Err(IntegrationError::unsupported(format!(
                "{provider} does not support webhooks"
            )));
        }
        if secret.as_deref().is_some_and(str::is_empty) {
            return Err(IntegrationError::validation("Webhook secret must not be empty"));
        }
        let connection = self.get_active(workspace_id, provider).await?;
        self.connections
            .set_webhook(connection.id, webhook_id, secret.as_deref(), now)
            .await
    }

    fn publish_status(&self, connection: &connection::Model, reason: Option<String>) {
        self.events.publish(IntegrationEvent::ConnectionStatusChanged {
            connection_id: connection.id,
            workspace_id: connection.workspace_id,
            provider: connection.provider_slug.clone(),
            status: connection.connection_status(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::connectors::{GitHubConnector, SandboxConnector};
    use crate::crypto::TokenCipher;
    use crate::repositories::NewConnectionTokens;
    use chrono::Duration;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use serde_json::json;

    async fn service() -> ConnectionService {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let mut registry = Registry::new();
        registry.register(Arc::new(SandboxConnector::new()));
        registry.register(Arc::new(
            GitHubConnector::new(
                "client".to_string(),
                "secret".to_string(),
                None,
                None,
                StdDuration::from_secs(5),
            )
            .unwrap(),
        ));
        ConnectionService::new(
            Arc::new(registry),
            ConnectionRepository::new(
                Arc::new(db),
                Arc::new(TokenCipher::new(vec![9u8; 32]).unwrap()),
            ),
            WidgetCache::new(Arc::new(MemoryCache::new(100))),
            EventBus::default(),
        )
    }

    async fn connect(
        service: &ConnectionService,
        workspace_id: Uuid,
        refresh: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> connection::Model {
        let tokens = TokenSet {
            access_token: "sandbox-access-seed".to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at: Some(expires_at),
            scopes: vec!["read".to_string()],
        };
        service
            .repository()
            .upsert_connected(
                NewConnectionTokens {
                    workspace_id,
                    provider_slug: "sandbox",
                    tokens: &tokens,
                    connected_by: None,
                    sync_interval_minutes: 60,
                },
                Utc::now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_inline() {
        let service = service().await;
        let now = Utc::now();
        let conn = connect(&service, Uuid::new_v4(), Some("rt-1"), now - Duration::minutes(1)).await;

        let tokens = service.usable_tokens(&conn, now).await.unwrap();
        assert_ne!(tokens.access_token, "sandbox-access-seed");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));

        let stored = service.repository().get_by_id(conn.id).await.unwrap().unwrap();
        assert!(stored.token_expires_at.unwrap() > now);
        assert_eq!(stored.connection_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_requires_reauth() {
        let service = service().await;
        let now = Utc::now();
        let conn = connect(&service, Uuid::new_v4(), None, now - Duration::minutes(1)).await;

        let err = service.usable_tokens(&conn, now).await.unwrap_err();
        assert!(matches!(err, IntegrationError::TokenExpired { .. }));
        let stored = service.repository().get_by_id(conn.id).await.unwrap().unwrap();
        assert_eq!(stored.connection_status(), ConnectionStatus::NeedsReauth);

        let err = service.usable_tokens(&stored, now).await.unwrap_err();
        assert!(matches!(err, IntegrationError::TokenExpired { .. }));
    }

    #[tokio::test]
    async fn test_failed_inline_refresh_marks_expired() {
        let service = service().await;
        let now = Utc::now();
        let conn = connect(&service, Uuid::new_v4(), Some("revoked"), now - Duration::minutes(1)).await;

        assert!(matches!(
            service.usable_tokens(&conn, now).await,
            Err(IntegrationError::TokenExpired { .. })
        ));
        let stored = service.repository().get_by_id(conn.id).await.unwrap().unwrap();
        assert_eq!(stored.connection_status(), ConnectionStatus::Expired);
        assert_eq!(stored.last_error.as_deref(), Some(RECONNECT_MESSAGE));
    }

    #[tokio::test]
    async fn test_widget_data_is_cached() {
        let service = service().await;
        let workspace_id = Uuid::new_v4();
        let now = Utc::now();
        connect(&service, workspace_id, Some("rt"), now + Duration::hours(1)).await;

        let first = service
            .widget_data(workspace_id, "sandbox", "echo", &json!({"limit": 5}), now)
            .await
            .unwrap();
        assert!(!first.cached);
        assert_eq!(first.data["params"]["limit"], 5);

        let second = service
            .widget_data(workspace_id, "sandbox", "echo", &json!({}), now)
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.fetched_at, first.fetched_at);

        let unknown = service
            .widget_data(workspace_id, "sandbox", "nope", &json!({}), now)
            .await
            .unwrap_err();
        assert_eq!(unknown.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn test_probe_records_and_clears_errors() {
        let service = service().await;
        let workspace_id = Uuid::new_v4();
        let now = Utc::now();
        let conn = connect(&service, workspace_id, None, now + Duration::hours(1)).await;
        let mut events = service.events.subscribe();

        let outcome = service.test(workspace_id, "sandbox", now).await.unwrap();
        assert!(outcome.healthy);

        // Tokens not minted by the sandbox fail its probe
        let foreign = TokenSet {
            access_token: "foreign".to_string(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
        };
        service
            .repository()
            .update_tokens(conn.id, &foreign, now)
            .await
            .unwrap();
        let outcome = service.test(workspace_id, "sandbox", now).await.unwrap();
        assert!(!outcome.healthy);
        assert_eq!(outcome.connection.connection_status(), ConnectionStatus::Error);
        assert!(outcome.connection.last_error.is_some());
        assert!(matches!(
            events.recv().await.unwrap(),
            IntegrationEvent::ConnectionStatusChanged {
                status: ConnectionStatus::Error,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_settings_validation() {
        let service = service().await;
        let workspace_id = Uuid::new_v4();
        let now = Utc::now();
        connect(&service, workspace_id, None, now + Duration::hours(1)).await;

        let updated = service
            .update_widgets(workspace_id, "sandbox", vec!["echo".to_string()], now)
            .await
            .unwrap();
        assert_eq!(updated.enabled_widget_ids(), vec!["echo".to_string()]);
        assert!(
            service
                .update_widgets(workspace_id, "sandbox", vec!["missing".to_string()], now)
                .await
                .is_err()
        );

        assert!(
            service
                .update_config(workspace_id, "sandbox", json!([1, 2]), now)
                .await
                .is_err()
        );
        let updated = service
            .update_config(workspace_id, "sandbox", json!({"org": "acme"}), now)
            .await
            .unwrap();
        assert_eq!(updated.config["org"], "acme");

        let bound = service
            .bind_webhook(workspace_id, "sandbox", Some("hook".to_string()), Some("whsec".to_string()), now)
            .await
            .unwrap();
        assert_eq!(
            service.repository().decrypt_webhook_secret(&bound).unwrap().as_deref(),
            Some("whsec")
        );
    }

    #[tokio::test]
    async fn test_widget_selection_drops_repeats_in_order() {
        let service = service().await;
        let workspace_id = Uuid::new_v4();
        let now = Utc::now();
        let tokens = TokenSet {
            access_token: "gho_seed".to_string(),
            refresh_token: None,
            expires_at: None,
            scopes: vec!["repo".to_string()],
        };
        service
            .repository()
            .upsert_connected(
                NewConnectionTokens {
                    workspace_id,
                    provider_slug: "github",
                    tokens: &tokens,
                    connected_by: None,
                    sync_interval_minutes: 60,
                },
                now,
            )
            .await
            .unwrap();

        let selection = ["repositories", "profile", "repositories", "profile"]
            .map(str::to_string)
            .to_vec();
        let updated = service
            .update_widgets(workspace_id, "github", selection, now)
            .await
            .unwrap();
        assert_eq!(
            updated.enabled_widget_ids(),
            vec!["repositories".to_string(), "profile".to_string()]
        );
    }
}
