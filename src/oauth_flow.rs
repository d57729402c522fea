//! OAuth flow controller
//!
//! Issues single-use state tokens, completes callbacks, and tears connections down.
//! Every method takes the current time explicitly so expiry rules can be exercised
//! deterministically.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::WidgetCache;
use crate::config::AppConfig;
use crate::connectors::{Capability, Connector, Registry, TokenSet};
use crate::error::{IntegrationError, OAuthFailure};
use crate::events::{EventBus, IntegrationEvent};
use crate::models::ConnectionStatus;
use crate::models::connection;
use crate::repositories::{
    ConnectionRepository, NewConnectionTokens, NewOAuthState, OAuthStateRepository,
    StateConsumption,
};

const STATE_TOKEN_BYTES: usize = 32;
const MAX_AUTHORIZATION_URL_LEN: usize = 2048;

/// A started authorization request
#[derive(Debug, Clone)]
pub struct AuthorizationStart {
    pub provider: String,
    pub authorization_url: Url,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

/// Query parameters a provider redirects back with
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Clone)]
pub struct OAuthFlowService {
    registry: Arc<Registry>,
    connections: ConnectionRepository,
    states: OAuthStateRepository,
    widget_cache: WidgetCache,
    events: EventBus,
    config: Arc<AppConfig>,
}

impl OAuthFlowService {
    pub fn new(
        registry: Arc<Registry>,
        connections: ConnectionRepository,
        states: OAuthStateRepository,
        widget_cache: WidgetCache,
        events: EventBus,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            registry,
            connections,
            states,
            widget_cache,
            events,
            config,
        }
    }

    fn oauth_connector(&self, provider: &str) -> Result<Arc<dyn Connector>, IntegrationError> {
        let connector = self
            .registry
            .get(provider)
            .ok_or_else(|| IntegrationError::unknown_provider(provider))?;
        if !connector.supports(Capability::OAuth) {
            return Err(IntegrationError::unsupported(format!(
                "{provider} does not support OAuth"
            )));
        }
        Ok(connector)
    }

    /// Persists a fresh state and returns the provider consent URL carrying it.
    ///
    /// Allowed while already connected; the callback then overwrites the credentials.
    pub async fn initiate(
        &self,
        workspace_id: Uuid,
        provider: &str,
        scopes: Option<Vec<String>>,
        initiated_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationStart, IntegrationError> {
        let connector = self.oauth_connector(provider)?;
        let scopes = scopes
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| connector.metadata().default_scopes.clone());

        let token = generate_state_token();
        let redirect_uri = self.config.redirect_uri_for(provider);
        let expires_at = now + self.config.oauth_state_ttl();

        let authorization_url = connector
            .authorization_url(&token, &redirect_uri, &scopes)
            .map_err(|e| IntegrationError::from_connector(provider, e))?;
        validate_authorization_url(&authorization_url)?;

        self.states
            .create(
                NewOAuthState {
                    token: token.clone(),
                    workspace_id,
                    provider_slug: provider.to_string(),
                    redirect_uri,
                    scopes,
                    initiated_by,
                    expires_at,
                },
                now,
            )
            .await?;

        info!(%workspace_id, provider, "OAuth flow initiated");

        Ok(AuthorizationStart {
            provider: provider.to_string(),
            authorization_url,
            state: token,
            expires_at,
        })
    }

    /// Same as [`Self::initiate`]; existing credentials stay in place until the callback.
    pub async fn reconnect(
        &self,
        workspace_id: Uuid,
        provider: &str,
        scopes: Option<Vec<String>>,
        initiated_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationStart, IntegrationError> {
        self.initiate(workspace_id, provider, scopes, initiated_by, now)
            .await
    }

    /// Completes an authorization: consumes the state, exchanges the code, stores the
    /// connection and probes it.
    pub async fn handle_callback(
        &self,
        provider: &str,
        params: CallbackParams,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let token = params
            .state
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(IntegrationError::OAuth(OAuthFailure::UnknownState))?;

        let state = match self.states.consume(token, now).await? {
            StateConsumption::Consumed(state) => state,
            StateConsumption::Unknown => {
                return Err(IntegrationError::OAuth(OAuthFailure::UnknownState));
            }
            StateConsumption::Expired => {
                return Err(IntegrationError::OAuth(OAuthFailure::ExpiredState));
            }
            StateConsumption::AlreadyUsed => {
                warn!(provider, "OAuth state replayed");
                return Err(IntegrationError::OAuth(OAuthFailure::StateAlreadyUsed));
            }
        };

        if state.provider_slug != provider {
            self.note_state_error(token, &format!("callback arrived for {provider}")).await;
            return Err(IntegrationError::OAuth(OAuthFailure::ProviderMismatch));
        }

        if let Some(error) = params.error {
            let detail = match params.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error.clone(),
            };
            self.note_state_error(token, &detail).await;
            return Err(IntegrationError::OAuth(OAuthFailure::AccessDenied(error)));
        }

        let Some(code) = params.code.filter(|c| !c.is_empty()) else {
            self.note_state_error(token, "missing code").await;
            return Err(IntegrationError::OAuth(OAuthFailure::ExchangeFailed(
                "missing code".to_string(),
            )));
        };

        let connector = match self.oauth_connector(provider) {
            Ok(connector) => connector,
            Err(e) => {
                self.note_state_error(token, &e.to_string()).await;
                return Err(e);
            }
        };

        let mut tokens = match connector.exchange_code(&code, &state.redirect_uri).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(provider, workspace_id = %state.workspace_id, error = %e, "OAuth code exchange failed");
                self.note_state_error(token, &e.to_string()).await;
                return Err(IntegrationError::OAuth(OAuthFailure::ExchangeFailed(
                    e.to_string(),
                )));
            }
        };
        if tokens.scopes.is_empty() {
            tokens.scopes = state.requested_scopes();
        }

        let connection = self
            .connections
            .upsert_connected(
                NewConnectionTokens {
                    workspace_id: state.workspace_id,
                    provider_slug: provider,
                    tokens: &tokens,
                    connected_by: state.initiated_by.clone(),
                    sync_interval_minutes: self.config.scheduler.default_connection_interval_minutes,
                },
                now,
            )
            .await?;
        self.widget_cache
            .invalidate_connection(connection.id, &connector.metadata().widget_ids())
            .await;

        self.verify_new_connection(connector.as_ref(), connection, &tokens, now)
            .await
    }

    /// Stores the callback failure on the state row; a failed write is only logged.
    async fn note_state_error(&self, token: &str, detail: &str) {
        if let Err(e) = self.states.record_error(token, detail).await {
            warn!(error = %e, "Failed to record OAuth state error");
        }
    }

    async fn verify_new_connection(
        &self,
        connector: &dyn Connector,
        connection: connection::Model,
        tokens: &TokenSet,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let provider = connection.provider_slug.clone();
        let failure = match connector.test_connection(tokens).await {
            Ok(true) => None,
            Ok(false) => Some("Provider rejected the new credentials".to_string()),
            Err(e) => Some(format!("Connection test failed: {e}")),
        };

        match failure {
            None => {
                info!(connection_id = %connection.id, provider = %provider, "Connection established");
                self.publish_status(&connection, ConnectionStatus::Connected, None);
                Ok(connection)
            }
            Some(message) => {
                let connection = self
                    .connections
                    .mark_failed(connection.id, ConnectionStatus::Error, &message, now)
                    .await?;
                self.publish_status(&connection, ConnectionStatus::Error, Some(message.clone()));
                Err(IntegrationError::Integration {
                    code: "CONNECTION_TEST_FAILED",
                    status: axum::http::StatusCode::BAD_GATEWAY,
                    message,
                })
            }
        }
    }

    /// Revokes at the provider (best effort), then nulls the stored secrets.
    pub async fn disconnect(
        &self,
        workspace_id: Uuid,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let connection = self
            .connections
            .find_by_workspace_and_provider(workspace_id, provider)
            .await?
            .ok_or_else(|| IntegrationError::connection_not_found(provider))?;

        if connection.connection_status() == ConnectionStatus::Disconnected {
            return Ok(connection);
        }

        let connector = self.registry.get(provider);
        if let Some(connector) = &connector {
            self.revoke_best_effort(connector.as_ref(), &connection).await;
        } else {
            warn!(provider, "No connector registered; skipping revoke");
        }

        let disconnected = self.connections.disconnect(connection.id, now).await?;

        let mut widget_ids = connection.enabled_widget_ids();
        if let Some(connector) = &connector {
            widget_ids.extend(connector.metadata().widget_ids());
        }
        widget_ids.sort();
        widget_ids.dedup();
        self.widget_cache
            .invalidate_connection(connection.id, &widget_ids)
            .await;

        info!(connection_id = %connection.id, provider, "Connection disconnected");
        self.publish_status(&disconnected, ConnectionStatus::Disconnected, None);
        Ok(disconnected)
    }

    async fn revoke_best_effort(&self, connector: &dyn Connector, connection: &connection::Model) {
        let tokens = match self.connections.decrypt_tokens(connection) {
            Ok(Some(tokens)) => tokens,
            Ok(None) => return,
            Err(e) => {
                warn!(connection_id = %connection.id, error = %e, "Cannot decrypt tokens for revoke");
                return;
            }
        };
        if let Err(e) = connector.revoke_token(&tokens.access_token).await {
            warn!(
                connection_id = %connection.id,
                provider = %connection.provider_slug,
                error = %e,
                "Token revoke failed; disconnecting locally"
            );
        }
    }

    fn publish_status(
        &self,
        connection: &connection::Model,
        status: ConnectionStatus,
        reason: Option<String>,
    ) {
        self.events.publish(IntegrationEvent::ConnectionStatusChanged {
            connection_id: connection.id,
            workspace_id: connection.workspace_id,
            provider: connection.provider_slug.clone(),
            status,
            reason,
        });
    }
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_state_token() -> String {
    let mut bytes = [0u8; STATE_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn validate_authorization_url(url: &Url) -> Result<(), IntegrationError> {
    if url.fragment().is_some() || url.as_str().len() > MAX_AUTHORIZATION_URL_LEN {
        return Err(IntegrationError::Integration {
            code: "INTERNAL_SERVER_ERROR",
            status: axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            message: "Connector produced an invalid authorization URL".to_string(),
        });
    }
    Ok(())
}
