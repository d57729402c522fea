//! Connector trait and shared types
//!
//! Every provider integration implements [`Connector`]. Operations a provider does not
//! offer return [`ConnectorError::Unsupported`]; the advertised capability set in
//! [`ProviderMetadata`] tells callers which ones to expect.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::connectors::metadata::{Capability, ProviderMetadata};

/// Payload fields checked, in order, for a provider-native event id.
pub const EVENT_ID_FIELDS: [&str; 4] = ["event_id", "eventId", "id", "delivery_id"];

/// Errors returned by connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("provider returned HTTP {status}")]
    Http { status: u16, body: String },
    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<u64> },
    #[error("provider rejected credentials: {0}")]
    Authentication(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("connector misconfigured: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for ConnectorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ConnectorError::Timeout
        } else if error.is_decode() {
            ConnectorError::MalformedResponse(error.to_string())
        } else {
            ConnectorError::Network(error.to_string())
        }
    }
}

/// Decrypted token tuple exchanged with providers.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl TokenSet {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Data returned for a widget, stamped with the time it was fetched.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WidgetData {
    pub widget_id: String,
    #[schema(value_type = Object)]
    pub data: Value,
    pub fetched_at: DateTime<Utc>,
}

/// An inbound webhook after signature verification.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// Connection the delivery was attributed to, if any.
    pub connection_id: Option<Uuid>,
    pub headers: HeaderMap,
    pub payload: Value,
    pub signature: Option<String>,
}

/// What a connector made of a webhook delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookOutcome {
    pub event_type: String,
    pub affected_connection_id: Option<Uuid>,
    pub updated_data: Option<Value>,
    /// Set when the event means the connection can no longer be trusted
    /// (e.g. the user revoked the grant at the provider).
    pub unhealthy_reason: Option<String>,
}

/// Trait that all provider connectors implement
#[async_trait]
pub trait Connector: Send + Sync {
    fn metadata(&self) -> &ProviderMetadata;

    fn slug(&self) -> &str {
        &self.metadata().slug
    }

    fn supports(&self, capability: Capability) -> bool {
        self.metadata().capabilities.contains(&capability)
    }

    /// Build the provider consent URL carrying `state`.
    fn authorization_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<Url, ConnectorError>;

    async fn exchange_code(&self, code: &str, redirect_uri: &str)
    -> Result<TokenSet, ConnectorError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ConnectorError>;

    /// Best-effort revocation at the provider.
    async fn revoke_token(&self, access_token: &str) -> Result<(), ConnectorError>;

    /// `Ok(false)` means the provider answered and rejected the credentials.
    async fn test_connection(&self, tokens: &TokenSet) -> Result<bool, ConnectorError>;

    async fn get_widget_data(
        &self,
        tokens: &TokenSet,
        widget_id: &str,
        params: &Value,
    ) -> Result<WidgetData, ConnectorError>;

    /// Provider-native id of a webhook delivery, used for replay protection.
    fn webhook_event_id(&self, _headers: &HeaderMap, payload: &Value) -> Option<String> {
        event_id_from_payload(payload)
    }

    async fn handle_webhook(&self, _event: &WebhookEvent) -> Result<WebhookOutcome, ConnectorError> {
        Err(ConnectorError::Unsupported("webhooks"))
    }
}

/// Looks up the first of [`EVENT_ID_FIELDS`] holding a non-empty string or a number.
pub fn event_id_from_payload(payload: &Value) -> Option<String> {
    EVENT_ID_FIELDS.iter().find_map(|field| match payload.get(field) {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    })
}

/// Flattens a JSON object of scalars into query pairs; nested values are skipped.
pub fn params_to_query(params: &Value) -> Vec<(String, String)> {
    let Some(object) = params.as_object() else {
        return Vec::new();
    };
    object
        .iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key.clone(), s.clone())),
            Value::Number(n) => Some((key.clone(), n.to_string())),
            Value::Bool(b) => Some((key.clone(), b.to_string())),
            _ => None,
        })
        .collect()
}
