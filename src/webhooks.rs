//! # Webhook Ingestion
//!
//! [`WebhookGate`] takes a raw provider delivery through attribution, signature
//! verification, replay protection and connector dispatch. Only signature and lookup
//! failures are reported precisely; anything that goes wrong inside dispatch becomes a
//! generic failure.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{IdempotencyStore, WidgetCache};
use crate::connectors::{Capability, Connector, Registry, WebhookEvent, WebhookOutcome};
use crate::error::{ApiError, IntegrationError};
use crate::events::{EventBus, IntegrationEvent};
use crate::models::ConnectionStatus;
use crate::models::connection;
use crate::repositories::ConnectionRepository;
use crate::webhook_verification::{VerificationError, claimed_signature, verify_signature};

/// Largest accepted webhook body.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;

/// Header naming the connection a delivery belongs to.
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Outcome of an accepted delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    Processed { event_type: String },
    /// The event id was seen before; nothing was dispatched.
    Duplicate,
}

impl WebhookAck {
    pub fn status(&self) -> &'static str {
        match self {
            WebhookAck::Processed { .. } => "processed",
            WebhookAck::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider {0} does not accept webhooks")]
    Unsupported(String),
    #[error("invalid X-Connection-Id header")]
    InvalidConnectionId,
    #[error("no matching connection for provider {0}")]
    ConnectionNotFound(String),
    #[error("webhook body exceeds 1 MiB")]
    PayloadTooLarge,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    Signature(#[from] VerificationError),
    #[error("webhook dispatch failed: {0}")]
    Dispatch(String),
    #[error(transparent)]
    Internal(#[from] IntegrationError),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::UnknownProvider(_) | WebhookError::ConnectionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            WebhookError::Unsupported(_)
            | WebhookError::InvalidConnectionId
            | WebhookError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            WebhookError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            WebhookError::Signature(e) => e.status_code(),
            WebhookError::Dispatch(_) | WebhookError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn metric_reason(&self) -> &'static str {
        match self {
            WebhookError::UnknownProvider(_) => "unknown_provider",
            WebhookError::Unsupported(_) => "unsupported",
            WebhookError::InvalidConnectionId => "invalid_connection_id",
            WebhookError::ConnectionNotFound(_) => "connection_not_found",
            WebhookError::PayloadTooLarge => "too_large",
            WebhookError::MalformedPayload(_) => "malformed",
            WebhookError::Signature(_) => "signature",
            WebhookError::Dispatch(_) => "dispatch",
            WebhookError::Internal(_) => "internal",
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(error: WebhookError) -> Self {
        let status = error.status_code();
        match error {
            WebhookError::Signature(_) => {
                ApiError::new(status, "UNAUTHORIZED", "Invalid webhook signature")
            }
            WebhookError::UnknownProvider(_) | WebhookError::ConnectionNotFound(_) => {
                ApiError::new(status, "NOT_FOUND", error.to_string())
            }
            WebhookError::Unsupported(_)
            | WebhookError::InvalidConnectionId
            | WebhookError::MalformedPayload(_) => {
                ApiError::new(status, "VALIDATION_FAILED", error.to_string())
            }
            WebhookError::PayloadTooLarge => {
                ApiError::new(status, "PAYLOAD_TOO_LARGE", error.to_string())
            }
            WebhookError::Dispatch(_) | WebhookError::Internal(_) => ApiError::new(
                status,
                "INTERNAL_SERVER_ERROR",
                "Webhook could not be processed",
            ),
        }
    }
}

#[derive(Clone)]
pub struct WebhookGate {
    registry: Arc<Registry>,
    connections: ConnectionRepository,
    idempotency: IdempotencyStore,
    widget_cache: WidgetCache,
    events: EventBus,
}

impl WebhookGate {
    pub fn new(
        registry: Arc<Registry>,
        connections: ConnectionRepository,
        idempotency: IdempotencyStore,
        widget_cache: WidgetCache,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            connections,
            idempotency,
            widget_cache,
            events,
        }
    }

    /// Processes one delivery for `provider`.
    pub async fn ingest(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: Bytes,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, WebhookError> {
        let result = self.process(provider, headers, body, now).await;
        let labels = vec![("provider", provider.to_string())];
        match &result {
            Ok(WebhookAck::Processed { .. }) => {
                counter!("webhook_processed_total", &labels).increment(1)
            }
            Ok(WebhookAck::Duplicate) => counter!("webhook_duplicate_total", &labels).increment(1),
            Err(e) => {
                let labels = vec![
                    ("provider", provider.to_string()),
                    ("reason", e.metric_reason().to_string()),
                ];
                counter!("webhook_rejected_total", &labels).increment(1);
            }
        }
        result
    }

    async fn process(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: Bytes,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, WebhookError> {
        if body.len() > MAX_WEBHOOK_BODY_BYTES {
            return Err(WebhookError::PayloadTooLarge);
        }

        let connector = self
            .registry
            .get(provider)
            .ok_or_else(|| WebhookError::UnknownProvider(provider.to_string()))?;
        if !connector.supports(Capability::Webhooks) {
            return Err(WebhookError::Unsupported(provider.to_string()));
        }

        let connection = self.resolve_connection(provider, headers).await?;
        let signature = self.verify(connector.as_ref(), &connection, headers, &body)?;

        let payload: Value = serde_json::from_slice(&body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let event_id = connector.webhook_event_id(headers, &payload);
        if let Some(event_id) = event_id.as_deref()
            && self.already_processed(provider, event_id).await
        {
            debug!(provider, event_id, "Duplicate webhook delivery ignored");
            return Ok(WebhookAck::Duplicate);
        }

        let event = WebhookEvent {
            connection_id: Some(connection.id),
            headers: headers.clone(),
            payload,
            signature,
        };
        let outcome = connector.handle_webhook(&event).await.map_err(|e| {
            error!(provider, connection_id = %connection.id, error = %e, "Webhook dispatch failed");
            WebhookError::Dispatch(e.to_string())
        })?;

        if let Some(event_id) = event_id.as_deref()
            && let Err(e) = self.idempotency.mark_processed(provider, event_id, now).await
        {
            warn!(provider, event_id, error = %e, "Failed to record processed webhook");
        }

        self.apply_outcome(connector.as_ref(), &connection, &outcome, now)
            .await;

        self.events.publish(IntegrationEvent::WebhookReceived {
            provider: provider.to_string(),
            event_type: outcome.event_type.clone(),
            connection_id: outcome.affected_connection_id.or(Some(connection.id)),
            event_id,
            received_at: now,
        });

        info!(provider, event_type = %outcome.event_type, "Webhook processed");
        Ok(WebhookAck::Processed {
            event_type: outcome.event_type,
        })
    }

    async fn resolve_connection(
        &self,
        provider: &str,
        headers: &HeaderMap,
    ) -> Result<connection::Model, WebhookError> {
        let explicit = match headers.get(CONNECTION_ID_HEADER) {
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
                    .ok_or(WebhookError::InvalidConnectionId)?,
            ),
            None => None,
        };

        self.connections
            .find_webhook_target(provider, explicit)
            .await?
            .filter(|c| c.connection_status() != ConnectionStatus::Disconnected)
            .ok_or_else(|| WebhookError::ConnectionNotFound(provider.to_string()))
    }

    /// Returns the claimed signature once it has been checked (or tolerated).
    fn verify(
        &self,
        connector: &dyn Connector,
        connection: &connection::Model,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<String>, WebhookError> {
        let Some(scheme) = connector.metadata().webhook_signature.as_ref() else {
            return Ok(None);
        };
        let claimed = claimed_signature(scheme, headers);

        match self.connections.decrypt_webhook_secret(connection)? {
            Some(secret) => {
                verify_signature(scheme, &secret, body, claimed.as_deref()).inspect_err(|e| {
                    warn!(
                        provider = %connection.provider_slug,
                        connection_id = %connection.id,
                        error = %e,
                        "Webhook signature rejected"
                    );
                })?;
            }
            None if claimed.is_some() => {
                warn!(
                    provider = %connection.provider_slug,
                    connection_id = %connection.id,
                    "Signed webhook for a connection without a stored secret; accepting unverified"
                );
            }
            None => {}
        }
        Ok(claimed)
    }

    /// Unreadable idempotency records count as unseen.
    async fn already_processed(&self, provider: &str, event_id: &str) -> bool {
        match self.idempotency.is_processed(provider, event_id).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(provider, event_id, error = %e, "Idempotency lookup failed");
                false
            }
        }
    }

    async fn apply_outcome(
        &self,
        connector: &dyn Connector,
        connection: &connection::Model,
        outcome: &WebhookOutcome,
        now: DateTime<Utc>,
    ) {
        let affected = outcome.affected_connection_id.unwrap_or(connection.id);

        if let Some(reason) = outcome.unhealthy_reason.as_deref() {
            match self
                .connections
                .mark_failed(affected, ConnectionStatus::Error, reason, now)
                .await
            {
                Ok(updated) => self.events.publish(IntegrationEvent::ConnectionStatusChanged {
                    connection_id: updated.id,
                    workspace_id: updated.workspace_id,
                    provider: updated.provider_slug.clone(),
                    status: ConnectionStatus::Error,
                    reason: Some(reason.to_string()),
                }),
                Err(e) => {
                    error!(connection_id = %affected, error = %e, "Failed to record webhook-reported failure")
                }
            }
        }

        self.widget_cache
            .invalidate_connection(affected, &connector.metadata().widget_ids())
            .await;
    }
}
