//! # Webhook Handlers
//!
//! Public intake for provider webhook deliveries. Authentication is the provider
//! signature over the raw body, checked by the webhook gate before anything is parsed.

use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;
use utoipa::ToSchema;

/// Acknowledgement for a handled delivery
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAcceptResponse {
    /// "processed" for a new event, "duplicate" for a replayed event id
    #[schema(example = "processed")]
    pub status: String,
}

/// Accept a webhook from an external provider
///
/// The owning connection is taken from the optional `X-Connection-Id` header, otherwise
/// the provider's oldest connection with a stored secret is used. Replays of an event id
/// already seen are acknowledged without being processed again.
#[utoipa::path(
    post,
    path = "/webhooks/{provider}",
    params(
        ("provider" = String, Path, description = "Provider slug"),
        ("X-Connection-Id" = Option<String>, Header, description = "Optional connection ID to target")
    ),
    request_body(content = Option<JsonValue>, description = "Webhook payload as signed by the provider", content_type = "application/json"),
    responses(
        (status = 200, description = "Webhook handled or recognised as a duplicate", body = WebhookAcceptResponse),
        (status = 400, description = "Malformed payload or provider does not accept webhooks", body = ApiError),
        (status = 401, description = "Missing or invalid signature", body = ApiError),
        (status = 404, description = "Unknown provider or no owning connection", body = ApiError),
        (status = 413, description = "Body too large", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAcceptResponse>, ApiError> {
    debug!(provider = %provider, body_len = body.len(), "Webhook delivery received");

    let ack = state
        .webhooks
        .ingest(&provider, &headers, body, Utc::now())
        .await?;

    Ok(Json(WebhookAcceptResponse {
        status: ack.status().to_string(),
    }))
}
