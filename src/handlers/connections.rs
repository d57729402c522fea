//! # Connection Handlers
//!
//! Workspace-scoped connection management: starting and redoing OAuth flows,
//! disconnecting, probing, syncing and per-connection settings.

use std::collections::HashMap;

use crate::auth::{Initiator, OperatorAuth, WorkspaceExtension, WorkspaceHeader};
use crate::connection_service::WidgetPayload;
use crate::error::{ApiError, IntegrationError, validation_error};
use crate::models::{ConnectionResponse, ConnectionStatus};
use crate::oauth_flow::AuthorizationStart;
use crate::server::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Connections for the calling workspace
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionResponse>,
}

/// Optional body for connect and reconnect
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct ConnectRequest {
    /// Scopes to request; the provider defaults apply when omitted or empty
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

/// Where to send the user to grant access
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthorizationResponse {
    pub provider: String,
    /// Provider consent URL carrying the state parameter
    pub authorization_url: String,
    /// Single-use state token bound to this request
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

impl From<AuthorizationStart> for AuthorizationResponse {
    fn from(start: AuthorizationStart) -> Self {
        Self {
            provider: start.provider,
            authorization_url: start.authorization_url.to_string(),
            state: start.state,
            expires_at: start.expires_at,
        }
    }
}

/// Result of a live provider probe
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TestConnectionResponse {
    pub healthy: bool,
    pub connection: ConnectionResponse,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateWidgetsRequest {
    /// Widget ids to enable; each must be served by the provider
    pub widgets: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BindWebhookRequest {
    /// Provider-side webhook identifier
    #[serde(default)]
    pub webhook_id: Option<String>,
    /// Shared signing secret; null removes the stored secret
    #[serde(default)]
    pub secret: Option<String>,
}

fn parse_connect_body(body: &Bytes) -> Result<ConnectRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ConnectRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        validation_error(
            "Invalid request body",
            serde_json::json!({ "body": err.to_string() }),
        )
    })
}

/// List the workspace's connections
#[utoipa::path(
    get,
    path = "/connections",
    security(("bearer_auth" = [])),
    params(WorkspaceHeader),
    responses(
        (status = 200, description = "Connections for the workspace", body = ConnectionsResponse),
        (status = 400, description = "Missing or invalid workspace header", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
) -> Result<Json<ConnectionsResponse>, ApiError> {
    let connections = state.connections.list(workspace.0).await?;
    Ok(Json(ConnectionsResponse {
        connections: connections.into_iter().map(ConnectionResponse::from).collect(),
    }))
}

/// Fetch one connection
#[utoipa::path(
    get,
    path = "/connections/{provider}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    responses(
        (status = 200, description = "Connection", body = ConnectionResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "No connection to this provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Path(provider): Path<String>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state.connections.get(workspace.0, &provider).await?;
    Ok(Json(connection.into()))
}

/// Start an OAuth flow
///
/// Returns the provider consent URL. The state parameter expires after the configured
/// TTL and can be used exactly once.
#[utoipa::path(
    post,
    path = "/connections/{provider}/connect",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    request_body(content = ConnectRequest, description = "Optional scope override; the body may be empty"),
    responses(
        (status = 200, description = "Authorization URL generated", body = AuthorizationResponse),
        (status = 400, description = "Provider does not support OAuth or invalid body", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn connect(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Initiator(user): Initiator,
    Path(provider): Path<String>,
    body: Bytes,
) -> Result<Json<AuthorizationResponse>, ApiError> {
    let request = parse_connect_body(&body)?;
    let start = state
        .oauth
        .initiate(workspace.0, &provider, request.scopes, user, Utc::now())
        .await?;
    Ok(Json(start.into()))
}

/// Start a new OAuth flow for an existing connection
#[utoipa::path(
    post,
    path = "/connections/{provider}/reconnect",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    request_body(content = ConnectRequest, description = "Optional scope override; the body may be empty"),
    responses(
        (status = 200, description = "Authorization URL generated", body = AuthorizationResponse),
        (status = 400, description = "Provider does not support OAuth or invalid body", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn reconnect(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Initiator(user): Initiator,
    Path(provider): Path<String>,
    body: Bytes,
) -> Result<Json<AuthorizationResponse>, ApiError> {
    let request = parse_connect_body(&body)?;
    let start = state
        .oauth
        .reconnect(workspace.0, &provider, request.scopes, user, Utc::now())
        .await?;
    Ok(Json(start.into()))
}

/// Disconnect from a provider
///
/// Revocation at the provider is best effort; stored credentials are always cleared.
#[utoipa::path(
    post,
    path = "/connections/{provider}/disconnect",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    responses(
        (status = 200, description = "Connection disconnected", body = ConnectionResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "No connection to this provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn disconnect(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Path(provider): Path<String>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state
        .oauth
        .disconnect(workspace.0, &provider, Utc::now())
        .await?;
    Ok(Json(connection.into()))
}

/// Probe the provider with the stored credentials
#[utoipa::path(
    post,
    path = "/connections/{provider}/test",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    responses(
        (status = 200, description = "Probe result", body = TestConnectionResponse),
        (status = 401, description = "Unauthorized or reconnect required", body = ApiError),
        (status = 404, description = "No active connection to this provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn test_connection(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Path(provider): Path<String>,
) -> Result<Json<TestConnectionResponse>, ApiError> {
    let outcome = state
        .connections
        .test(workspace.0, &provider, Utc::now())
        .await?;
    Ok(Json(TestConnectionResponse {
        healthy: outcome.healthy,
        connection: outcome.connection.into(),
    }))
}

/// Sync every enabled widget now
#[utoipa::path(
    post,
    path = "/connections/{provider}/sync",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    responses(
        (status = 200, description = "Connection after the sync attempt", body = ConnectionResponse),
        (status = 400, description = "Connection is not connected", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "No connection to this provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn sync_connection(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Path(provider): Path<String>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state.connections.get(workspace.0, &provider).await?;
    let status = connection.connection_status();
    if status != ConnectionStatus::Connected {
        return Err(IntegrationError::validation(format!(
            "Connection is {}; only connected connections can be synced",
            status.as_str()
        ))
        .into());
    }
    let updated = state
        .scheduler
        .sync_connection(&connection, Utc::now())
        .await?;
    Ok(Json(updated.into()))
}

/// Widget data, served from cache while fresh
///
/// Query parameters are passed through to the provider.
#[utoipa::path(
    get,
    path = "/connections/{provider}/widgets/{widget_id}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        ("widget_id" = String, Path, description = "Widget identifier"),
        WorkspaceHeader
    ),
    responses(
        (status = 200, description = "Widget data", body = WidgetPayload),
        (status = 400, description = "Widget not enabled or not supported", body = ApiError),
        (status = 401, description = "Unauthorized or reconnect required", body = ApiError),
        (status = 404, description = "No active connection to this provider", body = ApiError),
        (status = 429, description = "Provider rate limited the request", body = ApiError),
        (status = 502, description = "Provider failure", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_widget_data(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Path((provider, widget_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<WidgetPayload>, ApiError> {
    let params: serde_json::Map<String, Value> = query
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    let payload = state
        .connections
        .widget_data(
            workspace.0,
            &provider,
            &widget_id,
            &Value::Object(params),
            Utc::now(),
        )
        .await?;
    Ok(Json(payload))
}

/// Replace the set of enabled widgets
#[utoipa::path(
    put,
    path = "/connections/{provider}/widgets",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    request_body = UpdateWidgetsRequest,
    responses(
        (status = 200, description = "Updated connection", body = ConnectionResponse),
        (status = 400, description = "Unknown widget id", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "No active connection to this provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn update_widgets(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Path(provider): Path<String>,
    Json(request): Json<UpdateWidgetsRequest>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state
        .connections
        .update_widgets(workspace.0, &provider, request.widgets, Utc::now())
        .await?;
    Ok(Json(connection.into()))
}

/// Replace the connection's free-form configuration
#[utoipa::path(
    put,
    path = "/connections/{provider}/config",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    request_body(content = Value, description = "JSON object stored verbatim", content_type = "application/json"),
    responses(
        (status = 200, description = "Updated connection", body = ConnectionResponse),
        (status = 400, description = "Body is not a JSON object", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "No active connection to this provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn update_config(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Path(provider): Path<String>,
    Json(config): Json<Value>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state
        .connections
        .update_config(workspace.0, &provider, config, Utc::now())
        .await?;
    Ok(Json(connection.into()))
}

/// Bind the provider webhook id and signing secret
#[utoipa::path(
    put,
    path = "/connections/{provider}/webhook",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    request_body = BindWebhookRequest,
    responses(
        (status = 200, description = "Updated connection", body = ConnectionResponse),
        (status = 400, description = "Provider does not accept webhooks", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "No active connection to this provider", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn bind_webhook(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    WorkspaceExtension(workspace): WorkspaceExtension,
    Path(provider): Path<String>,
    Json(request): Json<BindWebhookRequest>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state
        .connections
        .bind_webhook(
            workspace.0,
            &provider,
            request.webhook_id,
            request.secret,
            Utc::now(),
        )
        .await?;
    Ok(Json(connection.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_connect_body_uses_provider_defaults() {
        let request = parse_connect_body(&Bytes::new()).unwrap();
        assert!(request.scopes.is_none());

        let request = parse_connect_body(&Bytes::from_static(b"  \n")).unwrap();
        assert!(request.scopes.is_none());
    }

    #[test]
    fn connect_body_carries_scopes() {
        let request = parse_connect_body(&Bytes::from_static(br#"{"scopes":["repo"]}"#)).unwrap();
        assert_eq!(request.scopes, Some(vec!["repo".to_string()]));
    }

    #[test]
    fn malformed_connect_body_is_rejected() {
        let err = parse_connect_body(&Bytes::from_static(b"{not json")).unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }
}
