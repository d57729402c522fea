//! # Providers API Handlers
//!
//! This module contains handlers for the providers endpoints, served straight from the
//! connector registry.

use crate::auth::{OperatorAuth, WorkspaceHeader};
use crate::connectors::ProviderMetadata;
use crate::error::{ApiError, IntegrationError};
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response containing the registered providers
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProvidersResponse {
    /// Registered providers sorted by slug
    pub providers: Vec<ProviderMetadata>,
}

/// List every provider the registry knows about
#[utoipa::path(
    get,
    path = "/providers",
    security(("bearer_auth" = [])),
    params(WorkspaceHeader),
    responses(
        (status = 200, description = "Registered providers", body = ProvidersResponse, example = json!({
            "providers": [
                {
                    "slug": "github",
                    "display_name": "GitHub",
                    "capabilities": ["oauth", "widget_data", "webhooks"],
                    "default_scopes": ["repo", "read:user", "notifications"],
                    "widgets": [
                        { "id": "repositories", "name": "Repositories", "refresh_interval_seconds": 300 }
                    ],
                    "webhook_signature": { "header": "x-hub-signature-256", "prefix": "sha256=", "encoding": "hex" }
                }
            ]
        })),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "providers"
)]
pub async fn list_providers(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: state.registry.list_metadata(),
    })
}

/// Metadata for a single provider
#[utoipa::path(
    get,
    path = "/providers/{provider}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        WorkspaceHeader
    ),
    responses(
        (status = 200, description = "Provider metadata", body = ProviderMetadata),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "providers"
)]
pub async fn get_provider(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(provider): Path<String>,
) -> Result<Json<ProviderMetadata>, ApiError> {
    let connector = state
        .registry
        .get(&provider)
        .ok_or_else(|| IntegrationError::unknown_provider(&provider))?;
    Ok(Json(connector.metadata().clone()))
}
