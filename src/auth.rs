//! # Authentication and Authorization
//!
//! Operator bearer authentication and workspace header validation for the
//! connection management API.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, validation_error};
use crate::server::AppState;

pub const WORKSPACE_HEADER: &str = "X-Workspace-Id";
pub const USER_HEADER: &str = "X-User-Id";

/// Workspace ID wrapper for type safety
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceId(pub Uuid);

/// Marker type for authenticated operator requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorAuth;

/// Workspace the request is scoped to
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceExtension(pub WorkspaceId);

/// Optional end user on whose behalf the operator acts
#[derive(Debug, Clone, Default)]
pub struct Initiator(pub Option<String>);

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Validates the bearer token and workspace header, then stores both in extensions.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();

    let token = extract_bearer_token(headers)?;
    validate_token(&config, token)?;

    let workspace = extract_workspace_id(headers)?;
    let initiator = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    tracing::debug!(workspace_id = %workspace.0, "Authenticated operator request");

    request.extensions_mut().insert(WorkspaceExtension(workspace));
    request.extensions_mut().insert(Initiator(initiator));
    request.extensions_mut().insert(OperatorAuth);

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_workspace_id(headers: &HeaderMap) -> Result<WorkspaceId, ApiError> {
    let header_value = headers
        .get(WORKSPACE_HEADER)
        .ok_or_else(|| {
            validation_error(
                "Missing required header",
                serde_json::json!({ WORKSPACE_HEADER: "Required header is missing" }),
            )
        })?
        .to_str()
        .map_err(|_| {
            validation_error(
                "Invalid workspace header",
                serde_json::json!({ WORKSPACE_HEADER: "Header must be valid UTF-8" }),
            )
        })?;

    header_value.trim().parse::<Uuid>().map(WorkspaceId).map_err(|_| {
        validation_error(
            "Invalid workspace ID",
            serde_json::json!({ WORKSPACE_HEADER: "Must be a valid UUID" }),
        )
    })
}

/// OpenAPI header parameters for workspace-scoped routes
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct WorkspaceHeader {
    /// Workspace identifier (UUID) that scopes the request
    #[serde(rename = "X-Workspace-Id")]
    #[param(rename = "X-Workspace-Id", value_type = String)]
    pub workspace_id: String,
    /// Optional identifier of the end user initiating the action
    #[serde(rename = "X-User-Id")]
    #[param(rename = "X-User-Id", value_type = Option<String>)]
    pub user_id: Option<String>,
}

impl<S> FromRequestParts<S> for WorkspaceExtension
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<WorkspaceExtension>()
            .copied()
            .ok_or_else(|| {
                validation_error(
                    "Workspace context missing",
                    serde_json::json!({ WORKSPACE_HEADER: "Workspace context not present" }),
                )
            })
    }
}

impl<S> FromRequestParts<S> for Initiator
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Initiator>()
            .cloned()
            .unwrap_or_default())
    }
}

impl<S> FromRequestParts<S> for OperatorAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OperatorAuth>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Operator authentication required")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    const TOKEN: &str = "operator-secret";

    async fn echo_context(
        _auth: OperatorAuth,
        WorkspaceExtension(workspace): WorkspaceExtension,
        Initiator(user): Initiator,
    ) -> String {
        format!("{}|{}", workspace.0, user.unwrap_or_default())
    }

    fn guarded(tokens: &[&str]) -> Router {
        let config = Arc::new(AppConfig {
            operator_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        });
        Router::new()
            .route("/whoami", get(echo_context))
            .layer(axum::middleware::from_fn_with_state(config, auth_middleware))
    }

    fn whoami(authorization: Option<&str>, workspace: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().uri("/whoami");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        if let Some(value) = workspace {
            builder = builder.header(WORKSPACE_HEADER, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn rejects_bad_credentials_before_looking_at_workspace() {
        let workspace = Uuid::new_v4().to_string();
        let cases = [
            (None, Some(workspace.as_str())),
            (Some("Basic dGVzdDoxMjM="), Some(workspace.as_str())),
            (Some("Bearer not-the-token"), Some(workspace.as_str())),
            (Some("Bearer not-the-token"), None),
        ];

        for (authorization, workspace) in cases {
            let response = guarded(&[TOKEN])
                .oneshot(whoami(authorization, workspace))
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::UNAUTHORIZED,
                "authorization {authorization:?}"
            );
        }
    }

    #[tokio::test]
    async fn workspace_header_must_be_a_uuid() {
        let bearer = format!("Bearer {TOKEN}");
        for workspace in [None, Some("not-a-uuid"), Some("")] {
            let response = guarded(&[TOKEN])
                .oneshot(whoami(Some(bearer.as_str()), workspace))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{workspace:?}");
        }
    }

    #[tokio::test]
    async fn accepted_request_exposes_workspace_and_initiator() {
        let workspace = Uuid::new_v4();
        let bearer = format!("Bearer {TOKEN}");
        let padded = format!("  {workspace} ");
        let mut request = whoami(Some(bearer.as_str()), Some(padded.as_str()));
        request
            .headers_mut()
            .insert(USER_HEADER, "user-42".parse().unwrap());

        let response = guarded(&[TOKEN]).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body, format!("{workspace}|user-42").as_bytes());
    }

    #[tokio::test]
    async fn any_configured_token_is_accepted() {
        let app = guarded(&["first", "second"]);
        let workspace = Uuid::new_v4().to_string();

        for token in ["first", "second"] {
            let bearer = format!("Bearer {token}");
            let response = app
                .clone()
                .oneshot(whoami(Some(bearer.as_str()), Some(workspace.as_str())))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
