//! # Error Handling
//!
//! Domain errors for the connection manager ([`IntegrationError`]) and the
//! problem+json envelope ([`ApiError`]) every HTTP failure is rendered with.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::connectors::ConnectorError;
use crate::crypto::CryptoError;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    #[schema(value_type = String, example = "TOKEN_EXPIRED")]
    pub code: Box<str>,
    /// Human-readable error message
    #[schema(value_type = String)]
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Correlation trace id for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(String::into_boxed_str)
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

/// Why an OAuth callback was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthFailure {
    UnknownState,
    ExpiredState,
    StateAlreadyUsed,
    ProviderMismatch,
    /// The provider redirected back with an `error` parameter.
    AccessDenied(String),
    ExchangeFailed(String),
}

impl OAuthFailure {
    /// Message safe to show to end users; never echoes internal details.
    pub fn public_message(&self) -> &'static str {
        match self {
            OAuthFailure::UnknownState
            | OAuthFailure::ExpiredState
            | OAuthFailure::StateAlreadyUsed
            | OAuthFailure::ProviderMismatch => "Invalid or expired authorization request",
            OAuthFailure::AccessDenied(_) => "Authorization was denied by the provider",
            OAuthFailure::ExchangeFailed(_) => "Could not complete authorization with the provider",
        }
    }
}

impl std::fmt::Display for OAuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OAuthFailure::UnknownState => write!(f, "unknown state"),
            OAuthFailure::ExpiredState => write!(f, "state expired"),
            OAuthFailure::StateAlreadyUsed => write!(f, "state already used"),
            OAuthFailure::ProviderMismatch => write!(f, "state issued for a different provider"),
            OAuthFailure::AccessDenied(reason) => write!(f, "access denied: {reason}"),
            OAuthFailure::ExchangeFailed(reason) => write!(f, "code exchange failed: {reason}"),
        }
    }
}

/// Errors raised by the connection manager.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("oauth error: {0}")]
    OAuth(OAuthFailure),
    #[error("no usable token for provider {provider}; reconnect required")]
    TokenExpired { provider: String },
    #[error("provider {provider} failed: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },
    #[error("provider {provider} rate limited the request")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },
    #[error("{message}")]
    Integration {
        code: &'static str,
        status: StatusCode,
        message: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("stored secret unreadable: {0}")]
    Crypto(#[from] CryptoError),
}

impl IntegrationError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Integration {
            code: "NOT_FOUND",
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Integration {
            code: "VALIDATION_FAILED",
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Integration {
            code: "UNSUPPORTED_OPERATION",
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unknown_provider(slug: &str) -> Self {
        Self::not_found(format!("Unknown provider: {slug}"))
    }

    pub fn connection_not_found(slug: &str) -> Self {
        Self::not_found(format!("No connection to {slug} for this workspace"))
    }

    /// Maps a connector failure observed while talking to `provider`.
    pub fn from_connector(provider: &str, error: ConnectorError) -> Self {
        match error {
            ConnectorError::RateLimited { retry_after } => Self::RateLimited {
                provider: provider.to_string(),
                retry_after,
            },
            ConnectorError::Authentication(_) => Self::TokenExpired {
                provider: provider.to_string(),
            },
            ConnectorError::Unsupported(operation) => {
                Self::unsupported(format!("{provider} does not support {operation}"))
            }
            ConnectorError::Http { status, body } => Self::Provider {
                provider: provider.to_string(),
                status: Some(status),
                message: truncate(&body, 200),
            },
            other => Self::Provider {
                provider: provider.to_string(),
                status: None,
                message: other.to_string(),
            },
        }
    }

    /// Short machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            IntegrationError::OAuth(_) => "OAUTH_ERROR",
            IntegrationError::TokenExpired { .. } => "TOKEN_EXPIRED",
            IntegrationError::Provider { .. } => "PROVIDER_ERROR",
            IntegrationError::RateLimited { .. } => "RATE_LIMITED",
            IntegrationError::Integration { code, .. } => *code,
            IntegrationError::Database(_) | IntegrationError::Crypto(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() > max_chars {
        let truncated: String = value.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        value.to_string()
    }
}

impl From<IntegrationError> for ApiError {
    fn from(error: IntegrationError) -> Self {
        match error {
            IntegrationError::OAuth(failure) => {
                tracing::info!(reason = %failure, "OAuth request rejected");
                ApiError::new(StatusCode::BAD_REQUEST, "OAUTH_ERROR", failure.public_message())
            }
            IntegrationError::TokenExpired { provider } => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "TOKEN_EXPIRED",
                format!("The {provider} connection needs to be reconnected"),
            )
            .with_details(json!({ "provider": provider, "action": "reconnect" })),
            IntegrationError::Provider {
                provider,
                status,
                message,
            } => provider_error(provider, status, Some(message)),
            IntegrationError::RateLimited {
                provider,
                retry_after,
            } => {
                let error = ApiError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    format!("{provider} is rate limiting requests"),
                )
                .with_details(json!({ "provider": provider }));
                match retry_after {
                    Some(seconds) => error.with_retry_after(seconds),
                    None => error,
                }
            }
            IntegrationError::Integration {
                code,
                status,
                message,
            } => ApiError::new(status, code, message),
            IntegrationError::Database(db_err) => db_err.into(),
            IntegrationError::Crypto(crypto_err) => {
                tracing::error!(error = %crypto_err, "Failed to decrypt stored secret");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_UNIQUE: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code.as_ref() == PG_UNIQUE || SQLITE_UNIQUE.contains(&code.as_ref()))
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create a provider upstream error (always 502)
pub fn provider_error(provider: String, status: Option<u16>, body: Option<String>) -> ApiError {
    let message = match status {
        Some(status) => format!("Provider {} returned error status {}", provider, status),
        None => format!("Provider {} request failed", provider),
    };

    ApiError::new(StatusCode::BAD_GATEWAY, "PROVIDER_ERROR", message).with_details(json!({
        "provider": provider,
        "status": status,
        "body_snippet": body.map(|b| truncate(&b, 200)),
    }))
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    ApiError::new(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        message.unwrap_or("Authentication required"),
    )
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "bad input");

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("bad input"));
        assert_eq!(error.details, None);
        assert!(error.trace_id.is_some());
    }

    #[test]
    fn test_content_type_and_retry_after_headers() {
        let response = ApiError::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "slow down")
            .with_retry_after(60)
            .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn test_oauth_failures_use_generic_message() {
        for failure in [
            OAuthFailure::UnknownState,
            OAuthFailure::ExpiredState,
            OAuthFailure::StateAlreadyUsed,
        ] {
            let api: ApiError = IntegrationError::OAuth(failure).into();
            assert_eq!(api.status, StatusCode::BAD_REQUEST);
            assert_eq!(api.code, Box::from("OAUTH_ERROR"));
            assert_eq!(
                api.message,
                Box::from("Invalid or expired authorization request")
            );
        }

        let api: ApiError =
            IntegrationError::OAuth(OAuthFailure::ExchangeFailed("invalid_grant: secret".into()))
                .into();
        assert!(!api.message.contains("secret"));
    }

    #[test]
    fn test_token_expired_maps_to_reconnect_hint() {
        let api: ApiError = IntegrationError::TokenExpired {
            provider: "github".to_string(),
        }
        .into();
        assert_eq!(api.status, StatusCode::UNAUTHORIZED);
        assert_eq!(api.code, Box::from("TOKEN_EXPIRED"));
        assert_eq!(api.details.unwrap()["action"], "reconnect");
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let api: ApiError = IntegrationError::RateLimited {
            provider: "github".to_string(),
            retry_after: Some(30),
        }
        .into();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.retry_after, Some(30));
    }

    #[test]
    fn test_provider_error_truncates_body() {
        let error = provider_error("github".to_string(), Some(500), Some("x".repeat(500)));

        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
        assert_eq!(error.code, Box::from("PROVIDER_ERROR"));
        let details = error.details.unwrap();
        assert_eq!(details["status"], 500);
        assert_eq!(
            details["body_snippet"].as_str().unwrap().chars().count(),
            203
        );
    }

    #[test]
    fn test_connector_error_mapping() {
        let expired = IntegrationError::from_connector(
            "github",
            ConnectorError::Authentication("bad token".into()),
        );
        assert!(matches!(expired, IntegrationError::TokenExpired { .. }));

        let limited = IntegrationError::from_connector(
            "github",
            ConnectorError::RateLimited {
                retry_after: Some(10),
            },
        );
        assert!(matches!(
            limited,
            IntegrationError::RateLimited {
                retry_after: Some(10),
                ..
            }
        ));

        let upstream = IntegrationError::from_connector(
            "github",
            ConnectorError::Http {
                status: 503,
                body: "unavailable".into(),
            },
        );
        assert_eq!(upstream.code(), "PROVIDER_ERROR");
    }

    #[test]
    fn test_integration_error_keeps_code_and_status() {
        let api: ApiError = IntegrationError::not_found("No connection").into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert_eq!(api.code, Box::from("NOT_FOUND"));
    }

    #[test]
    fn test_crypto_error_is_not_leaked() {
        let api: ApiError = IntegrationError::Crypto(CryptoError::DecryptionFailed).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!api.message.contains("decrypt"));
    }

    #[test]
    fn test_record_not_found_maps_to_404() {
        let api: ApiError = sea_orm::DbErr::RecordNotFound("connection".into()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
    }
}
