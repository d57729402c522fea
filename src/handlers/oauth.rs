//! # OAuth Callback Handler
//!
//! The provider redirects the user's browser here. The outcome is always a 303 back to
//! the client completion page; failures carry a short message that is safe to display.

use crate::error::IntegrationError;
use crate::oauth_flow::CallbackParams;
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    response::Redirect,
};
use chrono::Utc;
use tracing::{info, warn};
use url::Url;

/// Complete an OAuth authorization
#[utoipa::path(
    get,
    path = "/oauth/callback/{provider}",
    params(
        ("provider" = String, Path, description = "Provider slug"),
        ("code" = Option<String>, Query, description = "Authorization code"),
        ("state" = Option<String>, Query, description = "State issued when the flow started"),
        ("error" = Option<String>, Query, description = "Provider error code"),
        ("error_description" = Option<String>, Query, description = "Provider error detail")
    ),
    responses(
        (status = 303, description = "Redirect to the client completion page with the outcome")
    ),
    tag = "oauth"
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let base = state.config.client_completion_url.as_str();
    match state.oauth.handle_callback(&provider, params, Utc::now()).await {
        Ok(connection) => {
            info!(connection_id = %connection.id, provider = %provider, "OAuth callback completed");
            let workspace = connection.workspace_id.to_string();
            Redirect::to(&completion_url(
                base,
                &[
                    ("success", "true"),
                    ("provider", provider.as_str()),
                    ("workspace", workspace.as_str()),
                ],
            ))
        }
        Err(err) => {
            warn!(provider = %provider, code = err.code(), error = %err, "OAuth callback failed");
            let message = redirect_message(&err);
            Redirect::to(&completion_url(
                base,
                &[
                    ("success", "false"),
                    ("provider", provider.as_str()),
                    ("error", message.as_str()),
                ],
            ))
        }
    }
}

/// Message shown to the user; internal details stay in the logs.
fn redirect_message(err: &IntegrationError) -> String {
    match err {
        IntegrationError::OAuth(failure) => failure.public_message().to_string(),
        IntegrationError::Integration { message, status, .. } if status.is_client_error() => {
            message.clone()
        }
        IntegrationError::Integration { code, .. } if *code == "CONNECTION_TEST_FAILED" => {
            "Connected, but the provider rejected a test request".to_string()
        }
        _ => "Could not complete the connection; please try again".to_string(),
    }
}

fn completion_url(base: &str, pairs: &[(&str, &str)]) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            url.query_pairs_mut().extend_pairs(pairs.iter().copied());
            url.to_string()
        }
        Err(_) => {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter().copied())
                .finish();
            format!("{base}?{query}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OAuthFailure;

    #[test]
    fn completion_url_appends_encoded_pairs() {
        let url = completion_url(
            "http://localhost:3000/integrations/complete",
            &[("success", "false"), ("error", "a b&c")],
        );
        assert_eq!(
            url,
            "http://localhost:3000/integrations/complete?success=false&error=a+b%26c"
        );
    }

    #[test]
    fn completion_url_keeps_existing_query() {
        let url = completion_url("https://app.example.com/done?tab=1", &[("success", "true")]);
        assert_eq!(url, "https://app.example.com/done?tab=1&success=true");
    }

    #[test]
    fn redirect_message_hides_internal_details() {
        let err = IntegrationError::OAuth(OAuthFailure::ExchangeFailed(
            "token endpoint said: invalid_client secret=abc".to_string(),
        ));
        assert_eq!(
            redirect_message(&err),
            "Could not complete authorization with the provider"
        );

        let err = IntegrationError::Database(sea_orm::DbErr::Custom("boom".to_string()));
        assert_eq!(
            redirect_message(&err),
            "Could not complete the connection; please try again"
        );
    }
}
