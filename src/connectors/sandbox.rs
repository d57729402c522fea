//! Sandbox connector
//!
//! A provider that never leaves the process. Its consent URL points straight back at
//! the callback with a code already attached, so the whole connect flow can be
//! exercised locally and in tests. Registered only in development profiles.
//!
//! Behavior hooks:
//! - authorization code `denied` fails the exchange
//! - refresh token `revoked` fails the refresh
//! - access tokens not minted here fail [`Connector::test_connection`]
//! - webhook payload `{"type": "authorization.revoked"}` marks the connection unhealthy

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use url::Url;
use uuid::Uuid;

use crate::connectors::{
    Connector, ConnectorError, ProviderMetadata, SignatureEncoding, SignatureScheme, TokenSet,
    WebhookEvent, WebhookOutcome, WidgetData, WidgetDefinition,
};

pub const SANDBOX_PROVIDER_SLUG: &str = "sandbox";
pub const SANDBOX_AUTHORIZATION_CODE: &str = "sandbox-code";
const ACCESS_TOKEN_PREFIX: &str = "sandbox-access-";

/// In-process sandbox provider
pub struct SandboxConnector {
    metadata: ProviderMetadata,
}

impl SandboxConnector {
    pub fn new() -> Self {
        Self {
            metadata: ProviderMetadata::new(SANDBOX_PROVIDER_SLUG, "Sandbox")
                .with_default_scopes(&["read"])
                .with_widgets(vec![WidgetDefinition::new("echo", "Echo", 60)])
                .with_webhooks(SignatureScheme::hmac_sha256(
                    "x-sandbox-signature",
                    None,
                    SignatureEncoding::Hex,
                )),
        }
    }

    fn mint_tokens(&self, refresh_token: Option<String>, scopes: Vec<String>) -> TokenSet {
        TokenSet {
            access_token: format!("{ACCESS_TOKEN_PREFIX}{}", Uuid::new_v4().simple()),
            refresh_token: refresh_token
                .or_else(|| Some(format!("sandbox-refresh-{}", Uuid::new_v4().simple()))),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            scopes,
        }
    }
}

impl Default for SandboxConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SandboxConnector {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    fn authorization_url(
        &self,
        state: &str,
        redirect_uri: &str,
        _scopes: &[String],
    ) -> Result<Url, ConnectorError> {
        let mut url = Url::parse(redirect_uri)
            .map_err(|e| ConnectorError::Configuration(format!("invalid redirect uri: {e}")))?;
        url.query_pairs_mut()
            .append_pair("code", SANDBOX_AUTHORIZATION_CODE)
            .append_pair("state", state);
        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenSet, ConnectorError> {
        if code == "denied" {
            return Err(ConnectorError::Authentication(
                "sandbox rejected the authorization code".to_string(),
            ));
        }
        Ok(self.mint_tokens(None, self.metadata.default_scopes.clone()))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ConnectorError> {
        if refresh_token == "revoked" {
            return Err(ConnectorError::Authentication("invalid_grant".to_string()));
        }
        Ok(self.mint_tokens(
            Some(refresh_token.to_string()),
            self.metadata.default_scopes.clone(),
        ))
    }

    async fn revoke_token(&self, _access_token: &str) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn test_connection(&self, tokens: &TokenSet) -> Result<bool, ConnectorError> {
        Ok(tokens.access_token.starts_with(ACCESS_TOKEN_PREFIX))
    }

    async fn get_widget_data(
        &self,
        tokens: &TokenSet,
        widget_id: &str,
        params: &Value,
    ) -> Result<WidgetData, ConnectorError> {
        if widget_id != "echo" {
            return Err(ConnectorError::Unsupported("unknown widget"));
        }
        Ok(WidgetData {
            widget_id: widget_id.to_string(),
            data: json!({ "params": params, "scopes": tokens.scopes }),
            fetched_at: Utc::now(),
        })
    }

    async fn handle_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome, ConnectorError> {
        let event_type = event
            .payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let unhealthy_reason = (event_type == "authorization.revoked")
            .then(|| "sandbox authorization revoked".to_string());

        Ok(WebhookOutcome {
            event_type,
            affected_connection_id: event.connection_id,
            updated_data: event.payload.get("data").cloned(),
            unhealthy_reason,
        })
    }
}
