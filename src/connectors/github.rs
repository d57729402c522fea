//! GitHub connector implementation
//!
//! OAuth web application flow, grant revocation, dashboard widgets backed by the REST
//! API, and `X-Hub-Signature-256` signed webhook deliveries.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use crate::config::ProviderCredentials;
use crate::connectors::{
    Connector, ConnectorError, ProviderMetadata, SignatureEncoding, SignatureScheme, TokenSet,
    WebhookEvent, WebhookOutcome, WidgetData, WidgetDefinition,
    oauth2::{OAuth2Client, check_status},
    trait_::{event_id_from_payload, params_to_query},
};

pub const GITHUB_PROVIDER_SLUG: &str = "github";
const DEFAULT_OAUTH_BASE: &str = "https://github.com";
const DEFAULT_API_BASE: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github+json";

/// GitHub connector
#[derive(Clone)]
pub struct GitHubConnector {
    metadata: ProviderMetadata,
    oauth: OAuth2Client,
    api_base: String,
}

impl GitHubConnector {
    pub fn new(
        client_id: String,
        client_secret: String,
        oauth_base: Option<&str>,
        api_base: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let oauth_base = oauth_base.unwrap_or(DEFAULT_OAUTH_BASE).trim_end_matches('/');
        let api_base = api_base.unwrap_or(DEFAULT_API_BASE).trim_end_matches('/');

        let oauth = OAuth2Client::new(
            client_id,
            client_secret,
            &format!("{oauth_base}/login/oauth/authorize"),
            &format!("{oauth_base}/login/oauth/access_token"),
            timeout,
        )?;

        Ok(Self {
            metadata: Self::provider_metadata(),
            oauth,
            api_base: api_base.to_string(),
        })
    }

    pub fn from_credentials(
        credentials: &ProviderCredentials,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let (Some(client_id), Some(client_secret)) = (
            credentials.client_id.clone(),
            credentials.client_secret.clone(),
        ) else {
            return Err(ConnectorError::Configuration(
                "github requires client id and client secret".to_string(),
            ));
        };
        Self::new(
            client_id,
            client_secret,
            credentials.oauth_base.as_deref(),
            credentials.api_base.as_deref(),
            timeout,
        )
    }

    pub fn provider_metadata() -> ProviderMetadata {
        ProviderMetadata::new(GITHUB_PROVIDER_SLUG, "GitHub")
            .with_default_scopes(&["repo", "read:user", "notifications"])
            .with_widgets(vec![
                WidgetDefinition::new("repositories", "Repositories", 300),
                WidgetDefinition::new("notifications", "Notifications", 60),
                WidgetDefinition::new("profile", "Profile", 3600),
            ])
            .with_webhooks(SignatureScheme::hmac_sha256(
                "X-Hub-Signature-256",
                Some("sha256="),
                SignatureEncoding::Hex,
            ))
    }

    fn api_url(&self, path: &str) -> Result<Url, ConnectorError> {
        Url::parse(&format!("{}{}", self.api_base, path))
            .map_err(|e| ConnectorError::Configuration(format!("invalid GitHub API URL: {e}")))
    }

    async fn fetch_repositories(&self, access_token: &str, params: &Value) -> Result<Value, ConnectorError> {
        let mut url = self.api_url("/user/repos")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sort", "updated");
            for (key, value) in params_to_query(params) {
                query.append_pair(&key, &value);
            }
        }
        let repos = self.oauth.get_json(url, access_token, ACCEPT).await?;
        let items = as_array(&repos)?
            .iter()
            .map(|repo| {
                json!({
                    "name": repo.get("name"),
                    "full_name": repo.get("full_name"),
                    "private": repo.get("private"),
                    "html_url": repo.get("html_url"),
                    "stargazers_count": repo.get("stargazers_count"),
                    "updated_at": repo.get("updated_at"),
                })
            })
            .collect::<Vec<_>>();
        Ok(json!({ "repositories": items }))
    }

    async fn fetch_notifications(
        &self,
        access_token: &str,
        params: &Value,
    ) -> Result<Value, ConnectorError> {
        let mut url = self.api_url("/notifications")?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params_to_query(params) {
                query.append_pair(&key, &value);
            }
        }
        let notifications = self.oauth.get_json(url, access_token, ACCEPT).await?;
        let items = as_array(&notifications)?
            .iter()
            .map(|n| {
                json!({
                    "id": n.get("id"),
                    "reason": n.get("reason"),
                    "unread": n.get("unread"),
                    "title": n.pointer("/subject/title"),
                    "type": n.pointer("/subject/type"),
                    "repository": n.pointer("/repository/full_name"),
                    "updated_at": n.get("updated_at"),
                })
            })
            .collect::<Vec<_>>();
        let unread = items
            .iter()
            .filter(|n| n.get("unread").and_then(Value::as_bool).unwrap_or(false))
            .count();
        Ok(json!({ "unread_count": unread, "notifications": items }))
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<Value, ConnectorError> {
        let user = self
            .oauth
            .get_json(self.api_url("/user")?, access_token, ACCEPT)
            .await?;
        Ok(json!({
            "login": user.get("login"),
            "name": user.get("name"),
            "avatar_url": user.get("avatar_url"),
            "public_repos": user.get("public_repos"),
            "followers": user.get("followers"),
        }))
    }
}

fn as_array(value: &Value) -> Result<&Vec<Value>, ConnectorError> {
    value
        .as_array()
        .ok_or_else(|| ConnectorError::MalformedResponse("expected a JSON array".to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl Connector for GitHubConnector {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    fn authorization_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<Url, ConnectorError> {
        Ok(self.oauth.authorization_url(state, redirect_uri, scopes))
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, ConnectorError> {
        self.oauth.exchange_code(code, redirect_uri).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, ConnectorError> {
        self.oauth.refresh(refresh_token).await
    }

    async fn revoke_token(&self, access_token: &str) -> Result<(), ConnectorError> {
        let url = self.api_url(&format!("/applications/{}/grant", self.oauth.client_id()))?;
        let response = self
            .oauth
            .http()
            .delete(url)
            .basic_auth(self.oauth.client_id(), Some(self.oauth.client_secret()))
            .header("Accept", ACCEPT)
            .json(&json!({ "access_token": access_token }))
            .send()
            .await?;

        // 404: the grant is already gone
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("GitHub grant already revoked");
            return Ok(());
        }
        check_status(response).await?;
        info!("Revoked GitHub grant");
        Ok(())
    }

    async fn test_connection(&self, tokens: &TokenSet) -> Result<bool, ConnectorError> {
        match self
            .oauth
            .get_json(self.api_url("/user")?, &tokens.access_token, ACCEPT)
            .await
        {
            Ok(_) => Ok(true),
            Err(ConnectorError::Authentication(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_widget_data(
        &self,
        tokens: &TokenSet,
        widget_id: &str,
        params: &Value,
    ) -> Result<WidgetData, ConnectorError> {
        let data = match widget_id {
            "repositories" => self.fetch_repositories(&tokens.access_token, params).await?,
            "notifications" => self.fetch_notifications(&tokens.access_token, params).await?,
            "profile" => self.fetch_profile(&tokens.access_token).await?,
            _ => return Err(ConnectorError::Unsupported("unknown widget")),
        };
        Ok(WidgetData {
            widget_id: widget_id.to_string(),
            data,
            fetched_at: Utc::now(),
        })
    }

    fn webhook_event_id(&self, headers: &HeaderMap, payload: &Value) -> Option<String> {
        header_str(headers, "x-github-delivery")
            .map(str::to_string)
            .or_else(|| event_id_from_payload(payload))
    }

    async fn handle_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome, ConnectorError> {
        let kind = header_str(&event.headers, "x-github-event").unwrap_or("unknown");
        let action = event.payload.get("action").and_then(Value::as_str);
        let event_type = match action {
            Some(action) => format!("{kind}.{action}"),
            None => kind.to_string(),
        };

        let unhealthy_reason = match (kind, action) {
            ("github_app_authorization", Some("revoked")) => {
                Some("GitHub authorization was revoked by the user".to_string())
            }
            _ => None,
        };

        Ok(WebhookOutcome {
            event_type,
            affected_connection_id: event.connection_id,
            updated_data: event.payload.get("repository").cloned(),
            unhealthy_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(server: &MockServer) -> GitHubConnector {
        GitHubConnector::new(
            "test_client_id".to_string(),
            "test_client_secret".to_string(),
            Some(&server.uri()),
            Some(&server.uri()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn tokens(access_token: &str) -> TokenSet {
        TokenSet {
            access_token: access_token.to_string(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
        }
    }

    #[test]
    fn test_oauth_authorize_url() {
        let connector = GitHubConnector::new(
            "test_client_id".to_string(),
            "test_client_secret".to_string(),
            None,
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        let url = connector
            .authorization_url(
                "test_state",
                "https://test.com/callback",
                &["repo".to_string(), "read:org".to_string()],
            )
            .unwrap();
        assert_eq!(url.host_str().unwrap(), "github.com");
        assert_eq!(url.path(), "/login/oauth/authorize");

        let query_pairs: std::collections::HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(query_pairs.get("client_id").unwrap(), "test_client_id");
        assert_eq!(query_pairs.get("state").unwrap(), "test_state");
        assert_eq!(query_pairs.get("scope").unwrap(), "repo read:org");
    }

    #[tokio::test]
    async fn test_token_exchange() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "gho_test",
                "token_type": "bearer",
                "scope": "repo,read:user"
            })))
            .mount(&mock_server)
            .await;

        let tokens = connector(&mock_server)
            .exchange_code("code", "https://test.com/callback")
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "gho_test");
        assert_eq!(tokens.scopes, vec!["repo".to_string(), "read:user".to_string()]);
        assert!(tokens.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_connection_probe() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .and(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": "octocat"})))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .and(header("authorization", "Bearer bad"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let connector = connector(&mock_server);
        assert!(connector.test_connection(&tokens("good")).await.unwrap());
        assert!(!connector.test_connection(&tokens("bad")).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_uses_basic_auth_and_tolerates_missing_grant() {
        let mock_server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/applications/test_client_id/grant"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        connector(&mock_server).revoke_token("gho_test").await.unwrap();
    }

    #[tokio::test]
    async fn test_repositories_widget() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/repos"))
            .and(query_param("sort", "updated"))
            .and(query_param("per_page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "hello", "full_name": "octocat/hello", "private": false, "extra": 1}
            ])))
            .mount(&mock_server)
            .await;

        let data = connector(&mock_server)
            .get_widget_data(&tokens("t"), "repositories", &json!({"per_page": 2}))
            .await
            .unwrap();
        assert_eq!(data.widget_id, "repositories");
        assert_eq!(data.data["repositories"][0]["full_name"], "octocat/hello");
        assert!(data.data["repositories"][0].get("extra").is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_widget() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notifications"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("retry-after", "120"),
            )
            .mount(&mock_server)
            .await;

        let err = connector(&mock_server)
            .get_widget_data(&tokens("t"), "notifications", &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::RateLimited { retry_after: Some(120) }));
    }

    #[tokio::test]
    async fn test_unknown_widget_is_unsupported() {
        let mock_server = MockServer::start().await;
        let err = connector(&mock_server)
            .get_widget_data(&tokens("t"), "gists", &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_webhook_event_type_and_revocation() {
        let mock_server = MockServer::start().await;
        let connector = connector(&mock_server);
        let connection_id = Uuid::new_v4();

        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "issues".parse().unwrap());
        headers.insert("x-github-delivery", "delivery-1".parse().unwrap());
        let payload = json!({"action": "opened", "repository": {"full_name": "octocat/hello"}});
        assert_eq!(
            connector.webhook_event_id(&headers, &payload),
            Some("delivery-1".to_string())
        );

        let outcome = connector
            .handle_webhook(&WebhookEvent {
                connection_id: Some(connection_id),
                headers,
                payload,
                signature: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.event_type, "issues.opened");
        assert_eq!(outcome.affected_connection_id, Some(connection_id));
        assert!(outcome.unhealthy_reason.is_none());

        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "github_app_authorization".parse().unwrap());
        let outcome = connector
            .handle_webhook(&WebhookEvent {
                connection_id: Some(connection_id),
                headers,
                payload: json!({"action": "revoked"}),
                signature: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.event_type, "github_app_authorization.revoked");
        assert!(outcome.unhealthy_reason.is_some());
    }

    #[test]
    fn test_metadata_advertises_webhooks_and_widgets() {
        let metadata = GitHubConnector::provider_metadata();
        assert_eq!(metadata.slug, GITHUB_PROVIDER_SLUG);
        assert_eq!(
            metadata.webhook_signature.as_ref().unwrap().header,
            "x-hub-signature-256"
        );
        assert_eq!(
            metadata.widget_ids(),
            vec!["repositories", "notifications", "profile"]
        );
    }
}
