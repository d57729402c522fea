//! Shared OAuth2 authorization-code plumbing for HTTP connectors
//!
//! Builds consent URLs, performs code exchange and refresh against a provider's token
//! endpoint, and classifies provider responses into [`ConnectorError`]s.

use std::time::Duration;

use chrono::Utc;
use reqwest::{Response, StatusCode, header::HeaderMap};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::connectors::{ConnectorError, TokenSet};

pub const USER_AGENT: &str = concat!("integration-hub/", env!("CARGO_PKG_VERSION"));

/// Token endpoint response. Some providers report errors with a 200 status.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// OAuth2 client bound to one provider's endpoints and client registration.
#[derive(Clone)]
pub struct OAuth2Client {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    authorize_url: Url,
    token_url: Url,
}

impl OAuth2Client {
    pub fn new(
        client_id: String,
        client_secret: String,
        authorize_url: &str,
        token_url: &str,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ConnectorError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            client_id,
            client_secret,
            authorize_url: parse_endpoint(authorize_url)?,
            token_url: parse_endpoint(token_url)?,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Consent URL for the authorization-code grant.
    pub fn authorization_url(&self, state: &str, redirect_uri: &str, scopes: &[String]) -> Url {
        let mut url = self.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("state", state)
                .append_pair("response_type", "code");
            if !scopes.is_empty() {
                query.append_pair("scope", &scopes.join(" "));
            }
        }
        url
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, ConnectorError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self.post_token_form(&form).await?;
        token_set_from_response(response, None)
    }

    /// Refresh grant. Providers that do not rotate refresh tokens omit one from the
    /// response; the presented token is carried forward in that case.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, ConnectorError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self.post_token_form(&form).await?;
        token_set_from_response(response, Some(refresh_token))
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ConnectorError> {
        let response = self
            .http
            .post(self.token_url.clone())
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TokenResponse>(&body)
                .ok()
                .and_then(|r| r.error_description.or(r.error))
                .unwrap_or_else(|| format!("token endpoint returned {status}"));
            return Err(ConnectorError::Authentication(reason));
        }

        let response = check_status(response).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ConnectorError::MalformedResponse(e.to_string()))
    }

    /// Authenticated GET returning the JSON body.
    pub async fn get_json(
        &self,
        url: Url,
        access_token: &str,
        accept: &str,
    ) -> Result<Value, ConnectorError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header("Accept", accept)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| ConnectorError::MalformedResponse(e.to_string()))
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConnectorError> {
    Url::parse(raw).map_err(|e| ConnectorError::Configuration(format!("invalid endpoint {raw}: {e}")))
}

fn token_set_from_response(
    response: TokenResponse,
    presented_refresh_token: Option<&str>,
) -> Result<TokenSet, ConnectorError> {
    if let Some(error) = response.error {
        return Err(ConnectorError::Authentication(
            response.error_description.unwrap_or(error),
        ));
    }
    let access_token = response
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConnectorError::MalformedResponse("missing access_token".to_string()))?;

    Ok(TokenSet {
        access_token,
        refresh_token: response
            .refresh_token
            .or_else(|| presented_refresh_token.map(str::to_string)),
        expires_at: response
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        scopes: response.scope.as_deref().map(parse_scopes).unwrap_or_default(),
    })
}

/// Splits a provider scope string; both comma and space separators occur in the wild.
pub fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Passes 2xx responses through and maps everything else to a [`ConnectorError`].
///
/// 429, and 403 with an exhausted `x-ratelimit-remaining`, are rate limits; 401 is an
/// authentication failure.
pub async fn check_status(response: Response) -> Result<Response, ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers();
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && exhausted) {
        return Err(ConnectorError::RateLimited {
            retry_after: retry_after_seconds(headers),
        });
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ConnectorError::Authentication(if body.is_empty() {
            "provider returned 401".to_string()
        } else {
            body
        }));
    }
    Err(ConnectorError::Http {
        status: status.as_u16(),
        body,
    })
}

/// `Retry-After` in seconds, falling back to the `x-ratelimit-reset` epoch timestamp.
fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Some(seconds) = header("retry-after").and_then(|v| v.trim().parse::<u64>().ok()) {
        return Some(seconds);
    }
    header("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|reset| (reset - Utc::now().timestamp()).max(0) as u64)
}
