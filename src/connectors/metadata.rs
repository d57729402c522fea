//! Provider metadata types
//!
//! Static description of a provider: what it can do, which scopes it asks for by
//! default, which widgets it serves and how its webhooks are signed.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Capability a connector may implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    #[serde(rename = "oauth")]
    OAuth,
    Webhooks,
    WidgetData,
}

/// A named unit of fetchable provider data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WidgetDefinition {
    pub id: String,
    pub name: String,
    /// How long fetched data stays fresh in the widget cache
    pub refresh_interval_seconds: u64,
}

impl WidgetDefinition {
    pub fn new(id: &str, name: &str, refresh_interval_seconds: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            refresh_interval_seconds,
        }
    }
}

/// Encoding of the signature digest inside the header value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

/// How a provider signs its webhook deliveries (HMAC-SHA256 over the raw body)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SignatureScheme {
    /// Header carrying the signature, lowercase
    pub header: String,
    /// Literal prefix preceding the digest, e.g. `sha256=`
    pub prefix: Option<String>,
    pub encoding: SignatureEncoding,
}

impl SignatureScheme {
    pub fn hmac_sha256(header: &str, prefix: Option<&str>, encoding: SignatureEncoding) -> Self {
        Self {
            header: header.to_ascii_lowercase(),
            prefix: prefix.map(str::to_string),
            encoding,
        }
    }
}

/// Metadata about a provider
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderMetadata {
    /// Unique slug used in URLs and storage (e.g. "github")
    pub slug: String,
    pub display_name: String,
    pub capabilities: Vec<Capability>,
    /// Scopes requested when the caller does not ask for specific ones
    pub default_scopes: Vec<String>,
    pub widgets: Vec<WidgetDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_signature: Option<SignatureScheme>,
}

impl ProviderMetadata {
    /// OAuth-only metadata; add more with the `with_*` builders.
    pub fn new(slug: &str, display_name: &str) -> Self {
        Self {
            slug: slug.to_string(),
            display_name: display_name.to_string(),
            capabilities: vec![Capability::OAuth],
            default_scopes: Vec::new(),
            widgets: Vec::new(),
            webhook_signature: None,
        }
    }

    pub fn with_default_scopes(mut self, scopes: &[&str]) -> Self {
        self.default_scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_widgets(mut self, widgets: Vec<WidgetDefinition>) -> Self {
        if !widgets.is_empty() && !self.capabilities.contains(&Capability::WidgetData) {
            self.capabilities.push(Capability::WidgetData);
        }
        self.widgets = widgets;
        self
    }

    pub fn with_webhooks(mut self, scheme: SignatureScheme) -> Self {
        if !self.capabilities.contains(&Capability::Webhooks) {
            self.capabilities.push(Capability::Webhooks);
        }
        self.webhook_signature = Some(scheme);
        self
    }

    pub fn widget(&self, widget_id: &str) -> Option<&WidgetDefinition> {
        self.widgets.iter().find(|w| w.id == widget_id)
    }

    pub fn widget_ids(&self) -> Vec<String> {
        self.widgets.iter().map(|w| w.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_track_capabilities() {
        let metadata = ProviderMetadata::new("acme", "Acme")
            .with_default_scopes(&["read"])
            .with_widgets(vec![WidgetDefinition::new("feed", "Feed", 300)])
            .with_webhooks(SignatureScheme::hmac_sha256(
                "X-Acme-Signature",
                None,
                SignatureEncoding::Base64,
            ));

        assert_eq!(
            metadata.capabilities,
            vec![Capability::OAuth, Capability::WidgetData, Capability::Webhooks]
        );
        assert_eq!(metadata.default_scopes, vec!["read".to_string()]);
        assert_eq!(
            metadata.webhook_signature.as_ref().map(|s| s.header.as_str()),
            Some("x-acme-signature")
        );
        assert_eq!(metadata.widget("feed").map(|w| w.refresh_interval_seconds), Some(300));
        assert!(metadata.widget("missing").is_none());
    }

    #[test]
    fn test_capabilities_serialize_snake_case() {
        let json = serde_json::to_string(&Capability::WidgetData).unwrap();
        assert_eq!(json, "\"widget_data\"");
        let json = serde_json::to_string(&Capability::OAuth).unwrap();
        assert_eq!(json, "\"oauth\"");
    }
}
