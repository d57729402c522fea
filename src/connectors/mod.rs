//! Connectors module
//!
//! This module provides the connector SDK including:
//! - The `Connector` trait every provider implements
//! - Provider metadata and the registry used for lookup
//! - Shared OAuth2 plumbing and the built-in provider presets

pub mod github;
pub mod metadata;
pub mod oauth2;
pub mod registry;
pub mod sandbox;
pub mod trait_;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;

pub use github::{GITHUB_PROVIDER_SLUG, GitHubConnector};
pub use metadata::{
    Capability, ProviderMetadata, SignatureEncoding, SignatureScheme, WidgetDefinition,
};
pub use registry::{Registry, RegistryError};
pub use sandbox::{SANDBOX_PROVIDER_SLUG, SandboxConnector};
pub use trait_::{Connector, ConnectorError, TokenSet, WebhookEvent, WebhookOutcome, WidgetData};

/// Build the registry from configuration.
///
/// Presets are registered when their client registration is complete; the sandbox
/// connector is added in development profiles. Configured slugs with no preset are
/// reported and skipped.
pub fn build_registry(config: &AppConfig) -> Result<Registry, ConnectorError> {
    let mut registry = Registry::new();
    let timeout = config.provider_http_timeout();

    for (slug, credentials) in &config.providers {
        match slug.as_str() {
            GITHUB_PROVIDER_SLUG if credentials.is_complete() => {
                registry.register(Arc::new(GitHubConnector::from_credentials(
                    credentials,
                    timeout,
                )?));
            }
            GITHUB_PROVIDER_SLUG => {
                warn!("GitHub connector not registered: missing client credentials");
            }
            other => {
                warn!(provider = %other, "no connector preset for configured provider");
            }
        }
    }

    if config.is_development_profile() {
        registry.register(Arc::new(SandboxConnector::new()));
    }

    info!(providers = ?registry.slugs(), "connector registry built");
    Ok(registry)
}
