//! Provider registry
//!
//! Maps provider slugs to connector instances. Built once at startup and shared
//! through application state; there is no process-global instance.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::connectors::{Connector, ProviderMetadata};

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider '{name}' not found")]
    ProviderNotFound { name: String },
}

/// Provider registry that stores connectors keyed by slug
#[derive(Clone, Default)]
pub struct Registry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector under its metadata slug.
    ///
    /// Returns `false` and keeps the existing entry when the slug is taken.
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> bool {
        let slug = connector.slug().to_string();
        if self.connectors.contains_key(&slug) {
            warn!(provider = %slug, "duplicate connector registration ignored");
            return false;
        }
        self.connectors.insert(slug, connector);
        true
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(slug).cloned()
    }

    pub fn get_or_err(&self, slug: &str) -> Result<Arc<dyn Connector>, RegistryError> {
        self.get(slug).ok_or_else(|| RegistryError::ProviderNotFound {
            name: slug.to_string(),
        })
    }

    /// Metadata of every registered provider, sorted by slug.
    pub fn list_metadata(&self) -> Vec<ProviderMetadata> {
        let mut metadata: Vec<ProviderMetadata> = self
            .connectors
            .values()
            .map(|c| c.metadata().clone())
            .collect();
        metadata.sort_by(|a, b| a.slug.cmp(&b.slug));
        metadata
    }

    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.connectors.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("providers", &self.slugs())
            .finish()
    }
}
