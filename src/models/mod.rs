//! # Data Models
//!
//! SeaORM entities and API-facing views for the integration hub.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod oauth_state;

pub use connection::{ConnectionResponse, ConnectionStatus, Entity as Connection, SyncStatus};
pub use oauth_state::Entity as OAuthState;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "integration-hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
