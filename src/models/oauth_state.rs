//! # OAuth State Model
//!
//! Single-use anti-CSRF tokens binding an authorization request to its callback.

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// OAuth State entity
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "oauth_states")]
pub struct Model {
    /// Opaque random token sent as the `state` parameter
    #[sea_orm(primary_key, auto_increment = false)]
    pub token: String,

    pub workspace_id: Uuid,

    pub provider_slug: String,

    pub redirect_uri: String,

    /// JSON array of requested scopes
    #[sea_orm(column_type = "Json")]
    pub scopes: JsonValue,

    pub initiated_by: Option<String>,

    pub expires_at: DateTime<Utc>,

    /// Set exactly once when a callback consumes the state
    pub used_at: Option<DateTime<Utc>>,

    /// Exchange or provider error, kept for diagnostics
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn requested_scopes(&self) -> Vec<String> {
        self.scopes
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
