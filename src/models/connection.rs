//! Connection entity model
//!
//! SeaORM entity for the `connections` table: one row per workspace and provider pair,
//! holding encrypted credentials, sync bookkeeping and the webhook binding.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Connection entity
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub workspace_id: Uuid,

    pub provider_slug: String,

    /// See [`ConnectionStatus`]
    pub status: String,

    /// `nonceHex:authTagHex:ciphertextHex` envelope
    pub access_token_encrypted: Option<String>,

    pub refresh_token_encrypted: Option<String>,

    pub token_expires_at: Option<DateTime<Utc>>,

    /// JSON array of granted scopes
    #[sea_orm(column_type = "Json")]
    pub scopes: JsonValue,

    /// See [`SyncStatus`]
    pub sync_status: String,

    pub sync_interval_minutes: i32,

    pub last_sync_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub last_error_at: Option<DateTime<Utc>>,

    /// Start of the current uninterrupted ERROR run
    pub error_since: Option<DateTime<Utc>>,

    pub critical_notified_at: Option<DateTime<Utc>>,

    pub webhook_id: Option<String>,

    pub webhook_secret_encrypted: Option<String>,

    /// JSON array of widget ids
    #[sea_orm(column_type = "Json")]
    pub enabled_widgets: JsonValue,

    #[sea_orm(column_type = "Json")]
    pub config: JsonValue,

    pub connected_by: Option<String>,

    pub connected_at: Option<DateTime<Utc>>,

    pub disconnected_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed status. Unrecognised values read as [`ConnectionStatus::Error`].
    pub fn connection_status(&self) -> ConnectionStatus {
        self.status.parse().unwrap_or(ConnectionStatus::Error)
    }

    pub fn sync_state(&self) -> SyncStatus {
        self.sync_status.parse().unwrap_or(SyncStatus::Never)
    }

    pub fn scope_list(&self) -> Vec<String> {
        string_list(&self.scopes)
    }

    pub fn enabled_widget_ids(&self) -> Vec<String> {
        string_list(&self.enabled_widgets)
    }
}

fn string_list(value: &JsonValue) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Unrecognised enum text in a stored column
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value '{0}'")]
pub struct UnknownVariant(pub String);

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Expired,
    Error,
    Disconnected,
    NeedsReauth,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::NeedsReauth => "needs_reauth",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "connected" => Ok(ConnectionStatus::Connected),
            "expired" => Ok(ConnectionStatus::Expired),
            "error" => Ok(ConnectionStatus::Error),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            "needs_reauth" => Ok(ConnectionStatus::NeedsReauth),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Outcome of the most recent data sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Never,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Never => "never",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(SyncStatus::Never),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Connection as exposed over the API. Never carries secrets.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectionResponse {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub provider: String,
    pub status: ConnectionStatus,
    pub scopes: Vec<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub sync_interval_minutes: i32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub webhook_id: Option<String>,
    /// Whether a webhook secret is stored for signature checks
    pub webhook_configured: bool,
    pub enabled_widgets: Vec<String>,
    #[schema(value_type = Object)]
    pub config: JsonValue,
    pub connected_by: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Model> for ConnectionResponse {
    fn from(model: Model) -> Self {
        Self {
            status: model.connection_status(),
            sync_status: model.sync_state(),
            scopes: model.scope_list(),
            enabled_widgets: model.enabled_widget_ids(),
            webhook_configured: model.webhook_secret_encrypted.is_some(),
            id: model.id,
            workspace_id: model.workspace_id,
            provider: model.provider_slug,
            token_expires_at: model.token_expires_at,
            sync_interval_minutes: model.sync_interval_minutes,
            last_sync_at: model.last_sync_at,
            last_error: model.last_error,
            last_error_at: model.last_error_at,
            webhook_id: model.webhook_id,
            config: model.config,
            connected_by: model.connected_by,
            connected_at: model.connected_at,
            disconnected_at: model.disconnected_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}
