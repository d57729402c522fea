//! Connection repository for database operations
//!
//! Encapsulates SeaORM access to the `connections` table. Secrets pass through the
//! [`TokenCipher`] on the way in and out; callers only ever see plaintext [`TokenSet`]s.

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::connectors::TokenSet;
use crate::crypto::TokenCipher;
use crate::error::{IntegrationError, is_unique_violation};
use crate::models::connection::{self, ConnectionStatus, Entity as Connection, SyncStatus};

/// Input for persisting the result of a successful code exchange
#[derive(Debug)]
pub struct NewConnectionTokens<'a> {
    pub workspace_id: Uuid,
    pub provider_slug: &'a str,
    pub tokens: &'a TokenSet,
    pub connected_by: Option<String>,
    /// New connections start with this sync interval
    pub sync_interval_minutes: i32,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: Arc<DatabaseConnection>,
    cipher: Arc<TokenCipher>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, cipher: Arc<TokenCipher>) -> Self {
        Self { db, cipher }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<connection::Model>, IntegrationError> {
        Ok(Connection::find_by_id(id).one(&*self.db).await?)
    }

    pub async fn find_by_workspace_and_provider(
        &self,
        workspace_id: Uuid,
        provider_slug: &str,
    ) -> Result<Option<connection::Model>, IntegrationError> {
        Ok(Connection::find()
            .filter(connection::Column::WorkspaceId.eq(workspace_id))
            .filter(connection::Column::ProviderSlug.eq(provider_slug))
            .one(&*self.db)
            .await?)
    }

    /// Lists all connections for a workspace ordered by provider slug
    pub async fn list_by_workspace(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<connection::Model>, IntegrationError> {
        Ok(Connection::find()
            .filter(connection::Column::WorkspaceId.eq(workspace_id))
            .order_by_asc(connection::Column::ProviderSlug)
            .all(&*self.db)
            .await?)
    }

    /// Creates the connection on first authorization, otherwise overwrites the stored
    /// credentials of the existing row. Either way the result is CONNECTED with no error.
    pub async fn upsert_connected(
        &self,
        input: NewConnectionTokens<'_>,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        if let Some(existing) = self
            .find_by_workspace_and_provider(input.workspace_id, input.provider_slug)
            .await?
        {
            return self.overwrite_credentials(existing, &input, now).await;
        }

        let id = Uuid::new_v4();
        let model = connection::ActiveModel {
            id: Set(id),
            workspace_id: Set(input.workspace_id),
            provider_slug: Set(input.provider_slug.to_string()),
            status: Set(ConnectionStatus::Connected.as_str().to_string()),
            access_token_encrypted: Set(Some(self.cipher.encrypt(&input.tokens.access_token)?)),
            refresh_token_encrypted: Set(self
                .cipher
                .encrypt_opt(input.tokens.refresh_token.as_deref())?),
            token_expires_at: Set(input.tokens.expires_at),
            scopes: Set(json!(input.tokens.scopes)),
            sync_status: Set(SyncStatus::Never.as_str().to_string()),
            sync_interval_minutes: Set(input.sync_interval_minutes),
            last_sync_at: Set(None),
            last_error: Set(None),
            last_error_at: Set(None),
            error_since: Set(None),
            critical_notified_at: Set(None),
            webhook_id: Set(None),
            webhook_secret_encrypted: Set(None),
            enabled_widgets: Set(json!([])),
            config: Set(json!({})),
            connected_by: Set(input.connected_by.clone()),
            connected_at: Set(Some(now)),
            disconnected_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match Connection::insert(model).exec_without_returning(&*self.db).await {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                // A concurrent callback created the row first
                let existing = self
                    .find_by_workspace_and_provider(input.workspace_id, input.provider_slug)
                    .await?
                    .ok_or(IntegrationError::Database(err))?;
                return self.overwrite_credentials(existing, &input, now).await;
            }
            Err(err) => return Err(err.into()),
        }

        self.get_by_id(id)
            .await?
            .ok_or_else(|| IntegrationError::not_found(format!("connection {id} not persisted")))
    }

    async fn overwrite_credentials(
        &self,
        existing: connection::Model,
        input: &NewConnectionTokens<'_>,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let mut model = existing.into_active_model();
        model.status = Set(ConnectionStatus::Connected.as_str().to_string());
        model.access_token_encrypted = Set(Some(self.cipher.encrypt(&input.tokens.access_token)?));
        model.refresh_token_encrypted =
            Set(self.cipher.encrypt_opt(input.tokens.refresh_token.as_deref())?);
        model.token_expires_at = Set(input.tokens.expires_at);
        model.scopes = Set(json!(input.tokens.scopes));
        model.last_error = Set(None);
        model.last_error_at = Set(None);
        model.error_since = Set(None);
        model.critical_notified_at = Set(None);
        model.connected_by = Set(input.connected_by.clone());
        model.connected_at = Set(Some(now));
        model.disconnected_at = Set(None);
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    /// Decrypts stored credentials. `None` when no access token is stored.
    pub fn decrypt_tokens(
        &self,
        connection: &connection::Model,
    ) -> Result<Option<TokenSet>, IntegrationError> {
        let Some(access_envelope) = connection.access_token_encrypted.as_deref() else {
            return Ok(None);
        };

        let decrypt = |envelope: &str| {
            self.cipher.decrypt(envelope).inspect_err(|_| {
                tracing::error!(
                    connection_id = %connection.id,
                    provider_slug = %connection.provider_slug,
                    "Token decryption failed"
                );
            })
        };

        Ok(Some(TokenSet {
            access_token: decrypt(access_envelope)?,
            refresh_token: connection
                .refresh_token_encrypted
                .as_deref()
                .map(decrypt)
                .transpose()?,
            expires_at: connection.token_expires_at,
            scopes: connection.scope_list(),
        }))
    }

    /// Decrypted webhook secret, if one is stored.
    pub fn decrypt_webhook_secret(
        &self,
        connection: &connection::Model,
    ) -> Result<Option<String>, IntegrationError> {
        Ok(connection
            .webhook_secret_encrypted
            .as_deref()
            .map(|envelope| self.cipher.decrypt(envelope))
            .transpose()?)
    }

    /// Persists a refreshed token tuple and returns the connection to a clean CONNECTED
    /// state. A tuple without a refresh token keeps the stored one.
    pub async fn update_tokens(
        &self,
        id: Uuid,
        tokens: &TokenSet,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let mut model = self.load(id).await?.into_active_model();
        model.access_token_encrypted = Set(Some(self.cipher.encrypt(&tokens.access_token)?));
        if let Some(refresh_token) = tokens.refresh_token.as_deref() {
            model.refresh_token_encrypted = Set(Some(self.cipher.encrypt(refresh_token)?));
        }
        model.token_expires_at = Set(tokens.expires_at);
        if !tokens.scopes.is_empty() {
            model.scopes = Set(json!(tokens.scopes));
        }
        model.status = Set(ConnectionStatus::Connected.as_str().to_string());
        model.last_error = Set(None);
        model.last_error_at = Set(None);
        model.error_since = Set(None);
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    /// Sets a failure status with a user-facing message. Entering ERROR starts the
    /// error run used by the health threshold; staying in ERROR keeps its start.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let existing = self.load(id).await?;
        let keep_error_run = existing.connection_status() == ConnectionStatus::Error
            && status == ConnectionStatus::Error;
        let error_since = if keep_error_run {
            existing.error_since.or(Some(now))
        } else if status == ConnectionStatus::Error {
            Some(now)
        } else {
            None
        };

        let mut model = existing.into_active_model();
        model.status = Set(status.as_str().to_string());
        model.last_error = Set(Some(message.to_string()));
        model.last_error_at = Set(Some(now));
        model.error_since = Set(error_since);
        if !keep_error_run {
            model.critical_notified_at = Set(None);
        }
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    /// Clears any error state back to CONNECTED.
    pub async fn mark_healthy(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let mut model = self.load(id).await?.into_active_model();
        model.status = Set(ConnectionStatus::Connected.as_str().to_string());
        model.last_error = Set(None);
        model.last_error_at = Set(None);
        model.error_since = Set(None);
        model.critical_notified_at = Set(None);
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    pub async fn mark_critical_notified(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), IntegrationError> {
        let mut model = self.load(id).await?.into_active_model();
        model.critical_notified_at = Set(Some(now));
        model.updated_at = Set(now);
        model.update(&*self.db).await?;
        Ok(())
    }

    /// Soft-terminates the connection: secrets nulled, status DISCONNECTED.
    pub async fn disconnect(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let mut model = self.load(id).await?.into_active_model();
        model.status = Set(ConnectionStatus::Disconnected.as_str().to_string());
        model.access_token_encrypted = Set(None);
        model.refresh_token_encrypted = Set(None);
        model.token_expires_at = Set(None);
        model.webhook_secret_encrypted = Set(None);
        model.last_error = Set(None);
        model.last_error_at = Set(None);
        model.error_since = Set(None);
        model.critical_notified_at = Set(None);
        model.disconnected_at = Set(Some(now));
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    /// CONNECTED rows with a refresh token whose expiry falls within `lookahead`.
    pub async fn find_due_for_refresh(
        &self,
        now: DateTime<Utc>,
        lookahead: Duration,
    ) -> Result<Vec<connection::Model>, IntegrationError> {
        Ok(Connection::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Connected.as_str()))
            .filter(connection::Column::RefreshTokenEncrypted.is_not_null())
            .filter(connection::Column::TokenExpiresAt.is_not_null())
            .filter(connection::Column::TokenExpiresAt.lte(now + lookahead))
            .order_by_asc(connection::Column::TokenExpiresAt)
            .all(&*self.db)
            .await?)
    }

    /// Marks every CONNECTED row already past expiry as EXPIRED; returns the count.
    pub async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, IntegrationError> {
        let result = Connection::update_many()
            .col_expr(
                connection::Column::Status,
                Expr::value(ConnectionStatus::Expired.as_str()),
            )
            .col_expr(connection::Column::LastError, Expr::value(message))
            .col_expr(connection::Column::LastErrorAt, Expr::value(now))
            .col_expr(connection::Column::UpdatedAt, Expr::value(now))
            .filter(connection::Column::Status.eq(ConnectionStatus::Connected.as_str()))
            .filter(connection::Column::TokenExpiresAt.is_not_null())
            .filter(connection::Column::TokenExpiresAt.lte(now))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// CONNECTED rows never synced or whose own interval has elapsed.
    pub async fn find_sync_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<connection::Model>, IntegrationError> {
        let connected = Connection::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Connected.as_str()))
            .order_by_asc(connection::Column::LastSyncAt)
            .all(&*self.db)
            .await?;
        Ok(connected
            .into_iter()
            .filter(|c| match c.last_sync_at {
                None => true,
                Some(last) => {
                    last + Duration::minutes(i64::from(c.sync_interval_minutes.max(1))) <= now
                }
            })
            .collect())
    }

    /// Rows the health sweep probes: CONNECTED or ERROR.
    pub async fn find_for_health_check(&self) -> Result<Vec<connection::Model>, IntegrationError> {
        Ok(Connection::find()
            .filter(connection::Column::Status.is_in([
                ConnectionStatus::Connected.as_str(),
                ConnectionStatus::Error.as_str(),
            ]))
            .order_by_asc(connection::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Resolves the connection a webhook delivery belongs to.
    ///
    /// With an explicit id the row must exist for that provider. Without one the oldest
    /// non-disconnected connection of the provider holding a webhook secret is chosen.
    pub async fn find_webhook_target(
        &self,
        provider_slug: &str,
        connection_id: Option<Uuid>,
    ) -> Result<Option<connection::Model>, IntegrationError> {
        let query = Connection::find().filter(connection::Column::ProviderSlug.eq(provider_slug));
        let found = match connection_id {
            Some(id) => query.filter(connection::Column::Id.eq(id)).one(&*self.db).await?,
            None => {
                query
                    .filter(connection::Column::WebhookSecretEncrypted.is_not_null())
                    .filter(connection::Column::Status.ne(ConnectionStatus::Disconnected.as_str()))
                    .order_by_asc(connection::Column::CreatedAt)
                    .one(&*self.db)
                    .await?
            }
        };
        Ok(found)
    }

    /// Records a sync transition. SYNCED and FAILED stamp `last_sync_at` so the next
    /// attempt waits a full interval either way.
    pub async fn set_sync_state(
        &self,
        id: Uuid,
        status: SyncStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let mut model = self.load(id).await?.into_active_model();
        model.sync_status = Set(status.as_str().to_string());
        match status {
            SyncStatus::Synced => {
                model.last_sync_at = Set(Some(now));
                model.last_error = Set(None);
                model.last_error_at = Set(None);
            }
            SyncStatus::Failed => {
                model.last_sync_at = Set(Some(now));
                model.last_error = Set(error.map(str::to_string));
                model.last_error_at = Set(Some(now));
            }
            SyncStatus::Syncing | SyncStatus::Never => {}
        }
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    pub async fn update_enabled_widgets(
        &self,
        id: Uuid,
        widgets: &[String],
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let mut model = self.load(id).await?.into_active_model();
        model.enabled_widgets = Set(json!(widgets));
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    pub async fn update_config(
        &self,
        id: Uuid,
        config: Value,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let mut model = self.load(id).await?.into_active_model();
        model.config = Set(config);
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    /// Binds a provider webhook to the connection. The secret is stored encrypted;
    /// `None` removes it.
    pub async fn set_webhook(
        &self,
        id: Uuid,
        webhook_id: Option<String>,
        secret: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let mut model = self.load(id).await?.into_active_model();
        model.webhook_id = Set(webhook_id);
        model.webhook_secret_encrypted = Set(self.cipher.encrypt_opt(secret)?);
        model.updated_at = Set(now);
        Ok(model.update(&*self.db).await?)
    }

    async fn load(&self, id: Uuid) -> Result<connection::Model, IntegrationError> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| IntegrationError::not_found(format!("Connection {id} not found")))
    }
}
