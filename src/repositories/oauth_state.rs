//! # OAuth State Repository
//!
//! Persistence for single-use OAuth state tokens. Consumption is decided by a
//! conditional update on `used_at IS NULL`, so two concurrent callbacks presenting the
//! same state cannot both win.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::oauth_state::{self, ActiveModel, Entity, Model};

/// Input for a new authorization request
#[derive(Debug, Clone)]
pub struct NewOAuthState {
    pub token: String,
    pub workspace_id: Uuid,
    pub provider_slug: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub initiated_by: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Result of presenting a state token at callback time
#[derive(Debug, Clone, PartialEq)]
pub enum StateConsumption {
    Consumed(Model),
    Unknown,
    Expired,
    AlreadyUsed,
}

/// Repository for OAuth state database operations
#[derive(Debug, Clone)]
pub struct OAuthStateRepository {
    db: Arc<DatabaseConnection>,
}

impl OAuthStateRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        input: NewOAuthState,
        now: DateTime<Utc>,
    ) -> Result<Model, sea_orm::DbErr> {
        let model = ActiveModel {
            token: Set(input.token.clone()),
            workspace_id: Set(input.workspace_id),
            provider_slug: Set(input.provider_slug),
            redirect_uri: Set(input.redirect_uri),
            scopes: Set(json!(input.scopes)),
            initiated_by: Set(input.initiated_by),
            expires_at: Set(input.expires_at),
            used_at: Set(None),
            error: Set(None),
            created_at: Set(now),
        };
        Entity::insert(model).exec_without_returning(&*self.db).await?;

        Entity::find_by_id(input.token)
            .one(&*self.db)
            .await?
            .ok_or_else(|| sea_orm::DbErr::RecordNotFound("oauth state not persisted".to_string()))
    }

    pub async fn find(&self, token: &str) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find_by_id(token.to_string()).one(&*self.db).await
    }

    /// Marks the state used and returns it, or explains why it cannot be used.
    ///
    /// An expired state that was never used is still reported as expired (and left
    /// unused); a used state is always reported as already used.
    pub async fn consume(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<StateConsumption, sea_orm::DbErr> {
        let Some(state) = self.find(token).await? else {
            return Ok(StateConsumption::Unknown);
        };
        if state.used_at.is_some() {
            return Ok(StateConsumption::AlreadyUsed);
        }
        if state.expires_at <= now {
            return Ok(StateConsumption::Expired);
        }

        let result = Entity::update_many()
            .col_expr(oauth_state::Column::UsedAt, Expr::value(now))
            .filter(oauth_state::Column::Token.eq(token))
            .filter(oauth_state::Column::UsedAt.is_null())
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            // Lost the race to a concurrent callback
            return Ok(StateConsumption::AlreadyUsed);
        }

        Ok(StateConsumption::Consumed(Model {
            used_at: Some(now),
            ..state
        }))
    }

    /// Records a diagnostic error on an (already used) state.
    pub async fn record_error(&self, token: &str, error: &str) -> Result<(), sea_orm::DbErr> {
        Entity::update_many()
            .col_expr(oauth_state::Column::Error, Expr::value(error))
            .filter(oauth_state::Column::Token.eq(token))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Deletes states whose expiry is before `cutoff`; returns the number removed.
    pub async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, sea_orm::DbErr> {
        let result = Entity::delete_many()
            .filter(oauth_state::Column::ExpiresAt.lt(cutoff))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn repo() -> OAuthStateRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        OAuthStateRepository::new(Arc::new(db))
    }

    fn new_state(token: &str, expires_at: DateTime<Utc>) -> NewOAuthState {
        NewOAuthState {
            token: token.to_string(),
            workspace_id: Uuid::new_v4(),
            provider_slug: "github".to_string(),
            redirect_uri: "http://localhost:8080/oauth/callback/github".to_string(),
            scopes: vec!["repo".to_string()],
            initiated_by: Some("user-1".to_string()),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_consume_exactly_once() {
        let repo = repo().await;
        let now = Utc::now();
        let created = repo
            .create(new_state("st-1", now + Duration::seconds(300)), now)
            .await
            .unwrap();
        assert_eq!(created.requested_scopes(), vec!["repo".to_string()]);

        match repo.consume("st-1", now + Duration::seconds(100)).await.unwrap() {
            StateConsumption::Consumed(state) => assert!(state.used_at.is_some()),
            other => panic!("expected consumption, got {other:?}"),
        }
        assert_eq!(
            repo.consume("st-1", now + Duration::seconds(150)).await.unwrap(),
            StateConsumption::AlreadyUsed
        );
        assert_eq!(
            repo.consume("missing", now).await.unwrap(),
            StateConsumption::Unknown
        );
    }

    #[tokio::test]
    async fn test_expired_state_is_rejected() {
        let repo = repo().await;
        let now = Utc::now();
        repo.create(new_state("st-2", now + Duration::seconds(300)), now)
            .await
            .unwrap();

        assert_eq!(
            repo.consume("st-2", now + Duration::seconds(301)).await.unwrap(),
            StateConsumption::Expired
        );
        assert!(repo.find("st-2").await.unwrap().unwrap().used_at.is_none());
    }

    #[tokio::test]
    async fn test_record_error_and_cleanup() {
        let repo = repo().await;
        let now = Utc::now();
        repo.create(new_state("old", now - Duration::hours(1)), now)
            .await
            .unwrap();
        repo.create(new_state("fresh", now + Duration::minutes(5)), now)
            .await
            .unwrap();

        repo.record_error("fresh", "access_denied").await.unwrap();
        assert_eq!(
            repo.find("fresh").await.unwrap().unwrap().error.as_deref(),
            Some("access_denied")
        );

        assert_eq!(repo.delete_expired_before(now).await.unwrap(), 1);
        assert!(repo.find("old").await.unwrap().is_none());
        assert!(repo.find("fresh").await.unwrap().is_some());
    }
}
