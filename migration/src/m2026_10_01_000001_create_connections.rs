//! Migration to create the connections table.
//!
//! One row per workspace and provider pair. Rows are never hard-deleted; a disconnect
//! nulls the stored secrets and flips the status instead.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::WorkspaceId).uuid().not_null())
                    .col(ColumnDef::new(Connections::ProviderSlug).text().not_null())
                    .col(
                        ColumnDef::new(Connections::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Connections::AccessTokenEncrypted)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::RefreshTokenEncrypted)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::TokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Connections::Scopes).json().not_null())
                    .col(
                        ColumnDef::new(Connections::SyncStatus)
                            .text()
                            .not_null()
                            .default("never"),
                    )
                    .col(
                        ColumnDef::new(Connections::SyncIntervalMinutes)
                            .integer()
                            .not_null()
                            .default(60),
                    )
                    .col(
                        ColumnDef::new(Connections::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Connections::LastError).text().null())
                    .col(
                        ColumnDef::new(Connections::LastErrorAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::ErrorSince)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::CriticalNotifiedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Connections::WebhookId).text().null())
                    .col(
                        ColumnDef::new(Connections::WebhookSecretEncrypted)
                            .text()
                            .null(),
                    )
                    .col(ColumnDef::new(Connections::EnabledWidgets).json().not_null())
                    .col(ColumnDef::new(Connections::Config).json().not_null())
                    .col(ColumnDef::new(Connections::ConnectedBy).text().null())
                    .col(
                        ColumnDef::new(Connections::ConnectedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::DisconnectedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_workspace_provider")
                    .table(Connections::Table)
                    .col(Connections::WorkspaceId)
                    .col(Connections::ProviderSlug)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Scheduler sweeps filter on status and expiry
        manager
            .create_index(
                Index::create()
                    .name("idx_connections_status_expiry")
                    .table(Connections::Table)
                    .col(Connections::Status)
                    .col(Connections::TokenExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_status_expiry")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_workspace_provider")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    WorkspaceId,
    ProviderSlug,
    Status,
    AccessTokenEncrypted,
    RefreshTokenEncrypted,
    TokenExpiresAt,
    Scopes,
    SyncStatus,
    SyncIntervalMinutes,
    LastSyncAt,
    LastError,
    LastErrorAt,
    ErrorSince,
    CriticalNotifiedAt,
    WebhookId,
    WebhookSecretEncrypted,
    EnabledWidgets,
    Config,
    ConnectedBy,
    ConnectedAt,
    DisconnectedAt,
    CreatedAt,
    UpdatedAt,
}
