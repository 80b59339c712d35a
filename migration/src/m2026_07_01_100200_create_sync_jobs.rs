use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db_backend = manager.get_database_backend();

        if db_backend == sea_orm::DatabaseBackend::Sqlite {
            manager
                .create_table(
                    Table::create()
                        .table(SyncJob::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(SyncJob::Id).text().not_null().primary_key())
                        .col(ColumnDef::new(SyncJob::ConnectionId).text().not_null())
                        .col(ColumnDef::new(SyncJob::UserId).text().not_null())
                        .col(ColumnDef::new(SyncJob::ProviderSlug).string().not_null())
                        .col(ColumnDef::new(SyncJob::SyncType).string().not_null())
                        .col(ColumnDef::new(SyncJob::Priority).small_integer().not_null())
                        .col(ColumnDef::new(SyncJob::Status).string().not_null())
                        .col(ColumnDef::new(SyncJob::Phases).json_binary().not_null())
                        .col(ColumnDef::new(SyncJob::CurrentPhase).string().null())
                        .col(ColumnDef::new(SyncJob::OverallProgress).double().not_null())
                        .col(ColumnDef::new(SyncJob::Errors).json_binary().not_null())
                        .col(ColumnDef::new(SyncJob::Warnings).json_binary().not_null())
                        .col(
                            ColumnDef::new(SyncJob::ControlHistory)
                                .json_binary()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SyncJob::StartedAt).timestamp().null())
                        .col(
                            ColumnDef::new(SyncJob::EstimatedCompletionAt)
                                .timestamp()
                                .null(),
                        )
                        .col(ColumnDef::new(SyncJob::FinishedAt).timestamp().null())
                        .col(ColumnDef::new(SyncJob::PausedMs).big_integer().not_null())
                        .col(
                            ColumnDef::new(SyncJob::CreatedAt)
                                .timestamp()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(
                            ColumnDef::new(SyncJob::UpdatedAt)
                                .timestamp()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .to_owned(),
                )
                .await?;
        } else {
            manager
                .create_table(
                    Table::create()
                        .table(SyncJob::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(SyncJob::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(SyncJob::ConnectionId).uuid().not_null())
                        .col(ColumnDef::new(SyncJob::UserId).uuid().not_null())
                        .col(ColumnDef::new(SyncJob::ProviderSlug).string().not_null())
                        .col(ColumnDef::new(SyncJob::SyncType).string().not_null())
                        .col(ColumnDef::new(SyncJob::Priority).small_integer().not_null())
                        .col(ColumnDef::new(SyncJob::Status).string().not_null())
                        .col(ColumnDef::new(SyncJob::Phases).json_binary().not_null())
                        .col(ColumnDef::new(SyncJob::CurrentPhase).string().null())
                        .col(ColumnDef::new(SyncJob::OverallProgress).double().not_null())
                        .col(ColumnDef::new(SyncJob::Errors).json_binary().not_null())
                        .col(ColumnDef::new(SyncJob::Warnings).json_binary().not_null())
                        .col(
                            ColumnDef::new(SyncJob::ControlHistory)
                                .json_binary()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SyncJob::StartedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SyncJob::EstimatedCompletionAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SyncJob::FinishedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(SyncJob::PausedMs).big_integer().not_null())
                        .col(
                            ColumnDef::new(SyncJob::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(
                            ColumnDef::new(SyncJob::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .to_owned(),
                )
                .await?;
        }

        if db_backend != sea_orm::DatabaseBackend::Sqlite {
            manager
                .create_index(
                    Index::create()
                        .name("idx_sync_jobs_connection_status")
                        .table(SyncJob::Table)
                        .col(SyncJob::ConnectionId)
                        .col(SyncJob::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_sync_jobs_user")
                        .table(SyncJob::Table)
                        .col(SyncJob::UserId)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncJob::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJob {
    #[sea_orm(iden = "sync_jobs")]
    Table,
    Id,
    ConnectionId,
    UserId,
    ProviderSlug,
    SyncType,
    Priority,
    Status,
    Phases,
    CurrentPhase,
    OverallProgress,
    Errors,
    Warnings,
    ControlHistory,
    StartedAt,
    EstimatedCompletionAt,
    FinishedAt,
    PausedMs,
    CreatedAt,
    UpdatedAt,
}
