use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db_backend = manager.get_database_backend();

        if db_backend == sea_orm::DatabaseBackend::Sqlite {
            // SQLite-compatible version using TEXT for UUID columns
            manager
                .create_table(
                    Table::create()
                        .table(AuthSession::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(AuthSession::Id)
                                .text()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(AuthSession::UserId).text().not_null())
                        .col(ColumnDef::new(AuthSession::ProviderSlug).string().not_null())
                        .col(ColumnDef::new(AuthSession::State).string().not_null())
                        .col(ColumnDef::new(AuthSession::CodeVerifier).string().null())
                        .col(ColumnDef::new(AuthSession::Scopes).json_binary().null())
                        .col(ColumnDef::new(AuthSession::Status).string().not_null())
                        .col(ColumnDef::new(AuthSession::ErrorDetail).string().null())
                        .col(ColumnDef::new(AuthSession::Attempts).integer().not_null())
                        .col(ColumnDef::new(AuthSession::ExpiresAt).timestamp().not_null())
                        .col(
                            ColumnDef::new(AuthSession::CreatedAt)
                                .timestamp()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(
                            ColumnDef::new(AuthSession::UpdatedAt)
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
                        .table(AuthSession::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(AuthSession::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(AuthSession::UserId).uuid().not_null())
                        .col(ColumnDef::new(AuthSession::ProviderSlug).string().not_null())
                        .col(ColumnDef::new(AuthSession::State).string().not_null())
                        .col(ColumnDef::new(AuthSession::CodeVerifier).string().null())
                        .col(ColumnDef::new(AuthSession::Scopes).json_binary().null())
                        .col(ColumnDef::new(AuthSession::Status).string().not_null())
                        .col(ColumnDef::new(AuthSession::ErrorDetail).string().null())
                        .col(ColumnDef::new(AuthSession::Attempts).integer().not_null())
                        .col(
                            ColumnDef::new(AuthSession::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(AuthSession::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(
                            ColumnDef::new(AuthSession::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .to_owned(),
                )
                .await?;
        }

        // Indexes for state lookup and expiry sweeps.
        // Note: Skip index creation for SQLite due to potential schema issues
        if db_backend != sea_orm::DatabaseBackend::Sqlite {
            manager
                .create_index(
                    Index::create()
                        .name("idx_auth_sessions_state")
                        .table(AuthSession::Table)
                        .col(AuthSession::State)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_auth_sessions_user_provider")
                        .table(AuthSession::Table)
                        .col(AuthSession::UserId)
                        .col(AuthSession::ProviderSlug)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_auth_sessions_expires_at")
                        .table(AuthSession::Table)
                        .col(AuthSession::ExpiresAt)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AuthSession::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AuthSession {
    #[sea_orm(iden = "auth_sessions")]
    Table,
    Id,
    UserId,
    ProviderSlug,
    State,
    CodeVerifier,
    Scopes,
    Status,
    ErrorDetail,
    Attempts,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
}
