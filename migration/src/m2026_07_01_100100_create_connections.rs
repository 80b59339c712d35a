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
                        .table(Connection::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Connection::Id)
                                .text()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Connection::UserId).text().not_null())
                        .col(ColumnDef::new(Connection::ProviderSlug).string().not_null())
                        .col(ColumnDef::new(Connection::ExternalId).string().not_null())
                        .col(ColumnDef::new(Connection::DisplayName).string().null())
                        .col(ColumnDef::new(Connection::Status).string().not_null())
                        .col(
                            ColumnDef::new(Connection::AccessTokenCiphertext)
                                .blob()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Connection::RefreshTokenCiphertext)
                                .blob()
                                .null(),
                        )
                        .col(ColumnDef::new(Connection::TokenExpiresAt).timestamp().null())
                        .col(ColumnDef::new(Connection::Scopes).json_binary().null())
                        .col(
                            ColumnDef::new(Connection::ConsecutiveErrors)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Connection::RetryCount).integer().not_null())
                        .col(
                            ColumnDef::new(Connection::BackoffDelaySeconds)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Connection::LastSyncAt).timestamp().null())
                        .col(ColumnDef::new(Connection::SuccessRate).double().not_null())
                        .col(
                            ColumnDef::new(Connection::AvgResponseMs)
                                .double()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Connection::CreatedAt)
                                .timestamp()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(
                            ColumnDef::new(Connection::UpdatedAt)
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
                        .table(Connection::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Connection::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Connection::UserId).uuid().not_null())
                        .col(ColumnDef::new(Connection::ProviderSlug).string().not_null())
                        .col(ColumnDef::new(Connection::ExternalId).string().not_null())
                        .col(ColumnDef::new(Connection::DisplayName).string().null())
                        .col(ColumnDef::new(Connection::Status).string().not_null())
                        .col(
                            ColumnDef::new(Connection::AccessTokenCiphertext)
                                .binary()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Connection::RefreshTokenCiphertext)
                                .binary()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Connection::TokenExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Connection::Scopes).json_binary().null())
                        .col(
                            ColumnDef::new(Connection::ConsecutiveErrors)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Connection::RetryCount).integer().not_null())
                        .col(
                            ColumnDef::new(Connection::BackoffDelaySeconds)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Connection::LastSyncAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Connection::SuccessRate).double().not_null())
                        .col(
                            ColumnDef::new(Connection::AvgResponseMs)
                                .double()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Connection::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(
                            ColumnDef::new(Connection::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .to_owned(),
                )
                .await?;
        }

        if db_backend != sea_orm::DatabaseBackend::Sqlite {
            // One active connection per (user, provider) is enforced at the
            // store level; this index keeps lookups cheap.
            manager
                .create_index(
                    Index::create()
                        .name("idx_connections_user_provider")
                        .table(Connection::Table)
                        .col(Connection::UserId)
                        .col(Connection::ProviderSlug)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_connections_token_expires_at")
                        .table(Connection::Table)
                        .col(Connection::TokenExpiresAt)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Connection::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connection {
    #[sea_orm(iden = "connections")]
    Table,
    Id,
    UserId,
    ProviderSlug,
    ExternalId,
    DisplayName,
    Status,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    TokenExpiresAt,
    Scopes,
    ConsecutiveErrors,
    RetryCount,
    BackoffDelaySeconds,
    LastSyncAt,
    SuccessRate,
    AvgResponseMs,
    CreatedAt,
    UpdatedAt,
}
