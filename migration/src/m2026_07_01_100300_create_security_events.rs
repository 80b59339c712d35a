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
                        .table(SecurityEvent::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SecurityEvent::Id)
                                .text()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(SecurityEvent::UserId).text().null())
                        .col(ColumnDef::new(SecurityEvent::EventType).string().not_null())
                        .col(ColumnDef::new(SecurityEvent::RiskLevel).integer().not_null())
                        .col(
                            ColumnDef::new(SecurityEvent::Description)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityEvent::Metadata)
                                .json_binary()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityEvent::Resolved)
                                .boolean()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityEvent::RetainUntil)
                                .timestamp()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityEvent::CreatedAt)
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
                        .table(SecurityEvent::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SecurityEvent::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(SecurityEvent::UserId).uuid().null())
                        .col(ColumnDef::new(SecurityEvent::EventType).string().not_null())
                        .col(ColumnDef::new(SecurityEvent::RiskLevel).integer().not_null())
                        .col(
                            ColumnDef::new(SecurityEvent::Description)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityEvent::Metadata)
                                .json_binary()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityEvent::Resolved)
                                .boolean()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityEvent::RetainUntil)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityEvent::CreatedAt)
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
                        .name("idx_security_events_retain_until")
                        .table(SecurityEvent::Table)
                        .col(SecurityEvent::RetainUntil)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_security_events_risk_level")
                        .table(SecurityEvent::Table)
                        .col(SecurityEvent::RiskLevel)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SecurityEvent::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SecurityEvent {
    #[sea_orm(iden = "security_events")]
    Table,
    Id,
    UserId,
    EventType,
    RiskLevel,
    Description,
    Metadata,
    Resolved,
    RetainUntil,
    CreatedAt,
}
