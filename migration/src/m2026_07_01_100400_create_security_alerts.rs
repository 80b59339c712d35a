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
                        .table(SecurityAlert::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SecurityAlert::Id)
                                .text()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(SecurityAlert::EventId).text().not_null())
                        .col(ColumnDef::new(SecurityAlert::RiskLevel).integer().not_null())
                        .col(ColumnDef::new(SecurityAlert::Summary).string().not_null())
                        .col(
                            ColumnDef::new(SecurityAlert::Acknowledged)
                                .boolean()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SecurityAlert::AcknowledgedAt).timestamp().null())
                        .col(
                            ColumnDef::new(SecurityAlert::CreatedAt)
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
                        .table(SecurityAlert::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SecurityAlert::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(SecurityAlert::EventId).uuid().not_null())
                        .col(ColumnDef::new(SecurityAlert::RiskLevel).integer().not_null())
                        .col(ColumnDef::new(SecurityAlert::Summary).string().not_null())
                        .col(
                            ColumnDef::new(SecurityAlert::Acknowledged)
                                .boolean()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SecurityAlert::AcknowledgedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SecurityAlert::CreatedAt)
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
                        .name("idx_security_alerts_acknowledged")
                        .table(SecurityAlert::Table)
                        .col(SecurityAlert::Acknowledged)
                        .col(SecurityAlert::RiskLevel)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SecurityAlert::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SecurityAlert {
    #[sea_orm(iden = "security_alerts")]
    Table,
    Id,
    EventId,
    RiskLevel,
    Summary,
    Acknowledged,
    AcknowledgedAt,
    CreatedAt,
}
