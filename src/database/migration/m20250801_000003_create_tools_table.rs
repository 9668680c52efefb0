use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tools::Table)
                    .if_not_exists()
                    .col(string(Tools::Id).primary_key())
                    .col(string(Tools::McpServerId))
                    .col(string(Tools::Name))
                    .col(text_null(Tools::Description))
                    .col(json(Tools::InputSchema))
                    .col(boolean_null(Tools::IsRead))
                    .col(boolean_null(Tools::IsWrite))
                    .col(boolean_null(Tools::Idempotent))
                    .col(boolean_null(Tools::Reversible))
                    .col(timestamp_with_time_zone_null(Tools::AnalyzedAt))
                    .col(timestamp_with_time_zone(Tools::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tools_mcp_server_id")
                    .table(Tools::Table)
                    .col(Tools::McpServerId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tools::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tools {
    Table,
    Id,
    McpServerId,
    Name,
    Description,
    InputSchema,
    IsRead,
    IsWrite,
    Idempotent,
    Reversible,
    AnalyzedAt,
    CreatedAt,
}
