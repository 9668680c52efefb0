use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(McpServers::Table)
                    .if_not_exists()
                    .col(string(McpServers::Id).primary_key())
                    .col(string(McpServers::Name))
                    .col(json(McpServers::ServerConfig))
                    .col(json(McpServers::UserConfig))
                    .col(string_null(McpServers::OauthProvider))
                    .col(boolean(McpServers::OauthRequired).default(false))
                    .col(timestamp_with_time_zone(McpServers::CreatedAt))
                    .col(timestamp_with_time_zone(McpServers::UpdatedAt))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(McpServers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum McpServers {
    Table,
    Id,
    Name,
    ServerConfig,
    UserConfig,
    OauthProvider,
    OauthRequired,
    CreatedAt,
    UpdatedAt,
}
