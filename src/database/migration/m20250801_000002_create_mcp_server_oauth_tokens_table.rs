use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(McpServerOauthTokens::Table)
                    .if_not_exists()
                    .col(string(McpServerOauthTokens::McpServerId).primary_key())
                    .col(text(McpServerOauthTokens::AccessToken))
                    .col(text_null(McpServerOauthTokens::RefreshToken))
                    .col(timestamp_with_time_zone_null(McpServerOauthTokens::ExpiresAt))
                    .col(timestamp_with_time_zone(McpServerOauthTokens::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_mcp_server_oauth_tokens_mcp_server_id")
                            .from(McpServerOauthTokens::Table, McpServerOauthTokens::McpServerId)
                            .to(McpServers::Table, McpServers::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(McpServerOauthTokens::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum McpServerOauthTokens {
    Table,
    McpServerId,
    AccessToken,
    RefreshToken,
    ExpiresAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum McpServers {
    Table,
    Id,
}
