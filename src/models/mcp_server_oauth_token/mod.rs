use chrono::{DateTime, Duration, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::OnConflict;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Tokens are treated as expired this long before their actual expiry
const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "mcp_server_oauth_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub mcp_server_id: String,
    #[sea_orm(column_type = "Text")]
    pub access_token: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTimeUtc>,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "crate::models::mcp_server::Entity",
        from = "Column::McpServerId",
        to = "crate::models::mcp_server::Column::Id",
        on_delete = "Cascade"
    )]
    McpServer,
}

impl Related<crate::models::mcp_server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::McpServer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// OAuth credentials owned by exactly one sandboxed server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OAuthTokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthTokenSet {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_SKEW_SECONDS) <= now,
            None => false,
        }
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }
}

impl From<Model> for OAuthTokenSet {
    fn from(model: Model) -> Self {
        Self {
            access_token: model.access_token,
            refresh_token: model.refresh_token,
            expires_at: model.expires_at,
        }
    }
}

impl Model {
    /// Store (or replace) the token set of a server
    pub async fn save_tokens(
        db: &DatabaseConnection,
        mcp_server_id: &str,
        tokens: &OAuthTokenSet,
    ) -> Result<(), DbErr> {
        let active_model = ActiveModel {
            mcp_server_id: Set(mcp_server_id.to_string()),
            access_token: Set(tokens.access_token.clone()),
            refresh_token: Set(tokens.refresh_token.clone()),
            expires_at: Set(tokens.expires_at),
            updated_at: Set(Utc::now()),
        };

        Entity::insert(active_model)
            .on_conflict(
                OnConflict::column(Column::McpServerId)
                    .update_columns([
                        Column::AccessToken,
                        Column::RefreshToken,
                        Column::ExpiresAt,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(db)
            .await?;

        Ok(())
    }

    pub async fn load_tokens(
        db: &DatabaseConnection,
        mcp_server_id: &str,
    ) -> Result<Option<OAuthTokenSet>, DbErr> {
        Ok(Entity::find_by_id(mcp_server_id.to_string())
            .one(db)
            .await?
            .map(OAuthTokenSet::from))
    }

    pub async fn delete_tokens(db: &DatabaseConnection, mcp_server_id: &str) -> Result<(), DbErr> {
        Entity::delete_by_id(mcp_server_id.to_string())
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn delete_all(db: &DatabaseConnection) -> Result<(), DbErr> {
        Entity::delete_many().exec(db).await?;
        Ok(())
    }
}
