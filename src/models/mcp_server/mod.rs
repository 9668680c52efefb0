use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::OnConflict;
use sea_orm::{QueryOrder, Set};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;
use utoipa::ToSchema;

use crate::models::mcp_server_oauth_token::{Model as OAuthTokenModel, OAuthTokenSet};
use crate::models::tool::Model as ToolModel;

const CATALOG_JSON: &str = include_str!("catalog.json");

/// How to launch a server inside its sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Image to run instead of the base sandbox image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OAuthRequirement {
    pub provider: String,
    pub required: bool,
}

/// A server the user installed, as the sandbox manager sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxedServerConfig {
    pub id: String,
    pub name: String,
    pub server_config: ServerConfig,
    #[serde(default)]
    pub user_config: HashMap<String, String>,
    #[serde(default)]
    pub oauth: Option<OAuthRequirement>,
    #[serde(skip)]
    pub oauth_tokens: Option<OAuthTokenSet>,
}

impl SandboxedServerConfig {
    /// Image reference this server runs on
    pub fn image_or<'a>(&'a self, base_image: &'a str) -> &'a str {
        self.server_config.image.as_deref().unwrap_or(base_image)
    }

    pub fn oauth_required(&self) -> bool {
        self.oauth.as_ref().is_some_and(|oauth| oauth.required)
    }

    /// Launch spec with `{{ user_config.<key> }}` placeholders filled in
    pub fn rendered_server_config(&self) -> ServerConfig {
        let render = |value: &str| render_user_config(value, &self.user_config);

        ServerConfig {
            command: render(&self.server_config.command),
            args: self.server_config.args.iter().map(|a| render(a)).collect(),
            env: self
                .server_config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), render(v)))
                .collect(),
            image: self.server_config.image.clone(),
        }
    }
}

fn render_user_config(value: &str, user_config: &HashMap<String, String>) -> String {
    let mut rendered = value.to_string();
    for (key, replacement) in user_config {
        rendered = rendered
            .replace(&format!("{{{{ user_config.{key} }}}}"), replacement)
            .replace(&format!("{{{{user_config.{key}}}}}"), replacement);
    }
    rendered
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "mcp_servers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    #[sea_orm(column_type = "Json")]
    pub server_config: Json,
    #[sea_orm(column_type = "Json")]
    pub user_config: Json,
    pub oauth_provider: Option<String>,
    pub oauth_required: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "crate::models::mcp_server_oauth_token::Entity")]
    OAuthToken,
}

impl Related<crate::models::mcp_server_oauth_token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OAuthToken.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectorCatalogEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub author: String,
    pub homepage: String,
    #[serde(default)]
    pub oauth: Option<OAuthRequirement>,
    pub server_config: ServerConfig,
}

impl ConnectorCatalogEntry {
    pub fn to_config(&self) -> SandboxedServerConfig {
        SandboxedServerConfig {
            id: self.id.clone(),
            name: self.title.clone(),
            server_config: self.server_config.clone(),
            user_config: HashMap::new(),
            oauth: self.oauth.clone(),
            oauth_tokens: None,
        }
    }
}

impl Model {
    /// Insert or update a server config (tokens are stored separately)
    pub async fn save_config(
        db: &DatabaseConnection,
        config: &SandboxedServerConfig,
    ) -> Result<Model, DbErr> {
        let server_config = serde_json::to_value(&config.server_config)
            .map_err(|e| DbErr::Custom(format!("Failed to serialize server_config: {e}")))?;
        let user_config = serde_json::to_value(&config.user_config)
            .map_err(|e| DbErr::Custom(format!("Failed to serialize user_config: {e}")))?;
        let now = Utc::now();

        let active_model = ActiveModel {
            id: Set(config.id.clone()),
            name: Set(config.name.clone()),
            server_config: Set(server_config),
            user_config: Set(user_config),
            oauth_provider: Set(config.oauth.as_ref().map(|o| o.provider.clone())),
            oauth_required: Set(config.oauth_required()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Entity::insert(active_model)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::Name,
                        Column::ServerConfig,
                        Column::UserConfig,
                        Column::OauthProvider,
                        Column::OauthRequired,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_with_returning(db)
            .await
    }

    pub async fn load_installed_mcp_servers(db: &DatabaseConnection) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .order_by_asc(Column::CreatedAt)
            .all(db)
            .await
    }

    /// Load every installed config with its token set attached.
    ///
    /// Rows that no longer deserialize are skipped with a warning.
    pub async fn load_installed_configs(
        db: &DatabaseConnection,
    ) -> Result<Vec<SandboxedServerConfig>, DbErr> {
        let mut configs = Vec::new();
        for model in Self::load_installed_mcp_servers(db).await? {
            let id = model.id.clone();
            let tokens = OAuthTokenModel::load_tokens(db, &id).await?;
            match model.to_config(tokens) {
                Ok(config) => configs.push(config),
                Err(e) => warn!("Skipping unreadable MCP server config {id}: {e}"),
            }
        }
        Ok(configs)
    }

    pub async fn load_config(
        db: &DatabaseConnection,
        id: &str,
    ) -> Result<Option<SandboxedServerConfig>, DbErr> {
        match Entity::find_by_id(id.to_string()).one(db).await? {
            Some(model) => {
                let tokens = OAuthTokenModel::load_tokens(db, id).await?;
                model.to_config(tokens).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Delete a config along with its tokens and persisted tools.
    /// Deleting an unknown id is not an error.
    pub async fn delete_config(db: &DatabaseConnection, id: &str) -> Result<(), DbErr> {
        OAuthTokenModel::delete_tokens(db, id).await?;
        ToolModel::delete_for_server(db, id).await?;
        Entity::delete_by_id(id.to_string()).exec(db).await?;
        Ok(())
    }

    pub async fn delete_all(db: &DatabaseConnection) -> Result<(), DbErr> {
        OAuthTokenModel::delete_all(db).await?;
        ToolModel::delete_all(db).await?;
        Entity::delete_many().exec(db).await?;
        Ok(())
    }

    pub fn to_config(
        self,
        oauth_tokens: Option<OAuthTokenSet>,
    ) -> Result<SandboxedServerConfig, DbErr> {
        let server_config: ServerConfig = serde_json::from_value(self.server_config)
            .map_err(|e| DbErr::Custom(format!("Failed to parse server_config: {e}")))?;
        let user_config: HashMap<String, String> = serde_json::from_value(self.user_config)
            .map_err(|e| DbErr::Custom(format!("Failed to parse user_config: {e}")))?;

        Ok(SandboxedServerConfig {
            id: self.id,
            name: self.name,
            server_config,
            user_config,
            oauth: self.oauth_provider.map(|provider| OAuthRequirement {
                provider,
                required: self.oauth_required,
            }),
            oauth_tokens,
        })
    }

    pub async fn get_mcp_connector_catalog() -> Result<Vec<ConnectorCatalogEntry>, String> {
        serde_json::from_str(CATALOG_JSON).map_err(|e| format!("Failed to parse catalog: {e}"))
    }

    pub async fn find_catalog_entry(
        mcp_server_catalog_id: &str,
    ) -> Result<Option<ConnectorCatalogEntry>, String> {
        Ok(Self::get_mcp_connector_catalog()
            .await?
            .into_iter()
            .find(|entry| entry.id == mcp_server_catalog_id))
    }
}

#[cfg(test)]
impl SandboxedServerConfig {
    pub fn simple(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            server_config: ServerConfig {
                command: command.to_string(),
                args: args.iter().map(|a| String::from(*a)).collect(),
                ..ServerConfig::default()
            },
            user_config: HashMap::new(),
            oauth: None,
            oauth_tokens: None,
        }
    }
}
