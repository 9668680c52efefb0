use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::{QueryOrder, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

use crate::consts::TOOL_ID_SEPARATOR;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tools")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub mcp_server_id: String,
    pub name: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    #[sea_orm(column_type = "Json")]
    pub input_schema: Json,
    pub is_read: Option<bool>,
    pub is_write: Option<bool>,
    pub idempotent: Option<bool>,
    pub reversible: Option<bool>,
    pub analyzed_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Safety flags attached to a tool, filled in after discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ToolAnalysis {
    pub is_read: Option<bool>,
    pub is_write: Option<bool>,
    pub idempotent: Option<bool>,
    pub reversible: Option<bool>,
}

impl ToolAnalysis {
    pub fn is_empty(&self) -> bool {
        self == &ToolAnalysis::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolDescriptor {
    /// `{server_id}__{name}`
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[schema(value_type = Object)]
    pub input_schema: serde_json::Value,
    pub server_id: String,
    pub server_name: String,
    #[serde(default)]
    pub analysis: ToolAnalysis,
}

impl ToolDescriptor {
    pub fn tool_id(server_id: &str, tool_name: &str) -> String {
        format!("{server_id}{TOOL_ID_SEPARATOR}{tool_name}")
    }

    fn into_active_model(self) -> ActiveModel {
        let analyzed_at = (!self.analysis.is_empty()).then(Utc::now);
        ActiveModel {
            id: Set(self.id),
            mcp_server_id: Set(self.server_id),
            name: Set(self.name),
            description: Set(self.description),
            input_schema: Set(self.input_schema),
            is_read: Set(self.analysis.is_read),
            is_write: Set(self.analysis.is_write),
            idempotent: Set(self.analysis.idempotent),
            reversible: Set(self.analysis.reversible),
            analyzed_at: Set(analyzed_at),
            created_at: Set(Utc::now()),
        }
    }
}

impl Model {
    fn analysis(&self) -> ToolAnalysis {
        ToolAnalysis {
            is_read: self.is_read,
            is_write: self.is_write,
            idempotent: self.idempotent,
            reversible: self.reversible,
        }
    }

    /// Replace the persisted tool list of a server.
    ///
    /// Analysis already stored for a tool id wins over the flags seeded from
    /// discovery, so re-discovering tools after a restart keeps it.
    pub async fn replace_for_server(
        db: &DatabaseConnection,
        mcp_server_id: &str,
        tools: Vec<ToolDescriptor>,
    ) -> Result<Vec<ToolDescriptor>, DbErr> {
        let txn = db.begin().await?;

        let previous: HashMap<String, ToolAnalysis> = Entity::find()
            .filter(Column::McpServerId.eq(mcp_server_id))
            .filter(Column::AnalyzedAt.is_not_null())
            .all(&txn)
            .await?
            .into_iter()
            .map(|model| (model.id.clone(), model.analysis()))
            .collect();

        Entity::delete_many()
            .filter(Column::McpServerId.eq(mcp_server_id))
            .exec(&txn)
            .await?;

        let merged: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|mut tool| {
                if let Some(analysis) = previous.get(&tool.id) {
                    tool.analysis = analysis.clone();
                }
                tool
            })
            .collect();

        if !merged.is_empty() {
            Entity::insert_many(merged.iter().cloned().map(ToolDescriptor::into_active_model))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(merged)
    }

    pub async fn load_for_server(
        db: &DatabaseConnection,
        mcp_server_id: &str,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::McpServerId.eq(mcp_server_id))
            .order_by_asc(Column::Name)
            .all(db)
            .await
    }

    /// Returns false when the tool is not persisted
    pub async fn update_analysis(
        db: &DatabaseConnection,
        tool_id: &str,
        analysis: &ToolAnalysis,
    ) -> Result<bool, DbErr> {
        let Some(model) = Entity::find_by_id(tool_id.to_string()).one(db).await? else {
            return Ok(false);
        };

        let mut tool: ActiveModel = model.into();
        tool.is_read = Set(analysis.is_read);
        tool.is_write = Set(analysis.is_write);
        tool.idempotent = Set(analysis.idempotent);
        tool.reversible = Set(analysis.reversible);
        tool.analyzed_at = Set(Some(Utc::now()));
        tool.update(db).await?;

        Ok(true)
    }

    pub async fn delete_for_server(db: &DatabaseConnection, mcp_server_id: &str) -> Result<(), DbErr> {
        Entity::delete_many()
            .filter(Column::McpServerId.eq(mcp_server_id))
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn delete_all(db: &DatabaseConnection) -> Result<(), DbErr> {
        Entity::delete_many().exec(db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::database;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;

    fn descriptor(server_id: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor {
            id: ToolDescriptor::tool_id(server_id, name),
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: json!({"type": "object"}),
            server_id: server_id.to_string(),
            server_name: server_id.to_string(),
            analysis: ToolAnalysis::default(),
        }
    }

    #[test]
    fn test_tool_id() {
        assert_eq!(
            ToolDescriptor::tool_id("slack", "send_message"),
            "slack__send_message"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_replace_for_server_keeps_analysis(#[future] database: Arc<DatabaseConnection>) {
        let db = database.await;

        Model::replace_for_server(
            &db,
            "slack",
            vec![descriptor("slack", "send_message"), descriptor("slack", "list_channels")],
        )
        .await
        .unwrap();

        let analysis = ToolAnalysis {
            is_read: Some(false),
            is_write: Some(true),
            idempotent: Some(false),
            reversible: Some(false),
        };
        assert!(Model::update_analysis(&db, "slack__send_message", &analysis)
            .await
            .unwrap());
        assert!(!Model::update_analysis(&db, "slack__unknown", &analysis)
            .await
            .unwrap());

        // Rediscovery drops list_channels and keeps the stored analysis
        let merged = Model::replace_for_server(&db, "slack", vec![descriptor("slack", "send_message")])
            .await
            .unwrap();
        assert_eq!(merged[0].analysis, analysis);

        let stored = Model::load_for_server(&db, "slack").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].is_write, Some(true));
    }

    #[rstest]
    #[tokio::test]
    async fn test_delete_for_server(#[future] database: Arc<DatabaseConnection>) {
        let db = database.await;
        Model::replace_for_server(&db, "a", vec![descriptor("a", "x")]).await.unwrap();
        Model::replace_for_server(&db, "b", vec![descriptor("b", "y")]).await.unwrap();

        Model::delete_for_server(&db, "a").await.unwrap();

        assert!(Model::load_for_server(&db, "a").await.unwrap().is_empty());
        assert_eq!(Model::load_for_server(&db, "b").await.unwrap().len(), 1);
    }
}
