use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::consts::BUILTIN_SERVER_ID;
use crate::models::tool::{ToolAnalysis, ToolDescriptor};
use crate::sandbox::protocol::DiscoveredTool;

/// Every callable tool, keyed by namespaced id
#[derive(Clone, Default)]
pub struct ToolAggregator {
    tools: Arc<RwLock<HashMap<String, ToolDescriptor>>>,
}

impl ToolAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace a server's discovered tools
    pub fn describe(
        server_id: &str,
        server_name: &str,
        discovered: Vec<DiscoveredTool>,
    ) -> Vec<ToolDescriptor> {
        discovered
            .into_iter()
            .map(|tool| ToolDescriptor {
                id: ToolDescriptor::tool_id(server_id, &tool.name),
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
                server_id: server_id.to_string(),
                server_name: server_name.to_string(),
                analysis: tool.annotations,
            })
            .collect()
    }

    /// Replace everything registered for `server_id` with `tools`.
    /// On an id collision with another server, the newer registration wins.
    pub async fn register_server_tools(
        &self,
        server_id: &str,
        tools: Vec<ToolDescriptor>,
    ) -> Vec<String> {
        let mut map = self.tools.write().await;
        map.retain(|_, tool| tool.server_id != server_id);

        let mut ids = Vec::with_capacity(tools.len());
        for tool in tools {
            if let Some(previous) = map.get(&tool.id) {
                warn!(
                    "Tool id {} from {} replaces the one registered by {}",
                    tool.id, server_id, previous.server_id
                );
            }
            ids.push(tool.id.clone());
            map.insert(tool.id.clone(), tool);
        }

        debug!("Registered {} tools for {server_id}", ids.len());
        ids
    }

    pub async fn remove_server(&self, server_id: &str) -> usize {
        let mut map = self.tools.write().await;
        let before = map.len();
        map.retain(|_, tool| tool.server_id != server_id);
        before - map.len()
    }

    /// Drop every sandboxed tool, keeping the built-in ones
    pub async fn clear_sandboxed(&self) {
        self.tools
            .write()
            .await
            .retain(|_, tool| tool.server_id == BUILTIN_SERVER_ID);
    }

    /// All tools ordered by id
    pub async fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self.tools.read().await.values().cloned().collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }

    /// Requested tools in request order, unknown ids are skipped
    pub async fn get_tools_by_id(&self, ids: &[String]) -> Vec<ToolDescriptor> {
        let map = self.tools.read().await;
        ids.iter().filter_map(|id| map.get(id).cloned()).collect()
    }

    pub async fn get_tool(&self, id: &str) -> Option<ToolDescriptor> {
        self.tools.read().await.get(id).cloned()
    }

    pub async fn update_analysis(&self, id: &str, analysis: ToolAnalysis) -> bool {
        match self.tools.write().await.get_mut(id) {
            Some(tool) => {
                tool.analysis = analysis;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn discovered(names: &[&str]) -> Vec<DiscoveredTool> {
        names
            .iter()
            .map(|name| DiscoveredTool {
                name: name.to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
                annotations: ToolAnalysis::default(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_namespacing_and_union() {
        let aggregator = ToolAggregator::new();
        aggregator
            .register_server_tools(
                "slack",
                ToolAggregator::describe("slack", "Slack", discovered(&["send_message"])),
            )
            .await;
        aggregator
            .register_server_tools(
                "gmail",
                ToolAggregator::describe("gmail", "Gmail", discovered(&["send_message", "search"])),
            )
            .await;

        let ids: Vec<String> = aggregator
            .get_all_tools()
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(
            ids,
            vec!["gmail__search", "gmail__send_message", "slack__send_message"]
        );
    }

    #[tokio::test]
    async fn test_get_tools_by_id_skips_unknown() {
        let aggregator = ToolAggregator::new();
        aggregator
            .register_server_tools(
                "slack",
                ToolAggregator::describe("slack", "Slack", discovered(&["a", "b"])),
            )
            .await;

        let tools = aggregator
            .get_tools_by_id(&[
                "slack__b".to_string(),
                "missing__tool".to_string(),
                "slack__a".to_string(),
            ])
            .await;
        let ids: Vec<&str> = tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["slack__b", "slack__a"]);
    }

    #[tokio::test]
    async fn test_reregistering_replaces_and_remove_clears_namespace() {
        let aggregator = ToolAggregator::new();
        aggregator
            .register_server_tools(
                "slack",
                ToolAggregator::describe("slack", "Slack", discovered(&["a", "b"])),
            )
            .await;
        aggregator
            .register_server_tools(
                "slack",
                ToolAggregator::describe("slack", "Slack", discovered(&["c"])),
            )
            .await;
        assert_eq!(aggregator.get_all_tools().await.len(), 1);

        assert_eq!(aggregator.remove_server("slack").await, 1);
        assert!(aggregator.get_all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn test_collision_last_writer_wins() {
        let aggregator = ToolAggregator::new();
        let mut first = ToolAggregator::describe("a", "A", discovered(&["x"]));
        first[0].id = "shared__tool".to_string();
        let mut second = ToolAggregator::describe("b", "B", discovered(&["y"]));
        second[0].id = "shared__tool".to_string();

        aggregator.register_server_tools("a", first).await;
        aggregator.register_server_tools("b", second).await;

        let tool = aggregator.get_tool("shared__tool").await.unwrap();
        assert_eq!(tool.server_id, "b");
        assert_eq!(aggregator.get_all_tools().await.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_sandboxed_keeps_builtin() {
        let aggregator = ToolAggregator::new();
        aggregator
            .register_server_tools(
                BUILTIN_SERVER_ID,
                ToolAggregator::describe(BUILTIN_SERVER_ID, "Archestra", discovered(&["list"])),
            )
            .await;
        aggregator
            .register_server_tools(
                "slack",
                ToolAggregator::describe("slack", "Slack", discovered(&["a"])),
            )
            .await;

        aggregator.clear_sandboxed().await;

        let tools = aggregator.get_all_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].server_id, BUILTIN_SERVER_ID);
    }
}
