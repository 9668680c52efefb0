use rmcp::{
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{CallToolResult, Content, JsonObject, ProtocolVersion, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router,
    transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    },
    ErrorData as MCPError, ServerHandler,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::consts::{BUILTIN_SERVER_ID, BUILTIN_SERVER_NAME};
use crate::models::mcp_server::Model as MCPServerModel;
use crate::models::tool::ToolDescriptor;
use crate::sandbox::protocol::DiscoveredTool;
use crate::sandbox::tools::ToolAggregator;
use crate::sandbox::SandboxManager;

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct InstallSandboxedServerRequest {
    /// Id of the catalog connector to install
    pub catalog_id: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct UninstallSandboxedServerRequest {
    pub server_id: String,
}

/// Built-in tool server for managing sandboxed MCP servers
#[derive(Clone)]
pub struct ArchestraMcpServer {
    manager: SandboxManager,
    tool_router: ToolRouter<Self>,
}

fn to_text(value: &Value) -> Result<CallToolResult, MCPError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| MCPError::internal_error(format!("Failed to serialize result: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

#[tool_router]
impl ArchestraMcpServer {
    pub fn new(manager: SandboxManager) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    /// Descriptors of the built-in tools, namespaced like any sandbox's
    pub fn builtin_tools() -> Vec<ToolDescriptor> {
        let discovered = Self::tool_router()
            .list_all()
            .iter()
            .filter_map(|tool| {
                serde_json::to_value(tool)
                    .ok()
                    .as_ref()
                    .and_then(DiscoveredTool::from_mcp_value)
            })
            .collect();
        ToolAggregator::describe(BUILTIN_SERVER_ID, BUILTIN_SERVER_NAME, discovered)
    }

    /// Dispatch a call addressed to the built-in namespace
    pub async fn call_builtin(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, MCPError> {
        let arguments = Value::Object(arguments.unwrap_or_default());
        let invalid = |e: serde_json::Error| MCPError::invalid_params(e.to_string(), None);

        match name {
            "list_sandboxed_servers" => self.list_sandboxed_servers().await,
            "install_sandboxed_server" => {
                let request = serde_json::from_value(arguments).map_err(invalid)?;
                self.install_sandboxed_server(Parameters(request)).await
            }
            "uninstall_sandboxed_server" => {
                let request = serde_json::from_value(arguments).map_err(invalid)?;
                self.uninstall_sandboxed_server(Parameters(request)).await
            }
            _ => Err(MCPError::invalid_params(
                format!("Unknown built-in tool {name}"),
                None,
            )),
        }
    }

    #[tool(description = "List installed sandboxed MCP servers with their state and tool count")]
    async fn list_sandboxed_servers(&self) -> Result<CallToolResult, MCPError> {
        debug!("Listing sandboxed servers");
        let status = self.manager.get_sandbox_status().await;
        let servers = serde_json::to_value(&status.servers)
            .map_err(|e| MCPError::internal_error(e.to_string(), None))?;

        to_text(&json!({
            "servers": servers,
            "total_count": status.counts.total,
        }))
    }

    #[tool(description = "Install an MCP server from the connector catalog and start its sandbox")]
    async fn install_sandboxed_server(
        &self,
        Parameters(InstallSandboxedServerRequest { catalog_id }): Parameters<
            InstallSandboxedServerRequest,
        >,
    ) -> Result<CallToolResult, MCPError> {
        info!("Installing {catalog_id} through the built-in tool server");

        if MCPServerModel::find_catalog_entry(&catalog_id)
            .await
            .map_err(|e| MCPError::internal_error(e, None))?
            .is_none()
        {
            return Err(MCPError::invalid_params(
                format!("No catalog connector {catalog_id}"),
                None,
            ));
        }

        let instance = self
            .manager
            .install_from_catalog(&catalog_id)
            .await
            .map_err(|e| MCPError::internal_error(format!("Failed to install {catalog_id}: {e}"), None))?;

        to_text(&json!({
            "server_id": instance.server_id,
            "state": instance.state,
            "tools": instance.tool_ids,
        }))
    }

    #[tool(description = "Stop and uninstall a sandboxed MCP server")]
    async fn uninstall_sandboxed_server(
        &self,
        Parameters(UninstallSandboxedServerRequest { server_id }): Parameters<
            UninstallSandboxedServerRequest,
        >,
    ) -> Result<CallToolResult, MCPError> {
        info!("Uninstalling {server_id} through the built-in tool server");

        self.manager
            .uninstall_server(&server_id)
            .await
            .map_err(|e| MCPError::internal_error(format!("Failed to uninstall {server_id}: {e}"), None))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Uninstalled {server_id}"
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for ArchestraMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "Manages the sandboxed MCP servers installed in Archestra".to_string(),
            ),
            ..Default::default()
        }
    }
}

pub fn create_streamable_http_service(
    manager: SandboxManager,
) -> StreamableHttpService<ArchestraMcpServer> {
    StreamableHttpService::new(
        move || Ok(ArchestraMcpServer::new(manager.clone())),
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig {
            sse_keep_alive: Some(std::time::Duration::from_secs(30)),
            stateful_mode: false,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::state::SandboxState;
    use crate::test_fixtures::{sandbox_harness, SandboxHarness};
    use rmcp::model::RawContent;
    use rstest::rstest;

    fn text_of(result: &CallToolResult) -> Value {
        match &result.content.first().map(|c| &c.raw) {
            Some(RawContent::Text(text)) => serde_json::from_str(&text.text).unwrap_or(Value::Null),
            _ => panic!("Expected text content"),
        }
    }

    #[test]
    fn test_builtin_tools_are_namespaced() {
        let tools = ArchestraMcpServer::builtin_tools();
        let ids: Vec<&str> = tools.iter().map(|t| t.id.as_str()).collect();

        assert!(ids.contains(&"archestra__list_sandboxed_servers"));
        assert!(ids.contains(&"archestra__install_sandboxed_server"));
        assert!(ids.contains(&"archestra__uninstall_sandboxed_server"));
        assert!(tools.iter().all(|t| t.server_name == BUILTIN_SERVER_NAME));
    }

    #[rstest]
    #[tokio::test]
    async fn test_server_info(#[future] sandbox_harness: SandboxHarness) {
        let harness = sandbox_harness.await;
        let server = ArchestraMcpServer::new(harness.manager.clone());
        let info = <ArchestraMcpServer as ServerHandler>::get_info(&server);

        assert_eq!(info.protocol_version, ProtocolVersion::V_2025_03_26);
        assert!(info.capabilities.tools.is_some());
        assert!(info.capabilities.resources.is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_install_list_uninstall(#[future] sandbox_harness: SandboxHarness) {
        let harness = sandbox_harness.await;
        harness.runtime.set_tools("fetch", &["fetch"]);
        let server = ArchestraMcpServer::new(harness.manager.clone());

        let mut args = JsonObject::new();
        args.insert("catalog_id".to_string(), json!("fetch"));
        let installed = server
            .call_builtin("install_sandboxed_server", Some(args))
            .await
            .unwrap();
        assert_eq!(text_of(&installed)["state"], json!(SandboxState::Running));

        let listed = text_of(&server.list_sandboxed_servers().await.unwrap());
        assert_eq!(listed["total_count"], 1);
        assert_eq!(listed["servers"][0]["server_id"], "fetch");

        let mut args = JsonObject::new();
        args.insert("server_id".to_string(), json!("fetch"));
        server
            .call_builtin("uninstall_sandboxed_server", Some(args))
            .await
            .unwrap();
        assert!(harness.manager.instance("fetch").await.is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_bad_calls_are_invalid_params(#[future] sandbox_harness: SandboxHarness) {
        let harness = sandbox_harness.await;
        let server = ArchestraMcpServer::new(harness.manager.clone());

        assert!(server.call_builtin("nope", None).await.is_err());
        assert!(server
            .call_builtin("install_sandboxed_server", None)
            .await
            .is_err());

        let mut args = JsonObject::new();
        args.insert("catalog_id".to_string(), json!("not-in-catalog"));
        assert!(server
            .call_builtin("install_sandboxed_server", Some(args))
            .await
            .is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_builtin_calls_route_through_manager(#[future] sandbox_harness: SandboxHarness) {
        let harness = sandbox_harness.await;
        harness.manager.initialize().await.unwrap();

        let result = harness
            .manager
            .call_tool("archestra__list_sandboxed_servers", None)
            .await
            .unwrap();

        assert!(result["content"].is_array());
    }
}
