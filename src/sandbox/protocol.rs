use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, JsonObject},
    transport::StreamableHttpClientTransport,
    ServiceExt,
};
use serde_json::Value;
use tracing::debug;

use crate::models::tool::ToolAnalysis;
use crate::sandbox::error::{Result, SandboxError};

/// A tool as reported by a sandboxed server, before namespacing
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    /// Analysis seeded from the tool's protocol annotations
    pub annotations: ToolAnalysis,
}

impl DiscoveredTool {
    /// Build from the wire representation of an MCP tool
    pub fn from_mcp_value(value: &Value) -> Option<Self> {
        let name = value.get("name")?.as_str()?.to_string();
        let description = value
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let input_schema = value
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"type": "object"}));

        let hint = |key: &str| {
            value
                .get("annotations")
                .and_then(|a| a.get(key))
                .and_then(Value::as_bool)
        };
        let read_only = hint("readOnlyHint");
        let annotations = ToolAnalysis {
            is_read: read_only,
            is_write: read_only.map(|r| !r),
            idempotent: hint("idempotentHint"),
            reversible: hint("destructiveHint").map(|d| !d),
        };

        Some(Self {
            name,
            description,
            input_schema,
            annotations,
        })
    }
}

/// The MCP handshake against a sandbox endpoint
#[async_trait]
pub trait ToolProtocolClient: Send + Sync {
    /// Connect, initialize and list every tool. Doubles as the readiness probe.
    async fn list_tools(&self, endpoint: &str) -> Result<Vec<DiscoveredTool>>;

    async fn call_tool(
        &self,
        endpoint: &str,
        tool_name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<Value>;
}

/// rmcp client over the streamable HTTP transport
#[derive(Debug, Default, Clone)]
pub struct StreamableHttpToolClient;

#[async_trait]
impl ToolProtocolClient for StreamableHttpToolClient {
    async fn list_tools(&self, endpoint: &str) -> Result<Vec<DiscoveredTool>> {
        let transport = StreamableHttpClientTransport::from_uri(endpoint.to_string());
        let client = ()
            .serve(transport)
            .await
            .map_err(|e| SandboxError::Protocol(format!("Handshake with {endpoint} failed: {e}")))?;

        let listed = client.list_all_tools().await;
        let _ = client.cancel().await;

        let tools = listed
            .map_err(|e| SandboxError::ToolDiscoveryError(format!("tools/list failed: {e}")))?;
        debug!("Discovered {} tools at {endpoint}", tools.len());

        tools
            .iter()
            .map(|tool| {
                serde_json::to_value(tool)
                    .ok()
                    .as_ref()
                    .and_then(DiscoveredTool::from_mcp_value)
                    .ok_or_else(|| {
                        SandboxError::ToolDiscoveryError(format!(
                            "Unreadable tool definition from {endpoint}"
                        ))
                    })
            })
            .collect()
    }

    async fn call_tool(
        &self,
        endpoint: &str,
        tool_name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<Value> {
        let transport = StreamableHttpClientTransport::from_uri(endpoint.to_string());
        let client = ()
            .serve(transport)
            .await
            .map_err(|e| SandboxError::Protocol(format!("Handshake with {endpoint} failed: {e}")))?;

        let result = client
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments,
            })
            .await;
        let _ = client.cancel().await;

        let result =
            result.map_err(|e| SandboxError::Protocol(format!("tools/call {tool_name} failed: {e}")))?;
        serde_json::to_value(result).map_err(|e| SandboxError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_mcp_value_seeds_analysis() {
        let tool = DiscoveredTool::from_mcp_value(&json!({
            "name": "send_message",
            "description": "Send a message",
            "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}},
            "annotations": {"readOnlyHint": false, "destructiveHint": true, "idempotentHint": false}
        }))
        .unwrap();

        assert_eq!(tool.name, "send_message");
        assert_eq!(tool.description.as_deref(), Some("Send a message"));
        assert_eq!(tool.annotations.is_read, Some(false));
        assert_eq!(tool.annotations.is_write, Some(true));
        assert_eq!(tool.annotations.reversible, Some(false));
        assert_eq!(tool.annotations.idempotent, Some(false));
    }

    #[test]
    fn test_from_mcp_value_without_annotations() {
        let tool = DiscoveredTool::from_mcp_value(&json!({"name": "ping"})).unwrap();
        assert!(tool.annotations.is_empty());
        assert_eq!(tool.input_schema, json!({"type": "object"}));

        assert!(DiscoveredTool::from_mcp_value(&json!({"description": "no name"})).is_none());
    }
}
