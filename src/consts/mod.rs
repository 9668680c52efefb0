pub const GATEWAY_SERVER_PORT: u16 = 54587;

/// Image every sandbox runs unless its launch spec names another one
pub const BASE_IMAGE: &str = "archestra/mcp-server-sandbox:latest";

/// Port the sandbox image serves the streamable HTTP tool endpoint on
pub const SANDBOX_CONTAINER_PORT: u16 = 8080;
pub const SANDBOX_MCP_PATH: &str = "/mcp";

pub const CONTAINER_NAME_PREFIX: &str = "archestra-mcp-";
pub const MANAGED_LABEL: &str = "archestra.managed";
pub const SERVER_ID_LABEL: &str = "archestra.server_id";

pub const TOOL_ID_SEPARATOR: &str = "__";

pub const BUILTIN_SERVER_ID: &str = "archestra";
pub const BUILTIN_SERVER_NAME: &str = "Archestra";

pub const PODMAN_MACHINE_NAME: &str = "archestra-ai-machine";
