use utoipa::OpenApi;
use utoipauto::utoipauto;

#[utoipauto]
#[derive(OpenApi)]
#[openapi(
    tags(
        (name = "mcp_server", description = "MCP Server installation, tools and OAuth API"),
        (name = "sandbox", description = "Sandbox status and lifecycle API"),
        (name = "websocket", description = "WebSocket event types"),
    ),
    info(
        title = "Archestra Sandbox API",
        version = "1.0.0",
        description = "API for running MCP servers in sandboxed containers and using their tools"
    )
)]
pub struct ApiDoc;
