use axum::{
    extract::{Path, Query, RawQuery, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use rmcp::model::JsonObject;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

use crate::gateway::websocket::Service as WebSocketService;
use crate::models::mcp_server::{ConnectorCatalogEntry, Model as MCPServer, SandboxedServerConfig};
use crate::models::tool::{ToolAnalysis, ToolDescriptor};
use crate::sandbox::error::SandboxError;
use crate::sandbox::state::SandboxInstance;
use crate::sandbox::SandboxManager;

pub mod oauth;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(as = InstallMCPServerRequest)]
pub struct InstallRequest {
    mcp_server_catalog_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OAuthStartParams {
    mcp_server_catalog_id: String,
    provider: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OAuthStartResponse {
    pub auth_url: String,
    /// Present when the provider uses PKCE, needed for the token exchange
    pub code_verifier: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToolsQuery {
    /// Comma separated tool ids, all tools when absent
    ids: Option<String>,
}

/// An installed config together with the current state of its sandbox
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InstalledMCPServer {
    #[serde(flatten)]
    pub config: SandboxedServerConfig,
    pub sandbox: Option<SandboxInstance>,
}

type ApiError = (StatusCode, String);

fn api_error(e: SandboxError) -> ApiError {
    let status = match &e {
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::NeedsAuthentication(_) => StatusCode::UNAUTHORIZED,
        SandboxError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

pub struct Service {
    db: Arc<DatabaseConnection>,
    manager: SandboxManager,
    websocket: Arc<WebSocketService>,
}

impl Service {
    pub fn new(
        db: Arc<DatabaseConnection>,
        manager: SandboxManager,
        websocket: Arc<WebSocketService>,
    ) -> Self {
        Self {
            db,
            manager,
            websocket,
        }
    }

    async fn get_installed_mcp_servers(&self) -> Result<Vec<InstalledMCPServer>, String> {
        let configs = MCPServer::load_installed_configs(&self.db)
            .await
            .map_err(|e| format!("Failed to load installed MCP servers: {e}"))?;

        let mut installed = Vec::with_capacity(configs.len());
        for config in configs {
            let sandbox = self.manager.instance(&config.id).await;
            installed.push(InstalledMCPServer { config, sandbox });
        }
        Ok(installed)
    }

    async fn get_mcp_connector_catalog(&self) -> Result<Vec<ConnectorCatalogEntry>, String> {
        MCPServer::get_mcp_connector_catalog()
            .await
            .map_err(|e| format!("Failed to get MCP connector catalog: {e}"))
    }

    async fn start_oauth_auth(
        &self,
        provider: &str,
        mcp_server_catalog_id: &str,
    ) -> Result<OAuthStartResponse, SandboxError> {
        info!("Starting OAuth auth flow for MCP server: {mcp_server_catalog_id}");

        if MCPServer::find_catalog_entry(mcp_server_catalog_id)
            .await
            .map_err(SandboxError::NotFound)?
            .is_none()
        {
            return Err(SandboxError::NotFound(format!(
                "No catalog connector {mcp_server_catalog_id}"
            )));
        }

        let redirect_uri = format!(
            "http://127.0.0.1:{}/api/mcp_server/oauth/callback",
            self.manager.settings().gateway_port
        );
        let (auth_url, pkce) =
            self.manager
                .credentials()
                .authorization_url(provider, &redirect_uri, mcp_server_catalog_id)?;

        Ok(OAuthStartResponse {
            auth_url: auth_url.to_string(),
            code_verifier: pkce.map(|pkce| pkce.code_verifier),
        })
    }
}

#[utoipa::path(
    get,
    path = "/api/mcp_server",
    tag = "mcp_server",
    responses(
        (status = 200, description = "List of installed MCP servers", body = Vec<InstalledMCPServer>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_installed_mcp_servers(
    State(service): State<Arc<Service>>,
) -> Result<Json<Vec<InstalledMCPServer>>, StatusCode> {
    service
        .get_installed_mcp_servers()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[utoipa::path(
    get,
    path = "/api/mcp_server/catalog",
    tag = "mcp_server",
    responses(
        (status = 200, description = "MCP connector catalog", body = Vec<ConnectorCatalogEntry>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_mcp_connector_catalog(
    State(service): State<Arc<Service>>,
) -> Result<Json<Vec<ConnectorCatalogEntry>>, StatusCode> {
    service
        .get_mcp_connector_catalog()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[utoipa::path(
    post,
    path = "/api/mcp_server/catalog/install",
    tag = "mcp_server",
    request_body = InstallRequest,
    responses(
        (status = 200, description = "MCP server installed and running", body = SandboxInstance),
        (status = 401, description = "MCP server needs OAuth authentication"),
        (status = 404, description = "Unknown catalog connector"),
        (status = 500, description = "Sandbox failed to start")
    )
)]
pub async fn install_mcp_server_from_catalog(
    State(service): State<Arc<Service>>,
    Json(payload): Json<InstallRequest>,
) -> Result<Json<SandboxInstance>, ApiError> {
    service
        .manager
        .install_from_catalog(&payload.mcp_server_catalog_id)
        .await
        .map(Json)
        .map_err(api_error)
}

#[utoipa::path(
    post,
    path = "/api/mcp_server/install",
    tag = "mcp_server",
    request_body = SandboxedServerConfig,
    responses(
        (status = 200, description = "MCP server installed and running", body = SandboxInstance),
        (status = 401, description = "MCP server needs OAuth authentication"),
        (status = 500, description = "Sandbox failed to start")
    )
)]
pub async fn install_mcp_server(
    State(service): State<Arc<Service>>,
    Json(config): Json<SandboxedServerConfig>,
) -> Result<Json<SandboxInstance>, ApiError> {
    service
        .manager
        .install_server(config)
        .await
        .map(Json)
        .map_err(api_error)
}

#[utoipa::path(
    post,
    path = "/api/mcp_server/catalog/start_oauth_installation",
    tag = "mcp_server",
    params(
        ("mcp_server_catalog_id" = String, Query, description = "ID of the MCP server from catalog"),
        ("provider" = String, Query, description = "OAuth provider of the MCP server")
    ),
    responses(
        (status = 200, description = "OAuth authorization URL", body = OAuthStartResponse),
        (status = 404, description = "Unknown catalog connector"),
        (status = 500, description = "Provider cannot build an authorization URL")
    )
)]
pub async fn start_mcp_server_oauth(
    State(service): State<Arc<Service>>,
    Query(params): Query<OAuthStartParams>,
) -> Result<Json<OAuthStartResponse>, ApiError> {
    service
        .start_oauth_auth(&params.provider, &params.mcp_server_catalog_id)
        .await
        .map(Json)
        .map_err(api_error)
}

#[utoipa::path(
    get,
    path = "/api/mcp_server/oauth/callback",
    tag = "mcp_server",
    params(
        ("mcp_catalog_connector_id" = String, Query, description = "Catalog connector the tokens belong to"),
        ("access_token" = Option<String>, Query, description = "OAuth access token"),
        ("refresh_token" = Option<String>, Query, description = "OAuth refresh token"),
        ("expiry_date" = Option<i64>, Query, description = "Token expiry in epoch milliseconds"),
        ("error" = Option<String>, Query, description = "Error reported by the provider")
    ),
    responses(
        (status = 200, description = "Tokens stored and MCP server started"),
        (status = 400, description = "Callback rejected")
    )
)]
pub async fn oauth_callback(
    State(service): State<Arc<Service>>,
    RawQuery(query): RawQuery,
) -> Result<String, ApiError> {
    let url = format!(
        "archestra-ai://oauth-callback?{}",
        query.unwrap_or_default()
    );

    oauth::handle_oauth_callback(&service.db, &service.manager, &service.websocket, &url)
        .await
        .map(|id| format!("Authenticated {id}, you can close this window"))
        .map_err(|e| (StatusCode::BAD_REQUEST, e.message))
}

#[utoipa::path(
    delete,
    path = "/api/mcp_server/{mcp_server_id}",
    tag = "mcp_server",
    params(
        ("mcp_server_id" = String, Path, description = "ID of the MCP server to uninstall")
    ),
    responses(
        (status = 200, description = "MCP server uninstalled successfully"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn uninstall_mcp_server(
    State(service): State<Arc<Service>>,
    Path(mcp_server_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    service
        .manager
        .uninstall_server(&mcp_server_id)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn lifecycle_status(error: SandboxError) -> StatusCode {
    match error {
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[utoipa::path(
    post,
    path = "/api/mcp_server/{mcp_server_id}/stop",
    tag = "mcp_server",
    params(
        ("mcp_server_id" = String, Path, description = "ID of the MCP server to stop")
    ),
    responses(
        (status = 200, description = "MCP server sandbox stopped"),
        (status = 404, description = "No sandbox for this MCP server"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn stop_mcp_server(
    State(service): State<Arc<Service>>,
    Path(mcp_server_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    service
        .manager
        .stop_server(&mcp_server_id)
        .await
        .map(|_| StatusCode::OK)
        .map_err(lifecycle_status)
}

#[utoipa::path(
    post,
    path = "/api/mcp_server/{mcp_server_id}/disconnect",
    tag = "mcp_server",
    params(
        ("mcp_server_id" = String, Path, description = "ID of the MCP server to disconnect")
    ),
    responses(
        (status = 200, description = "OAuth tokens removed and sandbox stopped"),
        (status = 404, description = "No sandbox for this MCP server"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn disconnect_mcp_server(
    State(service): State<Arc<Service>>,
    Path(mcp_server_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    service
        .manager
        .disconnect_server(&mcp_server_id)
        .await
        .map(|_| StatusCode::OK)
        .map_err(lifecycle_status)
}

#[utoipa::path(
    get,
    path = "/api/mcp_server/tools",
    tag = "mcp_server",
    params(
        ("ids" = Option<String>, Query, description = "Comma separated tool ids")
    ),
    responses(
        (status = 200, description = "Tools of the running sandboxes", body = Vec<ToolDescriptor>)
    )
)]
pub async fn get_tools(
    State(service): State<Arc<Service>>,
    Query(query): Query<ToolsQuery>,
) -> Json<Vec<ToolDescriptor>> {
    let tools = match query.ids {
        Some(ids) => {
            let ids: Vec<String> = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
            service.manager.get_tools_by_id(&ids).await
        }
        None => service.manager.get_all_tools().await,
    };
    Json(tools)
}

#[utoipa::path(
    post,
    path = "/api/mcp_server/tools/{tool_id}/call",
    tag = "mcp_server",
    params(
        ("tool_id" = String, Path, description = "Namespaced tool id")
    ),
    request_body(content = Value, description = "Tool arguments"),
    responses(
        (status = 200, description = "Raw tool call result", body = Value),
        (status = 404, description = "Unknown tool or sandbox not running"),
        (status = 500, description = "Tool call failed")
    )
)]
pub async fn call_tool(
    State(service): State<Arc<Service>>,
    Path(tool_id): Path<String>,
    arguments: Option<Json<JsonObject>>,
) -> Result<Json<Value>, ApiError> {
    service
        .manager
        .call_tool(&tool_id, arguments.map(|Json(arguments)| arguments))
        .await
        .map(Json)
        .map_err(api_error)
}

#[utoipa::path(
    put,
    path = "/api/mcp_server/tools/{tool_id}/analysis",
    tag = "mcp_server",
    params(
        ("tool_id" = String, Path, description = "Namespaced tool id")
    ),
    request_body = ToolAnalysis,
    responses(
        (status = 200, description = "Analysis stored"),
        (status = 404, description = "Unknown tool"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn update_tool_analysis(
    State(service): State<Arc<Service>>,
    Path(tool_id): Path<String>,
    Json(analysis): Json<ToolAnalysis>,
) -> Result<StatusCode, StatusCode> {
    match service.manager.update_tool_analysis(&tool_id, analysis).await {
        Ok(true) => Ok(StatusCode::OK),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub fn create_router(
    db: Arc<DatabaseConnection>,
    manager: SandboxManager,
    websocket: Arc<WebSocketService>,
) -> Router {
    let service = Arc::new(Service::new(db, manager, websocket));

    Router::new()
        .route("/", get(get_installed_mcp_servers))
        .route("/install", post(install_mcp_server))
        .route("/catalog", get(get_mcp_connector_catalog))
        .route("/catalog/install", post(install_mcp_server_from_catalog))
        .route(
            "/catalog/start_oauth_installation",
            post(start_mcp_server_oauth),
        )
        .route("/oauth/callback", get(oauth_callback))
        .route("/tools", get(get_tools))
        .route("/tools/{tool_id}/call", post(call_tool))
        .route("/tools/{tool_id}/analysis", put(update_tool_analysis))
        .route("/{mcp_server_id}", delete(uninstall_mcp_server))
        .route("/{mcp_server_id}/stop", post(stop_mcp_server))
        .route("/{mcp_server_id}/disconnect", post(disconnect_mcp_server))
        .with_state(service)
}
