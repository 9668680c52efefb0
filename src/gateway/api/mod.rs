use axum::Router;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::gateway::websocket;
use crate::sandbox::SandboxManager;

pub mod mcp_server;
pub mod sandbox;

pub fn create_router(
    db: Arc<DatabaseConnection>,
    manager: SandboxManager,
    websocket_service: Arc<websocket::Service>,
) -> Router {
    Router::new()
        .nest(
            "/mcp_server",
            mcp_server::create_router(db, manager.clone(), websocket_service),
        )
        .nest("/sandbox", sandbox::create_router(manager))
}
