use axum::Router;
use sea_orm::DatabaseConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::archestra_mcp_server;
use crate::openapi::ApiDoc;
use crate::sandbox::SandboxManager;

pub mod api;
pub mod websocket;

/// Everything the gateway serves, without binding a socket
pub fn create_app(
    db: Arc<DatabaseConnection>,
    manager: SandboxManager,
    websocket_service: Arc<websocket::Service>,
) -> Router {
    let mcp_service = archestra_mcp_server::create_streamable_http_service(manager.clone());
    let api_router = api::create_router(db, manager, websocket_service.clone());
    let websocket_router = websocket::create_router(websocket_service);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api_router)
        .nest("/ws", websocket_router)
        .nest_service("/mcp", mcp_service)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub async fn start_gateway(
    port: u16,
    db: Arc<DatabaseConnection>,
    manager: SandboxManager,
    websocket_service: Arc<websocket::Service>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_app(db, manager, websocket_service);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!("Gateway started successfully on http://{addr}");
    info!("  - Archestra MCP endpoint (streamable HTTP): http://{addr}/mcp");
    info!("  - API endpoints: http://{addr}/api");
    info!("  - WebSocket: ws://{addr}/ws");
    info!("  - API docs: http://{addr}/docs");

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

    if let Err(e) = server.await {
        error!("Server error: {e}");
        return Err(e);
    }

    info!("Gateway has been shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{sandbox_harness, SandboxHarness};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use rstest::rstest;
    use serde_json::Value;
    use tower::ServiceExt;

    #[rstest]
    #[tokio::test]
    async fn test_api_is_nested(#[future] sandbox_harness: SandboxHarness) {
        let harness = sandbox_harness.await;
        let app = create_app(
            harness.db.clone(),
            harness.manager.clone(),
            Arc::new(websocket::Service::new()),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sandbox/status")
                    .header("origin", "http://localhost:1420")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["counts"].is_object());
    }

    #[rstest]
    #[tokio::test]
    async fn test_openapi_document_is_served(#[future] sandbox_harness: SandboxHarness) {
        let harness = sandbox_harness.await;
        let app = create_app(
            harness.db.clone(),
            harness.manager.clone(),
            Arc::new(websocket::Service::new()),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api-docs/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["paths"]["/api/sandbox/status"].is_object());
    }
}
