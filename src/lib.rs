use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod archestra_mcp_server;
pub mod config;
pub mod consts;
pub mod database;
pub mod gateway;
pub mod models;
pub mod oauth;
pub mod openapi;
pub mod sandbox;

#[cfg(test)]
pub mod test_fixtures;

use config::SandboxSettings;
use sandbox::{SandboxBackends, SandboxManager};

/// Run the sandbox service until ctrl-c, then stop every sandbox
pub async fn run(settings: SandboxSettings) -> Result<(), String> {
    let db = Arc::new(database::init_database(&settings).await?);

    let backends = SandboxBackends::podman(db.clone(), &settings);
    let gateway_port = settings.gateway_port;
    let manager = SandboxManager::new(db.clone(), settings, backends);

    let websocket_service = Arc::new(gateway::websocket::Service::new());
    let status_relay = websocket_service.forward_sandbox_status(&manager);

    // Start all persisted MCP servers
    let initializing = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = initializing.initialize().await {
            error!("Failed to start MCP servers: {e}");
        }
    });

    let shutdown = CancellationToken::new();
    let gateway = tokio::spawn(gateway::start_gateway(
        gateway_port,
        db,
        manager.clone(),
        websocket_service,
        shutdown.clone(),
    ));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for ctrl-c: {e}");
            }
        }
        result = gateway => {
            match result {
                Ok(Ok(())) => info!("Gateway stopped"),
                Ok(Err(e)) => error!("Failed to start gateway: {e}"),
                Err(e) => error!("Gateway task failed: {e}"),
            }
        }
    }

    info!("Archestra is shutting down, cleaning up resources...");
    shutdown.cancel();
    manager.shutdown().await;
    status_relay.abort();
    info!("Cleanup completed");

    Ok(())
}
