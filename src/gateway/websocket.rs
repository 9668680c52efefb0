use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::sandbox::status::SandboxStatusSummary;
use crate::sandbox::SandboxManager;

const CHANNEL_CAPACITY: usize = 100;

// Payload types
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OAuthSuccessWebSocketPayload {
    pub mcp_server_catalog_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OAuthErrorWebSocketPayload {
    pub mcp_server_catalog_id: Option<String>,
    pub error: String,
}

// Enum for all possible WebSocket messages
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "payload")]
pub enum WebSocketMessage {
    #[serde(rename = "sandbox-status-updated")]
    SandboxStatusUpdated(SandboxStatusSummary),
    #[serde(rename = "oauth-success")]
    OAuthSuccess(OAuthSuccessWebSocketPayload),
    #[serde(rename = "oauth-error")]
    OAuthError(OAuthErrorWebSocketPayload),
}

#[derive(Clone)]
pub struct Service {
    pub broadcast_tx: broadcast::Sender<WebSocketMessage>,
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { broadcast_tx }
    }

    pub fn broadcast(&self, message: WebSocketMessage) {
        // Nobody connected is fine
        let _ = self.broadcast_tx.send(message);
    }

    /// Relay every status summary the manager publishes to all clients
    pub fn forward_sandbox_status(&self, manager: &SandboxManager) -> JoinHandle<()> {
        let mut status_rx = manager.subscribe_status();
        let service = self.clone();

        tokio::spawn(async move {
            loop {
                match status_rx.recv().await {
                    Ok(summary) => service.broadcast(WebSocketMessage::SandboxStatusUpdated(summary)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Status relay skipped {skipped} summaries");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<Service>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

async fn handle_socket(socket: WebSocket, service: Arc<Service>) {
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = service.broadcast_tx.subscribe();

    info!("New WebSocket client connected");

    let send_task = tokio::spawn(async move {
        loop {
            let message = match broadcast_rx.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, {skipped} messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let msg_str = match serde_json::to_string(&message) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to serialize WebSocket message: {e}");
                    continue;
                }
            };

            if let Err(e) = sender.send(Message::Text(msg_str.into())).await {
                debug!("Failed to send to client: {e}");
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => debug!("Received text message: {text}"),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                error!("WebSocket error: {e}");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    info!("WebSocket client disconnected");
}

pub fn create_router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/", axum::routing::get(websocket_handler))
        .with_state(service)
}
