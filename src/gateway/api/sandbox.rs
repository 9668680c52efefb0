use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::sandbox::status::SandboxStatusSummary;
use crate::sandbox::SandboxManager;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SandboxActionResponse {
    pub success: bool,
    pub message: String,
}

type ActionResult = Result<Json<SandboxActionResponse>, (StatusCode, Json<SandboxActionResponse>)>;

fn action_result(action: &str, result: crate::sandbox::error::Result<()>) -> ActionResult {
    match result {
        Ok(()) => Ok(Json(SandboxActionResponse {
            success: true,
            message: format!("Sandbox {action} completed"),
        })),
        Err(e) => {
            error!("Sandbox {action} failed: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SandboxActionResponse {
                    success: false,
                    message: e.to_string(),
                }),
            ))
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/sandbox/status",
    tag = "sandbox",
    responses(
        (status = 200, description = "Cached status of the runtime and every sandbox", body = SandboxStatusSummary)
    )
)]
pub async fn get_sandbox_status(State(manager): State<SandboxManager>) -> Json<SandboxStatusSummary> {
    Json(manager.get_sandbox_status().await)
}

#[utoipa::path(
    post,
    path = "/api/sandbox/restart",
    tag = "sandbox",
    responses(
        (status = 200, description = "Sandboxes restarted", body = SandboxActionResponse),
        (status = 500, description = "Restart failed", body = SandboxActionResponse)
    )
)]
pub async fn restart_sandbox(State(manager): State<SandboxManager>) -> ActionResult {
    action_result("restart", manager.restart().await)
}

#[utoipa::path(
    post,
    path = "/api/sandbox/reset",
    tag = "sandbox",
    responses(
        (status = 200, description = "Sandboxes reset", body = SandboxActionResponse),
        (status = 500, description = "Reset failed", body = SandboxActionResponse)
    )
)]
pub async fn reset_sandbox(State(manager): State<SandboxManager>) -> ActionResult {
    action_result("reset", manager.reset().await)
}

pub fn create_router(manager: SandboxManager) -> Router {
    Router::new()
        .route("/status", get(get_sandbox_status))
        .route("/restart", post(restart_sandbox))
        .route("/reset", post(reset_sandbox))
        .with_state(manager)
}
