use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use utoipa::ToSchema;

use crate::sandbox::error::SandboxFailure;
use crate::sandbox::runtime::{RuntimeProgress, RuntimeState};
use crate::sandbox::state::{SandboxInstance, SandboxState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RuntimeStatus {
    pub state: RuntimeState,
    pub progress: RuntimeProgress,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ServerStatus {
    pub server_id: String,
    pub server_name: String,
    pub state: SandboxState,
    pub last_error: Option<SandboxFailure>,
    pub tool_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StatusCounts {
    pub total: usize,
    pub running: usize,
    pub failed: usize,
    pub starting: usize,
}

/// What the status channel pushes to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxStatusSummary {
    pub runtime: RuntimeStatus,
    pub servers: Vec<ServerStatus>,
    pub counts: StatusCounts,
    pub generated_at: DateTime<Utc>,
}

impl SandboxStatusSummary {
    pub fn from_instances<'a>(
        runtime: RuntimeStatus,
        instances: impl IntoIterator<Item = &'a SandboxInstance>,
    ) -> Self {
        let mut servers: Vec<ServerStatus> = instances
            .into_iter()
            .map(|instance| ServerStatus {
                server_id: instance.server_id.clone(),
                server_name: instance.server_name.clone(),
                state: instance.state,
                last_error: instance.last_error.clone(),
                tool_count: instance.tool_ids.len(),
            })
            .collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        let counts = StatusCounts {
            total: servers.len(),
            running: servers
                .iter()
                .filter(|s| s.state == SandboxState::Running)
                .count(),
            failed: servers
                .iter()
                .filter(|s| s.state == SandboxState::Failed)
                .count(),
            starting: servers.iter().filter(|s| s.state.is_starting()).count(),
        };

        Self {
            runtime,
            servers,
            counts,
            generated_at: Utc::now(),
        }
    }

    pub fn server(&self, server_id: &str) -> Option<&ServerStatus> {
        self.servers.iter().find(|s| s.server_id == server_id)
    }
}

/// Periodically pushes a status snapshot until cancelled
pub struct StatusBroadcaster {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatusBroadcaster {
    /// `snapshot` must only read cached state, it runs on every tick
    pub fn spawn<F, Fut>(
        interval: Duration,
        sender: broadcast::Sender<SandboxStatusSummary>,
        parent: &CancellationToken,
        snapshot: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = SandboxStatusSummary> + Send,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = snapshot().await;
                        // No subscribers is fine
                        let _ = sender.send(summary);
                    }
                }
            }

            debug!("📡 Status broadcaster stopped");
        });

        Self { cancel, handle }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
