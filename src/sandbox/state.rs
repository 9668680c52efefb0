use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::oneshot;
use utoipa::ToSchema;

use crate::models::tool::ToolDescriptor;
use crate::sandbox::error::SandboxFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SandboxState {
    Uninitialized,
    PullingImage,
    Starting,
    Running,
    Failed,
    Stopping,
    Stopped,
}

impl SandboxState {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;

        if self == next {
            return true;
        }

        match next {
            Failed | Stopped => true,
            Stopping => self != Stopped,
            PullingImage => matches!(self, Uninitialized | Failed | Stopped),
            Starting => matches!(self, Uninitialized | PullingImage | Failed | Stopped),
            Running => self == Starting,
            Uninitialized => false,
        }
    }

    /// A start has finished one way or the other
    pub fn is_settled(self) -> bool {
        matches!(self, SandboxState::Running | SandboxState::Failed)
    }

    pub fn is_starting(self) -> bool {
        matches!(self, SandboxState::PullingImage | SandboxState::Starting)
    }
}

/// Cached view of one installed server's sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SandboxInstance {
    pub server_id: String,
    pub server_name: String,
    pub state: SandboxState,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub last_error: Option<SandboxFailure>,
    pub tool_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxInstance {
    pub fn new(server_id: String, server_name: String) -> Self {
        Self {
            server_id,
            server_name,
            state: SandboxState::Uninitialized,
            container_id: None,
            endpoint: None,
            last_error: None,
            tool_ids: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Everything that changes an instance goes through one of these, consumed
/// in order by the manager's control loop.
#[derive(Debug)]
pub enum LifecycleEvent {
    Registered {
        server_id: String,
        server_name: String,
    },
    Transition {
        server_id: String,
        state: SandboxState,
    },
    ContainerCreated {
        server_id: String,
        container_id: String,
    },
    ContainerRemoved {
        server_id: String,
    },
    Ready {
        server_id: String,
        endpoint: String,
        tools: Vec<ToolDescriptor>,
    },
    Failed {
        server_id: String,
        failure: SandboxFailure,
    },
    Stopped {
        server_id: String,
    },
    Removed {
        server_id: String,
    },
    /// Acknowledged once every earlier event has been applied
    Barrier(oneshot::Sender<()>),
}

impl LifecycleEvent {
    pub fn server_id(&self) -> Option<&str> {
        match self {
            LifecycleEvent::Registered { server_id, .. }
            | LifecycleEvent::Transition { server_id, .. }
            | LifecycleEvent::ContainerCreated { server_id, .. }
            | LifecycleEvent::ContainerRemoved { server_id }
            | LifecycleEvent::Ready { server_id, .. }
            | LifecycleEvent::Failed { server_id, .. }
            | LifecycleEvent::Stopped { server_id }
            | LifecycleEvent::Removed { server_id } => Some(server_id),
            LifecycleEvent::Barrier(_) => None,
        }
    }
}
