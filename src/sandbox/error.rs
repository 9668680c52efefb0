use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use utoipa::ToSchema;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Error type for everything the sandbox subsystem does
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    /// Container runtime could not be brought up, fatal for the current cycle
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Failed to pull image {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },

    /// Inspecting an image failed for a reason other than "not found"
    #[error("Failed to inspect image {image}: {reason}")]
    ImageInspectionFailed { image: String, reason: String },

    #[error("Container failed to start: {0}")]
    ContainerStartFailed(String),

    #[error("Sandbox did not become ready after {attempts} attempts: {last_error}")]
    ReadinessTimeout { attempts: u32, last_error: String },

    #[error("Failed to resolve OAuth credentials: {0}")]
    OAuthResolutionFailed(String),

    /// OAuth is required and no usable token set exists
    #[error("Server {0} needs authentication")]
    NeedsAuthentication(String),

    #[error("Tool discovery failed: {0}")]
    ToolDiscoveryError(String),

    #[error("Container backend error: {0}")]
    Backend(String),

    #[error("Tool protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl From<sea_orm::DbErr> for SandboxError {
    fn from(err: sea_orm::DbErr) -> Self {
        SandboxError::Database(err.to_string())
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        SandboxError::Backend(err.to_string())
    }
}

/// Why a sandbox ended up in the `Failed` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    RuntimeUnavailable,
    ImagePullFailed,
    ContainerStartFailed,
    ReadinessTimeout,
    NeedsAuthentication,
    HealthCheckFailed,
}

/// Last error recorded against a sandbox instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SandboxFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SandboxError {
    /// Classify an error for the instance that hit it.
    ///
    /// Tool discovery errors surface as readiness timeouts, OAuth resolution
    /// failures surface as "needs authentication".
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SandboxError::RuntimeUnavailable(_) => FailureKind::RuntimeUnavailable,
            SandboxError::ImagePullFailed { .. } | SandboxError::ImageInspectionFailed { .. } => {
                FailureKind::ImagePullFailed
            }
            SandboxError::ReadinessTimeout { .. } | SandboxError::ToolDiscoveryError(_) => {
                FailureKind::ReadinessTimeout
            }
            SandboxError::OAuthResolutionFailed(_) | SandboxError::NeedsAuthentication(_) => {
                FailureKind::NeedsAuthentication
            }
            _ => FailureKind::ContainerStartFailed,
        }
    }

    pub fn to_failure(&self) -> SandboxFailure {
        SandboxFailure {
            kind: self.failure_kind(),
            message: self.to_string(),
        }
    }
}
