use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::config::SandboxSettings;
use crate::sandbox::error::{Result, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuntimeState {
    NotInstalled,
    Initializing,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RuntimeProgress {
    pub percentage: u8,
    pub message: String,
}

impl RuntimeProgress {
    fn new(percentage: u8, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
        }
    }
}

/// What the machine driver reports about the container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    NotInstalled,
    Stopped,
    Running,
}

/// Installs, starts and locates the container runtime
#[async_trait]
pub trait MachineDriver: Send + Sync {
    async fn status(&self) -> Result<MachineStatus>;
    async fn install(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn socket_path(&self) -> Result<PathBuf>;
}

/// Drives the `podman` binary. On macOS/Windows a podman machine VM hosts the
/// runtime, on Linux podman runs natively and only needs its API socket.
pub struct PodmanMachine {
    binary: PathBuf,
    machine_name: String,
    use_machine: bool,
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl PodmanMachine {
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            binary: settings.podman_binary.clone(),
            machine_name: settings.machine_name.clone(),
            use_machine: settings.use_podman_machine,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                SandboxError::RuntimeUnavailable(format!(
                    "Failed to run {}: {e}",
                    self.binary.display()
                ))
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn inspect_machine(&self) -> Result<Option<serde_json::Value>> {
        let output = self
            .run(&["machine", "inspect", &self.machine_name])
            .await?;

        if !output.success {
            let stderr = output.stderr.to_lowercase();
            if stderr.contains("does not exist") || stderr.contains("no such") {
                return Ok(None);
            }
            return Err(SandboxError::RuntimeUnavailable(format!(
                "podman machine inspect failed: {}",
                output.stderr.trim()
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(&output.stdout).map_err(|e| {
            SandboxError::RuntimeUnavailable(format!("Unreadable podman machine inspect output: {e}"))
        })?;

        // `podman machine inspect` prints an array with one entry per machine
        Ok(match parsed {
            serde_json::Value::Array(mut machines) if !machines.is_empty() => {
                Some(machines.swap_remove(0))
            }
            serde_json::Value::Array(_) => None,
            other => Some(other),
        })
    }
}

fn machine_state(machine: &serde_json::Value) -> MachineStatus {
    match machine.get("State").and_then(|s| s.as_str()) {
        Some(state) if state.eq_ignore_ascii_case("running") => MachineStatus::Running,
        _ => MachineStatus::Stopped,
    }
}

fn machine_socket_path(machine: &serde_json::Value) -> Option<PathBuf> {
    machine
        .pointer("/ConnectionInfo/PodmanSocket/Path")
        .and_then(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

#[async_trait]
impl MachineDriver for PodmanMachine {
    async fn status(&self) -> Result<MachineStatus> {
        if self.use_machine {
            return Ok(match self.inspect_machine().await? {
                Some(machine) => machine_state(&machine),
                None => MachineStatus::NotInstalled,
            });
        }

        match self.run(&["info", "--format", "json"]).await {
            Ok(output) if output.success => Ok(MachineStatus::Running),
            Ok(output) => {
                warn!("podman info failed: {}", output.stderr.trim());
                Ok(MachineStatus::Stopped)
            }
            Err(_) => Ok(MachineStatus::NotInstalled),
        }
    }

    async fn install(&self) -> Result<()> {
        if !self.use_machine {
            return Err(SandboxError::RuntimeUnavailable(format!(
                "{} is not installed",
                self.binary.display()
            )));
        }

        info!("Initializing podman machine {}", self.machine_name);
        let output = self.run(&["machine", "init", &self.machine_name]).await?;
        if !output.success && !output.stderr.contains("already exists") {
            return Err(SandboxError::RuntimeUnavailable(format!(
                "podman machine init failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.use_machine {
            // The native API socket is socket-activated, there is no VM to boot
            return Ok(());
        }

        info!("Starting podman machine {}", self.machine_name);
        let output = self.run(&["machine", "start", &self.machine_name]).await?;
        if !output.success && !output.stderr.contains("already running") {
            return Err(SandboxError::RuntimeUnavailable(format!(
                "podman machine start failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn socket_path(&self) -> Result<PathBuf> {
        if self.use_machine {
            return self
                .inspect_machine()
                .await?
                .as_ref()
                .and_then(machine_socket_path)
                .ok_or_else(|| {
                    SandboxError::RuntimeUnavailable(
                        "podman machine does not expose an API socket".to_string(),
                    )
                });
        }

        let output = self
            .run(&["info", "--format", "{{.Host.RemoteSocket.Path}}"])
            .await?;
        let reported = output.stdout.trim().trim_start_matches("unix://");
        if output.success && !reported.is_empty() {
            return Ok(PathBuf::from(reported));
        }

        std::env::var_os("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("podman").join("podman.sock"))
            .ok_or_else(|| {
                SandboxError::RuntimeUnavailable("Unable to locate the podman socket".to_string())
            })
    }
}

/// Brings the container runtime up and keeps track of where it is
pub struct RuntimeBootstrapper {
    driver: Arc<dyn MachineDriver>,
    state: RwLock<(RuntimeState, Option<String>)>,
    progress: watch::Sender<RuntimeProgress>,
    bootstrap_lock: Mutex<()>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl RuntimeBootstrapper {
    pub fn new(driver: Arc<dyn MachineDriver>, settings: &SandboxSettings) -> Self {
        let (progress, _) = watch::channel(RuntimeProgress::new(0, "Not started"));
        Self {
            driver,
            state: RwLock::new((RuntimeState::Stopped, None)),
            progress,
            bootstrap_lock: Mutex::new(()),
            max_attempts: settings.runtime_bootstrap_attempts.max(1),
            retry_delay: settings.runtime_retry_delay,
        }
    }

    pub async fn state(&self) -> RuntimeState {
        self.state.read().await.0
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.1.clone()
    }

    pub fn progress(&self) -> RuntimeProgress {
        self.progress.borrow().clone()
    }

    async fn set_state(&self, state: RuntimeState, error: Option<String>) {
        *self.state.write().await = (state, error);
    }

    fn report(&self, percentage: u8, message: &str) {
        debug!("🐳 Runtime {percentage}%: {message}");
        self.progress.send_replace(RuntimeProgress::new(percentage, message));
    }

    /// Make sure the runtime is up and return its API socket.
    ///
    /// Safe to call repeatedly, concurrent callers wait for the first one.
    pub async fn ensure_runtime_ready(&self) -> Result<PathBuf> {
        let _guard = self.bootstrap_lock.lock().await;

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.bring_up().await {
                Ok(socket) => {
                    self.set_state(RuntimeState::Running, None).await;
                    self.report(100, "Container runtime is running");
                    return Ok(socket);
                }
                Err(e) => {
                    warn!(
                        "🐳 Runtime bootstrap attempt {attempt}/{} failed: {e}",
                        self.max_attempts
                    );
                    last_error = e.to_string();
                    self.set_state(RuntimeState::Failed, Some(last_error.clone()))
                        .await;
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        error!("🐳 Container runtime unavailable: {last_error}");
        Err(SandboxError::RuntimeUnavailable(last_error))
    }

    async fn bring_up(&self) -> Result<PathBuf> {
        match self.driver.status().await? {
            MachineStatus::NotInstalled => {
                self.set_state(RuntimeState::NotInstalled, None).await;
                self.set_state(RuntimeState::Initializing, None).await;
                self.report(10, "Installing container runtime");
                self.driver.install().await?;
                self.report(60, "Starting container runtime");
                self.driver.start().await?;
            }
            MachineStatus::Stopped => {
                self.set_state(RuntimeState::Initializing, None).await;
                self.report(50, "Starting container runtime");
                self.driver.start().await?;
            }
            MachineStatus::Running => {}
        }

        self.report(90, "Connecting to container runtime");
        self.driver.socket_path().await
    }
}
