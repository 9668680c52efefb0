use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SandboxSettings;
use crate::consts::{
    CONTAINER_NAME_PREFIX, MANAGED_LABEL, SANDBOX_CONTAINER_PORT, SANDBOX_MCP_PATH,
    SERVER_ID_LABEL,
};
use crate::models::mcp_server::SandboxedServerConfig;
use crate::oauth::OAuthCredentialProvider;
use crate::sandbox::backend::{ContainerBackend, ContainerSpec};
use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::protocol::{DiscoveredTool, ToolProtocolClient};
use crate::sandbox::state::{LifecycleEvent, SandboxState};

/// Extra time on top of the grace period before a stop is considered hung
const STOP_TIMEOUT_SLACK: Duration = Duration::from_secs(5);
const MAX_BACKOFF_EXPONENT: u32 = 4;

/// A sandbox that passed its readiness handshake
#[derive(Debug, Clone)]
pub struct StartedSandbox {
    pub container_id: String,
    pub endpoint: String,
    pub tools: Vec<DiscoveredTool>,
}

pub fn container_name(server_id: &str) -> String {
    let sanitized: String = server_id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{CONTAINER_NAME_PREFIX}{sanitized}")
}

pub fn endpoint_for_port(host_port: u16) -> String {
    format!("http://127.0.0.1:{host_port}{SANDBOX_MCP_PATH}")
}

/// Starts, probes and stops the container of one server at a time.
/// Every observable change is reported as a lifecycle event.
pub struct ContainerController {
    backend: Arc<dyn ContainerBackend>,
    protocol: Arc<dyn ToolProtocolClient>,
    credentials: OAuthCredentialProvider,
    settings: Arc<SandboxSettings>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ContainerController {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        protocol: Arc<dyn ToolProtocolClient>,
        credentials: OAuthCredentialProvider,
        settings: Arc<SandboxSettings>,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Self {
        Self {
            backend,
            protocol,
            credentials,
            settings,
            events,
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.events.send(event).is_err() {
            debug!("Lifecycle event dropped, control loop is gone");
        }
    }

    fn transition(&self, server_id: &str, state: SandboxState) {
        self.emit(LifecycleEvent::Transition {
            server_id: server_id.to_string(),
            state,
        });
    }

    fn fail(&self, server_id: &str, error: SandboxError) -> SandboxError {
        error!("❌ Sandbox [{server_id}] failed: {error}");
        self.emit(LifecycleEvent::Failed {
            server_id: server_id.to_string(),
            failure: error.to_failure(),
        });
        error
    }

    /// Environment for the container: launch spec env plus injected tokens
    async fn resolve_env(&self, config: &SandboxedServerConfig) -> Result<HashMap<String, String>> {
        let mut env = config.rendered_server_config().env;

        let tokens = match self.credentials.resolve_tokens(config).await {
            Ok(tokens) => tokens,
            Err(e) if config.oauth_required() => {
                return Err(SandboxError::NeedsAuthentication(format!("{}: {e}", config.id)));
            }
            Err(e) => {
                warn!("🔑 [{}] Starting without OAuth tokens: {e}", config.id);
                None
            }
        };

        match tokens {
            Some(tokens) => env.extend(self.credentials.token_env(config, &tokens)),
            None if config.oauth_required() => {
                return Err(SandboxError::NeedsAuthentication(config.id.clone()));
            }
            None => {}
        }

        Ok(env)
    }

    fn container_spec(
        &self,
        config: &SandboxedServerConfig,
        env: HashMap<String, String>,
    ) -> ContainerSpec {
        let rendered = config.rendered_server_config();
        let mut command = vec![rendered.command];
        command.extend(rendered.args);

        ContainerSpec {
            name: container_name(&config.id),
            image: config.image_or(&self.settings.base_image).to_string(),
            command,
            env,
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (SERVER_ID_LABEL.to_string(), config.id.clone()),
            ]),
            container_port: SANDBOX_CONTAINER_PORT,
        }
    }

    /// Bring up the sandbox of `config` and wait for its tool endpoint.
    ///
    /// Emits `Starting`, then `Failed` on any error. Cancellation tears down
    /// whatever was created and ends in `Stopped`. The caller emits `Ready`.
    pub async fn start(
        &self,
        config: &SandboxedServerConfig,
        cancel: &CancellationToken,
    ) -> Result<StartedSandbox> {
        let server_id = config.id.as_str();
        info!("🚀 Sandbox [{server_id}] Starting");
        self.transition(server_id, SandboxState::Starting);

        let env = match self.resolve_env(config).await {
            Ok(env) => env,
            Err(e) => return Err(self.fail(server_id, e)),
        };
        let spec = self.container_spec(config, env);

        // A container left over under the same name would make create fail
        if let Err(e) = self.backend.remove_container(&spec.name).await {
            debug!("Sandbox [{server_id}] no stale container removed: {e}");
        }

        if cancel.is_cancelled() {
            return Err(self.cancelled(server_id, None).await);
        }

        let container_id = match self.backend.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                return Err(self.fail(
                    server_id,
                    SandboxError::ContainerStartFailed(e.to_string()),
                ))
            }
        };
        self.emit(LifecycleEvent::ContainerCreated {
            server_id: server_id.to_string(),
            container_id: container_id.clone(),
        });
        debug!("Sandbox [{server_id}] created container {container_id}");

        if let Err(e) = self.backend.start_container(&container_id).await {
            self.teardown(server_id, &container_id).await;
            return Err(self.fail(
                server_id,
                SandboxError::ContainerStartFailed(e.to_string()),
            ));
        }

        match self.wait_until_ready(server_id, &container_id, cancel).await {
            Ok(started) => {
                info!(
                    "✅ Sandbox [{server_id}] ready at {} with {} tools",
                    started.endpoint,
                    started.tools.len()
                );
                Ok(started)
            }
            Err(SandboxError::Cancelled(_)) => Err(self.cancelled(server_id, Some(&container_id)).await),
            Err(e) => {
                self.teardown(server_id, &container_id).await;
                Err(self.fail(server_id, e))
            }
        }
    }

    async fn wait_until_ready(
        &self,
        server_id: &str,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StartedSandbox> {
        let attempts = self.settings.readiness_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SandboxError::Cancelled(server_id.to_string()));
            }

            let details = self.backend.inspect_container(container_id).await?;
            if !details.running {
                return Err(SandboxError::ContainerStartFailed(
                    "container exited before becoming ready".to_string(),
                ));
            }

            match details.host_port {
                Some(port) => {
                    let endpoint = endpoint_for_port(port);
                    match self.probe(&endpoint).await {
                        Ok(tools) => {
                            return Ok(StartedSandbox {
                                container_id: container_id.to_string(),
                                endpoint,
                                tools,
                            })
                        }
                        Err(e) => last_error = e.to_string(),
                    }
                }
                None => last_error = "no host port published yet".to_string(),
            }

            debug!("Sandbox [{server_id}] not ready (attempt {attempt}/{attempts}): {last_error}");

            if attempt < attempts {
                let backoff =
                    self.settings.readiness_backoff * 2u32.pow((attempt - 1).min(MAX_BACKOFF_EXPONENT));
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SandboxError::Cancelled(server_id.to_string()));
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        Err(SandboxError::ReadinessTimeout {
            attempts,
            last_error,
        })
    }

    /// One tool-protocol handshake bounded by the probe timeout
    pub async fn probe(&self, endpoint: &str) -> Result<Vec<DiscoveredTool>> {
        match tokio::time::timeout(
            self.settings.readiness_probe_timeout,
            self.protocol.list_tools(endpoint),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Protocol(format!(
                "Handshake with {endpoint} timed out"
            ))),
        }
    }

    async fn cancelled(&self, server_id: &str, container_id: Option<&str>) -> SandboxError {
        info!("🛑 Sandbox [{server_id}] start cancelled");
        if let Some(container_id) = container_id {
            self.teardown(server_id, container_id).await;
        }
        self.emit(LifecycleEvent::Stopped {
            server_id: server_id.to_string(),
        });
        SandboxError::Cancelled(server_id.to_string())
    }

    async fn teardown(&self, server_id: &str, container_id: &str) {
        if let Err(e) = self.backend.remove_container(container_id).await {
            warn!("Sandbox [{server_id}] failed to remove container {container_id}: {e}");
        }
        self.emit(LifecycleEvent::ContainerRemoved {
            server_id: server_id.to_string(),
        });
    }

    /// Stop gracefully, force-remove after the grace period. Always ends in
    /// `Stopped`, errors are only logged.
    pub async fn stop(&self, server_id: &str, container_id: Option<&str>) {
        let Some(container_id) = container_id else {
            self.emit(LifecycleEvent::Stopped {
                server_id: server_id.to_string(),
            });
            return;
        };

        info!("🛑 Sandbox [{server_id}] Stopping container {container_id}");
        self.transition(server_id, SandboxState::Stopping);

        let grace = self.settings.stop_grace_period;
        match tokio::time::timeout(
            grace + STOP_TIMEOUT_SLACK,
            self.backend.stop_container(container_id, grace),
        )
        .await
        {
            Ok(Ok(())) => debug!("Sandbox [{server_id}] stopped gracefully"),
            Ok(Err(e)) => warn!("Sandbox [{server_id}] graceful stop failed: {e}"),
            Err(_) => warn!("Sandbox [{server_id}] graceful stop timed out, forcing removal"),
        }

        self.teardown(server_id, container_id).await;
        self.emit(LifecycleEvent::Stopped {
            server_id: server_id.to_string(),
        });
    }
}
