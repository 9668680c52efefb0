use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    models::{HostConfig, PortBinding},
    Docker, API_DEFAULT_VERSION,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::consts::{MANAGED_LABEL, SERVER_ID_LABEL};
use crate::sandbox::error::{Result, SandboxError};

const SOCKET_TIMEOUT_SECS: u64 = 120;

/// What to create for one sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Port inside the container published on a random loopback host port
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub running: bool,
    pub host_port: Option<u16>,
}

/// A container carrying the manager's label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub server_id: Option<String>,
}

/// Operations the sandbox manager needs from a container engine
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn connect(&self, socket_path: &Path) -> Result<()>;

    /// `Ok(false)` only for a definite "no such image"
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    async fn pull_image(&self, reference: &str) -> Result<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails>;

    /// Already stopped or missing containers are not an error
    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// Force removal. Missing containers are not an error
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>>;
}

/// Talks to podman through its Docker-compatible API socket
#[derive(Default)]
pub struct PodmanBackend {
    docker: RwLock<Option<Docker>>,
}

impl PodmanBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> Result<Docker> {
        self.docker
            .read()
            .await
            .clone()
            .ok_or_else(|| SandboxError::Backend("Not connected to the podman socket".to_string()))
    }

    fn status_code(error: &BollardError) -> Option<u16> {
        match error {
            BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

#[async_trait]
impl ContainerBackend for PodmanBackend {
    async fn connect(&self, socket_path: &Path) -> Result<()> {
        let path = socket_path.to_string_lossy();
        debug!("Connecting to podman socket at {path}");

        let docker = Docker::connect_with_socket(&path, SOCKET_TIMEOUT_SECS, API_DEFAULT_VERSION)?;
        docker.ping().await.map_err(|e| {
            error!("Failed to ping podman socket {path}: {e}");
            SandboxError::RuntimeUnavailable(format!("podman socket not responding: {e}"))
        })?;

        info!("Connected to podman socket at {path}");
        *self.docker.write().await = Some(docker);
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let docker = self.client().await?;
        match docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(e) if Self::status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(SandboxError::ImageInspectionFailed {
                image: reference.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let docker = self.client().await?;
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        let mut progress = docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            match update {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pulling {reference}: {status}");
                    }
                }
                Err(e) => {
                    return Err(SandboxError::ImagePullFailed {
                        image: reference.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let docker = self.client().await?;
        let port_key = format!("{}/tcp", spec.container_port);

        let host_config = HostConfig {
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: None,
                }]),
            )])),
            cap_drop: Some(vec!["ALL".to_string()]),
            privileged: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::ContainerStartFailed(e.to_string()))?;

        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.client()
            .await?
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::ContainerStartFailed(e.to_string()))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails> {
        let response = self
            .client()
            .await?
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;

        let running = response
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);

        let host_port = response
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| {
                ports
                    .into_values()
                    .flatten()
                    .flatten()
                    .find_map(|binding| binding.host_port?.parse::<u16>().ok())
            });

        Ok(ContainerDetails {
            id: response.id.unwrap_or_else(|| container_id.to_string()),
            running,
            host_port,
        })
    }

    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self
            .client()
            .await?
            .stop_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if matches!(Self::status_code(&e), Some(304) | Some(404)) => {
                debug!("Container {container_id} already stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .client()
            .await?
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::status_code(&e) == Some(404) => {
                debug!("Container {container_id} already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.client().await?.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ManagedContainer {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                server_id: c
                    .labels
                    .and_then(|mut labels| labels.remove(SERVER_ID_LABEL)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_fail_before_connect() {
        let backend = PodmanBackend::new();

        let err = backend.image_exists("busybox").await.unwrap_err();
        assert!(matches!(err, SandboxError::Backend(_)));

        let err = backend.list_managed_containers().await.unwrap_err();
        assert!(matches!(err, SandboxError::Backend(_)));
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let backend = PodmanBackend::new();

        let result = backend.connect(&temp_dir.path().join("podman.sock")).await;
        assert!(result.is_err());
    }
}
