use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use rmcp::model::JsonObject;
use rstest::*;
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use serde_json::{json, Value};
use url::Url;

use crate::config::SandboxSettings;
use crate::consts::SERVER_ID_LABEL;
use crate::database::migration::Migrator;
use crate::oauth::browser::BrowsingContext;
use crate::oauth::{providers, OAuthCredentialProvider, OAuthProviderDefinition};
use crate::sandbox::backend::{ContainerBackend, ContainerDetails, ContainerSpec, ManagedContainer};
use crate::sandbox::container::endpoint_for_port;
use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::protocol::{DiscoveredTool, ToolProtocolClient};
use crate::sandbox::runtime::{MachineDriver, MachineStatus};
use crate::sandbox::{SandboxBackends, SandboxManager};

/// Creates an in-memory SQLite database with migrations applied
#[fixture]
pub async fn database() -> Arc<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    Arc::new(db)
}

/// Settings with every delay shrunk to milliseconds
pub fn fast_settings() -> SandboxSettings {
    SandboxSettings {
        data_dir: std::env::temp_dir().join("archestra-test"),
        max_concurrent_starts: 4,
        readiness_attempts: 5,
        readiness_backoff: Duration::from_millis(10),
        readiness_probe_timeout: Duration::from_millis(200),
        health_check_interval: Duration::from_millis(10),
        health_failure_threshold: 2,
        stop_grace_period: Duration::from_millis(10),
        status_broadcast_interval: Duration::from_millis(20),
        runtime_bootstrap_attempts: 2,
        runtime_retry_delay: Duration::from_millis(1),
        ..SandboxSettings::default()
    }
}

pub struct SandboxHarness {
    pub manager: SandboxManager,
    pub runtime: Arc<FakeSandboxRuntime>,
    pub machine: Arc<FakeMachine>,
    pub db: Arc<DatabaseConnection>,
}

/// A manager wired to fakes, with the base image already present
#[fixture]
pub async fn sandbox_harness(#[future] database: Arc<DatabaseConnection>) -> SandboxHarness {
    let db = database.await;
    let settings = fast_settings();
    let runtime = FakeSandboxRuntime::new();
    runtime.add_image(&settings.base_image);
    let machine = Arc::new(FakeMachine::new(MachineStatus::Running));

    let manager = SandboxManager::new(
        db.clone(),
        settings,
        SandboxBackends {
            machine: machine.clone(),
            containers: runtime.clone(),
            protocol: runtime.clone(),
            credentials: OAuthCredentialProvider::with_default_providers(db.clone()),
        },
    );

    SandboxHarness {
        manager,
        runtime,
        machine,
        db,
    }
}

pub struct FakeMachine {
    status: Mutex<MachineStatus>,
    install_calls: AtomicU32,
    start_calls: AtomicU32,
    fail_starts: AtomicBool,
}

impl FakeMachine {
    pub fn new(status: MachineStatus) -> Self {
        Self {
            status: Mutex::new(status),
            install_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            fail_starts: AtomicBool::new(false),
        }
    }

    pub fn install_calls(&self) -> u32 {
        self.install_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: MachineStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn current(&self) -> MachineStatus {
        *self.status.lock().unwrap()
    }
}

#[async_trait]
impl MachineDriver for FakeMachine {
    async fn status(&self) -> Result<MachineStatus> {
        Ok(self.current())
    }

    async fn install(&self) -> Result<()> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        *self.status.lock().unwrap() = MachineStatus::Stopped;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(SandboxError::RuntimeUnavailable(
                "machine refused to start".to_string(),
            ));
        }
        *self.status.lock().unwrap() = MachineStatus::Running;
        Ok(())
    }

    async fn socket_path(&self) -> Result<PathBuf> {
        match self.current() {
            MachineStatus::Running => Ok(PathBuf::from("/tmp/fake-podman.sock")),
            _ => Err(SandboxError::RuntimeUnavailable("machine not running".to_string())),
        }
    }
}

struct FakeContainer {
    id: String,
    name: String,
    server_id: Option<String>,
    port: u16,
    running: bool,
    healthy: bool,
}

#[derive(Default)]
struct FakeRuntimeState {
    images: HashSet<String>,
    pulls: HashMap<String, usize>,
    failing_pulls: HashSet<String>,
    failing_inspections: HashSet<String>,
    failing_creates: HashSet<String>,
    fail_stop: bool,
    containers: Vec<FakeContainer>,
    next_container: u16,
    specs: HashMap<String, ContainerSpec>,
    tools: HashMap<String, Vec<String>>,
    never_ready: HashSet<String>,
    readiness_delays: HashMap<String, u32>,
}

impl FakeRuntimeState {
    fn container_at(&self, endpoint: &str) -> Option<&FakeContainer> {
        self.containers
            .iter()
            .find(|c| endpoint_for_port(c.port) == endpoint)
    }
}

/// In-memory container engine whose containers answer the tool protocol
#[derive(Default)]
pub struct FakeSandboxRuntime {
    state: Mutex<FakeRuntimeState>,
}

impl FakeSandboxRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeRuntimeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_image(&self, reference: &str) {
        self.with_state(|s| s.images.insert(reference.to_string()));
    }

    pub fn pull_count(&self, reference: &str) -> usize {
        self.with_state(|s| s.pulls.get(reference).copied().unwrap_or(0))
    }

    pub fn fail_image_pull(&self, reference: &str) {
        self.with_state(|s| {
            s.images.remove(reference);
            s.failing_pulls.insert(reference.to_string())
        });
    }

    pub fn fail_image_inspection(&self, reference: &str) {
        self.with_state(|s| s.failing_inspections.insert(reference.to_string()));
    }

    pub fn fail_create(&self, server_id: &str) {
        self.with_state(|s| s.failing_creates.insert(server_id.to_string()));
    }

    pub fn fail_stop(&self, fail: bool) {
        self.with_state(|s| s.fail_stop = fail);
    }

    pub fn set_tools(&self, server_id: &str, names: &[&str]) {
        self.with_state(|s| {
            s.tools.insert(
                server_id.to_string(),
                names.iter().map(|n| n.to_string()).collect(),
            )
        });
    }

    /// Handshakes with this server's containers always fail
    pub fn never_ready(&self, server_id: &str) {
        self.with_state(|s| s.never_ready.insert(server_id.to_string()));
    }

    /// The first `failures` handshakes fail
    pub fn delay_readiness(&self, server_id: &str, failures: u32) {
        self.with_state(|s| s.readiness_delays.insert(server_id.to_string(), failures));
    }

    /// Applies to the server's current containers only, new ones start healthy
    pub fn set_unhealthy(&self, server_id: &str, unhealthy: bool) {
        self.with_state(|s| {
            for container in s
                .containers
                .iter_mut()
                .filter(|c| c.server_id.as_deref() == Some(server_id))
            {
                container.healthy = !unhealthy;
            }
        });
    }

    /// A managed container nothing tracks
    pub fn add_orphan(&self, name: &str) {
        self.with_state(|s| {
            s.next_container += 1;
            let id = format!("orphan-{}", s.next_container);
            s.containers.push(FakeContainer {
                id,
                name: name.to_string(),
                server_id: None,
                port: 30000 + s.next_container,
                running: true,
                healthy: true,
            });
        });
    }

    pub fn container_count(&self) -> usize {
        self.with_state(|s| s.containers.len())
    }

    pub fn last_spec(&self, server_id: &str) -> Option<ContainerSpec> {
        self.with_state(|s| s.specs.get(server_id).cloned())
    }
}

#[async_trait]
impl ContainerBackend for FakeSandboxRuntime {
    async fn connect(&self, _socket_path: &Path) -> Result<()> {
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        self.with_state(|s| {
            if s.failing_inspections.contains(reference) {
                return Err(SandboxError::ImageInspectionFailed {
                    image: reference.to_string(),
                    reason: "permission denied".to_string(),
                });
            }
            Ok(s.images.contains(reference))
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.with_state(|s| {
            *s.pulls.entry(reference.to_string()).or_default() += 1;
            if s.failing_pulls.contains(reference) {
                return Err(SandboxError::ImagePullFailed {
                    image: reference.to_string(),
                    reason: "manifest unknown".to_string(),
                });
            }
            s.images.insert(reference.to_string());
            Ok(())
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.with_state(|s| {
            let server_id = spec.labels.get(SERVER_ID_LABEL).cloned();
            if let Some(server_id) = &server_id {
                if s.failing_creates.contains(server_id) {
                    return Err(SandboxError::Backend("no space left on device".to_string()));
                }
                s.specs.insert(server_id.clone(), spec.clone());
            }
            if s.containers.iter().any(|c| c.name == spec.name) {
                return Err(SandboxError::Backend(format!("name {} in use", spec.name)));
            }

            s.next_container += 1;
            let id = format!("container-{}", s.next_container);
            s.containers.push(FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                server_id,
                port: 40000 + s.next_container,
                running: false,
                healthy: true,
            });
            Ok(id)
        })
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.with_state(|s| {
            match s.containers.iter_mut().find(|c| c.id == container_id) {
                Some(container) => {
                    container.running = true;
                    Ok(())
                }
                None => Err(SandboxError::NotFound(container_id.to_string())),
            }
        })
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails> {
        self.with_state(|s| {
            s.containers
                .iter()
                .find(|c| c.id == container_id)
                .map(|c| ContainerDetails {
                    id: c.id.clone(),
                    running: c.running,
                    host_port: Some(c.port),
                })
                .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))
        })
    }

    async fn stop_container(&self, container_id: &str, _grace: Duration) -> Result<()> {
        self.with_state(|s| {
            if s.fail_stop {
                return Err(SandboxError::Backend("stop timed out".to_string()));
            }
            if let Some(container) = s.containers.iter_mut().find(|c| c.id == container_id) {
                container.running = false;
            }
            Ok(())
        })
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.with_state(|s| {
            s.containers
                .retain(|c| c.id != container_id && c.name != container_id)
        });
        Ok(())
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>> {
        Ok(self.with_state(|s| {
            s.containers
                .iter()
                .map(|c| ManagedContainer {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    server_id: c.server_id.clone(),
                })
                .collect()
        }))
    }
}

#[async_trait]
impl ToolProtocolClient for FakeSandboxRuntime {
    async fn list_tools(&self, endpoint: &str) -> Result<Vec<DiscoveredTool>> {
        self.with_state(|s| {
            let refused = || SandboxError::Protocol(format!("connection refused: {endpoint}"));
            let container = s.container_at(endpoint).ok_or_else(refused)?;
            if !container.running || !container.healthy {
                return Err(refused());
            }
            let server_id = container.server_id.clone().unwrap_or_default();

            if s.never_ready.contains(&server_id) {
                return Err(refused());
            }
            if let Some(remaining) = s.readiness_delays.get_mut(&server_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(refused());
                }
            }

            Ok(s.tools
                .get(&server_id)
                .map(|names| {
                    names
                        .iter()
                        .map(|name| DiscoveredTool {
                            name: name.clone(),
                            description: Some(format!("{name} from {server_id}")),
                            input_schema: json!({"type": "object"}),
                            annotations: Default::default(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn call_tool(
        &self,
        endpoint: &str,
        tool_name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<Value> {
        self.with_state(|s| {
            let container = s
                .container_at(endpoint)
                .ok_or_else(|| SandboxError::Protocol(format!("connection refused: {endpoint}")))?;
            Ok(json!({
                "tool": tool_name,
                "server_id": container.server_id,
                "arguments": arguments,
            }))
        })
    }
}

/// Walks through `urls` one poll at a time and stays on the last one
pub struct FakeBrowsingContext {
    urls: Vec<Url>,
    position: AtomicUsize,
    extracted: Option<Value>,
    evaluations: AtomicUsize,
}

impl FakeBrowsingContext {
    pub fn new(urls: Vec<&str>, extracted: Option<Value>) -> Self {
        Self {
            urls: urls.into_iter().map(|u| Url::parse(u).unwrap()).collect(),
            position: AtomicUsize::new(0),
            extracted,
            evaluations: AtomicUsize::new(0),
        }
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowsingContext for FakeBrowsingContext {
    async fn navigate(&self, _url: &Url) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn current_url(&self) -> Option<Url> {
        let position = self.position.fetch_add(1, Ordering::SeqCst);
        self.urls
            .get(position.min(self.urls.len().saturating_sub(1)))
            .cloned()
    }

    async fn evaluate(&self, _script: &str) -> Option<Value> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        self.extracted.clone()
    }
}

/// Local OAuth token endpoint. Returns its URL and a hit counter.
pub async fn spawn_token_endpoint(success: bool) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let app = Router::new().route(
        "/token",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if success {
                    (
                        StatusCode::OK,
                        Json(json!({
                            "access_token": "refreshed-access-token",
                            "expires_in": 3600,
                            "token_type": "Bearer"
                        })),
                    )
                        .into_response()
                } else {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": "invalid_grant"})),
                    )
                        .into_response()
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind token endpoint");
    let addr = listener.local_addr().expect("Token endpoint has no address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{addr}/token"), hits)
}

pub fn standard_provider(token_url: &str) -> OAuthProviderDefinition {
    providers::google("test-client".to_string(), token_url.to_string())
}
