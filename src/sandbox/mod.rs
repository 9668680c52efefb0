use futures_util::{stream, StreamExt};
use rmcp::model::JsonObject;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archestra_mcp_server::ArchestraMcpServer;
use crate::config::SandboxSettings;
use crate::consts::BUILTIN_SERVER_ID;
use crate::models::mcp_server::{Model as MCPServerModel, SandboxedServerConfig};
use crate::models::tool::{Model as ToolModel, ToolAnalysis, ToolDescriptor};
use crate::oauth::OAuthCredentialProvider;

pub mod backend;
pub mod container;
pub mod error;
pub mod image;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod status;
pub mod tools;

use backend::{ContainerBackend, PodmanBackend};
use container::ContainerController;
use error::{FailureKind, Result, SandboxError, SandboxFailure};
use image::ImageManager;
use protocol::{StreamableHttpToolClient, ToolProtocolClient};
use runtime::{MachineDriver, PodmanMachine, RuntimeBootstrapper};
use state::{LifecycleEvent, SandboxInstance, SandboxState};
use status::{RuntimeStatus, SandboxStatusSummary, StatusBroadcaster};
use tools::ToolAggregator;

const STATUS_CHANNEL_CAPACITY: usize = 16;

/// External systems the manager talks to
pub struct SandboxBackends {
    pub machine: Arc<dyn MachineDriver>,
    pub containers: Arc<dyn ContainerBackend>,
    pub protocol: Arc<dyn ToolProtocolClient>,
    pub credentials: OAuthCredentialProvider,
}

impl SandboxBackends {
    /// podman over its API socket, rmcp over streamable HTTP
    pub fn podman(db: Arc<DatabaseConnection>, settings: &SandboxSettings) -> Self {
        Self {
            machine: Arc::new(PodmanMachine::new(settings)),
            containers: Arc::new(PodmanBackend::new()),
            protocol: Arc::new(StreamableHttpToolClient),
            credentials: OAuthCredentialProvider::with_default_providers(db),
        }
    }
}

struct Inner {
    db: Arc<DatabaseConnection>,
    settings: Arc<SandboxSettings>,
    runtime: RuntimeBootstrapper,
    images: ImageManager,
    controller: ContainerController,
    backend: Arc<dyn ContainerBackend>,
    protocol: Arc<dyn ToolProtocolClient>,
    credentials: OAuthCredentialProvider,
    tools: ToolAggregator,
    instances: Arc<RwLock<HashMap<String, SandboxInstance>>>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    server_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// In-flight starts, tagged with a generation so a finished start never
    /// removes the token of a newer one
    starts: StdMutex<HashMap<String, (u64, CancellationToken)>>,
    next_generation: AtomicU64,
    health_checks: StdMutex<HashMap<String, CancellationToken>>,
    auto_restarted: Mutex<HashSet<String>>,
    broadcaster: Mutex<Option<StatusBroadcaster>>,
    status_tx: broadcast::Sender<SandboxStatusSummary>,
    shutdown: CancellationToken,
}

/// Owns every sandbox: their lifecycle, their tools and the status feed.
///
/// Cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<Inner>,
}

impl SandboxManager {
    pub fn new(
        db: Arc<DatabaseConnection>,
        settings: SandboxSettings,
        backends: SandboxBackends,
    ) -> Self {
        let settings = Arc::new(settings);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let instances = Arc::new(RwLock::new(HashMap::new()));
        let tools = ToolAggregator::new();
        let shutdown = CancellationToken::new();

        tokio::spawn(control_loop(
            events_rx,
            instances.clone(),
            tools.clone(),
            shutdown.clone(),
        ));

        let controller = ContainerController::new(
            backends.containers.clone(),
            backends.protocol.clone(),
            backends.credentials.clone(),
            settings.clone(),
            events_tx.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                db,
                runtime: RuntimeBootstrapper::new(backends.machine, &settings),
                images: ImageManager::new(backends.containers.clone(), settings.base_image.clone()),
                controller,
                backend: backends.containers,
                protocol: backends.protocol,
                credentials: backends.credentials,
                tools,
                instances,
                events: events_tx,
                server_locks: Mutex::new(HashMap::new()),
                starts: StdMutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                health_checks: StdMutex::new(HashMap::new()),
                auto_restarted: Mutex::new(HashSet::new()),
                broadcaster: Mutex::new(None),
                status_tx,
                shutdown,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.inner.settings
    }

    pub fn credentials(&self) -> &OAuthCredentialProvider {
        &self.inner.credentials
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Lifecycle event dropped, control loop is gone");
        }
    }

    fn fail(&self, server_id: &str, error: &SandboxError) {
        self.emit(LifecycleEvent::Failed {
            server_id: server_id.to_string(),
            failure: error.to_failure(),
        });
    }

    /// Wait until every event emitted so far has been applied
    async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        self.emit(LifecycleEvent::Barrier(ack));
        let _ = done.await;
    }

    async fn server_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .server_locks
            .lock()
            .await
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    /// Bring up the runtime, then every installed server.
    ///
    /// A runtime or image inspection failure is fatal for the whole cycle.
    /// Per-image pull failures and per-server start failures only mark the
    /// affected instances Failed.
    pub async fn initialize(&self) -> Result<()> {
        info!("🚀 Initializing sandboxes");

        let configs = MCPServerModel::load_installed_configs(&self.inner.db).await?;
        for config in &configs {
            self.emit(LifecycleEvent::Registered {
                server_id: config.id.clone(),
                server_name: config.name.clone(),
            });
        }
        self.register_builtin_tools().await;
        self.start_broadcaster().await;
        self.inner.auto_restarted.lock().await.clear();

        if let Err(e) = self.connect_runtime().await {
            for config in &configs {
                self.fail(&config.id, &e);
            }
            self.sync().await;
            return Err(e);
        }

        self.remove_orphaned_containers().await;

        let startable = match self.ensure_images(&configs).await {
            Ok(startable) => startable,
            Err(e) => {
                self.sync().await;
                return Err(e);
            }
        };

        // Tokens exist before any start waits on its lock, so a queued start
        // can be cancelled by uninstall
        self.sync().await;
        let pending: Vec<_> = startable
            .into_iter()
            .map(|config| {
                let (generation, cancel) = self.begin_start(&config.id);
                (config, generation, cancel)
            })
            .collect();

        let limit = self.inner.settings.max_concurrent_starts.max(1);
        stream::iter(pending)
            .for_each_concurrent(limit, |(config, generation, cancel)| async move {
                let id = config.id.clone();
                if let Err(e) = self.start_guarded(config, generation, cancel).await {
                    debug!("Sandbox [{id}] did not start: {e}");
                }
            })
            .await;

        self.sync().await;
        let summary = self.get_sandbox_status().await;
        info!(
            "✅ Sandboxes initialized: {} running, {} failed",
            summary.counts.running, summary.counts.failed
        );
        Ok(())
    }

    async fn connect_runtime(&self) -> Result<()> {
        let socket = self.inner.runtime.ensure_runtime_ready().await?;
        self.inner
            .backend
            .connect(&socket)
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))
    }

    /// Make sure every image is present, grouped by reference. Returns the
    /// configs whose image is ready.
    async fn ensure_images(
        &self,
        configs: &[SandboxedServerConfig],
    ) -> Result<Vec<SandboxedServerConfig>> {
        let base_image = self.inner.images.base_image().to_string();
        let mut by_image: BTreeMap<String, Vec<&SandboxedServerConfig>> = BTreeMap::new();
        by_image.entry(base_image.clone()).or_default();
        for config in configs {
            by_image
                .entry(config.image_or(&base_image).to_string())
                .or_default()
                .push(config);
        }

        let mut startable = Vec::new();
        for (image, dependents) in by_image {
            for config in &dependents {
                self.transition(&config.id, SandboxState::PullingImage);
            }

            match self.inner.images.ensure_image(&image).await {
                Ok(()) => startable.extend(dependents.into_iter().cloned()),
                Err(e @ SandboxError::ImageInspectionFailed { .. }) => {
                    error!("📦 Cannot inspect image {image}, aborting: {e}");
                    for config in configs {
                        self.fail(&config.id, &e);
                    }
                    return Err(e);
                }
                Err(e) => {
                    for config in &dependents {
                        self.fail(&config.id, &e);
                    }
                }
            }
        }

        Ok(startable)
    }

    async fn remove_orphaned_containers(&self) {
        let managed = match self.inner.backend.list_managed_containers().await {
            Ok(managed) => managed,
            Err(e) => {
                warn!("Could not list managed containers: {e}");
                return;
            }
        };

        let tracked: HashSet<String> = self
            .inner
            .instances
            .read()
            .await
            .values()
            .filter_map(|instance| instance.container_id.clone())
            .collect();

        for container in managed.into_iter().filter(|c| !tracked.contains(&c.id)) {
            info!(
                "🧹 Removing orphaned container {} ({})",
                container.name, container.id
            );
            if let Err(e) = self.inner.backend.remove_container(&container.id).await {
                warn!("Failed to remove orphaned container {}: {e}", container.id);
            }
        }
    }

    fn transition(&self, server_id: &str, state: SandboxState) {
        self.emit(LifecycleEvent::Transition {
            server_id: server_id.to_string(),
            state,
        });
    }

    async fn register_builtin_tools(&self) {
        self.inner
            .tools
            .register_server_tools(BUILTIN_SERVER_ID, ArchestraMcpServer::builtin_tools())
            .await;
    }

    /// Persist `config` and start it. Installing an existing id replaces
    /// the running sandbox.
    pub async fn install_server(&self, config: SandboxedServerConfig) -> Result<SandboxInstance> {
        let server_id = config.id.clone();
        info!("📦 Installing MCP server [{server_id}]");

        self.cancel_start(&server_id);
        self.stop_health_check(&server_id);
        let (generation, cancel) = self.begin_start(&server_id);
        let lock = self.server_lock(&server_id).await;
        let _guard = lock.lock().await;

        if cancel.is_cancelled() {
            self.end_start(&server_id, generation);
            return Err(SandboxError::Cancelled(format!(
                "Install of {server_id} was superseded"
            )));
        }
        if let Err(e) = self.prepare_install(&config).await {
            self.end_start(&server_id, generation);
            return Err(e);
        }

        self.start_locked(config, generation, cancel).await
    }

    /// Persist the config, clear the old container and pull the image.
    /// Caller holds the server's lock.
    async fn prepare_install(&self, config: &SandboxedServerConfig) -> Result<()> {
        let server_id = config.id.clone();
        MCPServerModel::save_config(&self.inner.db, config).await?;
        self.emit(LifecycleEvent::Registered {
            server_id: server_id.clone(),
            server_name: config.name.clone(),
        });
        self.sync().await;

        if let Some(container_id) = self.container_id(&server_id).await {
            self.inner
                .controller
                .stop(&server_id, Some(&container_id))
                .await;
        }
        self.inner.auto_restarted.lock().await.remove(&server_id);

        if let Err(e) = self.connect_runtime().await {
            self.fail(&server_id, &e);
            self.sync().await;
            return Err(e);
        }

        self.transition(&server_id, SandboxState::PullingImage);
        let image = config.image_or(self.inner.images.base_image()).to_string();
        if let Err(e) = self.inner.images.ensure_image(&image).await {
            self.fail(&server_id, &e);
            self.sync().await;
            return Err(e);
        }

        Ok(())
    }

    pub async fn install_from_catalog(&self, catalog_id: &str) -> Result<SandboxInstance> {
        let entry = MCPServerModel::find_catalog_entry(catalog_id)
            .await
            .map_err(SandboxError::NotFound)?
            .ok_or_else(|| {
                SandboxError::NotFound(format!("No catalog connector {catalog_id}"))
            })?;
        self.install_server(entry.to_config()).await
    }

    /// Stop and forget a server. Unknown ids are a no-op.
    pub async fn uninstall_server(&self, server_id: &str) -> Result<()> {
        info!("🗑️ Uninstalling MCP server [{server_id}]");

        self.cancel_start(server_id);
        self.stop_health_check(server_id);
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;
        self.stop_health_check(server_id);

        if self.instance(server_id).await.is_some() {
            let container_id = self.container_id(server_id).await;
            self.inner
                .controller
                .stop(server_id, container_id.as_deref())
                .await;
        }

        MCPServerModel::delete_config(&self.inner.db, server_id).await?;
        self.emit(LifecycleEvent::Removed {
            server_id: server_id.to_string(),
        });
        self.inner.auto_restarted.lock().await.remove(server_id);
        self.sync().await;
        Ok(())
    }

    pub async fn stop_server(&self, server_id: &str) -> Result<()> {
        if self.instance(server_id).await.is_none() {
            return Err(SandboxError::NotFound(format!("No sandbox for {server_id}")));
        }

        self.cancel_start(server_id);
        self.stop_health_check(server_id);
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;
        self.stop_health_check(server_id);

        let container_id = self.container_id(server_id).await;
        self.inner
            .controller
            .stop(server_id, container_id.as_deref())
            .await;
        self.sync().await;
        Ok(())
    }

    /// Forget the server's OAuth tokens and stop its sandbox. The config
    /// stays installed.
    pub async fn disconnect_server(&self, server_id: &str) -> Result<()> {
        info!("🔌 Disconnecting MCP server [{server_id}]");
        self.inner.credentials.clear_tokens(server_id).await?;
        self.stop_server(server_id).await
    }

    /// Stop and start one server from its persisted config, e.g. after new
    /// tokens were stored
    pub async fn restart_server(&self, server_id: &str) -> Result<SandboxInstance> {
        let config = MCPServerModel::load_config(&self.inner.db, server_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound(format!("MCP server {server_id} is not installed")))?;
        self.install_server(config).await
    }

    /// Tear everything down and run a fresh initialization cycle
    pub async fn restart(&self) -> Result<()> {
        info!("🔄 Restarting sandboxes");
        self.stop_broadcaster().await;
        self.stop_all().await;
        self.inner.images.invalidate().await;
        self.initialize().await
    }

    /// Restart with every installed server, token and tool removed
    pub async fn reset(&self) -> Result<()> {
        info!("🧨 Resetting sandboxes");
        self.stop_broadcaster().await;
        self.stop_all().await;

        MCPServerModel::delete_all(&self.inner.db).await?;
        let ids: Vec<String> = self.inner.instances.read().await.keys().cloned().collect();
        for server_id in ids {
            self.emit(LifecycleEvent::Removed { server_id });
        }
        self.sync().await;
        self.inner.tools.clear_sandboxed().await;

        self.inner.images.invalidate().await;
        self.initialize().await
    }

    async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.instances.read().await.keys().cloned().collect();
        for id in &ids {
            self.cancel_start(id);
            self.stop_health_check(id);
        }

        let limit = self.inner.settings.max_concurrent_starts.max(1);
        stream::iter(ids)
            .for_each_concurrent(limit, |server_id| async move {
                let lock = self.server_lock(&server_id).await;
                let _guard = lock.lock().await;
                let container_id = self.container_id(&server_id).await;
                self.inner
                    .controller
                    .stop(&server_id, container_id.as_deref())
                    .await;
            })
            .await;

        self.sync().await;
    }

    /// Cancel everything and stop every sandbox
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down sandboxes");
        self.stop_broadcaster().await;
        self.stop_all().await;
        self.inner.shutdown.cancel();
    }

    /// Cached summary, never probes anything
    pub async fn get_sandbox_status(&self) -> SandboxStatusSummary {
        let runtime = RuntimeStatus {
            state: self.inner.runtime.state().await,
            progress: self.inner.runtime.progress(),
            error: self.inner.runtime.last_error().await,
        };
        let instances = self.inner.instances.read().await;
        SandboxStatusSummary::from_instances(runtime, instances.values())
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SandboxStatusSummary> {
        self.inner.status_tx.subscribe()
    }

    pub async fn instance(&self, server_id: &str) -> Option<SandboxInstance> {
        self.inner.instances.read().await.get(server_id).cloned()
    }

    pub async fn instances(&self) -> Vec<SandboxInstance> {
        let mut instances: Vec<SandboxInstance> =
            self.inner.instances.read().await.values().cloned().collect();
        instances.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        instances
    }

    async fn container_id(&self, server_id: &str) -> Option<String> {
        self.inner
            .instances
            .read()
            .await
            .get(server_id)
            .and_then(|instance| instance.container_id.clone())
    }

    pub async fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.tools.get_all_tools().await
    }

    pub async fn get_tools_by_id(&self, ids: &[String]) -> Vec<ToolDescriptor> {
        self.inner.tools.get_tools_by_id(ids).await
    }

    /// Route a call to the sandbox owning `tool_id`
    pub async fn call_tool(&self, tool_id: &str, arguments: Option<JsonObject>) -> Result<Value> {
        let tool = self
            .inner
            .tools
            .get_tool(tool_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("Unknown tool {tool_id}")))?;

        if tool.server_id == BUILTIN_SERVER_ID {
            let result = ArchestraMcpServer::new(self.clone())
                .call_builtin(&tool.name, arguments)
                .await
                .map_err(|e| SandboxError::Protocol(e.message.to_string()))?;
            return serde_json::to_value(result).map_err(|e| SandboxError::Protocol(e.to_string()));
        }

        let endpoint = self
            .instance(&tool.server_id)
            .await
            .filter(|instance| instance.state == SandboxState::Running)
            .and_then(|instance| instance.endpoint)
            .ok_or_else(|| {
                SandboxError::NotFound(format!("Sandbox {} is not running", tool.server_id))
            })?;

        debug!("🔧 Calling {tool_id} at {endpoint}");
        self.inner
            .protocol
            .call_tool(&endpoint, &tool.name, arguments)
            .await
    }

    /// Store analysis flags for a tool. Returns false for unknown tools.
    pub async fn update_tool_analysis(&self, tool_id: &str, analysis: ToolAnalysis) -> Result<bool> {
        let registered = self.inner.tools.update_analysis(tool_id, analysis.clone()).await;
        let persisted = ToolModel::update_analysis(&self.inner.db, tool_id, &analysis).await?;
        Ok(registered || persisted)
    }

    async fn start_guarded(
        &self,
        config: SandboxedServerConfig,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<SandboxInstance> {
        let lock = self.server_lock(&config.id).await;
        let _guard = lock.lock().await;

        if cancel.is_cancelled() || !self.still_installed(&config.id).await {
            self.end_start(&config.id, generation);
            return Err(SandboxError::Cancelled(format!(
                "Sandbox {} was removed before it started",
                config.id
            )));
        }
        self.start_locked(config, generation, cancel).await
    }

    async fn still_installed(&self, server_id: &str) -> bool {
        if self.instance(server_id).await.is_none() {
            return false;
        }
        match MCPServerModel::load_config(&self.inner.db, server_id).await {
            Ok(config) => config.is_some(),
            Err(e) => {
                warn!("Sandbox [{server_id}] config could not be loaded: {e}");
                false
            }
        }
    }

    /// Caller holds the server's lock and registered `generation` with
    /// `begin_start`
    async fn start_locked(
        &self,
        config: SandboxedServerConfig,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<SandboxInstance> {
        let server_id = config.id.clone();
        self.stop_health_check(&server_id);

        let result = self.inner.controller.start(&config, &cancel).await;
        self.end_start(&server_id, generation);

        let started = match result {
            Ok(started) => started,
            Err(e) => {
                self.sync().await;
                return Err(e);
            }
        };

        let descriptors = ToolAggregator::describe(&server_id, &config.name, started.tools);
        let descriptors =
            match ToolModel::replace_for_server(&self.inner.db, &server_id, descriptors.clone()).await {
                Ok(merged) => merged,
                Err(e) => {
                    warn!("Sandbox [{server_id}] failed to persist tools: {e}");
                    descriptors
                }
            };

        self.emit(LifecycleEvent::Ready {
            server_id: server_id.clone(),
            endpoint: started.endpoint.clone(),
            tools: descriptors,
        });
        self.sync().await;

        let Some(instance) = self.instance(&server_id).await else {
            warn!("Sandbox [{server_id}] became ready after removal, tearing it down");
            self.inner
                .controller
                .stop(&server_id, Some(&started.container_id))
                .await;
            return Err(SandboxError::NotFound(format!("Sandbox {server_id} was removed")));
        };
        self.spawn_health_check(server_id, started.endpoint);
        Ok(instance)
    }

    fn begin_start(&self, server_id: &str) -> (u64, CancellationToken) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.shutdown.child_token();
        let previous =
            locked(&self.inner.starts).insert(server_id.to_string(), (generation, token.clone()));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }
        (generation, token)
    }

    fn end_start(&self, server_id: &str, generation: u64) {
        let mut starts = locked(&self.inner.starts);
        if starts.get(server_id).is_some_and(|(g, _)| *g == generation) {
            starts.remove(server_id);
        }
    }

    fn cancel_start(&self, server_id: &str) {
        let removed = locked(&self.inner.starts).remove(server_id);
        if let Some((_, token)) = removed {
            debug!("Sandbox [{server_id}] cancelling in-flight start");
            token.cancel();
        }
    }

    fn stop_health_check(&self, server_id: &str) {
        let removed = locked(&self.inner.health_checks).remove(server_id);
        if let Some(token) = removed {
            token.cancel();
        }
    }

    fn spawn_health_check(&self, server_id: String, endpoint: String) {
        let token = self.inner.shutdown.child_token();
        let previous = locked(&self.inner.health_checks).insert(server_id.clone(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let settings = manager.inner.settings.clone();
            let mut ticker = tokio::time::interval(settings.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately, readiness was just confirmed
            ticker.tick().await;

            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match manager.inner.controller.probe(&endpoint).await {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "🩺 Sandbox [{server_id}] health check failed ({failures}/{}): {e}",
                            settings.health_failure_threshold
                        );
                        if failures >= settings.health_failure_threshold.max(1) {
                            if !token.is_cancelled() {
                                manager.handle_unhealthy(&server_id, &endpoint, e).await;
                            }
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Mark an unresponsive sandbox Failed and restart it, once
    async fn handle_unhealthy(&self, server_id: &str, endpoint: &str, cause: SandboxError) {
        let lock = self.server_lock(server_id).await;
        let _guard = lock.lock().await;

        let Some(instance) = self.instance(server_id).await else {
            return;
        };
        if instance.state != SandboxState::Running || instance.endpoint.as_deref() != Some(endpoint)
        {
            return;
        }

        error!("🩺 Sandbox [{server_id}] is unhealthy: {cause}");
        self.emit(LifecycleEvent::Failed {
            server_id: server_id.to_string(),
            failure: SandboxFailure {
                kind: FailureKind::HealthCheckFailed,
                message: cause.to_string(),
            },
        });
        self.sync().await;

        if !self.inner.auto_restarted.lock().await.insert(server_id.to_string()) {
            warn!("Sandbox [{server_id}] was already restarted automatically, leaving it Failed");
            if let Some(container_id) = &instance.container_id {
                if let Err(e) = self.inner.backend.remove_container(container_id).await {
                    warn!("Sandbox [{server_id}] failed to remove container {container_id}: {e}");
                }
                self.emit(LifecycleEvent::ContainerRemoved {
                    server_id: server_id.to_string(),
                });
                self.sync().await;
            }
            return;
        }

        self.inner
            .controller
            .stop(server_id, instance.container_id.as_deref())
            .await;

        let config = match MCPServerModel::load_config(&self.inner.db, server_id).await {
            Ok(Some(config)) => config,
            Ok(None) => return,
            Err(e) => {
                error!("Sandbox [{server_id}] config could not be loaded for restart: {e}");
                return;
            }
        };

        info!("🔄 Sandbox [{server_id}] restarting after failed health checks");
        let (generation, cancel) = self.begin_start(server_id);
        if let Err(e) = self.start_locked(config, generation, cancel).await {
            warn!("Sandbox [{server_id}] automatic restart failed: {e}");
        }
    }

    async fn start_broadcaster(&self) {
        let mut slot = self.inner.broadcaster.lock().await;
        if slot.is_some() {
            return;
        }

        let manager = self.clone();
        *slot = Some(StatusBroadcaster::spawn(
            self.inner.settings.status_broadcast_interval,
            self.inner.status_tx.clone(),
            &self.inner.shutdown,
            move || {
                let manager = manager.clone();
                async move { manager.get_sandbox_status().await }
            },
        ));
    }

    async fn stop_broadcaster(&self) {
        let broadcaster = self.inner.broadcaster.lock().await.take();
        if let Some(broadcaster) = broadcaster {
            broadcaster.stop().await;
        }
    }
}

/// Guards are never held across an await
fn locked<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applies lifecycle events in order. The only writer of the instance map.
async fn control_loop(
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    instances: Arc<RwLock<HashMap<String, SandboxInstance>>>,
    tools: ToolAggregator,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        apply_event(&instances, &tools, event).await;
    }
    debug!("Sandbox control loop stopped");
}

async fn apply_event(
    instances: &RwLock<HashMap<String, SandboxInstance>>,
    tools: &ToolAggregator,
    event: LifecycleEvent,
) {
    let mut map = instances.write().await;

    match event {
        LifecycleEvent::Barrier(ack) => {
            let _ = ack.send(());
        }
        LifecycleEvent::Registered {
            server_id,
            server_name,
        } => {
            map.entry(server_id.clone())
                .and_modify(|instance| instance.server_name = server_name.clone())
                .or_insert_with(|| SandboxInstance::new(server_id, server_name));
        }
        LifecycleEvent::Removed { server_id } => {
            map.remove(&server_id);
            tools.remove_server(&server_id).await;
        }
        event => {
            let Some(server_id) = event.server_id().map(str::to_string) else {
                return;
            };
            let Some(instance) = map.get_mut(&server_id) else {
                debug!("Ignoring lifecycle event for unknown sandbox {server_id}");
                return;
            };
            apply_to_instance(instance, tools, event).await;
        }
    }
}

async fn apply_to_instance(
    instance: &mut SandboxInstance,
    tools: &ToolAggregator,
    event: LifecycleEvent,
) {
    let next = match &event {
        LifecycleEvent::Transition { state, .. } => Some(*state),
        LifecycleEvent::Ready { .. } => Some(SandboxState::Running),
        LifecycleEvent::Failed { .. } => Some(SandboxState::Failed),
        LifecycleEvent::Stopped { .. } => Some(SandboxState::Stopped),
        _ => None,
    };
    if let Some(next) = next {
        if !instance.state.can_transition_to(next) {
            warn!(
                "Sandbox [{}] ignoring transition {} -> {next}",
                instance.server_id, instance.state
            );
            return;
        }
    }

    let server_id = instance.server_id.clone();
    match event {
        LifecycleEvent::Transition { state, .. } => {
            if state.is_starting() {
                instance.last_error = None;
            }
            if state == SandboxState::Stopping {
                tools.remove_server(&server_id).await;
                instance.tool_ids.clear();
            }
            instance.state = state;
        }
        LifecycleEvent::ContainerCreated { container_id, .. } => {
            instance.container_id = Some(container_id);
        }
        LifecycleEvent::ContainerRemoved { .. } => {
            instance.container_id = None;
            instance.endpoint = None;
        }
        LifecycleEvent::Ready {
            endpoint,
            tools: descriptors,
            ..
        } => {
            instance.tool_ids = tools.register_server_tools(&server_id, descriptors).await;
            instance.endpoint = Some(endpoint);
            instance.last_error = None;
            instance.state = SandboxState::Running;
        }
        LifecycleEvent::Failed { failure, .. } => {
            tools.remove_server(&server_id).await;
            instance.tool_ids.clear();
            instance.endpoint = None;
            instance.last_error = Some(failure);
            instance.state = SandboxState::Failed;
        }
        LifecycleEvent::Stopped { .. } => {
            tools.remove_server(&server_id).await;
            instance.tool_ids.clear();
            instance.endpoint = None;
            instance.state = SandboxState::Stopped;
        }
        LifecycleEvent::Registered { .. }
        | LifecycleEvent::Removed { .. }
        | LifecycleEvent::Barrier(_) => {}
    }

    instance.updated_at = chrono::Utc::now();
}
