//! In-memory container runtime for tests.
//!
//! Provides:
//! - [`FakeRuntime`]: a [`ContainerRuntime`] that keeps containers in memory,
//!   binds real host listeners on start, and lets tests script exec results,
//!   health status and log output
//! - [`LogSender`]: pushes output into a fake container's log stream
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testbay::{ContainerRequest, Orchestrator};
//! use testbay::testing::FakeRuntime;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(FakeRuntime::new());
//! let orchestrator = Orchestrator::new(runtime.clone());
//! let request = ContainerRequest::builder("redis").with_exposed_ports([6379]).build()?;
//! let container = orchestrator.start(request).await?;
//! assert_eq!(runtime.calls()[0], "list_repo_tags");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bollard::models::{
    ContainerInspectResponse, ContainerState as EngineState, Health, HealthStatusEnum,
    NetworkSettings, PortBinding,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSummary, CreateOptions, ExecResult, LogStream,
    RegistryAuth, RepoTag, StopOptions,
};
use crate::state::HealthStatus;

type ExecHandler = Arc<dyn Fn(&[String]) -> ExecResult + Send + Sync>;

struct FakeContainer {
    options: CreateOptions,
    name: String,
    ip: String,
    running: bool,
    health: HealthStatus,
    listeners: Vec<TcpListener>,
    log_history: Vec<Bytes>,
    log_subscribers: Vec<mpsc::UnboundedSender<Bytes>>,
    logs_closed: bool,
    log_streams_opened: u32,
    execs: u32,
}

#[derive(Default)]
struct Inner {
    repo_tags: Vec<RepoTag>,
    containers: HashMap<ContainerId, FakeContainer>,
    calls: Vec<String>,
    exec_calls: Vec<Vec<String>>,
    exec_handler: Option<ExecHandler>,
    initial_health: Option<HealthStatus>,
    pull_failure: Option<String>,
    start_failure: Option<String>,
    bind_host_ports: bool,
    /// Bind host listeners on this exec rather than at start.
    listen_after_execs: Option<u32>,
    next_ip: u8,
}

/// A [`ContainerRuntime`] that never talks to an engine.
///
/// Containers live in memory. Starting one binds a real TCP listener on
/// each of its host ports, so host reachability probes behave as they
/// would against a daemon. Exec results default to exit code 0.
#[derive(Clone)]
pub struct FakeRuntime {
    inner: Arc<Mutex<Inner>>,
    host: String,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                bind_host_ports: true,
                next_ip: 2,
                ..Default::default()
            })),
            host: "127.0.0.1".to_string(),
        }
    }

    /// Pretend `repo_tag` is already present locally.
    pub fn with_image(self, repo_tag: RepoTag) -> Self {
        self.lock().repo_tags.push(repo_tag);
        self
    }

    /// Fail every pull with `reason`.
    pub fn with_pull_failure(self, reason: impl Into<String>) -> Self {
        self.lock().pull_failure = Some(reason.into());
        self
    }

    /// Fail every start with `reason`.
    pub fn with_start_failure(self, reason: impl Into<String>) -> Self {
        self.lock().start_failure = Some(reason.into());
        self
    }

    /// Health reported by newly created containers, overriding the
    /// default of `Starting` with a health check and `None` without.
    pub fn with_initial_health(self, health: HealthStatus) -> Self {
        self.lock().initial_health = Some(health);
        self
    }

    /// Do not bind host listeners on start; host ports stay closed.
    pub fn without_host_listeners(self) -> Self {
        self.lock().bind_host_ports = false;
        self
    }

    /// Open host listeners on the container's `execs`-th exec instead of at
    /// start, so host ports refuse connections for the first few polls.
    pub fn with_host_listeners_after_execs(self, execs: u32) -> Self {
        self.lock().listen_after_execs = Some(execs);
        self
    }

    /// Answer every exec with `handler`.
    pub fn on_exec(&self, handler: impl Fn(&[String]) -> ExecResult + Send + Sync + 'static) {
        self.lock().exec_handler = Some(Arc::new(handler));
    }

    /// Add a running container without going through create/start.
    pub fn seed_running_container(&self, name: &str) -> ContainerId {
        let id = new_id();
        let mut inner = self.lock();
        let ip = inner.allocate_ip();
        inner.containers.insert(
            id.clone(),
            FakeContainer::new(
                CreateOptions {
                    repo_tag: RepoTag::new("seeded", "latest"),
                    env: Default::default(),
                    cmd: vec![],
                    bind_mounts: vec![],
                    tmpfs: Default::default(),
                    bound_ports: Default::default(),
                    name: Some(name.to_string()),
                    network_mode: None,
                    health_check: None,
                    use_default_log_driver: false,
                },
                name.to_string(),
                ip,
                HealthStatus::None,
                true,
            ),
        );
        id
    }

    pub fn set_health(&self, id: &ContainerId, health: HealthStatus) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.health = health;
        }
    }

    /// Mark a container as exited.
    pub fn kill(&self, id: &ContainerId) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.running = false;
            c.listeners.clear();
        }
    }

    /// Handle for writing to a container's log output.
    pub fn log_sender(&self, id: &ContainerId) -> LogSender {
        LogSender {
            inner: self.inner.clone(),
            id: id.clone(),
        }
    }

    /// Runtime calls in order, as `"operation [argument]"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Commands passed to exec, in order.
    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.lock().exec_calls.clone()
    }

    /// Create options of a container, if it exists.
    pub fn create_options(&self, id: &ContainerId) -> Option<CreateOptions> {
        self.lock().containers.get(id).map(|c| c.options.clone())
    }

    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn is_running(&self, id: &ContainerId) -> bool {
        self.lock().containers.get(id).is_some_and(|c| c.running)
    }

    pub fn log_streams_opened(&self, id: &ContainerId) -> u32 {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.log_streams_opened)
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn allocate_ip(&mut self) -> String {
        let ip = format!("172.17.0.{}", self.next_ip);
        self.next_ip = self.next_ip.wrapping_add(1).max(2);
        ip
    }

    fn container(&mut self, id: &ContainerId) -> Result<&mut FakeContainer, RuntimeError> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })
    }
}

impl FakeContainer {
    fn new(
        options: CreateOptions,
        name: String,
        ip: String,
        health: HealthStatus,
        running: bool,
    ) -> Self {
        Self {
            options,
            name,
            ip,
            running,
            health,
            listeners: Vec::new(),
            log_history: Vec::new(),
            log_subscribers: Vec::new(),
            logs_closed: false,
            log_streams_opened: 0,
            execs: 0,
        }
    }

    fn bind_listeners(&mut self) -> Result<(), String> {
        for host in self.options.bound_ports.host_ports() {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, host.get()))
                .map_err(|e| format!("port {} is already allocated: {}", host, e))?;
            self.listeners.push(listener);
        }
        Ok(())
    }

    fn inspection(&self, id: &ContainerId) -> ContainerInspectResponse {
        let ports = self
            .options
            .bound_ports
            .iter()
            .map(|(internal, host)| {
                (
                    format!("{}/tcp", internal),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(host.to_string()),
                    }]),
                )
            })
            .collect();

        let health = match self.health {
            HealthStatus::None => None,
            HealthStatus::Starting => Some(HealthStatusEnum::STARTING),
            HealthStatus::Healthy => Some(HealthStatusEnum::HEALTHY),
            HealthStatus::Unhealthy => Some(HealthStatusEnum::UNHEALTHY),
        };

        ContainerInspectResponse {
            id: Some(id.to_string()),
            name: Some(format!("/{}", self.name)),
            state: Some(EngineState {
                running: Some(self.running),
                health: health.map(|status| Health {
                    status: Some(status),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ip_address: Some(self.ip.clone()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn new_id() -> ContainerId {
    ContainerId::new(uuid::Uuid::new_v4().simple().to_string())
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_repo_tags(&self) -> Result<Vec<RepoTag>, RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push("list_repo_tags".to_string());
        Ok(inner.repo_tags.clone())
    }

    async fn pull_image(
        &self,
        repo_tag: &RepoTag,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(format!("pull_image {}", repo_tag));
        if let Some(reason) = inner.pull_failure.clone() {
            return Err(RuntimeError::ImagePullFailed {
                image: repo_tag.to_string(),
                reason,
            });
        }
        inner.repo_tags.push(repo_tag.clone());
        Ok(())
    }

    async fn create_container(&self, options: &CreateOptions) -> Result<ContainerId, RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push("create_container".to_string());

        if !inner.repo_tags.contains(&options.repo_tag) {
            return Err(RuntimeError::ContainerCreationFailed {
                image: options.repo_tag.to_string(),
                reason: "No such image".to_string(),
            });
        }

        let id = new_id();
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("fake_{}", &id.as_str()[..8]));
        let health = inner.initial_health.unwrap_or(if options.health_check.is_some() {
            HealthStatus::Starting
        } else {
            HealthStatus::None
        });
        let ip = inner.allocate_ip();
        inner.containers.insert(
            id.clone(),
            FakeContainer::new(options.clone(), name, ip, health, false),
        );
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(format!("start_container {}", id));

        if let Some(reason) = inner.start_failure.clone() {
            return Err(RuntimeError::ContainerStartFailed {
                id: id.to_string(),
                reason,
            });
        }

        let bind = inner.bind_host_ports && inner.listen_after_execs.is_none_or(|n| n == 0);
        let container = inner.container(id)?;
        if bind {
            container
                .bind_listeners()
                .map_err(|reason| RuntimeError::ContainerStartFailed {
                    id: id.to_string(),
                    reason,
                })?;
        }
        container.running = true;
        Ok(())
    }

    async fn stop_container(
        &self,
        id: &ContainerId,
        options: StopOptions,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(format!("stop_container {} {}s", id, options.timeout.as_secs()));
        let container = inner.container(id)?;
        container.running = false;
        container.listeners.clear();
        container.log_subscribers.clear();
        container.logs_closed = true;
        Ok(())
    }

    async fn remove_container(
        &self,
        id: &ContainerId,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(format!("remove_container {} volumes={}", id, remove_volumes));
        inner
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })
    }

    async fn exec(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecResult, RuntimeError> {
        let handler = {
            let mut inner = self.lock();
            inner.exec_calls.push(cmd.to_vec());
            let listen_after = inner
                .listen_after_execs
                .filter(|_| inner.bind_host_ports);
            let container = inner.container(id)?;
            if !container.running {
                return Err(RuntimeError::ExecFailed {
                    id: id.to_string(),
                    reason: "container is not running".to_string(),
                });
            }
            container.execs += 1;
            if listen_after == Some(container.execs) {
                container
                    .bind_listeners()
                    .map_err(|reason| RuntimeError::ExecFailed {
                        id: id.to_string(),
                        reason,
                    })?;
            }
            inner.exec_handler.clone()
        };

        Ok(match handler {
            Some(handler) => handler(cmd),
            None => ExecResult {
                output: String::new(),
                exit_code: 0,
            },
        })
    }

    async fn inspect_container(
        &self,
        id: &ContainerId,
    ) -> Result<ContainerInspectResponse, RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(format!("inspect_container {}", id));
        let container = inner.container(id)?;
        Ok(container.inspection(id))
    }

    fn stream_logs(&self, id: &ContainerId) -> LogStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        match inner.containers.get_mut(id) {
            Some(container) => {
                container.log_streams_opened += 1;
                for chunk in &container.log_history {
                    let _ = tx.send(chunk.clone());
                }
                if !container.logs_closed {
                    container.log_subscribers.push(tx);
                }
                UnboundedReceiverStream::new(rx).map(Ok).boxed()
            }
            None => {
                let err = RuntimeError::NotFound { id: id.to_string() };
                futures::stream::once(async move { Err(err) }).boxed()
            }
        }
    }

    async fn find_container_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ContainerSummary>, RuntimeError> {
        let mut inner = self.lock();
        inner.calls.push(format!("find_container_by_name {}", name));
        Ok(inner
            .containers
            .iter()
            .find(|(_, c)| c.running && c.name == name)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.name.clone(),
                ports: c
                    .options
                    .bound_ports
                    .iter()
                    .map(|(internal, host)| (internal.get(), host.get()))
                    .collect(),
            }))
    }
}

/// Writes to a fake container's log stream.
#[derive(Clone)]
pub struct LogSender {
    inner: Arc<Mutex<Inner>>,
    id: ContainerId,
}

impl LogSender {
    /// Append output; open streams see it immediately, later ones on replay.
    pub fn send(&self, text: impl Into<String>) {
        let chunk = Bytes::from(text.into());
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(container) = inner.containers.get_mut(&self.id) {
            container.log_history.push(chunk.clone());
            container
                .log_subscribers
                .retain(|tx| tx.send(chunk.clone()).is_ok());
        }
    }

    /// End the stream, as when the container's process exits.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(container) = inner.containers.get_mut(&self.id) {
            container.logs_closed = true;
            container.log_subscribers.clear();
        }
    }
}
