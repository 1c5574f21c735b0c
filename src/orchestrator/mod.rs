//! Startup orchestration: from a [`ContainerRequest`] to a ready container.
//!
//! ```text
//! start(request)
//!   ├─ image tag present locally? ── no ──▶ pull (failure aborts)
//!   ├─ resolve host ports (concurrent, declaration order kept)
//!   ├─ create ─▶ start ─▶ inspect
//!   └─ wait strategy ─┬─ Ready    ──▶ StartedContainer
//!                     ├─ TimedOut ──▶ Error::Wait (container left running)
//!                     └─ Fatal    ──▶ Error::Wait (container left running)
//! ```

use std::sync::Arc;

use crate::config::HarnessConfig;
use crate::container::{ContainerRequest, StartedContainer};
use crate::error::Result;
use crate::ports::{BoundPorts, HostPort, InternalPort, PortAllocator, PortSource};
use crate::runtime::{ContainerId, ContainerRuntime, DockerRuntime, RepoTag};
use crate::state::ContainerState;
use crate::wait::{ProbeContext, WaitStrategy};

/// Starts containers and waits for them to become ready.
///
/// Holds the runtime client explicitly; nothing is connected implicitly.
/// Cloning is cheap and clones share the runtime and port reservations.
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    allocator: PortAllocator,
    config: HarnessConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("host", &self.runtime.host())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Use `runtime` with default configuration and the process-wide
    /// port allocator.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            allocator: PortAllocator::shared(),
            config: HarnessConfig::default(),
        }
    }

    /// Connect to the local Docker daemon using configuration from the
    /// environment.
    pub async fn connect_local() -> Result<Self> {
        let config = HarnessConfig::resolve()?;
        let runtime = DockerRuntime::connect(config.host.clone()).await?;
        tracing::debug!("Connected to Docker; published ports on {}", config.host);
        Ok(Self::new(Arc::new(runtime)).with_config(config))
    }

    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Start a container and wait until it is ready.
    ///
    /// Every call creates a new container. A container that fails its wait
    /// strategy is left in place for inspection and no handle is returned.
    pub async fn start(&self, request: ContainerRequest) -> Result<StartedContainer> {
        let repo_tag = request.repo_tag();

        if self.has_repo_tag_locally(repo_tag).await? {
            tracing::debug!("Image {} present locally", repo_tag);
        } else {
            tracing::debug!("Image {} not present locally", repo_tag);
            self.runtime.pull_image(repo_tag, request.auth()).await?;
        }

        let bound_ports = self.allocator.resolve(request.exposed_ports()).await?;
        let allocated: Vec<HostPort> = request
            .exposed_ports()
            .iter()
            .filter(|p| p.source == PortSource::Random)
            .filter_map(|p| bound_ports.get_binding(p.internal).ok())
            .collect();

        match self.launch(&request, &bound_ports).await {
            Ok((id, name)) => Ok(StartedContainer::new(
                self.runtime.clone(),
                self.allocator.clone(),
                id,
                name,
                bound_ports,
                allocated,
                true,
            )),
            Err(e) => {
                self.allocator.release(allocated);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        request: &ContainerRequest,
        bound_ports: &BoundPorts,
    ) -> Result<(ContainerId, String)> {
        let options = request.create_options(bound_ports.clone());
        let id = self.runtime.create_container(&options).await?;
        tracing::debug!("Created container {} from {}", id, request.repo_tag());

        self.runtime.start_container(&id).await?;

        let inspection = self.runtime.inspect_container(&id).await?;
        let state = ContainerState::from_inspection(&inspection);
        tracing::info!(
            "Started container {} ({}) from {}",
            state.name,
            id,
            request.repo_tag()
        );

        let strategy = effective_strategy(request);
        let mut poller = strategy.poller(self.config.startup_timeout, self.config.poll_interval);
        let ctx = ProbeContext {
            runtime: self.runtime.as_ref(),
            container_id: &id,
            host: self.runtime.host(),
            bound_ports,
            state: &state,
        };

        tracing::debug!(
            "Waiting up to {:?} for {} to be ready",
            poller.timeout(),
            state.name
        );
        if let Err(e) = poller.run(&ctx).await {
            tracing::warn!(
                "Container {} ({}) did not become ready; leaving it for inspection: {}",
                state.name,
                id,
                e
            );
            return Err(e.into());
        }

        tracing::info!(
            "Container {} is ready after {} attempt(s)",
            state.name,
            poller.attempts()
        );
        Ok((id, state.name))
    }

    /// Handle to an already running container with this exact name.
    ///
    /// Nothing is waited for. The handle's ports are the engine's published
    /// ones, and dropping it does not warn since the container is not ours.
    pub async fn attach_by_name(&self, name: &str) -> Result<Option<StartedContainer>> {
        let Some(summary) = self.runtime.find_container_by_name(name).await? else {
            return Ok(None);
        };

        let bound_ports: BoundPorts = summary
            .ports
            .iter()
            .filter_map(|&(private, public)| {
                Some((InternalPort::new(private).ok()?, HostPort::new(public).ok()?))
            })
            .collect();

        tracing::debug!(
            "Attached to container {} ({}) with {} published port(s)",
            summary.name,
            summary.id,
            bound_ports.len()
        );
        Ok(Some(StartedContainer::new(
            self.runtime.clone(),
            self.allocator.clone(),
            summary.id,
            summary.name,
            bound_ports,
            Vec::new(),
            false,
        )))
    }

    async fn has_repo_tag_locally(&self, repo_tag: &RepoTag) -> Result<bool> {
        let tags = self.runtime.list_repo_tags().await?;
        Ok(tags.iter().any(|t| t == repo_tag))
    }
}

/// The request's strategy, or host plus internal port checks over every
/// exposed port. A request-level startup timeout overrides the strategy's.
fn effective_strategy(request: &ContainerRequest) -> WaitStrategy {
    let strategy = request
        .wait_strategy()
        .cloned()
        .unwrap_or_else(WaitStrategy::for_listening_ports);
    match request.startup_timeout() {
        Some(timeout) => strategy.with_startup_timeout(timeout),
        None => strategy,
    }
}
