//! Handles to containers that passed their wait strategy.

use std::sync::Arc;

use bollard::models::ContainerInspectResponse;

use crate::error::{Result, RuntimeError};
use crate::ports::{BoundPorts, HostPort, InternalPort, PortAllocator};
use crate::runtime::{
    ContainerId, ContainerRuntime, ExecResult, LogStream, RemoveOptions, StopOptions,
};
use crate::state::ContainerState;

/// A running, ready container.
///
/// Only [`crate::Orchestrator`] hands these out, and only after the wait
/// strategy reported ready. [`stop`](Self::stop) and [`remove`](Self::remove)
/// consume the handle. Dropping it leaves the container running.
pub struct StartedContainer {
    runtime: Arc<dyn ContainerRuntime>,
    allocator: PortAllocator,
    id: ContainerId,
    name: String,
    host: String,
    bound_ports: BoundPorts,
    /// Host ports reserved on our behalf; released once the container is gone.
    allocated: Vec<HostPort>,
    /// Started by us rather than attached to; only these warn on drop.
    owned: bool,
    finished: bool,
}

impl std::fmt::Debug for StartedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedContainer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("bound_ports", &self.bound_ports)
            .finish_non_exhaustive()
    }
}

impl StartedContainer {
    pub(crate) fn new(
        runtime: Arc<dyn ContainerRuntime>,
        allocator: PortAllocator,
        id: ContainerId,
        name: String,
        bound_ports: BoundPorts,
        allocated: Vec<HostPort>,
        owned: bool,
    ) -> Self {
        let host = runtime.host().to_string();
        Self {
            runtime,
            allocator,
            id,
            name,
            host,
            bound_ports,
            allocated,
            owned,
            finished: false,
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Container name without the engine's leading `/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host where mapped ports are reachable.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Same as [`host`](Self::host): the address tests connect to.
    pub fn container_ip_address(&self) -> &str {
        &self.host
    }

    pub fn bound_ports(&self) -> &BoundPorts {
        &self.bound_ports
    }

    /// Host port bound to `internal`.
    ///
    /// Asking for a port that was never exposed is a configuration error.
    pub fn mapped_port(&self, internal: u16) -> Result<u16> {
        let internal = InternalPort::new(internal)?;
        Ok(self.bound_ports.get_binding(internal)?.get())
    }

    /// Fresh snapshot of the container.
    pub async fn inspect(&self) -> Result<ContainerState> {
        let inspection = self.runtime.inspect_container(&self.id).await?;
        Ok(ContainerState::from_inspection(&inspection))
    }

    /// The engine's inspection as returned, for fields the snapshot drops.
    pub async fn inspect_full(&self) -> Result<ContainerInspectResponse> {
        Ok(self.runtime.inspect_container(&self.id).await?)
    }

    /// Run `cmd` inside the container.
    pub async fn exec<I, S>(&self, cmd: I) -> Result<ExecResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd: Vec<String> = cmd.into_iter().map(Into::into).collect();
        tracing::debug!("Exec in {}: {:?}", self.name, cmd);
        Ok(self.runtime.exec(&self.id, &cmd).await?)
    }

    /// Output from the start of the container, following new lines.
    pub fn logs(&self) -> LogStream {
        self.runtime.stream_logs(&self.id)
    }

    /// Stop, then remove the container.
    ///
    /// Reserved host ports are released whether or not the engine calls
    /// succeed; the handle is gone either way.
    pub async fn stop(mut self, options: StopOptions) -> Result<StoppedContainer> {
        tracing::info!("Stopping container {} ({})", self.name, self.id);
        let result = match self.runtime.stop_container(&self.id, options).await {
            Ok(()) => {
                self.runtime
                    .remove_container(&self.id, options.remove_volumes)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish("stop", result)?;

        Ok(StoppedContainer {
            id: self.id.clone(),
            name: std::mem::take(&mut self.name),
        })
    }

    /// Remove without stopping first.
    pub async fn remove(mut self, options: RemoveOptions) -> Result<()> {
        tracing::info!("Removing container {} ({})", self.name, self.id);
        let result = self
            .runtime
            .remove_container(&self.id, options.remove_volumes)
            .await;
        self.finish("remove", result)
    }

    /// Give up the handle and leave the container running.
    pub fn detach(mut self) -> ContainerId {
        self.finished = true;
        self.id.clone()
    }

    fn finish(
        &mut self,
        operation: &str,
        result: std::result::Result<(), RuntimeError>,
    ) -> Result<()> {
        match &result {
            Err(e) if e.is_unrecoverable() => {
                tracing::debug!(
                    "Container {} already gone during {}: {}",
                    self.name,
                    operation,
                    e
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to {} container {} ({}); it may still be running: {}",
                    operation,
                    self.name,
                    self.id,
                    e
                );
            }
            Ok(()) => {}
        }
        self.allocator.release(self.allocated.drain(..));
        self.finished = true;
        Ok(result?)
    }
}

impl Drop for StartedContainer {
    fn drop(&mut self) {
        if self.owned && !self.finished && !std::thread::panicking() {
            tracing::warn!(
                "Container {} ({}) dropped while still running; call stop() to remove it",
                self.name,
                self.id
            );
        }
    }
}

/// What is left of a container after [`StartedContainer::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedContainer {
    id: ContainerId,
    name: String,
}

impl StoppedContainer {
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
