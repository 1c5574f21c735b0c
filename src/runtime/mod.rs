//! The container engine seen through the calls startup needs.
//!
//! [`ContainerRuntime`] is the only way the rest of the crate touches the
//! engine. [`DockerRuntime`] implements it against a Docker daemon;
//! [`crate::testing::FakeRuntime`] implements it in memory for tests.

pub mod docker;
pub mod types;

use async_trait::async_trait;
use bollard::models::ContainerInspectResponse;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::RuntimeError;

pub use docker::DockerRuntime;
pub use types::{
    BindMode, BindMount, ContainerId, ContainerSummary, CreateOptions, ExecResult, HealthCheck,
    RegistryAuth, RemoveOptions, RepoTag, StopOptions,
};

/// Combined stdout/stderr of a container, following new output.
pub type LogStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

/// Operations against a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Host name where published ports are reachable.
    fn host(&self) -> &str;

    /// All `image:tag` pairs present locally.
    async fn list_repo_tags(&self) -> Result<Vec<RepoTag>, RuntimeError>;

    async fn pull_image(
        &self,
        repo_tag: &RepoTag,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError>;

    async fn create_container(&self, options: &CreateOptions) -> Result<ContainerId, RuntimeError>;

    async fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    async fn stop_container(
        &self,
        id: &ContainerId,
        options: StopOptions,
    ) -> Result<(), RuntimeError>;

    async fn remove_container(
        &self,
        id: &ContainerId,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError>;

    /// Run `cmd` inside the container and wait for it to finish.
    async fn exec(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecResult, RuntimeError>;

    /// Raw engine inspection; see [`crate::state::ContainerState`] for the
    /// normalized form.
    async fn inspect_container(
        &self,
        id: &ContainerId,
    ) -> Result<ContainerInspectResponse, RuntimeError>;

    /// Stream logs from the start of the container, then follow.
    fn stream_logs(&self, id: &ContainerId) -> LogStream;

    /// Look up a running container by exact name.
    async fn find_container_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ContainerSummary>, RuntimeError>;
}
