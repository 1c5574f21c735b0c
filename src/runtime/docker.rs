//! [`ContainerRuntime`] backed by a Docker daemon through bollard.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{
    ContainerInspectResponse, HealthConfig, HostConfig, HostConfigLogConfig, PortBinding,
};
use futures::StreamExt;
use secrecy::ExposeSecret;

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSummary, CreateOptions, ExecResult, LogStream,
    RegistryAuth, RepoTag, StopOptions,
};

/// Seconds bollard waits on a socket request.
const SOCKET_TIMEOUT_SECS: u64 = 120;

/// Connect to the Docker daemon.
///
/// Tries bollard's defaults (which honor `DOCKER_HOST`) first, then the
/// socket locations used by Docker Desktop on macOS and rootless Docker on
/// Linux. Each candidate must answer a ping.
pub async fn connect_docker() -> Result<Docker, RuntimeError> {
    let mut last_error = String::from("no candidate sockets");

    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => last_error = e.to_string(),
        },
        Err(e) => last_error = e.to_string(),
    }

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let path = socket.to_string_lossy();
        let docker = match Docker::connect_with_socket(
            &path,
            SOCKET_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        ) {
            Ok(docker) => docker,
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };
        match docker.ping().await {
            Ok(_) => {
                tracing::debug!("Connected to Docker via {}", path);
                return Ok(docker);
            }
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(RuntimeError::NotAvailable { reason: last_error })
}

fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if let Some(home) = dirs::home_dir() {
        sockets.push(home.join(".docker/run/docker.sock"));
        sockets.push(home.join(".colima/default/docker.sock"));
    }
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        sockets.push(PathBuf::from(runtime_dir).join("docker.sock"));
    }
    sockets
}

/// Docker daemon runtime.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    host: String,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Wrap an existing connection; published ports are reached on `host`.
    pub fn new(docker: Docker, host: impl Into<String>) -> Self {
        Self {
            docker,
            host: host.into(),
        }
    }

    /// Connect to the local daemon.
    pub async fn connect(host: impl Into<String>) -> Result<Self, RuntimeError> {
        Ok(Self::new(connect_docker().await?, host))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    fn container_config(options: &CreateOptions) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (internal, host) in options.bound_ports.iter() {
            let key = format!("{}/tcp", internal);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host.to_string()),
                }]),
            );
        }

        let env: Vec<String> = options
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds: Vec<String> = options
            .bind_mounts
            .iter()
            .map(|m| m.to_bind_string())
            .collect();

        let tmpfs: HashMap<String, String> = options
            .tmpfs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let healthcheck = options.health_check.as_ref().map(|check| HealthConfig {
            test: Some(vec!["CMD-SHELL".to_string(), check.test.clone()]),
            interval: Some(check.interval.map(as_nanos).unwrap_or(0)),
            timeout: Some(check.timeout.map(as_nanos).unwrap_or(0)),
            retries: Some(check.retries.map(i64::from).unwrap_or(0)),
            start_period: Some(check.start_period.map(as_nanos).unwrap_or(0)),
            ..Default::default()
        });

        let log_config = options.use_default_log_driver.then(|| HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some(HashMap::new()),
        });

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if binds.is_empty() { None } else { Some(binds) },
            tmpfs: if tmpfs.is_empty() { None } else { Some(tmpfs) },
            network_mode: options.network_mode.clone(),
            log_config,
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(options.repo_tag.to_string()),
            env: if env.is_empty() { None } else { Some(env) },
            cmd: if options.cmd.is_empty() {
                None
            } else {
                Some(options.cmd.clone())
            },
            exposed_ports: Some(exposed_ports),
            healthcheck,
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

fn as_nanos(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn api_error(operation: &'static str, id: &ContainerId, e: BollardError) -> RuntimeError {
    if is_not_found(&e) {
        RuntimeError::NotFound { id: id.to_string() }
    } else {
        RuntimeError::Api {
            operation,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_repo_tags(&self) -> Result<Vec<RepoTag>, RuntimeError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Api {
                operation: "list images",
                reason: e.to_string(),
            })?;

        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags.into_iter().chain(image.repo_digests))
            // Dangling images report placeholders.
            .filter(|tag| !tag.starts_with("<none>"))
            .map(|tag| RepoTag::parse(&tag))
            .collect())
    }

    async fn pull_image(
        &self,
        repo_tag: &RepoTag,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        tracing::info!("Pulling image: {}", repo_tag);

        // The engine takes a digest as part of the image name.
        let options = if repo_tag.is_digest() {
            CreateImageOptions {
                from_image: repo_tag.to_string(),
                ..Default::default()
            }
        } else {
            CreateImageOptions {
                from_image: repo_tag.image.clone(),
                tag: repo_tag.tag.clone(),
                ..Default::default()
            }
        };
        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.expose_secret().to_string()),
            serveraddress: Some(a.server_address.clone()),
            email: a.email.clone(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::ImagePullFailed {
                        image: repo_tag.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!("Pulled image: {}", repo_tag);
        Ok(())
    }

    async fn create_container(&self, options: &CreateOptions) -> Result<ContainerId, RuntimeError> {
        tracing::info!("Creating container for image: {}", options.repo_tag);

        let create_options = options.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .docker
            .create_container(create_options, Self::container_config(options))
            .await
            .map_err(|e| RuntimeError::ContainerCreationFailed {
                image: options.repo_tag.to_string(),
                reason: e.to_string(),
            })?;

        for warning in &response.warnings {
            tracing::warn!("Docker warning on create: {}", warning);
        }

        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        tracing::info!("Starting container with ID: {}", id);
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::ContainerStartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn stop_container(
        &self,
        id: &ContainerId,
        options: StopOptions,
    ) -> Result<(), RuntimeError> {
        tracing::info!("Stopping container with ID: {}", id);
        let t = i64::try_from(options.timeout.as_secs()).unwrap_or(i64::MAX);
        self.docker
            .stop_container(id.as_str(), Some(StopContainerOptions { t }))
            .await
            .map_err(|e| api_error("stop", id, e))
    }

    async fn remove_container(
        &self,
        id: &ContainerId,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError> {
        tracing::info!("Removing container with ID: {}", id);
        self.docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    v: remove_volumes,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| api_error("remove", id, e))
    }

    async fn exec(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecResult, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                id.as_str(),
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::NotFound { id: id.to_string() }
                } else {
                    RuntimeError::ExecFailed {
                        id: id.to_string(),
                        reason: format!("create exec: {}", e),
                    }
                }
            })?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::ExecFailed {
                id: id.to_string(),
                reason: format!("start exec: {}", e),
            })?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => output.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                    Err(e) => tracing::warn!("Error reading exec output: {}", e),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::ExecFailed {
                id: id.to_string(),
                reason: format!("inspect exec: {}", e),
            })?;

        let exit_code = inspect.exit_code.ok_or_else(|| RuntimeError::ExecFailed {
            id: id.to_string(),
            reason: "exec finished without an exit code".to_string(),
        })?;

        tracing::trace!("Exec {:?} in {} exited with {}", cmd, id, exit_code);
        Ok(ExecResult { output, exit_code })
    }

    async fn inspect_container(
        &self,
        id: &ContainerId,
    ) -> Result<ContainerInspectResponse, RuntimeError> {
        self.docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| api_error("inspect", id, e))
    }

    fn stream_logs(&self, id: &ContainerId) -> LogStream {
        let owned_id = id.clone();
        self.docker
            .logs(
                id.as_str(),
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(move |chunk| {
                chunk
                    .map(|log| log.into_bytes())
                    .map_err(|e| api_error("logs", &owned_id, e))
            })
            .boxed()
    }

    async fn find_container_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ContainerSummary>, RuntimeError> {
        tracing::info!("Looking for a container with the name: {}", name);

        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Api {
                operation: "list containers",
                reason: e.to_string(),
            })?;

        // The engine filter is a substring match; names carry a leading '/'.
        let wanted = format!("/{}", name.trim_start_matches('/'));
        let found = containers.into_iter().find(|c| {
            c.names
                .as_ref()
                .is_some_and(|names| names.iter().any(|n| *n == wanted))
        });

        Ok(found.and_then(|c| {
            let id = c.id?;
            let ports = c
                .ports
                .unwrap_or_default()
                .into_iter()
                .filter_map(|p| Some((p.private_port, p.public_port?)))
                .collect();
            Some(ContainerSummary {
                id: ContainerId::new(id),
                name: wanted.trim_start_matches('/').to_string(),
                ports,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ports::{BoundPorts, HostPort, InternalPort};
    use crate::runtime::{BindMode, BindMount, HealthCheck};

    fn options() -> CreateOptions {
        CreateOptions {
            repo_tag: RepoTag::new("redis", "7"),
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            cmd: vec![],
            bind_mounts: vec![BindMount {
                source: "/srv".to_string(),
                target: "/data".to_string(),
                mode: BindMode::ReadOnly,
            }],
            tmpfs: BTreeMap::from([("/tmp".to_string(), "rw".to_string())]),
            bound_ports: BoundPorts::new().set_binding(
                InternalPort::new(6379).unwrap(),
                HostPort::new(32000).unwrap(),
            ),
            name: Some("cache".to_string()),
            network_mode: Some("bridge".to_string()),
            health_check: Some(
                HealthCheck::new("redis-cli ping")
                    .with_interval(Duration::from_secs(1))
                    .with_retries(3),
            ),
            use_default_log_driver: true,
        }
    }

    #[test]
    fn test_container_config_translation() {
        let config = DockerRuntime::container_config(&options());

        assert_eq!(config.image.as_deref(), Some("redis:7"));
        assert_eq!(config.env, Some(vec!["A=1".to_string()]));
        assert_eq!(config.cmd, None);
        assert!(config.exposed_ports.unwrap().contains_key("6379/tcp"));

        let health = config.healthcheck.unwrap();
        assert_eq!(
            health.test,
            Some(vec!["CMD-SHELL".to_string(), "redis-cli ping".to_string()])
        );
        assert_eq!(health.interval, Some(1_000_000_000));
        assert_eq!(health.timeout, Some(0));
        assert_eq!(health.retries, Some(3));

        let host = config.host_config.unwrap();
        let binding = &host.port_bindings.unwrap()["6379/tcp"];
        assert_eq!(
            binding.as_ref().unwrap()[0].host_port.as_deref(),
            Some("32000")
        );
        assert_eq!(host.binds, Some(vec!["/srv:/data:ro".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert_eq!(
            host.log_config.unwrap().typ.as_deref(),
            Some("json-file")
        );
        assert_eq!(host.tmpfs.unwrap()["/tmp"], "rw");
    }

    #[test]
    fn test_no_log_config_without_default_driver() {
        let mut opts = options();
        opts.use_default_log_driver = false;
        opts.health_check = None;
        let config = DockerRuntime::container_config(&opts);

        assert!(config.healthcheck.is_none());
        assert!(config.host_config.unwrap().log_config.is_none());
    }
}
