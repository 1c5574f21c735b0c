//! Immutable description of a container to start.

use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::ports::{BoundPorts, ExposedPort, HostPort, InternalPort};
use crate::runtime::{BindMode, BindMount, CreateOptions, HealthCheck, RegistryAuth, RepoTag};
use crate::wait::WaitStrategy;

/// What to start. Built once with [`ContainerRequest::builder`] and consumed
/// by [`crate::Orchestrator::start`].
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    repo_tag: RepoTag,
    env: BTreeMap<String, String>,
    cmd: Vec<String>,
    exposed_ports: Vec<ExposedPort>,
    bind_mounts: Vec<BindMount>,
    tmpfs: BTreeMap<String, String>,
    network_mode: Option<String>,
    health_check: Option<HealthCheck>,
    startup_timeout: Option<Duration>,
    wait_strategy: Option<WaitStrategy>,
    name: Option<String>,
    use_default_log_driver: bool,
    auth: Option<RegistryAuth>,
}

impl ContainerRequest {
    /// Start describing a container from `image`.
    ///
    /// `image` may carry a tag (`redis:7`); without one, `latest` is used
    /// unless [`ContainerRequestBuilder::with_tag`] says otherwise.
    pub fn builder(image: impl Into<String>) -> ContainerRequestBuilder {
        ContainerRequestBuilder {
            image: image.into(),
            tag: None,
            env: BTreeMap::new(),
            cmd: Vec::new(),
            ports: Vec::new(),
            bind_mounts: Vec::new(),
            tmpfs: BTreeMap::new(),
            network_mode: None,
            health_check: None,
            startup_timeout: None,
            wait_strategy: None,
            name: None,
            use_default_log_driver: false,
            auth: None,
        }
    }

    pub fn repo_tag(&self) -> &RepoTag {
        &self.repo_tag
    }

    pub fn exposed_ports(&self) -> &[ExposedPort] {
        &self.exposed_ports
    }

    pub fn wait_strategy(&self) -> Option<&WaitStrategy> {
        self.wait_strategy.as_ref()
    }

    /// Startup timeout set on the request itself.
    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn auth(&self) -> Option<&RegistryAuth> {
        self.auth.as_ref()
    }

    pub fn health_check(&self) -> Option<&HealthCheck> {
        self.health_check.as_ref()
    }

    /// Engine create options once host ports are resolved.
    pub(crate) fn create_options(&self, bound_ports: BoundPorts) -> CreateOptions {
        CreateOptions {
            repo_tag: self.repo_tag.clone(),
            env: self.env.clone(),
            cmd: self.cmd.clone(),
            bind_mounts: self.bind_mounts.clone(),
            tmpfs: self.tmpfs.clone(),
            bound_ports,
            name: self.name.clone(),
            network_mode: self.network_mode.clone(),
            health_check: self.health_check.clone(),
            use_default_log_driver: self.use_default_log_driver,
        }
    }
}

/// Fluent builder for [`ContainerRequest`]. Validation happens in
/// [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ContainerRequestBuilder {
    image: String,
    tag: Option<String>,
    env: BTreeMap<String, String>,
    cmd: Vec<String>,
    ports: Vec<(u16, Option<u16>)>,
    bind_mounts: Vec<BindMount>,
    tmpfs: BTreeMap<String, String>,
    network_mode: Option<String>,
    health_check: Option<HealthCheck>,
    startup_timeout: Option<Duration>,
    wait_strategy: Option<WaitStrategy>,
    name: Option<String>,
    use_default_log_driver: bool,
    auth: Option<RegistryAuth>,
}

impl ContainerRequestBuilder {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the image's default command.
    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Expose internal ports on randomly allocated host ports.
    pub fn with_exposed_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports.extend(ports.into_iter().map(|p| (p, None)));
        self
    }

    /// Expose `internal` on the fixed host port `host`.
    pub fn with_exposed_port_mapping(mut self, internal: u16, host: u16) -> Self {
        self.ports.push((internal, Some(host)));
        self
    }

    pub fn with_bind_mount(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        mode: BindMode,
    ) -> Self {
        self.bind_mounts.push(BindMount {
            source: source.into(),
            target: target.into(),
            mode,
        });
        self
    }

    /// Mount a tmpfs at `path` with engine mount `options` (e.g. `rw,size=64m`).
    pub fn with_tmpfs(mut self, path: impl Into<String>, options: impl Into<String>) -> Self {
        self.tmpfs.insert(path.into(), options.into());
        self
    }

    pub fn with_network_mode(mut self, network_mode: impl Into<String>) -> Self {
        self.network_mode = Some(network_mode.into());
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Readiness strategy; the last one set wins.
    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = Some(strategy);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Use the `json-file` log driver so logs stay readable whatever the
    /// daemon default is.
    pub fn with_default_log_driver(mut self) -> Self {
        self.use_default_log_driver = true;
        self
    }

    pub fn with_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        server_address: impl Into<String>,
    ) -> Self {
        self.auth = Some(RegistryAuth {
            username: username.into(),
            password: SecretString::from(password.into()),
            server_address: server_address.into(),
            email: None,
        });
        self
    }

    pub fn with_registry_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn build(self) -> Result<ContainerRequest, ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::MissingImage);
        }
        let mut repo_tag = RepoTag::parse(self.image.trim());
        if let Some(tag) = self.tag {
            repo_tag.tag = tag;
        }

        // A port declared twice keeps its first position and its last source.
        let mut exposed_ports: Vec<ExposedPort> = Vec::with_capacity(self.ports.len());
        for (internal, host) in self.ports {
            let internal = InternalPort::new(internal)?;
            let port = match host {
                Some(host) => ExposedPort::fixed(internal, HostPort::new(host)?),
                None => ExposedPort::random(internal),
            };
            match exposed_ports.iter_mut().find(|p| p.internal == internal) {
                Some(existing) => *existing = port,
                None => exposed_ports.push(port),
            }
        }

        Ok(ContainerRequest {
            repo_tag,
            env: self.env,
            cmd: self.cmd,
            exposed_ports,
            bind_mounts: self.bind_mounts,
            tmpfs: self.tmpfs,
            network_mode: self.network_mode,
            health_check: self.health_check,
            startup_timeout: self.startup_timeout,
            wait_strategy: self.wait_strategy,
            name: self.name,
            use_default_log_driver: self.use_default_log_driver,
            auth: self.auth,
        })
    }
}
