//! Values passed to and returned from a [`ContainerRuntime`](super::ContainerRuntime).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use secrecy::SecretString;

use crate::ports::BoundPorts;

/// Engine-assigned container id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An image name plus tag or digest.
///
/// A digest reference (`img@sha256:…`) keeps the digest in `tag`; tags
/// cannot contain `:`, so [`is_digest`](Self::is_digest) tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoTag {
    pub image: String,
    pub tag: String,
}

impl RepoTag {
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
        }
    }

    /// Split an engine `repo:tag` or `repo@digest` string.
    ///
    /// A digest wins over any tag next to it. Otherwise the tag separator is
    /// the last `:` after the last `/`, so registry ports
    /// (`host:5000/img:1.0`) are kept in the image name. Untagged references
    /// get `latest`.
    pub fn parse(reference: &str) -> Self {
        if let Some((name, digest)) = reference.split_once('@') {
            let image = Self::parse(name).image;
            return Self::new(image, digest);
        }

        let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[name_start..].rfind(':') {
            Some(i) => {
                let split = name_start + i;
                Self::new(&reference[..split], &reference[split + 1..])
            }
            None => Self::new(reference, "latest"),
        }
    }

    pub fn is_digest(&self) -> bool {
        self.tag.contains(':')
    }
}

impl fmt::Display for RepoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_digest() {
            write!(f, "{}@{}", self.image, self.tag)
        } else {
            write!(f, "{}:{}", self.image, self.tag)
        }
    }
}

/// Registry credentials for pulling private images.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: SecretString,
    pub server_address: String,
    pub email: Option<String>,
}

/// Bind mount access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl BindMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindMode::ReadWrite => "rw",
            BindMode::ReadOnly => "ro",
        }
    }
}

/// A host directory mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub mode: BindMode,
}

impl BindMount {
    /// Engine `source:target:mode` form.
    pub fn to_bind_string(&self) -> String {
        format!("{}:{}:{}", self.source, self.target, self.mode.as_str())
    }
}

/// Health check the engine runs inside the container.
///
/// `test` is a shell command; unset durations use the engine default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub test: String,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub start_period: Option<Duration>,
}

impl HealthCheck {
    pub fn new(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            interval: None,
            timeout: None,
            retries: None,
            start_period: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = Some(start_period);
        self
    }
}

/// Everything the engine needs to create a container.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub repo_tag: RepoTag,
    pub env: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub bind_mounts: Vec<BindMount>,
    /// Container path to mount options.
    pub tmpfs: BTreeMap<String, String>,
    pub bound_ports: BoundPorts,
    pub name: Option<String>,
    pub network_mode: Option<String>,
    pub health_check: Option<HealthCheck>,
    /// Force the `json-file` log driver instead of the daemon default.
    pub use_default_log_driver: bool,
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Combined stdout and stderr.
    pub output: String,
    pub exit_code: i64,
}

/// How to stop a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Grace period before the engine kills the process.
    pub timeout: Duration,
    pub remove_volumes: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            remove_volumes: true,
        }
    }
}

/// How to remove a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    pub remove_volumes: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            remove_volumes: true,
        }
    }
}

/// A running container found by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub name: String,
    /// `(private, public)` pairs; unpublished ports are omitted.
    pub ports: Vec<(u16, u16)>,
}
