//! Is there a Docker daemon to start containers on?
//!
//! Used by `testbay doctor` and by test suites that want to skip cleanly
//! instead of failing every start with a connection error.

use std::fmt;

use serde::Serialize;

use crate::runtime::docker::connect_docker;

/// Outcome of probing for Docker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DockerStatus {
    /// The daemon answered a ping.
    Available,
    /// No `docker` binary on PATH and no daemon reachable.
    NotInstalled,
    /// The binary exists but the daemon does not answer.
    NotRunning,
}

impl DockerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DockerStatus::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DockerStatus::Available => "available",
            DockerStatus::NotInstalled => "not installed",
            DockerStatus::NotRunning => "not running",
        }
    }
}

impl fmt::Display for DockerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host platform, for install and startup hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOS,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => {
                "Install Docker Desktop (https://docs.docker.com/desktop/install/mac-install/) or colima"
            }
            Platform::Linux => "Install Docker Engine: https://docs.docker.com/engine/install/",
            Platform::Windows => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/windows-install/"
            }
        }
    }

    pub fn start_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => "Start Docker Desktop (open -a Docker) or run: colima start",
            Platform::Linux => {
                "Start the daemon (sudo systemctl start docker) or point DOCKER_HOST at one"
            }
            Platform::Windows => "Start Docker Desktop from the Start menu",
        }
    }
}

/// What [`check_docker`] found.
#[derive(Debug, Clone, Serialize)]
pub struct DockerDetection {
    pub status: DockerStatus,
    pub platform: Platform,
    /// Daemon version, when it answered.
    pub server_version: Option<String>,
    /// Why the connection failed, when it did.
    pub error: Option<String>,
}

impl DockerDetection {
    /// What to tell the user to do next, if anything.
    pub fn hint(&self) -> Option<&'static str> {
        match self.status {
            DockerStatus::Available => None,
            DockerStatus::NotInstalled => Some(self.platform.install_hint()),
            DockerStatus::NotRunning => Some(self.platform.start_hint()),
        }
    }
}

/// Probe for a usable Docker daemon.
///
/// A daemon that answers counts as available even without a local CLI, as
/// with a remote `DOCKER_HOST`.
pub async fn check_docker() -> DockerDetection {
    let platform = Platform::current();

    match connect_docker().await {
        Ok(docker) => {
            let server_version = match docker.version().await {
                Ok(version) => version.version,
                Err(e) => {
                    tracing::debug!("Docker answered ping but not version: {}", e);
                    None
                }
            };
            DockerDetection {
                status: DockerStatus::Available,
                platform,
                server_version,
                error: None,
            }
        }
        Err(e) => {
            let status = if docker_binary_exists() {
                DockerStatus::NotRunning
            } else {
                DockerStatus::NotInstalled
            };
            DockerDetection {
                status,
                platform,
                server_version: None,
                error: Some(e.to_string()),
            }
        }
    }
}

fn docker_binary_exists() -> bool {
    let finder = if cfg!(windows) { "where" } else { "which" };
    std::process::Command::new(finder)
        .arg("docker")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
