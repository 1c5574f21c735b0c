use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::runtime::StopOptions;
use crate::wait::{DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT};

/// Defaults shared by every container an orchestrator starts.
///
/// Individual requests and wait strategies override the timing values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Host where published ports are reachable from the tests.
    pub host: String,
    /// Startup timeout when neither the request nor its strategy sets one.
    pub startup_timeout: Duration,
    /// Delay between readiness attempts.
    pub poll_interval: Duration,
    /// Grace period given to containers on stop.
    pub stop_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: StopOptions::default().timeout,
        }
    }
}

impl HarnessConfig {
    /// Resolve from `TESTBAY_*` environment variables.
    pub fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = match optional_env("TESTBAY_HOST")? {
            Some(host) => host,
            None => optional_env("DOCKER_HOST")?
                .as_deref()
                .and_then(host_from_docker_host)
                .unwrap_or(defaults.host),
        };

        let startup_timeout_secs = parse_optional_env(
            "TESTBAY_STARTUP_TIMEOUT_SECS",
            defaults.startup_timeout.as_secs(),
        )?;
        if startup_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TESTBAY_STARTUP_TIMEOUT_SECS".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let poll_interval_ms = parse_optional_env(
            "TESTBAY_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TESTBAY_POLL_INTERVAL_MS".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            host,
            startup_timeout: Duration::from_secs(startup_timeout_secs),
            poll_interval: Duration::from_millis(poll_interval_ms),
            stop_timeout: Duration::from_secs(parse_optional_env(
                "TESTBAY_STOP_TIMEOUT_SECS",
                defaults.stop_timeout.as_secs(),
            )?),
        })
    }

    /// Stop options using the configured grace period.
    pub fn stop_options(&self) -> StopOptions {
        StopOptions {
            timeout: self.stop_timeout,
            ..Default::default()
        }
    }
}

/// Host part of a `tcp://` or `http(s)://` Docker endpoint.
///
/// Socket endpoints (`unix://`, `npipe://`) publish ports locally, so they
/// yield `None`.
pub(crate) fn host_from_docker_host(docker_host: &str) -> Option<String> {
    let rest = ["tcp://", "http://", "https://"]
        .iter()
        .find_map(|scheme| docker_host.strip_prefix(scheme))?;
    let authority = rest.split('/').next().unwrap_or(rest);

    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next()?
    } else {
        authority.rsplit_once(':').map_or(authority, |(h, _)| h)
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
