//! Error types for container startup and readiness.
//!
//! Each layer has its own enum; [`Error`] is what `start()` surfaces and
//! keeps the categories apart so a caller can tell a misconfigured request
//! from a runtime failure, a slow container from one that will never be ready.

use std::time::Duration;

use thiserror::Error;

/// Result type for top-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid request or environment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Port number outside 1-65535.
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort {
        /// The rejected value.
        port: u16,
    },

    /// No image given.
    #[error("Container image must not be empty")]
    MissingImage,

    /// An environment variable holds an unparseable value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// An environment variable is not valid unicode.
    #[error("Environment variable {key} is not valid unicode")]
    NotUnicode {
        /// Variable name.
        key: String,
    },

    /// A log wait pattern failed to compile.
    #[error("Invalid log pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The pattern as given.
        pattern: String,
        /// Compilation error.
        #[source]
        source: regex::Error,
    },
}

/// Port table lookups and host port allocation.
#[derive(Debug, Error)]
pub enum PortError {
    /// The internal port was never exposed on this container.
    #[error("No binding for internal port {port}; was it exposed on the container?")]
    NotBound {
        /// Internal port that was looked up.
        port: u16,
    },

    /// Could not obtain a free host port.
    #[error("Failed to allocate host port: {reason}")]
    AllocationFailed {
        /// Reason for failure.
        reason: String,
    },
}

/// Failures of calls against the container runtime itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The engine could not be reached.
    #[error("Container runtime not available: {reason}")]
    NotAvailable {
        /// Reason why the runtime is unavailable.
        reason: String,
    },

    /// Failed to pull the image.
    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed {
        /// Image reference.
        image: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to create the container.
    #[error("Failed to create container from '{image}': {reason}")]
    ContainerCreationFailed {
        /// Image reference.
        image: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to start the container.
    #[error("Failed to start container '{id}': {reason}")]
    ContainerStartFailed {
        /// Container id.
        id: String,
        /// Reason for failure.
        reason: String,
    },

    /// The container does not exist (never created, or removed underneath us).
    #[error("Container '{id}' not found")]
    NotFound {
        /// Container id or name.
        id: String,
    },

    /// An exec could not be created, run or inspected.
    #[error("Exec in container '{id}' failed: {reason}")]
    ExecFailed {
        /// Container id.
        id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Any other engine API failure.
    #[error("Container runtime error during {operation}: {reason}")]
    Api {
        /// Which call failed.
        operation: &'static str,
        /// Reason for failure.
        reason: String,
    },
}

impl RuntimeError {
    /// Whether waiting longer cannot fix this error.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// Wait strategy terminal failures.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Probes did not all succeed within the startup timeout.
    #[error(
        "Container not ready after {timeout:?} ({attempts} attempts); never succeeded: {}",
        .pending.join(", ")
    )]
    TimedOut {
        /// Effective startup timeout.
        timeout: Duration,
        /// Number of completed polling attempts.
        attempts: u32,
        /// Descriptions of probes that were still not ready.
        pending: Vec<String>,
    },

    /// A probe observed a state that will not resolve by waiting.
    #[error("Container will never become ready: {probe} reported {reason}")]
    Fatal {
        /// Description of the probe.
        probe: String,
        /// What it observed.
        reason: String,
    },
}

/// Top-level error returned by [`crate::Orchestrator`] and container handles.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl Error {
    /// The wait strategy ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Wait(WaitError::TimedOut { .. }))
    }

    /// The wait strategy gave up because readiness is impossible.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Wait(WaitError::Fatal { .. }))
    }

    /// A programming or configuration mistake by the caller.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Port(PortError::NotBound { .. })
        )
    }
}
