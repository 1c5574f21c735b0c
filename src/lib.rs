//! Disposable Docker containers for integration tests.
//!
//! Describe a container with [`ContainerRequest`], hand it to an
//! [`Orchestrator`], and get back a [`StartedContainer`] only once its
//! [`WaitStrategy`] says it is ready:
//!
//! ```rust,no_run
//! use testbay::{ContainerRequest, Orchestrator, StopOptions, WaitStrategy};
//!
//! # async fn example() -> testbay::Result<()> {
//! let orchestrator = Orchestrator::connect_local().await?;
//! let redis = orchestrator
//!     .start(
//!         ContainerRequest::builder("redis:7-alpine")
//!             .with_exposed_ports([6379])
//!             .with_wait_strategy(WaitStrategy::for_log_message("Ready to accept connections")?)
//!             .build()?,
//!     )
//!     .await?;
//!
//! let url = format!("redis://{}:{}", redis.host(), redis.mapped_port(6379)?);
//! # let _ = url;
//! redis.stop(StopOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod container;
pub mod detect;
pub mod error;
pub mod orchestrator;
pub mod ports;
pub mod runtime;
pub mod state;
pub mod testing;
pub mod wait;

pub use config::HarnessConfig;
pub use container::{ContainerRequest, ContainerRequestBuilder, StartedContainer, StoppedContainer};
pub use error::{ConfigError, Error, PortError, Result, RuntimeError, WaitError};
pub use orchestrator::Orchestrator;
pub use ports::{HostPort, InternalPort, PortAllocator};
pub use runtime::{
    BindMode, ContainerRuntime, DockerRuntime, ExecResult, HealthCheck, RegistryAuth,
    RemoveOptions, StopOptions,
};
pub use state::{ContainerState, HealthStatus};
pub use wait::{Probe, WaitStrategy};
