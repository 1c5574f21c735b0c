//! Readiness: probes and the wait strategies built from them.
//!
//! ```text
//!   Pending ──run()──▶ Polling ──all probes ready──────▶ Ready
//!                        │  ▲
//!                        │  └── not ready: sleep poll interval
//!                        ├──── a probe is fatal ────────▶ Fatal
//!                        └──── startup timeout passes ──▶ TimedOut
//! ```

pub mod log;
pub mod probe;
pub mod strategy;

pub use probe::{ActiveProbe, Probe, ProbeContext, ProbeOutcome};
pub use strategy::{
    DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT, Poller, WaitPhase, WaitStrategy,
};
