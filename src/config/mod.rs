//! Configuration resolved from the environment.
//!
//! Every value has a default, so an empty environment yields a working
//! [`HarnessConfig`]. The binary loads `.env` before resolving.

mod harness;
pub(crate) mod helpers;

pub use harness::HarnessConfig;
