//! Container descriptions and the handles returned once they are ready.

mod request;
mod started;

pub use request::{ContainerRequest, ContainerRequestBuilder};
pub use started::{StartedContainer, StoppedContainer};
