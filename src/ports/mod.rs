//! Internal/host port types, the bound port table and host port allocation.
//!
//! An [`InternalPort`] is what the containerized process listens on; a
//! [`HostPort`] is where that port is reachable on the machine running the
//! tests. They are distinct types so the two can never be swapped silently,
//! even when the numbers happen to be equal.

pub mod allocator;
pub mod bound;

use std::fmt;

use crate::error::ConfigError;

pub use allocator::PortAllocator;
pub use bound::BoundPorts;

macro_rules! port_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u16);

        impl $name {
            /// Validate a port number (1-65535).
            pub fn new(port: u16) -> Result<Self, ConfigError> {
                if port == 0 {
                    return Err(ConfigError::InvalidPort { port });
                }
                Ok(Self(port))
            }

            /// The raw port number.
            pub fn get(self) -> u16 {
                self.0
            }

            /// Used where the number comes from the OS or the engine, never zero.
            pub(crate) fn from_raw(port: u16) -> Self {
                Self(port)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<u16> for $name {
            type Error = ConfigError;

            fn try_from(port: u16) -> Result<Self, Self::Error> {
                Self::new(port)
            }
        }
    };
}

port_type!(
    /// A port as declared by the image or container.
    InternalPort
);

port_type!(
    /// A port bound on the machine running the tests.
    HostPort
);

/// Where the host side of an exposed port comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    /// Ask the allocator for a free port.
    Random,
    /// Use this host port as given, without checking it.
    Fixed(HostPort),
}

/// One port a container wants reachable from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposedPort {
    pub internal: InternalPort,
    pub source: PortSource,
}

impl ExposedPort {
    /// Expose on a randomly allocated host port.
    pub fn random(internal: InternalPort) -> Self {
        Self {
            internal,
            source: PortSource::Random,
        }
    }

    /// Expose on a fixed host port.
    pub fn fixed(internal: InternalPort, host: HostPort) -> Self {
        Self {
            internal,
            source: PortSource::Fixed(host),
        }
    }
}
