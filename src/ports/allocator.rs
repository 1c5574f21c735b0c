//! Free host port allocation.
//!
//! Ports are found by binding port 0 and letting the OS choose, then
//! releasing the listener so the container engine can bind the port itself.
//! Between release and the engine's bind another process may grab the port;
//! nothing here can prevent that, and the engine's own bind error is what
//! the caller sees if it happens.
//!
//! Within this process the race is closed by a reservation set: a port
//! handed out stays reserved until [`PortAllocator::release`] is called, so
//! concurrent start attempts never receive the same port.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, LazyLock, Mutex};

use futures::future::{join_all, try_join_all};
use tokio::net::TcpListener;

use crate::error::PortError;
use crate::ports::{BoundPorts, ExposedPort, HostPort, PortSource};

/// Attempts before giving up on finding an unreserved port.
const MAX_ATTEMPTS: usize = 64;

static SHARED: LazyLock<PortAllocator> = LazyLock::new(PortAllocator::new);

/// Hands out host ports that were free at allocation time.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    /// An allocator with its own reservation set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide allocator.
    ///
    /// The OS port space is shared by everything in the process, so this is
    /// what orchestrators use unless told otherwise.
    pub fn shared() -> Self {
        SHARED.clone()
    }

    /// Allocate `count` distinct free host ports.
    pub async fn allocate(&self, count: usize) -> Result<Vec<HostPort>, PortError> {
        try_join_all((0..count).map(|_| self.allocate_one())).await
    }

    /// Allocate a single free host port.
    pub async fn allocate_one(&self) -> Result<HostPort, PortError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));

        for _ in 0..MAX_ATTEMPTS {
            let listener =
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| PortError::AllocationFailed {
                        reason: format!("bind to {}: {}", addr, e),
                    })?;
            let port = listener
                .local_addr()
                .map_err(|e| PortError::AllocationFailed {
                    reason: e.to_string(),
                })?
                .port();

            if self.reserve(port) {
                // Listener drops here, freeing the port for the engine.
                tracing::trace!("Allocated host port {}", port);
                return Ok(HostPort::from_raw(port));
            }
            tracing::trace!("Host port {} already reserved, retrying", port);
        }

        Err(PortError::AllocationFailed {
            reason: format!("no unreserved port after {} attempts", MAX_ATTEMPTS),
        })
    }

    /// Pair each exposed port with its host port, in declaration order.
    ///
    /// Random ports are allocated concurrently; fixed ports pass through.
    pub async fn resolve(&self, exposed: &[ExposedPort]) -> Result<BoundPorts, PortError> {
        let results = join_all(exposed.iter().map(|port| async move {
            match port.source {
                PortSource::Fixed(host) => Ok(host),
                PortSource::Random => self.allocate_one().await,
            }
        }))
        .await;

        if let Some(pos) = results.iter().position(Result::is_err) {
            // Whatever did get allocated is useless without the rest.
            let allocated = exposed
                .iter()
                .zip(&results)
                .filter(|(port, _)| port.source == PortSource::Random)
                .filter_map(|(_, result)| result.as_ref().ok().copied());
            self.release(allocated);
            return Err(results
                .into_iter()
                .nth(pos)
                .and_then(Result::err)
                .unwrap_or(PortError::AllocationFailed {
                    reason: "unknown allocation failure".to_string(),
                }));
        }

        Ok(exposed
            .iter()
            .zip(results.into_iter().flatten())
            .map(|(port, host)| (port.internal, host))
            .collect())
    }

    /// Return ports to the pool.
    pub fn release(&self, ports: impl IntoIterator<Item = HostPort>) {
        let mut reserved = self.lock();
        for port in ports {
            reserved.remove(&port.get());
        }
    }

    /// Whether `port` is currently handed out.
    pub fn is_reserved(&self, port: HostPort) -> bool {
        self.lock().contains(&port.get())
    }

    fn reserve(&self, port: u16) -> bool {
        self.lock().insert(port)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }
}
