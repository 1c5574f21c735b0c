//! The internal-to-host port mapping for one container.

use crate::error::PortError;
use crate::ports::{HostPort, InternalPort};

/// Authoritative internal port to host port mapping for a container.
///
/// Iteration yields bindings in the order they were first added. Setting a
/// binding for a key that already exists replaces the host port in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundPorts {
    bindings: Vec<(InternalPort, HostPort)>,
}

impl BoundPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `internal` to `host`, returning the updated table.
    pub fn set_binding(mut self, internal: InternalPort, host: HostPort) -> Self {
        match self.bindings.iter_mut().find(|(k, _)| *k == internal) {
            Some(entry) => entry.1 = host,
            None => self.bindings.push((internal, host)),
        }
        self
    }

    /// Look up the host port for `internal`.
    ///
    /// Asking for a port that was never exposed is a caller bug, so this
    /// fails with [`PortError::NotBound`] instead of falling back to anything.
    pub fn get_binding(&self, internal: InternalPort) -> Result<HostPort, PortError> {
        self.bindings
            .iter()
            .find(|(k, _)| *k == internal)
            .map(|(_, host)| *host)
            .ok_or(PortError::NotBound {
                port: internal.get(),
            })
    }

    /// `(internal, host)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (InternalPort, HostPort)> + '_ {
        self.bindings.iter().copied()
    }

    pub fn internal_ports(&self) -> impl Iterator<Item = InternalPort> + '_ {
        self.bindings.iter().map(|(internal, _)| *internal)
    }

    pub fn host_ports(&self) -> impl Iterator<Item = HostPort> + '_ {
        self.bindings.iter().map(|(_, host)| *host)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl FromIterator<(InternalPort, HostPort)> for BoundPorts {
    fn from_iter<I: IntoIterator<Item = (InternalPort, HostPort)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(BoundPorts::new(), |ports, (internal, host)| {
                ports.set_binding(internal, host)
            })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn internal(p: u16) -> InternalPort {
        InternalPort::new(p).unwrap()
    }

    fn host(p: u16) -> HostPort {
        HostPort::new(p).unwrap()
    }

    #[test]
    fn test_get_binding_returns_latest_value() {
        let ports = BoundPorts::new()
            .set_binding(internal(80), host(32768))
            .set_binding(internal(443), host(32769))
            .set_binding(internal(80), host(40000));

        assert_eq!(ports.get_binding(internal(80)).unwrap(), host(40000));
        assert_eq!(ports.get_binding(internal(443)).unwrap(), host(32769));
        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn test_unbound_port_is_not_found() {
        let ports = BoundPorts::new().set_binding(internal(80), host(8080));

        let err = ports.get_binding(internal(81)).unwrap_err();
        assert!(matches!(err, PortError::NotBound { port: 81 }));
    }

    #[test]
    fn test_internal_and_host_numbers_do_not_alias() {
        let ports = BoundPorts::new().set_binding(internal(8080), host(80));

        // Host port 80 is not an internal port of this container.
        assert!(ports.get_binding(internal(80)).is_err());
    }

    #[test]
    fn test_iteration_keeps_insertion_order() {
        let ports: BoundPorts = [
            (internal(9000), host(1)),
            (internal(22), host(2)),
            (internal(5432), host(3)),
        ]
        .into_iter()
        .collect();

        let keys: Vec<u16> = ports.internal_ports().map(InternalPort::get).collect();
        assert_eq!(keys, vec![9000, 22, 5432]);

        // Rebinding keeps the original position.
        let ports = ports.set_binding(internal(22), host(7));
        let pairs: Vec<(u16, u16)> = ports.iter().map(|(i, h)| (i.get(), h.get())).collect();
        assert_eq!(pairs, vec![(9000, 1), (22, 7), (5432, 3)]);
    }

    #[test]
    fn test_empty_table() {
        let ports = BoundPorts::new();
        assert!(ports.is_empty());
        assert_eq!(ports.iter().count(), 0);
    }
}
