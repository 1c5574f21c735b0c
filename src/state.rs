//! Normalized, point-in-time view of a container inspection.
//!
//! A [`ContainerState`] is derived from one raw engine inspection and never
//! updated afterwards. Anything that needs current state inspects again.

use std::fmt;

use bollard::models::{ContainerInspectResponse, HealthStatusEnum};

use crate::ports::{HostPort, InternalPort};

/// Health as reported by the engine's own health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// The container declares no health check.
    #[default]
    None,
    Starting,
    Unhealthy,
    Healthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::None => "none",
            HealthStatus::Starting => "starting",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Healthy => "healthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HealthStatusEnum> for HealthStatus {
    fn from(status: HealthStatusEnum) -> Self {
        match status {
            HealthStatusEnum::STARTING => HealthStatus::Starting,
            HealthStatusEnum::HEALTHY => HealthStatus::Healthy,
            HealthStatusEnum::UNHEALTHY => HealthStatus::Unhealthy,
            HealthStatusEnum::NONE | HealthStatusEnum::EMPTY => HealthStatus::None,
        }
    }
}

/// Snapshot of a container's network and health state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Address of the container on its network ("" when it has none).
    pub internal_ip: String,
    /// Exposed ports, ascending.
    pub internal_ports: Vec<InternalPort>,
    /// Host ports of the bound entries, in the order of their internal ports.
    pub host_ports: Vec<HostPort>,
    /// Container name without the engine's leading `/`.
    pub name: String,
    pub health: HealthStatus,
    /// Whether the engine reports the main process as running.
    pub running: bool,
}

impl ContainerState {
    /// Derive a snapshot from a raw inspection.
    ///
    /// Internal ports come from the keys of the port map with the protocol
    /// suffix stripped. Only entries with a binding list contribute a host
    /// port. Entries that fail to parse are skipped.
    pub fn from_inspection(inspection: &ContainerInspectResponse) -> Self {
        let network = inspection.network_settings.as_ref();

        let mut entries: Vec<(InternalPort, Option<HostPort>)> = network
            .and_then(|n| n.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|(key, bindings)| {
                        let internal = parse_internal_port(key)?;
                        let host = bindings
                            .as_ref()
                            .and_then(|b| b.first())
                            .and_then(|b| b.host_port.as_deref())
                            .and_then(parse_host_port);
                        Some((internal, host))
                    })
                    .collect()
            })
            .unwrap_or_default();
        // `80/tcp` and `80/udp` share an internal port; bound entries sort first.
        entries.sort_by_key(|(internal, host)| (*internal, host.is_none()));

        let mut internal_ports: Vec<InternalPort> =
            entries.iter().map(|(internal, _)| *internal).collect();
        internal_ports.dedup();
        let mut host_ports: Vec<HostPort> = entries.iter().filter_map(|(_, host)| *host).collect();
        host_ports.dedup();

        let internal_ip = network
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                // User-defined networks leave the top-level address empty.
                network
                    .and_then(|n| n.networks.as_ref())
                    .and_then(|nets| {
                        let mut names: Vec<&String> = nets.keys().collect();
                        names.sort();
                        names
                            .into_iter()
                            .filter_map(|name| nets[name].ip_address.clone())
                            .find(|ip| !ip.is_empty())
                    })
            })
            .unwrap_or_default();

        let state = inspection.state.as_ref();
        let health = state
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status)
            .map(HealthStatus::from)
            .unwrap_or_default();

        Self {
            internal_ip,
            internal_ports,
            host_ports,
            name: inspection
                .name
                .as_deref()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            health,
            running: state.and_then(|s| s.running).unwrap_or(false),
        }
    }
}

/// `"8080/tcp"` (or a bare `"8080"`) to an internal port.
fn parse_internal_port(key: &str) -> Option<InternalPort> {
    let number = key.split('/').next()?;
    match number.parse::<u16>().ok().map(InternalPort::new) {
        Some(Ok(port)) => Some(port),
        _ => {
            tracing::debug!("Skipping unparseable exposed port '{}'", key);
            None
        }
    }
}

fn parse_host_port(value: &str) -> Option<HostPort> {
    match value.parse::<u16>().ok().map(HostPort::new) {
        Some(Ok(port)) => Some(port),
        _ => {
            tracing::debug!("Skipping unparseable host port '{}'", value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn inspection(json: serde_json::Value) -> ContainerInspectResponse {
        serde_json::from_value(json).unwrap()
    }

    fn ports(values: &[u16]) -> Vec<u16> {
        values.to_vec()
    }

    #[test]
    fn test_bound_and_unbound_ports() {
        let raw = inspection(serde_json::json!({
            "Id": "abc123",
            "Name": "/eager_turing",
            "State": { "Running": true },
            "NetworkSettings": {
                "IPAddress": "172.17.0.2",
                "Ports": {
                    "80/tcp": [{ "HostIp": "0.0.0.0", "HostPort": "8080" }],
                    "443/tcp": null
                }
            }
        }));

        let state = ContainerState::from_inspection(&raw);

        assert_eq!(
            state.internal_ports.iter().map(|p| p.get()).collect::<Vec<_>>(),
            ports(&[80, 443])
        );
        assert_eq!(
            state.host_ports.iter().map(|p| p.get()).collect::<Vec<_>>(),
            ports(&[8080])
        );
        assert_eq!(state.internal_ip, "172.17.0.2");
        assert_eq!(state.name, "eager_turing");
        assert!(state.running);
    }

    #[test]
    fn test_health_defaults_to_none() {
        let raw = inspection(serde_json::json!({
            "Name": "/plain",
            "State": { "Running": true }
        }));

        let state = ContainerState::from_inspection(&raw);
        assert_eq!(state.health, HealthStatus::None);
        assert!(state.internal_ports.is_empty());
        assert!(state.host_ports.is_empty());
        assert_eq!(state.internal_ip, "");
    }

    #[test]
    fn test_health_status_values() {
        for (raw_status, expected) in [
            ("starting", HealthStatus::Starting),
            ("healthy", HealthStatus::Healthy),
            ("unhealthy", HealthStatus::Unhealthy),
            ("none", HealthStatus::None),
        ] {
            let raw = inspection(serde_json::json!({
                "State": { "Running": true, "Health": { "Status": raw_status } }
            }));
            assert_eq!(ContainerState::from_inspection(&raw).health, expected);
        }
    }

    #[test]
    fn test_ip_falls_back_to_attached_network() {
        let raw = inspection(serde_json::json!({
            "NetworkSettings": {
                "IPAddress": "",
                "Networks": {
                    "test-net": { "IPAddress": "10.1.0.5" }
                }
            }
        }));

        assert_eq!(ContainerState::from_inspection(&raw).internal_ip, "10.1.0.5");
    }

    #[test]
    fn test_udp_suffix_and_garbage_keys() {
        let json = serde_json::json!({
            "NetworkSettings": {
                "Ports": {
                    "53/udp": [{ "HostPort": "5353" }],
                    "80/tcp": [{ "HostPort": "8080" }],
                    "80/udp": null,
                    "not-a-port/tcp": [{ "HostPort": "1" }],
                    "9000/tcp": []
                }
            }
        });

        // Each map gets its own hash order; the result must not depend on it.
        for _ in 0..20 {
            let state = ContainerState::from_inspection(&inspection(json.clone()));
            assert_eq!(
                state.internal_ports.iter().map(|p| p.get()).collect::<Vec<_>>(),
                ports(&[53, 80, 9000])
            );
            assert_eq!(
                state.host_ports.iter().map(|p| p.get()).collect::<Vec<_>>(),
                ports(&[5353, 8080])
            );
        }
    }
}
