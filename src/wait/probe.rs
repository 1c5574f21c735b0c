//! Readiness probes.
//!
//! A [`Probe`] is the immutable description attached to a wait strategy.
//! [`ActiveProbe`] is its per-wait instance; only the log probe carries state
//! between polls.

use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tokio::net::TcpStream;

use crate::error::RuntimeError;
use crate::ports::{BoundPorts, HostPort, InternalPort};
use crate::runtime::{ContainerId, ContainerRuntime};
use crate::state::{ContainerState, HealthStatus};
use crate::wait::log::LogWatch;

/// Per-attempt TCP connect timeout for host port checks.
const HOST_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a probe may look at.
pub struct ProbeContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub container_id: &'a ContainerId,
    /// Host name where bound host ports are reachable.
    pub host: &'a str,
    pub bound_ports: &'a BoundPorts,
    /// Snapshot taken right after start.
    pub state: &'a ContainerState,
}

/// Result of one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    /// Not ready yet; the detail says what was observed.
    NotReady(String),
    /// The check itself errored. Counts as not ready.
    Failed(String),
    /// Waiting longer cannot help.
    Fatal(String),
}

/// A single readiness check.
#[derive(Debug, Clone)]
pub enum Probe {
    /// Every bound host port accepts TCP connections from here.
    HostPort,
    /// Every bound internal port is listening inside the container.
    InternalPort,
    /// The container's output has matched `pattern` on `times` lines.
    LogMessage { pattern: Regex, times: usize },
    /// The engine's health check reports healthy.
    HealthCheck,
    /// `cmd` run inside the container exits with `expected_exit_code`.
    Command {
        cmd: Vec<String>,
        expected_exit_code: i64,
    },
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::HostPort => f.write_str("host port reachability"),
            Probe::InternalPort => f.write_str("internal port listening"),
            Probe::LogMessage { pattern, times } if *times > 1 => {
                write!(f, "log message /{}/ x{}", pattern, times)
            }
            Probe::LogMessage { pattern, .. } => write!(f, "log message /{}/", pattern),
            Probe::HealthCheck => f.write_str("health check"),
            Probe::Command {
                cmd,
                expected_exit_code,
            } => write!(f, "command `{}` exit {}", cmd.join(" "), expected_exit_code),
        }
    }
}

impl Probe {
    pub(crate) fn activate(&self) -> ActiveProbe {
        let log = match self {
            Probe::LogMessage { pattern, times } => Some(LogWatch::new(pattern.clone(), *times)),
            _ => None,
        };
        ActiveProbe {
            probe: self.clone(),
            log,
        }
    }
}

/// A probe being polled during one wait.
#[derive(Debug)]
pub struct ActiveProbe {
    probe: Probe,
    log: Option<LogWatch>,
}

impl ActiveProbe {
    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    pub async fn check(&mut self, ctx: &ProbeContext<'_>) -> ProbeOutcome {
        if let Some(log) = self.log.as_mut() {
            return log.check(ctx).await;
        }
        match &self.probe {
            Probe::HostPort => check_host_ports(ctx).await,
            Probe::InternalPort => check_internal_ports(ctx).await,
            Probe::HealthCheck => check_health(ctx).await,
            Probe::Command {
                cmd,
                expected_exit_code,
            } => check_command(ctx, cmd, *expected_exit_code).await,
            // Always has a LogWatch.
            Probe::LogMessage { .. } => ProbeOutcome::Failed("log watch missing".to_string()),
        }
    }
}

async fn check_host_ports(ctx: &ProbeContext<'_>) -> ProbeOutcome {
    let checks = ctx
        .bound_ports
        .host_ports()
        .map(|port| check_host_port(ctx.host, port));
    combine(join_all(checks).await)
}

async fn check_host_port(host: &str, port: HostPort) -> ProbeOutcome {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(HOST_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => ProbeOutcome::Ready,
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            ProbeOutcome::NotReady(format!("{}: connection refused", addr))
        }
        Ok(Err(e)) => ProbeOutcome::Failed(format!("{}: {}", addr, e)),
        Err(_) => ProbeOutcome::NotReady(format!("{}: connect timed out", addr)),
    }
}

async fn check_internal_ports(ctx: &ProbeContext<'_>) -> ProbeOutcome {
    let target = if ctx.state.internal_ip.is_empty() {
        "localhost"
    } else {
        ctx.state.internal_ip.as_str()
    };
    let checks = ctx
        .bound_ports
        .internal_ports()
        .map(|port| check_internal_port(ctx, target, port));
    combine(join_all(checks).await)
}

/// Commands tried in order; the port is listening if any exits 0.
///
/// Images differ in what they ship, so a `/proc` listen-table lookup comes
/// first, then `nc`, then bash's `/dev/tcp`.
pub(crate) fn internal_port_commands(target: &str, port: InternalPort) -> Vec<Vec<String>> {
    let hex = format!("{:04X}", port.get());
    vec![
        shell(
            "/bin/sh",
            format!("cat /proc/net/tcp* | awk '{{print $2}}' | grep -i ':{}'", hex),
        ),
        shell("/bin/sh", format!("nc -vz -w 1 {} {}", target, port)),
        shell("/bin/bash", format!("</dev/tcp/{}/{}", target, port)),
    ]
}

fn shell(sh: &str, script: String) -> Vec<String> {
    vec![sh.to_string(), "-c".to_string(), script]
}

async fn check_internal_port(
    ctx: &ProbeContext<'_>,
    target: &str,
    port: InternalPort,
) -> ProbeOutcome {
    let mut last_error = None;
    for cmd in internal_port_commands(target, port) {
        match ctx.runtime.exec(ctx.container_id, &cmd).await {
            Ok(result) if result.exit_code == 0 => return ProbeOutcome::Ready,
            Ok(_) => {}
            Err(e) if e.is_unrecoverable() => return ProbeOutcome::Fatal(e.to_string()),
            Err(e) => last_error = Some(e),
        }
    }
    match last_error {
        Some(e) => ProbeOutcome::Failed(format!("port {}: {}", port, e)),
        None => ProbeOutcome::NotReady(format!("port {} not listening", port)),
    }
}

async fn check_health(ctx: &ProbeContext<'_>) -> ProbeOutcome {
    let inspection = match ctx.runtime.inspect_container(ctx.container_id).await {
        Ok(inspection) => inspection,
        Err(e) => return runtime_failure(e),
    };
    let state = ContainerState::from_inspection(&inspection);

    match state.health {
        HealthStatus::Healthy => ProbeOutcome::Ready,
        HealthStatus::Unhealthy => ProbeOutcome::Fatal("status unhealthy".to_string()),
        HealthStatus::None => {
            ProbeOutcome::Fatal("container declares no health check".to_string())
        }
        HealthStatus::Starting if !state.running => {
            ProbeOutcome::Fatal("container exited before becoming healthy".to_string())
        }
        HealthStatus::Starting => ProbeOutcome::NotReady("status starting".to_string()),
    }
}

async fn check_command(ctx: &ProbeContext<'_>, cmd: &[String], expected: i64) -> ProbeOutcome {
    match ctx.runtime.exec(ctx.container_id, cmd).await {
        Ok(result) if result.exit_code == expected => ProbeOutcome::Ready,
        Ok(result) => ProbeOutcome::NotReady(format!("exit code {}", result.exit_code)),
        Err(e) => runtime_failure(e),
    }
}

fn runtime_failure(e: RuntimeError) -> ProbeOutcome {
    if e.is_unrecoverable() {
        ProbeOutcome::Fatal(e.to_string())
    } else {
        ProbeOutcome::Failed(e.to_string())
    }
}

/// AND of per-port outcomes: the first fatal, else the first not-ready.
fn combine(outcomes: Vec<ProbeOutcome>) -> ProbeOutcome {
    let mut pending = None;
    for outcome in outcomes {
        match outcome {
            ProbeOutcome::Ready => {}
            ProbeOutcome::Fatal(_) => return outcome,
            other => {
                pending.get_or_insert(other);
            }
        }
    }
    pending.unwrap_or(ProbeOutcome::Ready)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    use super::*;
    use crate::runtime::ExecResult;
    use crate::testing::FakeRuntime;

    fn state() -> ContainerState {
        ContainerState {
            internal_ip: "172.17.0.2".to_string(),
            internal_ports: vec![],
            host_ports: vec![],
            name: "probe-test".to_string(),
            health: HealthStatus::None,
            running: true,
        }
    }

    #[tokio::test]
    async fn test_host_port_probe_ready_and_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = HostPort::new(listener.local_addr().unwrap().port()).unwrap();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            HostPort::new(l.local_addr().unwrap().port()).unwrap()
        };

        assert_eq!(check_host_port("127.0.0.1", open).await, ProbeOutcome::Ready);
        assert!(matches!(
            check_host_port("127.0.0.1", closed).await,
            ProbeOutcome::NotReady(_)
        ));
    }

    #[tokio::test]
    async fn test_internal_port_probe_tries_fallback_commands() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.on_exec(|cmd| ExecResult {
            output: String::new(),
            exit_code: if cmd[2].starts_with("nc ") { 0 } else { 1 },
        });
        let id = runtime.seed_running_container("probe-test");
        let bound = BoundPorts::new().set_binding(
            InternalPort::new(8080).unwrap(),
            HostPort::new(40000).unwrap(),
        );
        let state = state();
        let ctx = ProbeContext {
            runtime: runtime.as_ref(),
            container_id: &id,
            host: "localhost",
            bound_ports: &bound,
            state: &state,
        };

        let mut probe = Probe::InternalPort.activate();
        assert_eq!(probe.check(&ctx).await, ProbeOutcome::Ready);

        let calls = runtime.exec_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0][2].contains(":1F90"));
        assert_eq!(calls[1][2], "nc -vz -w 1 172.17.0.2 8080");
    }

    #[tokio::test]
    async fn test_command_probe_expected_exit_code() {
        let runtime = FakeRuntime::new();
        runtime.on_exec(|_| ExecResult {
            output: "pong".to_string(),
            exit_code: 3,
        });
        let id = runtime.seed_running_container("cmd-test");
        let bound = BoundPorts::new();
        let state = state();
        let ctx = ProbeContext {
            runtime: &runtime,
            container_id: &id,
            host: "localhost",
            bound_ports: &bound,
            state: &state,
        };

        let cmd = vec!["check".to_string()];
        assert_eq!(
            check_command(&ctx, &cmd, 3).await,
            ProbeOutcome::Ready
        );
        assert_eq!(
            check_command(&ctx, &cmd, 0).await,
            ProbeOutcome::NotReady("exit code 3".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_container_is_fatal() {
        let runtime = FakeRuntime::new();
        let id = ContainerId::new("gone");
        let bound = BoundPorts::new();
        let state = state();
        let ctx = ProbeContext {
            runtime: &runtime,
            container_id: &id,
            host: "localhost",
            bound_ports: &bound,
            state: &state,
        };

        assert!(matches!(
            check_health(&ctx).await,
            ProbeOutcome::Fatal(_)
        ));
        assert!(matches!(
            check_command(&ctx, &["true".to_string()], 0).await,
            ProbeOutcome::Fatal(_)
        ));
    }

    #[test]
    fn test_combine() {
        assert_eq!(combine(vec![]), ProbeOutcome::Ready);
        assert_eq!(
            combine(vec![
                ProbeOutcome::Ready,
                ProbeOutcome::NotReady("a".into()),
                ProbeOutcome::Fatal("b".into()),
            ]),
            ProbeOutcome::Fatal("b".into())
        );
        assert_eq!(
            combine(vec![
                ProbeOutcome::Failed("x".into()),
                ProbeOutcome::NotReady("y".into()),
            ]),
            ProbeOutcome::Failed("x".into())
        );
    }

    #[test]
    fn test_probe_display() {
        let probe = Probe::LogMessage {
            pattern: Regex::new("ready").unwrap(),
            times: 2,
        };
        assert_eq!(probe.to_string(), "log message /ready/ x2");
        assert_eq!(Probe::HealthCheck.to_string(), "health check");
    }
}
