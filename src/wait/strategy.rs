//! Wait strategies and the polling loop that runs them.

use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tokio::time::Instant;

use crate::error::{ConfigError, WaitError};
use crate::wait::probe::{ActiveProbe, Probe, ProbeContext, ProbeOutcome};

/// Delay between polling attempts unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Startup timeout unless configured otherwise.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// How to decide that a container is ready.
///
/// A strategy is a set of probes that must all report ready (AND), plus
/// optional timing overrides. It is immutable once attached to a request;
/// each start attempt gets a fresh [`Poller`].
#[derive(Debug, Clone, Default)]
pub struct WaitStrategy {
    probes: Vec<Probe>,
    startup_timeout: Option<Duration>,
    poll_interval: Option<Duration>,
}

impl WaitStrategy {
    /// Wait until every bound port accepts connections from the host and
    /// is listening inside the container. Used when no strategy is set.
    pub fn for_listening_ports() -> Self {
        Self::from_probes([Probe::HostPort, Probe::InternalPort])
    }

    /// Wait until every bound host port accepts connections.
    pub fn for_host_ports() -> Self {
        Self::from_probes([Probe::HostPort])
    }

    /// Wait until a log line matches `pattern`.
    pub fn for_log_message(pattern: &str) -> Result<Self, ConfigError> {
        Self::for_log_message_times(pattern, 1)
    }

    /// Wait until `times` log lines match `pattern`.
    pub fn for_log_message_times(pattern: &str, times: usize) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self::from_probes([Probe::LogMessage {
            pattern: regex,
            times: times.max(1),
        }]))
    }

    /// Wait until the engine's health check reports healthy.
    pub fn for_health_check() -> Self {
        Self::from_probes([Probe::HealthCheck])
    }

    /// Wait until `cmd` exits 0 inside the container.
    pub fn for_successful_command<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::for_command_exit_code(cmd, 0)
    }

    /// Wait until `cmd` exits with `exit_code` inside the container.
    pub fn for_command_exit_code<I, S>(cmd: I, exit_code: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_probes([Probe::Command {
            cmd: cmd.into_iter().map(Into::into).collect(),
            expected_exit_code: exit_code,
        }])
    }

    pub fn from_probes(probes: impl IntoIterator<Item = Probe>) -> Self {
        Self {
            probes: probes.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Require `other`'s probes as well. Timing set on `self` wins.
    pub fn and(mut self, other: WaitStrategy) -> Self {
        self.probes.extend(other.probes);
        self.startup_timeout = self.startup_timeout.or(other.startup_timeout);
        self.poll_interval = self.poll_interval.or(other.poll_interval);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    /// A fresh poller; unset timing falls back to the given defaults.
    pub fn poller(&self, default_timeout: Duration, default_interval: Duration) -> Poller {
        Poller {
            probes: self.probes.iter().map(Probe::activate).collect(),
            timeout: self.startup_timeout.unwrap_or(default_timeout),
            interval: self.poll_interval.unwrap_or(default_interval),
            phase: WaitPhase::Pending,
            attempts: 0,
        }
    }
}

/// Where a [`Poller`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    Pending,
    Polling,
    Ready,
    TimedOut,
    Fatal,
}

impl WaitPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WaitPhase::Ready | WaitPhase::TimedOut | WaitPhase::Fatal)
    }
}

enum Attempt {
    Ready,
    Pending(Vec<String>),
    Fatal { probe: String, reason: String },
}

/// Runs a wait strategy's probes until they are all ready, one is fatal,
/// or the startup timeout passes.
#[derive(Debug)]
pub struct Poller {
    probes: Vec<ActiveProbe>,
    timeout: Duration,
    interval: Duration,
    phase: WaitPhase,
    attempts: u32,
}

impl Poller {
    pub fn phase(&self) -> WaitPhase {
        self.phase
    }

    /// Attempts that completed.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll until a terminal phase.
    ///
    /// The timeout is measured in wall-clock time from entering `Polling`.
    /// An attempt still in flight when it passes is dropped and its result
    /// never observed; no attempt starts after it.
    pub async fn run(&mut self, ctx: &ProbeContext<'_>) -> Result<(), WaitError> {
        match self.phase {
            WaitPhase::Ready => return Ok(()),
            WaitPhase::TimedOut => return Err(self.timed_out(self.all_probe_names())),
            WaitPhase::Fatal => {
                return Err(WaitError::Fatal {
                    probe: "wait strategy".to_string(),
                    reason: "already failed".to_string(),
                });
            }
            WaitPhase::Pending | WaitPhase::Polling => {}
        }

        self.transition(WaitPhase::Polling);
        let deadline = Instant::now() + self.timeout;
        let mut pending = self.all_probe_names();

        loop {
            let outcome = match tokio::time::timeout_at(deadline, self.attempt(ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => break,
            };
            self.attempts += 1;

            match outcome {
                Attempt::Ready => {
                    self.transition(WaitPhase::Ready);
                    return Ok(());
                }
                Attempt::Fatal { probe, reason } => {
                    self.transition(WaitPhase::Fatal);
                    return Err(WaitError::Fatal { probe, reason });
                }
                Attempt::Pending(names) => pending = names,
            }

            let next = Instant::now() + self.interval;
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            tokio::time::sleep_until(next).await;
        }

        self.transition(WaitPhase::TimedOut);
        Err(self.timed_out(pending))
    }

    async fn attempt(&mut self, ctx: &ProbeContext<'_>) -> Attempt {
        let outcomes = join_all(self.probes.iter_mut().map(|p| p.check(ctx))).await;

        let mut pending = Vec::new();
        for (probe, outcome) in self.probes.iter().zip(outcomes) {
            match outcome {
                ProbeOutcome::Ready => {}
                ProbeOutcome::NotReady(detail) => {
                    tracing::trace!("Probe {} not ready: {}", probe.probe(), detail);
                    pending.push(format!("{} ({})", probe.probe(), detail));
                }
                ProbeOutcome::Failed(reason) => {
                    tracing::debug!("Probe {} errored: {}", probe.probe(), reason);
                    pending.push(format!("{} ({})", probe.probe(), reason));
                }
                ProbeOutcome::Fatal(reason) => {
                    return Attempt::Fatal {
                        probe: probe.probe().to_string(),
                        reason,
                    };
                }
            }
        }

        if pending.is_empty() {
            Attempt::Ready
        } else {
            Attempt::Pending(pending)
        }
    }

    fn transition(&mut self, next: WaitPhase) {
        tracing::debug!("Wait strategy {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn all_probe_names(&self) -> Vec<String> {
        self.probes.iter().map(|p| p.probe().to_string()).collect()
    }

    fn timed_out(&self, pending: Vec<String>) -> WaitError {
        WaitError::TimedOut {
            timeout: self.timeout,
            attempts: self.attempts,
            pending,
        }
    }
}
