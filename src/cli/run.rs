use std::time::Duration;

use anyhow::Context;
use clap::Args;
use testbay::{ContainerRequest, HealthStatus, Orchestrator, WaitStrategy};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image to run, optionally with a tag (redis:7)
    #[arg(long)]
    pub image: String,

    /// Internal port to expose on a random host port (repeatable)
    #[arg(short = 'p', long = "port")]
    pub ports: Vec<u16>,

    /// Fixed mapping HOST:INTERNAL (repeatable)
    #[arg(long)]
    pub publish: Vec<String>,

    /// Environment variable KEY=VALUE (repeatable)
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Container name
    #[arg(long)]
    pub name: Option<String>,

    /// Wait for a log line matching this regex
    #[arg(long)]
    pub wait_log: Option<String>,

    /// How many matching log lines to wait for
    #[arg(long, default_value_t = 1)]
    pub wait_log_times: usize,

    /// Wait for the image's health check to report healthy
    #[arg(long)]
    pub wait_health: bool,

    /// Wait for this shell command to exit 0 inside the container
    #[arg(long)]
    pub wait_cmd: Option<String>,

    /// Startup timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Leave the container running on exit
    #[arg(long)]
    pub keep: bool,

    /// Command to run instead of the image default
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

impl RunArgs {
    fn request(&self) -> anyhow::Result<ContainerRequest> {
        let mut builder =
            ContainerRequest::builder(&self.image).with_exposed_ports(self.ports.iter().copied());

        for mapping in &self.publish {
            let (host, internal) = parse_mapping(mapping)?;
            builder = builder.with_exposed_port_mapping(internal, host);
        }
        for pair in &self.env {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("invalid --env '{}': expected KEY=VALUE", pair))?;
            builder = builder.with_env(key, value);
        }
        if let Some(name) = &self.name {
            builder = builder.with_name(name);
        }
        if !self.cmd.is_empty() {
            builder = builder.with_cmd(self.cmd.iter().cloned());
        }
        if let Some(secs) = self.timeout {
            builder = builder.with_startup_timeout(Duration::from_secs(secs));
        }
        if let Some(strategy) = self.wait_strategy()? {
            builder = builder.with_wait_strategy(strategy);
        }

        Ok(builder.build()?)
    }

    /// Requested waits combined; `None` leaves the port checks in place.
    fn wait_strategy(&self) -> anyhow::Result<Option<WaitStrategy>> {
        let mut strategies = Vec::new();
        if let Some(pattern) = &self.wait_log {
            strategies.push(WaitStrategy::for_log_message_times(
                pattern,
                self.wait_log_times,
            )?);
        }
        if self.wait_health {
            strategies.push(WaitStrategy::for_health_check());
        }
        if let Some(cmd) = &self.wait_cmd {
            strategies.push(WaitStrategy::for_successful_command([
                "/bin/sh",
                "-c",
                cmd.as_str(),
            ]));
        }
        Ok(strategies.into_iter().reduce(WaitStrategy::and))
    }
}

fn parse_mapping(mapping: &str) -> anyhow::Result<(u16, u16)> {
    let (host, internal) = mapping
        .split_once(':')
        .with_context(|| format!("invalid --publish '{}': expected HOST:INTERNAL", mapping))?;
    let host = host
        .parse()
        .with_context(|| format!("invalid host port in '{}'", mapping))?;
    let internal = internal
        .parse()
        .with_context(|| format!("invalid internal port in '{}'", mapping))?;
    Ok((host, internal))
}

/// Start the container, print where it is reachable, and hold it until Ctrl-C.
pub async fn run_container_command(args: RunArgs) -> anyhow::Result<()> {
    let request = args.request()?;
    let orchestrator = Orchestrator::connect_local()
        .await
        .context("failed to connect to Docker (try `testbay doctor`)")?;

    let container = orchestrator
        .start(request)
        .await
        .with_context(|| format!("failed to start {}", args.image))?;

    println!("{} ({})", container.name(), container.id());
    for (internal, host) in container.bound_ports().iter() {
        println!("  {} -> {}:{}", internal, container.host(), host);
    }
    let state = container.inspect().await?;
    if state.health != HealthStatus::None {
        println!("  health: {}", state.health);
    }

    println!("Ready. Press Ctrl-C to {}.", if args.keep { "exit" } else { "stop" });
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    if args.keep {
        println!("Leaving {} running", container.name());
        container.detach();
        return Ok(());
    }

    let stopped = container
        .stop(orchestrator.config().stop_options())
        .await?;
    println!("Stopped {}", stopped.name());
    Ok(())
}
