//! CLI command handling.
//!
//! Provides subcommands for:
//! - Starting a container and holding it until Ctrl-C (`run`)
//! - Checking that Docker is usable (`doctor`)

mod doctor;
mod run;

pub use doctor::run_doctor_command;
pub use run::{RunArgs, run_container_command};

use clap::{ColorChoice, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "testbay")]
#[command(about = "Start disposable containers and wait until they are ready")]
#[command(
    long_about = "testbay starts Docker containers for integration testing and waits for readiness.\nExamples:\n  testbay run --image redis:7 --port 6379  # Start redis on a random host port\n  testbay doctor  # Check Docker availability"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a container and keep it until interrupted
    #[command(
        about = "Start a container and wait for readiness",
        long_about = "Starts a container, prints its mapped ports once ready, and stops it on Ctrl-C.\nExamples:\n  testbay run --image postgres:16 --port 5432 -e POSTGRES_PASSWORD=test --wait-log 'ready to accept connections' --wait-log-times 2\n  testbay run --image nginx --publish 8080:80 --keep"
    )]
    Run(RunArgs),

    /// Check Docker availability
    #[command(
        about = "Check Docker availability",
        long_about = "Reports whether a Docker daemon is reachable, with platform hints when it is not.\nExample: testbay doctor --json"
    )]
    Doctor {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "testbay",
            "run",
            "--image",
            "redis:7",
            "--port",
            "6379",
            "--publish",
            "18080:80",
            "-e",
            "MODE=test",
            "--wait-log",
            "Ready",
            "--timeout",
            "30",
        ])
        .unwrap();

        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.image, "redis:7");
                assert_eq!(args.ports, vec![6379]);
                assert_eq!(args.publish, vec!["18080:80".to_string()]);
                assert_eq!(args.env, vec!["MODE=test".to_string()]);
                assert_eq!(args.wait_log.as_deref(), Some("Ready"));
                assert_eq!(args.timeout, Some(30));
                assert!(!args.keep);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_doctor() {
        let cli = Cli::try_parse_from(["testbay", "--log-json", "doctor", "--json"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Doctor { json: true }));
    }
}
