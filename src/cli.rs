//! Command-line interface definitions

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::agent::AGENT_PORT;
use crate::cluster::CONTROL_PLANE_PORT;

/// Rudder: a lightweight cluster workload orchestrator.
#[derive(Parser, Debug)]
#[command(name = "rudder", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Load environment variables from this file
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane
    Server(ServerArgs),

    /// Run a node agent
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port to listen on
    #[arg(long, default_value_t = CONTROL_PLANE_PORT)]
    pub port: u16,

    /// Path to the sqlite database
    #[arg(long, default_value = "rudder.db")]
    pub db_path: PathBuf,

    /// Seconds of heartbeat silence before a node is unhealthy
    #[arg(long, default_value_t = 15)]
    pub heartbeat_timeout_secs: u64,

    /// Seconds between health sweeps
    #[arg(long, default_value_t = 5)]
    pub sweep_interval_secs: u64,
}

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Control-plane URL (e.g. http://10.0.0.1:8500)
    #[arg(long)]
    pub server_url: String,

    /// Address to bind the directive listener
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port for the directive listener
    #[arg(long, default_value_t = AGENT_PORT)]
    pub port: u16,

    /// Directory holding the persistent node id
    #[arg(long, default_value = ".")]
    pub state_dir: PathBuf,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 5)]
    pub heartbeat_interval_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let cli = Cli::parse_from(["rudder", "server"]);
        let Commands::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.port, CONTROL_PLANE_PORT);
        assert_eq!(args.db_path, PathBuf::from("rudder.db"));
        assert_eq!(args.heartbeat_timeout_secs, 15);
        assert_eq!(args.sweep_interval_secs, 5);
    }

    #[test]
    fn test_agent_args() {
        let cli = Cli::parse_from([
            "rudder",
            "-vv",
            "agent",
            "--server-url",
            "http://10.0.0.1:8500",
            "--port",
            "9000",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.server_url, "http://10.0.0.1:8500");
        assert_eq!(args.port, 9000);
    }
}
