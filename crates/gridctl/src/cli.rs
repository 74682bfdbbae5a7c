use std::path::PathBuf;

use clap::{Parser, Subcommand};

const DEFAULT_STACK_FILE: &str = "gridctl.yaml";
const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:8400";

#[derive(Debug, Parser)]
#[command(
    name = "gridctl",
    version,
    about = "Local control plane for MCP servers and A2A agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Bring the stack up and serve the gateway
    Up {
        /// Stack file describing the topology
        #[arg(short, long, default_value = DEFAULT_STACK_FILE)]
        stack: PathBuf,
        /// Run the daemon in the background
        #[arg(short, long)]
        detach: bool,
    },
    /// Stop the running daemon
    Down,
    /// Show the running daemon's status
    Status {
        #[arg(long, default_value = DEFAULT_GATEWAY_URL)]
        url: String,
    },
    /// Ask the running daemon to hot-reload its stack file
    Reload {
        #[arg(long, default_value = DEFAULT_GATEWAY_URL)]
        url: String,
    },
    /// Check a stack file without bringing anything up
    Validate {
        #[arg(short, long, default_value = DEFAULT_STACK_FILE)]
        stack: PathBuf,
    },
}
