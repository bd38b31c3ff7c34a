// ABOUTME: CLI argument parsing and command routing for clustercast
//
// Provides command-line interface for:
// - Fanning a message out to peers (send)
// - Receiving framed messages (listen)
// - Announcing this node's load (heartbeat)
// - Watching announcements and the live member list (monitor)
// - Inspecting and initializing configuration (config)

pub mod config;
pub mod heartbeat;
pub mod listen;
pub mod monitor;
pub mod send;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use clustercast::transport::Peer;

/// Cluster fan-out, heartbeat and admission tooling
#[derive(Parser)]
#[command(name = "clustercast")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file, replacing the layered search
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Send one message to every peer through the pooled sender
    Send(SendArgs),

    /// Print frames received from peer senders
    Listen(ListenArgs),

    /// Broadcast load announcements
    Heartbeat(HeartbeatArgs),

    /// Track announcements and print the live member list
    Monitor(MonitorArgs),

    /// Show or initialize configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Arguments for the send command
#[derive(clap::Args)]
pub struct SendArgs {
    /// Destination as host:port or id@host:port (repeatable)
    #[arg(long = "peer", short = 'p', required = true)]
    pub peers: Vec<Peer>,

    /// Override pool.max_wait_millis (0 fails fast, negative waits forever)
    #[arg(long, allow_negative_numbers = true)]
    pub max_wait_millis: Option<i64>,

    /// Retry timed-out destinations once
    #[arg(long)]
    pub retry: bool,

    /// Message payload
    pub message: String,
}

/// Arguments for the listen command
#[derive(clap::Args)]
pub struct ListenArgs {
    /// Address to accept peer connections on
    #[arg(long, default_value = "0.0.0.0:23365")]
    pub bind: SocketAddr,

    /// Exit after this many frames
    #[arg(long)]
    pub count: Option<usize>,
}

/// Arguments for the heartbeat command
#[derive(clap::Args)]
pub struct HeartbeatArgs {
    /// Advertised idle workers
    #[arg(long, default_value_t = 1)]
    pub ready: u32,

    /// Advertised busy workers
    #[arg(long, default_value_t = 0)]
    pub busy: u32,

    /// Advertised service port
    #[arg(long)]
    pub port: u16,

    /// Send this many announcements and exit instead of running until interrupted
    #[arg(long)]
    pub count: Option<u64>,
}

/// Arguments for the monitor command
#[derive(clap::Args)]
pub struct MonitorArgs {
    /// Seconds between member list reports
    #[arg(long, default_value_t = 5)]
    pub report_secs: u64,

    /// Exit after this many seconds instead of running until interrupted
    #[arg(long)]
    pub duration_secs: Option<u64>,
}

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// List the files searched, most local first
    Paths,

    /// Write the default configuration to the user config file
    Init {
        /// Destination file instead of ~/.clustercast/config.toml
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Print a value as pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
