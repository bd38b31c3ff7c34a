// ABOUTME: Main entry point for the clustercast CLI
//
// Binary: clustercast
// Usage: clustercast <COMMAND>
// - send: fan a message out to peers through the pooled sender
// - listen: print frames received from peers
// - heartbeat: announce this node's load
// - monitor: watch announcements and the live member list
// - config: show or initialize configuration

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;

use clustercast::config::AppConfig;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    setup_logging(args.log_json);

    let config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    match args.command {
        cli::Commands::Send(send_args) => cli::send::execute(send_args, &config, args.format).await,
        cli::Commands::Listen(listen_args) => cli::listen::execute(listen_args, args.format).await,
        cli::Commands::Heartbeat(hb_args) => cli::heartbeat::execute(hb_args, &config, args.format).await,
        cli::Commands::Monitor(monitor_args) => cli::monitor::execute(monitor_args, &config, args.format).await,
        cli::Commands::Config(command) => cli::config::execute(command, &config, args.format),
    }
}

fn setup_logging(json: bool) {
    use tracing_subscriber::prelude::*;

    // stdout carries command output; logs go to stderr
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_ansi(false)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clustercast=info".into()),
        )
        .init();
}
