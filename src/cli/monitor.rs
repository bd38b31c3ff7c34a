// ABOUTME: CLI monitor command - listen for heartbeats and report live members
//
// Prints the expiring member list every --report-secs until interrupted or
// until --duration-secs elapsed.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use super::{print_json, MonitorArgs, OutputFormat};
use clustercast::config::AppConfig;
use clustercast::transport::{HeartbeatListener, Peer};

#[derive(Debug, Serialize)]
struct Report<'a> {
    members: &'a [Peer],
}

/// Execute the monitor command
pub async fn execute(args: MonitorArgs, config: &AppConfig, format: OutputFormat) -> Result<()> {
    let mut listener = HeartbeatListener::new(config.heartbeat.clone());
    let addr = listener
        .start()
        .await
        .with_context(|| format!("Failed to join {}", config.heartbeat.target()))?;
    if matches!(format, OutputFormat::Text) {
        println!("Watching {} on {addr}", config.heartbeat.group_address);
    }

    let deadline = args
        .duration_secs
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let mut ticker = tokio::time::interval(Duration::from_secs(args.report_secs.max(1)));
    ticker.tick().await;

    loop {
        let stop = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
            () = stop => break,
        }

        let members = listener.live_peers();
        match format {
            OutputFormat::Json => print_json(&Report { members: &members })?,
            OutputFormat::Text => print_members(&members),
        }
    }

    listener.stop().await;
    Ok(())
}

fn print_members(members: &[Peer]) {
    println!("{} live member(s)", members.len());
    for peer in members {
        let ready = peer.liveness.ready.unwrap_or_default();
        let busy = peer.liveness.busy.unwrap_or_default();
        let seen = peer
            .liveness
            .last_seen
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!("  {peer:<24} ready={ready:<4} busy={busy:<4} seen {seen}");
    }
}
