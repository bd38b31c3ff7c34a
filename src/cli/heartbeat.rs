// ABOUTME: CLI heartbeat command - announce this node's load to the rendezvous group
//
// With --count, sends that many announcements and reports each outcome.
// Without it, runs the heartbeat service until interrupted.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use super::{print_json, HeartbeatArgs, OutputFormat};
use clustercast::config::AppConfig;
use clustercast::transport::{
    Announcement, HeartbeatBroadcaster, HeartbeatError, HeartbeatService, HeartbeatState,
    TransportMetrics,
};

#[derive(Debug, Serialize)]
struct TickLine {
    tick: u64,
    sent: bool,
    code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Execute the heartbeat command
pub async fn execute(args: HeartbeatArgs, config: &AppConfig, format: OutputFormat) -> Result<()> {
    let metrics = Arc::new(TransportMetrics::new());
    let mut broadcaster = HeartbeatBroadcaster::multicast(config.catalog()?.shared(), Arc::clone(&metrics));
    broadcaster.init(config.heartbeat.clone());
    let announcement = Announcement::new(args.ready, args.busy, args.port);

    let Some(count) = args.count else {
        let mut service = HeartbeatService::new(config.heartbeat.interval);
        service.start(broadcaster, move || announcement);
        if matches!(format, OutputFormat::Text) {
            println!(
                "Announcing {announcement} to {} every {:?}",
                config.heartbeat.target(),
                config.heartbeat.interval
            );
        }
        tokio::signal::ctrl_c().await?;
        service.stop().await;
        return Ok(());
    };

    for tick in 1..=count {
        let outcome = broadcaster.broadcast_heartbeat(&announcement).await;
        let line = TickLine {
            tick,
            sent: outcome.is_ok(),
            code: outcome.as_ref().map_or_else(HeartbeatError::code, |_| 0),
            error: outcome.err().map(|e| e.to_string()),
        };
        match format {
            OutputFormat::Json => print_json(&line)?,
            OutputFormat::Text => match &line.error {
                None => println!("#{tick} sent {announcement}"),
                Some(error) => println!("#{tick} failed ({}): {error}", line.code),
            },
        }

        if tick < count {
            tokio::time::sleep(config.heartbeat.interval).await;
        }
    }

    let failed_for_good = broadcaster.state() == HeartbeatState::Failed;
    broadcaster.close();
    if failed_for_good && metrics.snapshot().heartbeats_sent == 0 {
        anyhow::bail!("No heartbeat could be sent");
    }
    Ok(())
}
