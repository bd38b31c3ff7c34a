// ABOUTME: CLI send command - fan one message out to a list of peers
//
// Builds a TCP sender pool from configuration, performs one send_to_all and
// reports which destinations failed.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;

use super::{print_json, OutputFormat, SendArgs};
use clustercast::config::AppConfig;
use clustercast::transport::{
    FailureKind, FanoutSender, FaultRecord, MetricsSnapshot, ResourcePool, RetryTransient,
    TcpSenderFactory, TransportMetrics, Wait,
};

/// Result of one send as printed to the user
#[derive(Debug, Serialize)]
pub struct SendSummary {
    pub attempted: usize,
    pub delivered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub faults: Vec<FaultRecord>,
    pub metrics: MetricsSnapshot,
}

/// Execute the send command
pub async fn execute(args: SendArgs, config: &AppConfig, format: OutputFormat) -> Result<()> {
    let catalog = config.catalog()?.shared();
    let metrics = Arc::new(TransportMetrics::new());
    let factory = TcpSenderFactory::new(config.sender.clone(), config.pool.keepalive_interval);
    let pool = ResourcePool::with_parts(factory, &config.pool, Arc::clone(&catalog), Arc::clone(&metrics));

    let wait = args
        .max_wait_millis
        .map_or_else(|| config.pool.max_wait(), Wait::from_millis);
    let mut sender = FanoutSender::new(pool.clone(), wait, catalog);
    if args.retry {
        sender = sender.with_retry_policy(RetryTransient::default());
    }

    let result = sender.send_to_all(&args.peers, args.message.as_bytes()).await;
    pool.close().await;

    let (failure, faults) = match result {
        Ok(()) => (None, Vec::new()),
        Err(report) => (Some(report.kind()), report.into_faults()),
    };
    let summary = SendSummary {
        attempted: args.peers.len(),
        delivered: args.peers.len() - faults.len(),
        failure,
        faults,
        metrics: metrics.snapshot(),
    };

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => print_text(&summary),
    }

    if summary.failure == Some(FailureKind::Total) {
        bail!("No destination received the message");
    }
    Ok(())
}

fn print_text(summary: &SendSummary) {
    println!("Delivered to {} of {} peers", summary.delivered, summary.attempted);
    for fault in &summary.faults {
        println!("  \u{2717} {}: {}", fault.peer, fault.cause);
    }
}
