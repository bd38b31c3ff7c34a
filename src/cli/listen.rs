// ABOUTME: CLI listen command - print frames received from peer senders
//
// Runs a FrameReceiver until interrupted or until --count frames arrived.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use super::{print_json, ListenArgs, OutputFormat};
use clustercast::transport::FrameReceiver;

#[derive(Debug, Serialize)]
struct FrameLine<'a> {
    from: SocketAddr,
    len: usize,
    payload: &'a str,
}

/// Execute the listen command
pub async fn execute(args: ListenArgs, format: OutputFormat) -> Result<()> {
    let mut receiver = FrameReceiver::new(args.bind);
    let (addr, mut frames) = receiver
        .start()
        .await
        .with_context(|| format!("Failed to listen on {}", args.bind))?;
    info!(addr = %addr, "Listening for frames");
    if matches!(format, OutputFormat::Text) {
        println!("Listening on {addr}");
    }

    let mut received = 0;
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some((from, payload)) = frame else {
            break;
        };

        let text = String::from_utf8_lossy(&payload);
        match format {
            OutputFormat::Json => print_json(&FrameLine {
                from,
                len: payload.len(),
                payload: &text,
            })?,
            OutputFormat::Text => println!("{from} ({} bytes): {text}", payload.len()),
        }

        received += 1;
        if args.count.is_some_and(|count| received >= count) {
            break;
        }
    }

    receiver.stop().await?;
    Ok(())
}
