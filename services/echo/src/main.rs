//! Echo server and load client
//!
//! `listen` replies to every text message with the same text; `send` posts a
//! batch of requests and reports how long the round trips took.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hublink_codec::TextSerializer;
use hublink_config::HubConfig;
use hublink_network::{Channel, Endpoint, Hub, RequestClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hub configuration file (TOML); HUBLINK_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept channels and echo every message back to its sender
    Listen {
        /// Endpoint to bind, e.g. tcp://*:7100
        #[arg(short, long, default_value = "tcp://*:7100")]
        address: String,
    },
    /// Send requests to an echo server and wait for each reply
    Send {
        /// Endpoint of the echo server, e.g. tcp://127.0.0.1:7100
        #[arg(short, long, default_value = "tcp://127.0.0.1:7100")]
        address: String,

        /// Number of requests
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Seconds to wait for the first connection
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,

        /// Message text
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hublink_echo=info,hublink_network=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = HubConfig::load(args.config.as_deref()).context("Failed to load hub configuration")?;
    let hub = Hub::new(config).context("Failed to create hub")?;
    info!(hub = %hub.id(), version = env!("CARGO_PKG_VERSION"), "Starting hublink-echo");

    match args.command {
        Command::Listen { address } => listen(&hub, &address).await?,
        Command::Send {
            address,
            count,
            connect_timeout,
            text,
        } => send(&hub, &address, count, Duration::from_secs(connect_timeout), text).await?,
    }

    hub.shutdown().await;
    Ok(())
}

async fn listen(hub: &Hub, address: &str) -> Result<()> {
    let endpoint: Endpoint = address.parse().context("Invalid listen address")?;
    let local_addr = hub
        .listen(
            &endpoint,
            Arc::new(TextSerializer),
            |remote| {
                info!(remote = %remote, "Peer connected");
                true
            },
            |channel: &Channel<TextSerializer>| {
                let replier = channel.downgrade();
                channel.set_callback(move |header, text: String| {
                    if let Some(channel) = replier.upgrade() {
                        channel.post(text, header.message_id);
                    }
                });
            },
        )
        .await?;
    info!(%local_addr, "Echo server ready; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Shutdown signal received");
    Ok(())
}

async fn send(hub: &Hub, address: &str, count: usize, connect_timeout: Duration, text: String) -> Result<()> {
    let endpoint: Endpoint = address.parse().context("Invalid server address")?;
    let channel = hub.open_channel_to(endpoint, Arc::new(TextSerializer))?;
    channel
        .wait_connected(connect_timeout)
        .await
        .context("Echo server did not accept the connection")?;

    let client = RequestClient::new(channel.clone(), hub.config().request_timeout());
    let started = Instant::now();
    let mut failures = 0usize;
    for i in 0..count {
        let request = format!("{} #{}", text, i + 1);
        match client.request(request.clone()).await {
            Ok(reply) if reply == request => {}
            Ok(reply) => {
                warn!(%request, %reply, "Echo mismatch");
                failures += 1;
            }
            Err(e) => {
                warn!(%request, error = %e, "Request failed");
                failures += 1;
            }
        }
    }

    let elapsed = started.elapsed();
    let metrics = channel.metrics();
    info!(
        requests = count,
        failures,
        elapsed_ms = elapsed.as_millis() as u64,
        bytes_sent = metrics.bytes_sent,
        bytes_received = metrics.bytes_received,
        "Done"
    );

    channel.close().await;
    anyhow::ensure!(failures == 0, "{} of {} requests failed", failures, count);
    Ok(())
}
