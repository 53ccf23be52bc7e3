use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, Level};

use huddle_mesh::{
    DeadlineMonitor, DeliveryLedger, MeshConfig, MeshNode, MessageHandler, Telemetry,
    TransmissionTimes,
};

#[derive(Parser)]
#[command(name = "huddled")]
#[command(about = "Huddle mesh peer - serverless LAN coordination", long_about = None)]
struct Cli {
    /// Publisher port; sampled from 5000-6000 when omitted
    #[arg(short, long)]
    port: Option<u16>,

    /// Pre-shared discovery key, 8 hex characters
    #[arg(short, long, default_value = "61626364")]
    key: String,

    /// UDP discovery port
    #[arg(long, default_value = "9999")]
    discovery_port: u16,

    /// Presence broadcast interval, milliseconds
    #[arg(long, default_value = "1000")]
    broadcast_interval_ms: u64,

    /// Leader silence tolerated before a new election, milliseconds
    #[arg(long, default_value = "5000")]
    election_timeout_ms: u64,

    /// Heartbeat cadence while leader, milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// Announce this peer as ready to start
    #[arg(long)]
    ready: bool,

    /// Publish a demo state message every second
    #[arg(long)]
    send_demo: bool,
}

fn parse_key(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err(format!("odd-length hex key: {hex:?}"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| format!("invalid hex in key: {hex:?}"))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = MeshConfig {
        bind_port: cli.port,
        discovery_port: cli.discovery_port,
        obfuscation_key: parse_key(&cli.key)?,
        broadcast_interval: Duration::from_millis(cli.broadcast_interval_ms),
        election_timeout: Duration::from_millis(cli.election_timeout_ms),
        heartbeat_interval: Duration::from_millis(cli.heartbeat_interval_ms),
        ..MeshConfig::default()
    };

    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |message| {
        let _ = app_tx.send(message);
    });

    let times = Arc::new(TransmissionTimes::default());
    let ledger = Arc::new(DeliveryLedger::default());
    let deadlines = Arc::new(DeadlineMonitor::default());
    let telemetry = Telemetry::new()
        .with(times.clone())
        .with(ledger.clone())
        .with(deadlines.clone());

    let node = Arc::new(MeshNode::spawn(config, handler, telemetry).await?);
    if cli.ready {
        node.set_ready(true);
    }

    tokio::spawn(async move {
        while let Some(message) = app_rx.recv().await {
            info!(from = %message.sender, kind = %message.kind, data = ?message.data, "received");
        }
    });

    // Periodic status line: roster size and current leader.
    {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                info!(
                    peers = node.peers().len(),
                    leader = ?node.leader_id().map(|id| id.short()),
                    is_leader = node.is_leader(),
                    "status"
                );
            }
        });
    }

    if cli.send_demo {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut tick: u64 = 0;
            loop {
                ticker.tick().await;
                tick += 1;
                let jitter: u32 = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0..100)
                };
                let mut data = Map::new();
                data.insert("tick".into(), Value::from(tick));
                data.insert("jitter".into(), Value::from(jitter));
                node.send_public("state", data);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.shutdown();
    info!(
        latency_samples = times.count(),
        mean_latency_ms = ?times.mean_ms(),
        loss_rate = ledger.loss_rate(),
        deadline_violations = deadlines.violations(),
        "session telemetry"
    );
    Ok(())
}
