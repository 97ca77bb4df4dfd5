//! Minimal operator CLI for the Lamport mutex peer engine.
//!
//! This binary is a demonstration harness, not a network service: the
//! crate's `Transport` facade is abstract (a real wire-level RPC
//! transport and name registry is an external collaborator, not part of
//! the core), so this binary runs a handful of peers in-process over
//! `LocalTransport`
//! and lets the operator drive one of them interactively while the
//! others answer RPCs and heartbeats in the background, exactly as a
//! real remote peer would. Swapping `LocalTransport` for a networked
//! `Transport` implementation would make every peer a separate process
//! without changing anything below.

use std::sync::Arc;

use clap::Parser;
use lamport_mutex::{spawn_peer, Config, LocalTransport, Peer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Lamport / Ricart-Agrawala distributed mutex demo peer")]
struct Args {
    /// Name of the peer the operator drives interactively.
    #[arg(long, default_value = "Peer-a")]
    name: String,

    /// Total number of peers to run in this process, including the one
    /// the operator drives. The rest run silently in the background.
    #[arg(long, default_value_t = 3)]
    peers: usize,

    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,
    #[arg(long)]
    monitor_interval_ms: Option<u64>,
    #[arg(long)]
    max_wait_time_ms: Option<u64>,
    #[arg(long)]
    max_access_time_ms: Option<u64>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::default();
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.monitor_interval_ms {
            config.monitor_interval = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_wait_time_ms {
            config.max_wait_time = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_access_time_ms {
            config.max_access_time = std::time::Duration::from_millis(ms);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.config();
    let transport = LocalTransport::new();

    let (peer, tasks) = spawn_peer(args.name.clone(), transport.clone(), config);
    let mut background = Vec::new();
    for index in 1..args.peers {
        let name = format!("Peer-sim-{index}");
        let (_, other_tasks) = spawn_peer(name, transport.clone(), config);
        background.push(other_tasks);
    }

    info!(peer = %peer.name(), total_peers = args.peers, "started");
    run_menu(peer.clone()).await;

    tasks.abort();
    for other in background {
        other.abort();
    }
    Ok(())
}

async fn run_menu(peer: Arc<Peer<LocalTransport>>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        println!("\n---> {}:", peer.name());
        println!("1. Request resource");
        println!("2. Release resource");
        println!("3. List active peers");
        println!("4. Shut down");
        print!("Choose an action: ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let Ok(Some(line)) = lines.next_line().await else {
            break;
        };
        match line.trim() {
            "1" => match peer.enter().await {
                Ok(true) => println!("Entered the critical section."),
                Ok(false) => println!("Could not enter the critical section."),
                Err(error) => error!(%error, "enter failed"),
            },
            "2" => match peer.exit().await {
                Ok(true) => println!("Released the critical section."),
                Ok(false) => println!("Was not holding the critical section."),
                Err(error) => error!(%error, "exit failed"),
            },
            "3" => println!("Active peers: {:?}", peer.active_peers()),
            "4" => {
                println!("Shutting down...");
                break;
            }
            other => println!("Invalid option: {other:?} (choose 1-4)"),
        }
    }
}
