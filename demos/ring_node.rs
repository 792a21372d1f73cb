//! Run one ring node from a static list of addresses.
//!
//! Start several of these with the same address list and different `--index`.

use std::net::SocketAddr;
use std::time::Duration;

use chordring::{Config, RingId, RingNode};
use clap::Parser;
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Position of this node's own address in the list.
    #[arg(short, long)]
    index: usize,
    /// Pin the node id instead of hashing the address.
    #[arg(long)]
    id: Option<u32>,
    /// Milliseconds between two stabilization rounds.
    #[arg(long, default_value_t = 1000)]
    interval: u64,
    /// Print the ring state every this many seconds.
    #[arg(long, default_value_t = 5)]
    report: u64,
    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
    /// Addresses of every node of the ring.
    #[arg(required = true)]
    peers: Vec<SocketAddr>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    let mut config = Config::new(cli.peers.into_iter().enumerate(), cli.index)
        .with_stabilize_interval(Duration::from_millis(cli.interval));
    if let Some(id) = cli.id {
        config = config.with_id(RingId(id));
    }

    let node = RingNode::new(config).expect("Failed to start ring node");

    let (tx_interrupted, rx_interrupted) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        println!();
        println!("Received Ctrl+C! Shutting down...");
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    loop {
        let info = node.info();
        println!(
            "{} {:?} pred={} succ={}",
            info.id(),
            info.status(),
            info.predecessor()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "?".to_string()),
            info.successor(),
        );

        if rx_interrupted
            .recv_timeout(Duration::from_secs(cli.report))
            .is_ok()
        {
            break;
        }
    }

    node.shutdown();
}
