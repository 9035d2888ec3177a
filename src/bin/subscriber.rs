use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, Sender};
use dotenvy::dotenv;
use order_feed::capture;
use order_feed::config::FeedConfig;
use order_feed::logging;
use order_feed::record::Record;
use order_feed::repair_client::RepairClient;
use order_feed::subscriber::{
    run_receiver, run_sequencer, DropSimulator, MulticastReceiver, Sequencer,
};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about = "Order feed subscriber: in-order delivery with gap repair")]
struct Args {
    /// Client number
    #[arg(long, short = 'c', env = "FEED_CLIENT", default_value_t = 0)]
    client: u32,

    /// Multicast group
    #[arg(long, short = 'g', env = "FEED_GROUP", default_value = "224.1.1.1")]
    group: Ipv4Addr,

    /// Multicast port
    #[arg(long, short = 'p', env = "FEED_PORT", default_value_t = 5000)]
    port: u16,

    /// Repair service host
    #[arg(long, short = 'i', env = "FEED_REPAIR_HOST", default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Repair service TCP port
    #[arg(long, short = 't', env = "FEED_REPAIR_PORT", default_value_t = 5002)]
    tcp: u16,

    /// Probability of discarding each received datagram (loss simulation)
    #[arg(long, env = "FEED_DROP", default_value_t = 0.0)]
    drop: f64,

    /// Seed for the loss simulation
    #[arg(long, env = "FEED_DROP_SEED")]
    seed: Option<u64>,

    /// Repair connect/read timeout in ms
    #[arg(long, env = "FEED_REPAIR_TIMEOUT_MS", default_value_t = 2000)]
    repair_timeout_ms: u64,

    /// Concurrent repair requests per gap
    #[arg(long, env = "FEED_REPAIR_PARALLELISM", default_value_t = 4)]
    parallelism: usize,

    /// Record delivered orders to the default capture path
    #[arg(long, default_value_t = false)]
    capture: bool,

    /// Record delivered orders to this file (implies --capture)
    #[arg(long, env = "FEED_CAPTURE_FILE")]
    out: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> FeedConfig {
        FeedConfig {
            group: self.group,
            multicast_port: self.port,
            repair_host: self.ip,
            repair_port: self.tcp,
            drop_probability: self.drop,
            drop_seed: self.seed,
            client_id: self.client,
            repair_timeout: Duration::from_millis(self.repair_timeout_ms),
            repair_parallelism: self.parallelism,
            ..FeedConfig::default()
        }
    }
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    logging::init("info");
    let config = args.config();
    config.validate().context("invalid configuration")?;
    let client = config.client_id;

    let receiver = MulticastReceiver::open(config.multicast_addr())
        .with_context(|| format!("join multicast group {}", config.multicast_addr()))?;
    let drops = DropSimulator::new(config.drop_probability, config.drop_seed)?;
    let repairer = RepairClient::new(config.repair_addr(), client, config.repair_timeout);
    let sequencer = Sequencer::new(repairer, config.repair_parallelism);
    info!(client, "Listening for multicast messages on {}", config.multicast_addr());

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .context("install Ctrl+C handler")?;
    }

    // Optional capture writer
    let capture_path =
        args.out.clone().or_else(|| args.capture.then(|| capture::default_path(client)));
    let (capture_tx, writer) = match capture_path {
        Some(path) => {
            let (tx, rx) = bounded::<Record>(8192);
            let header = capture::header(client, config.multicast_addr().to_string());
            info!(client, "capturing delivered orders to {:?}", path);
            (Some(tx), Some(thread::spawn(move || capture::writer_thread(path, header, rx))))
        }
        None => (None, None),
    };

    let (raw_tx, raw_rx) = bounded::<Vec<u8>>(8192);
    let (out_tx, out_rx) = bounded::<Record>(8192);

    let recv_thread = {
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || run_receiver(&receiver, drops, raw_tx, &shutdown))
    };
    let seq_thread = thread::spawn(move || run_sequencer(sequencer, raw_rx, out_tx));

    deliver(client, out_rx, capture_tx);

    let recv_stats = recv_thread.join().map_err(|_| anyhow!("receive thread panicked"))?;
    let seq_stats = seq_thread.join().map_err(|_| anyhow!("sequencer thread panicked"))?;
    if let Some(writer) = writer {
        let written = writer.join().map_err(|_| anyhow!("capture thread panicked"))??;
        info!(client, written, "capture closed");
    }
    info!(
        client,
        received = recv_stats.received,
        simulated_drops = recv_stats.dropped,
        delivered = seq_stats.delivered,
        repaired = seq_stats.repaired,
        lost = seq_stats.lost,
        "subscriber stopped"
    );
    Ok(())
}

/// Application view: log every delivered order and forward it to the capture.
fn deliver(client: u32, rx: Receiver<Record>, capture_tx: Option<Sender<Record>>) {
    for record in rx {
        info!(
            client,
            sequence = record.sequence,
            "Received broadcast that client {} issued {} {} at ${}",
            record.order.client_id,
            record.order.action,
            record.order.symbol,
            record.order.price
        );
        if let Some(tx) = &capture_tx {
            let _ = tx.send(record);
        }
    }
}
