use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use order_feed::config::FeedConfig;
use order_feed::logging;
use order_feed::publisher::{MulticastSender, Publisher};
use order_feed::record_log::RecordLog;
use order_feed::repair::RepairService;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about = "Order feed publisher: sequences, multicasts and repairs orders")]
struct Args {
    /// Multicast group
    #[arg(long, short = 'g', env = "FEED_GROUP", default_value = "224.1.1.1")]
    group: Ipv4Addr,

    /// Multicast port
    #[arg(long, short = 'p', env = "FEED_PORT", default_value_t = 5000)]
    port: u16,

    /// Multicast TTL
    #[arg(long, env = "FEED_TTL", default_value_t = 2)]
    ttl: u32,

    /// Address order submissions arrive on
    #[arg(long, env = "FEED_SUBMIT_HOST", default_value = "127.0.0.1")]
    submit_host: IpAddr,

    /// UDP port for order submissions
    #[arg(long, short = 'u', env = "FEED_SUBMIT_PORT", default_value_t = 5001)]
    udp: u16,

    /// Address the repair service listens on
    #[arg(long, short = 'i', env = "FEED_REPAIR_HOST", default_value = "127.0.0.1")]
    ip: IpAddr,

    /// TCP port for repair requests
    #[arg(long, short = 't', env = "FEED_REPAIR_PORT", default_value_t = 5002)]
    tcp: u16,

    /// Per-connection read/write timeout on the repair service, in ms
    #[arg(long, env = "FEED_REPAIR_TIMEOUT_MS", default_value_t = 2000)]
    repair_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> FeedConfig {
        FeedConfig {
            group: self.group,
            multicast_port: self.port,
            multicast_ttl: self.ttl,
            submit_host: self.submit_host,
            submit_port: self.udp,
            repair_host: self.ip,
            repair_port: self.tcp,
            repair_timeout: Duration::from_millis(self.repair_timeout_ms),
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

    let log = Arc::new(RecordLog::new());
    let submissions = UdpSocket::bind(config.submit_addr())
        .with_context(|| format!("bind submission socket {}", config.submit_addr()))?;
    let sender = MulticastSender::open(config.multicast_addr(), config.multicast_ttl)
        .with_context(|| format!("open multicast sender for {}", config.multicast_addr()))?;
    let repair = RepairService::bind(config.repair_addr(), Arc::clone(&log), config.repair_timeout)
        .with_context(|| format!("bind repair service {}", config.repair_addr()))?;

    info!("Ready to send multicast messages to {}", config.multicast_addr());
    info!("Ready to receive orders on {}", config.submit_addr());
    info!("Ready to receive repair requests on {}", config.repair_addr());

    // Ctrl+C stops intake; in-flight repairs finish before exit
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .context("install Ctrl+C handler")?;
    }

    let repair_thread = {
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || repair.run(&shutdown))
    };

    let publisher = Publisher::new(Arc::clone(&log), sender);
    let intake = publisher.run_submissions(&submissions, &shutdown);
    // make sure the repair thread stops even if intake failed
    shutdown.store(true, Ordering::Relaxed);
    repair_thread
        .join()
        .map_err(|_| anyhow!("repair thread panicked"))?
        .context("repair service")?;
    intake.context("submission loop")?;

    info!(records = log.len(), "publisher stopped");
    Ok(())
}
