use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use order_feed::logging;
use order_feed::record::{Action, Order};
use rust_decimal::Decimal;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(about = "Send a trade order to the publisher's submission port")]
struct Args {
    /// Client number
    #[arg(long, short = 'c', env = "FEED_CLIENT", default_value_t = 0)]
    client: u32,

    /// BUY or SELL
    #[arg(long, short = 'a', default_value = "BUY")]
    action: Action,

    /// Ticker symbol (e.g., AAPL)
    #[arg(long, short = 's')]
    symbol: String,

    /// Limit price
    #[arg(long)]
    price: Decimal,

    /// Publisher host
    #[arg(long, env = "FEED_SUBMIT_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Publisher submission UDP port
    #[arg(long, short = 'u', env = "FEED_SUBMIT_PORT", default_value_t = 5001)]
    udp: u16,

    /// Number of times to send the order
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Pause between sends, in ms
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

fn main() -> Result<()> {
    let _ = dotenv();
    let args = Args::parse();
    logging::init("info");

    let target = SocketAddr::new(args.host, args.udp);
    let socket = UdpSocket::bind("0.0.0.0:0").context("bind local socket")?;
    let order = Order::new(args.client, args.action, args.symbol.trim(), args.price);
    let payload = order.to_json();

    for i in 0..args.count {
        if i > 0 {
            thread::sleep(Duration::from_millis(args.interval_ms));
        }
        info!(
            "Sending request to {} {} at ${} to {}...",
            order.action, order.symbol, order.price, target
        );
        socket
            .send_to(payload.as_bytes(), target)
            .with_context(|| format!("send to {}", target))?;
    }
    Ok(())
}
