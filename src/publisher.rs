//! Order intake, sequencing and multicast fan-out.
//!
//! Every accepted order is appended to the shared [`RecordLog`] (which
//! assigns its sequence) and then broadcast as one datagram. Broadcast is
//! best-effort: a failed send is counted and logged, and subscribers
//! recover the record through repair.
use crate::codec;
use crate::config::POLL_INTERVAL;
use crate::error::OrderError;
use crate::record::{Order, Record};
use crate::record_log::RecordLog;
use crossbeam_channel::Sender;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Largest submission datagram we read.
const SUBMISSION_BUF: usize = 10 * 1024;

/// One-to-many delivery of an encoded record.
pub trait Fanout: Send + Sync {
    fn send(&self, payload: &[u8]) -> io::Result<()>;
}

/// UDP sender aimed at a multicast group (or any address for loopback use).
#[derive(Debug)]
pub struct MulticastSender {
    socket: UdpSocket,
    target: SocketAddrV4,
}

impl MulticastSender {
    pub fn open(target: SocketAddrV4, ttl: u32) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if target.ip().is_multicast() {
            socket.set_multicast_ttl_v4(ttl)?;
            socket.set_multicast_loop_v4(true)?;
        }
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        Ok(Self { socket: socket.into(), target })
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }
}

impl Fanout for MulticastSender {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.target).map(|_| ())
    }
}

/// In-process fan-out; each payload becomes one channel message.
impl Fanout for Sender<Vec<u8>> {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        Sender::send(self, payload.to_vec())
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "fan-out channel closed"))
    }
}

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub send_errors: AtomicU64,
}

pub struct Publisher<F> {
    log: Arc<RecordLog>,
    fanout: F,
    stats: PublisherStats,
}

impl<F: Fanout> Publisher<F> {
    pub fn new(log: Arc<RecordLog>, fanout: F) -> Self {
        Self { log, fanout, stats: PublisherStats::default() }
    }

    pub fn log(&self) -> &Arc<RecordLog> {
        &self.log
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    /// Append the order to the log; the returned record carries its sequence.
    pub fn submit(&self, order: Order) -> Arc<Record> {
        let record = self.log.append(order);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        record
    }

    pub fn broadcast(&self, record: &Record) {
        let bytes = match codec::encode(record) {
            Ok(b) => b,
            Err(e) => {
                warn!(sequence = record.sequence, error = %e, "cannot encode record");
                return;
            }
        };
        if let Err(e) = self.fanout.send(&bytes) {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            debug!(sequence = record.sequence, error = %e, "multicast send failed");
        }
    }

    /// Submit then broadcast; returns the assigned sequence.
    pub fn publish(&self, order: Order) -> u64 {
        let record = self.submit(order);
        info!(sequence = record.sequence, "broadcasting {}", record);
        self.broadcast(&record);
        record.sequence
    }

    pub fn handle_submission(&self, payload: &[u8], from: SocketAddr) -> Result<u64, OrderError> {
        match Order::from_json(payload) {
            Ok(order) => Ok(self.publish(order)),
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(%from, error = %e, "rejected order");
                Err(e)
            }
        }
    }

    /// Serve the submission socket until `shutdown` is set.
    pub fn run_submissions(&self, socket: &UdpSocket, shutdown: &AtomicBool) -> io::Result<()> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut buf = vec![0u8; SUBMISSION_BUF];
        while !shutdown.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let _ = self.handle_submission(&buf[..n], from);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => warn!(error = %e, "submission receive failed"),
            }
        }
        info!(
            accepted = self.stats.accepted.load(Ordering::Relaxed),
            rejected = self.stats.rejected.load(Ordering::Relaxed),
            "submission loop stopped"
        );
        Ok(())
    }
}
