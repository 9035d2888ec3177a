//! Multicast receive path and per-subscriber sequencing.
//!
//! The [`Sequencer`] holds `expected_next` and turns an unreliable stream of
//! records into an in-order, duplicate-free delivery, calling into repair
//! when it sees a gap. Receiving and sequencing run on separate threads
//! joined by a channel, so socket reads continue while a gap is repaired.
use crate::codec;
use crate::config::POLL_INTERVAL;
use crate::error::ConfigError;
use crate::record::Record;
use crate::repair_client::{fill_gap, Repair};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const DATAGRAM_BUF: usize = 64 * 1024 + codec::HEADER_LEN;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequencerStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub repaired: u64,
    pub lost: u64,
    pub malformed: u64,
}

pub struct Sequencer<R> {
    expected_next: u64,
    /// Set once `u64::MAX` has been delivered; every later record is stale.
    exhausted: bool,
    repairer: R,
    parallelism: usize,
    stats: SequencerStats,
}

impl<R: Repair> Sequencer<R> {
    pub fn new(repairer: R, parallelism: usize) -> Self {
        Self {
            expected_next: 0,
            exhausted: false,
            repairer,
            parallelism,
            stats: SequencerStats::default(),
        }
    }

    pub fn with_expected_next(mut self, expected_next: u64) -> Self {
        self.expected_next = expected_next;
        self
    }

    pub fn expected_next(&self) -> u64 {
        self.expected_next
    }

    pub fn stats(&self) -> SequencerStats {
        self.stats
    }

    /// Decode and sequence one datagram. Malformed payloads are logged and
    /// leave the state untouched.
    pub fn on_datagram(&mut self, payload: &[u8]) -> Vec<Record> {
        match codec::decode::<Record>(payload) {
            Ok(record) => self.on_record(record),
            Err(e) => {
                self.stats.malformed += 1;
                warn!(len = payload.len(), error = %e, "discarding malformed datagram");
                Vec::new()
            }
        }
    }

    /// Returns the records this step delivers, in sequence order.
    pub fn on_record(&mut self, record: Record) -> Vec<Record> {
        let expected = self.expected_next;
        let received = record.sequence;
        if received < expected || self.exhausted {
            self.stats.duplicates += 1;
            debug!(expected, received, "stale record discarded");
            return Vec::new();
        }

        let mut delivered = Vec::new();
        if received > expected {
            self.stats.gaps += 1;
            let missing = received - expected;
            info!(expected, received, missing, "gap detected, requesting repair");
            let fill = fill_gap(&self.repairer, expected..received, self.parallelism);
            for seq in &fill.not_found {
                warn!(sequence = *seq, "sequence never assigned by publisher, skipping");
            }
            for seq in &fill.unavailable {
                warn!(sequence = *seq, "repair failed, sequence lost");
            }
            if !fill.skipped.is_empty() {
                let (from, to) = (fill.skipped.start, fill.skipped.end);
                warn!(from, to, "rest of gap unassigned, skipping");
            }
            self.stats.repaired += fill.repaired.len() as u64;
            self.stats.lost += fill.lost();
            delivered.extend(fill.repaired);
        }

        delivered.push(record);
        match received.checked_add(1) {
            Some(next) => self.expected_next = next,
            None => {
                self.expected_next = received;
                self.exhausted = true;
            }
        }
        self.stats.delivered += delivered.len() as u64;
        delivered
    }
}

/// Receive-side loss injection for testing and demos.
#[derive(Debug)]
pub struct DropSimulator {
    probability: f64,
    rng: StdRng,
}

impl DropSimulator {
    pub fn new(probability: f64, seed: Option<u64>) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(ConfigError::DropProbability(probability));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { probability, rng })
    }

    pub fn disabled() -> Self {
        Self { probability: 0.0, rng: StdRng::seed_from_u64(0) }
    }

    pub fn should_drop(&mut self) -> bool {
        self.probability > 0.0 && self.rng.gen_bool(self.probability)
    }
}

#[derive(Debug)]
pub struct MulticastReceiver {
    socket: UdpSocket,
}

impl MulticastReceiver {
    /// Join `addr` if it is a multicast group, otherwise bind it directly.
    pub fn open(addr: SocketAddrV4) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if addr.ip().is_multicast() {
            socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()).into())?;
            socket.join_multicast_v4(addr.ip(), &Ipv4Addr::UNSPECIFIED)?;
        } else {
            socket.bind(&addr.into())?;
        }
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self { socket: socket.into() })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// `Ok(None)` when the read timed out.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStats {
    pub received: u64,
    /// Discarded by the drop simulator.
    pub dropped: u64,
    /// Discarded because the sequencer queue was full.
    pub overflowed: u64,
}

/// Forward datagrams to the sequencer until `shutdown` is set or the
/// sequencer goes away. Never blocks on the sequencer: a full queue costs
/// the datagram, which repair later recovers.
pub fn run_receiver(
    receiver: &MulticastReceiver,
    mut drops: DropSimulator,
    tx: Sender<Vec<u8>>,
    shutdown: &AtomicBool,
) -> ReceiverStats {
    let mut buf = vec![0u8; DATAGRAM_BUF];
    let mut stats = ReceiverStats::default();
    while !shutdown.load(Ordering::Relaxed) {
        match receiver.recv(&mut buf) {
            Ok(Some(n)) => {
                stats.received += 1;
                if drops.should_drop() {
                    stats.dropped += 1;
                    debug!(len = n, "simulated drop");
                    continue;
                }
                match tx.try_send(buf[..n].to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.overflowed += 1;
                        debug!(len = n, "sequencer queue full, datagram discarded");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "multicast receive failed"),
        }
    }
    stats
}

/// Sequence every datagram from `rx` and pass deliveries to `out`. Runs
/// until `rx` disconnects.
pub fn run_sequencer<R: Repair>(
    mut sequencer: Sequencer<R>,
    rx: Receiver<Vec<u8>>,
    out: Sender<Record>,
) -> SequencerStats {
    for payload in rx {
        for record in sequencer.on_datagram(&payload) {
            let _ = out.send(record);
        }
    }
    sequencer.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Action, Order};
    use crate::repair_client::RepairOutcome;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn record(sequence: u64) -> Record {
        Record {
            sequence,
            published_unix_ns: 0,
            order: Order::new(1, Action::Buy, "AAPL", Decimal::new(17020, 2)),
        }
    }

    fn seqs(records: &[Record]) -> Vec<u64> {
        records.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn in_order_stream_advances() {
        let mut s = Sequencer::new(|_: u64| -> RepairOutcome { panic!("no repair expected") }, 2);
        for i in 0..5 {
            assert_eq!(seqs(&s.on_record(record(i))), vec![i]);
        }
        assert_eq!(s.expected_next(), 5);
    }

    #[test]
    fn gap_is_repaired_before_trigger_is_delivered() {
        let asked = Mutex::new(Vec::new());
        let repairer = |seq: u64| {
            asked.lock().push(seq);
            RepairOutcome::Repaired(record(seq))
        };
        let mut s = Sequencer::new(&repairer, 1).with_expected_next(3);
        let out = s.on_record(record(5));
        assert_eq!(seqs(&out), vec![3, 4, 5]);
        assert_eq!(*asked.lock(), vec![3, 4]);
        assert_eq!(s.expected_next(), 6);
        assert_eq!(s.stats().gaps, 1);
        assert_eq!(s.stats().repaired, 2);
    }

    #[test]
    fn duplicates_and_stale_records_are_silent() {
        let mut s = Sequencer::new(|seq: u64| RepairOutcome::Repaired(record(seq)), 2);
        s.on_record(record(0));
        s.on_record(record(1));
        assert!(s.on_record(record(1)).is_empty());
        assert!(s.on_record(record(0)).is_empty());
        assert_eq!(s.expected_next(), 2);
        assert_eq!(s.stats().duplicates, 2);
    }

    #[test]
    fn unassigned_sequence_is_logged_and_skipped() {
        let log = crate::record_log::RecordLog::new();
        for i in 0..10 {
            log.append(Order::new(i, Action::Sell, "AMZN", Decimal::ONE));
        }
        let mut s = Sequencer::new(|seq: u64| log.repair(seq), 4).with_expected_next(99);
        let out = s.on_record(record(100));
        assert_eq!(seqs(&out), vec![100]);
        assert_eq!(s.expected_next(), 101);
        assert_eq!(s.stats().lost, 1);
    }

    #[test]
    fn last_sequence_is_delivered_once() {
        let mut s = Sequencer::new(|seq: u64| RepairOutcome::Repaired(record(seq)), 2)
            .with_expected_next(u64::MAX - 1);
        assert_eq!(seqs(&s.on_record(record(u64::MAX))), vec![u64::MAX - 1, u64::MAX]);
        assert!(s.on_record(record(u64::MAX)).is_empty());
        assert!(s.on_record(record(7)).is_empty());
        assert_eq!(s.stats().delivered, 2);
        assert_eq!(s.stats().duplicates, 2);
    }

    #[test]
    fn unavailable_repair_does_not_block_delivery() {
        let mut s = Sequencer::new(|_: u64| RepairOutcome::Unavailable, 4);
        assert_eq!(seqs(&s.on_record(record(3))), vec![3]);
        assert_eq!(s.stats().lost, 3);
        assert_eq!(seqs(&s.on_record(record(4))), vec![4]);
    }

    #[test]
    fn repaired_records_arriving_late_are_dropped() {
        let mut s = Sequencer::new(|seq: u64| RepairOutcome::Repaired(record(seq)), 2);
        assert_eq!(seqs(&s.on_record(record(2))), vec![0, 1, 2]);
        assert!(s.on_record(record(1)).is_empty());
        assert_eq!(seqs(&s.on_record(record(3))), vec![3]);
    }

    #[test]
    fn malformed_datagram_leaves_state() {
        let mut s = Sequencer::new(|_: u64| -> RepairOutcome { panic!("no repair expected") }, 2);
        s.on_record(record(0));
        assert!(s.on_datagram(b"{\"seq\": 1}").is_empty());
        let mut corrupt = codec::encode(&record(1)).unwrap();
        corrupt[10] ^= 0x55;
        assert!(s.on_datagram(&corrupt).is_empty());
        assert_eq!(s.expected_next(), 1);
        assert_eq!(s.stats().malformed, 2);
        assert_eq!(seqs(&s.on_datagram(&codec::encode(&record(1)).unwrap())), vec![1]);
    }

    #[test]
    fn drop_simulator_extremes_and_rate() {
        let mut never = DropSimulator::new(0.0, Some(1)).unwrap();
        assert!((0..1000).all(|_| !never.should_drop()));
        let mut always = DropSimulator::new(1.0, Some(1)).unwrap();
        assert!((0..1000).all(|_| always.should_drop()));
        let mut half = DropSimulator::new(0.5, Some(7)).unwrap();
        let dropped = (0..10_000).filter(|_| half.should_drop()).count();
        assert!((4_000..6_000).contains(&dropped));
        assert!(DropSimulator::new(-0.1, None).is_err());
        assert!(DropSimulator::new(f64::NAN, None).is_err());
    }

    #[test]
    fn pipeline_over_loopback() {
        let receiver = MulticastReceiver::open(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let target = receiver.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (raw_tx, raw_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();

        let recv_thread = {
            let shutdown = Arc::clone(&shutdown);
            let drops = DropSimulator::disabled();
            thread::spawn(move || run_receiver(&receiver, drops, raw_tx, &shutdown))
        };
        let seq_thread = thread::spawn(move || {
            let sequencer = Sequencer::new(|seq: u64| RepairOutcome::Repaired(record(seq)), 2);
            run_sequencer(sequencer, raw_rx, out_tx)
        });

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for seq in [0u64, 1, 3] {
            sender.send_to(&codec::encode(&record(seq)).unwrap(), target).unwrap();
        }
        let got: Vec<u64> = (0..4)
            .map(|_| out_rx.recv_timeout(Duration::from_secs(2)).unwrap().sequence)
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3]);

        shutdown.store(true, Ordering::Relaxed);
        let recv_stats = recv_thread.join().unwrap();
        assert_eq!((recv_stats.received, recv_stats.dropped), (3, 0));
        let stats = seq_thread.join().unwrap();
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.repaired, 1);
    }
}
