use crossbeam_channel::unbounded;
use order_feed::capture::{self, read_capture};
use order_feed::codec;
use order_feed::publisher::{MulticastSender, Publisher};
use order_feed::record::{Action, Order, Record};
use order_feed::record_log::RecordLog;
use order_feed::repair::RepairService;
use order_feed::repair_client::RepairClient;
use order_feed::subscriber::{
    run_receiver, run_sequencer, DropSimulator, MulticastReceiver, Sequencer,
};
use rust_decimal::Decimal;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct RunningRepair {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl RunningRepair {
    fn start(log: Arc<RecordLog>) -> Self {
        let addr = "127.0.0.1:0".parse().unwrap();
        let service = RepairService::bind(addr, log, Duration::from_secs(2)).unwrap();
        let addr = service.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || service.run(&shutdown))
        };
        Self { addr, shutdown, handle }
    }

    fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.handle.join().unwrap().unwrap();
    }
}

fn submission(i: u32) -> String {
    let (action, stock, price) =
        if i % 2 == 0 { ("BUY", "AAPL", "170.20") } else { ("SELL", "AMZN", "109.32") };
    format!(
        r#"{{"client": {}, "action": "{}", "stock": "{}", "price": {}}}"#,
        i % 4,
        action,
        stock,
        price
    )
}

#[test]
fn lossy_duplicated_stream_is_delivered_once_in_order() {
    let log = Arc::new(RecordLog::new());
    let repair = RunningRepair::start(Arc::clone(&log));
    let (fan_tx, fan_rx) = unbounded();
    let publisher = Publisher::new(Arc::clone(&log), fan_tx);
    let from: SocketAddr = "127.0.0.1:45000".parse().unwrap();

    for i in 0..40 {
        assert_eq!(publisher.handle_submission(submission(i).as_bytes(), from), Ok(u64::from(i)));
    }
    let bad = br#"{"client": 1, "action": "HOLD", "stock": "X", "price": 1}"#;
    assert!(publisher.handle_submission(bad, from).is_err());
    let datagrams: Vec<Vec<u8>> = fan_rx.try_iter().collect();
    assert_eq!(datagrams.len(), 40);

    // lose every third datagram except the last, repeat every fifth, add noise
    let mut wire = Vec::new();
    let mut lost = 0u64;
    for (i, d) in datagrams.iter().enumerate() {
        if i % 3 == 1 && i != 39 {
            lost += 1;
            continue;
        }
        wire.push(d.clone());
        if i % 5 == 0 {
            wire.push(d.clone());
            wire.push(b"garbage".to_vec());
        }
    }

    let client = RepairClient::new(repair.addr, 7, Duration::from_secs(2));
    let mut sequencer = Sequencer::new(client, 4);
    let delivered: Vec<Record> = wire.iter().flat_map(|d| sequencer.on_datagram(d)).collect();

    let seqs: Vec<u64> = delivered.iter().map(|r| r.sequence).collect();
    assert_eq!(seqs, (0..40).collect::<Vec<_>>());
    for r in &delivered {
        assert_eq!(*r, *log.get(r.sequence).unwrap());
    }
    let stats = sequencer.stats();
    assert_eq!(stats.repaired, lost);
    assert_eq!(stats.lost, 0);
    assert!(stats.duplicates > 0);
    assert!(stats.malformed > 0);

    repair.stop();
}

#[test]
fn repair_for_unassigned_sequence_is_not_found_and_skipped() {
    let log = Arc::new(RecordLog::new());
    for i in 0..10 {
        log.append(Order::new(i, Action::Buy, "AAPL", Decimal::new(17020, 2)));
    }
    let repair = RunningRepair::start(Arc::clone(&log));
    let client = RepairClient::new(repair.addr, 1, Duration::from_secs(2));
    let mut sequencer = Sequencer::new(client, 2).with_expected_next(99);

    let stray = Record {
        sequence: 100,
        published_unix_ns: 0,
        order: Order::new(5, Action::Sell, "MSFT", Decimal::ONE),
    };
    let out = sequencer.on_record(stray);
    assert_eq!(out.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![100]);
    assert_eq!(sequencer.expected_next(), 101);
    assert_eq!(sequencer.stats().lost, 1);

    repair.stop();
}

#[test]
fn live_udp_feed_with_simulated_loss_and_capture() {
    let log = Arc::new(RecordLog::new());
    let repair = RunningRepair::start(Arc::clone(&log));

    let receiver = MulticastReceiver::open(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    let target = match receiver.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!(),
    };
    let publisher = Publisher::new(Arc::clone(&log), MulticastSender::open(target, 1).unwrap());

    let shutdown = Arc::new(AtomicBool::new(false));
    let (raw_tx, raw_rx) = unbounded();
    let (out_tx, out_rx) = unbounded();
    let recv_thread = {
        let shutdown = Arc::clone(&shutdown);
        let drops = DropSimulator::new(0.3, Some(42)).unwrap();
        thread::spawn(move || run_receiver(&receiver, drops, raw_tx, &shutdown))
    };
    let sequencer = Sequencer::new(RepairClient::new(repair.addr, 3, Duration::from_secs(2)), 4);
    let seq_thread = thread::spawn(move || run_sequencer(sequencer, raw_rx, out_tx));

    for i in 0..30 {
        publisher.publish(Order::new(i, Action::Buy, "AAPL", Decimal::new(17020, 2)));
    }
    // a dropped tail is only noticed once something newer arrives
    let mut delivered = Vec::new();
    for _ in 0..100 {
        while let Ok(r) = out_rx.recv_timeout(Duration::from_millis(200)) {
            delivered.push(r);
        }
        if delivered.last().is_some_and(|r: &Record| r.sequence >= 29) {
            break;
        }
        publisher.publish(Order::new(99, Action::Sell, "TAIL", Decimal::ONE));
    }

    shutdown.store(true, Ordering::Relaxed);
    let recv_stats = recv_thread.join().unwrap();
    let seq_stats = seq_thread.join().unwrap();
    delivered.extend(out_rx.try_iter());

    let seqs: Vec<u64> = delivered.iter().map(|r| r.sequence).collect();
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1), "not contiguous: {seqs:?}");
    assert_eq!(seqs.first(), Some(&0));
    assert!(seqs.len() >= 30);
    assert!(recv_stats.dropped > 0);
    assert!(seq_stats.repaired > 0 && seq_stats.repaired <= recv_stats.dropped);
    assert_eq!(seq_stats.lost, 0);

    // journal what was delivered and read it back
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("client-3.bin");
    let (cap_tx, cap_rx) = unbounded();
    let writer = {
        let path = path.clone();
        let header = capture::header(3, target.to_string());
        thread::spawn(move || capture::writer_thread(path, header, cap_rx))
    };
    for r in &delivered {
        cap_tx.send(r.clone()).unwrap();
    }
    drop(cap_tx);
    assert_eq!(writer.join().unwrap().unwrap(), delivered.len() as u64);

    let cap = read_capture(&path).unwrap();
    assert_eq!(cap.header.client_id, 3);
    assert_eq!(cap.records, delivered);
    assert!(cap.missing().is_empty());
    assert_eq!(cap.first_order_violation(), None);

    repair.stop();
}

#[test]
fn capture_crc_mismatch_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("bad.bin");
    let (tx, rx) = unbounded();
    let order = Order::new(1, Action::Buy, "X", Decimal::ONE);
    tx.send(Record { sequence: 0, published_unix_ns: 0, order }).unwrap();
    drop(tx);
    capture::writer_thread(path.clone(), capture::header(1, "224.1.1.1:5000"), rx).unwrap();
    assert!(read_capture(&path).is_ok());

    // flip the last payload byte of the record frame
    let len = fs::metadata(&path).unwrap().len();
    let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(len - 1)).unwrap();
    let bytes = fs::read(&path).unwrap();
    f.write_all(&[bytes[bytes.len() - 1] ^ 0xFF]).unwrap();
    drop(f);

    let err = read_capture(&path).unwrap_err();
    assert!(format!("{err:#}").contains("CRC mismatch"), "{err:#}");
}

#[test]
fn wire_record_matches_log_entry() {
    let (tx, rx) = unbounded();
    let publisher = Publisher::new(Arc::new(RecordLog::new()), tx);
    let seq = publisher.publish(Order::new(1, Action::Buy, "AAPL", Decimal::new(17020, 2)));
    assert_eq!(seq, 0);
    let on_wire: Record = codec::decode(&rx.recv().unwrap()).unwrap();
    assert_eq!(on_wire.sequence, 0);
    assert_eq!(on_wire.order.price.to_string(), "170.20");
    assert_eq!(on_wire, *publisher.log().get(0).unwrap());
}
