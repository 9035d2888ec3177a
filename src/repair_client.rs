//! Subscriber side of repair: fetch missing sequences one connection each.
//!
//! A gap-fill episode asks for every missing sequence exactly once, oldest
//! first, in batches of concurrent requests. Anything not recovered in the
//! episode is reported and skipped; there is no retry.
use crate::codec;
use crate::error::CodecError;
use crate::record::{Record, RepairRequest, RepairResponse};
use std::io::{self, ErrorKind, Write};
use std::net::{SocketAddr, TcpStream};
use std::ops::Range;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    Repaired(Record),
    /// The service has never assigned this sequence.
    NotFound,
    /// Connect, timeout or protocol failure.
    Unavailable,
}

/// Something that can fetch a record by sequence. Called from several
/// threads at once during a gap fill.
pub trait Repair: Sync {
    fn repair(&self, sequence: u64) -> RepairOutcome;
}

impl<F> Repair for F
where
    F: Fn(u64) -> RepairOutcome + Sync,
{
    fn repair(&self, sequence: u64) -> RepairOutcome {
        self(sequence)
    }
}

#[derive(Debug, Clone)]
pub struct RepairClient {
    addr: SocketAddr,
    client_id: u32,
    timeout: Duration,
}

impl RepairClient {
    pub fn new(addr: SocketAddr, client_id: u32, timeout: Duration) -> Self {
        Self { addr, client_id, timeout }
    }

    fn request(&self, sequence: u64) -> Result<RepairResponse, CodecError> {
        let mut stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        let bytes = codec::encode(&RepairRequest { client_id: self.client_id, sequence })?;
        stream.write_all(&bytes)?;
        codec::read_frame(&mut stream)?.ok_or_else(|| {
            io::Error::new(ErrorKind::UnexpectedEof, "repair service closed without answering")
                .into()
        })
    }
}

impl Repair for RepairClient {
    fn repair(&self, sequence: u64) -> RepairOutcome {
        match self.request(sequence) {
            Ok(RepairResponse::Found(record)) => RepairOutcome::Repaired(record),
            Ok(RepairResponse::NotFound { log_len, .. }) => {
                debug!(sequence, log_len, "repair service has no such sequence");
                RepairOutcome::NotFound
            }
            Err(e) => {
                warn!(sequence, addr = %self.addr, error = %e, "repair unavailable");
                RepairOutcome::Unavailable
            }
        }
    }
}

/// Result of one gap-fill episode, each list in ascending sequence order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GapFill {
    pub repaired: Vec<Record>,
    pub not_found: Vec<u64>,
    pub unavailable: Vec<u64>,
    /// Tail of the gap never requested because the service already
    /// reported a lower sequence as unassigned.
    pub skipped: Range<u64>,
}

impl GapFill {
    pub fn lost(&self) -> u64 {
        let requested = (self.not_found.len() + self.unavailable.len()) as u64;
        requested + (self.skipped.end - self.skipped.start)
    }
}

/// Repair every sequence in `missing`, at most `parallelism` requests at a
/// time, batches issued in ascending order.
///
/// The log is contiguous, so once the service answers NotFound for some
/// sequence the batches above it are not requested and land in `skipped`.
pub fn fill_gap<R: Repair + ?Sized>(
    repairer: &R,
    missing: Range<u64>,
    parallelism: usize,
) -> GapFill {
    let batch = parallelism.max(1) as u64;
    let mut fill = GapFill::default();
    let mut start = missing.start;
    while start < missing.end {
        if !fill.not_found.is_empty() {
            fill.skipped = start..missing.end;
            break;
        }
        let end = missing.end.min(start.saturating_add(batch));
        let outcomes: Vec<(u64, RepairOutcome)> = if end - start == 1 {
            vec![(start, repairer.repair(start))]
        } else {
            thread::scope(|s| {
                let handles: Vec<_> = (start..end)
                    .map(|seq| (seq, s.spawn(move || repairer.repair(seq))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(seq, h)| (seq, h.join().unwrap_or(RepairOutcome::Unavailable)))
                    .collect()
            })
        };
        for (seq, outcome) in outcomes {
            match outcome {
                RepairOutcome::Repaired(record) if record.sequence == seq => {
                    fill.repaired.push(record)
                }
                RepairOutcome::Repaired(record) => {
                    let got = record.sequence;
                    warn!(requested = seq, got, "repair answered with wrong sequence");
                    fill.unavailable.push(seq);
                }
                RepairOutcome::NotFound => fill.not_found.push(seq),
                RepairOutcome::Unavailable => fill.unavailable.push(seq),
            }
        }
        start = end;
    }
    fill
}
