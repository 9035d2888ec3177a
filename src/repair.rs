//! Point lookups into the record log over TCP.
//!
//! One request and one response per connection. Lookups never take the
//! writer's side of the log, so they run concurrently with appends.
use crate::codec;
use crate::error::CodecError;
use crate::record::{RepairRequest, RepairResponse};
use crate::record_log::RecordLog;
use crate::repair_client::{Repair, RepairOutcome};
use std::io::{self, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(20);

/// Answer a single request against the log.
pub fn answer(log: &RecordLog, request: &RepairRequest) -> RepairResponse {
    match log.get(request.sequence) {
        Some(record) => {
            debug!(client = request.client_id, sequence = request.sequence, "repair hit");
            RepairResponse::Found((*record).clone())
        }
        None => {
            let log_len = log.len();
            info!(
                client = request.client_id,
                sequence = request.sequence,
                log_len,
                "repair requested for unassigned sequence"
            );
            RepairResponse::NotFound { sequence: request.sequence, log_len }
        }
    }
}

/// In-process repair straight from the log.
impl Repair for RecordLog {
    fn repair(&self, sequence: u64) -> RepairOutcome {
        match self.get(sequence) {
            Some(record) => RepairOutcome::Repaired((*record).clone()),
            None => RepairOutcome::NotFound,
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    log: &RecordLog,
    io_timeout: Duration,
) -> Result<(), CodecError> {
    // accepted sockets inherit O_NONBLOCK on some platforms
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    let Some(request) = codec::read_frame::<_, RepairRequest>(&mut stream)? else {
        return Ok(());
    };
    let bytes = codec::encode(&answer(log, &request))?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

pub struct RepairService {
    listener: TcpListener,
    log: Arc<RecordLog>,
    io_timeout: Duration,
}

impl RepairService {
    pub fn bind(addr: SocketAddr, log: Arc<RecordLog>, io_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, log, io_timeout })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` is set, one thread per connection. Returns
    /// after every in-flight connection has finished.
    pub fn run(self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        let mut served = 0u64;
        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    served += 1;
                    let log = Arc::clone(&self.log);
                    let io_timeout = self.io_timeout;
                    in_flight.push(thread::spawn(move || {
                        if let Err(e) = serve_connection(stream, &log, io_timeout) {
                            debug!(%peer, error = %e, "repair connection dropped");
                        }
                    }));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    in_flight.retain(|h| !h.is_finished());
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(e) => {
                    warn!(error = %e, "repair accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
        for handle in in_flight {
            let _ = handle.join();
        }
        info!(served, "repair service stopped");
        Ok(())
    }
}
