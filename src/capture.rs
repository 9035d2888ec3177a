//! Journal of a subscriber's delivered records.
//!
//! File layout is a header frame followed by one frame per record, each
//! framed as in [`crate::codec`]. Writing happens on a dedicated thread fed
//! by a channel so delivery never waits on disk.
use crate::codec;
use crate::record::{now_unix_ns, CaptureFrame, CaptureHeader, Record};
use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const CAPTURE_VERSION: u16 = 1;

pub fn header(client_id: u32, group: impl Into<String>) -> CaptureHeader {
    CaptureHeader {
        version: CAPTURE_VERSION,
        created_unix_ns: now_unix_ns(),
        client_id,
        group: group.into(),
    }
}

/// `captures/client-<id>_YYYY_MM_DD.bin`, local date when available.
pub fn default_path(client_id: u32) -> PathBuf {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let d = now.date();
    let mut p = PathBuf::from("captures");
    p.push(format!("client-{}_{}_{:02}_{:02}.bin", client_id, d.year(), d.month() as u8, d.day()));
    p
}

/// Drain `rx` into `out` until the channel closes. Returns the number of
/// records written.
pub fn writer_thread(out: PathBuf, header: CaptureHeader, rx: Receiver<Record>) -> Result<u64> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&out)
        .with_context(|| format!("open {:?}", out))?;
    let mut w = BufWriter::with_capacity(1 << 16, file);
    codec::write_frame(&mut w, &CaptureFrame::Header(header))?;
    let mut written = 0u64;
    for record in rx {
        codec::write_frame(&mut w, &CaptureFrame::Record(record))?;
        written += 1;
    }
    w.flush()?;
    Ok(written)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub header: CaptureHeader,
    pub records: Vec<Record>,
}

impl Capture {
    /// Half-open ranges of sequence numbers absent between 0 and the highest
    /// delivered one.
    pub fn missing(&self) -> Vec<Range<u64>> {
        let mut missing = Vec::new();
        let mut next = 0u64;
        for r in &self.records {
            if r.sequence > next {
                missing.push(next..r.sequence);
            }
            next = next.max(r.sequence.saturating_add(1));
        }
        missing
    }

    /// Total count of absent sequence numbers.
    pub fn missing_count(&self) -> u64 {
        self.missing().iter().map(|r| r.end - r.start).sum()
    }

    /// First position where delivery did not strictly increase.
    pub fn first_order_violation(&self) -> Option<usize> {
        self.records
            .windows(2)
            .position(|w| w[1].sequence <= w[0].sequence)
            .map(|i| i + 1)
    }
}

pub fn read_capture(path: &Path) -> Result<Capture> {
    let mut rdr = BufReader::new(File::open(path).with_context(|| format!("open {:?}", path))?);
    let header = match codec::read_frame::<_, CaptureFrame>(&mut rdr).context("read header")? {
        Some(CaptureFrame::Header(h)) => h,
        Some(CaptureFrame::Record(_)) => bail!("capture does not start with a header"),
        None => bail!("empty capture file"),
    };
    if header.version != CAPTURE_VERSION {
        bail!("unsupported capture version {}", header.version);
    }
    let mut records = Vec::new();
    let mut frames = 1usize;
    while let Some(frame) = codec::read_frame::<_, CaptureFrame>(&mut rdr)
        .with_context(|| format!("frame {}", frames))?
    {
        frames += 1;
        match frame {
            CaptureFrame::Record(r) => records.push(r),
            CaptureFrame::Header(_) => bail!("unexpected header at frame {}", frames - 1),
        }
    }
    Ok(Capture { header, records })
}
