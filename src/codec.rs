//! CRC-checked bincode framing shared by every channel.
//!
//! Layout: `[len: u32 LE][crc32: u32 LE][payload: len bytes]` where the
//! payload is the bincode encoding of the message. A datagram holds exactly
//! one frame; a stream holds frames back to back.
use crate::error::CodecError;
use crc32fast::Hasher as Crc32;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{ErrorKind, Read, Write};

pub const HEADER_LEN: usize = 8;
pub const MAX_PAYLOAD: usize = 64 * 1024;

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    hasher.finalize()
}

fn header(payload: &[u8]) -> Result<[u8; HEADER_LEN], CodecError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(CodecError::Oversized(payload.len()));
    }
    let mut out = [0u8; HEADER_LEN];
    out[..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    out[4..].copy_from_slice(&checksum(payload).to_le_bytes());
    Ok(out)
}

fn verify<T: DeserializeOwned>(crc_on_wire: u32, payload: &[u8]) -> Result<T, CodecError> {
    let crc_calc = checksum(payload);
    if crc_calc != crc_on_wire {
        return Err(CodecError::Checksum { expected: crc_on_wire, actual: crc_calc });
    }
    Ok(bincode::deserialize(payload)?)
}

/// Encode one message as a self-contained frame (one datagram).
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(value)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header(&payload)?);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a datagram that must contain exactly one frame.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated { have: buf.len(), need: HEADER_LEN });
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len > MAX_PAYLOAD {
        return Err(CodecError::Oversized(len));
    }
    let body = &buf[HEADER_LEN..];
    if body.len() < len {
        return Err(CodecError::Truncated { have: buf.len(), need: HEADER_LEN + len });
    }
    if body.len() > len {
        return Err(CodecError::Trailing(body.len() - len));
    }
    verify(crc, body)
}

pub fn write_frame<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<(), CodecError> {
    let payload = bincode::serialize(value)?;
    w.write_all(&header(&payload)?)?;
    w.write_all(&payload)?;
    Ok(())
}

/// Read the next frame from a stream. `Ok(None)` on a clean end of stream
/// at a frame boundary.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>, CodecError> {
    let mut head = [0u8; HEADER_LEN];
    match r.read_exact(&mut head[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    r.read_exact(&mut head[1..])?;
    let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
    let crc = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
    if len > MAX_PAYLOAD {
        return Err(CodecError::Oversized(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    verify(crc, &payload).map(Some)
}
