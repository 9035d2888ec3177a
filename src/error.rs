//! Typed failures surfaced by the library.
//!
//! Expected protocol states (a missing sequence, an unreachable repair
//! service) are not errors and live in outcome enums next to the code that
//! produces them. The types here cover input that must be rejected.
use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Why an inbound order was rejected before reaching the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("order is not valid JSON: {0}")]
    NotJson(String),

    #[error("order is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    #[error("invalid action `{0}` (expected BUY or SELL)")]
    InvalidAction(String),

    #[error("symbol must be a non-empty string")]
    InvalidSymbol,

    #[error("price is not numeric: {0}")]
    InvalidPrice(String),
}

/// Out-of-range configuration handed to the core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name} port {port} outside 1024..=65535")]
    PortOutOfRange { name: &'static str, port: u16 },

    #[error("{first} and {second} ports both set to {port}")]
    PortConflict {
        first: &'static str,
        second: &'static str,
        port: u16,
    },

    #[error("{0} is not a multicast group address")]
    NotMulticast(Ipv4Addr),

    #[error("drop probability {0} outside [0, 1]")]
    DropProbability(f64),

    #[error("client id {0} outside 0..=10000")]
    ClientId(u32),

    #[error("repair timeout must be non-zero")]
    ZeroTimeout,

    #[error("repair parallelism must be at least 1")]
    ZeroParallelism,
}

/// Framing failures on any channel.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame truncated: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    #[error("frame length {0} exceeds limit")]
    Oversized(usize),

    #[error("trailing {0} bytes after frame")]
    Trailing(usize),

    #[error("CRC mismatch: frame={expected:#x}, calc={actual:#x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
