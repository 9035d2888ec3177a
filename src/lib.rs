//! Reliable delivery of trade orders over UDP multicast.
//!
//! A publisher assigns each accepted order a sequence number, appends it to
//! an in-memory log and multicasts it. Subscribers deliver records strictly
//! in sequence order and fetch anything they missed from the publisher's
//! repair service over TCP.
//!
//! - `record`: orders, records and every message that goes on the wire
//! - `codec`: CRC-checked bincode framing used by all channels
//! - `record_log`: the append-only log shared by publisher and repair
//! - `publisher`: intake, sequencing and fan-out
//! - `repair` / `repair_client`: both ends of gap repair
//! - `subscriber`: receive path, gap detection and loss simulation
//! - `capture`: on-disk journal of what a subscriber delivered
//!
//! The binaries (`src/main.rs`, `src/bin/*.rs`) wire these to sockets and
//! command-line configuration.
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod record;
pub mod record_log;
pub mod repair;
pub mod repair_client;
pub mod subscriber;
