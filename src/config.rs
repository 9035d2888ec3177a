//! Parameters the core runs with. Parsed by the binaries, validated here.
use crate::error::ConfigError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// How often blocking loops wake up to check for shutdown.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub const MAX_CLIENT_ID: u32 = 10_000;
const MIN_PORT: u16 = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub group: Ipv4Addr,
    pub multicast_port: u16,
    pub multicast_ttl: u32,
    pub submit_host: IpAddr,
    pub submit_port: u16,
    pub repair_host: IpAddr,
    pub repair_port: u16,
    /// Probability in `[0, 1]` of discarding a received datagram.
    pub drop_probability: f64,
    pub drop_seed: Option<u64>,
    pub client_id: u32,
    pub repair_timeout: Duration,
    pub repair_parallelism: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(224, 1, 1, 1),
            multicast_port: 5000,
            multicast_ttl: 2,
            submit_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            submit_port: 5001,
            repair_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            repair_port: 5002,
            drop_probability: 0.0,
            drop_seed: None,
            client_id: 0,
            repair_timeout: Duration::from_secs(2),
            repair_parallelism: 4,
        }
    }
}

impl FeedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ports = [
            ("multicast", self.multicast_port),
            ("submission", self.submit_port),
            ("repair", self.repair_port),
        ];
        for (name, port) in ports {
            if port < MIN_PORT {
                return Err(ConfigError::PortOutOfRange { name, port });
            }
        }
        for (i, &(first, port)) in ports.iter().enumerate() {
            if let Some(&(second, _)) = ports[i + 1..].iter().find(|&&(_, p)| p == port) {
                return Err(ConfigError::PortConflict { first, second, port });
            }
        }
        if !self.group.is_multicast() {
            return Err(ConfigError::NotMulticast(self.group));
        }
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(ConfigError::DropProbability(self.drop_probability));
        }
        if self.client_id > MAX_CLIENT_ID {
            return Err(ConfigError::ClientId(self.client_id));
        }
        if self.repair_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.repair_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        Ok(())
    }

    pub fn multicast_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.multicast_port)
    }

    pub fn submit_addr(&self) -> SocketAddr {
        SocketAddr::new(self.submit_host, self.submit_port)
    }

    pub fn repair_addr(&self) -> SocketAddr {
        SocketAddr::new(self.repair_host, self.repair_port)
    }
}
