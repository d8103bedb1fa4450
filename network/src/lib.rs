mod communication;
mod failover;
mod link;
mod manager;
mod relay;

pub use communication::{
    connect_with_retry, read_envelope, write_envelope, Connector, RelayConnection, TcpConnector,
};
pub use failover::FailoverPolicy;
pub use link::{LinkCommand, RelayLink};
pub use manager::NetworkManager;
pub use relay::Relay;

use consensus::{LeaderInfo, NetworkTuple};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn of_leader(info: &LeaderInfo) -> Self {
        let (ip, port) = info.relay_endpoint();
        Self { ip, port }
    }

    pub fn of_tuple(tuple: &NetworkTuple) -> Self {
        let (ip, port) = tuple.relay_endpoint();
        Self { ip, port }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No relay available: {0}")]
    NoRelayAvailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_ip: IpAddr,
    pub relay_port: u16,
    pub seed_relay: Option<Endpoint>,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay_port: 3333,
            seed_relay: None,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 200,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.relay_port)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}
