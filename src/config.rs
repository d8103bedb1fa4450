use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::error::{O3FabricError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_ip: IpAddr,
    pub relay_port: u16,
    pub seed_relay: Option<SocketAddr>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

impl Config {
    pub fn new(node_ip: IpAddr, relay_port: u16, seed_relay: Option<SocketAddr>) -> Self {
        Self {
            node_ip,
            relay_port,
            seed_relay,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 200,
        }
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.node_ip, self.relay_port)
    }

    /// Consensus settings for a relay that ended up on `relay_port`, which
    /// differs from the configured one when that was 0.
    pub fn consensus_config(&self, relay_port: u16) -> consensus::Config {
        consensus::Config {
            relay_port,
            ..consensus::Config::from(self.clone())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_ip.is_unspecified() {
            return Err(O3FabricError::InvalidConfig(format!(
                "{} cannot be advertised to other nodes",
                self.node_ip
            )));
        }
        consensus::Config::from(self.clone()).validate()?;
        Ok(())
    }
}

impl From<Config> for consensus::Config {
    fn from(config: Config) -> Self {
        consensus::Config {
            advertised_ip: config.node_ip.to_string(),
            relay_port: config.relay_port,
            election_timeout_min_ms: config.election_timeout_min_ms,
            election_timeout_max_ms: config.election_timeout_max_ms,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
        }
    }
}

impl From<Config> for network::Config {
    fn from(config: Config) -> Self {
        network::Config {
            listen_ip: config.node_ip,
            relay_port: config.relay_port,
            seed_relay: config.seed_relay.map(network::Endpoint::from),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_backoff_ms: config.reconnect_backoff_ms,
        }
    }
}
