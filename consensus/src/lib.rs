mod handlers;
mod manager;
mod messages;
mod registry;
mod state;
mod timeout;
mod timer;

pub use handlers::{ConsensusHandlers, HandlersRegistry, MessageHandler, TimeoutBehavior};
pub use manager::ConsensusManager;
pub use messages::{Envelope, LeaderInfo, MembershipChange, NodeHello, Payload, Topic, Vote};
pub use registry::{NetworkRegistry, NetworkTuple};
pub use state::{Role, StateMachine};
pub use timeout::{LeaderElectedCallback, SendCallback, TimeoutHandler};
pub use timer::{TimeoutKind, Timer, TimerEvent, TimerHandle};

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Random identifier a node campaigns under, fixed for the process lifetime.
///
/// It names the candidate in vote requests and keys the voter's ledger, so two
/// nodes never share one. On the wire it is a decimal string; numeric input is
/// accepted when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidateId(pub u64);

impl CandidateId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for CandidateId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CandidateId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(Self(value)),
            Repr::Text(text) => text
                .parse()
                .map(Self)
                .map_err(|_| serde::de::Error::custom(format!("invalid candidate id: {text}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Term(pub u64);

impl Term {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub advertised_ip: String,
    pub relay_port: u16,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            advertised_ip: "127.0.0.1".to_string(),
            relay_port: 3333,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConsensusError::InvalidConfig(format!(
                "election timeout window [{}, {}) is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConsensusError::InvalidConfig(format!(
                "heartbeat interval {}ms must be shorter than the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        Ok(())
    }

    pub fn random_election_timeout(&self) -> Duration {
        let timeout_ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..self.election_timeout_max_ms);
        Duration::from_millis(timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Malformed payload: {0}")]
    Deserialization(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Illegal role transition: {from} -> {to}")]
    IllegalTransition { from: Role, to: Role },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_id_accepts_string_and_number() {
        let from_text: CandidateId = serde_json::from_str("\"42\"").unwrap();
        let from_number: CandidateId = serde_json::from_str("42").unwrap();
        assert_eq!(from_text, CandidateId(42));
        assert_eq!(from_number, CandidateId(42));
        assert_eq!(serde_json::to_string(&CandidateId(42)).unwrap(), "\"42\"");
        assert!(serde_json::from_str::<CandidateId>("\"abc\"").is_err());
    }

    #[test]
    fn config_rejects_heartbeat_slower_than_election() {
        let config = Config {
            heartbeat_interval_ms: 200,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConsensusError::InvalidConfig(_))));

        let config = Config {
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 300,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn election_timeout_stays_in_window() {
        let config = Config::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout < Duration::from_millis(300));
        }
    }
}
