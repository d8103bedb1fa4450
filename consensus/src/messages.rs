use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::registry::NetworkTuple;
use crate::{CandidateId, ConsensusError, NodeId, Result, Term};

/// Unit of exchange through a relay. The topic stays a plain string on the wire
/// so the relay can forward topics it does not know about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub key: Uuid,
    pub topic: String,
    #[serde(default)]
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(topic: Topic, payload: Bytes) -> Self {
        Self::with_key(Uuid::new_v4(), topic, payload)
    }

    pub fn with_key(key: Uuid, topic: Topic, payload: Bytes) -> Self {
        Self {
            key,
            topic: topic.as_str().to_string(),
            payload,
        }
    }

    pub fn topic(&self) -> Option<Topic> {
        self.topic.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    LeaderVote,
    Heartbeat,
    LeaderInfo,
    NewRegistry,
    NetworkChanged,
    ClientConnOpened,
    ClientConnClosed,
    NodeHello,
    ConnAck,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::LeaderVote,
        Topic::Heartbeat,
        Topic::LeaderInfo,
        Topic::NewRegistry,
        Topic::NetworkChanged,
        Topic::ClientConnOpened,
        Topic::ClientConnClosed,
        Topic::NodeHello,
        Topic::ConnAck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::LeaderVote => "LEADER_VOTE",
            Topic::Heartbeat => "HEARTBEAT",
            Topic::LeaderInfo => "LEADER_INFO",
            Topic::NewRegistry => "NEW_REGISTRY",
            Topic::NetworkChanged => "NETWORK_CHANGED",
            Topic::ClientConnOpened => "CLIENT_CONN_OPENED",
            Topic::ClientConnClosed => "CLIENT_CONN_CLOSED",
            Topic::NodeHello => "NODE_HELLO",
            Topic::ConnAck => "CONN_ACK",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| ConsensusError::Deserialization(format!("unknown topic: {s}")))
    }
}

pub trait Payload: Serialize + DeserializeOwned {
    fn to_byte_array(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn from_byte_array(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ConsensusError::Deserialization(e.to_string()))
    }
}

/// A vote request when `candidate_id` belongs to someone else, a grant when it
/// is ours and `node_id` names another voter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub term: Term,
    pub candidate_id: CandidateId,
    pub node_id: NodeId,
}

impl Payload for Vote {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderInfo {
    pub ip: String,
    pub port: u16,
    pub term: Term,
    pub candidate_id: CandidateId,
    pub node_id: NodeId,
}

impl LeaderInfo {
    pub fn relay_endpoint(&self) -> (String, u16) {
        (self.ip.clone(), self.port)
    }
}

impl Payload for LeaderInfo {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipChange {
    pub num_of_nodes: usize,
    pub ips: Vec<String>,
    #[serde(default)]
    pub peers: Vec<NetworkTuple>,
}

impl Payload for MembershipChange {}

/// First envelope a node sends after connecting; the relay keeps it and does
/// not forward it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeHello {
    pub node_id: NodeId,
    pub relay_port: u16,
}

impl Payload for NodeHello {}
