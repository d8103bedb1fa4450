use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::messages::Payload;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NetworkTuple {
    pub id: String,
    pub ip: String,
    /// Remote port the relay observed for the node's connection.
    pub port: u16,
    /// Port the node's own relay listens on, 0 when not announced.
    pub relay_port: u16,
    #[serde(default = "available")]
    pub is_available: bool,
}

fn available() -> bool {
    true
}

impl NetworkTuple {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16, relay_port: u16) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            port,
            relay_port,
            is_available: true,
        }
    }

    pub fn has_relay(&self) -> bool {
        self.relay_port != 0
    }

    pub fn relay_endpoint(&self) -> (String, u16) {
        (self.ip.clone(), self.relay_port)
    }

    fn sort_key(&self) -> (u16, u16, &str, &str) {
        (self.port, self.relay_port, &self.id, &self.ip)
    }
}

/// Known relay endpoints, always kept sorted by port.
///
/// Lookups return the entry together with its index in [`items`](Self::items).
/// An index is only meaningful for the registry value it came from; any
/// mutation in between may shift it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "Vec<NetworkTuple>", into = "Vec<NetworkTuple>")]
pub struct NetworkRegistry {
    items: Vec<NetworkTuple>,
}

impl From<Vec<NetworkTuple>> for NetworkRegistry {
    fn from(items: Vec<NetworkTuple>) -> Self {
        let mut registry = Self::default();
        for tuple in items {
            registry.add_item(tuple);
        }
        registry
    }
}

impl From<NetworkRegistry> for Vec<NetworkTuple> {
    fn from(registry: NetworkRegistry) -> Self {
        registry.items
    }
}

impl Payload for NetworkRegistry {}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a relay membership notice. `peers` carries the
    /// entries of nodes that announced themselves; any address in `ips` with no
    /// matching peer becomes an entry keyed by its address with no relay port.
    pub fn from_membership(ips: &[String], peers: &[NetworkTuple]) -> Self {
        let mut registry = Self::new();
        for address in ips.iter().filter(|address| !address.is_empty()) {
            let Some((host, port)) = split_host_port(address) else {
                tracing::warn!(%address, "Skipping malformed member address");
                continue;
            };
            let tuple = peers
                .iter()
                .find(|peer| peer.ip == host && peer.port == port)
                .cloned()
                .unwrap_or_else(|| NetworkTuple::new(address.clone(), host, port, 0));
            registry.add_item(tuple);
        }
        for peer in peers {
            if registry.item_by_id(&peer.id).is_none() {
                registry.add_item(peer.clone());
            }
        }
        registry
    }

    pub fn add_item(&mut self, tuple: NetworkTuple) {
        self.items.retain(|existing| existing.id != tuple.id);
        let position = self
            .items
            .partition_point(|existing| existing.sort_key() < tuple.sort_key());
        self.items.insert(position, tuple);
    }

    pub fn remove_item(&mut self, index: usize) -> Option<NetworkTuple> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    /// Marks the relay at `ip:relay_port` unavailable. Returns whether an entry matched.
    pub fn set_queue_unresponsive(&mut self, ip: &str, relay_port: u16) -> bool {
        match self
            .items
            .iter_mut()
            .find(|tuple| tuple.ip == ip && tuple.relay_port == relay_port)
        {
            Some(tuple) => {
                tuple.is_available = false;
                true
            }
            None => false,
        }
    }

    pub fn items(&self) -> &[NetworkTuple] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_by_id(&self, id: &str) -> Option<(&NetworkTuple, usize)> {
        self.find(|tuple| tuple.id == id)
    }

    pub fn item_by_remote_addr_port(&self, port: u16) -> Option<(&NetworkTuple, usize)> {
        self.find(|tuple| tuple.port == port)
    }

    pub fn item_by_ip_and_port(&self, ip: &str, relay_port: u16) -> Option<(&NetworkTuple, usize)> {
        self.find(|tuple| tuple.ip == ip && tuple.relay_port == relay_port)
    }

    pub fn next_queue(&self) -> Option<&NetworkTuple> {
        self.items.iter().find(|tuple| tuple.is_available)
    }

    pub fn to_byte_array(&self) -> Result<Bytes> {
        Payload::to_byte_array(self)
    }

    pub fn from_byte_array(data: &[u8]) -> Result<Self> {
        Payload::from_byte_array(data)
    }

    fn find(&self, predicate: impl Fn(&NetworkTuple) -> bool) -> Option<(&NetworkTuple, usize)> {
        self.items
            .iter()
            .enumerate()
            .find(|(_, tuple)| predicate(tuple))
            .map(|(index, tuple)| (tuple, index))
    }
}

fn split_host_port(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}
