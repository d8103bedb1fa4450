use consensus::{LeaderInfo, NetworkRegistry};

use crate::Endpoint;

#[derive(Debug, Default, Clone, Copy)]
pub struct FailoverPolicy;

impl FailoverPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Marks `current` unresponsive in `registry` and picks the first
    /// available entry that is not `current` and has announced a relay.
    pub fn on_disconnect(&self, registry: &mut NetworkRegistry, current: &Endpoint) -> Option<Endpoint> {
        if !registry.set_queue_unresponsive(&current.ip, current.port) {
            tracing::debug!(relay = %current, "Lost relay was not in the registry");
        }

        registry
            .items()
            .iter()
            .filter(|tuple| tuple.is_available && tuple.has_relay())
            .map(Endpoint::of_tuple)
            .find(|endpoint| endpoint != current)
    }

    pub fn on_leader_elected(&self, info: &LeaderInfo, current: &Endpoint) -> Option<Endpoint> {
        let leader = Endpoint::of_leader(info);
        (leader != *current).then_some(leader)
    }
}
