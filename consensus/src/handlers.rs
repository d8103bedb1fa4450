use std::collections::HashMap;
use uuid::Uuid;

use crate::messages::{Envelope, LeaderInfo, MembershipChange, Payload, Topic, Vote};
use crate::registry::NetworkRegistry;
use crate::timer::TimeoutKind;
use crate::{CandidateId, NodeId, Result};

/// Everything the election protocol reacts to. `TimeoutHandler` is the one
/// implementation; [`HandlersRegistry`] decides which method an input reaches.
pub trait ConsensusHandlers {
    fn node_id(&self) -> NodeId;
    fn candidate_id(&self) -> CandidateId;

    fn on_vote_request(&mut self, vote: Vote) -> Result<()>;
    fn on_vote_granted(&mut self, vote: Vote) -> Result<()>;
    fn on_heartbeat(&mut self, key: Uuid) -> Result<()>;
    fn on_membership_changed(&mut self, change: MembershipChange) -> Result<()>;
    fn on_registry_snapshot(&mut self, registry: NetworkRegistry) -> Result<()>;
    fn on_leader_info(&mut self, info: LeaderInfo) -> Result<()>;
    fn on_election_timeout(&mut self) -> Result<()>;
    fn on_heartbeat_timeout(&mut self) -> Result<()>;
}

pub type MessageHandler<H> = fn(&mut H, &Envelope) -> Result<()>;
pub type TimeoutBehavior<H> = fn(&mut H) -> Result<()>;

pub struct HandlersRegistry<H> {
    messages: HashMap<Topic, MessageHandler<H>>,
    timeouts: HashMap<TimeoutKind, TimeoutBehavior<H>>,
}

impl<H: ConsensusHandlers> Default for HandlersRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ConsensusHandlers> HandlersRegistry<H> {
    pub fn new() -> Self {
        let mut messages: HashMap<Topic, MessageHandler<H>> = HashMap::new();
        messages.insert(Topic::LeaderVote, handle_vote::<H>);
        messages.insert(Topic::Heartbeat, handle_heartbeat::<H>);
        messages.insert(Topic::ClientConnOpened, handle_membership::<H>);
        messages.insert(Topic::ClientConnClosed, handle_membership::<H>);
        messages.insert(Topic::NewRegistry, handle_registry::<H>);
        messages.insert(Topic::NetworkChanged, handle_registry::<H>);
        messages.insert(Topic::LeaderInfo, handle_leader_info::<H>);

        let mut timeouts: HashMap<TimeoutKind, TimeoutBehavior<H>> = HashMap::new();
        timeouts.insert(TimeoutKind::Election, H::on_election_timeout);
        timeouts.insert(TimeoutKind::Heartbeat, H::on_heartbeat_timeout);

        Self { messages, timeouts }
    }

    pub fn message_handler(&self, topic: Topic) -> Option<MessageHandler<H>> {
        self.messages.get(&topic).copied()
    }

    pub fn timeout_handler(&self, kind: TimeoutKind) -> Option<TimeoutBehavior<H>> {
        self.timeouts.get(&kind).copied()
    }

    pub fn dispatch(&self, target: &mut H, envelope: &Envelope) -> Result<()> {
        let Some(handler) = envelope.topic().and_then(|topic| self.message_handler(topic)) else {
            tracing::trace!(topic = %envelope.topic, "No consensus handler for topic");
            return Ok(());
        };
        handler(target, envelope)
    }

    pub fn dispatch_timeout(&self, target: &mut H, kind: TimeoutKind) -> Result<()> {
        match self.timeout_handler(kind) {
            Some(behavior) => behavior(target),
            None => Ok(()),
        }
    }
}

fn handle_vote<H: ConsensusHandlers>(target: &mut H, envelope: &Envelope) -> Result<()> {
    let vote = Vote::from_byte_array(&envelope.payload)?;
    if vote.candidate_id != target.candidate_id() {
        target.on_vote_request(vote)
    } else if vote.node_id != target.node_id() {
        target.on_vote_granted(vote)
    } else {
        // Our own request coming back through the relay.
        Ok(())
    }
}

fn handle_heartbeat<H: ConsensusHandlers>(target: &mut H, envelope: &Envelope) -> Result<()> {
    target.on_heartbeat(envelope.key)
}

fn handle_membership<H: ConsensusHandlers>(target: &mut H, envelope: &Envelope) -> Result<()> {
    let change = MembershipChange::from_byte_array(&envelope.payload)?;
    target.on_membership_changed(change)
}

fn handle_registry<H: ConsensusHandlers>(target: &mut H, envelope: &Envelope) -> Result<()> {
    let registry = NetworkRegistry::from_byte_array(&envelope.payload)?;
    target.on_registry_snapshot(registry)
}

fn handle_leader_info<H: ConsensusHandlers>(target: &mut H, envelope: &Envelope) -> Result<()> {
    let info = LeaderInfo::from_byte_array(&envelope.payload)?;
    target.on_leader_info(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConsensusError, Term};
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        node_id: NodeId,
        calls: Vec<&'static str>,
    }

    impl ConsensusHandlers for Recorder {
        fn node_id(&self) -> NodeId {
            self.node_id
        }
        fn candidate_id(&self) -> CandidateId {
            CandidateId(1)
        }
        fn on_vote_request(&mut self, _: Vote) -> Result<()> {
            self.calls.push("vote_request");
            Ok(())
        }
        fn on_vote_granted(&mut self, _: Vote) -> Result<()> {
            self.calls.push("vote_granted");
            Ok(())
        }
        fn on_heartbeat(&mut self, _: Uuid) -> Result<()> {
            self.calls.push("heartbeat");
            Ok(())
        }
        fn on_membership_changed(&mut self, _: MembershipChange) -> Result<()> {
            self.calls.push("membership");
            Ok(())
        }
        fn on_registry_snapshot(&mut self, _: NetworkRegistry) -> Result<()> {
            self.calls.push("registry");
            Ok(())
        }
        fn on_leader_info(&mut self, _: LeaderInfo) -> Result<()> {
            self.calls.push("leader_info");
            Ok(())
        }
        fn on_election_timeout(&mut self) -> Result<()> {
            self.calls.push("election_timeout");
            Ok(())
        }
        fn on_heartbeat_timeout(&mut self) -> Result<()> {
            self.calls.push("heartbeat_timeout");
            Ok(())
        }
    }

    fn vote_envelope(candidate: u64, voter: NodeId) -> Envelope {
        let vote = Vote {
            term: Term(3),
            candidate_id: CandidateId(candidate),
            node_id: voter,
        };
        Envelope::new(Topic::LeaderVote, vote.to_byte_array().unwrap())
    }

    #[test]
    fn classifies_votes() {
        let registry = HandlersRegistry::<Recorder>::new();
        let mut recorder = Recorder::default();
        let own = recorder.node_id;

        registry.dispatch(&mut recorder, &vote_envelope(9, NodeId::new())).unwrap();
        registry.dispatch(&mut recorder, &vote_envelope(1, NodeId::new())).unwrap();
        registry.dispatch(&mut recorder, &vote_envelope(1, own)).unwrap();

        assert_eq!(recorder.calls, vec!["vote_request", "vote_granted"]);
    }

    #[test]
    fn routes_every_protocol_topic() {
        let registry = HandlersRegistry::<Recorder>::new();
        let mut recorder = Recorder::default();

        let membership = MembershipChange::default().to_byte_array().unwrap();
        let snapshot = NetworkRegistry::new().to_byte_array().unwrap();
        let info = LeaderInfo {
            ip: "127.0.0.1".into(),
            port: 3333,
            term: Term(1),
            candidate_id: CandidateId(5),
            node_id: NodeId::new(),
        }
        .to_byte_array()
        .unwrap();

        for envelope in [
            Envelope::new(Topic::Heartbeat, Bytes::new()),
            Envelope::new(Topic::ClientConnOpened, membership.clone()),
            Envelope::new(Topic::ClientConnClosed, membership),
            Envelope::new(Topic::NetworkChanged, snapshot.clone()),
            Envelope::new(Topic::NewRegistry, snapshot),
            Envelope::new(Topic::LeaderInfo, info),
        ] {
            registry.dispatch(&mut recorder, &envelope).unwrap();
        }
        registry.dispatch_timeout(&mut recorder, TimeoutKind::Election).unwrap();
        registry.dispatch_timeout(&mut recorder, TimeoutKind::Heartbeat).unwrap();

        assert_eq!(
            recorder.calls,
            vec![
                "heartbeat",
                "membership",
                "membership",
                "registry",
                "registry",
                "leader_info",
                "election_timeout",
                "heartbeat_timeout"
            ]
        );
    }

    #[test]
    fn unknown_and_relay_topics_are_ignored() {
        let registry = HandlersRegistry::<Recorder>::new();
        let mut recorder = Recorder::default();
        let mut envelope = Envelope::new(Topic::ConnAck, Bytes::new());
        registry.dispatch(&mut recorder, &envelope).unwrap();
        envelope.topic = "sport".to_string();
        registry.dispatch(&mut recorder, &envelope).unwrap();
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn malformed_payload_never_reaches_handler() {
        let registry = HandlersRegistry::<Recorder>::new();
        let mut recorder = Recorder::default();
        let envelope = Envelope::new(Topic::LeaderInfo, Bytes::from_static(b"not json"));
        let err = registry.dispatch(&mut recorder, &envelope).unwrap_err();
        assert!(matches!(err, ConsensusError::Deserialization(_)));
        assert!(recorder.calls.is_empty());
    }
}
