use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::handlers::{ConsensusHandlers, HandlersRegistry};
use crate::messages::{Envelope, LeaderInfo, MembershipChange, Payload, Topic, Vote};
use crate::registry::NetworkRegistry;
use crate::state::{Role, StateMachine};
use crate::timer::{TimeoutKind, Timer, TimerEvent};
use crate::{CandidateId, Config, ConsensusError, NodeId, Result, Term};

pub type SendCallback = Box<dyn Fn(Envelope) + Send + Sync>;
pub type LeaderElectedCallback = Box<dyn Fn(&LeaderInfo) + Send + Sync>;

const RECENT_HEARTBEATS: usize = 512;
const VOTE_LEDGER_TERMS: usize = 1024;

/// Votes this node has handed out.
///
/// Keyed both ways: by candidate (the last term each candidate got our vote
/// in) and by term (who got it). A request is granted only when both are
/// free, so a term never yields more than one grant whatever the candidate.
/// The per-term side forgets its oldest entries past `VOTE_LEDGER_TERMS`.
#[derive(Debug, Default)]
struct VoteLedger {
    last_voted_term: HashMap<CandidateId, Term>,
    granted: HashMap<Term, CandidateId>,
    order: VecDeque<Term>,
}

impl VoteLedger {
    fn try_grant(&mut self, candidate: CandidateId, term: Term) -> bool {
        if self.last_voted_term.get(&candidate) == Some(&term) || self.granted.contains_key(&term) {
            return false;
        }
        self.last_voted_term.insert(candidate, term);
        self.granted.insert(term, candidate);
        self.order.push_back(term);
        while self.order.len() > VOTE_LEDGER_TERMS {
            if let Some(oldest) = self.order.pop_front() {
                self.granted.remove(&oldest);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct SeenKeys {
    keys: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenKeys {
    fn insert(&mut self, key: Uuid) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > RECENT_HEARTBEATS {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }
}

/// Election and heartbeat engine of one node.
///
/// Owns the role, the term, the vote tally and ledger, the relay registry and
/// both timers. Not synchronized itself: callers serialize access, see
/// `ConsensusManager`.
pub struct TimeoutHandler {
    node_id: NodeId,
    candidate_id: CandidateId,
    config: Config,
    state_machine: StateMachine,
    term: Term,
    num_of_nodes: usize,
    votes_received: HashSet<NodeId>,
    ledger: VoteLedger,
    seen_heartbeats: SeenKeys,
    registry: NetworkRegistry,
    leader_info: Option<LeaderInfo>,
    election_timer: Timer,
    heartbeat_timer: Timer,
    send: Option<SendCallback>,
    leader_elected: Option<LeaderElectedCallback>,
    handlers: Arc<HandlersRegistry<TimeoutHandler>>,
}

impl TimeoutHandler {
    pub fn new(
        node_id: NodeId,
        candidate_id: CandidateId,
        config: Config,
        timer_events: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            node_id,
            candidate_id,
            config,
            state_machine: StateMachine::new(),
            term: Term::default(),
            num_of_nodes: 0,
            votes_received: HashSet::new(),
            ledger: VoteLedger::default(),
            seen_heartbeats: SeenKeys::default(),
            registry: NetworkRegistry::new(),
            leader_info: None,
            election_timer: Timer::new(TimeoutKind::Election, timer_events.clone()),
            heartbeat_timer: Timer::new(TimeoutKind::Heartbeat, timer_events),
            send: None,
            leader_elected: None,
            handlers: Arc::new(HandlersRegistry::new()),
        }
    }

    pub fn register_send_callback(&mut self, callback: SendCallback) {
        self.send = Some(callback);
    }

    pub fn on_leader_elected(&mut self, callback: LeaderElectedCallback) {
        self.leader_elected = Some(callback);
    }

    pub fn handlers_registry(&self) -> Arc<HandlersRegistry<TimeoutHandler>> {
        Arc::clone(&self.handlers)
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn role(&self) -> Role {
        self.state_machine.current_state()
    }

    pub fn num_of_nodes(&self) -> usize {
        self.num_of_nodes
    }

    pub fn set_num_of_nodes(&mut self, num_of_nodes: usize) {
        self.num_of_nodes = num_of_nodes;
    }

    pub fn network_registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    pub fn network_registry_mut(&mut self) -> &mut NetworkRegistry {
        &mut self.registry
    }

    pub fn set_network_registry(&mut self, registry: NetworkRegistry) {
        self.registry = registry;
    }

    pub fn leader_info(&self) -> Option<&LeaderInfo> {
        self.leader_info.as_ref()
    }

    pub fn set_leader_info(&mut self, info: LeaderInfo) {
        self.leader_info = Some(info);
    }

    pub fn is_heartbeat_armed(&self) -> bool {
        self.heartbeat_timer.is_armed()
    }

    pub fn start_election_time(&mut self) {
        let timeout = self.config.random_election_timeout();
        self.election_timer.start(timeout);
    }

    pub fn reset_election_time(&mut self) {
        self.election_timer.stop();
        self.start_election_time();
    }

    pub fn start_heartbeat_time(&mut self) {
        if !self.state_machine.is_leader() {
            return;
        }
        self.heartbeat_timer.start(self.config.heartbeat_interval());
    }

    pub fn reset_heartbeat_time(&mut self) {
        if !self.state_machine.is_leader() {
            return;
        }
        self.heartbeat_timer.stop();
        self.start_heartbeat_time();
    }

    pub fn change_state_to_leader(&mut self) -> Result<()> {
        self.state_machine.set_state(Role::Leader)?;
        self.start_heartbeat_time();
        Ok(())
    }

    pub fn handle_envelope(&mut self, envelope: &Envelope) {
        let handlers = self.handlers_registry();
        if let Err(e) = handlers.dispatch(self, envelope) {
            log_rejected(&envelope.topic, &e);
        }
    }

    pub fn handle_timer_event(&mut self, event: TimerEvent) {
        let accepted = match event.kind {
            TimeoutKind::Election => self.election_timer.accept(&event),
            TimeoutKind::Heartbeat => self.heartbeat_timer.accept(&event),
        };
        if !accepted {
            tracing::trace!(?event, "Discarding stale timer fire");
            return;
        }

        let handlers = self.handlers_registry();
        if let Err(e) = handlers.dispatch_timeout(self, event.kind) {
            tracing::error!(kind = ?event.kind, "Timeout handling failed: {}", e);
        }
    }

    pub fn stop_timers(&mut self) {
        self.election_timer.stop();
        self.heartbeat_timer.stop();
    }

    fn step_down(&mut self) -> Result<()> {
        self.state_machine.set_state(Role::Follower)?;
        self.heartbeat_timer.stop();
        Ok(())
    }

    fn send_message(&self, envelope: Envelope) {
        match &self.send {
            Some(send) => send(envelope),
            None => tracing::warn!(topic = %envelope.topic, "No send callback registered, dropping message"),
        }
    }

    fn own_leader_info(&self) -> LeaderInfo {
        LeaderInfo {
            ip: self.config.advertised_ip.clone(),
            port: self.config.relay_port,
            term: self.term,
            candidate_id: self.candidate_id,
            node_id: self.node_id,
        }
    }
}

impl ConsensusHandlers for TimeoutHandler {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn candidate_id(&self) -> CandidateId {
        self.candidate_id
    }

    fn on_vote_request(&mut self, vote: Vote) -> Result<()> {
        validate_term(vote.term, "vote request")?;
        if !self.ledger.try_grant(vote.candidate_id, vote.term) {
            tracing::debug!(term = %vote.term, candidate = %vote.candidate_id, "Already voted in this term");
            return Ok(());
        }

        self.reset_election_time();
        tracing::debug!(term = %vote.term, candidate = %vote.candidate_id, "Granting vote");
        let grant = Vote {
            node_id: self.node_id,
            ..vote
        };
        self.send_message(Envelope::new(Topic::LeaderVote, grant.to_byte_array()?));
        Ok(())
    }

    fn on_vote_granted(&mut self, vote: Vote) -> Result<()> {
        validate_term(vote.term, "vote grant")?;
        if self.role() != Role::Candidate || vote.term != self.term {
            tracing::trace!(term = %vote.term, current = %self.term, role = %self.role(), "Ignoring late vote");
            return Ok(());
        }
        if !self.votes_received.insert(vote.node_id) {
            return Ok(());
        }

        let count = self.votes_received.len();
        tracing::debug!(term = %self.term, count, total = self.num_of_nodes, "Vote received");
        if count > self.num_of_nodes / 2 {
            self.change_state_to_leader()?;
            tracing::info!(term = %self.term, votes = count, "Became leader");

            let info = self.own_leader_info();
            self.leader_info = Some(info.clone());
            self.send_message(Envelope::new(Topic::LeaderInfo, info.to_byte_array()?));
        }
        Ok(())
    }

    fn on_heartbeat(&mut self, key: Uuid) -> Result<()> {
        if !self.seen_heartbeats.insert(key) {
            return Ok(());
        }
        tracing::trace!(%key, "Heartbeat received");
        self.reset_heartbeat_time();
        self.reset_election_time();
        self.send_message(Envelope::with_key(key, Topic::Heartbeat, Bytes::new()));
        Ok(())
    }

    fn on_membership_changed(&mut self, change: MembershipChange) -> Result<()> {
        tracing::info!(nodes = change.num_of_nodes, "Relay membership changed");
        self.num_of_nodes = change.num_of_nodes;
        self.registry = NetworkRegistry::from_membership(&change.ips, &change.peers);
        let snapshot = self.registry.to_byte_array()?;
        self.send_message(Envelope::new(Topic::NewRegistry, snapshot));
        Ok(())
    }

    fn on_registry_snapshot(&mut self, registry: NetworkRegistry) -> Result<()> {
        tracing::debug!(entries = registry.len(), "Registry snapshot received");
        self.registry = registry;
        Ok(())
    }

    fn on_leader_info(&mut self, info: LeaderInfo) -> Result<()> {
        validate_term(info.term, "leader info")?;
        if info.node_id != self.node_id && self.role() != Role::Follower {
            tracing::info!(leader = %info.node_id, "Another node won the election");
            self.step_down()?;
        }

        tracing::info!(leader = %info.node_id, ip = %info.ip, port = info.port, term = %info.term, "Leader elected");
        self.leader_info = Some(info.clone());
        self.reset_election_time();
        if let Some(callback) = &self.leader_elected {
            callback(&info);
        }
        Ok(())
    }

    fn on_election_timeout(&mut self) -> Result<()> {
        if self.state_machine.is_leader() {
            tracing::warn!(term = %self.term, "Leader lost contact with the relay, stepping down");
            self.step_down()?;
        }

        self.state_machine.set_state(Role::Candidate)?;
        self.term = self.term.next();
        self.votes_received.clear();
        tracing::info!(term = %self.term, candidate = %self.candidate_id, "Election timeout, requesting votes");

        let request = Vote {
            term: self.term,
            candidate_id: self.candidate_id,
            node_id: self.node_id,
        };
        let payload = request.to_byte_array();
        self.reset_election_time();
        self.send_message(Envelope::new(Topic::LeaderVote, payload?));
        Ok(())
    }

    fn on_heartbeat_timeout(&mut self) -> Result<()> {
        if !self.state_machine.is_leader() {
            return Ok(());
        }
        tracing::trace!(term = %self.term, "Sending heartbeat");
        self.send_message(Envelope::new(Topic::Heartbeat, Bytes::new()));
        self.start_heartbeat_time();
        Ok(())
    }
}

fn validate_term(term: Term, what: &str) -> Result<()> {
    if term.is_valid() {
        Ok(())
    } else {
        Err(ConsensusError::ProtocolViolation(format!("{what} carries term {term}")))
    }
}

fn log_rejected(topic: &str, error: &ConsensusError) {
    match error {
        ConsensusError::Deserialization(_) | ConsensusError::ProtocolViolation(_) => {
            tracing::warn!(%topic, "Dropping message: {}", error)
        }
        _ => tracing::error!(%topic, "Failed to handle message: {}", error),
    }
}
