use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

use crate::messages::{Envelope, LeaderInfo};
use crate::registry::NetworkRegistry;
use crate::state::Role;
use crate::timeout::{LeaderElectedCallback, SendCallback, TimeoutHandler};
use crate::timer::TimerEvent;
use crate::{CandidateId, Config, ConsensusError, NodeId, Result, Term};

/// Serializes every consensus mutation.
///
/// Inbound envelopes and timer fires share one loop, and each is handled
/// under the single lock around the `TimeoutHandler`. Read accessors take the
/// same lock briefly and return copies.
pub struct ConsensusManager {
    node_id: NodeId,
    candidate_id: CandidateId,
    handler: Arc<Mutex<TimeoutHandler>>,
    message_sender: mpsc::UnboundedSender<Envelope>,
    receivers: Mutex<Option<Receivers>>,
    shutdown: watch::Sender<bool>,
}

struct Receivers {
    messages: mpsc::UnboundedReceiver<Envelope>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
}

impl ConsensusManager {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_identity(NodeId::new(), CandidateId::random(), config)
    }

    pub fn with_identity(node_id: NodeId, candidate_id: CandidateId, config: Config) -> Result<Self> {
        config.validate()?;

        let (message_sender, messages) = mpsc::unbounded_channel();
        let (timer_sender, timers) = mpsc::unbounded_channel();
        let handler = TimeoutHandler::new(node_id, candidate_id, config, timer_sender);

        Ok(Self {
            node_id,
            candidate_id,
            handler: Arc::new(Mutex::new(handler)),
            message_sender,
            receivers: Mutex::new(Some(Receivers { messages, timers })),
            shutdown: watch::channel(false).0,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn candidate_id(&self) -> CandidateId {
        self.candidate_id
    }

    pub async fn register_send_callback(&self, callback: SendCallback) {
        self.handler.lock().await.register_send_callback(callback);
    }

    pub async fn on_leader_elected(&self, callback: LeaderElectedCallback) {
        self.handler.lock().await.on_leader_elected(callback);
    }

    pub fn submit(&self, envelope: Envelope) -> Result<()> {
        self.message_sender
            .send(envelope)
            .map_err(|_| ConsensusError::ChannelClosed("consensus inbox".to_string()))
    }

    pub fn inbox(&self) -> mpsc::UnboundedSender<Envelope> {
        self.message_sender.clone()
    }

    /// Arms the election timer and processes events until [`shutdown`](Self::shutdown)
    /// is called.
    pub async fn start(&self) -> Result<()> {
        let Receivers {
            mut messages,
            mut timers,
        } = self
            .receivers
            .lock()
            .await
            .take()
            .ok_or_else(|| ConsensusError::ChannelClosed("consensus manager already started".to_string()))?;

        tracing::info!(node = %self.node_id, candidate = %self.candidate_id, "Starting consensus manager");
        self.handler.lock().await.start_election_time();

        let mut stop = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = async { stop.wait_for(|stopped| *stopped).await.map(|_| ()) } => break,
                Some(envelope) = messages.recv() => self.handler.lock().await.handle_envelope(&envelope),
                Some(event) = timers.recv() => self.handler.lock().await.handle_timer_event(event),
            }
        }

        self.handler.lock().await.stop_timers();
        tracing::info!(node = %self.node_id, "Consensus manager stopped");
        Ok(())
    }

    /// Ends the loop driven by [`start`](Self::start) and disarms both timers.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn role(&self) -> Role {
        self.handler.lock().await.role()
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == Role::Leader
    }

    pub async fn term(&self) -> Term {
        self.handler.lock().await.term()
    }

    pub async fn num_of_nodes(&self) -> usize {
        self.handler.lock().await.num_of_nodes()
    }

    pub async fn leader_info(&self) -> Option<LeaderInfo> {
        self.handler.lock().await.leader_info().cloned()
    }

    pub async fn network_registry(&self) -> NetworkRegistry {
        self.handler.lock().await.network_registry().clone()
    }

    pub async fn mark_relay_unresponsive(&self, ip: &str, relay_port: u16) -> bool {
        self.handler
            .lock()
            .await
            .network_registry_mut()
            .set_queue_unresponsive(ip, relay_port)
    }
}
