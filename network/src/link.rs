use consensus::{ConsensusManager, Envelope, LeaderInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::communication::{connect_with_retry, Connector, RelayConnection};
use crate::failover::FailoverPolicy;
use crate::{Config, Endpoint, NetworkError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Reconnect(Endpoint),
    LeaderElected(LeaderInfo),
}

type Channels = (
    mpsc::UnboundedReceiver<Envelope>,
    mpsc::UnboundedReceiver<LinkCommand>,
);

/// Keeps the node attached to exactly one relay.
///
/// Outbound envelopes come from the consensus send callback, inbound ones are
/// submitted to the [`ConsensusManager`]. When the relay goes away the
/// [`FailoverPolicy`] picks the next one from the consensus registry.
pub struct RelayLink<C> {
    consensus: Arc<ConsensusManager>,
    connector: C,
    policy: FailoverPolicy,
    own_relay: Endpoint,
    seed_relay: Option<Endpoint>,
    reconnect_attempts: u32,
    reconnect_backoff: Duration,
    outbound_sender: mpsc::UnboundedSender<Envelope>,
    command_sender: mpsc::UnboundedSender<LinkCommand>,
    channels: Mutex<Option<Channels>>,
}

impl<C: Connector> RelayLink<C> {
    pub fn new(
        config: &Config,
        own_relay: Endpoint,
        consensus: Arc<ConsensusManager>,
        connector: C,
    ) -> Self {
        let (outbound_sender, outbound) = mpsc::unbounded_channel();
        let (command_sender, commands) = mpsc::unbounded_channel();

        Self {
            consensus,
            connector,
            policy: FailoverPolicy::new(),
            own_relay,
            seed_relay: config.seed_relay.clone(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_backoff: config.reconnect_backoff(),
            outbound_sender,
            command_sender,
            channels: Mutex::new(Some((outbound, commands))),
        }
    }

    pub fn own_relay(&self) -> &Endpoint {
        &self.own_relay
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<Envelope> {
        self.outbound_sender.clone()
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<LinkCommand> {
        self.command_sender.clone()
    }

    pub async fn attach(&self) {
        let outbound = self.outbound();
        self.consensus
            .register_send_callback(Box::new(move |envelope| {
                if outbound.send(envelope).is_err() {
                    tracing::debug!("Relay link is gone, dropping outbound envelope");
                }
            }))
            .await;

        let commands = self.commands();
        self.consensus
            .on_leader_elected(Box::new(move |info| {
                if commands.send(LinkCommand::LeaderElected(info.clone())).is_err() {
                    tracing::debug!("Relay link is gone, ignoring leader announcement");
                }
            }))
            .await;
    }

    pub async fn run(&self) -> Result<()> {
        let (mut outbound, mut commands) = self
            .channels
            .lock()
            .await
            .take()
            .ok_or_else(|| NetworkError::Protocol("relay link already running".to_string()))?;

        let mut connection = self.connect_initial().await?;

        loop {
            tokio::select! {
                envelope = outbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(err) = connection.send(envelope) {
                        tracing::debug!(error = %err, "Outbound envelope not delivered");
                    }
                }
                inbound = connection.recv() => match inbound {
                    Some(envelope) => self.consensus.submit(envelope)?,
                    None => {
                        let lost = connection.endpoint().clone();
                        tracing::warn!(relay = %lost, "Relay connection lost");
                        connection = self.fail_over(lost).await?;
                    }
                },
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let switched = self.switch(command, connection.endpoint()).await;
                    if let Some(next) = switched {
                        connection = next;
                    }
                }
            }
        }

        Ok(())
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<RelayConnection> {
        connect_with_retry(
            &self.connector,
            endpoint,
            self.reconnect_attempts,
            self.reconnect_backoff,
        )
        .await
    }

    async fn connect_initial(&self) -> Result<RelayConnection> {
        if let Some(seed) = &self.seed_relay {
            match self.dial(seed).await {
                Ok(connection) => return Ok(connection),
                Err(err) => tracing::warn!(relay = %seed, error = %err, "Seed relay unreachable, using own relay"),
            }
        }
        self.dial(&self.own_relay).await
    }

    /// Walks the registry until some relay answers, then falls back to the
    /// node's own relay.
    async fn fail_over(&self, lost: Endpoint) -> Result<RelayConnection> {
        let mut registry = self.consensus.network_registry().await;
        let mut lost = lost;

        for _ in 0..=registry.len() {
            self.consensus.mark_relay_unresponsive(&lost.ip, lost.port).await;
            let Some(next) = self.policy.on_disconnect(&mut registry, &lost) else {
                break;
            };
            match self.dial(&next).await {
                Ok(connection) => {
                    tracing::info!(from = %lost, to = %next, "Failed over to next relay");
                    return Ok(connection);
                }
                Err(err) => {
                    tracing::warn!(relay = %next, error = %err, "Failover candidate unreachable");
                    lost = next;
                }
            }
        }

        tracing::warn!(relay = %self.own_relay, "No registry relay reachable, using own relay");
        self.dial(&self.own_relay)
            .await
            .map_err(|err| NetworkError::NoRelayAvailable(err.to_string()))
    }

    async fn switch(&self, command: LinkCommand, current: &Endpoint) -> Option<RelayConnection> {
        let target = match command {
            LinkCommand::LeaderElected(info) => self.policy.on_leader_elected(&info, current),
            LinkCommand::Reconnect(endpoint) => (endpoint != *current).then_some(endpoint),
        }?;

        match self.dial(&target).await {
            Ok(connection) => {
                tracing::info!(from = %current, to = %target, "Switched relay");
                Some(connection)
            }
            Err(err) => {
                tracing::warn!(relay = %target, error = %err, "Staying on current relay");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use consensus::{MembershipChange, NetworkTuple, Payload, Topic};
    use std::collections::HashSet;
    use tokio::time::timeout;

    /// The test's side of one accepted connection.
    struct Accepted {
        endpoint: Endpoint,
        from_node: mpsc::UnboundedReceiver<Envelope>,
        to_node: mpsc::UnboundedSender<Envelope>,
    }

    struct MemoryConnector {
        unreachable: HashSet<Endpoint>,
        accepted: mpsc::UnboundedSender<Accepted>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, endpoint: &Endpoint) -> Result<RelayConnection> {
            if self.unreachable.contains(endpoint) {
                return Err(NetworkError::ConnectionFailed(endpoint.to_string()));
            }
            let (outbound, from_node) = mpsc::unbounded_channel();
            let (to_node, inbound) = mpsc::unbounded_channel();
            self.accepted
                .send(Accepted {
                    endpoint: endpoint.clone(),
                    from_node,
                    to_node,
                })
                .map_err(|_| NetworkError::ConnectionFailed("test ended".to_string()))?;
            Ok(RelayConnection::from_channels(endpoint.clone(), outbound, inbound))
        }
    }

    struct Setup {
        link: Arc<RelayLink<MemoryConnector>>,
        consensus: Arc<ConsensusManager>,
        accepted: mpsc::UnboundedReceiver<Accepted>,
    }

    async fn setup(seed: Option<Endpoint>, unreachable: &[Endpoint]) -> Setup {
        let consensus = Arc::new(ConsensusManager::new(consensus::Config::default()).unwrap());
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let config = Config {
            seed_relay: seed,
            reconnect_attempts: 1,
            reconnect_backoff_ms: 1,
            ..Config::default()
        };
        let connector = MemoryConnector {
            unreachable: unreachable.iter().cloned().collect(),
            accepted: accepted_tx,
        };
        let link = Arc::new(RelayLink::new(
            &config,
            Endpoint::new("127.0.0.1", 3333),
            Arc::clone(&consensus),
            connector,
        ));
        link.attach().await;
        Setup {
            link,
            consensus,
            accepted,
        }
    }

    fn spawn_link(link: &Arc<RelayLink<MemoryConnector>>) -> tokio::task::JoinHandle<Result<()>> {
        let link = Arc::clone(link);
        tokio::spawn(async move { link.run().await })
    }

    async fn next_accepted(accepted: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
        timeout(Duration::from_secs(2), accepted.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn dials_seed_and_forwards_outbound() {
        let seed = Endpoint::new("10.0.0.1", 4001);
        let mut setup = setup(Some(seed.clone()), &[]).await;
        let runner = spawn_link(&setup.link);

        let mut relay = next_accepted(&mut setup.accepted).await;
        assert_eq!(relay.endpoint, seed);

        let envelope = Envelope::new(Topic::Heartbeat, Bytes::new());
        setup.link.outbound().send(envelope.clone()).unwrap();
        let forwarded = timeout(Duration::from_secs(2), relay.from_node.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded, envelope);

        runner.abort();
    }

    #[tokio::test]
    async fn unreachable_seed_falls_back_to_own_relay() {
        let seed = Endpoint::new("10.0.0.1", 4001);
        let mut setup = setup(Some(seed.clone()), &[seed]).await;
        let runner = spawn_link(&setup.link);

        let relay = next_accepted(&mut setup.accepted).await;
        assert_eq!(relay.endpoint, Endpoint::new("127.0.0.1", 3333));

        runner.abort();
    }

    #[tokio::test]
    async fn lost_relay_fails_over_to_next_registry_entry() {
        let seed = Endpoint::new("10.0.0.1", 4001);
        let broken = Endpoint::new("10.0.0.2", 4002);
        let mut setup = setup(Some(seed.clone()), &[broken]).await;
        let consensus_runner = {
            let consensus = Arc::clone(&setup.consensus);
            tokio::spawn(async move { consensus.start().await })
        };
        let runner = spawn_link(&setup.link);
        let relay = next_accepted(&mut setup.accepted).await;

        let change = MembershipChange {
            num_of_nodes: 3,
            ips: vec![
                "10.0.0.1:50001".to_string(),
                "10.0.0.2:50002".to_string(),
                "10.0.0.3:50003".to_string(),
            ],
            peers: vec![
                NetworkTuple::new("a", "10.0.0.1", 50001, 4001),
                NetworkTuple::new("b", "10.0.0.2", 50002, 4002),
                NetworkTuple::new("c", "10.0.0.3", 50003, 4003),
            ],
        };
        relay
            .to_node
            .send(Envelope::new(Topic::ClientConnOpened, change.to_byte_array().unwrap()))
            .unwrap();
        timeout(Duration::from_secs(2), async {
            while setup.consensus.network_registry().await.len() != 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(relay);

        // b refuses, so the link lands on c.
        let next = next_accepted(&mut setup.accepted).await;
        assert_eq!(next.endpoint, Endpoint::new("10.0.0.3", 4003));

        let registry = setup.consensus.network_registry().await;
        assert!(!registry.item_by_id("a").unwrap().0.is_available);

        runner.abort();
        consensus_runner.abort();
    }

    #[tokio::test]
    async fn reconnect_command_switches_relay() {
        let seed = Endpoint::new("10.0.0.1", 4001);
        let mut setup = setup(Some(seed.clone()), &[]).await;
        let runner = spawn_link(&setup.link);
        let _first = next_accepted(&mut setup.accepted).await;

        // Already attached there, nothing happens.
        setup.link.commands().send(LinkCommand::Reconnect(seed)).unwrap();
        let target = Endpoint::new("10.0.0.7", 4007);
        setup
            .link
            .commands()
            .send(LinkCommand::Reconnect(target.clone()))
            .unwrap();

        let next = next_accepted(&mut setup.accepted).await;
        assert_eq!(next.endpoint, target);

        runner.abort();
    }

    #[tokio::test]
    async fn run_twice_fails() {
        let mut setup = setup(None, &[]).await;
        let runner = spawn_link(&setup.link);
        let _first = next_accepted(&mut setup.accepted).await;

        assert!(matches!(setup.link.run().await, Err(NetworkError::Protocol(_))));
        runner.abort();
    }
}
