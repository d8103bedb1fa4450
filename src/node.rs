use crate::config::Config;
use crate::error::Result;
use consensus::{ConsensusManager, NodeId};
use network::{NetworkManager, Relay};
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Node {
    config: Config,
    consensus_manager: Arc<ConsensusManager>,
    network_manager: Arc<NetworkManager>,
}

impl Node {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        tracing::info!("Initializing o3fabric node at {}", config.bind_address());

        // Bind before anything else so a configured port of 0 resolves to the
        // port the node actually announces.
        let relay = Relay::bind(config.bind_address()).await?;
        let relay_port = relay.local_addr()?.port();

        let consensus_manager = Arc::new(ConsensusManager::new(config.consensus_config(relay_port))?);

        let network_manager = Arc::new(
            NetworkManager::new(
                config.clone().into(),
                relay,
                &config.node_ip.to_string(),
                consensus_manager.clone(),
            )
            .await?,
        );

        tracing::info!(
            node = %consensus_manager.node_id(),
            candidate = %consensus_manager.candidate_id(),
            relay_port,
            "Node initialized"
        );

        Ok(Self {
            config,
            consensus_manager,
            network_manager,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.consensus_manager.node_id()
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.network_manager.relay_addr()
    }

    pub fn consensus(&self) -> &Arc<ConsensusManager> {
        &self.consensus_manager
    }

    /// Runs until either half stops. Dropping the returned future shuts the
    /// node's relay and link down.
    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting o3fabric node services");

        tokio::select! {
            result = self.consensus_manager.start() => {
                tracing::error!("Consensus manager stopped: {:?}", result);
                result?;
            }
            result = self.network_manager.start() => {
                tracing::error!("Network manager stopped: {:?}", result);
                result?;
            }
        }
        Ok(())
    }
}
