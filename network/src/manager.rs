use consensus::{ConsensusManager, NodeHello};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::communication::{Connector, TcpConnector};
use crate::link::RelayLink;
use crate::relay::Relay;
use crate::{Config, Endpoint, NetworkError, Result};

/// Runs the node's own relay next to the link that attaches the node to the
/// current relay.
pub struct NetworkManager<C = TcpConnector> {
    relay: Mutex<Option<Relay>>,
    relay_addr: SocketAddr,
    link: RelayLink<C>,
}

impl NetworkManager<TcpConnector> {
    pub async fn new(
        config: Config,
        relay: Relay,
        advertised_ip: &str,
        consensus: Arc<ConsensusManager>,
    ) -> Result<Self> {
        let relay_port = relay.local_addr()?.port();
        let connector = TcpConnector::new(NodeHello {
            node_id: consensus.node_id(),
            relay_port,
        });
        Self::with_connector(config, relay, advertised_ip, consensus, connector).await
    }
}

impl<C: Connector> NetworkManager<C> {
    pub async fn with_connector(
        config: Config,
        relay: Relay,
        advertised_ip: &str,
        consensus: Arc<ConsensusManager>,
        connector: C,
    ) -> Result<Self> {
        let relay_addr = relay.local_addr()?;
        let own_relay = Endpoint::new(advertised_ip, relay_addr.port());
        let link = RelayLink::new(&config, own_relay, consensus, connector);
        link.attach().await;

        Ok(Self {
            relay: Mutex::new(Some(relay)),
            relay_addr,
            link,
        })
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn link(&self) -> &RelayLink<C> {
        &self.link
    }

    pub async fn start(&self) -> Result<()> {
        let relay = self
            .relay
            .lock()
            .await
            .take()
            .ok_or_else(|| NetworkError::Protocol("network manager already started".to_string()))?;

        tracing::info!(relay = %self.relay_addr, own = %self.link.own_relay(), "Starting network manager");

        tokio::select! {
            result = relay.run() => {
                tracing::error!("Relay stopped: {:?}", result);
                result.and(Err(NetworkError::Protocol("relay stopped".to_string())))
            }
            result = self.link.run() => {
                tracing::error!("Relay link stopped: {:?}", result);
                result.and(Err(NetworkError::ConnectionFailed("relay link stopped".to_string())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> NetworkManager {
        let consensus = Arc::new(ConsensusManager::new(consensus::Config::default()).unwrap());
        let relay = Relay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        NetworkManager::new(Config::default(), relay, "127.0.0.1", consensus)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn own_relay_uses_bound_port() {
        let manager = manager().await;
        let port = manager.relay_addr().port();
        assert_ne!(port, 0);
        assert_eq!(manager.link().own_relay(), &Endpoint::new("127.0.0.1", port));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let manager = Arc::new(manager().await);
        let runner = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.start().await })
        };
        while manager.relay.lock().await.is_some() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(manager.start().await, Err(NetworkError::Protocol(_))));
        runner.abort();
    }
}
