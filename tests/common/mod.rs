#![allow(dead_code)]

use o3fabric::consensus::NodeId;
use o3fabric::{Config, Node};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct RunningNode {
    pub node: Arc<Node>,
    task: JoinHandle<o3fabric::Result<()>>,
}

impl RunningNode {
    pub async fn spawn(seed: Option<SocketAddr>) -> anyhow::Result<Self> {
        let mut config = Config::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, seed);
        config.reconnect_attempts = 2;
        config.reconnect_backoff_ms = 20;

        let node = Arc::new(Node::new(config).await?);
        let task = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.start().await })
        };
        Ok(Self { node, task })
    }

    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }

    /// Stops the node's relay, link and consensus loop.
    pub async fn kill(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts `count` nodes that all join the first one's relay.
pub async fn start_cluster(count: usize) -> anyhow::Result<Vec<RunningNode>> {
    let first = RunningNode::spawn(None).await?;
    let seed = first.node.relay_addr();
    let mut nodes = vec![first];
    for _ in 1..count {
        nodes.push(RunningNode::spawn(Some(seed)).await?);
    }
    Ok(nodes)
}

/// The single leader every node agrees on, if there is one.
pub async fn agreed_leader(nodes: &[RunningNode]) -> Option<NodeId> {
    let mut leaders = Vec::new();
    for running in nodes {
        if running.node.consensus().is_leader().await {
            leaders.push(running.id());
        }
    }
    let [leader] = leaders.as_slice() else {
        return None;
    };

    for running in nodes {
        let info = running.node.consensus().leader_info().await?;
        if info.node_id != *leader {
            return None;
        }
    }
    Some(*leader)
}

pub async fn eventually<T, F, Fut>(limit: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if let Some(value) = probe().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}
