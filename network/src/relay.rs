use bytes::Bytes;
use consensus::{Envelope, MembershipChange, NetworkTuple, NodeHello, Payload, Topic};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};

use crate::communication::{read_envelope, write_envelope};
use crate::Result;

type ConnectionId = u64;

/// Broadcast hub every node hosts. Whatever one connection sends is written
/// to all connections, the sender included.
pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener))
    }

    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        let _closing = CloseOnDrop(Arc::clone(&state));
        tracing::info!(addr = ?listener.local_addr().ok(), "Relay listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Relay shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => spawn_connection(stream, remote, &state),
                    Err(err) => tracing::warn!(error = ?err, "Failed to accept relay connection"),
                },
            }
        }

        Ok(())
    }
}

/// Tells every open connection to hang up once the accept loop is gone.
struct CloseOnDrop(Arc<RelayState>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.closing.send_replace(true);
    }
}

fn spawn_connection(stream: TcpStream, remote: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, remote, state).await {
            tracing::warn!(%remote, error = ?err, "Relay connection closed with error");
        }
    });
}

struct ConnectionRecord {
    remote: SocketAddr,
    hello: Option<NodeHello>,
}

impl ConnectionRecord {
    fn peer(&self) -> Option<NetworkTuple> {
        self.hello.map(|hello| {
            NetworkTuple::new(
                hello.node_id.to_string(),
                self.remote.ip().to_string(),
                self.remote.port(),
                hello.relay_port,
            )
        })
    }
}

struct RelayState {
    connections: Mutex<BTreeMap<ConnectionId, ConnectionRecord>>,
    broadcaster: broadcast::Sender<Envelope>,
    closing: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl RelayState {
    fn new() -> Self {
        let (broadcaster, _) = broadcast::channel(1024);
        let (closing, _) = watch::channel(false);
        Self {
            connections: Mutex::new(BTreeMap::new()),
            broadcaster,
            closing,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.broadcaster.subscribe()
    }

    async fn register(&self, id: ConnectionId, remote: SocketAddr) -> MembershipChange {
        let mut connections = self.connections.lock().await;
        connections.insert(id, ConnectionRecord { remote, hello: None });
        membership(&connections)
    }

    async fn record_hello(&self, id: ConnectionId, hello: NodeHello) -> Option<MembershipChange> {
        let mut connections = self.connections.lock().await;
        let record = connections.get_mut(&id)?;
        record.hello = Some(hello);
        Some(membership(&connections))
    }

    async fn remove(&self, id: ConnectionId) -> Option<MembershipChange> {
        let mut connections = self.connections.lock().await;
        connections.remove(&id)?;
        Some(membership(&connections))
    }

    fn broadcast(&self, envelope: Envelope) {
        if self.broadcaster.send(envelope).is_err() {
            tracing::debug!("No relay subscribers left");
        }
    }

    fn announce(&self, topic: Topic, change: &MembershipChange) {
        match change.to_byte_array() {
            Ok(payload) => self.broadcast(Envelope::new(topic, payload)),
            Err(err) => tracing::warn!(%topic, error = %err, "Failed to encode membership notice"),
        }
    }
}

fn membership(connections: &BTreeMap<ConnectionId, ConnectionRecord>) -> MembershipChange {
    MembershipChange {
        num_of_nodes: connections.len(),
        ips: connections.values().map(|record| record.remote.to_string()).collect(),
        peers: connections.values().filter_map(ConnectionRecord::peer).collect(),
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    state: Arc<RelayState>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Subscribe first so the connection also sees the notice about itself.
    let inbox = state.subscribe();
    write_envelope(&mut writer, &Envelope::new(Topic::ConnAck, Bytes::new())).await?;
    let forwarder = tokio::spawn(forward_broadcasts(inbox, writer, remote));

    let id = state.next_id();
    let change = state.register(id, remote).await;
    tracing::info!(%remote, connections = change.num_of_nodes, "Relay connection opened");
    state.announce(Topic::ClientConnOpened, &change);

    let mut closing = state.closing.subscribe();
    let result = tokio::select! {
        result = read_session(&state, id, remote, &mut reader) => result,
        _ = closing.wait_for(|closing| *closing) => Ok(()),
    };

    forwarder.abort();
    if let Some(change) = state.remove(id).await {
        tracing::info!(%remote, connections = change.num_of_nodes, "Relay connection closed");
        state.announce(Topic::ClientConnClosed, &change);
    }
    result
}

async fn read_session<R>(
    state: &RelayState,
    id: ConnectionId,
    remote: SocketAddr,
    reader: &mut R,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let envelope = match read_envelope(reader).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(%remote, error = %err, "Dropping undecodable envelope");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if envelope.topic() != Some(Topic::NodeHello) {
            state.broadcast(envelope);
            continue;
        }

        match NodeHello::from_byte_array(&envelope.payload) {
            Ok(hello) => {
                tracing::debug!(%remote, node = %hello.node_id, relay_port = hello.relay_port, "Node said hello");
                if let Some(change) = state.record_hello(id, hello).await {
                    state.announce(Topic::ClientConnOpened, &change);
                }
            }
            Err(err) => tracing::warn!(%remote, error = %err, "Ignoring malformed hello"),
        }
    }
}

async fn forward_broadcasts(
    mut inbox: broadcast::Receiver<Envelope>,
    mut writer: OwnedWriteHalf,
    remote: SocketAddr,
) {
    loop {
        match inbox.recv().await {
            Ok(envelope) => {
                if let Err(err) = write_envelope(&mut writer, &envelope).await {
                    tracing::debug!(%remote, error = ?err, "Failed to deliver envelope");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(%remote, skipped, "Relay connection lagging, envelopes dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
