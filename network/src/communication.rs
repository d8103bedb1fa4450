use async_trait::async_trait;
use consensus::{Envelope, NodeHello, Payload, Topic};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Endpoint, NetworkError, Result};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Reads the next newline-delimited JSON envelope. `Ok(None)` means the peer
/// closed the stream. A line that is not an envelope yields `InvalidData`
/// after it has been consumed, so callers may keep reading.
pub async fn read_envelope<R>(reader: &mut R) -> io::Result<Option<Envelope>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let envelope = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(envelope));
    }
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(envelope).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// An open link to one relay.
///
/// Outbound envelopes are queued and written by a background task; inbound
/// envelopes arrive through [`RelayConnection::recv`], which returns `None`
/// once the relay is gone. Dropping the connection closes the socket.
pub struct RelayConnection {
    endpoint: Endpoint,
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayConnection {
    pub fn from_channels(
        endpoint: Endpoint,
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            endpoint,
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Dials the relay and introduces this node before anything else is sent.
    pub async fn open(endpoint: Endpoint, hello: NodeHello) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.ip.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();

        let hello = Envelope::new(Topic::NodeHello, hello.to_byte_array()?);
        write_envelope(&mut writer, &hello).await?;

        let (outbound, mut pending) = mpsc::unbounded_channel::<Envelope>();
        let (delivered, inbound) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = pending.recv().await {
                if let Err(err) = write_envelope(&mut writer, &envelope).await {
                    tracing::debug!(error = ?err, "Relay write failed");
                    break;
                }
            }
        });

        let relay = endpoint.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match read_envelope(&mut reader).await {
                    Ok(Some(envelope)) => {
                        if delivered.send(envelope).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(%relay, "Relay closed the connection");
                        break;
                    }
                    Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                        tracing::warn!(%relay, error = %err, "Dropping undecodable envelope");
                    }
                    Err(err) => {
                        tracing::debug!(%relay, error = ?err, "Relay read failed");
                        break;
                    }
                }
            }
        });

        tracing::info!(%endpoint, "Connected to relay");
        Ok(Self {
            endpoint,
            outbound,
            inbound,
            tasks: vec![writer_task, reader_task],
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .map_err(|_| NetworkError::ConnectionFailed(format!("relay {} is closed", self.endpoint)))
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<RelayConnection>;
}

pub struct TcpConnector {
    hello: NodeHello,
}

impl TcpConnector {
    pub fn new(hello: NodeHello) -> Self {
        Self { hello }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<RelayConnection> {
        RelayConnection::open(endpoint.clone(), self.hello).await
    }
}

/// Dials `endpoint` up to `attempts` times, sleeping `backoff * n` after the
/// n-th failure.
pub async fn connect_with_retry<C>(
    connector: &C,
    endpoint: &Endpoint,
    attempts: u32,
    backoff: Duration,
) -> Result<RelayConnection>
where
    C: Connector + ?Sized,
{
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match connector.connect(endpoint).await {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                tracing::warn!(%endpoint, attempt, attempts, error = %err, "Relay dial failed");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
    }

    let reason = last_error.map(|err| err.to_string()).unwrap_or_default();
    Err(NetworkError::ConnectionFailed(format!(
        "{endpoint} unreachable after {attempts} attempts: {reason}"
    )))
}
