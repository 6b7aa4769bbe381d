//! TCP transport between replicas running in separate processes.
//!
//! Each message travels as one frame: a 9-byte header (magic:4, version:1,
//! payload length:4, all big-endian) followed by the bincode-encoded
//! [`Envelope`]. Every peer has one outbound connection fed by a bounded
//! queue, so `send` never waits on the network; when the queue is full or
//! the peer is down the message is dropped, which Raft tolerates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::MetaError;
use crate::network::{Envelope, Inbox, PeerMessage, Transport};
use crate::types::NodeId;

/// Frame header size in bytes (magic:4 + version:1 + payload_length:4)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Protocol magic number for frame validation
pub const MAGIC: u32 = 0xCF6E_0001;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpNetworkConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Minimum delay between two connection attempts to the same peer.
    pub reconnect_backoff_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
    /// Largest accepted frame payload.
    pub max_frame_bytes: u32,
    /// Messages buffered per peer before new ones are dropped.
    pub send_queue: usize,
}

impl Default for TcpNetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            reconnect_backoff_ms: 200,
            nodelay: true,
            max_frame_bytes: 64 * 1024 * 1024,
            send_queue: 1024,
        }
    }
}

/// Encodes one envelope as a frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, MetaError> {
    let payload = bincode::serialize(envelope)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| MetaError::Validation(format!("frame of {} bytes is too large", payload.len())))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&MAGIC.to_be_bytes());
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: u32) -> Result<Option<Envelope>, MetaError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != MAGIC {
        return Err(MetaError::Serialization(format!("bad frame magic {:#010x}", magic)));
    }
    if header[4] != PROTOCOL_VERSION {
        return Err(MetaError::Serialization(format!(
            "unsupported protocol version {}",
            header[4]
        )));
    }
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    if len > max_frame_bytes {
        return Err(MetaError::Serialization(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

/// Replica-to-replica transport over TCP.
pub struct TcpNetwork {
    node_id: NodeId,
    local_addr: SocketAddr,
    outbound: HashMap<NodeId, mpsc::Sender<Vec<u8>>>,
    token: CancellationToken,
}

impl TcpNetwork {
    /// Listens on `bind_addr` and prepares one outbound connection per peer.
    /// Returns the network and the inbox of messages received from peers.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(
        node_id: NodeId,
        bind_addr: &str,
        peers: HashMap<NodeId, String>,
        config: TcpNetworkConfig,
    ) -> Result<(Arc<Self>, Inbox), MetaError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        tokio::spawn(accept_loop(
            listener,
            inbox_tx,
            config.clone(),
            token.clone(),
        ));

        let mut outbound = HashMap::new();
        for (peer, addr) in peers {
            if peer == node_id {
                continue;
            }
            let (tx, rx) = mpsc::channel(config.send_queue.max(1));
            tokio::spawn(peer_writer(peer, addr, rx, config.clone(), token.clone()));
            outbound.insert(peer, tx);
        }

        tracing::info!(node_id = %node_id, addr = %local_addr, peers = outbound.len(), "TCP transport listening");
        Ok((
            Arc::new(Self {
                node_id,
                local_addr,
                outbound,
                token,
            }),
            inbox,
        ))
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops listening and closes every connection.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for TcpNetwork {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[async_trait]
impl Transport for TcpNetwork {
    async fn send(&self, from: NodeId, to: NodeId, message: PeerMessage) -> Result<(), MetaError> {
        let queue = self
            .outbound
            .get(&to)
            .ok_or_else(|| MetaError::Io(format!("peer {} has no configured address", to)))?;
        let frame = encode_frame(&Envelope { from, message })?;
        match queue.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(from = %self.node_id, to = %to, "send queue full, dropping message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MetaError::Shutdown),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::UnboundedSender<Envelope>,
    config: TcpNetworkConfig,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                if config.nodelay {
                    let _ = stream.set_nodelay(true);
                }
                tracing::debug!(remote = %remote, "accepted peer connection");
                tokio::spawn(peer_reader(
                    stream,
                    remote,
                    inbox.clone(),
                    config.max_frame_bytes,
                    token.clone(),
                ));
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
    tracing::debug!("TCP listener stopped");
}

async fn peer_reader(
    mut stream: TcpStream,
    remote: SocketAddr,
    inbox: mpsc::UnboundedSender<Envelope>,
    max_frame_bytes: u32,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = read_frame(&mut stream, max_frame_bytes) => frame,
        };
        match frame {
            Ok(Some(envelope)) => {
                if inbox.send(envelope).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "dropping peer connection");
                break;
            }
        }
    }
}

async fn peer_writer(
    peer: NodeId,
    addr: String,
    mut queue: mpsc::Receiver<Vec<u8>>,
    config: TcpNetworkConfig,
    token: CancellationToken,
) {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    let backoff = Duration::from_millis(config.reconnect_backoff_ms);
    let mut stream: Option<TcpStream> = None;
    let mut last_attempt: Option<Instant> = None;

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if stream.is_none() {
            if last_attempt.is_some_and(|at| at.elapsed() < backoff) {
                continue;
            }
            last_attempt = Some(Instant::now());
            stream = connect(&addr, connect_timeout, config.nodelay).await;
            match &stream {
                Some(_) => tracing::debug!(peer = %peer, addr = %addr, "connected to peer"),
                None => continue,
            }
        }
        if let Some(conn) = stream.as_mut() {
            if let Err(e) = write_frame(conn, &frame).await {
                tracing::debug!(peer = %peer, error = %e, "peer connection lost");
                stream = None;
            }
        }
    }
}

async fn connect(addr: &str, timeout: Duration, nodelay: bool) -> Option<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if nodelay {
                let _ = stream.set_nodelay(true);
            }
            Some(stream)
        }
        Ok(Err(e)) => {
            tracing::debug!(addr = %addr, error = %e, "connect failed");
            None
        }
        Err(_) => {
            tracing::debug!(addr = %addr, ?timeout, "connect timed out");
            None
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RaftMessage, Term, VoteResponse};
    use uuid::Uuid;

    fn vote() -> PeerMessage {
        PeerMessage::Raft(RaftMessage::RequestVoteResponse(VoteResponse {
            term: Term::new(3),
            vote_granted: true,
        }))
    }

    #[tokio::test]
    async fn test_frame_codec() {
        let envelope = Envelope {
            from: NodeId::new(7),
            message: PeerMessage::Forward {
                request_id: Uuid::new_v4(),
                payload: b"{\"command\":1}".to_vec(),
            },
        };
        let frame = encode_frame(&envelope).unwrap();
        assert_eq!(&frame[..4], &MAGIC.to_be_bytes());

        let mut reader = &frame[..];
        let decoded = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(decoded.from, envelope.from);
        assert_eq!(decoded.message, envelope.message);
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_rejects_bad_magic_and_oversized_payload() {
        let frame = encode_frame(&Envelope {
            from: NodeId::new(1),
            message: vote(),
        })
        .unwrap();

        let mut corrupted = frame.clone();
        corrupted[0] ^= 0xFF;
        assert!(matches!(
            read_frame(&mut &corrupted[..], 1024).await,
            Err(MetaError::Serialization(_))
        ));
        assert!(matches!(
            read_frame(&mut &frame[..], 2).await,
            Err(MetaError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_flow_between_listeners() {
        let (a, mut inbox_a) = TcpNetwork::bind(
            NodeId::new(1),
            "127.0.0.1:0",
            HashMap::new(),
            TcpNetworkConfig::default(),
        )
        .await
        .unwrap();
        let peers = HashMap::from([(NodeId::new(1), a.local_addr().to_string())]);
        let (b, _inbox_b) = TcpNetwork::bind(NodeId::new(2), "127.0.0.1:0", peers, TcpNetworkConfig::default())
            .await
            .unwrap();

        b.send(NodeId::new(2), NodeId::new(1), vote()).await.unwrap();
        let envelope = tokio::time::timeout(Duration::from_secs(5), inbox_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.from, NodeId::new(2));
        assert_eq!(envelope.message, vote());

        assert!(matches!(
            b.send(NodeId::new(2), NodeId::new(9), vote()).await,
            Err(MetaError::Io(_))
        ));
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_does_not_block() {
        // Nothing listens on the peer's address; send still returns at once.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap().to_string();
        drop(unused);

        let peers = HashMap::from([(NodeId::new(2), addr)]);
        let (net, _inbox) = TcpNetwork::bind(NodeId::new(1), "127.0.0.1:0", peers, TcpNetworkConfig::default())
            .await
            .unwrap();
        let started = Instant::now();
        for _ in 0..10 {
            net.send(NodeId::new(1), NodeId::new(2), vote()).await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
