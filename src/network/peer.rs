//! Authenticated peer sessions over TCP.
//!
//! Connections are unidirectional: a node maintains one outbound
//! connection per neighbor for sending (opened with an authentication
//! frame) and accepts inbound connections for receiving. Every outbound
//! neighbor has two bounded queues, high and normal priority; high
//! preempts normal, ordering within a priority is FIFO, and a full normal
//! queue drops with a warning rather than stalling the sender.
//!
//! Frames are a 4-byte big-endian length prefix followed by one tagged
//! message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::network::protocol::{self, parse_network_message, MessageError, PeerMessage};
use crate::Hash;

/// Errors from peer authentication.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AuthError {
    #[error("peer authentication message timeout")]
    Timeout,
    #[error("invalid consensus peer {0}")]
    UnknownPeer(Hash),
    #[error("peer authentication signature invalid for {0}")]
    BadSignature(Hash),
    #[error("malformed authentication: {0}")]
    Malformed(#[from] MessageError),
}

/// The node-side surface the peer layer drives.
pub trait PeerContext: Send + Sync + 'static {
    /// Verify an authentication payload, returning the peer id and its
    /// advertised listener address.
    fn authenticate(&self, payload: &[u8]) -> Result<(Hash, String), AuthError>;
    /// Our own authentication payload for outbound connections.
    fn build_authentication(&self) -> Vec<u8>;
    /// Handle one parsed message from an authenticated peer.
    fn deliver(&self, peer_id: Hash, message: PeerMessage);
}

/// An outbound instruction for the peer router.
#[derive(Clone, Debug)]
pub enum OutCommand {
    Send {
        peer: Hash,
        data: Vec<u8>,
        high: bool,
        /// `(snapshot_hash, tag)`; identical sends within the dedup
        /// window are suppressed per peer.
        dedup: Option<(Hash, u8)>,
    },
    Broadcast {
        data: Vec<u8>,
        high: bool,
        dedup: Option<(Hash, u8)>,
    },
    AddNeighbor {
        peer: Hash,
        host: String,
    },
}

/// Cloneable sender half used by the node to emit messages.
#[derive(Clone, Debug)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<OutCommand>,
}

impl OutboundHandle {
    pub fn new(tx: mpsc::UnboundedSender<OutCommand>) -> OutboundHandle {
        OutboundHandle { tx }
    }

    /// A handle plus the receiver the router drains.
    pub fn channel() -> (OutboundHandle, mpsc::UnboundedReceiver<OutCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutboundHandle { tx }, rx)
    }

    pub fn send_to(&self, peer: Hash, data: Vec<u8>, high: bool, dedup: Option<(Hash, u8)>) {
        let _ = self.tx.send(OutCommand::Send {
            peer,
            data,
            high,
            dedup,
        });
    }

    pub fn broadcast(&self, data: Vec<u8>, high: bool, dedup: Option<(Hash, u8)>) {
        let _ = self.tx.send(OutCommand::Broadcast { data, high, dedup });
    }

    pub fn add_neighbor(&self, peer: Hash, host: String) {
        let _ = self.tx.send(OutCommand::AddNeighbor { peer, host });
    }
}

/// A time-windowed dedup cache for outbound snapshot messages.
pub struct TtlCache {
    inner: Mutex<HashMap<Hash, Instant>>,
    window: Duration,
    capacity: usize,
}

impl TtlCache {
    pub fn new(window: Duration, capacity: usize) -> TtlCache {
        TtlCache {
            inner: Mutex::new(HashMap::new()),
            window,
            capacity,
        }
    }

    /// True when the key was recorded within the window; records it
    /// otherwise.
    pub fn seen_recently(&self, key: Hash) -> bool {
        let now = Instant::now();
        let mut map = self.inner.lock().expect("ttl cache lock");
        if let Some(at) = map.get(&key) {
            if now.duration_since(*at) < self.window {
                return true;
            }
        }
        if map.len() >= self.capacity {
            map.retain(|_, at| now.duration_since(*at) < self.window);
        }
        map.insert(key, now);
        false
    }
}

/// The per-peer dedup key: `H(snapshot_hash ‖ peer_id ‖ tag)`.
pub fn dedup_cache_key(snapshot: Hash, peer: Hash, tag: u8) -> Hash {
    let mut buf = [0u8; 65];
    buf[..32].copy_from_slice(&snapshot.0);
    buf[32..64].copy_from_slice(&peer.0);
    buf[64] = tag;
    Hash::new(&buf)
}

pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} out of range"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> std::io::Result<()> {
    if data.len() > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

struct Neighbor {
    high: mpsc::Sender<Vec<u8>>,
    normal: mpsc::Sender<Vec<u8>>,
}

/// Owns the outbound router and the inbound listener.
pub struct PeerManager;

impl PeerManager {
    /// Start the outbound router over an existing command channel.
    pub fn start<C: PeerContext>(
        ctx: Arc<C>,
        mut rx: mpsc::UnboundedReceiver<OutCommand>,
        cache_ttl: Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            // Suppression window is half the cache TTL.
            let cache = TtlCache::new(cache_ttl / 2, 100_000);
            let mut neighbors: HashMap<Hash, Neighbor> = HashMap::new();
            loop {
                let command = tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                };
                match command {
                    OutCommand::AddNeighbor { peer, host } => {
                        if neighbors.contains_key(&peer) {
                            continue;
                        }
                        let (high_tx, high_rx) =
                            mpsc::channel::<Vec<u8>>(constants::PEER_QUEUE_HIGH);
                        let (normal_tx, normal_rx) =
                            mpsc::channel::<Vec<u8>>(constants::PEER_QUEUE_NORMAL);
                        neighbors.insert(
                            peer,
                            Neighbor {
                                high: high_tx,
                                normal: normal_tx,
                            },
                        );
                        tokio::spawn(neighbor_loop(
                            peer,
                            host,
                            ctx.clone(),
                            high_rx,
                            normal_rx,
                            cancel.clone(),
                        ));
                    }
                    OutCommand::Send {
                        peer,
                        data,
                        high,
                        dedup,
                    } => {
                        route(&cache, &neighbors, peer, data, high, dedup);
                    }
                    OutCommand::Broadcast { data, high, dedup } => {
                        let ids: Vec<Hash> = neighbors.keys().copied().collect();
                        for peer in ids {
                            route(&cache, &neighbors, peer, data.clone(), high, dedup);
                        }
                    }
                }
            }
        });
    }

    /// Accept inbound connections and run authenticated read sessions.
    pub async fn listen<C: PeerContext>(
        addr: String,
        ctx: Arc<C>,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "listening for peers");
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = inbound_session(stream, ctx, cancel).await {
                    tracing::debug!(%remote, error = %e, "peer session closed");
                }
            });
        }
    }
}

fn route(
    cache: &TtlCache,
    neighbors: &HashMap<Hash, Neighbor>,
    peer: Hash,
    data: Vec<u8>,
    high: bool,
    dedup: Option<(Hash, u8)>,
) {
    let neighbor = match neighbors.get(&peer) {
        Some(n) => n,
        None => return,
    };
    if let Some((snapshot, tag)) = dedup {
        if cache.seen_recently(dedup_cache_key(snapshot, peer, tag)) {
            return;
        }
    }
    let queue = if high { &neighbor.high } else { &neighbor.normal };
    if queue.try_send(data).is_err() {
        // The node is falling behind; dropping beats stalling peer tasks.
        tracing::warn!(peer = %peer, high, "peer queue full, dropping message");
    }
}

/// Maintain one outbound connection: dial, authenticate, drain queues
/// with high priority first, and reconnect with backoff on failure.
async fn neighbor_loop<C: PeerContext>(
    peer: Hash,
    host: String,
    ctx: Arc<C>,
    mut high: mpsc::Receiver<Vec<u8>>,
    mut normal: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let stream = match TcpStream::connect(&host).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(peer = %peer, %host, error = %e, "dial failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
                continue;
            }
        };
        backoff = Duration::from_secs(1);
        let mut stream = stream;

        let auth = protocol::build_authentication_message(&ctx.build_authentication());
        if let Err(e) = write_frame(&mut stream, &auth).await {
            tracing::debug!(peer = %peer, error = %e, "authentication send failed");
            continue;
        }
        tracing::info!(peer = %peer, %host, "neighbor connected");

        let mut ping = tokio::time::interval(Duration::from_secs(30));
        ping.tick().await;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                data = high.recv() => match data {
                    Some(data) => write_frame(&mut stream, &data).await,
                    None => return,
                },
                data = normal.recv() => match data {
                    Some(data) => write_frame(&mut stream, &data).await,
                    None => return,
                },
                _ = ping.tick() => write_frame(&mut stream, &protocol::build_ping_message()).await,
            };
            if let Err(e) = result {
                tracing::debug!(peer = %peer, error = %e, "send failed, reconnecting");
                break;
            }
        }
    }
}

/// Authenticate an inbound connection within the handshake deadline, then
/// deliver its messages until it closes.
async fn inbound_session<C: PeerContext>(
    mut stream: TcpStream,
    ctx: Arc<C>,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let deadline = Duration::from_secs(constants::AUTHENTICATION_TIMEOUT_SECS);
    let first = tokio::time::timeout(deadline, read_frame(&mut stream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timeout"))??;

    let payload = match parse_network_message(&first) {
        Ok(PeerMessage::Authentication(payload)) => payload,
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected authentication frame",
            ))
        }
    };
    let (peer_id, listener) = ctx.authenticate(&payload).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, e.to_string())
    })?;
    tracing::info!(peer = %peer_id, %listener, "peer authenticated");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => frame?,
        };
        match parse_network_message(&frame) {
            Ok(PeerMessage::Authentication(_)) => {}
            Ok(message) => ctx.deliver(peer_id, message),
            Err(e) => {
                tracing::debug!(peer = %peer_id, error = %e, "bad frame, closing peer");
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;
    use crate::network::protocol::{
        build_authentication_payload, build_ping_message, build_snapshot_confirm_message,
        parse_authentication_payload,
    };
    use std::sync::Mutex as StdMutex;

    struct TestContext {
        my_id: Hash,
        signer: Key,
        delivered: StdMutex<Vec<(Hash, u8)>>,
        reject: bool,
    }

    impl PeerContext for TestContext {
        fn authenticate(&self, payload: &[u8]) -> Result<(Hash, String), AuthError> {
            if self.reject {
                return Err(AuthError::UnknownPeer(Hash::default()));
            }
            let parsed = parse_authentication_payload(payload)?;
            Ok((parsed.peer_id, parsed.listener))
        }

        fn build_authentication(&self) -> Vec<u8> {
            build_authentication_payload(&self.signer, self.my_id, "127.0.0.1:0", 1_700_000_000)
        }

        fn deliver(&self, peer_id: Hash, message: PeerMessage) {
            let tag = match message {
                PeerMessage::Ping => 1,
                PeerMessage::SnapshotConfirm(_) => 5,
                _ => 0,
            };
            self.delivered.lock().unwrap().push((peer_id, tag));
        }
    }

    fn test_ctx(reject: bool) -> Arc<TestContext> {
        Arc::new(TestContext {
            my_id: Hash::new(b"tester"),
            signer: Key::random(),
            delivered: StdMutex::new(Vec::new()),
            reject,
        })
    }

    #[test]
    fn ttl_cache_suppresses_within_window() {
        let cache = TtlCache::new(Duration::from_secs(60), 16);
        let key = Hash::new(b"k");
        assert!(!cache.seen_recently(key));
        assert!(cache.seen_recently(key));
        assert!(!cache.seen_recently(Hash::new(b"other")));
    }

    #[test]
    fn ttl_cache_zero_window_never_suppresses() {
        let cache = TtlCache::new(Duration::ZERO, 16);
        let key = Hash::new(b"k");
        assert!(!cache.seen_recently(key));
        assert!(!cache.seen_recently(key));
    }

    #[test]
    fn dedup_keys_distinguish_peer_and_tag() {
        let snap = Hash::new(b"s");
        let a = Hash::new(b"a");
        let b = Hash::new(b"b");
        assert_ne!(dedup_cache_key(snap, a, 10), dedup_cache_key(snap, b, 10));
        assert_ne!(dedup_cache_key(snap, a, 10), dedup_cache_key(snap, a, 14));
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let huge = (constants::MAX_NETWORK_MESSAGE_BYTES as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &huge).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn outbound_to_inbound_delivery() {
        let cancel = CancellationToken::new();
        let server_ctx = test_ctx(false);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ctx = server_ctx.clone();
        let listen_cancel = cancel.clone();
        tokio::spawn(PeerManager::listen(addr.to_string(), ctx, listen_cancel));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client_ctx = test_ctx(false);
        let (handle, rx) = OutboundHandle::channel();
        PeerManager::start(client_ctx.clone(), rx, Duration::from_secs(60), cancel.clone());
        let peer = Hash::new(b"server");
        handle.add_neighbor(peer, addr.to_string());
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.send_to(peer, build_snapshot_confirm_message(Hash::new(b"x")), true, None);
        handle.send_to(peer, build_ping_message(), false, None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let delivered = server_ctx.delivered.lock().unwrap().clone();
        assert!(delivered.iter().any(|&(id, tag)| tag == 5 && id == client_ctx.my_id));
        assert!(delivered.iter().any(|&(_, tag)| tag == 1));
        cancel.cancel();
    }

    #[tokio::test]
    async fn rejected_peer_gets_closed() {
        let cancel = CancellationToken::new();
        let server_ctx = test_ctx(true);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        tokio::spawn(PeerManager::listen(
            addr.to_string(),
            server_ctx.clone(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let ctx = test_ctx(false);
        let auth = protocol::build_authentication_message(&ctx.build_authentication());
        write_frame(&mut stream, &auth).await.unwrap();

        // The server closes the connection without delivering anything.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(server_ctx.delivered.lock().unwrap().is_empty());
        cancel.cancel();
    }
}
