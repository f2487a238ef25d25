//! # Overlay Transport
//!
//! The seam between the node core and whatever delivers authenticated byte
//! streams per peer. The core consumes [`OverlayEvent`]s and calls
//! [`Overlay::send`] / [`Overlay::broadcast`]; message authenticity is
//! enforced one layer up by the router's envelope signatures, so the overlay
//! only has to move frames and tag them with the remote public key.
//!
//! [`TcpOverlay`] is the reference implementation: a TCP listener plus a
//! dial loop per bootstrap address. Joining the cluster topic means
//! exchanging a hello frame carrying `SHA-256(cluster_name)`; a peer on a
//! different topic is disconnected before any payload flows.
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────────────────┐
//! │ 4 bytes magic│ 4 bytes (BE)  │  payload (JSON)              │
//! │ 0x53574D01   │ payload len   │  hello first, then envelopes │
//! └──────────────┴───────────────┴──────────────────────────────┘
//! ```
//!
//! Max frame: 256 KiB. The magic bytes let both sides reject non-swarmd
//! connections without parsing JSON.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Magic prefix on every frame: "SWM" + wire version 1.
const FRAME_MAGIC: [u8; 4] = [0x53, 0x57, 0x4D, 0x01];

/// Upper bound on a single frame. Envelopes are small; anything near this
/// size is either a bug or abuse.
const MAX_FRAME: usize = 256 * 1024;

/// How long a freshly connected peer gets to produce its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between dial attempts to a bootstrap peer that is down.
const DIAL_RETRY: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("frame too large: {0} bytes")]
    Oversized(usize),

    #[error("peer {0} is not connected")]
    NotConnected(String),
}

/// What the overlay reports up to the node core.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// A stream to `pk` is ready for frames.
    PeerUp { pk: String },
    /// One inbound frame from `pk`.
    Frame { pk: String, bytes: Vec<u8> },
    /// The stream to `pk` closed; the dialer may bring it back.
    PeerDown { pk: String },
}

/// Full-duplex frame fabric keyed by remote public key.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Hex public key this overlay joined as.
    fn local_pk(&self) -> &str;

    /// Send one frame to a specific peer.
    async fn send(&self, pk: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Best-effort frame to every connected peer; per-peer failures only
    /// close that peer's stream.
    async fn broadcast(&self, bytes: Vec<u8>);

    fn connected_peers(&self) -> Vec<String>;

    async fn shutdown(&self);
}

// ════════════════════════════════════════════════════════════════════════════
// FRAME CODEC
// ════════════════════════════════════════════════════════════════════════════

pub(crate) async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_FRAME {
        return Err(TransportError::Oversized(bytes.len()));
    }
    writer.write_all(&FRAME_MAGIC).await?;
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != FRAME_MAGIC {
        return Err(TransportError::Protocol(format!(
            "bad frame magic {:02x?}",
            magic
        )));
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(TransportError::Protocol("empty frame".into()));
    }
    if len > MAX_FRAME {
        return Err(TransportError::Oversized(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// First frame on every connection, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hello {
    /// Hex of the 32-byte cluster topic.
    topic: String,
    /// Hex of the sender's raw Ed25519 public key.
    public_key: String,
}

// ════════════════════════════════════════════════════════════════════════════
// TCP OVERLAY
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct TcpOverlayConfig {
    pub listen_addr: String,
    pub bootstrap_peers: Vec<String>,
    /// Hex of the 32-byte cluster topic this node joins.
    pub topic_hex: String,
    /// Hex of this node's public key, announced in hellos.
    pub public_key_hex: String,
}

struct PeerLink {
    conn_id: u64,
    writer: mpsc::UnboundedSender<Vec<u8>>,
}

/// Reference overlay: listener + dialer over plain TCP.
///
/// Stands in for the production P2P discovery library, which is out of
/// scope; everything above this type only sees the [`Overlay`] trait.
pub struct TcpOverlay {
    local_pk: String,
    topic_hex: String,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<String, PeerLink>>,
    events: mpsc::UnboundedSender<OverlayEvent>,
    shutdown: Notify,
    closed: AtomicBool,
    next_conn_id: AtomicU64,
}

impl TcpOverlay {
    /// Bind the listener, start the accept and dial loops, and hand back
    /// the event stream.
    pub async fn start(
        cfg: TcpOverlayConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<OverlayEvent>), TransportError> {
        let listener = TcpListener::bind(&cfg.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let overlay = Arc::new(Self {
            local_pk: cfg.public_key_hex.clone(),
            topic_hex: cfg.topic_hex.clone(),
            local_addr,
            peers: RwLock::new(HashMap::new()),
            events: events_tx,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
        });

        info!(addr = %local_addr, topic = %cfg.topic_hex, "overlay listening");

        let accept = overlay.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept.shutdown.notified() => break,
                    res = listener.accept() => match res {
                        Ok((stream, remote)) => {
                            debug!(%remote, "inbound overlay connection");
                            let this = accept.clone();
                            tokio::spawn(async move {
                                this.run_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            warn!("overlay accept error: {}", e);
                        }
                    }
                }
                if accept.closed.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        for addr in cfg.bootstrap_peers {
            let dialer = overlay.clone();
            tokio::spawn(async move {
                loop {
                    if dialer.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    match TcpStream::connect(&addr).await {
                        Ok(stream) => {
                            debug!(%addr, "dialed bootstrap peer");
                            // Returns when the connection closes; then retry.
                            dialer.clone().run_connection(stream).await;
                        }
                        Err(e) => {
                            debug!(%addr, "dial failed: {}", e);
                        }
                    }
                    tokio::select! {
                        _ = dialer.shutdown.notified() => break,
                        _ = sleep(DIAL_RETRY) => {}
                    }
                }
            });
        }

        Ok((overlay, events_rx))
    }

    /// The bound listener address; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hello exchange, then pump frames until the stream dies.
    async fn run_connection(self: Arc<Self>, mut stream: TcpStream) {
        let hello = Hello {
            topic: self.topic_hex.clone(),
            public_key: self.local_pk.clone(),
        };
        let hello_bytes = match serde_json::to_vec(&hello) {
            Ok(b) => b,
            Err(e) => {
                warn!("hello serialize error: {}", e);
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &hello_bytes).await {
            debug!("hello write failed: {}", e);
            return;
        }

        let remote = match timeout(HELLO_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(bytes)) => match serde_json::from_slice::<Hello>(&bytes) {
                Ok(h) => h,
                Err(e) => {
                    warn!("malformed hello, dropping connection: {}", e);
                    return;
                }
            },
            Ok(Err(e)) => {
                debug!("hello read failed: {}", e);
                return;
            }
            Err(_) => {
                warn!("peer did not send hello within {:?}", HELLO_TIMEOUT);
                return;
            }
        };

        if remote.topic != self.topic_hex {
            warn!(peer_topic = %remote.topic, "peer is on a different cluster topic, dropping");
            return;
        }
        if remote.public_key.len() != 64 || hex::decode(&remote.public_key).is_err() {
            warn!("peer announced an invalid public key, dropping");
            return;
        }
        if remote.public_key == self.local_pk {
            debug!("dropped connection to self");
            return;
        }

        let pk = remote.public_key;
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let (mut read_half, write_half) = stream.into_split();

        // Writer task owns the write half; dropping the sender ends it and
        // closes the socket.
        tokio::spawn(async move {
            let mut write_half: OwnedWriteHalf = write_half;
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &bytes).await {
                    debug!("frame write failed: {}", e);
                    break;
                }
            }
        });

        // Freshest connection wins: replacing the link drops the previous
        // writer, which closes the older socket.
        {
            let mut peers = self.peers.write();
            if peers
                .insert(pk.clone(), PeerLink { conn_id, writer: writer_tx })
                .is_some()
            {
                debug!(peer = %pk, "replaced existing connection");
            }
        }
        let _ = self.events.send(OverlayEvent::PeerUp { pk: pk.clone() });

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                res = read_frame(&mut read_half) => match res {
                    Ok(bytes) => {
                        let _ = self.events.send(OverlayEvent::Frame { pk: pk.clone(), bytes });
                    }
                    Err(TransportError::Io(e)) => {
                        debug!(peer = %pk, "stream closed: {}", e);
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %pk, "protocol error, closing stream: {}", e);
                        break;
                    }
                }
            }
        }

        // Only the connection that still owns the link reports the peer
        // down; a superseded connection exits silently.
        let still_current = {
            let mut peers = self.peers.write();
            match peers.get(&pk) {
                Some(link) if link.conn_id == conn_id => {
                    peers.remove(&pk);
                    true
                }
                _ => false,
            }
        };
        if still_current && !self.closed.load(Ordering::SeqCst) {
            let _ = self.events.send(OverlayEvent::PeerDown { pk });
        }
    }
}

#[async_trait]
impl Overlay for TcpOverlay {
    fn local_pk(&self) -> &str {
        &self.local_pk
    }

    async fn send(&self, pk: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let sender = {
            let peers = self.peers.read();
            peers
                .get(pk)
                .map(|link| link.writer.clone())
                .ok_or_else(|| TransportError::NotConnected(pk.to_string()))?
        };
        sender
            .send(bytes)
            .map_err(|_| TransportError::NotConnected(pk.to_string()))
    }

    async fn broadcast(&self, bytes: Vec<u8>) {
        let senders: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)> = {
            let peers = self.peers.read();
            peers
                .iter()
                .map(|(pk, link)| (pk.clone(), link.writer.clone()))
                .collect()
        };
        for (pk, sender) in senders {
            if sender.send(bytes.clone()).is_err() {
                debug!(peer = %pk, "broadcast to closed stream");
            }
        }
    }

    fn connected_peers(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.peers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pk: &str, peers: Vec<String>) -> TcpOverlayConfig {
        TcpOverlayConfig {
            listen_addr: "127.0.0.1:0".into(),
            bootstrap_peers: peers,
            topic_hex: "aa".repeat(32),
            public_key_hex: pk.repeat(32),
        }
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<OverlayEvent>,
    ) -> OverlayEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let (_cr, mut cw) = tokio::io::split(client);
        let (mut sr, _sw) = tokio::io::split(server);

        write_frame(&mut cw, b"hello").await.expect("write");
        let got = read_frame(&mut sr).await.expect("read");
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let (_cr, mut cw) = tokio::io::split(client);
        let (mut sr, _sw) = tokio::io::split(server);

        cw.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.expect("write");
        cw.write_all(&4u32.to_be_bytes()).await.expect("write");
        cw.write_all(b"test").await.expect("write");

        assert!(matches!(
            read_frame(&mut sr).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let (_cr, mut cw) = tokio::io::split(client);
        let (mut sr, _sw) = tokio::io::split(server);

        cw.write_all(&FRAME_MAGIC).await.expect("write");
        cw.write_all(&(MAX_FRAME as u32 + 1).to_be_bytes()).await.expect("write");

        assert!(matches!(
            read_frame(&mut sr).await,
            Err(TransportError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn test_hello_exchange_and_frames() {
        let (a, mut a_rx) = TcpOverlay::start(cfg("aa", vec![])).await.expect("a");
        let a_addr = a.local_addr().to_string();

        let (b, mut b_rx) = TcpOverlay::start(cfg("bb", vec![a_addr])).await.expect("b");

        // Both sides observe the peer coming up with the announced keys.
        let OverlayEvent::PeerUp { pk } = next_event(&mut a_rx).await else {
            panic!("expected PeerUp on a");
        };
        assert_eq!(pk, "bb".repeat(32));
        let OverlayEvent::PeerUp { pk } = next_event(&mut b_rx).await else {
            panic!("expected PeerUp on b");
        };
        assert_eq!(pk, "aa".repeat(32));

        b.send(&"aa".repeat(32), b"ping".to_vec()).await.expect("send");
        let OverlayEvent::Frame { pk, bytes } = next_event(&mut a_rx).await else {
            panic!("expected Frame on a");
        };
        assert_eq!(pk, "bb".repeat(32));
        assert_eq!(bytes, b"ping");

        a.broadcast(b"pong".to_vec()).await;
        let OverlayEvent::Frame { bytes, .. } = next_event(&mut b_rx).await else {
            panic!("expected Frame on b");
        };
        assert_eq!(bytes, b"pong");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_topic_mismatch_rejected() {
        let (a, mut a_rx) = TcpOverlay::start(cfg("aa", vec![])).await.expect("a");
        let a_addr = a.local_addr().to_string();

        let mut other = cfg("bb", vec![a_addr]);
        other.topic_hex = "bb".repeat(32);
        let (b, _b_rx) = TcpOverlay::start(other).await.expect("b");

        // No PeerUp should arrive on a; give the dial a moment.
        let got = timeout(Duration::from_millis(500), a_rx.recv()).await;
        assert!(got.is_err(), "peer on wrong topic must not connect");
        assert!(a.connected_peers().is_empty());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_errors() {
        let (a, _rx) = TcpOverlay::start(cfg("aa", vec![])).await.expect("a");
        let err = a.send(&"cc".repeat(32), b"x".to_vec()).await;
        assert!(matches!(err, Err(TransportError::NotConnected(_))));
        a.shutdown().await;
    }
}
