//! In-process overlay: every member of a [`MemoryHub`] sees every other
//! member, frames are delivered over channels, and there is no real I/O.
//! This is the overlay the integration tests and single-process demos run
//! on, behind the exact same [`Overlay`] trait as TCP.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{Overlay, OverlayEvent, TransportError};

type Members = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<OverlayEvent>>>>;

/// One simulated swarm. Members joined through the same hub are mutually
/// connected; there is no topic check because a hub *is* a topic.
#[derive(Default, Clone)]
pub struct MemoryHub {
    members: Members,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub as `pk`. Existing members observe `PeerUp` for the new
    /// node and vice versa, mirroring what the TCP overlay reports after a
    /// successful hello.
    pub fn join(&self, pk: &str) -> (Arc<MemoryOverlay>, mpsc::UnboundedReceiver<OverlayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut members = self.members.write();
            for (other_pk, other_tx) in members.iter() {
                let _ = other_tx.send(OverlayEvent::PeerUp { pk: pk.to_string() });
                let _ = tx.send(OverlayEvent::PeerUp {
                    pk: other_pk.clone(),
                });
            }
            members.insert(pk.to_string(), tx);
        }

        let overlay = Arc::new(MemoryOverlay {
            pk: pk.to_string(),
            members: self.members.clone(),
        });
        (overlay, rx)
    }
}

pub struct MemoryOverlay {
    pk: String,
    members: Members,
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_pk(&self) -> &str {
        &self.pk
    }

    async fn send(&self, pk: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let target = {
            let members = self.members.read();
            members
                .get(pk)
                .cloned()
                .ok_or_else(|| TransportError::NotConnected(pk.to_string()))?
        };
        target
            .send(OverlayEvent::Frame {
                pk: self.pk.clone(),
                bytes,
            })
            .map_err(|_| TransportError::NotConnected(pk.to_string()))
    }

    async fn broadcast(&self, bytes: Vec<u8>) {
        let targets: Vec<(String, mpsc::UnboundedSender<OverlayEvent>)> = {
            let members = self.members.read();
            members
                .iter()
                .filter(|(pk, _)| **pk != self.pk)
                .map(|(pk, tx)| (pk.clone(), tx.clone()))
                .collect()
        };
        for (pk, tx) in targets {
            let ok = tx.send(OverlayEvent::Frame {
                pk: self.pk.clone(),
                bytes: bytes.clone(),
            });
            if ok.is_err() {
                debug!(peer = %pk, "broadcast to departed member");
            }
        }
    }

    fn connected_peers(&self) -> Vec<String> {
        self.members
            .read()
            .keys()
            .filter(|pk| **pk != self.pk)
            .cloned()
            .collect()
    }

    async fn shutdown(&self) {
        let remaining: Vec<mpsc::UnboundedSender<OverlayEvent>> = {
            let mut members = self.members.write();
            members.remove(&self.pk);
            members.values().cloned().collect()
        };
        for tx in remaining {
            let _ = tx.send(OverlayEvent::PeerDown {
                pk: self.pk.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_delivers_peer_up_both_ways() {
        let hub = MemoryHub::new();
        let (_a, mut a_rx) = hub.join("pk-a");
        let (_b, mut b_rx) = hub.join("pk-b");

        let Some(OverlayEvent::PeerUp { pk }) = a_rx.recv().await else {
            panic!("expected PeerUp on a");
        };
        assert_eq!(pk, "pk-b");
        let Some(OverlayEvent::PeerUp { pk }) = b_rx.recv().await else {
            panic!("expected PeerUp on b");
        };
        assert_eq!(pk, "pk-a");
    }

    #[tokio::test]
    async fn test_broadcast_skips_self() {
        let hub = MemoryHub::new();
        let (a, mut a_rx) = hub.join("pk-a");
        let (_b, mut b_rx) = hub.join("pk-b");

        // Drain the join events.
        let _ = a_rx.recv().await;
        let _ = b_rx.recv().await;

        a.broadcast(b"frame".to_vec()).await;

        let Some(OverlayEvent::Frame { pk, bytes }) = b_rx.recv().await else {
            panic!("expected Frame on b");
        };
        assert_eq!(pk, "pk-a");
        assert_eq!(bytes, b"frame");
        assert!(a_rx.try_recv().is_err(), "sender must not hear its own broadcast");
    }

    #[tokio::test]
    async fn test_shutdown_reports_peer_down() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.join("pk-a");
        let (_b, mut b_rx) = hub.join("pk-b");
        let _ = b_rx.recv().await;

        a.shutdown().await;

        let Some(OverlayEvent::PeerDown { pk }) = b_rx.recv().await else {
            panic!("expected PeerDown on b");
        };
        assert_eq!(pk, "pk-a");
    }
}
