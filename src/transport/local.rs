//! In-process transport for integration tests and local development
//!
//! A [`LocalHub`] wires any number of endpoints together over tokio
//! channels. Frames keep per-link FIFO order; connecting two endpoints
//! emits `PeerConnected` on both sides, exactly as a real transport would.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent, TransportKind};
use crate::error::{Error, Result};
use crate::protocol::PeerId;

/// Default depth for endpoint event queues
const EVENT_QUEUE_DEPTH: usize = 1024;

struct HubInner {
    /// Event channel per attached endpoint
    endpoints: HashMap<PeerId, mpsc::Sender<TransportEvent>>,
    /// Established links, both directions present
    links: HashMap<PeerId, Vec<PeerId>>,
}

/// Shared in-process switchboard
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<Mutex<HubInner>>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                endpoints: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    /// Attach an endpoint; the receiver side feeds the node's event loop
    pub fn attach(&self, peer_id: PeerId) -> (LocalEndpoint, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.inner.lock().endpoints.insert(peer_id, tx);
        (
            LocalEndpoint {
                local: peer_id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Connect two endpoints; both receive `PeerConnected`
    pub fn connect(&self, a: PeerId, b: PeerId) {
        let (tx_a, tx_b) = {
            let mut inner = self.inner.lock();
            inner.links.entry(a).or_default().push(b);
            inner.links.entry(b).or_default().push(a);
            (
                inner.endpoints.get(&a).cloned(),
                inner.endpoints.get(&b).cloned(),
            )
        };
        if let Some(tx) = tx_a {
            let _ = tx.try_send(TransportEvent::PeerConnected {
                peer_id: b,
                kind: TransportKind::Local,
            });
        }
        if let Some(tx) = tx_b {
            let _ = tx.try_send(TransportEvent::PeerConnected {
                peer_id: a,
                kind: TransportKind::Local,
            });
        }
    }

    /// Tear a link down; both sides receive `PeerDisconnected`
    pub fn disconnect(&self, a: PeerId, b: PeerId, reason: &str) {
        let (tx_a, tx_b) = {
            let mut inner = self.inner.lock();
            if let Some(neighbors) = inner.links.get_mut(&a) {
                neighbors.retain(|p| p != &b);
            }
            if let Some(neighbors) = inner.links.get_mut(&b) {
                neighbors.retain(|p| p != &a);
            }
            (
                inner.endpoints.get(&a).cloned(),
                inner.endpoints.get(&b).cloned(),
            )
        };
        if let Some(tx) = tx_a {
            let _ = tx.try_send(TransportEvent::PeerDisconnected {
                peer_id: b,
                reason: reason.to_string(),
            });
        }
        if let Some(tx) = tx_b {
            let _ = tx.try_send(TransportEvent::PeerDisconnected {
                peer_id: a,
                reason: reason.to_string(),
            });
        }
    }

    fn linked(&self, from: &PeerId, to: &PeerId) -> bool {
        self.inner
            .lock()
            .links
            .get(from)
            .map(|neighbors| neighbors.contains(to))
            .unwrap_or(false)
    }

    fn sender_for(&self, peer: &PeerId) -> Option<mpsc::Sender<TransportEvent>> {
        self.inner.lock().endpoints.get(peer).cloned()
    }
}

/// One node's handle onto the hub
pub struct LocalEndpoint {
    local: PeerId,
    hub: LocalHub,
}

#[async_trait]
impl Transport for LocalEndpoint {
    async fn send_frame(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()> {
        if !self.hub.linked(&self.local, &peer_id) {
            return Err(Error::TransportTransient("peer not connected".to_string()));
        }
        let tx = self
            .hub
            .sender_for(&peer_id)
            .ok_or_else(|| Error::TransportPermanent("peer endpoint gone".to_string()))?;
        tx.send(TransportEvent::FrameReceived {
            peer_id: self.local,
            frame,
        })
        .await
        .map_err(|_| Error::TransportTransient("peer event queue closed".to_string()))
    }

    async fn close(&self, peer_id: PeerId) -> Result<()> {
        self.hub.disconnect(self.local, peer_id, "closed locally");
        Ok(())
    }
}
