//! Shared harness for mesh integration tests
//!
//! Drives relay engines by hand over the in-process hub: tests pump
//! transport events explicitly instead of racing background tasks, so
//! every scenario is deterministic under the manual clock.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use tokio::sync::mpsc;

use scmesh::config::NodeConfig;
use scmesh::identity::ScIdentity;
use scmesh::mesh::relay::RelayEngine;
use scmesh::protocol::PeerId;
use scmesh::storage::{MemoryStore, PersistenceAdapter};
use scmesh::transport::local::LocalHub;
use scmesh::transport::{Transport, TransportEvent};
use scmesh::utils::{Clock, ManualClock};

/// Fixed test epoch, far enough from zero for skew checks
pub const T0: u64 = 1_700_000_000_000;

static TRACING: Once = Once::new();

/// Wire test output into tracing; honors RUST_LOG
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestNode {
    pub relay: Arc<RelayEngine>,
    pub identity: Arc<ScIdentity>,
    pub storage: Arc<MemoryStore>,
    events: mpsc::Receiver<TransportEvent>,
}

impl TestNode {
    pub fn new(hub: &LocalHub, clock: &Arc<ManualClock>) -> Self {
        Self::with_config(hub, clock, NodeConfig::default())
    }

    pub fn with_config(hub: &LocalHub, clock: &Arc<ManualClock>, config: NodeConfig) -> Self {
        init_tracing();
        let identity = Arc::new(ScIdentity::generate(T0).unwrap());
        let storage = Arc::new(MemoryStore::new());
        let (endpoint, events) = hub.attach(identity.public_key());
        let relay = Arc::new(RelayEngine::new(
            config,
            identity.clone(),
            storage.clone() as Arc<dyn PersistenceAdapter>,
            Arc::new(endpoint) as Arc<dyn Transport>,
            clock.clone() as Arc<dyn Clock>,
            42,
        ));
        Self {
            relay,
            identity,
            storage,
            events,
        }
    }

    pub fn key(&self) -> PeerId {
        self.identity.public_key()
    }

    /// Process every pending transport event, then drain the outbound
    /// queue; returns how much work happened
    pub async fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.events.try_recv() {
            processed += 1;
            match event {
                TransportEvent::PeerConnected { peer_id, kind } => {
                    self.relay.handle_peer_connected(peer_id, kind).await;
                }
                TransportEvent::PeerDisconnected { peer_id, reason } => {
                    self.relay.handle_peer_disconnected(peer_id, reason).await;
                }
                TransportEvent::FrameReceived { peer_id, frame } => {
                    let _ = self.relay.handle_frame(peer_id, frame).await;
                }
            }
        }
        processed + self.relay.flush_outbound().await
    }
}

/// Pump all nodes round-robin until the whole mesh goes quiet
pub async fn settle(nodes: &mut [&mut TestNode]) {
    loop {
        let mut total = 0;
        for node in nodes.iter_mut() {
            total += node.pump().await;
        }
        if total == 0 {
            break;
        }
    }
}

/// Drain every immediately available message from a broadcast receiver
pub fn drain<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
