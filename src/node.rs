//! Node coordinator and programmatic control surface
//!
//! [`ScNode`] wires the relay engine to its capabilities: persistence,
//! transport, and clock are injected, never ambient. `start` and `stop` are
//! idempotent; background work (outbound drain, gossip rounds, retry ticks,
//! maintenance) runs as tokio tasks that exit when the node stops.
//!
//! Observers register by subscribing to bounded broadcast channels; events
//! never cross thread boundaries as closures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::crypto::random;
use crate::error::{Error, Result};
use crate::identity::ScIdentity;
use crate::mesh::relay::{InboundMessage, PeerEvent, RelayEngine, SecurityEvent, SendOutcome};
use crate::protocol::{MessageKind, PeerId, Priority};
use crate::storage::{ImportReport, ImportStrategy, PersistenceAdapter, SecretKeyMaterial, StoredIdentity};
use crate::transport::{Transport, TransportEvent};
use crate::utils::Clock;

/// Depth of each per-peer inbound queue; keeps per-peer processing strictly
/// ordered while different peers run concurrently
const PEER_QUEUE_DEPTH: usize = 256;

/// Counters surfaced by [`ScNode::stats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub peers: usize,
    pub seen_cache_size: usize,
    pub queued: usize,
    pub routes: usize,
    pub memory_bytes: u64,
}

/// The mesh node: one identity, one relay engine, injected collaborators
pub struct ScNode {
    config: NodeConfig,
    identity: Arc<ScIdentity>,
    storage: Arc<dyn PersistenceAdapter>,
    clock: Arc<dyn Clock>,
    relay: Mutex<Option<Arc<RelayEngine>>>,
    is_running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ScNode {
    /// Load the primary identity from persistence, generating one on first
    /// run. A failing identity write is fatal: the node refuses to come up
    /// on a store that cannot hold its key material.
    pub async fn new(
        config: NodeConfig,
        storage: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let identity = match storage.get_primary_identity().await? {
            Some(stored) => {
                let secret = stored.secret.as_ref().ok_or_else(|| {
                    Error::InvalidState("primary identity has no secret material".to_string())
                })?;
                Arc::new(ScIdentity::from_secret_bytes(
                    secret.bytes(),
                    stored.created_at,
                    true,
                ))
            }
            None => {
                let identity = Arc::new(ScIdentity::generate(clock.now_ms())?);
                let write = storage
                    .upsert_identity(StoredIdentity {
                        public_key: identity.public_key(),
                        peer_id: identity.peer_id.clone(),
                        created_at: identity.created_at,
                        is_primary: true,
                        secret: Some(SecretKeyMaterial::new(
                            *identity.keypair().secret_key_bytes(),
                        )),
                    })
                    .await;
                if let Err(err) = write {
                    return Err(match err {
                        Error::PersistenceFatal(msg) => Error::PersistenceFatal(msg),
                        other => Error::PersistenceFatal(other.to_string()),
                    });
                }
                tracing::info!(peer_id = %identity.peer_id, "generated new primary identity");
                identity
            }
        };

        Ok(Self {
            config,
            identity,
            storage,
            clock,
            relay: Mutex::new(None),
            is_running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn identity(&self) -> &Arc<ScIdentity> {
        &self.identity
    }

    pub fn public_key(&self) -> PeerId {
        self.identity.public_key()
    }

    fn relay_handle(&self) -> Result<Arc<RelayEngine>> {
        self.relay
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("node is not started".to_string()))
    }

    /// Bring the node up on a transport. Idempotent: a second start while
    /// running is a no-op.
    pub async fn start(
        &self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let relay = Arc::new(RelayEngine::new(
            self.config.clone(),
            self.identity.clone(),
            self.storage.clone(),
            transport,
            self.clock.clone(),
            random::random_u64()?,
        ));

        // Restore what the last run knew
        for record in self.storage.active_peers(0).await.unwrap_or_default() {
            relay.registry().restore(record);
        }
        for route in self.storage.list_routes().await.unwrap_or_default() {
            relay.router().restore_route(route);
        }

        *self.relay.lock() = Some(relay.clone());

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_event_pump(relay.clone(), events));
        tasks.push(self.spawn_outbound_flusher(relay.clone()));
        tasks.push(self.spawn_gossip_task(relay.clone()));
        tasks.push(self.spawn_retry_task(relay.clone()));
        tasks.push(self.spawn_maintenance_task(relay));

        tracing::info!(peer_id = %self.identity.peer_id, "node started");
        Ok(())
    }

    /// Stop background work. Idempotent.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.relay.lock() = None;
        tracing::info!(peer_id = %self.identity.peer_id, "node stopped");
    }

    /// Send a message; resolves with how it left the node
    pub async fn send(
        &self,
        dest_public_key: PeerId,
        kind: MessageKind,
        payload: Vec<u8>,
        priority: Option<Priority>,
    ) -> Result<(Uuid, SendOutcome)> {
        let relay = self.relay_handle()?;
        Ok(relay.send_message(dest_public_key, kind, payload, priority).await)
    }

    /// Register a message observer
    pub fn on_message(&self) -> Result<broadcast::Receiver<InboundMessage>> {
        Ok(self.relay_handle()?.subscribe_messages())
    }

    /// Register a peer lifecycle observer
    pub fn on_peer_event(&self) -> Result<broadcast::Receiver<PeerEvent>> {
        Ok(self.relay_handle()?.subscribe_peer_events())
    }

    /// Register a security alert observer
    pub fn on_security_alert(&self) -> Result<broadcast::Receiver<SecurityEvent>> {
        Ok(self.relay_handle()?.subscribe_security_events())
    }

    /// Current node statistics
    pub async fn stats(&self) -> Result<NodeStats> {
        let relay = self.relay_handle()?;
        let queued_persisted = self.storage.scan_messages().await?.len();
        let seen = relay.seen().len();
        let queued = relay.queue_len() + queued_persisted;
        Ok(NodeStats {
            peers: relay.registry().len(),
            seen_cache_size: seen,
            queued,
            routes: relay.router().route_count(),
            // Rough accounting: fingerprints plus queue payloads
            memory_bytes: (seen * 40) as u64 + queued as u64 * 256,
        })
    }

    /// Export all persisted state as the version-1 JSON object
    pub async fn export(&self) -> Result<Vec<u8>> {
        self.storage.export_all().await
    }

    /// Import persisted state
    pub async fn import(&self, data: &[u8], strategy: ImportStrategy) -> Result<ImportReport> {
        self.storage.import_all(data, strategy).await
    }

    /// Destroy all persisted state, then re-persist the live identity so
    /// the node survives its own wipe. If that identity write fails the
    /// relay halts rather than continue without durable key material.
    pub async fn wipe(&self, confirm_token: &str) -> Result<()> {
        self.storage.wipe(confirm_token).await?;
        let write = self
            .storage
            .upsert_identity(StoredIdentity {
                public_key: self.identity.public_key(),
                peer_id: self.identity.peer_id.clone(),
                created_at: self.identity.created_at,
                is_primary: true,
                secret: Some(SecretKeyMaterial::new(
                    *self.identity.keypair().secret_key_bytes(),
                )),
            })
            .await;
        if let Err(err) = write {
            if let Ok(relay) = self.relay_handle() {
                relay.halt();
            }
            return Err(Error::PersistenceFatal(err.to_string()));
        }
        Ok(())
    }

    fn spawn_event_pump(
        &self,
        relay: Arc<RelayEngine>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let running = self.is_running.clone();
        tokio::spawn(async move {
            let mut pumps: HashMap<PeerId, mpsc::Sender<Vec<u8>>> = HashMap::new();

            while running.load(Ordering::SeqCst) {
                let Some(event) = events.recv().await else {
                    break;
                };
                match event {
                    TransportEvent::PeerConnected { peer_id, kind } => {
                        relay.handle_peer_connected(peer_id, kind).await;
                    }
                    TransportEvent::PeerDisconnected { peer_id, reason } => {
                        pumps.remove(&peer_id);
                        relay.handle_peer_disconnected(peer_id, reason).await;
                    }
                    TransportEvent::FrameReceived { peer_id, frame } => {
                        let pump = pumps.entry(peer_id).or_insert_with(|| {
                            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PEER_QUEUE_DEPTH);
                            let relay = relay.clone();
                            tokio::spawn(async move {
                                // Strictly ordered per peer
                                while let Some(frame) = rx.recv().await {
                                    let _ = relay.handle_frame(peer_id, frame).await;
                                }
                            });
                            tx
                        });
                        if pump.send(frame).await.is_err() {
                            pumps.remove(&peer_id);
                        }
                    }
                }
            }
        })
    }

    fn spawn_outbound_flusher(&self, relay: Arc<RelayEngine>) -> JoinHandle<()> {
        let running = self.is_running.clone();
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let sent = relay.flush_outbound().await;
                if sent == 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
    }

    fn spawn_gossip_task(&self, relay: Arc<RelayEngine>) -> JoinHandle<()> {
        let running = self.is_running.clone();
        let period = self.config.gossip.interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                relay.run_gossip_round().await;
            }
        })
    }

    fn spawn_retry_task(&self, relay: Arc<RelayEngine>) -> JoinHandle<()> {
        let running = self.is_running.clone();
        let period = self.config.relay.retry_tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                relay.run_retry_tick().await;
            }
        })
    }

    fn spawn_maintenance_task(&self, relay: Arc<RelayEngine>) -> JoinHandle<()> {
        let running = self.is_running.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                relay.run_maintenance().await;
            }
        })
    }
}

impl Drop for ScNode {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
