//! The relay engine: receive → verify → dedup → TTL → deliver-or-forward
//!
//! Feynman: this is the airport control tower. Every frame that lands gets
//! its papers checked (decode, rate limit, signature), a lookup against the
//! arrivals board (dedup), and either a gate (local delivery) or a
//! connecting flight (forward). Nothing moves without the tower's say-so.
//!
//! The engine owns no policy of its own: the registry decides who may talk,
//! the session layer decides what decrypts, and the router decides where
//! the rest goes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::Error;
use crate::identity::ScIdentity;
use crate::mesh::deduplication::SeenCache;
use crate::mesh::gossip::{self, GossipEngine};
use crate::mesh::message_queue::{MessageQueue, OutboundItem};
use crate::mesh::router::{Router, RouterMode};
use crate::mesh::store_forward::StoreAndForward;
use crate::peers::{PeerRegistry, RateClass, ReputationEvent};
use crate::protocol::{
    self, binary, short_peer_id, Envelope, MessageKind, PeerId,
};
use crate::session::SessionManager;
use crate::storage::{PersistenceAdapter, SessionKeyRecord};
use crate::transport::{Transport, TransportKind};
use crate::utils::{with_deadline, Clock};

/// Replay-flood detection: more duplicates than this within one second
/// from one peer costs reputation
const DUP_FLOOD_PER_SEC: u32 = 10;

/// Cap on tracked outbound state machines; tracking is advisory and resets
/// wholesale rather than grow without bound
const OUTBOUND_TRACK_LIMIT: usize = 10_000;

/// Cap on distinct senders with parked no-session envelopes
const PENDING_SENDER_LIMIT: usize = 256;

/// Depth of the observer broadcast channels
const EVENT_CHANNEL_DEPTH: usize = 1024;

/// A decrypted message handed to the application layer
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: PeerId,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Peer lifecycle events surfaced to observers
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected { peer: PeerId, kind: TransportKind },
    Disconnected { peer: PeerId, reason: String },
    Unreachable { peer: PeerId },
}

/// Security-relevant drops surfaced to observers
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    DecodeViolation { peer: PeerId, detail: String },
    BadSignature { peer: PeerId },
    MacFailure { peer: PeerId },
    NonceReuse { peer: PeerId },
    Blacklisted { peer: PeerId, until_ms: u64 },
}

/// Resolution of a locally originated send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to connected targets (or the gossip push set)
    Sent,
    /// No connected next hop; persisted for store-and-forward
    Queued,
    /// Not sent and not queued
    Dropped(&'static str),
}

/// Lifecycle of one outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    Pending,
    Queued,
    Sending,
    Sent,
    Failed,
    Dropped,
}

impl OutboundState {
    /// Whether a transition is legal; `Failed` may re-enter `Queued` on a
    /// retriable cause, everything else moves forward only
    pub fn can_transition(self, next: OutboundState) -> bool {
        use OutboundState::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Dropped)
                | (Queued, Sending)
                | (Queued, Dropped)
                | (Sending, Sent)
                | (Sending, Failed)
                | (Failed, Queued)
                | (Failed, Dropped)
        )
    }
}

/// What the relay did with one inbound frame; returned for observability
/// and exercised heavily by tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered to the local application
    Delivered,
    /// Forwarded to this many peers
    Forwarded(usize),
    /// Absorbed into the gossip push set
    Gossiped,
    /// Control traffic handled internally
    Handled,
    /// Persisted for store-and-forward
    Queued,
    /// Dropped, with the pipeline stage that rejected it
    Dropped(&'static str),
}

/// Relay counters; cheap atomics, snapshotted for `stats()`
#[derive(Debug, Default)]
pub struct RelayStats {
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
    pub duplicates: AtomicU64,
    pub rate_limited: AtomicU64,
    pub invalid_signatures: AtomicU64,
    pub queued_store_forward: AtomicU64,
}

impl RelayStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The central hub wiring every subsystem together
pub struct RelayEngine {
    config: NodeConfig,
    identity: Arc<ScIdentity>,
    registry: Arc<PeerRegistry>,
    sessions: Arc<SessionManager>,
    seen: Arc<SeenCache>,
    queue: Arc<MessageQueue>,
    router: Arc<Router>,
    gossip: Arc<GossipEngine>,
    store_forward: StoreAndForward,
    storage: Arc<dyn PersistenceAdapter>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,

    message_tx: broadcast::Sender<InboundMessage>,
    peer_tx: broadcast::Sender<PeerEvent>,
    security_tx: broadcast::Sender<SecurityEvent>,

    stats: RelayStats,
    /// Per-peer duplicate counts within the current one-second window
    dup_windows: Mutex<HashMap<PeerId, (u64, u32)>>,
    /// Positive reputation is batched per maintenance tick; penalties
    /// apply immediately and forfeit any pending credit
    pending_credits: Mutex<HashMap<PeerId, u32>>,
    /// Outbound message state machines
    outbound: Mutex<HashMap<Uuid, OutboundState>>,
    /// Envelope fingerprint → outbound message id, for ACK correlation
    outbound_index: Mutex<HashMap<[u8; 32], Uuid>>,
    /// Inbound encrypted envelopes waiting for a session, replayed once
    /// the key exchange completes; bounded per sender
    pending_inbound: Mutex<HashMap<PeerId, Vec<Envelope>>>,
    /// Set after a fatal persistence error; the pipeline refuses frames
    relay_halted: std::sync::atomic::AtomicBool,
}

impl RelayEngine {
    pub fn new(
        config: NodeConfig,
        identity: Arc<ScIdentity>,
        storage: Arc<dyn PersistenceAdapter>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        tie_seed: u64,
    ) -> Self {
        let registry = Arc::new(PeerRegistry::new(config.peers.clone()));
        let sessions = Arc::new(SessionManager::new(
            identity.keypair().clone(),
            config.session.clone(),
        ));
        let seen = Arc::new(SeenCache::new(
            config.dedup.capacity,
            config.dedup.window.as_millis() as u64,
        ));
        let queue = Arc::new(MessageQueue::new(config.queue.clone()));
        let router = Arc::new(Router::new(
            config.router_mode,
            registry.clone(),
            tie_seed,
        ));
        let gossip = Arc::new(GossipEngine::new(config.gossip.clone(), tie_seed));
        let store_forward = StoreAndForward::new(storage.clone(), config.relay.clone());

        let (message_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (peer_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (security_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);

        Self {
            config,
            identity,
            registry,
            sessions,
            seen,
            queue,
            router,
            gossip,
            store_forward,
            storage,
            transport,
            clock,
            message_tx,
            peer_tx,
            security_tx,
            stats: RelayStats::default(),
            dup_windows: Mutex::new(HashMap::new()),
            pending_credits: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            outbound_index: Mutex::new(HashMap::new()),
            pending_inbound: Mutex::new(HashMap::new()),
            relay_halted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn seen(&self) -> &Arc<SeenCache> {
        &self.seen
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.message_tx.subscribe()
    }

    pub fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.peer_tx.subscribe()
    }

    pub fn subscribe_security_events(&self) -> broadcast::Receiver<SecurityEvent> {
        self.security_tx.subscribe()
    }

    /// Whether a fatal persistence error has halted relaying
    pub fn is_halted(&self) -> bool {
        self.relay_halted.load(Ordering::SeqCst)
    }

    fn local_key(&self) -> PeerId {
        self.identity.public_key()
    }

    fn outbound_state(&self, id: &Uuid) -> Option<OutboundState> {
        self.outbound.lock().get(id).copied()
    }

    fn transition(&self, id: Uuid, next: OutboundState) {
        let mut outbound = self.outbound.lock();
        match outbound.get(&id).copied() {
            Some(current) if current.can_transition(next) => {
                outbound.insert(id, next);
            }
            None => {
                outbound.insert(id, next);
            }
            Some(_) => {}
        }
    }

    /// Track the delivery state of a message sent earlier
    pub fn delivery_state(&self, id: &Uuid) -> Option<OutboundState> {
        self.outbound_state(id)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    pub async fn handle_peer_connected(&self, peer: PeerId, kind: TransportKind) {
        let now = self.clock.now_ms();

        if !self
            .registry
            .limiter()
            .try_consume(&peer, RateClass::Connect, now)
        {
            tracing::warn!(peer = %short_peer_id(&peer), "connection attempt rate limited");
            let _ = self.transport.close(peer).await;
            return;
        }

        self.registry.upsert(peer, kind, now);
        self.registry.mark_connected(&peer, now);
        let _ = self.peer_tx.send(PeerEvent::Connected { peer, kind });

        // Sneakernet moment: the destination is back, drain its backlog
        self.drain_store_forward_for(&peer).await;
    }

    pub async fn handle_peer_disconnected(&self, peer: PeerId, reason: String) {
        self.registry.mark_disconnected(&peer);
        let _ = self.peer_tx.send(PeerEvent::Disconnected { peer, reason });
    }

    // ------------------------------------------------------------------
    // Inbound pipeline
    // ------------------------------------------------------------------

    /// Process one frame from a transport. Per-peer callers must invoke
    /// this sequentially; different peers may run concurrently.
    pub async fn handle_frame(&self, from: PeerId, bytes: Vec<u8>) -> Disposition {
        let now = self.clock.now_ms();
        RelayStats::bump(&self.stats.received);

        if self.is_halted() {
            return self.drop_frame("relay halted");
        }

        // Blacklisted peers get no processing at all
        if self.registry.is_blacklisted(&from, now) {
            return self.drop_frame("blacklisted");
        }

        if self.registry.get(&from).is_none() {
            self.registry.upsert(from, TransportKind::Local, now);
        }
        self.registry.record_inbound(&from, bytes.len(), now);

        // Step 1: decode
        let envelope = match binary::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => return self.on_protocol_violation(&from, err, now),
        };
        if let Err(err) = binary::check_timestamp(
            envelope.header.timestamp_ms,
            now,
            self.config.protocol.max_past_skew.as_millis() as u64,
            self.config.protocol.max_future_skew.as_millis() as u64,
        ) {
            return self.on_protocol_violation(&from, err, now);
        }

        // Step 2: ingress rate limit
        if !self
            .registry
            .limiter()
            .try_consume(&from, RateClass::Inbound, now)
        {
            RelayStats::bump(&self.stats.rate_limited);
            let score = self.penalize(&from, ReputationEvent::Spam, now);
            tracing::debug!(peer = %short_peer_id(&from), score, "inbound rate limit exceeded");
            return self.drop_frame("rate limited");
        }

        // Step 3: signature over version||type||ttl||timestamp||payload
        if !envelope.verify_signature() {
            RelayStats::bump(&self.stats.invalid_signatures);
            self.penalize(&from, ReputationEvent::InvalidSignature, now);
            let _ = self.security_tx.send(SecurityEvent::BadSignature { peer: from });
            return self.drop_frame("invalid signature");
        }
        *self.pending_credits.lock().entry(from).or_insert(0) += 1;

        // Step 4: dedup
        let fingerprint = envelope.fingerprint();
        if !self.seen.insert(fingerprint, now) {
            RelayStats::bump(&self.stats.duplicates);
            self.note_duplicate(&from, now);
            return Disposition::Dropped("duplicate");
        }

        // Steps 5–8: dispatch by kind
        self.dispatch(envelope, from, now).await
    }

    async fn dispatch(&self, envelope: Envelope, from: PeerId, now: u64) -> Disposition {
        match envelope.header.kind {
            MessageKind::Ping => {
                self.answer_ping(&envelope, from).await;
                Disposition::Handled
            }
            MessageKind::Pong => {
                if let Some(sent_ms) = pong_timestamp(&envelope.payload) {
                    if now >= sent_ms {
                        self.registry.observe_latency(&from, (now - sent_ms) as f64);
                    }
                }
                Disposition::Handled
            }
            MessageKind::PeerDiscovery => {
                if let Some(digest) = gossip::decode_digest(&envelope.payload) {
                    self.answer_digest(&from, &digest, now).await;
                    return Disposition::Handled;
                }
                self.deliver_unencrypted(&envelope);
                self.forward(envelope, from, now).await
            }
            MessageKind::PeerIntro | MessageKind::Unknown(_) => {
                self.deliver_unencrypted(&envelope);
                self.forward(envelope, from, now).await
            }
            _ => {
                // Directed kinds carry a 32-byte destination prefix
                let dest = match envelope.destination() {
                    Some(dest) => dest,
                    None => {
                        return self.on_protocol_violation(
                            &from,
                            Error::Protocol("directed envelope without destination".to_string()),
                            now,
                        );
                    }
                };
                if dest == self.local_key() {
                    self.deliver_local(envelope, from, now).await
                } else {
                    self.forward(envelope, from, now).await
                }
            }
        }
    }

    /// Step 6: this node is the destination
    async fn deliver_local(&self, envelope: Envelope, from: PeerId, now: u64) -> Disposition {
        let sender = envelope.header.sender;
        let hops = self.hops_traveled(&envelope);
        self.router.record_route(sender, from, hops, now);

        match envelope.header.kind {
            MessageKind::KeyExchange => {
                let offered_epoch = handshake_epoch(&envelope.payload);
                if let Err(err) = self.sync_session(&sender, offered_epoch, now).await {
                    tracing::warn!(peer = %short_peer_id(&sender), %err, "key exchange failed");
                    return self.drop_frame("key exchange failed");
                }
                let epoch = self.sessions.epoch(&sender).unwrap_or(0);
                self.send_control(
                    &sender,
                    MessageKind::SessionKey,
                    handshake_payload(&sender, epoch),
                    now,
                )
                .await;
                self.replay_pending_inbound(&sender, now).await;
                Disposition::Handled
            }
            MessageKind::SessionKey => {
                let offered_epoch = handshake_epoch(&envelope.payload);
                if self.sync_session(&sender, offered_epoch, now).await.is_err() {
                    return self.drop_frame("session key handling failed");
                }
                self.replay_pending_inbound(&sender, now).await;
                Disposition::Handled
            }
            MessageKind::Ack => {
                if let Some(acked) = ack_fingerprint(&envelope.payload) {
                    if let Some(id) = self.outbound_index.lock().get(&acked).copied() {
                        self.transition(id, OutboundState::Sent);
                    }
                    self.router.record_outcome(&sender, true, None);
                }
                self.emit_message(&envelope, envelope.payload[32..].to_vec());
                RelayStats::bump(&self.stats.delivered);
                Disposition::Delivered
            }
            kind if kind.is_encrypted() => self.deliver_encrypted(envelope, now).await,
            _ => {
                self.deliver_unencrypted(&envelope);
                RelayStats::bump(&self.stats.delivered);
                Disposition::Delivered
            }
        }
    }

    async fn deliver_encrypted(&self, envelope: Envelope, now: u64) -> Disposition {
        let sender = envelope.header.sender;
        if !self.sessions.has_session(&sender) {
            // SessionMissing policy: park the message, ask for a key
            // exchange, and replay once keys exist
            {
                let mut pending = self.pending_inbound.lock();
                if pending.len() < PENDING_SENDER_LIMIT || pending.contains_key(&sender) {
                    let queue = pending.entry(sender).or_default();
                    if queue.len() < 32 {
                        queue.push(envelope.clone());
                    }
                }
            }
            self.send_control(
                &sender,
                MessageKind::KeyExchange,
                handshake_payload(&sender, 0),
                now,
            )
            .await;
            return self.drop_frame("no session");
        }

        let aad = envelope.header.aad_prefix();
        let body = match envelope.directed_body() {
            Some(body) => body,
            None => return self.drop_frame("empty encrypted body"),
        };

        match self.sessions.decrypt_from(&sender, &aad, body, now) {
            Ok(plaintext) => {
                self.emit_message(&envelope, plaintext);
                self.send_ack(&sender, envelope.fingerprint(), now).await;
                RelayStats::bump(&self.stats.delivered);
                Disposition::Delivered
            }
            Err(Error::NonceReuse(_)) => {
                let _ = self
                    .security_tx
                    .send(SecurityEvent::NonceReuse { peer: sender });
                self.force_rekey(&sender, now).await;
                self.drop_frame("nonce reuse")
            }
            Err(Error::MacFailure) => {
                // Key desync: rotate and let the next message heal
                let _ = self
                    .security_tx
                    .send(SecurityEvent::MacFailure { peer: sender });
                self.force_rekey(&sender, now).await;
                self.drop_frame("mac failure")
            }
            Err(err) => {
                tracing::debug!(peer = %short_peer_id(&sender), %err, "decrypt failed");
                self.drop_frame("decrypt failed")
            }
        }
    }

    /// Step 7: not ours — decrement TTL and pass it on
    async fn forward(&self, mut envelope: Envelope, from: PeerId, now: u64) -> Disposition {
        if envelope.header.ttl == 0 {
            return self.drop_frame("ttl expired");
        }
        envelope.header.ttl -= 1;
        if envelope.header.ttl == 0 {
            // Decremented to zero: the envelope's journey ends here
            return self.drop_frame("ttl expired");
        }

        // Step 8: the original sender is reachable back through `from`
        let hops = self.hops_traveled(&envelope);
        self.router.record_route(envelope.header.sender, from, hops, now);

        match self.router.mode() {
            RouterMode::Flood => self.forward_flood(envelope, Some(&from), now).await,
            RouterMode::Gossip => {
                self.gossip.offer(envelope, now);
                Disposition::Gossiped
            }
            RouterMode::Hybrid => {
                let connected = self.registry.connected_peers(now);
                self.gossip.offer(envelope.clone(), now);
                if connected.len() <= self.config.gossip.fanout {
                    // Too sparse for epidemic spread; flood as the fallback
                    self.forward_flood(envelope, Some(&from), now).await
                } else {
                    Disposition::Gossiped
                }
            }
        }
    }

    async fn forward_flood(
        &self,
        envelope: Envelope,
        exclude: Option<&PeerId>,
        now: u64,
    ) -> Disposition {
        let targets = self.router.flood_targets(exclude, now);
        if targets.is_empty() {
            if let Some(dest) = envelope.destination() {
                let bytes = binary::encode(&envelope);
                if self.store_forward.enqueue(bytes, dest, now).await.is_ok() {
                    RelayStats::bump(&self.stats.queued_store_forward);
                    return Disposition::Queued;
                }
            }
            return self.drop_frame("no forward targets");
        }

        let fanout = targets.len();
        match self.queue.enqueue(OutboundItem::new(envelope, targets)) {
            Ok(()) => {
                RelayStats::bump(&self.stats.forwarded);
                Disposition::Forwarded(fanout)
            }
            Err(Error::Overloaded) => self.drop_frame("overloaded"),
            Err(_) => self.drop_frame("queue failure"),
        }
    }

    // ------------------------------------------------------------------
    // Local origination
    // ------------------------------------------------------------------

    /// Build, sign, and dispatch a message from this node
    pub async fn send_message(
        &self,
        dest: PeerId,
        kind: MessageKind,
        body: Vec<u8>,
        priority: Option<crate::protocol::Priority>,
    ) -> (Uuid, SendOutcome) {
        let now = self.clock.now_ms();
        let id = Uuid::new_v4();
        self.transition(id, OutboundState::Pending);

        if self.is_halted() {
            self.transition(id, OutboundState::Dropped);
            return (id, SendOutcome::Dropped("relay halted"));
        }
        if self.registry.is_blacklisted(&dest, now) {
            self.transition(id, OutboundState::Dropped);
            return (id, SendOutcome::Dropped("destination blacklisted"));
        }
        if body.len() + 32 + 40 > self.config.protocol.max_payload {
            self.transition(id, OutboundState::Dropped);
            return (id, SendOutcome::Dropped("payload too large"));
        }

        let payload = if kind.is_encrypted() {
            if !self.sessions.has_session(&dest) {
                if self.ensure_session(&dest, now).await.is_err() {
                    self.transition(id, OutboundState::Dropped);
                    return (id, SendOutcome::Dropped("session establishment failed"));
                }
                let epoch = self.sessions.epoch(&dest).unwrap_or(0);
                self.send_control(
                    &dest,
                    MessageKind::KeyExchange,
                    handshake_payload(&dest, epoch),
                    now,
                )
                .await;
            }
            let aad = protocol::aad_for(kind, now, &self.local_key());
            match self.sessions.encrypt_for(&dest, &aad, &body, now) {
                Ok(sealed) => {
                    self.persist_session_state(&dest, now).await;
                    let mut payload = dest.to_vec();
                    payload.extend_from_slice(&sealed);
                    payload
                }
                Err(err) => {
                    tracing::warn!(peer = %short_peer_id(&dest), %err, "encrypt failed");
                    self.transition(id, OutboundState::Dropped);
                    return (id, SendOutcome::Dropped("encryption failed"));
                }
            }
        } else if kind.is_directed() {
            let mut payload = dest.to_vec();
            payload.extend_from_slice(&body);
            payload
        } else {
            body
        };

        let envelope = Envelope::new_signed(
            self.identity.keypair(),
            kind,
            self.config.relay.default_ttl,
            now,
            payload,
        );
        let fingerprint = envelope.fingerprint();
        // Never relay our own envelope back to ourselves
        self.seen.insert(fingerprint, now);
        self.outbound_index.lock().insert(fingerprint, id);

        let outcome = self
            .dispatch_local_origin_with(envelope, &dest, now, priority)
            .await;
        match &outcome {
            SendOutcome::Sent => self.transition(id, OutboundState::Queued),
            SendOutcome::Queued => self.transition(id, OutboundState::Queued),
            SendOutcome::Dropped(_) => self.transition(id, OutboundState::Dropped),
        }
        (id, outcome)
    }

    async fn dispatch_local_origin(
        &self,
        envelope: Envelope,
        dest: &PeerId,
        now: u64,
    ) -> SendOutcome {
        self.dispatch_local_origin_with(envelope, dest, now, None)
            .await
    }

    async fn dispatch_local_origin_with(
        &self,
        envelope: Envelope,
        dest: &PeerId,
        now: u64,
        priority: Option<crate::protocol::Priority>,
    ) -> SendOutcome {
        let connected = self.registry.connected_peers(now);

        // Pure gossip disseminates everything epidemically; direct routing
        // only kicks in when nobody is connected to carry it.
        if matches!(self.router.mode(), RouterMode::Gossip) {
            self.gossip.offer(envelope.clone(), now);
            if !connected.is_empty() {
                return SendOutcome::Sent;
            }
            return self.park_for_later(envelope, dest, now).await;
        }
        if matches!(self.router.mode(), RouterMode::Hybrid) {
            self.gossip.offer(envelope.clone(), now);
        }

        let targets = if connected.contains(dest) {
            vec![*dest]
        } else if let Some(hop) = self.router.next_hop(dest, now) {
            vec![hop]
        } else {
            self.router.flood_targets(None, now)
        };

        if targets.is_empty() {
            if matches!(self.router.mode(), RouterMode::Hybrid) && !connected.is_empty() {
                return SendOutcome::Sent;
            }
            return self.park_for_later(envelope, dest, now).await;
        }

        let mut item = OutboundItem::new(envelope, targets);
        if let Some(priority) = priority {
            item = item.with_priority(priority);
        }
        match self.queue.enqueue(item) {
            Ok(()) => SendOutcome::Sent,
            Err(Error::Overloaded) => SendOutcome::Dropped("overloaded"),
            Err(_) => SendOutcome::Dropped("queue failure"),
        }
    }

    async fn park_for_later(&self, envelope: Envelope, dest: &PeerId, now: u64) -> SendOutcome {
        let bytes = binary::encode(&envelope);
        match self.store_forward.enqueue(bytes, *dest, now).await {
            Ok(_) => {
                RelayStats::bump(&self.stats.queued_store_forward);
                SendOutcome::Queued
            }
            Err(_) => SendOutcome::Dropped("persistence failure"),
        }
    }

    // ------------------------------------------------------------------
    // Outbound drain, gossip rounds, retries
    // ------------------------------------------------------------------

    /// Drain the priority queue onto the wire; returns frames sent
    pub async fn flush_outbound(&self) -> usize {
        let mut sent = 0;
        while let Some(item) = self.queue.dequeue() {
            let bytes = binary::encode(&item.envelope);
            let fingerprint = item.envelope.fingerprint();
            let id = self.outbound_index.lock().get(&fingerprint).copied();
            if let Some(id) = id {
                self.transition(id, OutboundState::Sending);
            }

            let mut delivered_any = false;
            for target in &item.targets {
                match with_deadline(
                    "frame send",
                    self.config.relay.send_deadline,
                    self.transport.send_frame(*target, bytes.clone()),
                )
                .await
                {
                    Ok(()) => {
                        delivered_any = true;
                        self.registry.record_outbound(target, bytes.len());
                        self.registry.observe_loss(target, false);
                    }
                    Err(err) => {
                        self.registry.observe_loss(target, true);
                        tracing::debug!(
                            peer = %short_peer_id(target),
                            %err,
                            "frame send failed"
                        );
                        if matches!(err, Error::TransportPermanent(_)) {
                            let _ = self
                                .peer_tx
                                .send(PeerEvent::Unreachable { peer: *target });
                        }
                    }
                }
            }

            if delivered_any {
                sent += 1;
                if let Some(id) = id {
                    self.transition(id, OutboundState::Sent);
                }
            } else {
                if let Some(id) = id {
                    self.transition(id, OutboundState::Failed);
                }
                // Retriable failure: park the message for store-and-forward
                if let Some(dest) = item.envelope.destination() {
                    let now = self.clock.now_ms();
                    if self
                        .store_forward
                        .enqueue(bytes, dest, now)
                        .await
                        .is_ok()
                    {
                        RelayStats::bump(&self.stats.queued_store_forward);
                        if let Some(id) = id {
                            self.transition(id, OutboundState::Queued);
                        }
                    }
                }
            }
        }
        sent
    }

    /// One gossip round: pushes and pull digests to a random sample
    pub async fn run_gossip_round(&self) {
        if matches!(self.router.mode(), RouterMode::Flood) {
            return;
        }
        let now = self.clock.now_ms();
        let connected = self.registry.connected_peers(now);
        let round = self.gossip.plan_round(&connected, now);

        for (peer, envelopes) in round.pushes {
            for envelope in envelopes {
                let bytes = binary::encode(&envelope);
                let _ = with_deadline(
                    "gossip push",
                    self.config.gossip.round_deadline,
                    self.transport.send_frame(peer, bytes),
                )
                .await;
            }
        }

        for peer in round.digest_requests {
            let digest = self.seen.recent(self.config.gossip.digest_limit);
            let envelope = Envelope::new_signed(
                self.identity.keypair(),
                MessageKind::PeerDiscovery,
                1,
                now,
                gossip::encode_digest(&digest),
            );
            let _ = with_deadline(
                "gossip digest",
                self.config.gossip.round_deadline,
                self.transport.send_frame(peer, binary::encode(&envelope)),
            )
            .await;
        }
    }

    /// Store-and-forward scheduler tick
    pub async fn run_retry_tick(&self) {
        let now = self.clock.now_ms();
        let due = match self.store_forward.due(now).await {
            Ok(due) => due,
            Err(err) => {
                tracing::warn!(%err, "store-and-forward scan failed");
                return;
            }
        };
        for (id, message) in due {
            self.attempt_queued_delivery(id, message, now).await;
        }
    }

    /// Periodic housekeeping: apply batched reputation credit, expire
    /// routes, sweep sessions, prune storage
    pub async fn run_maintenance(&self) {
        let now = self.clock.now_ms();

        let credits: Vec<(PeerId, u32)> = self.pending_credits.lock().drain().collect();
        for (peer, count) in credits {
            for _ in 0..count.min(100) {
                self.registry
                    .adjust_reputation(&peer, ReputationEvent::ValidMessage, now);
            }
        }

        self.router.expire_routes(now);
        self.registry.limiter().cleanup(now);
        self.registry.decay_stale_health(now);

        {
            let mut outbound = self.outbound.lock();
            if outbound.len() > OUTBOUND_TRACK_LIMIT {
                outbound.clear();
                self.outbound_index.lock().clear();
            }
        }

        for peer in self.sessions.sweep_expired(now) {
            let _ = self.storage.delete_session_key(&peer).await;
        }
        if let Err(err) = self.storage.prune_expired(now).await {
            tracing::warn!(%err, "storage prune failed");
        }
        if let Err(err) = self.storage.delete_expired_routes(now).await {
            tracing::warn!(%err, "route prune failed");
        }
        // Flush live peer and route state for restart survival
        for record in self.registry.snapshot() {
            let _ = self.storage.upsert_peer(record).await;
        }
        for route in self.router.snapshot() {
            let _ = self.storage.put_route(route).await;
        }
    }

    /// Send a PING to a connected peer; the PONG echo measures latency
    pub async fn ping(&self, peer: &PeerId) {
        let now = self.clock.now_ms();
        let envelope = Envelope::new_signed(
            self.identity.keypair(),
            MessageKind::Ping,
            1,
            now,
            now.to_be_bytes().to_vec(),
        );
        let _ = with_deadline(
            "ping",
            self.config.relay.send_deadline,
            self.transport.send_frame(*peer, binary::encode(&envelope)),
        )
        .await;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn drain_store_forward_for(&self, peer: &PeerId) {
        let now = self.clock.now_ms();
        let due = match self.store_forward.due_for(peer, now).await {
            Ok(due) => due,
            Err(_) => return,
        };
        for (id, message) in due {
            self.attempt_queued_delivery(id, message, now).await;
        }
    }

    async fn attempt_queued_delivery(
        &self,
        id: crate::storage::MessageId,
        message: crate::storage::QueuedMessage,
        now: u64,
    ) {
        let connected = self.registry.connected_peers(now);
        let target = if connected.contains(&message.destination) {
            Some(message.destination)
        } else {
            self.router.next_hop(&message.destination, now)
        };

        let Some(target) = target else {
            let _ = self.store_forward.mark_failed(id, message, now).await;
            return;
        };

        match with_deadline(
            "queued send",
            self.config.relay.send_deadline,
            self.transport.send_frame(target, message.envelope.clone()),
        )
        .await
        {
            Ok(()) => {
                self.registry.record_outbound(&target, message.envelope.len());
                let _ = self.store_forward.mark_delivered(id).await;
            }
            Err(_) => {
                let _ = self.store_forward.mark_failed(id, message, now).await;
            }
        }
    }

    async fn ensure_session(&self, peer: &PeerId, now: u64) -> crate::error::Result<()> {
        self.sync_session(peer, 0, now).await
    }

    /// Establish (or fast-forward) the session with a peer, honoring both
    /// our persisted epoch and the epoch the peer advertised
    async fn sync_session(&self, peer: &PeerId, min_epoch: u64, now: u64) -> crate::error::Result<()> {
        let stored_epoch = match self.storage.get_session_key(peer).await {
            Ok(Some(record)) => record.epoch,
            _ => 0,
        };
        self.sessions
            .ensure_min_epoch(peer, stored_epoch.max(min_epoch), now)?;
        self.persist_session_state(peer, now).await;
        Ok(())
    }

    /// Push parked inbound envelopes back through delivery now that a
    /// session exists; only encrypted kinds are ever parked
    async fn replay_pending_inbound(&self, peer: &PeerId, now: u64) {
        let parked = self.pending_inbound.lock().remove(peer);
        if let Some(parked) = parked {
            for envelope in parked {
                let _ = self.deliver_encrypted(envelope, now).await;
            }
        }
    }

    async fn force_rekey(&self, peer: &PeerId, now: u64) {
        if self.sessions.rekey_now(peer, now).is_ok() {
            self.persist_session_state(peer, now).await;
        }
    }

    async fn persist_session_state(&self, peer: &PeerId, now: u64) {
        if let Some(epoch) = self.sessions.epoch(peer) {
            let record = SessionKeyRecord {
                peer: *peer,
                epoch,
                established_at: now,
                expires_at: now + self.config.session.rekey_after.as_millis() as u64,
            };
            if let Err(err) = self.storage.put_session_key(record).await {
                tracing::warn!(%err, "session state persist failed");
            }
        }
    }

    async fn send_control(&self, dest: &PeerId, kind: MessageKind, payload: Vec<u8>, now: u64) {
        let envelope = Envelope::new_signed(
            self.identity.keypair(),
            kind,
            self.config.relay.default_ttl,
            now,
            payload,
        );
        self.seen.insert(envelope.fingerprint(), now);
        let _ = self.dispatch_local_origin(envelope, dest, now).await;
    }

    async fn send_ack(&self, dest: &PeerId, acked_fingerprint: [u8; 32], now: u64) {
        let mut payload = dest.to_vec();
        payload.extend_from_slice(&acked_fingerprint);
        self.send_control(dest, MessageKind::Ack, payload, now).await;
    }

    async fn answer_ping(&self, ping: &Envelope, from: PeerId) {
        let now = self.clock.now_ms();
        let pong = Envelope::new_signed(
            self.identity.keypair(),
            MessageKind::Pong,
            1,
            now,
            ping.payload.clone(),
        );
        let _ = with_deadline(
            "pong",
            self.config.relay.send_deadline,
            self.transport.send_frame(from, binary::encode(&pong)),
        )
        .await;
    }

    async fn answer_digest(&self, from: &PeerId, digest: &[[u8; 32]], now: u64) {
        let missing = self.gossip.handle_digest(from, digest, now);
        for envelope in missing {
            let bytes = binary::encode(&envelope);
            let _ = with_deadline(
                "digest answer",
                self.config.gossip.round_deadline,
                self.transport.send_frame(*from, bytes),
            )
            .await;
        }
    }

    fn emit_message(&self, envelope: &Envelope, payload: Vec<u8>) {
        let _ = self.message_tx.send(InboundMessage {
            from: envelope.header.sender,
            kind: envelope.header.kind,
            payload,
            timestamp_ms: envelope.header.timestamp_ms,
        });
    }

    fn deliver_unencrypted(&self, envelope: &Envelope) {
        self.emit_message(envelope, envelope.payload.clone());
    }

    /// Apply a penalty now, forfeiting any batched credit; returns the
    /// new score and emits the blacklist alert if this tipped the peer over
    fn penalize(&self, from: &PeerId, event: ReputationEvent, now: u64) -> i32 {
        self.pending_credits.lock().remove(from);
        let score = self.registry.adjust_reputation(from, event, now);
        if self.registry.is_blacklisted(from, now) {
            let until = self
                .registry
                .get(from)
                .map(|p| p.blacklisted_until)
                .unwrap_or(0);
            let _ = self.security_tx.send(SecurityEvent::Blacklisted {
                peer: *from,
                until_ms: until,
            });
        }
        score
    }

    fn note_duplicate(&self, from: &PeerId, now: u64) {
        let mut windows = self.dup_windows.lock();
        let entry = windows.entry(*from).or_insert((now, 0));
        if now.saturating_sub(entry.0) >= 1000 {
            *entry = (now, 0);
        }
        entry.1 += 1;
        let flooding = entry.1 == DUP_FLOOD_PER_SEC + 1;
        drop(windows);
        if flooding {
            self.penalize(from, ReputationEvent::ReplayFlood, now);
        }
    }

    fn on_protocol_violation(&self, from: &PeerId, err: Error, now: u64) -> Disposition {
        let severe = matches!(err, Error::InvalidVersion { .. } | Error::SignatureInvalid);
        self.penalize(from, ReputationEvent::ProtocolViolation { severe }, now);
        let _ = self.security_tx.send(SecurityEvent::DecodeViolation {
            peer: *from,
            detail: err.to_string(),
        });
        self.drop_frame("protocol violation")
    }

    fn drop_frame(&self, reason: &'static str) -> Disposition {
        RelayStats::bump(&self.stats.dropped);
        Disposition::Dropped(reason)
    }

    fn hops_traveled(&self, envelope: &Envelope) -> u32 {
        self.config
            .relay
            .default_ttl
            .saturating_sub(envelope.header.ttl) as u32
    }

    /// Fatal persistence failure on identity material: stop relaying but
    /// preserve in-memory state for inspection
    pub fn halt(&self) {
        self.relay_halted.store(true, Ordering::SeqCst);
        tracing::error!("relay halted after fatal persistence error");
    }
}

/// KEY_EXCHANGE / SESSION_KEY payload: destination plus the sender's
/// current key epoch, so a peer resuming persisted state can be caught up
fn handshake_payload(dest: &PeerId, epoch: u64) -> Vec<u8> {
    let mut payload = dest.to_vec();
    payload.extend_from_slice(&epoch.to_be_bytes());
    payload
}

fn handshake_epoch(payload: &[u8]) -> u64 {
    payload
        .get(32..40)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn ack_fingerprint(payload: &[u8]) -> Option<[u8; 32]> {
    if payload.len() < 64 {
        return None;
    }
    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&payload[32..64]);
    Some(fingerprint)
}

fn pong_timestamp(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
