//! Peer registry: records, reputation, blacklist, health, rate limits
//!
//! The registry is the single owner of per-peer state. Routes and sessions
//! refer to peers by id only; nothing holds a pointer into the registry.
//! Reads take a shared lock on a read-mostly map; writes are short and
//! exclusive.

pub mod rate_limiter;
pub mod reputation;

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::PeerConfig;
use crate::protocol::{short_peer_id, PeerId};
use crate::transport::TransportKind;

pub use rate_limiter::{RateClass, RateLimiter};
pub use reputation::{ReputationEvent, BLACKLIST_THRESHOLD, INITIAL_REPUTATION};

/// EWMA smoothing factor for health inputs
const HEALTH_ALPHA: f64 = 0.2;

/// Link-quality inputs, smoothed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Smoothed packet-loss rate in [0, 1]
    pub loss_rate: f64,
    /// Smoothed round-trip latency in milliseconds
    pub latency_ms: f64,
    /// Fraction of the observation window the peer was reachable
    pub uptime: f64,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            latency_ms: 0.0,
            uptime: 1.0,
        }
    }
}

impl HealthMetrics {
    fn observe_latency(&mut self, sample_ms: f64) {
        if self.latency_ms == 0.0 {
            self.latency_ms = sample_ms;
        } else {
            self.latency_ms = self.latency_ms * (1.0 - HEALTH_ALPHA) + sample_ms * HEALTH_ALPHA;
        }
    }

    fn observe_loss(&mut self, lost: bool) {
        let sample = if lost { 1.0 } else { 0.0 };
        self.loss_rate = self.loss_rate * (1.0 - HEALTH_ALPHA) + sample * HEALTH_ALPHA;
    }

    fn observe_uptime(&mut self, reachable: bool) {
        let sample = if reachable { 1.0 } else { 0.0 };
        self.uptime = self.uptime * (1.0 - HEALTH_ALPHA) + sample * HEALTH_ALPHA;
    }

    /// Health on a 0–100 scale: delivery weighted heaviest, then latency
    /// (1 s and up scores zero), then uptime
    pub fn score(&self) -> u8 {
        let delivery = 1.0 - self.loss_rate.clamp(0.0, 1.0);
        let latency = 1.0 - (self.latency_ms / 1000.0).clamp(0.0, 1.0);
        let combined = delivery * 0.4 + latency * 0.3 + self.uptime.clamp(0.0, 1.0) * 0.3;
        (combined * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

/// Everything the mesh knows about one remote peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub transport: TransportKind,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Set while a live transport connection exists
    pub connected_at: Option<u64>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reputation_score: i32,
    pub health: HealthMetrics,
    pub is_blacklisted: bool,
    pub blacklisted_until: u64,
    /// Auto-blacklist trigger count; drives the doubling duration
    pub blacklist_strikes: u32,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, transport: TransportKind, now_ms: u64) -> Self {
        Self {
            peer_id,
            transport,
            first_seen: now_ms,
            last_seen: now_ms,
            connected_at: None,
            bytes_in: 0,
            bytes_out: 0,
            reputation_score: INITIAL_REPUTATION,
            health: HealthMetrics::default(),
            is_blacklisted: false,
            blacklisted_until: 0,
            blacklist_strikes: 0,
        }
    }

    pub fn health_score(&self) -> u8 {
        self.health.score()
    }
}

/// Registry of known peers plus the shared rate limiter
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    limiter: RateLimiter,
    config: PeerConfig,
}

impl PeerRegistry {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            limiter: RateLimiter::new(&config),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Insert or refresh a peer record
    pub fn upsert(&self, peer_id: PeerId, transport: TransportKind, now_ms: u64) {
        let mut peers = self.peers.write();
        peers
            .entry(peer_id)
            .and_modify(|record| {
                record.transport = transport;
                record.last_seen = record.last_seen.max(now_ms);
            })
            .or_insert_with(|| PeerRecord::new(peer_id, transport, now_ms));
    }

    /// Restore a persisted record, keeping the freshest of the two
    pub fn restore(&self, record: PeerRecord) {
        let mut peers = self.peers.write();
        let keep_existing = peers
            .get(&record.peer_id)
            .map(|existing| existing.last_seen >= record.last_seen)
            .unwrap_or(false);
        if !keep_existing {
            peers.insert(record.peer_id, record);
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Peers seen within the cutoff window
    pub fn active_peers(&self, now_ms: u64) -> Vec<PeerRecord> {
        let cutoff = self.config.active_cutoff.as_millis() as u64;
        self.peers
            .read()
            .values()
            .filter(|record| now_ms.saturating_sub(record.last_seen) <= cutoff)
            .cloned()
            .collect()
    }

    /// Peers with a live transport connection, excluding blacklisted ones
    pub fn connected_peers(&self, now_ms: u64) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|record| record.connected_at.is_some())
            .filter(|record| !Self::blacklist_active(record, now_ms))
            .map(|record| record.peer_id)
            .collect()
    }

    pub fn mark_connected(&self, peer_id: &PeerId, now_ms: u64) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.connected_at = Some(now_ms);
            record.last_seen = record.last_seen.max(now_ms);
            record.health.observe_uptime(true);
        }
    }

    pub fn mark_disconnected(&self, peer_id: &PeerId) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.connected_at = None;
            record.health.observe_uptime(false);
        }
        self.limiter.forget(peer_id);
    }

    /// Account an inbound frame
    pub fn record_inbound(&self, peer_id: &PeerId, bytes: usize, now_ms: u64) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.bytes_in += bytes as u64;
            record.last_seen = record.last_seen.max(now_ms);
        }
    }

    /// Account an outbound frame
    pub fn record_outbound(&self, peer_id: &PeerId, bytes: usize) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.bytes_out += bytes as u64;
        }
    }

    pub fn observe_latency(&self, peer_id: &PeerId, sample_ms: f64) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.health.observe_latency(sample_ms);
        }
    }

    pub fn observe_loss(&self, peer_id: &PeerId, lost: bool) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.health.observe_loss(lost);
        }
    }

    /// Apply a reputation event; auto-blacklists below the threshold.
    /// Returns the new score.
    pub fn adjust_reputation(&self, peer_id: &PeerId, event: ReputationEvent, now_ms: u64) -> i32 {
        let mut peers = self.peers.write();
        let record = match peers.get_mut(peer_id) {
            Some(record) => record,
            None => return INITIAL_REPUTATION,
        };

        record.reputation_score = reputation::apply_delta(record.reputation_score, event.delta());

        if record.reputation_score < self.config.blacklist_threshold
            && !Self::blacklist_active(record, now_ms)
        {
            let duration = Self::strike_duration(record.blacklist_strikes, &self.config);
            record.blacklist_strikes += 1;
            record.is_blacklisted = true;
            record.blacklisted_until = now_ms + duration;
            tracing::warn!(
                peer = %short_peer_id(peer_id),
                score = record.reputation_score,
                until_ms = record.blacklisted_until,
                "peer auto-blacklisted"
            );
        }

        record.reputation_score
    }

    /// Explicit blacklist for a fixed duration
    pub fn blacklist(&self, peer_id: &PeerId, duration_ms: u64, now_ms: u64) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.is_blacklisted = true;
            record.blacklisted_until = record.blacklisted_until.max(now_ms + duration_ms);
            record.blacklist_strikes += 1;
        }
    }

    /// Whether the peer is currently blacklisted; expiry reinstates the
    /// peer at the threshold score so one bad event does not instantly
    /// re-trigger
    pub fn is_blacklisted(&self, peer_id: &PeerId, now_ms: u64) -> bool {
        let mut peers = self.peers.write();
        let record = match peers.get_mut(peer_id) {
            Some(record) => record,
            None => return false,
        };
        if record.is_blacklisted && now_ms >= record.blacklisted_until {
            record.is_blacklisted = false;
            record.reputation_score = record.reputation_score.max(self.config.blacklist_threshold);
        }
        record.is_blacklisted
    }

    /// Decay the uptime input for peers silent past the health window;
    /// run from the maintenance tick
    pub fn decay_stale_health(&self, now_ms: u64) {
        let window = self.config.health_window.as_millis() as u64;
        let mut peers = self.peers.write();
        for record in peers.values_mut() {
            if now_ms.saturating_sub(record.last_seen) > window {
                record.health.observe_uptime(false);
            }
        }
    }

    /// Metrics tuple used by the router's next-hop tie-breaks
    pub fn route_metrics(&self, peer_id: &PeerId) -> Option<(u8, u32, i32)> {
        self.peers.read().get(peer_id).map(|record| {
            (
                record.health.score(),
                record.health.latency_ms.round() as u32,
                record.reputation_score,
            )
        })
    }

    /// Snapshot of all records, for persistence flushes
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    fn blacklist_active(record: &PeerRecord, now_ms: u64) -> bool {
        record.is_blacklisted && now_ms < record.blacklisted_until
    }

    fn strike_duration(strikes: u32, config: &PeerConfig) -> u64 {
        let base = config.blacklist_base.as_millis() as u64;
        let cap = config.blacklist_cap.as_millis() as u64;
        base.saturating_mul(1u64 << strikes.min(16)).min(cap)
    }
}
