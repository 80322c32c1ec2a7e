//! Routing core: one seam, three interchangeable modes
//!
//! `Flood` is the correctness floor: forward to every connected peer except
//! the one the envelope arrived from. `Gossip` hands dissemination to the
//! epidemic engine, and `Hybrid` uses gossip with flood as the last-resort
//! fallback when too few peers are reachable.
//!
//! The route table holds next-hop hints learned from relayed traffic and
//! delivery outcomes. Next-hop selection breaks ties on health, then
//! latency, then reputation, then a stable per-node random key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::peers::{PeerRegistry, RateClass};
use crate::protocol::PeerId;

/// EWMA factor for route success tracking
const SUCCESS_ALPHA: f64 = 0.25;

/// Routes whose success rate decays below this are dropped
const SUCCESS_FLOOR: f64 = 0.2;

/// Default lifetime of a learned route
const ROUTE_TTL_SECONDS: u64 = 600;

/// Routing mode for application messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RouterMode {
    #[default]
    Flood,
    Gossip,
    Hybrid,
}

/// A next-hop hint for a destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub destination: PeerId,
    pub next_hop: PeerId,
    /// Hops the originating envelope had traveled when this was learned
    pub cost: u32,
    pub last_updated: u64,
    pub ttl_seconds: u64,
    pub latency_ms: u32,
    pub success_rate: f64,
}

impl Route {
    pub fn new(destination: PeerId, next_hop: PeerId, cost: u32, now_ms: u64) -> Self {
        Self {
            destination,
            next_hop,
            cost,
            last_updated: now_ms,
            ttl_seconds: ROUTE_TTL_SECONDS,
            latency_ms: 0,
            success_rate: 1.0,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.last_updated + self.ttl_seconds * 1000 < now_ms
    }
}

/// Router over the peer registry's connectivity view
pub struct Router {
    mode: RouterMode,
    routes: RwLock<HashMap<PeerId, Route>>,
    registry: Arc<PeerRegistry>,
    /// Per-node salt making the final tie-break stable but unbiased
    tie_seed: u64,
}

impl Router {
    pub fn new(mode: RouterMode, registry: Arc<PeerRegistry>, tie_seed: u64) -> Self {
        Self {
            mode,
            routes: RwLock::new(HashMap::new()),
            registry,
            tie_seed,
        }
    }

    pub fn mode(&self) -> RouterMode {
        self.mode
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Flood fan-out: every connected peer except the inbound one, subject
    /// to blacklist (inside `connected_peers`) and the per-peer relay
    /// budget. Consumed relay tokens are not refunded.
    pub fn flood_targets(&self, exclude: Option<&PeerId>, now_ms: u64) -> Vec<PeerId> {
        self.registry
            .connected_peers(now_ms)
            .into_iter()
            .filter(|peer| Some(peer) != exclude)
            .filter(|peer| {
                self.registry
                    .limiter()
                    .try_consume(peer, RateClass::Relay, now_ms)
            })
            .collect()
    }

    /// Record a route hint learned from a relayed envelope
    pub fn record_route(&self, destination: PeerId, next_hop: PeerId, cost: u32, now_ms: u64) {
        let mut routes = self.routes.write();
        if let Some(existing) = routes.get_mut(&destination) {
            if !existing.is_expired(now_ms) && existing.cost < cost {
                // Keep the shorter path, refresh its lease
                existing.last_updated = now_ms;
                return;
            }
        }

        let prior = routes.get(&destination).cloned();
        let mut route = Route::new(destination, next_hop, cost, now_ms);
        if let Some(prior) = prior {
            route.success_rate = prior.success_rate;
            route.latency_ms = prior.latency_ms;
        }
        routes.insert(destination, route);
    }

    /// Restore a persisted route
    pub fn restore_route(&self, route: Route) {
        self.routes.write().entry(route.destination).or_insert(route);
    }

    /// Track delivery outcomes along a route; consistently failing routes
    /// are forgotten so traffic falls back to flood
    pub fn record_outcome(&self, destination: &PeerId, success: bool, latency_ms: Option<u32>) {
        let mut routes = self.routes.write();
        if let Some(route) = routes.get_mut(destination) {
            let sample = if success { 1.0 } else { 0.0 };
            route.success_rate = route.success_rate * (1.0 - SUCCESS_ALPHA) + sample * SUCCESS_ALPHA;
            if let Some(ms) = latency_ms {
                route.latency_ms = ms;
            }
            if route.success_rate < SUCCESS_FLOOR {
                routes.remove(destination);
            }
        }
    }

    /// Preferred next hop toward a destination
    ///
    /// A live learned route wins; otherwise the best currently connected
    /// neighbor by the tie-break chain.
    pub fn next_hop(&self, destination: &PeerId, now_ms: u64) -> Option<PeerId> {
        let connected = self.registry.connected_peers(now_ms);
        if connected.contains(destination) {
            return Some(*destination);
        }

        {
            let routes = self.routes.read();
            if let Some(route) = routes.get(destination) {
                if !route.is_expired(now_ms) && connected.contains(&route.next_hop) {
                    return Some(route.next_hop);
                }
            }
        }

        self.best_neighbor(&connected)
    }

    /// Tie-break chain: health desc, latency asc, reputation desc, stable
    /// random key
    pub fn best_neighbor(&self, candidates: &[PeerId]) -> Option<PeerId> {
        candidates
            .iter()
            .map(|peer| {
                let (health, latency, reputation) =
                    self.registry.route_metrics(peer).unwrap_or((0, u32::MAX, 0));
                (*peer, health, latency, reputation)
            })
            .max_by(|a, b| {
                a.1.cmp(&b.1) // health: higher wins
                    .then(b.2.cmp(&a.2)) // latency: lower wins
                    .then(a.3.cmp(&b.3)) // reputation: higher wins
                    .then(self.stable_key(&a.0).cmp(&self.stable_key(&b.0)))
            })
            .map(|(peer, ..)| peer)
    }

    /// Drop expired routes; returns how many were removed
    pub fn expire_routes(&self, now_ms: u64) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|_, route| !route.is_expired(now_ms));
        before - routes.len()
    }

    /// Snapshot for persistence flushes
    pub fn snapshot(&self) -> Vec<Route> {
        self.routes.read().values().cloned().collect()
    }

    fn stable_key(&self, peer: &PeerId) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&peer[..8]);
        u64::from_be_bytes(bytes) ^ self.tie_seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::transport::TransportKind;

    fn setup() -> (Arc<PeerRegistry>, Router) {
        let registry = Arc::new(PeerRegistry::new(PeerConfig::default()));
        let router = Router::new(RouterMode::Flood, registry.clone(), 42);
        (registry, router)
    }

    fn connect(registry: &PeerRegistry, peer: PeerId) {
        registry.upsert(peer, TransportKind::Local, 0);
        registry.mark_connected(&peer, 0);
    }

    #[test]
    fn test_flood_excludes_inbound_peer() {
        let (registry, router) = setup();
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        for peer in [a, b, c] {
            connect(&registry, peer);
        }

        let mut targets = router.flood_targets(Some(&a), 0);
        targets.sort();
        assert_eq!(targets, vec![b, c]);
    }

    #[test]
    fn test_flood_respects_blacklist() {
        let (registry, router) = setup();
        let good = [1u8; 32];
        let bad = [2u8; 32];
        connect(&registry, good);
        connect(&registry, bad);
        registry.blacklist(&bad, 60_000, 0);

        assert_eq!(router.flood_targets(None, 0), vec![good]);
    }

    #[test]
    fn test_route_learning_and_expiry() {
        let (registry, router) = setup();
        let dest = [9u8; 32];
        let hop = [1u8; 32];
        connect(&registry, hop);

        router.record_route(dest, hop, 3, 0);
        assert_eq!(router.next_hop(&dest, 0), Some(hop));

        // Expired routes fall back to neighbor selection
        let later = (ROUTE_TTL_SECONDS * 1000) + 1;
        assert_eq!(router.expire_routes(later), 1);
        assert_eq!(router.next_hop(&dest, later), Some(hop)); // hop is the only neighbor
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn test_shorter_route_wins() {
        let (_registry, router) = setup();
        let dest = [9u8; 32];
        router.record_route(dest, [1u8; 32], 5, 0);
        router.record_route(dest, [2u8; 32], 2, 10);
        router.record_route(dest, [3u8; 32], 7, 20); // longer: ignored

        let snapshot = router.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].next_hop, [2u8; 32]);
        assert_eq!(snapshot[0].cost, 2);
    }

    #[test]
    fn test_direct_connection_beats_route() {
        let (registry, router) = setup();
        let dest = [9u8; 32];
        let hop = [1u8; 32];
        connect(&registry, hop);
        connect(&registry, dest);
        router.record_route(dest, hop, 1, 0);

        assert_eq!(router.next_hop(&dest, 0), Some(dest));
    }

    #[test]
    fn test_tie_break_prefers_health() {
        let (registry, router) = setup();
        let healthy = [1u8; 32];
        let lossy = [2u8; 32];
        connect(&registry, healthy);
        connect(&registry, lossy);
        for _ in 0..20 {
            registry.observe_loss(&lossy, true);
        }

        assert_eq!(router.best_neighbor(&[healthy, lossy]), Some(healthy));
        assert_eq!(router.best_neighbor(&[lossy, healthy]), Some(healthy));
    }

    #[test]
    fn test_failing_route_is_forgotten() {
        let (_registry, router) = setup();
        let dest = [9u8; 32];
        router.record_route(dest, [1u8; 32], 1, 0);
        for _ in 0..10 {
            router.record_outcome(&dest, false, None);
        }
        assert_eq!(router.route_count(), 0);
    }
}
