//! Configuration for the SC mesh core
//!
//! One typed config struct per subsystem, aggregated in [`NodeConfig`].
//! Every knob has a default matching the protocol constants; deployment
//! overrides come from the environment via [`NodeConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mesh::router::RouterMode;

/// Wire protocol limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum accepted TTL on ingress (wire ceiling is 10)
    pub max_ttl: u8,
    /// Maximum payload size in bytes
    pub max_payload: usize,
    /// Maximum accepted past clock skew on ingress
    pub max_past_skew: Duration,
    /// Maximum accepted future clock skew on ingress (tighter than past
    /// skew so drifted clocks cannot mint not-yet-valid envelopes)
    pub max_future_skew: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_ttl: 10,
            max_payload: 64 * 1024,
            max_past_skew: Duration::from_secs(300),
            max_future_skew: Duration::from_secs(120),
        }
    }
}

/// Dedup seen-set bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Maximum tracked fingerprints; oldest evicted first
    pub capacity: usize,
    /// Entries older than this are expired
    pub window: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            window: Duration::from_secs(60),
        }
    }
}

/// Outbound priority queue bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Hard cap on queued messages
    pub max_messages: usize,
    /// Hard cap on queued bytes
    pub max_bytes: usize,
    /// Above this fill level the two lowest priorities are rejected
    pub high_watermark: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_messages: 10_000,
            max_bytes: 32 * 1024 * 1024,
            high_watermark: 8_000,
        }
    }
}

/// Session key lifetime policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Rekey before this many messages under one key
    pub rekey_after_messages: u64,
    /// Rekey before a key reaches this age
    pub rekey_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rekey_after_messages: 1000,
            rekey_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Peer registry, reputation, and rate-limit policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Reputation below this triggers auto-blacklisting
    pub blacklist_threshold: i32,
    /// First auto-blacklist duration; doubles per subsequent trigger
    pub blacklist_base: Duration,
    /// Cap on the doubling blacklist duration
    pub blacklist_cap: Duration,
    /// Window for the health-score EWMA inputs
    pub health_window: Duration,
    /// Peers not seen within this window are not "active"
    pub active_cutoff: Duration,
    /// Inbound messages per minute per peer
    pub inbound_per_minute: u32,
    /// Outbound relays per minute per peer
    pub relay_per_minute: u32,
    /// Connection attempts per minute per peer
    pub connect_per_minute: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            blacklist_threshold: 20,
            blacklist_base: Duration::from_secs(60 * 60),
            blacklist_cap: Duration::from_secs(24 * 60 * 60),
            health_window: Duration::from_secs(300),
            active_cutoff: Duration::from_secs(300),
            inbound_per_minute: 100,
            relay_per_minute: 200,
            connect_per_minute: 10,
        }
    }
}

/// Gossip round policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Interval between gossip rounds
    pub interval: Duration,
    /// Peers sampled per round
    pub fanout: usize,
    /// Probability of pushing vs. pulling for a sampled peer
    pub push_ratio: f64,
    /// Entries older than this age out of the push set
    pub max_message_age: Duration,
    /// Deadline for one gossip round
    pub round_deadline: Duration,
    /// Maximum fingerprints carried in one pull digest
    pub digest_limit: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            fanout: 4,
            push_ratio: 0.7,
            max_message_age: Duration::from_secs(60),
            round_deadline: Duration::from_secs(2),
            digest_limit: 256,
        }
    }
}

/// Relay engine and store-and-forward policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// TTL stamped on locally originated envelopes
    pub default_ttl: u8,
    /// Store-and-forward scheduler tick
    pub retry_tick: Duration,
    /// Base retry backoff per destination
    pub backoff_base: Duration,
    /// Backoff ceiling per destination
    pub backoff_cap: Duration,
    /// Queued messages older than this are dropped
    pub max_queue_age: Duration,
    /// Queued messages retried more than this are dropped
    pub max_attempts: u32,
    /// Deadline for a single frame send
    pub send_deadline: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_ttl: 10,
            retry_tick: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(15 * 60),
            max_queue_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_attempts: 10,
            send_deadline: Duration::from_secs(5),
        }
    }
}

/// Kademlia-style lookup policy (peer location only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Nodes per k-bucket
    pub k: usize,
    /// Lookup parallelism
    pub alpha: usize,
    /// Deadline for one lookup iteration
    pub iteration_deadline: Duration,
    /// Deadline for a full bootstrap
    pub bootstrap_deadline: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            iteration_deadline: Duration::from_secs(30),
            bootstrap_deadline: Duration::from_secs(60),
        }
    }
}

/// Aggregated node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub protocol: ProtocolConfig,
    pub dedup: DedupConfig,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub peers: PeerConfig,
    pub gossip: GossipConfig,
    pub relay: RelayConfig,
    pub dht: DhtConfig,
    /// Routing mode for application messages
    pub router_mode: RouterMode,
}

impl NodeConfig {
    /// Create configuration from environment variables
    ///
    /// Only deployment-level knobs are overridable; protocol constants
    /// (header sizes, TTL ceiling) are not.
    pub fn from_env() -> Self {
        use std::env;

        let mut config = Self::default();

        if let Ok(mode) = env::var("SCMESH_ROUTER_MODE") {
            match mode.to_lowercase().as_str() {
                "flood" => config.router_mode = RouterMode::Flood,
                "gossip" => config.router_mode = RouterMode::Gossip,
                "hybrid" => config.router_mode = RouterMode::Hybrid,
                _ => {}
            }
        }

        if let Ok(fanout) = env::var("SCMESH_GOSSIP_FANOUT") {
            if let Ok(fanout) = fanout.parse() {
                config.gossip.fanout = fanout;
            }
        }

        if let Ok(interval_ms) = env::var("SCMESH_GOSSIP_INTERVAL_MS") {
            if let Ok(ms) = interval_ms.parse() {
                config.gossip.interval = Duration::from_millis(ms);
            }
        }

        if let Ok(ttl) = env::var("SCMESH_DEFAULT_TTL") {
            if let Ok(ttl) = ttl.parse::<u8>() {
                config.relay.default_ttl = ttl.min(config.protocol.max_ttl);
            }
        }

        config
    }
}
