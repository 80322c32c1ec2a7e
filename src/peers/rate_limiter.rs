//! Per-peer, per-class token-bucket rate limiting
//!
//! Buckets refill continuously from a millisecond clock supplied by the
//! caller, which keeps tests deterministic. `try_consume` has no side
//! effects on exhaustion; callers drop or reject and move on. Consumed
//! tokens are never refunded, including for operations that are later
//! cancelled.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::PeerConfig;
use crate::protocol::PeerId;

/// Rate-limited event classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateClass {
    /// Inbound messages from the peer
    Inbound,
    /// Outbound relays toward the peer
    Relay,
    /// Connection attempts from the peer
    Connect,
}

/// Token bucket with fractional refill
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn new(per_minute: u32, now_ms: u64) -> Self {
        let capacity = per_minute as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: capacity / 60_000.0,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        if now_ms > self.last_refill_ms {
            let elapsed = (now_ms - self.last_refill_ms) as f64;
            self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
            self.last_refill_ms = now_ms;
        }
    }

    fn try_consume(&mut self, now_ms: u64) -> bool {
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiter over all peers and event classes
pub struct RateLimiter {
    buckets: Mutex<HashMap<(PeerId, RateClass), TokenBucket>>,
    inbound_per_minute: u32,
    relay_per_minute: u32,
    connect_per_minute: u32,
    /// Buckets idle longer than this are dropped on cleanup
    idle_ttl_ms: u64,
}

impl RateLimiter {
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            inbound_per_minute: config.inbound_per_minute,
            relay_per_minute: config.relay_per_minute,
            connect_per_minute: config.connect_per_minute,
            idle_ttl_ms: 10 * 60 * 1000,
        }
    }

    fn per_minute(&self, class: RateClass) -> u32 {
        match class {
            RateClass::Inbound => self.inbound_per_minute,
            RateClass::Relay => self.relay_per_minute,
            RateClass::Connect => self.connect_per_minute,
        }
    }

    /// Consume one token for (peer, class); false means exhausted
    pub fn try_consume(&self, peer: &PeerId, class: RateClass, now_ms: u64) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((*peer, class))
            .or_insert_with(|| TokenBucket::new(self.per_minute(class), now_ms));
        bucket.try_consume(now_ms)
    }

    /// Drop buckets that have been idle past their TTL
    pub fn cleanup(&self, now_ms: u64) {
        let ttl = self.idle_ttl_ms;
        self.buckets
            .lock()
            .retain(|_, bucket| now_ms.saturating_sub(bucket.last_refill_ms) < ttl);
    }

    /// Forget all buckets for a peer (on disconnect or blacklist expiry)
    pub fn forget(&self, peer: &PeerId) {
        self.buckets.lock().retain(|(id, _), _| id != peer);
    }
}
