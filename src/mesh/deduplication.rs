//! Envelope deduplication with a bounded seen-set
//!
//! Feynman: this is a bouncer with a short but perfect memory. Every
//! envelope fingerprint that walks in gets remembered; show up twice and
//! you are turned away without a fuss. Old guests are forgotten so the
//! list never outgrows the room.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

struct SeenInner {
    seen: HashMap<[u8; 32], u64>,
    order: VecDeque<([u8; 32], u64)>,
}

/// Bounded fingerprint cache; duplicates are dropped silently
pub struct SeenCache {
    inner: Mutex<SeenInner>,
    capacity: usize,
    window_ms: u64,
}

impl SeenCache {
    pub fn new(capacity: usize, window_ms: u64) -> Self {
        Self {
            inner: Mutex::new(SeenInner {
                seen: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
            window_ms,
        }
    }

    /// Record a fingerprint; returns true if it was fresh, false if it is
    /// a duplicate. At capacity the oldest entry is evicted first.
    pub fn insert(&self, fingerprint: [u8; 32], now_ms: u64) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // Expire entries that fell out of the window
        while let Some(&(hash, inserted)) = inner.order.front() {
            if now_ms.saturating_sub(inserted) > self.window_ms {
                inner.order.pop_front();
                inner.seen.remove(&hash);
            } else {
                break;
            }
        }

        if inner.seen.contains_key(&fingerprint) {
            return false;
        }

        inner.seen.insert(fingerprint, now_ms);
        inner.order.push_back((fingerprint, now_ms));

        if inner.order.len() > self.capacity {
            if let Some((oldest, _)) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }

        true
    }

    /// Whether a fingerprint is currently tracked, without recording it
    pub fn contains(&self, fingerprint: &[u8; 32], now_ms: u64) -> bool {
        let inner = self.inner.lock();
        match inner.seen.get(fingerprint) {
            Some(&inserted) => now_ms.saturating_sub(inserted) <= self.window_ms,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fingerprints currently in the window, newest last; used for gossip
    /// pull digests
    pub fn recent(&self, limit: usize) -> Vec<[u8; 32]> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .rev()
            .take(limit)
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.seen.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u8) -> [u8; 32] {
        [n; 32]
    }

    #[test]
    fn test_duplicate_detected() {
        let cache = SeenCache::new(100, 60_000);
        assert!(cache.insert(fp(1), 0));
        assert!(!cache.insert(fp(1), 10));
        assert!(cache.insert(fp(2), 10));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = SeenCache::new(3, u64::MAX / 2);
        assert!(cache.insert(fp(1), 0));
        assert!(cache.insert(fp(2), 1));
        assert!(cache.insert(fp(3), 2));
        assert!(cache.insert(fp(4), 3)); // evicts fp(1)

        assert_eq!(cache.len(), 3);
        assert!(cache.insert(fp(1), 4)); // fresh again after eviction
        assert!(!cache.insert(fp(3), 5));
    }

    #[test]
    fn test_window_expiry() {
        let cache = SeenCache::new(100, 60_000);
        assert!(cache.insert(fp(1), 0));
        assert!(cache.contains(&fp(1), 60_000));
        assert!(!cache.contains(&fp(1), 60_001));
        // After the window the same fingerprint is fresh again
        assert!(cache.insert(fp(1), 61_000));
    }

    #[test]
    fn test_recent_digest_order() {
        let cache = SeenCache::new(100, 60_000);
        for i in 1..=5 {
            cache.insert(fp(i), i as u64);
        }
        let recent = cache.recent(3);
        assert_eq!(recent, vec![fp(5), fp(4), fp(3)]);
    }
}
