//! Push-pull epidemic dissemination
//!
//! Every round the engine samples `fanout` random connected peers. For each
//! sampled peer it either pushes envelopes that peer has not been offered
//! yet (probability `push_ratio`), or sends a digest of locally seen
//! fingerprints so the peer can push back what this node lacks. Entries age
//! out of the push set after `max_message_age`.
//!
//! Digests travel as PEER_DISCOVERY payloads with a leading tag byte; plain
//! discovery announcements use tag 0x00 and stay untouched.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::config::GossipConfig;
use crate::protocol::{Envelope, PeerId};

/// PEER_DISCOVERY payload tag: plain announcement
pub const GOSSIP_ANNOUNCE_TAG: u8 = 0x00;

/// PEER_DISCOVERY payload tag: pull digest of seen fingerprints
pub const GOSSIP_DIGEST_TAG: u8 = 0x01;

struct PushEntry {
    envelope: Envelope,
    inserted_at: u64,
    offered_to: HashSet<PeerId>,
}

/// What one gossip round wants sent
#[derive(Debug, Default)]
pub struct GossipRound {
    /// Envelopes to push, per sampled peer
    pub pushes: Vec<(PeerId, Vec<Envelope>)>,
    /// Peers to send a pull digest to
    pub digest_requests: Vec<PeerId>,
}

/// The gossip push set and round planner
pub struct GossipEngine {
    entries: Mutex<HashMap<[u8; 32], PushEntry>>,
    rng: Mutex<fastrand::Rng>,
    config: GossipConfig,
}

impl GossipEngine {
    pub fn new(config: GossipConfig, seed: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an envelope to the push set
    pub fn offer(&self, envelope: Envelope, now_ms: u64) {
        let fingerprint = envelope.fingerprint();
        self.entries
            .lock()
            .entry(fingerprint)
            .or_insert_with(|| PushEntry {
                envelope,
                inserted_at: now_ms,
                offered_to: HashSet::new(),
            });
    }

    /// Plan one round over the currently connected peers
    pub fn plan_round(&self, connected: &[PeerId], now_ms: u64) -> GossipRound {
        self.age_out(now_ms);

        let mut round = GossipRound::default();
        if connected.is_empty() {
            return round;
        }

        let mut sample: Vec<PeerId> = connected.to_vec();
        let mut rng = self.rng.lock();
        rng.shuffle(&mut sample);
        sample.truncate(self.config.fanout);

        let mut entries = self.entries.lock();
        for peer in sample {
            if rng.f64() < self.config.push_ratio {
                let mut batch = Vec::new();
                for entry in entries.values_mut() {
                    if entry.offered_to.insert(peer) {
                        batch.push(entry.envelope.clone());
                    }
                }
                if !batch.is_empty() {
                    round.pushes.push((peer, batch));
                }
            } else {
                round.digest_requests.push(peer);
            }
        }

        round
    }

    /// Answer a peer's pull digest with the envelopes it lacks
    pub fn handle_digest(&self, from: &PeerId, their_seen: &[[u8; 32]], now_ms: u64) -> Vec<Envelope> {
        self.age_out(now_ms);
        let theirs: HashSet<&[u8; 32]> = their_seen.iter().collect();
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .filter(|(fingerprint, _)| !theirs.contains(fingerprint))
            .map(|(_, entry)| {
                entry.offered_to.insert(*from);
                entry.envelope.clone()
            })
            .collect()
    }

    /// Drop entries older than the configured message age
    pub fn age_out(&self, now_ms: u64) {
        let max_age = self.config.max_message_age.as_millis() as u64;
        self.entries
            .lock()
            .retain(|_, entry| now_ms.saturating_sub(entry.inserted_at) <= max_age);
    }
}

/// Encode a pull digest as a PEER_DISCOVERY payload
pub fn encode_digest(fingerprints: &[[u8; 32]]) -> Vec<u8> {
    let count = fingerprints.len().min(u16::MAX as usize);
    let mut payload = Vec::with_capacity(3 + count * 32);
    payload.push(GOSSIP_DIGEST_TAG);
    payload.extend_from_slice(&(count as u16).to_be_bytes());
    for fingerprint in &fingerprints[..count] {
        payload.extend_from_slice(fingerprint);
    }
    payload
}

/// Decode a PEER_DISCOVERY payload as a pull digest, if it is one
pub fn decode_digest(payload: &[u8]) -> Option<Vec<[u8; 32]>> {
    if payload.len() < 3 || payload[0] != GOSSIP_DIGEST_TAG {
        return None;
    }
    let count = u16::from_be_bytes([payload[1], payload[2]]) as usize;
    if payload.len() != 3 + count * 32 {
        return None;
    }
    let mut fingerprints = Vec::with_capacity(count);
    for chunk in payload[3..].chunks_exact(32) {
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(chunk);
        fingerprints.push(fingerprint);
    }
    Some(fingerprints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ScKeypair;
    use crate::protocol::MessageKind;

    fn envelope(tag: u8) -> Envelope {
        let keypair = ScKeypair::generate().unwrap();
        Envelope::new_signed(&keypair, MessageKind::Text, 5, 0, {
            let mut payload = vec![0u8; 32];
            payload.push(tag);
            payload
        })
    }

    fn engine() -> GossipEngine {
        GossipEngine::new(GossipConfig::default(), 7)
    }

    #[test]
    fn test_round_samples_fanout_peers() {
        let engine = engine();
        engine.offer(envelope(1), 0);

        let peers: Vec<PeerId> = (0..10u8).map(|i| [i; 32]).collect();
        let round = engine.plan_round(&peers, 0);
        let touched = round.pushes.len() + round.digest_requests.len();
        assert!(touched <= GossipConfig::default().fanout);
        assert!(touched > 0);
    }

    #[test]
    fn test_push_only_once_per_peer() {
        let engine = engine();
        engine.offer(envelope(1), 0);
        let peers = vec![[1u8; 32]];

        // Run enough rounds that the single peer certainly gets a push
        let mut pushed = 0;
        for _ in 0..50 {
            let round = engine.plan_round(&peers, 0);
            pushed += round.pushes.iter().map(|(_, batch)| batch.len()).sum::<usize>();
        }
        assert_eq!(pushed, 1);
    }

    #[test]
    fn test_age_out() {
        let engine = engine();
        engine.offer(envelope(1), 0);
        assert_eq!(engine.len(), 1);

        engine.age_out(60_001);
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_digest_roundtrip() {
        let fingerprints = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
        let payload = encode_digest(&fingerprints);
        assert_eq!(decode_digest(&payload), Some(fingerprints));

        // Announcements are not digests
        assert_eq!(decode_digest(&[GOSSIP_ANNOUNCE_TAG, 0, 0]), None);
        // Truncated digest is rejected
        assert_eq!(decode_digest(&payload[..payload.len() - 1]), None);
    }

    #[test]
    fn test_handle_digest_returns_missing_only() {
        let engine = engine();
        let known = envelope(1);
        let fresh = envelope(2);
        engine.offer(known.clone(), 0);
        engine.offer(fresh.clone(), 0);

        let peer = [9u8; 32];
        let response = engine.handle_digest(&peer, &[known.fingerprint()], 0);
        assert_eq!(response.len(), 1);
        assert_eq!(response[0].fingerprint(), fresh.fingerprint());

        // The answered envelope now counts as offered to that peer
        let again = engine.handle_digest(&peer, &[known.fingerprint()], 0);
        assert_eq!(again.len(), 1); // digest-based answers are idempotent by content
    }
}
