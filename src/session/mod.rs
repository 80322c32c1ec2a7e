//! Session management for the SC mesh
//!
//! One [`SessionContext`] exists per ordered peer pair, holding the
//! directional XChaCha20-Poly1305 keys derived from the static ECDH shared
//! secret. Sessions are established lazily: on the first outbound message
//! to a peer, or on the first inbound KEY_EXCHANGE.
//!
//! Rekey policy: a rekey MUST happen before the per-key message counter
//! reaches its limit (default 1000) or the key exceeds its age limit
//! (default 24 h), and on explicit request. Each epoch derives fresh keys
//! via HKDF over the shared secret with the epoch counter as salt; old keys
//! are zeroized as they are replaced.
//!
//! Nonce discipline: senders run a monotonic 64-bit counter packed into the
//! 24-byte nonce behind a per-direction tag; receivers run a 1024-wide
//! sliding anti-replay window. An authenticated message with a counter at or
//! below the window is a fatal session error.

use dashmap::DashMap;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::config::SessionConfig;
use crate::crypto::ecdh::{self, REKEY_INFO, SESSION_KEY_INFO};
use crate::crypto::encryption::{
    self, aead_decrypt, aead_encrypt, DIR_INITIATOR, DIR_RESPONDER, NONCE_LEN,
};
use crate::crypto::ScKeypair;
use crate::error::{Error, Result};
use crate::protocol::{short_peer_id, PeerId};

/// Width of the receive anti-replay window in nonces
const WINDOW_BITS: u64 = 1024;
const WINDOW_WORDS: usize = (WINDOW_BITS / 64) as usize;

/// Sliding-window anti-replay filter over nonce counters
#[derive(Debug, Clone)]
struct NonceWindow {
    /// Highest counter accepted so far; 0 means nothing accepted yet
    highest: u64,
    bitmap: [u64; WINDOW_WORDS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceStatus {
    Fresh,
    Replayed,
    BelowWindow,
}

impl NonceWindow {
    fn new() -> Self {
        Self {
            highest: 0,
            bitmap: [0; WINDOW_WORDS],
        }
    }

    fn bit(counter: u64) -> (usize, u64) {
        let idx = (counter % WINDOW_BITS) as usize;
        (idx / 64, 1u64 << (idx % 64))
    }

    /// Classify a counter without mutating the window
    fn check(&self, counter: u64) -> NonceStatus {
        if counter == 0 {
            // Senders start at 1; zero can only be a replayed initial state
            return NonceStatus::BelowWindow;
        }
        if counter > self.highest {
            return NonceStatus::Fresh;
        }
        if self.highest - counter >= WINDOW_BITS {
            return NonceStatus::BelowWindow;
        }
        let (word, mask) = Self::bit(counter);
        if self.bitmap[word] & mask != 0 {
            NonceStatus::Replayed
        } else {
            NonceStatus::Fresh
        }
    }

    /// Record an accepted counter; callers commit only after the MAC check
    fn commit(&mut self, counter: u64) {
        if counter > self.highest {
            let advance = counter - self.highest;
            if advance >= WINDOW_BITS {
                self.bitmap = [0; WINDOW_WORDS];
            } else {
                for c in (self.highest + 1)..=counter {
                    let (word, mask) = Self::bit(c);
                    self.bitmap[word] &= !mask;
                }
            }
            self.highest = counter;
        }
        let (word, mask) = Self::bit(counter);
        self.bitmap[word] |= mask;
    }
}

/// Per-peer session state: directional keys, counters, replay window
pub struct SessionContext {
    pub peer: PeerId,
    send_key: Zeroizing<[u8; 32]>,
    recv_key: Zeroizing<[u8; 32]>,
    send_direction: u8,
    recv_direction: u8,
    send_nonce_counter: u64,
    recv_window: NonceWindow,
    /// Messages protected under the current epoch, both directions
    pub msg_count_since_rekey: u64,
    /// Key epoch; 0 is the initial derivation
    pub epoch: u64,
    pub established_at: u64,
    pub expires_at: u64,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("peer", &short_peer_id(&self.peer))
            .field("epoch", &self.epoch)
            .field("msg_count_since_rekey", &self.msg_count_since_rekey)
            .finish_non_exhaustive()
    }
}

/// Derive both directional keys for an epoch
///
/// The lexicographically smaller public key takes the first half of the HKDF
/// output as its send key and the initiator direction tag, so both sides
/// agree without negotiation and send/recv keys are never equal.
fn derive_keys(
    shared: &[u8; 32],
    epoch: u64,
    local_pub: &PeerId,
    remote_pub: &PeerId,
) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>, u8, u8)> {
    let info = if epoch == 0 { SESSION_KEY_INFO } else { REKEY_INFO };
    let okm = ecdh::hkdf_sha256(shared, &epoch.to_be_bytes(), info, 64)?;

    let mut first = Zeroizing::new([0u8; 32]);
    let mut second = Zeroizing::new([0u8; 32]);
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);

    if local_pub < remote_pub {
        Ok((first, second, DIR_INITIATOR, DIR_RESPONDER))
    } else {
        Ok((second, first, DIR_RESPONDER, DIR_INITIATOR))
    }
}

impl SessionContext {
    fn new(
        shared: &[u8; 32],
        local_pub: &PeerId,
        remote_pub: &PeerId,
        epoch: u64,
        now_ms: u64,
        config: &SessionConfig,
    ) -> Result<Self> {
        let (send_key, recv_key, send_direction, recv_direction) =
            derive_keys(shared, epoch, local_pub, remote_pub)?;
        Ok(Self {
            peer: *remote_pub,
            send_key,
            recv_key,
            send_direction,
            recv_direction,
            send_nonce_counter: 0,
            recv_window: NonceWindow::new(),
            msg_count_since_rekey: 0,
            epoch,
            established_at: now_ms,
            expires_at: now_ms + config.rekey_after.as_millis() as u64,
        })
    }

    /// Whether the rekey policy requires fresh keys before the next message
    pub fn needs_rekey(&self, now_ms: u64, config: &SessionConfig) -> bool {
        self.msg_count_since_rekey >= config.rekey_after_messages || now_ms >= self.expires_at
    }

    /// Advance to the next key epoch; previous keys are scrubbed as they
    /// are overwritten
    pub fn rekey(
        &mut self,
        shared: &[u8; 32],
        local_pub: &PeerId,
        now_ms: u64,
        config: &SessionConfig,
    ) -> Result<()> {
        self.rekey_to_epoch(shared, local_pub, self.epoch + 1, now_ms, config)
    }

    /// Jump directly to a later epoch, used to resync with a peer that
    /// resumed a persisted session state
    pub fn rekey_to_epoch(
        &mut self,
        shared: &[u8; 32],
        local_pub: &PeerId,
        next_epoch: u64,
        now_ms: u64,
        config: &SessionConfig,
    ) -> Result<()> {
        let (send_key, recv_key, send_direction, recv_direction) =
            derive_keys(shared, next_epoch, local_pub, &self.peer)?;
        self.send_key = send_key;
        self.recv_key = recv_key;
        self.send_direction = send_direction;
        self.recv_direction = recv_direction;
        self.epoch = next_epoch;
        self.send_nonce_counter = 0;
        self.recv_window = NonceWindow::new();
        self.msg_count_since_rekey = 0;
        self.established_at = now_ms;
        self.expires_at = now_ms + config.rekey_after.as_millis() as u64;
        Ok(())
    }

    /// Encrypt a payload body; output is nonce || ciphertext
    pub fn encrypt(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.send_nonce_counter += 1;
        let nonce = encryption::build_nonce(self.send_direction, self.send_nonce_counter);
        let ciphertext = aead_encrypt(&self.send_key, &nonce, plaintext, aad)?;
        self.msg_count_since_rekey += 1;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a nonce || ciphertext body
    ///
    /// The window commit happens only after the MAC verifies, so forged
    /// counters cannot poison the replay state. An authenticated message
    /// with a stale counter is genuine nonce reuse and surfaces as the
    /// fatal [`Error::NonceReuse`].
    pub fn decrypt(&mut self, aad: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::MacFailure);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[..NONCE_LEN]);
        if nonce[0] != self.recv_direction {
            return Err(Error::MacFailure);
        }

        let counter = encryption::nonce_counter(&nonce);
        let status = self.recv_window.check(counter);

        let plaintext = aead_decrypt(&self.recv_key, &nonce, &data[NONCE_LEN..], aad)?;

        if status != NonceStatus::Fresh {
            return Err(Error::NonceReuse(short_peer_id(&self.peer)));
        }

        self.recv_window.commit(counter);
        self.msg_count_since_rekey += 1;
        Ok(plaintext)
    }
}

/// All active sessions, sharded by peer id
///
/// Each entry sits behind its own mutex so key rotation for one peer is
/// serialized with encryption under that key, while unrelated peers proceed
/// concurrently.
pub struct SessionManager {
    local: ScKeypair,
    local_pub: PeerId,
    sessions: DashMap<PeerId, Mutex<SessionContext>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(local: ScKeypair, config: SessionConfig) -> Self {
        let local_pub = local.public_key_bytes();
        Self {
            local,
            local_pub,
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Establish a session with a peer if none exists; idempotent
    pub fn establish(&self, remote: &PeerId, now_ms: u64) -> Result<()> {
        self.establish_at_epoch(remote, 0, now_ms)
    }

    /// Establish at a specific key epoch, resuming where a previous run of
    /// this node (or a torn-down session) left off so epochs stay monotonic
    pub fn establish_at_epoch(&self, remote: &PeerId, epoch: u64, now_ms: u64) -> Result<()> {
        if self.sessions.contains_key(remote) {
            return Ok(());
        }
        let shared = self.local.shared_secret(remote)?;
        let context =
            SessionContext::new(&shared, &self.local_pub, remote, epoch, now_ms, &self.config)?;
        self.sessions.insert(*remote, Mutex::new(context));
        tracing::debug!(peer = %short_peer_id(remote), epoch, "session established");
        Ok(())
    }

    /// Tear a session down, dropping (and thereby scrubbing) its keys
    pub fn remove(&self, remote: &PeerId) {
        self.sessions.remove(remote);
    }

    /// Encrypt for a peer, rekeying first if policy requires it
    pub fn encrypt_for(&self, remote: &PeerId, aad: &[u8], plaintext: &[u8], now_ms: u64) -> Result<Vec<u8>> {
        let entry = self
            .sessions
            .get(remote)
            .ok_or_else(|| Error::NoSession(short_peer_id(remote)))?;
        let mut session = entry.lock();
        if session.needs_rekey(now_ms, &self.config) {
            let shared = self.local.shared_secret(remote)?;
            session.rekey(&shared, &self.local_pub, now_ms, &self.config)?;
            tracing::debug!(peer = %short_peer_id(remote), epoch = session.epoch, "session rekeyed");
        }
        session.encrypt(aad, plaintext)
    }

    /// Decrypt from a peer
    pub fn decrypt_from(&self, remote: &PeerId, aad: &[u8], data: &[u8], now_ms: u64) -> Result<Vec<u8>> {
        let entry = self
            .sessions
            .get(remote)
            .ok_or_else(|| Error::NoSession(short_peer_id(remote)))?;
        let mut session = entry.lock();
        if session.needs_rekey(now_ms, &self.config) {
            let shared = self.local.shared_secret(remote)?;
            session.rekey(&shared, &self.local_pub, now_ms, &self.config)?;
        }
        session.decrypt(aad, data)
    }

    /// Explicit rekey, used on user request and after security events
    pub fn rekey_now(&self, remote: &PeerId, now_ms: u64) -> Result<()> {
        let entry = self
            .sessions
            .get(remote)
            .ok_or_else(|| Error::NoSession(short_peer_id(remote)))?;
        let shared = self.local.shared_secret(remote)?;
        let mut session = entry.lock();
        session.rekey(&shared, &self.local_pub, now_ms, &self.config)
    }

    /// Make sure a session exists and sits at or above the given epoch,
    /// jumping forward if the peer is ahead of us
    pub fn ensure_min_epoch(&self, remote: &PeerId, epoch: u64, now_ms: u64) -> Result<()> {
        self.establish_at_epoch(remote, epoch, now_ms)?;
        let entry = self
            .sessions
            .get(remote)
            .ok_or_else(|| Error::NoSession(short_peer_id(remote)))?;
        let mut session = entry.lock();
        if session.epoch < epoch {
            let shared = self.local.shared_secret(remote)?;
            session.rekey_to_epoch(&shared, &self.local_pub, epoch, now_ms, &self.config)?;
        }
        Ok(())
    }

    /// Current key epoch for a peer, if a session exists
    pub fn epoch(&self, remote: &PeerId) -> Option<u64> {
        self.sessions.get(remote).map(|entry| entry.lock().epoch)
    }

    /// Drop sessions whose keys expired past the rekey deadline without
    /// traffic; returns the peers torn down
    pub fn sweep_expired(&self, now_ms: u64) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value().lock();
                now_ms >= session.expires_at && session.msg_count_since_rekey == 0
            })
            .map(|entry| *entry.key())
            .collect();
        for peer in &expired {
            self.sessions.remove(peer);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SessionManager, SessionManager, PeerId, PeerId) {
        let a = ScKeypair::generate().unwrap();
        let b = ScKeypair::generate().unwrap();
        let a_pub = a.public_key_bytes();
        let b_pub = b.public_key_bytes();
        (
            SessionManager::new(a, SessionConfig::default()),
            SessionManager::new(b, SessionConfig::default()),
            a_pub,
            b_pub,
        )
    }

    #[test]
    fn test_two_party_encrypt_decrypt() {
        let (alice, bob, a_pub, b_pub) = pair();
        alice.establish(&b_pub, 0).unwrap();
        bob.establish(&a_pub, 0).unwrap();

        let sealed = alice.encrypt_for(&b_pub, b"aad", b"hello", 0).unwrap();
        let opened = bob.decrypt_from(&a_pub, b"aad", &sealed, 0).unwrap();
        assert_eq!(opened, b"hello");

        // And the reverse direction under the other key
        let sealed = bob.encrypt_for(&a_pub, b"aad", b"echo", 0).unwrap();
        let opened = alice.decrypt_from(&b_pub, b"aad", &sealed, 0).unwrap();
        assert_eq!(opened, b"echo");
    }

    #[test]
    fn test_directional_keys_differ() {
        let a = ScKeypair::generate().unwrap();
        let b = ScKeypair::generate().unwrap();
        let shared = a.shared_secret(&b.public_key_bytes()).unwrap();

        let (send, recv, send_dir, recv_dir) = derive_keys(
            &shared,
            0,
            &a.public_key_bytes(),
            &b.public_key_bytes(),
        )
        .unwrap();
        assert_ne!(*send, *recv);
        assert_ne!(send_dir, recv_dir);
    }

    #[test]
    fn test_replay_is_fatal() {
        let (alice, bob, a_pub, b_pub) = pair();
        alice.establish(&b_pub, 0).unwrap();
        bob.establish(&a_pub, 0).unwrap();

        let sealed = alice.encrypt_for(&b_pub, b"", b"once", 0).unwrap();
        assert!(bob.decrypt_from(&a_pub, b"", &sealed, 0).is_ok());
        assert!(matches!(
            bob.decrypt_from(&a_pub, b"", &sealed, 0),
            Err(Error::NonceReuse(_))
        ));
    }

    #[test]
    fn test_out_of_order_within_window_accepted() {
        let (alice, bob, a_pub, b_pub) = pair();
        alice.establish(&b_pub, 0).unwrap();
        bob.establish(&a_pub, 0).unwrap();

        let first = alice.encrypt_for(&b_pub, b"", b"one", 0).unwrap();
        let second = alice.encrypt_for(&b_pub, b"", b"two", 0).unwrap();

        assert_eq!(bob.decrypt_from(&a_pub, b"", &second, 0).unwrap(), b"two");
        assert_eq!(bob.decrypt_from(&a_pub, b"", &first, 0).unwrap(), b"one");
    }

    #[test]
    fn test_rekey_at_message_limit() {
        let config = SessionConfig {
            rekey_after_messages: 3,
            ..Default::default()
        };
        let a = ScKeypair::generate().unwrap();
        let b = ScKeypair::generate().unwrap();
        let a_pub = a.public_key_bytes();
        let b_pub = b.public_key_bytes();
        let alice = SessionManager::new(a, config.clone());
        let bob = SessionManager::new(b, config);

        alice.establish(&b_pub, 0).unwrap();
        bob.establish(&a_pub, 0).unwrap();

        for i in 0..3 {
            let sealed = alice.encrypt_for(&b_pub, b"", b"m", 0).unwrap();
            bob.decrypt_from(&a_pub, b"", &sealed, 0).unwrap();
            assert_eq!(alice.epoch(&b_pub), Some(0), "message {} still epoch 0", i);
        }

        // The fourth message crosses the limit: both sides advance in step
        let sealed = alice.encrypt_for(&b_pub, b"", b"m", 0).unwrap();
        assert_eq!(alice.epoch(&b_pub), Some(1));
        bob.decrypt_from(&a_pub, b"", &sealed, 0).unwrap();
        assert_eq!(bob.epoch(&a_pub), Some(1));
    }

    #[test]
    fn test_old_epoch_ciphertext_fails_after_rekey() {
        let (alice, bob, a_pub, b_pub) = pair();
        alice.establish(&b_pub, 0).unwrap();
        bob.establish(&a_pub, 0).unwrap();

        let stale = alice.encrypt_for(&b_pub, b"", b"stale", 0).unwrap();
        bob.rekey_now(&a_pub, 0).unwrap();
        assert!(matches!(
            bob.decrypt_from(&a_pub, b"", &stale, 0),
            Err(Error::MacFailure)
        ));
    }

    #[test]
    fn test_rekey_on_age() {
        let (alice, bob, _a_pub, b_pub) = pair();
        let _ = bob;
        alice.establish(&b_pub, 0).unwrap();

        let day_ms = 24 * 60 * 60 * 1000;
        let _ = alice.encrypt_for(&b_pub, b"", b"fresh", day_ms + 1).unwrap();
        assert_eq!(alice.epoch(&b_pub), Some(1));
    }

    #[test]
    fn test_no_session_error() {
        let (alice, _, _, b_pub) = pair();
        assert!(matches!(
            alice.encrypt_for(&b_pub, b"", b"x", 0),
            Err(Error::NoSession(_))
        ));
    }

    #[test]
    fn test_ensure_min_epoch_resyncs() {
        let (alice, bob, a_pub, b_pub) = pair();
        alice.establish_at_epoch(&b_pub, 5, 0).unwrap();

        // Bob starts cold, learns Alice is at epoch 5, and jumps forward
        bob.ensure_min_epoch(&a_pub, 5, 0).unwrap();
        assert_eq!(bob.epoch(&a_pub), Some(5));

        let sealed = alice.encrypt_for(&b_pub, b"", b"resynced", 0).unwrap();
        assert_eq!(bob.decrypt_from(&a_pub, b"", &sealed, 0).unwrap(), b"resynced");

        // Never moves backwards
        bob.ensure_min_epoch(&a_pub, 2, 0).unwrap();
        assert_eq!(bob.epoch(&a_pub), Some(5));
    }

    #[test]
    fn test_nonce_window_classification() {
        let mut window = NonceWindow::new();
        assert_eq!(window.check(1), NonceStatus::Fresh);
        window.commit(1);
        assert_eq!(window.check(1), NonceStatus::Replayed);
        assert_eq!(window.check(0), NonceStatus::BelowWindow);

        window.commit(2000);
        assert_eq!(window.check(2000), NonceStatus::Replayed);
        assert_eq!(window.check(1), NonceStatus::BelowWindow);
        assert_eq!(window.check(2000 - 1023), NonceStatus::Fresh);
        assert_eq!(window.check(2000 - 1024), NonceStatus::BelowWindow);
    }
}
