//! Long-term identity for the SC mesh
//!
//! An identity is one Ed25519 keypair. The public key doubles as the
//! routing-level [`PeerId`]; the display forms (short id, grouped
//! fingerprint) are derived from its SHA-256 hash and are what users
//! compare out-of-band.

use crate::crypto::{self, ScKeypair};
use crate::error::Result;
use crate::protocol::PeerId;

/// A long-term identity: keypair plus derived display forms
#[derive(Debug, Clone)]
pub struct ScIdentity {
    keypair: ScKeypair,
    /// First 16 hex chars of SHA-256(public_key)
    pub peer_id: String,
    /// Creation time, Unix milliseconds
    pub created_at: u64,
    /// At most one identity is primary
    pub is_primary: bool,
}

impl ScIdentity {
    /// Generate a fresh identity
    ///
    /// Fails only on entropy source failure.
    pub fn generate(created_at: u64) -> Result<Self> {
        let keypair = ScKeypair::generate()?;
        Ok(Self::from_keypair(keypair, created_at, true))
    }

    /// Rebuild an identity from stored secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32], created_at: u64, is_primary: bool) -> Self {
        Self::from_keypair(ScKeypair::from_secret_bytes(secret), created_at, is_primary)
    }

    fn from_keypair(keypair: ScKeypair, created_at: u64, is_primary: bool) -> Self {
        let digest = crypto::sha256(&keypair.public_key_bytes());
        let peer_id = hex::encode(digest)[..16].to_string();
        Self {
            keypair,
            peer_id,
            created_at,
            is_primary,
        }
    }

    /// Routing-level peer id: the raw public key
    pub fn public_key(&self) -> PeerId {
        self.keypair.public_key_bytes()
    }

    /// The signing keypair
    pub fn keypair(&self) -> &ScKeypair {
        &self.keypair
    }

    /// Full fingerprint for user verification: SHA-256 of the public key,
    /// hex grouped in 4-char blocks
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_key())
    }
}

/// Grouped fingerprint of an arbitrary public key
pub fn fingerprint_of(public_key: &PeerId) -> String {
    let digest = hex::encode(crypto::sha256(public_key));
    digest
        .as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_derives_display_forms() {
        let identity = ScIdentity::generate(1_700_000_000_000).unwrap();
        assert_eq!(identity.peer_id.len(), 16);
        assert!(identity.is_primary);

        let fp = identity.fingerprint();
        // 64 hex chars in 16 groups of 4, space separated
        assert_eq!(fp.len(), 64 + 15);
        assert!(identity.fingerprint().starts_with(&identity.peer_id[..4]));
    }

    #[test]
    fn test_restore_matches_original() {
        let identity = ScIdentity::generate(42).unwrap();
        let secret = identity.keypair().secret_key_bytes();
        let restored = ScIdentity::from_secret_bytes(&secret, 42, true);

        assert_eq!(identity.public_key(), restored.public_key());
        assert_eq!(identity.peer_id, restored.peer_id);
        assert_eq!(identity.fingerprint(), restored.fingerprint());
    }

    #[test]
    fn test_distinct_identities_distinct_ids() {
        let a = ScIdentity::generate(0).unwrap();
        let b = ScIdentity::generate(0).unwrap();
        assert_ne!(a.peer_id, b.peer_id);
    }
}
