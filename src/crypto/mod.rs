//! Cryptographic primitives for the SC mesh core
//!
//! This module provides all cryptographic functionality for the mesh:
//! - Ed25519 keypairs for identity and envelope signing
//! - X25519 ECDH and HKDF-SHA256 session-key derivation
//! - XChaCha20-Poly1305 authenticated encryption
//! - OS CSRNG access and constant-time comparison
//!
//! Signatures travel as 65 bytes on the wire: the 64-byte Ed25519 signature
//! followed by a vestigial zero byte. Verification accepts both 64- and
//! 65-byte forms.

pub mod ecdh;
pub mod encryption;
pub mod random;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::Result;

/// Length of a wire signature: 64-byte Ed25519 plus one vestigial zero byte
pub const SIGNATURE_LEN: usize = 65;

/// Length of a raw Ed25519 signature
pub const RAW_SIGNATURE_LEN: usize = 64;

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct ScKeypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for ScKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never render secret material
        f.debug_struct("ScKeypair")
            .field("public_key", &hex::encode(self.verifying_key.to_bytes()))
            .finish_non_exhaustive()
    }
}

impl ScKeypair {
    /// Generate a new keypair from the OS CSRNG
    ///
    /// Fails only if the entropy source fails.
    pub fn generate() -> Result<Self> {
        let seed = random::random_array::<32>()?;
        Ok(Self::from_secret_bytes(&seed))
    }

    /// Reconstruct a keypair from a stored 32-byte secret
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Secret key bytes, wrapped so the copy is scrubbed on drop
    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Sign a message, producing the 65-byte wire form
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let sig = self.signing_key.sign(message);
        let mut wire = [0u8; SIGNATURE_LEN];
        wire[..RAW_SIGNATURE_LEN].copy_from_slice(&sig.to_bytes());
        wire
    }

    /// X25519 secret corresponding to this Ed25519 key
    pub fn x25519_secret(&self) -> Zeroizing<[u8; 32]> {
        ecdh::ed25519_secret_to_x25519(&self.signing_key)
    }

    /// ECDH shared secret with a peer's Ed25519 public key
    pub fn shared_secret(&self, their_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        ecdh::shared_secret(&self.signing_key, their_public)
    }
}

/// Verify a signature over a message
///
/// Accepts 64-byte raw signatures and 65-byte wire signatures (the trailing
/// byte is ignored). Returns false on any structural or cryptographic
/// failure; never panics.
pub fn verify(signature: &[u8], message: &[u8], public_key: &[u8; 32]) -> bool {
    let raw: &[u8] = match signature.len() {
        RAW_SIGNATURE_LEN => signature,
        SIGNATURE_LEN => &signature[..RAW_SIGNATURE_LEN],
        _ => return false,
    };

    let sig_bytes: [u8; RAW_SIGNATURE_LEN] = match raw.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let sig = Signature::from_bytes(&sig_bytes);

    let key = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    key.verify(message, &sig).is_ok()
}

/// Constant-time equality for secrets and MACs
///
/// Timing depends only on the input lengths; there is no early exit on the
/// first differing byte.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// SHA-256 of arbitrary bytes
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
