//! X25519 key agreement and HKDF-SHA256 key derivation
//!
//! Identity keys are Ed25519; the Diffie-Hellman leg converts them to
//! X25519 form with the standard Edwards-to-Montgomery map, so peers need
//! only one long-term keypair.

use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// HKDF info string for initial session-key derivation
pub const SESSION_KEY_INFO: &[u8] = b"SC-Session-Key-v1";

/// HKDF info string for rekey derivations
pub const REKEY_INFO: &[u8] = b"SC-Rekey-v1";

/// Convert an Ed25519 public key to its X25519 (Montgomery) form
pub fn ed25519_public_to_x25519(public_key: &[u8; 32]) -> Result<[u8; 32]> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::Crypto(format!("invalid Ed25519 public key: {}", e)))?;
    Ok(key.to_montgomery().to_bytes())
}

/// Convert an Ed25519 signing key to an X25519 scalar
///
/// Standard conversion: the low 32 bytes of SHA-512 over the seed; clamping
/// happens inside the X25519 function.
pub fn ed25519_secret_to_x25519(signing_key: &SigningKey) -> Zeroizing<[u8; 32]> {
    let hash = Sha512::digest(signing_key.to_bytes());
    let mut scalar = Zeroizing::new([0u8; 32]);
    scalar.copy_from_slice(&hash[..32]);
    scalar
}

/// X25519 Diffie-Hellman between our scalar and a peer's Montgomery point
pub fn ecdh(our_scalar: &[u8; 32], their_point: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(x25519_dalek::x25519(*our_scalar, *their_point))
}

/// Shared secret between our Ed25519 identity and a peer's Ed25519 public key
pub fn shared_secret(
    our_signing_key: &SigningKey,
    their_public_key: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>> {
    let scalar = ed25519_secret_to_x25519(our_signing_key);
    let point = ed25519_public_to_x25519(their_public_key)?;
    Ok(ecdh(&scalar, &point))
}

/// HKDF-SHA256 (RFC 5869): extract-then-expand `okm_len` bytes
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], okm_len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new(vec![0u8; okm_len]);
    hk.expand(info, &mut okm)
        .map_err(|_| Error::Crypto(format!("HKDF output length {} invalid", okm_len)))?;
    Ok(okm)
}
