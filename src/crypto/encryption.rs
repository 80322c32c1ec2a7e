//! XChaCha20-Poly1305 authenticated encryption for session payloads
//!
//! The 24-byte XChaCha nonce leaves room for a direction tag plus a 64-bit
//! monotonic counter, so senders never need random nonces and receivers can
//! run a sliding anti-replay window over the counter.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use crate::error::{Error, Result};

/// XChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

/// Direction tag for the session initiator's sending direction
pub const DIR_INITIATOR: u8 = 0x01;

/// Direction tag for the session responder's sending direction
pub const DIR_RESPONDER: u8 = 0x02;

/// Build the 24-byte nonce from a direction tag and a message counter
///
/// Layout: tag byte, 15 zero bytes, then the counter big-endian in the low
/// 8 bytes. Distinct directions can therefore never collide even under the
/// same key.
pub fn build_nonce(direction: u8, counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = direction;
    nonce[NONCE_LEN - 8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Read the counter back out of a received nonce
pub fn nonce_counter(nonce: &[u8; NONCE_LEN]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&nonce[NONCE_LEN - 8..]);
    u64::from_be_bytes(bytes)
}

/// Encrypt a plaintext, authenticating `aad` alongside it
pub fn aead_encrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("AEAD encryption failed".to_string()))
}

/// Decrypt a ciphertext, verifying the tag over ciphertext and `aad`
///
/// Tag verification inside the cipher is constant-time; the error carries
/// no indication of where authentication failed.
pub fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(Error::MacFailure);
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::MacFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let nonce = build_nonce(DIR_INITIATOR, 1);
        let aad = b"header prefix";

        let ct = aead_encrypt(&key, &nonce, b"hello mesh", aad).unwrap();
        assert_ne!(ct.as_slice(), b"hello mesh");
        assert_eq!(ct.len(), b"hello mesh".len() + TAG_LEN);

        let pt = aead_decrypt(&key, &nonce, &ct, aad).unwrap();
        assert_eq!(pt, b"hello mesh");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [7u8; 32];
        let nonce = build_nonce(DIR_INITIATOR, 2);
        let ct = aead_encrypt(&key, &nonce, b"integrity", b"").unwrap();

        for i in 0..ct.len() {
            let mut bad = ct.clone();
            bad[i] ^= 0x01;
            assert!(matches!(
                aead_decrypt(&key, &nonce, &bad, b""),
                Err(Error::MacFailure)
            ));
        }
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [9u8; 32];
        let nonce = build_nonce(DIR_RESPONDER, 3);
        let ct = aead_encrypt(&key, &nonce, b"payload", b"aad-a").unwrap();
        assert!(aead_decrypt(&key, &nonce, &ct, b"aad-b").is_err());
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = build_nonce(DIR_INITIATOR, 0xDEADBEEF);
        assert_eq!(nonce[0], DIR_INITIATOR);
        assert_eq!(nonce_counter(&nonce), 0xDEADBEEF);

        let other = build_nonce(DIR_RESPONDER, 0xDEADBEEF);
        assert_ne!(nonce, other);
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = [1u8; 32];
        let nonce = build_nonce(DIR_INITIATOR, 1);
        assert!(matches!(
            aead_decrypt(&key, &nonce, &[0u8; 8], b""),
            Err(Error::MacFailure)
        ));
    }
}
