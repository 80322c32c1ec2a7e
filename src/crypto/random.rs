//! OS CSRNG access
//!
//! All key material and unpredictable identifiers come through here. The
//! only failure mode is the entropy source itself failing, which surfaces
//! as `Error::Crypto` rather than a panic.

use crate::error::{Error, Result};

/// Fill a buffer from the OS CSRNG
pub fn fill(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(|e| Error::Crypto(format!("entropy source failed: {}", e)))
}

/// A fixed-size array of CSRNG bytes
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    fill(&mut buf)?;
    Ok(buf)
}

/// A random u64, for jitter and identifiers that must not be guessable
pub fn random_u64() -> Result<u64> {
    Ok(u64::from_be_bytes(random_array::<8>()?))
}
