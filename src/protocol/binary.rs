// src/protocol/binary.rs
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use super::constants::*;
use super::{Envelope, Header, MessageKind};
use crate::crypto::SIGNATURE_LEN;
use crate::error::{Error, Result};

/// Encode an envelope to its wire form
///
/// Emits the full 65-byte signature field; senders always write the
/// vestigial trailing zero.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(HEADER_LEN + envelope.payload.len());

    buffer.push(envelope.header.version);
    buffer.push(envelope.header.kind.wire());
    buffer.push(envelope.header.ttl);
    buffer.push(RESERVED);
    buffer.extend_from_slice(&envelope.header.timestamp_ms.to_be_bytes());
    buffer.extend_from_slice(&envelope.header.sender);
    buffer.extend_from_slice(&envelope.header.signature);
    buffer.extend_from_slice(&envelope.payload);

    buffer
}

/// Decode a wire frame to an envelope
///
/// Total: malformed input yields a typed decode error, never a panic.
/// Timestamp skew is an ingress policy check, not a structural one; see
/// [`check_timestamp`].
pub fn decode(data: &[u8]) -> Result<Envelope> {
    if data.len() < HEADER_LEN {
        return Err(Error::Truncated {
            expected: HEADER_LEN,
            actual: data.len(),
        });
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(Error::InvalidVersion {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }

    let type_code = cursor.read_u8()?;
    let kind = MessageKind::from_wire(type_code).ok_or(Error::InvalidType(type_code))?;

    let ttl = cursor.read_u8()?;
    if ttl > MAX_TTL {
        return Err(Error::InvalidTtl { ttl, max: MAX_TTL });
    }

    let reserved = cursor.read_u8()?;
    if reserved != RESERVED {
        return Err(Error::InvalidReserved(reserved));
    }

    let timestamp_ms = cursor.read_u64::<BigEndian>()?;

    let mut sender = [0u8; 32];
    cursor.read_exact(&mut sender)?;

    let mut signature = [0u8; SIGNATURE_LEN];
    cursor.read_exact(&mut signature)?;

    let payload_len = data.len() - HEADER_LEN;
    if payload_len > MAX_PAYLOAD {
        return Err(Error::InvalidLength {
            len: payload_len,
            max: MAX_PAYLOAD,
        });
    }
    let mut payload = vec![0u8; payload_len];
    cursor.read_exact(&mut payload)?;

    Ok(Envelope {
        header: Header {
            version,
            kind,
            ttl,
            timestamp_ms,
            sender,
            signature,
        },
        payload,
    })
}

/// Ingress timestamp policy: bounded skew in both directions, with the
/// future bound tighter than the past bound
pub fn check_timestamp(
    timestamp_ms: u64,
    now_ms: u64,
    max_past_ms: u64,
    max_future_ms: u64,
) -> Result<()> {
    if timestamp_ms > now_ms {
        let ahead = timestamp_ms - now_ms;
        if ahead > max_future_ms {
            return Err(Error::InvalidTimestampSkew {
                skew_ms: ahead as i64,
            });
        }
    } else {
        let behind = now_ms - timestamp_ms;
        if behind > max_past_ms {
            return Err(Error::InvalidTimestampSkew {
                skew_ms: -(behind as i64),
            });
        }
    }
    Ok(())
}
