//! Wire protocol for the SC mesh
//!
//! Every frame on the wire is an [`Envelope`]: a fixed 109-byte header
//! followed by a variable payload of at most 64 KiB. All multi-byte integers
//! are big-endian. The header carries the original sender's public key and a
//! 65-byte signature (64-byte Ed25519 plus a vestigial zero byte).
//!
//! TTL is the only hop-mutable header field. Signatures, AEAD associated
//! data, and dedup fingerprints are computed with the TTL byte normalized to
//! zero so that relaying does not invalidate them.

pub mod binary;
pub mod constants;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, ScKeypair};
use constants::*;

/// Peer identifier: the peer's 32-byte Ed25519 public key
pub type PeerId = [u8; 32];

/// Short display handle: first 16 hex chars of SHA-256(public_key)
pub fn short_peer_id(peer: &PeerId) -> String {
    hex::encode(crypto::sha256(peer))[..16].to_string()
}

/// Closed enumeration of message types
///
/// Unknown codes decode structurally and stay routable; only the type code
/// 0x00 is rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    FileMetadata,
    FileChunk,
    Voice,
    Ack,
    Ping,
    Pong,
    PeerDiscovery,
    PeerIntro,
    KeyExchange,
    SessionKey,
    Unknown(u8),
}

impl MessageKind {
    /// Wire code for this kind
    pub fn wire(&self) -> u8 {
        match self {
            Self::Text => TYPE_TEXT,
            Self::FileMetadata => TYPE_FILE_METADATA,
            Self::FileChunk => TYPE_FILE_CHUNK,
            Self::Voice => TYPE_VOICE,
            Self::Ack => TYPE_ACK,
            Self::Ping => TYPE_PING,
            Self::Pong => TYPE_PONG,
            Self::PeerDiscovery => TYPE_PEER_DISCOVERY,
            Self::PeerIntro => TYPE_PEER_INTRO,
            Self::KeyExchange => TYPE_KEY_EXCHANGE,
            Self::SessionKey => TYPE_SESSION_KEY,
            Self::Unknown(code) => *code,
        }
    }

    /// Decode a wire code; 0x00 is not a valid type
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0x00 => None,
            TYPE_TEXT => Some(Self::Text),
            TYPE_FILE_METADATA => Some(Self::FileMetadata),
            TYPE_FILE_CHUNK => Some(Self::FileChunk),
            TYPE_VOICE => Some(Self::Voice),
            TYPE_ACK => Some(Self::Ack),
            TYPE_PING => Some(Self::Ping),
            TYPE_PONG => Some(Self::Pong),
            TYPE_PEER_DISCOVERY => Some(Self::PeerDiscovery),
            TYPE_PEER_INTRO => Some(Self::PeerIntro),
            TYPE_KEY_EXCHANGE => Some(Self::KeyExchange),
            TYPE_SESSION_KEY => Some(Self::SessionKey),
            other => Some(Self::Unknown(other)),
        }
    }

    /// Queue priority class for this kind
    pub fn priority(&self) -> Priority {
        match self {
            Self::Ack | Self::Ping | Self::Pong | Self::KeyExchange | Self::SessionKey => {
                Priority::Control
            }
            Self::Voice => Priority::Voice,
            Self::Text => Priority::Text,
            Self::FileChunk => Priority::FileChunk,
            Self::FileMetadata | Self::PeerDiscovery | Self::PeerIntro | Self::Unknown(_) => {
                Priority::Bulk
            }
        }
    }

    /// Whether the payload starts with a 32-byte destination public key
    ///
    /// PING/PONG and discovery traffic is link-local or broadcast and
    /// carries no destination prefix.
    pub fn is_directed(&self) -> bool {
        matches!(
            self,
            Self::Text
                | Self::FileMetadata
                | Self::FileChunk
                | Self::Voice
                | Self::Ack
                | Self::KeyExchange
                | Self::SessionKey
        )
    }

    /// Whether the payload body past the routing prefix is AEAD-encrypted
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::FileMetadata | Self::FileChunk | Self::Voice
        )
    }
}

/// Strict priority classes, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Control = 0,
    Voice = 1,
    Text = 2,
    FileChunk = 3,
    Bulk = 4,
}

impl Priority {
    pub const COUNT: usize = 5;

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// The two lowest classes are sheddable under backpressure
    pub fn sheddable(&self) -> bool {
        matches!(self, Self::FileChunk | Self::Bulk)
    }
}

/// Fixed envelope header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: MessageKind,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender: PeerId,
    pub signature: [u8; crypto::SIGNATURE_LEN],
}

impl Header {
    /// The 44-byte header prefix authenticated as AEAD associated data,
    /// with TTL normalized to zero
    pub fn aad_prefix(&self) -> [u8; AAD_LEN] {
        aad_for(self.kind, self.timestamp_ms, &self.sender)
    }
}

/// AEAD associated data for an envelope being built: the 44-byte header
/// prefix (version..sender_public_key) with TTL normalized to zero
pub fn aad_for(kind: MessageKind, timestamp_ms: u64, sender: &PeerId) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[0] = PROTOCOL_VERSION;
    aad[1] = kind.wire();
    aad[2] = 0x00; // ttl, hop-mutable
    aad[3] = RESERVED;
    aad[4..12].copy_from_slice(&timestamp_ms.to_be_bytes());
    aad[12..44].copy_from_slice(sender);
    aad
}

/// An on-wire message: fixed header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build and sign an envelope from the local identity
    pub fn new_signed(
        keypair: &ScKeypair,
        kind: MessageKind,
        ttl: u8,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        let signature = keypair.sign(&signed_bytes(kind, timestamp_ms, &payload));
        Self {
            header: Header {
                version: PROTOCOL_VERSION,
                kind,
                ttl,
                timestamp_ms,
                sender: keypair.public_key_bytes(),
                signature,
            },
            payload,
        }
    }

    /// Verify the header signature against the sender's public key
    pub fn verify_signature(&self) -> bool {
        crypto::verify(
            &self.header.signature,
            &signed_bytes(self.header.kind, self.header.timestamp_ms, &self.payload),
            &self.header.sender,
        )
    }

    /// Dedup fingerprint: SHA-256 over the encoded envelope with the TTL
    /// byte normalized, so the same message hashes identically at every hop
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut bytes = binary::encode(self);
        bytes[2] = 0x00; // ttl offset in the fixed header
        crypto::sha256(&bytes)
    }

    /// Destination public key for directed kinds (first 32 payload bytes)
    pub fn destination(&self) -> Option<PeerId> {
        if !self.header.kind.is_directed() || self.payload.len() < 32 {
            return None;
        }
        let mut dest = [0u8; 32];
        dest.copy_from_slice(&self.payload[..32]);
        Some(dest)
    }

    /// Payload past the 32-byte routing prefix (directed kinds only)
    pub fn directed_body(&self) -> Option<&[u8]> {
        if !self.header.kind.is_directed() || self.payload.len() < 32 {
            return None;
        }
        Some(&self.payload[32..])
    }

    /// Total encoded size
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Bytes covered by the envelope signature:
/// version || type || ttl (normalized to zero) || timestamp || payload
pub fn signed_bytes(kind: MessageKind, timestamp_ms: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11 + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(kind.wire());
    buf.push(0x00);
    buf.extend_from_slice(&timestamp_ms.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Render the peer-info URI carried in QR codes and mDNS records:
/// `sc://<pubkey-hex>@<host>:<port>`
pub fn format_peer_uri(public_key: &PeerId, host: &str, port: u16) -> String {
    format!(
        "{}://{}@{}:{}",
        constants::PEER_URI_SCHEME,
        hex::encode(public_key),
        host,
        port
    )
}

/// Parse a peer-info URI back into its parts; returns None for anything
/// that is not a well-formed `sc://` URI
pub fn parse_peer_uri(uri: &str) -> Option<(PeerId, String, u16)> {
    let rest = uri.strip_prefix(constants::PEER_URI_SCHEME)?.strip_prefix("://")?;
    let (key_hex, endpoint) = rest.split_once('@')?;
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }

    let key_bytes = hex::decode(key_hex).ok()?;
    let public_key: PeerId = key_bytes.as_slice().try_into().ok()?;
    let port: u16 = port.parse().ok()?;
    Some((public_key, host.to_string(), port))
}
