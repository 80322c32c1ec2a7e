//! Transport abstraction for the SC mesh
//!
//! The core consumes transports; it never implements session establishment.
//! A transport delivers whole frames per peer and reports connection
//! lifecycle through [`TransportEvent`]s on an ordinary channel. Framing
//! within a transport session (WebRTC data channels, BLE GATT writes with
//! MTU-aware fragmentation, local UDP) is the transport's problem.

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::PeerId;

/// Which kind of link a peer is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    WebRtc,
    Ble,
    Local,
}

/// Connection lifecycle and inbound data, consumed by the relay engine
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerConnected {
        peer_id: PeerId,
        kind: TransportKind,
    },
    PeerDisconnected {
        peer_id: PeerId,
        reason: String,
    },
    FrameReceived {
        peer_id: PeerId,
        frame: Vec<u8>,
    },
}

/// Core transport trait: bytes in, bytes out, per peer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to a connected peer
    async fn send_frame(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()>;

    /// Close the link to a peer
    async fn close(&self, peer_id: PeerId) -> Result<()>;
}
