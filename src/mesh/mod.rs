//! Mesh networking core
//!
//! This module implements the mesh layer of the SC messaging system:
//! - Envelope deduplication with a bounded seen-set
//! - Five-level strict priority queue with backpressure
//! - Flood, gossip, and hybrid routing behind one router seam
//! - Kademlia-style lookups for peer location
//! - The relay engine: verify, dedup, TTL, deliver-or-forward
//! - Store-and-forward for unreachable destinations

pub mod deduplication;
pub mod gossip;
pub mod kademlia;
pub mod message_queue;
pub mod relay;
pub mod router;
pub mod store_forward;

pub use deduplication::SeenCache;
pub use gossip::GossipEngine;
pub use kademlia::{bootstrap, iterative_find_node, FindNodeClient, NodeId, NodeInfo, RoutingTable};
pub use message_queue::{MessageQueue, OutboundItem};
pub use relay::{
    Disposition, InboundMessage, OutboundState, PeerEvent, RelayEngine, SecurityEvent, SendOutcome,
};
pub use router::{Route, Router, RouterMode};
pub use store_forward::StoreAndForward;
