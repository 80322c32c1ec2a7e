//! Persistence adapter contract
//!
//! The core consumes a thin async contract; platforms implement it over
//! whatever store they have (SQLite, IndexedDB, files). Operations are
//! independently atomic per key; the core assumes no cross-key
//! transactionality. Failures surface as `Persistence` errors and are
//! retriable, except identity writes, which are fatal to the relay.
//!
//! The only cross-adapter artifact is the export/import file: a JSON object
//! with `version: 1` and the collections named in [`ExportFile`]. Session
//! keys and identity secrets are never exported.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::Result;
use crate::mesh::router::Route;
use crate::peers::PeerRecord;
use crate::protocol::PeerId;

pub use memory::MemoryStore;

/// Identifier for a queued message
pub type MessageId = Uuid;

/// The literal confirmation token required by [`PersistenceAdapter::wipe`]
pub const WIPE_TOKEN: &str = "DELETE ALL MY DATA";

/// Export file format version
pub const EXPORT_VERSION: u32 = 1;

/// A store-and-forward message at rest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Encoded wire envelope
    pub envelope: Vec<u8>,
    pub destination: PeerId,
    pub enqueued_at: u64,
    pub attempt_count: u32,
    pub next_attempt_at: u64,
}

/// Secret key bytes that scrub themselves and never render in debug output
#[derive(Clone)]
pub struct SecretKeyMaterial(Zeroizing<[u8; 32]>);

impl SecretKeyMaterial {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKeyMaterial(..)")
    }
}

/// An identity at rest
///
/// The secret is `None` for identities restored from an export, which
/// carries public halves only; the platform keystore is the durable home
/// for secret material.
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub public_key: PeerId,
    pub peer_id: String,
    pub created_at: u64,
    pub is_primary: bool,
    pub secret: Option<SecretKeyMaterial>,
}

/// Session bookkeeping at rest: epoch and lifetime, never key bytes.
/// Keys are re-derived from the static ECDH secret at the stored epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyRecord {
    pub peer: PeerId,
    pub epoch: u64,
    pub established_at: u64,
    pub expires_at: u64,
}

/// Conflict handling for [`PersistenceAdapter::import_all`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStrategy {
    /// Replace existing collections wholesale
    Overwrite,
    /// Keep the freshest of colliding records
    Merge,
    /// Import only records whose keys are absent
    Skip,
}

/// Outcome counts for an import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Identity as it appears in an export: public half only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportIdentity {
    pub public_key: String,
    pub peer_id: String,
    pub created_at: u64,
    pub is_primary: bool,
}

/// Queued message with its id, as it appears in an export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMessage {
    pub id: String,
    #[serde(flatten)]
    pub message: QueuedMessage,
}

/// The cross-adapter export/import file
///
/// `contacts` and `conversations` belong to upper layers; the core carries
/// them through export/import opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFile {
    pub version: u32,
    pub identities: Vec<ExportIdentity>,
    pub contacts: Vec<serde_json::Value>,
    pub conversations: Vec<serde_json::Value>,
    pub messages: Vec<ExportMessage>,
    pub peers: Vec<PeerRecord>,
    pub routes: Vec<Route>,
}

/// The async persistence contract the core consumes
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    // Store-and-forward messages
    async fn save_message(&self, id: MessageId, message: QueuedMessage) -> Result<()>;
    async fn get_message(&self, id: MessageId) -> Result<Option<QueuedMessage>>;
    async fn remove_message(&self, id: MessageId) -> Result<()>;
    /// Finite, restartable snapshot of all queued messages
    async fn scan_messages(&self) -> Result<Vec<(MessageId, QueuedMessage)>>;
    /// Drop expired messages, routes, and session keys
    async fn prune_expired(&self, now_ms: u64) -> Result<()>;
    /// Total records held
    async fn size(&self) -> Result<u64>;

    // Identities
    async fn upsert_identity(&self, identity: StoredIdentity) -> Result<()>;
    async fn get_primary_identity(&self) -> Result<Option<StoredIdentity>>;
    async fn list_identities(&self) -> Result<Vec<StoredIdentity>>;
    async fn delete_identity(&self, public_key: &PeerId) -> Result<()>;

    // Peers
    async fn upsert_peer(&self, peer: PeerRecord) -> Result<()>;
    async fn get_peer(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>>;
    async fn active_peers(&self, cutoff_ms: u64) -> Result<Vec<PeerRecord>>;
    async fn blacklist_peer(&self, peer_id: &PeerId, until_ms: u64) -> Result<()>;
    async fn delete_peer(&self, peer_id: &PeerId) -> Result<()>;

    // Routes
    async fn put_route(&self, route: Route) -> Result<()>;
    async fn get_route(&self, destination: &PeerId) -> Result<Option<Route>>;
    async fn list_routes(&self) -> Result<Vec<Route>>;
    async fn delete_expired_routes(&self, now_ms: u64) -> Result<()>;

    // Session bookkeeping
    async fn put_session_key(&self, record: SessionKeyRecord) -> Result<()>;
    async fn get_session_key(&self, peer: &PeerId) -> Result<Option<SessionKeyRecord>>;
    async fn delete_session_key(&self, peer: &PeerId) -> Result<()>;
    async fn delete_expired_session_keys(&self, now_ms: u64) -> Result<()>;

    // Backup
    /// Serialize all exportable state as the version-1 JSON object
    async fn export_all(&self) -> Result<Vec<u8>>;
    /// Restore from an export; rejects any version other than 1
    async fn import_all(&self, data: &[u8], strategy: ImportStrategy) -> Result<ImportReport>;
    /// Destroy all state; succeeds only with the literal [`WIPE_TOKEN`]
    async fn wipe(&self, confirm_token: &str) -> Result<()>;
}
