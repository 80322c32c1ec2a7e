//! In-memory reference adapter
//!
//! Backs tests and documents the contract. Every operation is atomic per
//! key under one lock; nothing here suspends while holding it. Platforms
//! replace this with a durable store behind the same trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    ExportFile, ExportIdentity, ExportMessage, ImportReport, ImportStrategy, MessageId,
    PersistenceAdapter, QueuedMessage, SessionKeyRecord, StoredIdentity, EXPORT_VERSION,
    WIPE_TOKEN,
};
use crate::error::{Error, Result};
use crate::mesh::router::Route;
use crate::peers::PeerRecord;
use crate::protocol::PeerId;

#[derive(Default)]
struct Collections {
    messages: HashMap<MessageId, QueuedMessage>,
    identities: HashMap<PeerId, StoredIdentity>,
    peers: HashMap<PeerId, PeerRecord>,
    routes: HashMap<PeerId, Route>,
    session_keys: HashMap<PeerId, SessionKeyRecord>,
    contacts: Vec<serde_json::Value>,
    conversations: Vec<serde_json::Value>,
}

/// In-memory [`PersistenceAdapter`]
pub struct MemoryStore {
    state: RwLock<Collections>,
    /// Queued messages older than this are dropped by `prune_expired`
    max_message_age_ms: u64,
    /// Test hook: simulate a failing store for identity writes
    fail_identity_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Collections::default()),
            max_message_age_ms: Duration::from_secs(7 * 24 * 60 * 60).as_millis() as u64,
            fail_identity_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent identity writes fail, to exercise the fatal path
    pub fn set_fail_identity_writes(&self, fail: bool) {
        self.fail_identity_writes.store(fail, Ordering::SeqCst);
    }

    fn parse_export(data: &[u8]) -> Result<ExportFile> {
        let file: ExportFile = serde_json::from_slice(data)?;
        if file.version != EXPORT_VERSION {
            return Err(Error::Persistence(format!(
                "unsupported export version {}",
                file.version
            )));
        }
        Ok(file)
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryStore {
    async fn save_message(&self, id: MessageId, message: QueuedMessage) -> Result<()> {
        self.state.write().messages.insert(id, message);
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<QueuedMessage>> {
        Ok(self.state.read().messages.get(&id).cloned())
    }

    async fn remove_message(&self, id: MessageId) -> Result<()> {
        self.state.write().messages.remove(&id);
        Ok(())
    }

    async fn scan_messages(&self) -> Result<Vec<(MessageId, QueuedMessage)>> {
        Ok(self
            .state
            .read()
            .messages
            .iter()
            .map(|(id, message)| (*id, message.clone()))
            .collect())
    }

    async fn prune_expired(&self, now_ms: u64) -> Result<()> {
        let max_age = self.max_message_age_ms;
        let mut state = self.state.write();
        state
            .messages
            .retain(|_, message| now_ms.saturating_sub(message.enqueued_at) <= max_age);
        state.routes.retain(|_, route| !route.is_expired(now_ms));
        state
            .session_keys
            .retain(|_, record| now_ms < record.expires_at);
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let state = self.state.read();
        Ok((state.messages.len()
            + state.identities.len()
            + state.peers.len()
            + state.routes.len()
            + state.session_keys.len()) as u64)
    }

    async fn upsert_identity(&self, identity: StoredIdentity) -> Result<()> {
        if self.fail_identity_writes.load(Ordering::SeqCst) {
            return Err(Error::PersistenceFatal(
                "identity write rejected by store".to_string(),
            ));
        }
        let mut state = self.state.write();
        if identity.is_primary {
            for existing in state.identities.values_mut() {
                existing.is_primary = false;
            }
        }
        state.identities.insert(identity.public_key, identity);
        Ok(())
    }

    async fn get_primary_identity(&self) -> Result<Option<StoredIdentity>> {
        Ok(self
            .state
            .read()
            .identities
            .values()
            .find(|identity| identity.is_primary)
            .cloned())
    }

    async fn list_identities(&self) -> Result<Vec<StoredIdentity>> {
        Ok(self.state.read().identities.values().cloned().collect())
    }

    async fn delete_identity(&self, public_key: &PeerId) -> Result<()> {
        self.state.write().identities.remove(public_key);
        Ok(())
    }

    async fn upsert_peer(&self, peer: PeerRecord) -> Result<()> {
        self.state.write().peers.insert(peer.peer_id, peer);
        Ok(())
    }

    async fn get_peer(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>> {
        Ok(self.state.read().peers.get(peer_id).cloned())
    }

    async fn active_peers(&self, cutoff_ms: u64) -> Result<Vec<PeerRecord>> {
        Ok(self
            .state
            .read()
            .peers
            .values()
            .filter(|peer| peer.last_seen >= cutoff_ms)
            .cloned()
            .collect())
    }

    async fn blacklist_peer(&self, peer_id: &PeerId, until_ms: u64) -> Result<()> {
        if let Some(peer) = self.state.write().peers.get_mut(peer_id) {
            peer.is_blacklisted = true;
            peer.blacklisted_until = peer.blacklisted_until.max(until_ms);
        }
        Ok(())
    }

    async fn delete_peer(&self, peer_id: &PeerId) -> Result<()> {
        self.state.write().peers.remove(peer_id);
        Ok(())
    }

    async fn put_route(&self, route: Route) -> Result<()> {
        self.state.write().routes.insert(route.destination, route);
        Ok(())
    }

    async fn get_route(&self, destination: &PeerId) -> Result<Option<Route>> {
        Ok(self.state.read().routes.get(destination).cloned())
    }

    async fn list_routes(&self) -> Result<Vec<Route>> {
        Ok(self.state.read().routes.values().cloned().collect())
    }

    async fn delete_expired_routes(&self, now_ms: u64) -> Result<()> {
        self.state
            .write()
            .routes
            .retain(|_, route| !route.is_expired(now_ms));
        Ok(())
    }

    async fn put_session_key(&self, record: SessionKeyRecord) -> Result<()> {
        self.state.write().session_keys.insert(record.peer, record);
        Ok(())
    }

    async fn get_session_key(&self, peer: &PeerId) -> Result<Option<SessionKeyRecord>> {
        Ok(self.state.read().session_keys.get(peer).cloned())
    }

    async fn delete_session_key(&self, peer: &PeerId) -> Result<()> {
        self.state.write().session_keys.remove(peer);
        Ok(())
    }

    async fn delete_expired_session_keys(&self, now_ms: u64) -> Result<()> {
        self.state
            .write()
            .session_keys
            .retain(|_, record| now_ms < record.expires_at);
        Ok(())
    }

    async fn export_all(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        let file = ExportFile {
            version: EXPORT_VERSION,
            identities: state
                .identities
                .values()
                .map(|identity| ExportIdentity {
                    public_key: hex::encode(identity.public_key),
                    peer_id: identity.peer_id.clone(),
                    created_at: identity.created_at,
                    is_primary: identity.is_primary,
                })
                .collect(),
            contacts: state.contacts.clone(),
            conversations: state.conversations.clone(),
            messages: state
                .messages
                .iter()
                .map(|(id, message)| ExportMessage {
                    id: id.to_string(),
                    message: message.clone(),
                })
                .collect(),
            peers: state.peers.values().cloned().collect(),
            routes: state.routes.values().cloned().collect(),
        };
        Ok(serde_json::to_vec(&file)?)
    }

    async fn import_all(&self, data: &[u8], strategy: ImportStrategy) -> Result<ImportReport> {
        let file = Self::parse_export(data)?;
        let mut report = ImportReport::default();
        let mut state = self.state.write();

        if strategy == ImportStrategy::Overwrite {
            state.messages.clear();
            state.peers.clear();
            state.routes.clear();
            state.contacts.clear();
            state.conversations.clear();
        }

        // Exported identities carry no secrets; record the public halves
        // without disturbing a usable local identity of the same key.
        for identity in file.identities {
            match hex::decode(&identity.public_key)
                .ok()
                .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
            {
                Some(public_key) => {
                    if state.identities.contains_key(&public_key) {
                        report.skipped += 1;
                    } else {
                        state.identities.insert(
                            public_key,
                            StoredIdentity {
                                public_key,
                                peer_id: identity.peer_id,
                                created_at: identity.created_at,
                                is_primary: false,
                                secret: None,
                            },
                        );
                        report.imported += 1;
                    }
                }
                None => report.errors += 1,
            }
        }

        for entry in file.messages {
            match entry.id.parse::<MessageId>() {
                Ok(id) => match strategy {
                    ImportStrategy::Skip if state.messages.contains_key(&id) => {
                        report.skipped += 1;
                    }
                    _ => {
                        state.messages.insert(id, entry.message);
                        report.imported += 1;
                    }
                },
                Err(_) => report.errors += 1,
            }
        }

        for peer in file.peers {
            let keep_existing = match (strategy, state.peers.get(&peer.peer_id)) {
                (ImportStrategy::Skip, Some(_)) => true,
                (ImportStrategy::Merge, Some(existing)) => existing.last_seen >= peer.last_seen,
                _ => false,
            };
            if keep_existing {
                report.skipped += 1;
            } else {
                state.peers.insert(peer.peer_id, peer);
                report.imported += 1;
            }
        }

        for route in file.routes {
            let keep_existing = match (strategy, state.routes.get(&route.destination)) {
                (ImportStrategy::Skip, Some(_)) => true,
                (ImportStrategy::Merge, Some(existing)) => {
                    existing.last_updated >= route.last_updated
                }
                _ => false,
            };
            if keep_existing {
                report.skipped += 1;
            } else {
                state.routes.insert(route.destination, route);
                report.imported += 1;
            }
        }

        state.contacts.extend(file.contacts);
        state.conversations.extend(file.conversations);

        Ok(report)
    }

    async fn wipe(&self, confirm_token: &str) -> Result<()> {
        if confirm_token != WIPE_TOKEN {
            return Err(Error::WipeRefused);
        }
        *self.state.write() = Collections::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn queued(dest: u8, enqueued_at: u64) -> QueuedMessage {
        QueuedMessage {
            envelope: vec![1, 2, 3],
            destination: [dest; 32],
            enqueued_at,
            attempt_count: 0,
            next_attempt_at: enqueued_at,
        }
    }

    #[tokio::test]
    async fn test_message_crud() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        store.save_message(id, queued(1, 100)).await.unwrap();
        assert_eq!(store.get_message(id).await.unwrap().unwrap().enqueued_at, 100);
        assert_eq!(store.scan_messages().await.unwrap().len(), 1);

        store.remove_message(id).await.unwrap();
        assert!(store.get_message(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_drops_old_messages() {
        let store = MemoryStore::new();
        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let week_ms = 7 * 24 * 60 * 60 * 1000u64;

        store.save_message(stale, queued(1, 0)).await.unwrap();
        store.save_message(fresh, queued(2, week_ms)).await.unwrap();
        store.prune_expired(week_ms + 1).await.unwrap();

        assert!(store.get_message(stale).await.unwrap().is_none());
        assert!(store.get_message(fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_primary_identity_is_unique() {
        let store = MemoryStore::new();
        let first = StoredIdentity {
            public_key: [1u8; 32],
            peer_id: "aabbccdd00112233".to_string(),
            created_at: 0,
            is_primary: true,
            secret: Some(super::super::SecretKeyMaterial::new([9u8; 32])),
        };
        let second = StoredIdentity {
            public_key: [2u8; 32],
            peer_id: "deadbeefdeadbeef".to_string(),
            created_at: 1,
            is_primary: true,
            secret: None,
        };

        store.upsert_identity(first).await.unwrap();
        store.upsert_identity(second).await.unwrap();

        let primaries: Vec<_> = store
            .list_identities()
            .await
            .unwrap()
            .into_iter()
            .filter(|identity| identity.is_primary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].public_key, [2u8; 32]);
    }

    #[tokio::test]
    async fn test_identity_write_failure_is_fatal() {
        let store = MemoryStore::new();
        store.set_fail_identity_writes(true);
        let result = store
            .upsert_identity(StoredIdentity {
                public_key: [1u8; 32],
                peer_id: "0011223344556677".to_string(),
                created_at: 0,
                is_primary: true,
                secret: None,
            })
            .await;
        assert!(matches!(result, Err(Error::PersistenceFatal(_))));
    }

    #[tokio::test]
    async fn test_wipe_requires_token() {
        let store = MemoryStore::new();
        store
            .save_message(Uuid::new_v4(), queued(1, 0))
            .await
            .unwrap();

        assert!(matches!(
            store.wipe("delete all my data").await,
            Err(Error::WipeRefused)
        ));
        assert_eq!(store.size().await.unwrap(), 1);

        store.wipe(WIPE_TOKEN).await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_export_excludes_secrets() {
        let store = MemoryStore::new();
        store
            .upsert_identity(StoredIdentity {
                public_key: [3u8; 32],
                peer_id: "feedfacefeedface".to_string(),
                created_at: 7,
                is_primary: true,
                secret: Some(super::super::SecretKeyMaterial::new([0xAA; 32])),
            })
            .await
            .unwrap();

        let exported = store.export_all().await.unwrap();
        let text = String::from_utf8(exported).unwrap();
        assert!(!text.contains("aaaaaaaa"));
        assert!(!text.to_lowercase().contains("secret"));
        assert!(text.contains("feedfacefeedface"));
    }

    #[tokio::test]
    async fn test_import_rejects_wrong_version() {
        let store = MemoryStore::new();
        let bad = serde_json::json!({
            "version": 2,
            "identities": [], "contacts": [], "conversations": [],
            "messages": [], "peers": [], "routes": []
        });
        let result = store
            .import_all(&serde_json::to_vec(&bad).unwrap(), ImportStrategy::Merge)
            .await;
        assert!(result.is_err());
    }
}
