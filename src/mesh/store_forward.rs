//! Store-and-forward queue for unreachable destinations
//!
//! When no connected next hop exists for a message, it is persisted and
//! retried: immediately when the destination (or any peer) connects, and on
//! a periodic scheduler tick with exponential backoff per destination.
//! Messages that outlive `max_queue_age` or exhaust `max_attempts` are
//! dropped with a local warning; there is no dead-letter delivery.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::protocol::{short_peer_id, PeerId};
use crate::storage::{MessageId, PersistenceAdapter, QueuedMessage};

pub struct StoreAndForward {
    storage: Arc<dyn PersistenceAdapter>,
    config: RelayConfig,
}

impl StoreAndForward {
    pub fn new(storage: Arc<dyn PersistenceAdapter>, config: RelayConfig) -> Self {
        Self { storage, config }
    }

    /// Persist a message for later delivery; first attempt is due
    /// immediately
    pub async fn enqueue(
        &self,
        envelope: Vec<u8>,
        destination: PeerId,
        now_ms: u64,
    ) -> Result<MessageId> {
        let id = Uuid::new_v4();
        self.storage
            .save_message(
                id,
                QueuedMessage {
                    envelope,
                    destination,
                    enqueued_at: now_ms,
                    attempt_count: 0,
                    next_attempt_at: now_ms,
                },
            )
            .await?;
        tracing::debug!(
            dest = %short_peer_id(&destination),
            id = %id,
            "message queued for store-and-forward"
        );
        Ok(id)
    }

    fn is_expired(&self, message: &QueuedMessage, now_ms: u64) -> bool {
        let max_age = self.config.max_queue_age.as_millis() as u64;
        now_ms.saturating_sub(message.enqueued_at) > max_age
            || message.attempt_count > self.config.max_attempts
    }

    /// Messages due for a retry on this tick; expired ones are dropped here
    pub async fn due(&self, now_ms: u64) -> Result<Vec<(MessageId, QueuedMessage)>> {
        let mut due = Vec::new();
        for (id, message) in self.storage.scan_messages().await? {
            if self.is_expired(&message, now_ms) {
                tracing::warn!(
                    dest = %short_peer_id(&message.destination),
                    id = %id,
                    attempts = message.attempt_count,
                    "dropping expired queued message"
                );
                self.storage.remove_message(id).await?;
                continue;
            }
            if message.next_attempt_at <= now_ms {
                due.push((id, message));
            }
        }
        due.sort_by_key(|(_, message)| message.enqueued_at);
        Ok(due)
    }

    /// Everything queued for one destination, retried immediately on its
    /// reconnect regardless of backoff
    pub async fn due_for(
        &self,
        destination: &PeerId,
        now_ms: u64,
    ) -> Result<Vec<(MessageId, QueuedMessage)>> {
        let mut due = Vec::new();
        for (id, message) in self.storage.scan_messages().await? {
            if message.destination != *destination {
                continue;
            }
            if self.is_expired(&message, now_ms) {
                self.storage.remove_message(id).await?;
                continue;
            }
            due.push((id, message));
        }
        due.sort_by_key(|(_, message)| message.enqueued_at);
        Ok(due)
    }

    pub async fn mark_delivered(&self, id: MessageId) -> Result<()> {
        self.storage.remove_message(id).await
    }

    /// Record a failed attempt and reschedule with exponential backoff
    pub async fn mark_failed(&self, id: MessageId, mut message: QueuedMessage, now_ms: u64) -> Result<()> {
        message.attempt_count += 1;
        if message.attempt_count > self.config.max_attempts {
            tracing::warn!(
                dest = %short_peer_id(&message.destination),
                id = %id,
                "dropping queued message after max attempts"
            );
            return self.storage.remove_message(id).await;
        }

        let base = self.config.backoff_base.as_millis() as u64;
        let cap = self.config.backoff_cap.as_millis() as u64;
        let backoff = base
            .saturating_mul(1u64 << (message.attempt_count - 1).min(20))
            .min(cap);
        message.next_attempt_at = now_ms + backoff;
        self.storage.save_message(id, message).await
    }

    pub async fn queued_count(&self) -> Result<usize> {
        Ok(self.storage.scan_messages().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn sf() -> StoreAndForward {
        StoreAndForward::new(Arc::new(MemoryStore::new()), RelayConfig::default())
    }

    #[tokio::test]
    async fn test_enqueue_is_immediately_due() {
        let sf = sf();
        let dest = [1u8; 32];
        let id = sf.enqueue(vec![1, 2, 3], dest, 1000).await.unwrap();

        let due = sf.due(1000).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, id);
    }

    #[tokio::test]
    async fn test_backoff_doubles() {
        let sf = sf();
        let dest = [1u8; 32];
        let id = sf.enqueue(vec![0], dest, 0).await.unwrap();

        let (_, message) = sf.due(0).await.unwrap().pop().unwrap();
        sf.mark_failed(id, message, 0).await.unwrap();
        // 5 s base backoff: not due before it elapses
        assert!(sf.due(4_999).await.unwrap().is_empty());
        let (_, message) = sf.due(5_000).await.unwrap().pop().unwrap();

        sf.mark_failed(id, message, 5_000).await.unwrap();
        // Second failure: 10 s
        assert!(sf.due(14_999).await.unwrap().is_empty());
        assert_eq!(sf.due(15_000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_cap() {
        let sf = sf();
        let dest = [1u8; 32];
        let id = sf.enqueue(vec![0], dest, 0).await.unwrap();

        let mut message = sf.due(0).await.unwrap().pop().unwrap().1;
        for _ in 0..9 {
            sf.mark_failed(id, message.clone(), 0).await.unwrap();
            message = match sf.storage.get_message(id).await.unwrap() {
                Some(m) => m,
                None => return, // dropped at attempt cap, also fine here
            };
        }
        // 15 min cap regardless of attempt count
        assert!(message.next_attempt_at <= 15 * 60 * 1000);
    }

    #[tokio::test]
    async fn test_max_attempts_drops() {
        let sf = sf();
        let dest = [1u8; 32];
        let id = sf.enqueue(vec![0], dest, 0).await.unwrap();

        let mut message = sf.due(0).await.unwrap().pop().unwrap().1;
        for _ in 0..=RelayConfig::default().max_attempts {
            sf.mark_failed(id, message.clone(), 0).await.unwrap();
            match sf.storage.get_message(id).await.unwrap() {
                Some(m) => message = m,
                None => break,
            }
        }
        assert!(sf.storage.get_message(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_age_expiry_drops_exactly_once() {
        let sf = sf();
        let dest = [1u8; 32];
        sf.enqueue(vec![0], dest, 0).await.unwrap();

        let week = 7 * 24 * 60 * 60 * 1000u64;
        assert!(sf.due(week + 1).await.unwrap().is_empty());
        assert_eq!(sf.queued_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_due_for_ignores_backoff_on_reconnect() {
        let sf = sf();
        let dest = [1u8; 32];
        let other = [2u8; 32];
        let id = sf.enqueue(vec![0], dest, 0).await.unwrap();
        sf.enqueue(vec![1], other, 0).await.unwrap();

        let message = sf.storage.get_message(id).await.unwrap().unwrap();
        sf.mark_failed(id, message, 0).await.unwrap();

        // Backoff has not elapsed, but the destination just reconnected
        let due = sf.due_for(&dest, 1).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.destination, dest);
    }
}
