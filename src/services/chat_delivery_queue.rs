//! Persisted outbound queue with optional exponential backoff.
//!
//! The queue only tracks *which* messages still need a send attempt and how
//! often they were tried; message status lives in the message store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::chat_events::EventError;
use super::chat_types::{ConversationId, DeviceId, MessageId};
use crate::error::Result;
use crate::storage::{self, KvStore, OUTBOX_KEY};

/// Backoff delay after `attempts` attempts: 5s, 15s, 45s, 2min, then capped
/// at 5min.
pub fn backoff_after(attempts: u32) -> Duration {
    let secs = match attempts {
        0 => 0,
        1 => 5,
        2 => 15,
        3 => 45,
        4 => 120,
        _ => 300,
    };
    Duration::from_secs(secs)
}

/// A queued delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDelivery {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub recipient_id: DeviceId,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<EventError>,
    pub created_at: DateTime<Utc>,
}

impl PendingDelivery {
    pub fn new(message_id: MessageId, conversation_id: ConversationId, recipient_id: DeviceId) -> Self {
        Self {
            message_id,
            conversation_id,
            recipient_id,
            attempts: 0,
            last_attempt: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn backoff_duration(&self) -> Duration {
        backoff_after(self.attempts)
    }

    pub fn is_ready_for_retry(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt {
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.to_std().unwrap_or(Duration::ZERO) >= self.backoff_duration()
            }
            None => true,
        }
    }
}

pub struct DeliveryQueue {
    store: Arc<dyn KvStore>,
    pending: Mutex<Vec<PendingDelivery>>,
}

impl DeliveryQueue {
    pub async fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let pending = match storage::get_json::<Vec<PendingDelivery>>(store.as_ref(), OUTBOX_KEY).await {
            Ok(entries) => entries.unwrap_or_default(),
            // Recovery rebuilds the queue from message statuses.
            Err(e) => {
                match storage::quarantine(store.as_ref(), OUTBOX_KEY).await {
                    Ok(moved) => log::warn!(
                        "Unreadable outbound queue moved to {}, starting empty: {}",
                        moved,
                        e
                    ),
                    Err(qe) => log::warn!(
                        "Unreadable outbound queue ({}), starting empty: {}",
                        qe,
                        e
                    ),
                }
                Vec::new()
            }
        };
        if !pending.is_empty() {
            log::info!("Restored {} queued deliveries", pending.len());
        }
        Ok(Self {
            store,
            pending: Mutex::new(pending),
        })
    }

    /// Add a delivery. Re-enqueueing a queued message id is a no-op.
    pub async fn enqueue(&self, delivery: PendingDelivery) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if pending.iter().any(|p| p.message_id == delivery.message_id) {
            return Ok(());
        }
        log::info!(
            "Enqueued delivery {} to {}",
            delivery.message_id,
            delivery.recipient_id
        );
        pending.push(delivery);
        if let Err(e) = self.persist(&pending).await {
            pending.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Entries eligible for an attempt now, oldest first.
    pub async fn ready(&self, backoff: bool) -> Vec<PendingDelivery> {
        let now = Utc::now();
        self.pending
            .lock()
            .await
            .iter()
            .filter(|p| !backoff || p.is_ready_for_retry(now))
            .cloned()
            .collect()
    }

    /// Count a new attempt. Returns the attempt number, or `None` if the entry
    /// is no longer queued.
    pub async fn begin_attempt(&self, message_id: &str) -> Result<Option<u32>> {
        let mut pending = self.pending.lock().await;
        let Some(item) = pending.iter_mut().find(|p| p.message_id == message_id) else {
            return Ok(None);
        };
        item.attempts += 1;
        item.last_attempt = Some(Utc::now());
        let attempt = item.attempts;
        self.persist(&pending).await?;
        Ok(Some(attempt))
    }

    pub async fn record_failure(&self, message_id: &str, error: EventError) -> Result<Option<PendingDelivery>> {
        let mut pending = self.pending.lock().await;
        let Some(item) = pending.iter_mut().find(|p| p.message_id == message_id) else {
            return Ok(None);
        };
        item.last_error = Some(error);
        let updated = item.clone();
        self.persist(&pending).await?;
        Ok(Some(updated))
    }

    pub async fn remove(&self, message_id: &str) -> Result<Option<PendingDelivery>> {
        let mut pending = self.pending.lock().await;
        let Some(pos) = pending.iter().position(|p| p.message_id == message_id) else {
            return Ok(None);
        };
        let removed = pending.remove(pos);
        self.persist(&pending).await?;
        Ok(Some(removed))
    }

    /// Keep only entries matching `keep`. Returns how many were dropped.
    pub async fn retain<F>(&self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&PendingDelivery) -> bool,
    {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|p| keep(p));
        let dropped = before - pending.len();
        if dropped > 0 {
            self.persist(&pending).await?;
        }
        Ok(dropped)
    }

    pub async fn get(&self, message_id: &str) -> Option<PendingDelivery> {
        self.pending
            .lock()
            .await
            .iter()
            .find(|p| p.message_id == message_id)
            .cloned()
    }

    pub async fn contains(&self, message_id: &str) -> bool {
        self.get(message_id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    pub async fn entries(&self) -> Vec<PendingDelivery> {
        self.pending.lock().await.clone()
    }

    async fn persist(&self, pending: &[PendingDelivery]) -> Result<()> {
        storage::set_json(self.store.as_ref(), OUTBOX_KEY, pending).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::MemoryStore;
    use rstest::rstest;

    fn delivery(id: &str) -> PendingDelivery {
        PendingDelivery::new(id.into(), "c1".into(), "bob".into())
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 5)]
    #[case(2, 15)]
    #[case(3, 45)]
    #[case(4, 120)]
    #[case(5, 300)]
    #[case(40, 300)]
    fn test_backoff_ladder(#[case] attempts: u32, #[case] secs: u64) {
        let mut d = delivery("m1");
        d.attempts = attempts;
        assert_eq!(d.backoff_duration(), Duration::from_secs(secs));
    }

    #[test]
    fn test_ready_for_retry() {
        let now = Utc::now();
        let mut d = delivery("m1");
        assert!(d.is_ready_for_retry(now));

        d.attempts = 1;
        d.last_attempt = Some(now);
        assert!(!d.is_ready_for_retry(now + chrono::Duration::seconds(4)));
        assert!(d.is_ready_for_retry(now + chrono::Duration::seconds(5)));
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_and_persisted() {
        let kv = Arc::new(MemoryStore::new());
        let queue = DeliveryQueue::load(kv.clone()).await.unwrap();
        queue.enqueue(delivery("m1")).await.unwrap();
        queue.enqueue(delivery("m1")).await.unwrap();
        queue.enqueue(delivery("m2")).await.unwrap();
        assert_eq!(queue.len().await, 2);

        let reloaded = DeliveryQueue::load(kv).await.unwrap();
        let ids: Vec<_> = reloaded
            .entries()
            .await
            .into_iter()
            .map(|p| p.message_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_attempt_bookkeeping() {
        let queue = DeliveryQueue::load(Arc::new(MemoryStore::new())).await.unwrap();
        queue.enqueue(delivery("m1")).await.unwrap();

        assert_eq!(queue.begin_attempt("m1").await.unwrap(), Some(1));
        let failed = queue
            .record_failure(
                "m1",
                EventError {
                    kind: ErrorKind::Transport,
                    detail: "connection reset".into(),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.unwrap().kind, ErrorKind::Transport);

        // With backoff the entry waits out its delay; without it, it is ready.
        assert!(queue.ready(true).await.is_empty());
        assert_eq!(queue.ready(false).await.len(), 1);

        assert!(queue.remove("m1").await.unwrap().is_some());
        assert!(queue.remove("m1").await.unwrap().is_none());
        assert_eq!(queue.begin_attempt("m1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_retain_and_corrupt_snapshot() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(OUTBOX_KEY, b"garbage".to_vec()).await.unwrap();
        let queue = DeliveryQueue::load(kv.clone()).await.unwrap();
        assert!(queue.is_empty().await);
        let moved = kv
            .list_keys_with_prefix(storage::QUARANTINE_PREFIX)
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);

        for id in ["m1", "m2", "m3"] {
            queue.enqueue(delivery(id)).await.unwrap();
        }
        let dropped = queue.retain(|p| p.message_id != "m2").await.unwrap();
        assert_eq!(dropped, 1);
        assert!(!queue.contains("m2").await);
        assert!(queue.contains("m3").await);
    }
}
