use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use super::chat_events::{ChatEvent, EventBus};
use super::chat_types::{Conversation, ConversationId, DeviceId, LastMessage, Message};
use crate::crypto::DevicePublicKeys;
use crate::error::{ChatError, Result};
use crate::storage::{self, KvStore, CONVERSATION_PREFIX};

const PREVIEW_CHARS: usize = 80;

/// Deterministic id for the direct conversation between two devices.
pub fn conversation_id_for(local_device_id: &str, peer_id: &str) -> ConversationId {
    let (left, right) = if local_device_id <= peer_id {
        (local_device_id, peer_id)
    } else {
        (peer_id, local_device_id)
    };
    let mut hasher = Sha256::new();
    hasher.update(b"chat:conv:dm:v1");
    hasher.update((left.len() as u64).to_be_bytes());
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Owns conversation existence and metadata.
pub struct ConversationDirectory {
    local_device_id: DeviceId,
    store: Arc<dyn KvStore>,
    events: EventBus,
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
    active: StdMutex<Option<ConversationId>>,
}

impl ConversationDirectory {
    pub async fn load(
        local_device_id: DeviceId,
        store: Arc<dyn KvStore>,
        events: EventBus,
    ) -> Result<Self> {
        let mut conversations = HashMap::new();
        for key in store.list_keys_with_prefix(CONVERSATION_PREFIX).await? {
            match storage::get_json::<Conversation>(store.as_ref(), &key).await {
                Ok(Some(conv)) => {
                    conversations.insert(conv.id.clone(), conv);
                }
                Ok(None) => {}
                Err(e) => match storage::quarantine(store.as_ref(), &key).await {
                    Ok(moved) => {
                        log::error!("Unreadable conversation {} moved to {}: {}", key, moved, e);
                    }
                    Err(qe) => {
                        return Err(ChatError::StorageError(format!(
                            "{} is unreadable ({}) and could not be set aside: {}",
                            key, e, qe
                        )));
                    }
                },
            }
        }

        log::info!("Loaded {} conversations", conversations.len());
        Ok(Self {
            local_device_id,
            store,
            events,
            conversations: Mutex::new(conversations),
            active: StdMutex::new(None),
        })
    }

    pub fn local_device_id(&self) -> &str {
        &self.local_device_id
    }

    /// Get the conversation with `peer_id`, creating it if absent.
    ///
    /// Creation requires key material; concurrent callers for the same peer
    /// observe the first caller's conversation.
    pub async fn get_or_create(
        &self,
        peer_id: &str,
        peer_keys: Option<DevicePublicKeys>,
    ) -> Result<Conversation> {
        let conv_id = conversation_id_for(&self.local_device_id, peer_id);
        let mut conversations = self.conversations.lock().await;
        if let Some(existing) = conversations.get(&conv_id) {
            return Ok(existing.clone());
        }

        let peer_keys = peer_keys.ok_or_else(|| ChatError::PeerKeysUnavailable(peer_id.to_string()))?;
        let now = Utc::now();
        let conv = Conversation {
            id: conv_id.clone(),
            peer_id: peer_id.to_string(),
            peer_keys,
            last_message: None,
            last_activity: now,
            unread_count: 0,
            created_at: now,
        };
        self.persist(&conv).await?;
        conversations.insert(conv_id.clone(), conv.clone());
        drop(conversations);

        log::info!("Created conversation {} with peer {}", conv_id, peer_id);
        self.events.publish(ChatEvent::ConversationCreated {
            conversation_id: conv_id,
            peer_id: peer_id.to_string(),
        });
        Ok(conv)
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.lock().await.get(conversation_id).cloned()
    }

    pub async fn find_by_peer(&self, peer_id: &str) -> Option<Conversation> {
        let conv_id = conversation_id_for(&self.local_device_id, peer_id);
        self.get(&conv_id).await
    }

    /// All conversations, most recent activity first, ties broken by id.
    pub async fn list(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> =
            self.conversations.lock().await.values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Record `message` as the latest activity. Older messages never move the
    /// conversation backwards.
    pub async fn touch(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conv = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;

        let activity = message.activity_at();
        let is_current = conv
            .last_message
            .as_ref()
            .is_some_and(|last| last.message_id == message.id);
        if activity < conv.last_activity && !is_current {
            return Ok(());
        }

        conv.last_activity = conv.last_activity.max(activity);
        conv.last_message = Some(LastMessage {
            message_id: message.id.clone(),
            preview: message.content.chars().take(PREVIEW_CHARS).collect(),
            timestamp: activity,
        });
        let snapshot = conv.clone();
        self.persist(&snapshot).await
    }

    /// Reset unread to zero. Returns whether anything changed.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<bool> {
        let mut conversations = self.conversations.lock().await;
        let Some(conv) = conversations.get_mut(conversation_id) else {
            return Ok(false);
        };
        if conv.unread_count == 0 {
            return Ok(false);
        }
        conv.unread_count = 0;
        let snapshot = conv.clone();
        self.persist(&snapshot).await?;
        Ok(true)
    }

    pub async fn increment_unread(&self, conversation_id: &str) -> Result<u32> {
        let mut conversations = self.conversations.lock().await;
        let conv = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
        conv.unread_count = conv.unread_count.saturating_add(1);
        let snapshot = conv.clone();
        self.persist(&snapshot).await?;
        Ok(snapshot.unread_count)
    }

    /// Get total unread count across all conversations.
    pub async fn total_unread(&self) -> u32 {
        self.conversations
            .lock()
            .await
            .values()
            .map(|c| c.unread_count)
            .sum()
    }

    /// The conversation currently on screen, if any.
    pub fn set_active(&self, conversation_id: Option<ConversationId>) {
        *self.active_guard() = conversation_id;
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active_guard().as_deref() == Some(conversation_id)
    }

    fn active_guard(&self) -> std::sync::MutexGuard<'_, Option<ConversationId>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn persist(&self, conv: &Conversation) -> Result<()> {
        storage::set_json(
            self.store.as_ref(),
            &storage::conversation_key(&conv.id),
            conv,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::chat_types::MessageStatus;
    use crate::storage::MemoryStore;
    use chrono::{DateTime, Duration};

    fn keys() -> DevicePublicKeys {
        DevicePublicKeys {
            identity_key: "ik".into(),
            signing_key: "sk".into(),
            pre_key_bundle: None,
        }
    }

    fn outbound(id: &str, conv: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: id.into(),
            conversation_id: conv.into(),
            sender_id: "me".into(),
            recipient_id: "peer".into(),
            content: format!("text {}", id),
            timestamp: at,
            status: MessageStatus::Pending,
            is_outgoing: true,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            expiration: None,
        }
    }

    async fn directory(store: Arc<MemoryStore>) -> ConversationDirectory {
        ConversationDirectory::load("me".into(), store, EventBus::new())
            .await
            .unwrap()
    }

    #[test]
    fn test_conversation_id_is_symmetric_and_distinct() {
        assert_eq!(conversation_id_for("a", "b"), conversation_id_for("b", "a"));
        assert_ne!(conversation_id_for("a", "b"), conversation_id_for("a", "c"));
        assert_ne!(conversation_id_for("ab", "c"), conversation_id_for("a", "bc"));
        assert_eq!(conversation_id_for("a", "b").len(), 64);
    }

    #[tokio::test]
    async fn test_unreadable_record_is_set_aside() {
        let kv = Arc::new(MemoryStore::new());
        let conv_id = conversation_id_for("me", "bob");
        kv.set(&storage::conversation_key(&conv_id), b"{\"id\":".to_vec())
            .await
            .unwrap();

        let dir = directory(kv.clone()).await;
        assert!(dir.list().await.is_empty());
        let moved = kv
            .list_keys_with_prefix(storage::QUARANTINE_PREFIX)
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(kv.get(&moved[0]).await.unwrap(), Some(b"{\"id\":".to_vec()));

        dir.get_or_create("bob", Some(keys())).await.unwrap();
        assert_eq!(kv.get(&moved[0]).await.unwrap(), Some(b"{\"id\":".to_vec()));
    }

    #[tokio::test]
    async fn test_create_requires_keys() {
        let dir = directory(Arc::new(MemoryStore::new())).await;
        let err = dir.get_or_create("bob", None).await.unwrap_err();
        assert!(matches!(err, ChatError::PeerKeysUnavailable(ref p) if p == "bob"));
        assert!(dir.list().await.is_empty());

        let conv = dir.get_or_create("bob", Some(keys())).await.unwrap();
        assert_eq!(conv.unread_count, 0);
        // Existing conversations no longer need keys.
        let again = dir.get_or_create("bob", None).await.unwrap();
        assert_eq!(again.id, conv.id);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one() {
        let events = EventBus::new();
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = created.clone();
        let _sub = events.subscribe(move |e| {
            if matches!(e, ChatEvent::ConversationCreated { .. }) {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            Ok(())
        });
        let dir = Arc::new(
            ConversationDirectory::load("me".into(), Arc::new(MemoryStore::new()), events)
                .await
                .unwrap(),
        );

        let (a, b) = tokio::join!(
            dir.get_or_create("bob", Some(keys())),
            dir.get_or_create("bob", Some(keys()))
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(dir.list().await.len(), 1);
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_order_and_touch() {
        let dir = directory(Arc::new(MemoryStore::new())).await;
        let alice = dir.get_or_create("alice", Some(keys())).await.unwrap();
        let bob = dir.get_or_create("bob", Some(keys())).await.unwrap();

        let now = Utc::now();
        dir.touch(&alice.id, &outbound("m1", &alice.id, now + Duration::seconds(5)))
            .await
            .unwrap();
        dir.touch(&bob.id, &outbound("m2", &bob.id, now + Duration::seconds(10)))
            .await
            .unwrap();
        let order: Vec<_> = dir.list().await.into_iter().map(|c| c.peer_id).collect();
        assert_eq!(order, vec!["bob", "alice"]);

        // An older message does not regress the preview.
        dir.touch(&bob.id, &outbound("m0", &bob.id, now)).await.unwrap();
        let bob_now = dir.get(&bob.id).await.unwrap();
        assert_eq!(bob_now.last_message.unwrap().message_id, "m2");

        let err = dir
            .touch("missing", &outbound("m3", "missing", now))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_ties_broken_by_id() {
        let dir = directory(Arc::new(MemoryStore::new())).await;
        let a = dir.get_or_create("alice", Some(keys())).await.unwrap();
        let b = dir.get_or_create("bob", Some(keys())).await.unwrap();
        let at = Utc::now() + Duration::seconds(30);
        dir.touch(&a.id, &outbound("m1", &a.id, at)).await.unwrap();
        dir.touch(&b.id, &outbound("m2", &b.id, at)).await.unwrap();

        let ids: Vec<_> = dir.list().await.into_iter().map(|c| c.id).collect();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_unread_accounting_and_persistence() {
        let store = Arc::new(MemoryStore::new());
        let dir = directory(store.clone()).await;
        let conv = dir.get_or_create("bob", Some(keys())).await.unwrap();

        for _ in 0..3 {
            dir.increment_unread(&conv.id).await.unwrap();
        }
        assert_eq!(dir.total_unread().await, 3);

        let reloaded = directory(store.clone()).await;
        assert_eq!(reloaded.get(&conv.id).await.unwrap().unread_count, 3);

        assert!(dir.mark_read(&conv.id).await.unwrap());
        assert!(!dir.mark_read(&conv.id).await.unwrap());
        assert!(!dir.mark_read("missing").await.unwrap());
        assert_eq!(dir.total_unread().await, 0);
    }

    #[tokio::test]
    async fn test_active_conversation_tracking() {
        let dir = directory(Arc::new(MemoryStore::new())).await;
        assert!(!dir.is_active("c1"));
        dir.set_active(Some("c1".into()));
        assert!(dir.is_active("c1"));
        assert!(!dir.is_active("c2"));
        dir.set_active(None);
        assert!(!dir.is_active("c1"));
    }
}
