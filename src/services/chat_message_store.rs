use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::chat_types::{ConversationId, Message, MessageId, MessageStatus, ReceiptKind};
use crate::error::{ChatError, Result};
use crate::storage::{self, KvStore, MESSAGES_PREFIX};

type History = Arc<Mutex<Vec<Message>>>;

/// Per-conversation message histories.
///
/// Each history has its own lock, so appends and status transitions are
/// atomic per conversation while different conversations proceed in parallel.
pub struct MessageStore {
    store: Arc<dyn KvStore>,
    histories: Mutex<HashMap<ConversationId, History>>,
    index: Mutex<HashMap<MessageId, ConversationId>>,
    /// Receipts that arrived while the message was still `Sending`.
    early_receipts: Mutex<HashMap<MessageId, ReceiptKind>>,
}

impl MessageStore {
    pub async fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut histories = HashMap::new();
        let mut index = HashMap::new();

        for key in store.list_keys_with_prefix(MESSAGES_PREFIX).await? {
            let Some(conv_id) = key.strip_prefix(MESSAGES_PREFIX) else {
                continue;
            };
            match storage::get_json::<Vec<Message>>(store.as_ref(), &key).await {
                Ok(Some(messages)) => {
                    for msg in &messages {
                        index.insert(msg.id.clone(), conv_id.to_string());
                    }
                    histories.insert(conv_id.to_string(), Arc::new(Mutex::new(messages)));
                }
                Ok(None) => {}
                // Left in place, the next append would replace it with a
                // history holding only the new message.
                Err(e) => match storage::quarantine(store.as_ref(), &key).await {
                    Ok(moved) => {
                        log::error!("Unreadable message history {} moved to {}: {}", key, moved, e);
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

        log::info!(
            "Loaded {} messages across {} conversations",
            index.len(),
            histories.len()
        );
        Ok(Self {
            store,
            histories: Mutex::new(histories),
            index: Mutex::new(index),
            early_receipts: Mutex::new(HashMap::new()),
        })
    }

    async fn history(&self, conversation_id: &str) -> History {
        self.histories
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    async fn history_of(&self, message_id: &str) -> Result<(ConversationId, History)> {
        let conv_id = self
            .conversation_of(message_id)
            .await
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        let history = self.history(&conv_id).await;
        Ok((conv_id, history))
    }

    pub async fn conversation_of(&self, message_id: &str) -> Option<ConversationId> {
        self.index.lock().await.get(message_id).cloned()
    }

    /// Append and persist. Returns `false` if a message with the same id is
    /// already stored (the history is left untouched).
    pub async fn append(&self, message: Message) -> Result<bool> {
        let history = self.history(&message.conversation_id).await;
        let mut messages = history.lock().await;
        if self.index.lock().await.contains_key(&message.id) {
            return Ok(false);
        }

        messages.push(message.clone());
        if let Err(e) = self.persist(&message.conversation_id, &messages).await {
            messages.pop();
            return Err(e);
        }
        self.index
            .lock()
            .await
            .insert(message.id.clone(), message.conversation_id.clone());
        Ok(true)
    }

    pub async fn get(&self, message_id: &str) -> Result<Message> {
        let (_, history) = self.history_of(message_id).await?;
        let messages = history.lock().await;
        messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))
    }

    /// Move a message to `to`, applying `stamp` to it, and persist.
    ///
    /// Fails with `InvalidTransition` if the state machine forbids the move.
    pub async fn transition<F>(&self, message_id: &str, to: MessageStatus, stamp: F) -> Result<Message>
    where
        F: FnOnce(&mut Message),
    {
        self.transition_notify(message_id, to, stamp, |_| {}).await
    }

    /// Like `transition`, but runs `notify` with the committed message while
    /// the conversation lock is still held, so observers see transitions of
    /// one message in the order they happen.
    pub async fn transition_notify<F, N>(
        &self,
        message_id: &str,
        to: MessageStatus,
        stamp: F,
        notify: N,
    ) -> Result<Message>
    where
        F: FnOnce(&mut Message),
        N: FnOnce(&Message),
    {
        let (conv_id, history) = self.history_of(message_id).await?;
        let mut messages = history.lock().await;
        let pos = messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;

        let from = messages[pos].status;
        if !from.can_transition_to(to) {
            return Err(ChatError::InvalidTransition {
                id: message_id.to_string(),
                from,
                to,
            });
        }

        let previous = messages[pos].clone();
        messages[pos].status = to;
        stamp(&mut messages[pos]);
        let updated = messages[pos].clone();
        if let Err(e) = self.persist(&conv_id, &messages).await {
            messages[pos] = previous;
            return Err(e);
        }
        notify(&updated);
        Ok(updated)
    }

    /// Claim a message for a send attempt (`Pending`/`Failed` -> `Sending`).
    ///
    /// Returns `None` when the message is not claimable, e.g. another drain
    /// already holds it or it left the queue.
    pub async fn try_claim(&self, message_id: &str) -> Result<Option<Message>> {
        let current = self.get(message_id).await?;
        if !current.status.is_sendable() {
            return Ok(None);
        }
        match self.transition(message_id, MessageStatus::Sending, |_| {}).await {
            Ok(msg) => Ok(Some(msg)),
            Err(ChatError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Hold a receipt for a message whose send has not committed yet.
    ///
    /// Returns `false`, holding nothing, unless the message is `Sending`. The
    /// check runs under the conversation lock, so a receipt is either held
    /// before the `Sent` commit or sees the committed status.
    pub async fn defer_receipt(&self, message_id: &str, kind: ReceiptKind) -> Result<bool> {
        let (_, history) = self.history_of(message_id).await?;
        let messages = history.lock().await;
        let sending = messages
            .iter()
            .any(|m| m.id == message_id && m.status == MessageStatus::Sending);
        if sending {
            let mut early = self.early_receipts.lock().await;
            let held = early.entry(message_id.to_string()).or_insert(kind);
            if kind == ReceiptKind::Read {
                *held = ReceiptKind::Read;
            }
        }
        Ok(sending)
    }

    pub async fn has_early_receipt(&self, message_id: &str) -> bool {
        self.early_receipts.lock().await.contains_key(message_id)
    }

    pub async fn take_early_receipt(&self, message_id: &str) -> Option<ReceiptKind> {
        self.early_receipts.lock().await.remove(message_id)
    }

    /// Get paginated messages for a conversation, in chronological order.
    pub async fn messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Vec<Message> {
        let Some(history) = self.histories.lock().await.get(conversation_id).cloned() else {
            return Vec::new();
        };
        let messages = history.lock().await;
        let iter = messages.iter().rev();
        let filtered: Vec<_> = if let Some(before_ts) = before {
            iter.filter(|m| m.timestamp < before_ts)
                .take(limit)
                .cloned()
                .collect()
        } else {
            iter.take(limit).cloned().collect()
        };
        filtered.into_iter().rev().collect()
    }

    /// Every stored message, grouped by conversation in append order.
    pub async fn all(&self) -> Vec<Message> {
        let histories: Vec<History> = self.histories.lock().await.values().cloned().collect();
        let mut out = Vec::new();
        for history in histories {
            out.extend(history.lock().await.iter().cloned());
        }
        out
    }

    pub async fn count(&self) -> usize {
        self.index.lock().await.len()
    }

    async fn persist(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        storage::set_json(
            self.store.as_ref(),
            &storage::messages_key(conversation_id),
            messages,
        )
        .await
    }
}
