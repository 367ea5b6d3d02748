use chrono::Utc;
use std::sync::Arc;

use super::chat_directory::ConversationDirectory;
use super::chat_events::{ChatEvent, EventBus};
use super::chat_message_store::MessageStore;
use super::chat_types::{
    ChatMessageContent, Conversation, Message, MessageStatus, ReceiptKind, WireMessage,
};
use crate::crypto::{CryptoProvider, DeviceDirectory};
use crate::error::{ChatError, Result};

/// Turns inbound wire messages into conversation state.
///
/// Holds no reference to the transport, so the transport may own the handler
/// that wraps this pipeline.
pub struct InboundPipeline {
    directory: Arc<ConversationDirectory>,
    messages: Arc<MessageStore>,
    crypto: Arc<dyn CryptoProvider>,
    devices: Arc<dyn DeviceDirectory>,
    events: EventBus,
    max_message_size: usize,
}

impl InboundPipeline {
    pub fn new(
        directory: Arc<ConversationDirectory>,
        messages: Arc<MessageStore>,
        crypto: Arc<dyn CryptoProvider>,
        devices: Arc<dyn DeviceDirectory>,
        events: EventBus,
        max_message_size: usize,
    ) -> Self {
        Self {
            directory,
            messages,
            crypto,
            devices,
            events,
            max_message_size,
        }
    }

    /// Ingest one wire message. Re-delivery of a known id returns the stored
    /// message and has no side effects.
    ///
    /// On failure an `IngestFailed` event is published and nothing is created.
    pub async fn ingest(&self, wire: WireMessage) -> Result<Message> {
        match self.try_ingest(&wire).await {
            Ok(message) => Ok(message),
            Err(e) => {
                log::warn!("Dropping inbound message {}: {}", wire.message_id, e);
                self.events.publish(ChatEvent::IngestFailed {
                    message_id: wire.message_id.clone(),
                    error: (&e).into(),
                });
                Err(e)
            }
        }
    }

    async fn try_ingest(&self, wire: &WireMessage) -> Result<Message> {
        if self.messages.conversation_of(&wire.message_id).await.is_some() {
            log::debug!("Duplicate delivery of {}, ignoring", wire.message_id);
            return self.messages.get(&wire.message_id).await;
        }
        if wire.recipient_id != self.directory.local_device_id() {
            return Err(ChatError::MalformedMessage(format!(
                "addressed to {}",
                wire.recipient_id
            )));
        }

        let unsealed = self.crypto.unseal(&wire.payload).await?;
        if unsealed.sender_id.is_empty() {
            return Err(ChatError::MalformedMessage("missing sender".into()));
        }
        let body: ChatMessageContent = serde_json::from_slice(&unsealed.plaintext)
            .map_err(|e| ChatError::MalformedMessage(e.to_string()))?;
        if body.text.len() > self.max_message_size {
            return Err(ChatError::MessageTooLarge {
                size: body.text.len(),
                max: self.max_message_size,
            });
        }

        let conv = self.resolve_conversation(&unsealed.sender_id).await?;

        let message = Message {
            id: wire.message_id.clone(),
            conversation_id: conv.id.clone(),
            sender_id: unsealed.sender_id.clone(),
            recipient_id: wire.recipient_id.clone(),
            content: body.text,
            timestamp: body.sent_at,
            status: MessageStatus::Delivered,
            is_outgoing: false,
            sent_at: None,
            delivered_at: Some(Utc::now()),
            read_at: None,
            expiration: body.expiration,
        };

        // A concurrent delivery of the same id may have won the append.
        if !self.messages.append(message.clone()).await? {
            return self.messages.get(&message.id).await;
        }

        self.directory.touch(&conv.id, &message).await?;
        if !self.directory.is_active(&conv.id) {
            self.directory.increment_unread(&conv.id).await?;
        }

        log::info!(
            "Received message {} from {} in {}",
            message.id,
            message.sender_id,
            conv.id
        );
        self.events.publish(ChatEvent::MessageReceived {
            conversation_id: conv.id,
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
        });
        Ok(message)
    }

    /// Apply a delivery receipt to an outbound message.
    ///
    /// Returns `None` for stale or repeated receipts (e.g. `Delivered` after
    /// `Read`), and for a receipt that beat the local `Sent` commit: that one
    /// is held and applied once the send completes. Unknown ids are an error.
    pub async fn apply_receipt(&self, message_id: &str, kind: ReceiptKind) -> Result<Option<Message>> {
        let mut current = self.messages.get(message_id).await?;
        if !current.is_outgoing {
            return Err(ChatError::InvalidTransition {
                id: message_id.to_string(),
                from: current.status,
                to: receipt_status(kind),
            });
        }
        if current.status == MessageStatus::Sending {
            if self.messages.defer_receipt(message_id, kind).await? {
                log::debug!("Holding {:?} receipt for {} until its send commits", kind, message_id);
                return Ok(None);
            }
            current = self.messages.get(message_id).await?;
        }

        let target = receipt_status(kind);
        let stale = match current.status {
            MessageStatus::Read | MessageStatus::Expired => true,
            MessageStatus::Delivered => kind == ReceiptKind::Delivered,
            _ => false,
        };
        if stale {
            log::debug!("Ignoring stale {:?} receipt for {}", kind, message_id);
            return Ok(None);
        }

        let now = Utc::now();
        let events = &self.events;
        let updated = self
            .messages
            .transition_notify(
                message_id,
                target,
                |m| {
                    if m.delivered_at.is_none() {
                        m.delivered_at = Some(now);
                    }
                    if kind == ReceiptKind::Read {
                        m.read_at = Some(now);
                    }
                },
                |m| {
                    let conversation_id = m.conversation_id.clone();
                    let message_id = m.id.clone();
                    events.publish(match kind {
                        ReceiptKind::Delivered => ChatEvent::MessageDelivered {
                            conversation_id,
                            message_id,
                            at: now,
                        },
                        ReceiptKind::Read => ChatEvent::MessageRead {
                            conversation_id,
                            message_id,
                            at: now,
                        },
                    });
                },
            )
            .await?;
        Ok(Some(updated))
    }

    async fn resolve_conversation(&self, sender_id: &str) -> Result<Conversation> {
        if let Some(conv) = self.directory.find_by_peer(sender_id).await {
            return Ok(conv);
        }
        let keys = self
            .devices
            .lookup_public_keys(sender_id)
            .await?
            .ok_or_else(|| ChatError::PeerKeysUnavailable(sender_id.to_string()))?;
        self.directory.get_or_create(sender_id, Some(keys)).await
    }
}

fn receipt_status(kind: ReceiptKind) -> MessageStatus {
    match kind {
        ReceiptKind::Delivered => MessageStatus::Delivered,
        ReceiptKind::Read => MessageStatus::Read,
    }
}
