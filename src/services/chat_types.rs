use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::DevicePublicKeys;

pub type DeviceId = String;
pub type ConversationId = String;
pub type MessageId = String;

// ── Wire protocol types ────────────────────────────────────────

/// Transport-ready message. `payload` is opaque sealed bytes produced by the
/// crypto provider; the sender is only known after unsealing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub message_id: MessageId,
    pub recipient_id: DeviceId,
    pub payload: Vec<u8>,
}

/// Plaintext message body (serialized before sealing).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageContent {
    pub text: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<ExpirationPolicy>,
}

/// Delivery acknowledgment kinds reported back by the recipient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

// ── Stored types ───────────────────────────────────────────────

/// Message lifecycle status.
///
/// Outbound: `Pending -> Sending -> Sent`, with `Sending -> Failed -> Sending`
/// on retry. Receipts move `Sent -> Delivered -> Read`. Inbound messages are
/// created `Delivered`. `Expired` is final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sending)
                | (Pending, Expired)
                | (Sending, Sent)
                | (Sending, Failed)
                | (Failed, Sending)
                | (Failed, Expired)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Delivered, Read)
                | (Sent, Expired)
                | (Delivered, Expired)
                | (Read, Expired)
        )
    }

    /// Statuses a drain pass may claim.
    pub fn is_sendable(self) -> bool {
        matches!(self, MessageStatus::Pending | MessageStatus::Failed)
    }

    /// Statuses that keep a message in the outbound queue.
    pub fn is_queued(self) -> bool {
        matches!(
            self,
            MessageStatus::Pending | MessageStatus::Sending | MessageStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExpirationMode {
    /// Expires `duration` after the message timestamp.
    Timer,
    /// Expires `duration` after the message was read.
    AfterRead,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationPolicy {
    pub mode: ExpirationMode,
    pub duration_secs: u64,
}

impl ExpirationPolicy {
    pub fn timer(duration_secs: u64) -> Self {
        Self {
            mode: ExpirationMode::Timer,
            duration_secs,
        }
    }

    pub fn after_read(duration_secs: u64) -> Self {
        Self {
            mode: ExpirationMode::AfterRead,
            duration_secs,
        }
    }
}

/// A stored message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: DeviceId,
    pub recipient_id: DeviceId,
    pub content: String,
    /// Creation time for outbound, the sender's claimed time for inbound.
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub is_outgoing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<ExpirationPolicy>,
}

impl Message {
    /// Time used for conversation ordering. Inbound messages use the local
    /// ingestion time rather than the sender's clock.
    pub fn activity_at(&self) -> DateTime<Utc> {
        if self.is_outgoing {
            self.timestamp
        } else {
            self.delivered_at.unwrap_or(self.timestamp)
        }
    }

    /// When the expiration policy (if any) takes effect.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let policy = self.expiration?;
        let ttl = Duration::try_seconds(i64::try_from(policy.duration_secs).ok()?)?;
        let anchor = match policy.mode {
            ExpirationMode::Timer => self.timestamp,
            ExpirationMode::AfterRead => self.read_at?,
        };
        anchor.checked_add_signed(ttl)
    }
}

/// Reference to the newest message of a conversation, for list previews.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub message_id: MessageId,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

/// A direct conversation with one peer device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub peer_id: DeviceId,
    pub peer_keys: DevicePublicKeys,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
}
