use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::chat_types::MessageStatus;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transport timed out after {0}s")]
    Timeout(u64),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Public keys unavailable for peer {0}")]
    PeerKeysUnavailable(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Invalid transition for message {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("Message {0} has a send attempt in flight")]
    MessageInFlight(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No async runtime: {0}")]
    RuntimeUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse classification carried on events so observers can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Transport,
    Timeout,
    Crypto,
    PeerKeysUnavailable,
    MalformedMessage,
    MessageTooLarge,
    Storage,
    NotFound,
    InvalidTransition,
    InFlight,
    Config,
    Runtime,
}

impl ErrorKind {
    /// Errors the outbound queue retries on the next drain. A send that fails
    /// with any other kind cannot succeed by retrying and is expired at once.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Transport
                | ErrorKind::Timeout
                | ErrorKind::Crypto
                | ErrorKind::PeerKeysUnavailable
                | ErrorKind::Storage
        )
    }
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::TransportError(_) => ErrorKind::Transport,
            ChatError::Timeout(_) => ErrorKind::Timeout,
            ChatError::CryptoError(_) => ErrorKind::Crypto,
            ChatError::PeerKeysUnavailable(_) => ErrorKind::PeerKeysUnavailable,
            ChatError::MalformedMessage(_) | ChatError::Json(_) => ErrorKind::MalformedMessage,
            ChatError::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            ChatError::StorageError(_) | ChatError::Io(_) => ErrorKind::Storage,
            ChatError::MessageNotFound(_) | ChatError::ConversationNotFound(_) => {
                ErrorKind::NotFound
            }
            ChatError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            ChatError::MessageInFlight(_) => ErrorKind::InFlight,
            ChatError::ConfigError(_) => ErrorKind::Config,
            ChatError::RuntimeUnavailable(_) => ErrorKind::Runtime,
        }
    }
}

impl From<config::ConfigError> for ChatError {
    fn from(e: config::ConfigError) -> Self {
        ChatError::ConfigError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
