pub mod crypto;
pub mod error;
pub mod services;
pub mod state;
pub mod storage;

pub use crypto::{CryptoProvider, DeviceDirectory, DevicePublicKeys, SealContext, Unsealed};
pub use error::{ChatError, ErrorKind, Result};
pub use services::chat_types::{
    ChatMessageContent, Conversation, ConversationId, DeviceId, ExpirationMode, ExpirationPolicy,
    LastMessage, Message, MessageId, MessageStatus, ReceiptKind, WireMessage,
};
pub use services::{
    AppConfig, ChatEvent, ChatService, ChatSettings, ConfigService, DrainReport, EventBus,
    EventError, ExpireReason, InboundHandler, IncomingHandler, StorageSettings, Subscription,
    Transport,
};
pub use state::ChatState;
pub use storage::{FileStore, KvStore, MemoryStore};

/// Install the `env_logger` backend (default level `info`, `RUST_LOG` wins).
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
