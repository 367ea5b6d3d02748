// Service layer - trait-based seams to transport, crypto and storage

pub mod chat_delivery_queue;
pub mod chat_directory;
pub mod chat_events;
pub mod chat_ingest;
pub mod chat_message_store;
pub mod chat_service;
pub mod chat_transport;
pub mod chat_types;
pub mod config;

pub use chat_directory::ConversationDirectory;
pub use chat_events::{ChatEvent, EventBus, EventError, ExpireReason, Subscription};
pub use chat_service::{ChatIncomingAdapter, ChatService, DrainReport};
pub use chat_transport::{IncomingHandler, InboundHandler, Transport};
pub use config::{AppConfig, ChatSettings, ConfigService, StorageSettings};
