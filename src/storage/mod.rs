//! Key-value persistence used by the directory, message store and queue.
//!
//! Records:
//!   conversation:{conversation_id}  – one `Conversation`
//!   messages:{conversation_id}      – the conversation's `Vec<Message>`
//!   outbox                          – the outbound queue snapshot
//!   quarantine:{key}:{time}         – an unreadable record set aside on load

pub mod file_store;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::{ChatError, Result};

pub use file_store::FileStore;

pub const CONVERSATION_PREFIX: &str = "conversation:";
pub const MESSAGES_PREFIX: &str = "messages:";
pub const OUTBOX_KEY: &str = "outbox";
pub const QUARANTINE_PREFIX: &str = "quarantine:";

pub fn conversation_key(conversation_id: &str) -> String {
    format!("{}{}", CONVERSATION_PREFIX, conversation_id)
}

pub fn messages_key(conversation_id: &str) -> String {
    format!("{}{}", MESSAGES_PREFIX, conversation_id)
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Move the record at `from` to `to`, replacing anything at `to`.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ChatError::StorageError(format!("Parse {}: {}", key, e))),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| ChatError::StorageError(format!("Serialize {}: {}", key, e)))?;
    store.set(key, bytes).await
}

/// Move an unreadable record out of the way so no later write can replace
/// it. The bytes are kept as-is under the returned key.
pub async fn quarantine(store: &dyn KvStore, key: &str) -> Result<String> {
    let target = format!(
        "{}{}:{}",
        QUARANTINE_PREFIX,
        key,
        Utc::now().format("%Y%m%dT%H%M%S%.6f")
    );
    store.rename(key, &target).await?;
    Ok(target)
}

/// Volatile store, mainly for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let value = entries
            .remove(from)
            .ok_or_else(|| ChatError::StorageError(format!("Rename {}: no such record", from)))?;
        entries.insert(to.to_string(), value);
        Ok(())
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
