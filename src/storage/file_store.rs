use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::KvStore;
use crate::crypto::key_store::KeyStore;
use crate::error::{ChatError, Result};

/// One file per key under `{base}/{namespace}/`.
///
/// File names are the hex-encoded key so prefix listing can recover keys.
/// When a `KeyStore` is attached every record is AES-256-GCM encrypted.
pub struct FileStore {
    dir: PathBuf,
    key_store: Option<KeyStore>,
}

impl FileStore {
    pub fn open(base_dir: &Path, namespace: &str, encrypt_at_rest: bool) -> Result<Self> {
        let dir = base_dir.join(namespace);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ChatError::StorageError(format!("Create store dir: {}", e)))?;

        let key_store = if encrypt_at_rest {
            Some(KeyStore::new(base_dir)?)
        } else {
            None
        };

        log::info!(
            "Opened file store at {:?} (encrypted: {})",
            dir,
            key_store.is_some()
        );
        Ok(Self { dir, key_store })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.rec", hex::encode(key.as_bytes())))
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ChatError::StorageError(format!("Read {}: {}", key, e)));
            }
        };
        match &self.key_store {
            Some(ks) => Ok(Some(ks.decrypt(&data)?)),
            None => Ok(Some(data)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let data = match &self.key_store {
            Some(ks) => ks.encrypt(&value)?,
            None => value,
        };
        // Write then rename so a crash never leaves a torn record.
        let path = self.record_path(key);
        let tmp = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| ChatError::StorageError(format!("Write {}: {}", key, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ChatError::StorageError(format!("Commit {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatError::StorageError(format!("Delete {}: {}", key, e))),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(self.record_path(from), self.record_path(to))
            .await
            .map_err(|e| ChatError::StorageError(format!("Rename {} to {}: {}", from, to, e)))
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ChatError::StorageError(format!("List store dir: {}", e)))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".rec")) else {
                continue;
            };
            match hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => log::warn!("Skipping unrecognised record file {:?}", name),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
