use std::sync::Arc;

use crate::crypto::{CryptoProvider, DeviceDirectory};
use crate::error::Result;
use crate::services::{AppConfig, ChatService, ConfigService, Transport};
use crate::storage::{FileStore, KvStore};

/// Application-owned engine state. Built once by the host app and passed
/// wherever chat is needed.
pub struct ChatState {
    pub config: AppConfig,
    pub store: Arc<dyn KvStore>,
    pub chat: ChatService,
}

impl ChatState {
    /// Open the file store described by `config` and the engine on top of it.
    pub async fn new(
        config: AppConfig,
        local_device_id: String,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        log::info!(
            "Initializing chat state: data_dir={:?}, namespace={}, encrypted={}",
            config.storage.data_dir,
            config.storage.namespace,
            config.storage.encrypt_at_rest
        );

        let store: Arc<dyn KvStore> = Arc::new(FileStore::open(
            &config.storage.data_dir,
            &config.storage.namespace,
            config.storage.encrypt_at_rest,
        )?);
        Self::with_store(config, store, local_device_id, transport, crypto, devices).await
    }

    /// Same as `new` with a caller-provided store.
    pub async fn with_store(
        config: AppConfig,
        store: Arc<dyn KvStore>,
        local_device_id: String,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> Result<Self> {
        let chat = ChatService::open(
            local_device_id,
            config.chat.clone(),
            store.clone(),
            transport,
            crypto,
            devices,
        )
        .await?;
        Ok(Self {
            config,
            store,
            chat,
        })
    }

    /// Load configuration from the default location, then build the state.
    pub async fn from_config_file(
        local_device_id: String,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> Result<Self> {
        let config = ConfigService::new()?.get().clone();
        Self::new(config, local_device_id, transport, crypto, devices).await
    }

    /// Start background delivery and inbound handling. Needs a running tokio
    /// runtime.
    pub fn init(&self) -> Result<()> {
        self.chat.start()
    }

    pub async fn dispose(&self) {
        self.chat.dispose().await;
        log::info!("Chat state disposed");
    }
}
