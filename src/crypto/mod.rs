//! Seams to the external cryptography module.
//!
//! Sealing, ratcheting and key distribution live outside this crate; the
//! engine only sees sealed bytes and opaque key material.

pub mod key_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::services::chat_types::{ConversationId, DeviceId};

/// Public key material for a peer device. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePublicKeys {
    pub identity_key: String,
    pub signing_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key_bundle: Option<String>,
}

/// Everything the crypto provider needs to seal one outbound message.
#[derive(Debug, Clone)]
pub struct SealContext {
    pub conversation_id: ConversationId,
    pub local_device_id: DeviceId,
    pub peer_id: DeviceId,
    pub peer_keys: DevicePublicKeys,
}

/// Result of unsealing an inbound payload.
#[derive(Debug, Clone)]
pub struct Unsealed {
    pub sender_id: DeviceId,
    pub plaintext: Vec<u8>,
}

/// Sealed-sender envelope + ratchet encryption.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    async fn seal(&self, context: &SealContext, plaintext: &[u8]) -> Result<Vec<u8>>;
    async fn unseal(&self, payload: &[u8]) -> Result<Unsealed>;
}

/// Device directory lookups. `Ok(None)` means the device is unknown.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn lookup_public_keys(&self, device_id: &str) -> Result<Option<DevicePublicKeys>>;
}
