use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::error::{ChatError, Result};

/// Master key for records encrypted at rest.
///
/// Layout:
///   {base}/keys/master.secret  – 32-byte master key (file mode 0600)
pub struct KeyStore {
    key_path: PathBuf,
    master_key: Zeroizing<[u8; 32]>,
}

impl KeyStore {
    /// Load the master key, creating it if absent.
    pub fn new(base_dir: &Path) -> Result<Self> {
        let keys_dir = base_dir.join("keys");
        fs::create_dir_all(&keys_dir)
            .map_err(|e| ChatError::CryptoError(format!("create keys dir: {}", e)))?;

        let key_path = keys_dir.join("master.secret");
        let master_key = if key_path.exists() {
            let bytes = fs::read(&key_path)
                .map_err(|e| ChatError::CryptoError(format!("read master key: {}", e)))?;
            if bytes.len() != 32 {
                return Err(ChatError::CryptoError(
                    "Corrupt master key file".to_string(),
                ));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            Zeroizing::new(key)
        } else {
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            fs::write(&key_path, key)
                .map_err(|e| ChatError::CryptoError(format!("write master key: {}", e)))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
                    .map_err(|e| ChatError::CryptoError(format!("chmod master key: {}", e)))?;
            }
            log::info!("Created store master key at {:?}", key_path);
            Zeroizing::new(key)
        };

        Ok(Self {
            key_path,
            master_key,
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    // ── AES-256-GCM helpers ────────────────────────────────────

    /// Returns `nonce || ciphertext`.
    #[allow(deprecated)]
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(self.master_key.as_ref())
            .map_err(|e| ChatError::CryptoError(format!("AES init: {}", e)))?;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ChatError::CryptoError(format!("AES encrypt: {}", e)))?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    #[allow(deprecated)]
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 {
            return Err(ChatError::CryptoError("Ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(self.master_key.as_ref())
            .map_err(|e| ChatError::CryptoError(format!("AES init: {}", e)))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| ChatError::CryptoError(format!("AES decrypt: {}", e)))
    }
}
