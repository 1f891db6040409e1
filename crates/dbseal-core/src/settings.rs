use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::crypto::SALT_LEN;
use crate::error::{EncryptionError, Result};
use crate::storage::write_atomic;

pub const CONFIG_FILE_NAME: &str = "db-encryption.json";

/// Durable record of whether the database is kept encrypted at rest.
///
/// Only two shapes are ever written: `{enabled: false}` and a complete
/// `{enabled: true, salt, encryptedPassphrase}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_passphrase: Option<String>,
}

impl EncryptionConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled_with(salt: &[u8; SALT_LEN], wrapped_secret: &[u8]) -> Self {
        Self {
            enabled: true,
            salt: Some(general_purpose::STANDARD.encode(salt)),
            encrypted_passphrase: Some(general_purpose::STANDARD.encode(wrapped_secret)),
        }
    }

    pub fn has_wrapped_secret(&self) -> bool {
        self.encrypted_passphrase
            .as_deref()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    pub fn salt_bytes(&self) -> Result<[u8; SALT_LEN]> {
        let encoded = self
            .salt
            .as_deref()
            .ok_or_else(|| EncryptionError::Unrecoverable("salt missing".into()))?;
        let decoded = general_purpose::STANDARD.decode(encoded)?;
        decoded
            .try_into()
            .map_err(|_| EncryptionError::Unrecoverable("salt length invalid".into()))
    }

    pub fn wrapped_secret(&self) -> Result<Vec<u8>> {
        let encoded = self
            .encrypted_passphrase
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EncryptionError::Unrecoverable("wrapped secret missing".into()))?;
        Ok(general_purpose::STANDARD.decode(encoded)?)
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing or damaged file reads as disabled.
    pub fn read(&self) -> EncryptionConfig {
        match self.try_read() {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %self.path.display(), "encryption config unreadable, treating as disabled: {e}");
                EncryptionConfig::disabled()
            }
        }
    }

    /// Strict read, distinguishing a missing file from a corrupt one.
    pub fn try_read(&self) -> Result<EncryptionConfig> {
        if !self.path.exists() {
            return Ok(EncryptionConfig::disabled());
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| EncryptionError::ConfigUnavailable(e.to_string()))
    }

    /// Replaces the whole file; nothing is merged.
    pub fn write(&self, cfg: &EncryptionConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(cfg)?;
        write_atomic(&self.path, json.as_bytes())
    }
}
