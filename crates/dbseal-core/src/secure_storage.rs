//! Secret custody: sealing the PIN to the current OS user account.
//!
//! The PIN is never written to the config file in the clear. It is encrypted
//! under a wrapping key that only the OS credential store hands back, and the
//! credential store is scoped to the logged-in user. Copying the config file
//! to another machine or account yields bytes nobody can open.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{EncryptionError, Result};

const SERVICE_NAME: &str = "dbseal";
const WRAP_KEY_PREFIX: &str = "db_wrap_key";
const WRAP_KEY_LEN: usize = 32;
const WRAP_NONCE_LEN: usize = 12;

pub trait SecretCustody: Send + Sync {
    /// Must be checked before `seal`/`unseal`. Callers fail closed on `false`.
    fn is_available(&self) -> bool;

    fn seal(&self, secret: &str) -> Result<Vec<u8>>;

    fn unseal(&self, wrapped: &[u8]) -> Result<Zeroizing<String>>;
}

// ── OS keyring ──────────────────────────────────────────────────────────────

/// Custody backed by the platform credential store (Windows Credential
/// Manager, macOS Keychain, Secret Service on Linux).
pub struct KeyringCustody {
    account: String,
}

impl KeyringCustody {
    /// One wrapping key per database file, so two installations on the same
    /// account do not share key material.
    pub fn for_database(database_path: &Path) -> Self {
        let digest = Sha256::digest(database_path.to_string_lossy().as_bytes());
        Self {
            account: format!("{}:{}", WRAP_KEY_PREFIX, hex::encode(&digest[..8])),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account)
            .map_err(|e| EncryptionError::Custody(format!("keyring init: {e}")))
    }

    fn load_wrap_key(&self) -> Result<Option<Zeroizing<[u8; WRAP_KEY_LEN]>>> {
        let encoded = match self.entry()?.get_password() {
            Ok(encoded) => Zeroizing::new(encoded),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(EncryptionError::Custody(format!("load wrap key: {e}"))),
        };
        let decoded = Zeroizing::new(general_purpose::STANDARD.decode(encoded.as_bytes())?);
        if decoded.len() != WRAP_KEY_LEN {
            return Err(EncryptionError::Custody("wrap key length invalid".into()));
        }
        let mut key = Zeroizing::new([0u8; WRAP_KEY_LEN]);
        key.copy_from_slice(&decoded);
        Ok(Some(key))
    }

    fn load_or_create_wrap_key(&self) -> Result<Zeroizing<[u8; WRAP_KEY_LEN]>> {
        if let Some(key) = self.load_wrap_key()? {
            return Ok(key);
        }
        let mut key = Zeroizing::new([0u8; WRAP_KEY_LEN]);
        OsRng.fill_bytes(key.as_mut_slice());
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(key.as_slice()));
        self.entry()?
            .set_password(&encoded)
            .map_err(|e| EncryptionError::Custody(format!("store wrap key: {e}")))?;
        debug!(account = %self.account, "created keyring wrap key");
        Ok(key)
    }
}

impl SecretCustody for KeyringCustody {
    fn is_available(&self) -> bool {
        let entry = match self.entry() {
            Ok(entry) => entry,
            Err(e) => {
                warn!("keyring unavailable: {e}");
                return false;
            }
        };
        match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => true,
            Err(e) => {
                warn!("keyring unavailable: {e}");
                false
            }
        }
    }

    fn seal(&self, secret: &str) -> Result<Vec<u8>> {
        let key = self.load_or_create_wrap_key()?;
        seal_with_key(&key, secret)
    }

    fn unseal(&self, wrapped: &[u8]) -> Result<Zeroizing<String>> {
        // A missing wrap key means the secret was sealed elsewhere.
        let key = self
            .load_wrap_key()?
            .ok_or_else(|| EncryptionError::Custody("no wrap key for this account".into()))?;
        unseal_with_key(&key, wrapped)
    }
}

// ── In-memory fake ─────────────────────────────────────────────────────────

/// Deterministic custody for tests and headless runs. Two instances built
/// from the same account label can open each other's wrapped secrets; a
/// different label behaves like a different OS account.
pub struct MemoryCustody {
    key: Zeroizing<[u8; WRAP_KEY_LEN]>,
    available: bool,
}

impl MemoryCustody {
    pub fn new(account: &str) -> Self {
        let digest = Sha256::digest(account.as_bytes());
        let mut key = Zeroizing::new([0u8; WRAP_KEY_LEN]);
        key.copy_from_slice(&digest);
        Self {
            key,
            available: true,
        }
    }

    /// A custody facility that reports itself as missing.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new("")
        }
    }
}

impl SecretCustody for MemoryCustody {
    fn is_available(&self) -> bool {
        self.available
    }

    fn seal(&self, secret: &str) -> Result<Vec<u8>> {
        if !self.available {
            return Err(EncryptionError::CustodyUnavailable);
        }
        seal_with_key(&self.key, secret)
    }

    fn unseal(&self, wrapped: &[u8]) -> Result<Zeroizing<String>> {
        if !self.available {
            return Err(EncryptionError::CustodyUnavailable);
        }
        unseal_with_key(&self.key, wrapped)
    }
}

// ── Wrapping ───────────────────────────────────────────────────────────────

/// Wire format: [ nonce (12) | ciphertext + tag ]
fn seal_with_key(key: &[u8; WRAP_KEY_LEN], secret: &str) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
        .map_err(|_| EncryptionError::Custody("seal failed".into()))?;
    let mut out = Vec::with_capacity(WRAP_NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn unseal_with_key(key: &[u8; WRAP_KEY_LEN], wrapped: &[u8]) -> Result<Zeroizing<String>> {
    if wrapped.len() < WRAP_NONCE_LEN {
        return Err(EncryptionError::Custody("wrapped secret truncated".into()));
    }
    let (nonce, sealed) = wrapped.split_at(WRAP_NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| EncryptionError::Custody("wrapped secret cannot be opened".into()))?;
    String::from_utf8(plain)
        .map(Zeroizing::new)
        .map_err(|_| EncryptionError::Custody("wrapped secret is not UTF-8".into()))
}
