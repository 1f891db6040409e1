//! dbseal-core: keeps an embedded database file encrypted at rest.
//!
//! # Module layout
//! - `crypto` PBKDF2-SHA256 key derivation, AES-256-GCM helpers
//! - `container` `<db>.enc` container codec
//! - `secure_storage` PIN custody through the OS credential store
//! - `settings` `db-encryption.json` config store
//! - `storage` atomic file replacement, staging cleanup
//! - `paths` data directory and derived file names
//! - `session` marker proving the plaintext came from the container
//! - `lifecycle` startup/shutdown hooks, enable/disable, PIN check
//! - `error` unified error type

pub mod container;
pub mod crypto;
pub mod error;
pub mod lifecycle;
pub mod paths;
pub mod secure_storage;
pub mod session;
pub mod settings;
pub mod storage;

pub use error::{EncryptionError, Result};
pub use lifecycle::{
    Controller, ControllerSettings, DisableOutcome, EnableOutcome, EncryptionStatus, SessionGuard,
    StorageState,
};
pub use secure_storage::{KeyringCustody, MemoryCustody, SecretCustody};
pub use settings::{ConfigStore, EncryptionConfig};
