//! Lifecycle controller for the encrypted-at-rest database.
//!
//! The host calls [`Controller::ensure_decrypted`] once before its database
//! engine opens the file and [`Controller::ensure_encrypted_on_exit`] once
//! after the engine has closed it. Neither hook returns an error: failures are
//! logged and the files on disk are left as they are, so the host can always
//! start and stop.
//!
//! At every crash point at least one complete copy of the data (plaintext or
//! container plus the config able to open it) survives on disk. A plaintext
//! replaces the container only while the session marker records that it was
//! decrypted from that container; any other plaintext is set aside, never
//! sealed over the container.

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::container::{decrypt_file, encrypt_file, read_container};
use crate::crypto::{constant_time_eq, derive_key, generate_salt, DerivedKey};
use crate::error::{EncryptionError, Result};
use crate::paths::{container_path_for, displaced_path_for, unrecoverable_path_for};
use crate::secure_storage::SecretCustody;
use crate::session::{SessionMarker, SessionPhase};
use crate::settings::{ConfigStore, EncryptionConfig, CONFIG_FILE_NAME};
use crate::storage::{cleanup_staging, remove_if_exists, write_atomic};

pub const MIN_PIN_LEN: usize = 4;

/// Host-supplied locations. Nothing is discovered from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub database_path: PathBuf,
    pub config_path: PathBuf,
}

impl ControllerSettings {
    pub fn new(database_path: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            config_path: config_path.into(),
        }
    }

    /// Database and `db-encryption.json` side by side in `data_dir`.
    pub fn in_data_dir(data_dir: &Path, db_file_name: &str) -> Self {
        Self::new(data_dir.join(db_file_name), data_dir.join(CONFIG_FILE_NAME))
    }

    pub fn container_path(&self) -> PathBuf {
        container_path_for(&self.database_path)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionStatus {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnableOutcome {
    pub enabled: bool,
    /// The host must relaunch before touching the database again.
    pub restart_required: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisableOutcome {
    pub enabled: bool,
    /// A plaintext database decrypted from the container is in place and the
    /// container is gone.
    pub restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abandoned_container: Option<PathBuf>,
    /// A plaintext that did not come from the container, moved out of the way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displaced_plaintext: Option<PathBuf>,
}

/// Observed from disk, the config and the session marker, so every process
/// sees the same answer.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageState {
    Unmanaged,
    EncryptedAtRest,
    DecryptedInUse,
    /// Plaintext and container both on disk outside an open session: a
    /// shutdown interrupted between encrypt and delete, or a plaintext that
    /// never came from the container.
    TransientBoth,
    /// Enabled, but neither the container nor a plaintext exists.
    Missing,
}

pub struct Controller {
    settings: ControllerSettings,
    store: ConfigStore,
    marker: SessionMarker,
    custody: Box<dyn SecretCustody>,
}

impl Controller {
    pub fn new(settings: ControllerSettings, custody: impl SecretCustody + 'static) -> Self {
        let store = ConfigStore::new(settings.config_path.clone());
        let marker = SessionMarker::for_database(&settings.database_path);
        Self {
            settings,
            store,
            marker,
            custody: Box::new(custody),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn session_marker(&self) -> &SessionMarker {
        &self.marker
    }

    pub fn status(&self) -> EncryptionStatus {
        EncryptionStatus {
            enabled: self.store.read().enabled,
        }
    }

    pub fn state(&self) -> StorageState {
        if !self.store.read().enabled {
            return StorageState::Unmanaged;
        }
        let plain = self.settings.database_path.exists();
        let container = self.settings.container_path().exists();
        match (plain, container) {
            (true, true) => match self.marker.read().map(|r| r.phase) {
                Some(SessionPhase::Open) => StorageState::DecryptedInUse,
                _ => StorageState::TransientBoth,
            },
            (true, false) => StorageState::DecryptedInUse,
            (false, true) => StorageState::EncryptedAtRest,
            (false, false) => StorageState::Missing,
        }
    }

    // ── Lifecycle hooks ─────────────────────────────────────────────────────

    /// Startup hook. Call before the database engine opens anything.
    pub fn ensure_decrypted(&self) -> EncryptionStatus {
        match self.try_ensure_decrypted() {
            Ok(status) => status,
            Err(e) => {
                error!(
                    db = %self.settings.database_path.display(),
                    "database decrypt failed, leaving files untouched: {e}"
                );
                EncryptionStatus { enabled: false }
            }
        }
    }

    /// Shutdown hook. Call after the database engine has closed the file.
    /// Runs to completion; there is no cancellation point.
    pub fn ensure_encrypted_on_exit(&self) {
        if let Err(e) = self.try_ensure_encrypted_on_exit() {
            error!(
                db = %self.settings.database_path.display(),
                "database encrypt on exit failed: {e}"
            );
        }
    }

    /// Runs the startup hook now and the shutdown hook when the guard drops.
    pub fn open_session(&self) -> SessionGuard<'_> {
        let status = self.ensure_decrypted();
        SessionGuard {
            controller: self,
            status,
        }
    }

    fn try_ensure_decrypted(&self) -> Result<EncryptionStatus> {
        let plain = &self.settings.database_path;
        cleanup_staging(plain);
        cleanup_staging(&self.settings.config_path);
        cleanup_staging(self.marker.path());

        let cfg = self.store.read();
        if !cfg.enabled {
            return Ok(EncryptionStatus { enabled: false });
        }
        if !plain.exists() {
            // Whatever the engine creates after this point did not come from
            // the container.
            self.marker.clear()?;
        }
        if !self.custody.is_available() {
            warn!("database encryption enabled but OS secret storage is unavailable; skipping decrypt");
            return Ok(EncryptionStatus { enabled: false });
        }
        if !cfg.has_wrapped_secret() {
            warn!("database encryption enabled but no wrapped secret is recorded; skipping decrypt");
            return Ok(EncryptionStatus { enabled: false });
        }

        let container = self.settings.container_path();
        if plain.exists() && (self.marker.is_present() || !container.exists()) {
            // Previous run ended before re-encrypting; this copy is the newest.
            info!(db = %plain.display(), "plaintext database already present, keeping it");
            self.marker.write(SessionPhase::Open)?;
            return Ok(EncryptionStatus { enabled: true });
        }
        if !container.exists() {
            warn!(container = %container.display(), "database encryption enabled but container is missing");
            return Ok(EncryptionStatus { enabled: false });
        }

        let restored = self.open_container(&cfg, &container)?;
        if plain.exists() {
            self.displace_unless_identical(&restored)?;
        }
        write_atomic(plain, &restored)?;
        self.marker.write(SessionPhase::Open)?;
        info!(db = %plain.display(), "database decrypted for this session");
        Ok(EncryptionStatus { enabled: true })
    }

    fn try_ensure_encrypted_on_exit(&self) -> Result<()> {
        let cfg = self.store.read();
        if !cfg.enabled {
            return Ok(());
        }
        let plain = &self.settings.database_path;
        if !plain.exists() {
            debug!("no plaintext database on exit, nothing to encrypt");
            self.marker.clear()?;
            return Ok(());
        }
        if !self.custody.is_available() || !cfg.has_wrapped_secret() {
            warn!(
                db = %plain.display(),
                "cannot seal database on exit; plaintext left on disk until the next clean shutdown"
            );
            return Ok(());
        }
        let container = self.settings.container_path();
        if container.exists() && !self.marker.is_present() {
            return Err(EncryptionError::Unrecoverable(format!(
                "{} was not decrypted from {}; refusing to seal it over the container",
                plain.display(),
                container.display()
            )));
        }

        let key = self.key_from_config(&cfg)?;
        self.marker.write(SessionPhase::Sealing)?;
        // Encrypt before delete: a crash in between leaves both files plus
        // the marker, which startup resolves in favour of the plaintext.
        encrypt_file(plain, &container, &key)?;
        remove_if_exists(plain)?;
        self.marker.clear()?;
        info!(db = %plain.display(), "database encrypted at rest");
        Ok(())
    }

    // ── User operations ─────────────────────────────────────────────────────

    pub fn enable(&self, pin: &str) -> Result<EnableOutcome> {
        if pin.chars().count() < MIN_PIN_LEN {
            return Err(EncryptionError::InvalidPin);
        }
        if !self.custody.is_available() {
            return Err(EncryptionError::CustodyUnavailable);
        }
        let plain = &self.settings.database_path;
        let container = self.settings.container_path();
        let previous = self.store.read();

        if container.exists() {
            if !previous.enabled {
                return Err(EncryptionError::Unrecoverable(format!(
                    "{} exists but no encryption config describes it; refusing to overwrite",
                    container.display()
                )));
            }
            if !plain.exists() {
                // Changing the PIN while at rest: materialize under the old key first.
                let restored = self.open_container(&previous, &container)?;
                write_atomic(plain, &restored)?;
                info!("re-keying existing container");
            } else if !self.marker.is_present() {
                return Err(EncryptionError::Unrecoverable(format!(
                    "{} was not decrypted from {}; run the startup hook or disable first",
                    plain.display(),
                    container.display()
                )));
            }
        }

        let wrapped = self.custody.seal(pin)?;
        let salt = generate_salt();
        let key = derive_key(pin, &salt);

        if !plain.exists() {
            write_atomic(plain, &[])?;
            info!(db = %plain.display(), "created empty database before enabling encryption");
        }
        encrypt_file(plain, &container, &key)?;
        // Config before delete: the container is never on disk alone with a
        // config that cannot open it.
        self.store
            .write(&EncryptionConfig::enabled_with(&salt, &wrapped))?;
        remove_if_exists(plain)?;
        self.marker.clear()?;

        info!(container = %container.display(), "database encryption enabled, restart required");
        Ok(EnableOutcome {
            enabled: true,
            restart_required: true,
        })
    }

    /// Always ends with `{enabled: false}` written unless the disk itself
    /// fails. The container is removed only when the plaintext in place came
    /// from it; one that cannot be opened is moved aside with a copy of its
    /// config, never deleted.
    pub fn disable(&self) -> Result<DisableOutcome> {
        let cfg = self.store.read();
        let plain = &self.settings.database_path;
        let container = self.settings.container_path();
        let mut outcome = DisableOutcome {
            enabled: false,
            restored: false,
            abandoned_container: None,
            displaced_plaintext: None,
        };

        if cfg.enabled && container.exists() {
            if plain.exists() && self.marker.is_present() {
                remove_if_exists(&container)?;
                outcome.restored = true;
            } else {
                match self.open_container(&cfg, &container) {
                    Ok(restored) => {
                        if plain.exists() {
                            outcome.displaced_plaintext = self.displace_unless_identical(&restored)?;
                        }
                        write_atomic(plain, &restored)?;
                        remove_if_exists(&container)?;
                        outcome.restored = true;
                    }
                    Err(e @ EncryptionError::Io(_)) => return Err(e),
                    Err(e) => {
                        warn!(container = %container.display(), "container cannot be decrypted, moving it aside: {e}");
                        outcome.abandoned_container = Some(self.abandon_container(&container, &cfg)?);
                    }
                }
            }
        }

        self.marker.clear()?;
        self.store.write(&EncryptionConfig::disabled())?;
        info!(restored = outcome.restored, "database encryption disabled");
        Ok(outcome)
    }

    /// Compares against the sealed PIN. A mismatch is `Ok(false)`.
    pub fn verify_pin(&self, pin: &str) -> Result<bool> {
        let cfg = self.store.read();
        if !cfg.enabled || !cfg.has_wrapped_secret() {
            return Ok(false);
        }
        if !self.custody.is_available() {
            return Err(EncryptionError::CustodyUnavailable);
        }
        let stored = self.custody.unseal(&cfg.wrapped_secret()?)?;
        Ok(constant_time_eq(stored.as_bytes(), pin.as_bytes()))
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    /// Unseal and derive. The key lives only as long as the caller's borrow.
    fn key_from_config(&self, cfg: &EncryptionConfig) -> Result<DerivedKey> {
        if !self.custody.is_available() {
            return Err(EncryptionError::CustodyUnavailable);
        }
        let wrapped = cfg.wrapped_secret()?;
        let salt = cfg.salt_bytes()?;
        let pin = self.custody.unseal(&wrapped)?;
        Ok(derive_key(&pin, &salt))
    }

    /// Header first, key second: a container with a bad header never causes
    /// an unseal or a derivation.
    fn open_container(&self, cfg: &EncryptionConfig, container: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let sealed = read_container(container)?;
        let key = self.key_from_config(cfg)?;
        sealed.open(&key)
    }

    /// Moves the current plaintext to `<db>.displaced-<stamp>` unless it
    /// already holds `restored`.
    fn displace_unless_identical(&self, restored: &[u8]) -> Result<Option<PathBuf>> {
        let plain = &self.settings.database_path;
        let current = Zeroizing::new(fs::read(plain)?);
        if current.as_slice() == restored {
            return Ok(None);
        }
        let dest = displaced_path_for(plain, &timestamp());
        fs::rename(plain, &dest)?;
        warn!(path = %dest.display(), "plaintext did not come from the container, set aside");
        Ok(Some(dest))
    }

    fn abandon_container(&self, container: &Path, cfg: &EncryptionConfig) -> Result<PathBuf> {
        let dest = unrecoverable_path_for(container, &timestamp());
        ConfigStore::new(record_path_for(&dest)).write(cfg)?;
        fs::rename(container, &dest)?;
        warn!(path = %dest.display(), "container abandoned");
        Ok(dest)
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Scope-bound session: decrypted on creation, sealed again on drop, including
/// during unwinding.
pub struct SessionGuard<'a> {
    controller: &'a Controller,
    status: EncryptionStatus,
}

impl SessionGuard<'_> {
    pub fn status(&self) -> EncryptionStatus {
        self.status
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.controller.ensure_encrypted_on_exit();
    }
}

/// Config copy kept next to an abandoned container.
pub fn record_path_for(abandoned_container: &Path) -> PathBuf {
    let mut name = abandoned_container.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Open an abandoned container with the PIN the user still remembers. The
/// salt comes from the config copy saved beside it. `dest` must not exist.
pub fn recover_abandoned(abandoned_container: &Path, pin: &str, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", dest.display()),
        )
        .into());
    }
    let record = ConfigStore::new(record_path_for(abandoned_container)).try_read()?;
    let salt = record.salt_bytes()?;
    let key = derive_key(pin, &salt);
    decrypt_file(abandoned_container, dest, &key)?;
    info!(dest = %dest.display(), "abandoned container recovered");
    Ok(())
}
