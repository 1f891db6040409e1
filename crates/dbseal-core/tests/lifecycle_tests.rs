//! End-to-end tests for the encryption lifecycle.
//!
//! Tests cover:
//!  1. Enable on a fresh install, then restart
//!  2. Enable with existing data, then restart
//!  3. Wrong PIN cannot open the container
//!  4. Interrupted shutdown keeps the newest plaintext
//!  5. Disable: idempotent, restoring, in-use, escape hatch
//!  6. Fail-closed custody
//!  7. PIN verification and PIN change at rest
//!  8. Session guard
//!  9. Plaintext the engine created after a failed startup

use dbseal_core::container::{decrypt_file, encrypt_file, ContainerHeader};
use dbseal_core::crypto::derive_key;
use dbseal_core::lifecycle::recover_abandoned;
use dbseal_core::session::SessionPhase;
use dbseal_core::{
    Controller, ControllerSettings, EncryptionConfig, EncryptionError, EncryptionStatus,
    MemoryCustody, SecretCustody, StorageState,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use zeroize::Zeroizing;

const ACCOUNT: &str = "clinician";

fn settings(dir: &Path) -> ControllerSettings {
    ControllerSettings::in_data_dir(dir, "records.db")
}

/// A fresh controller over the same files, as after an application restart.
fn restart(dir: &TempDir) -> Controller {
    Controller::new(settings(dir.path()), MemoryCustody::new(ACCOUNT))
}

fn read_config(ctl: &Controller) -> serde_json::Value {
    let raw = fs::read_to_string(&ctl.settings().config_path).unwrap();
    serde_json::from_str(&raw).unwrap()
}

// ─── 1-2: Enable ────────────────────────────────────────────────────────────

#[test]
fn enable_on_fresh_install_then_restart_yields_empty_database() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    let enc = ctl.settings().container_path();
    assert!(!db.exists());

    let outcome = ctl.enable("1234").unwrap();
    assert!(outcome.enabled);
    assert!(outcome.restart_required);
    assert!(enc.exists());
    assert!(!db.exists());
    assert_eq!(ctl.state(), StorageState::EncryptedAtRest);

    let cfg = read_config(&ctl);
    assert_eq!(cfg["enabled"], true);
    assert!(cfg["salt"].is_string());
    assert!(cfg["encryptedPassphrase"].is_string());

    let ctl = restart(&dir);
    assert_eq!(ctl.ensure_decrypted(), EncryptionStatus { enabled: true });
    assert!(db.exists());
    assert_eq!(fs::metadata(&db).unwrap().len(), 0);
    assert_eq!(ctl.state(), StorageState::DecryptedInUse);
}

#[test]
fn enable_with_existing_data_then_restart_restores_it() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"SQLite format 3\0patients").unwrap();

    ctl.enable("2468").unwrap();
    assert!(!db.exists());
    let sealed = fs::read(ctl.settings().container_path()).unwrap();
    assert!(!sealed.windows(8).any(|w| w == b"patients"));

    let ctl = restart(&dir);
    ctl.ensure_decrypted();
    assert_eq!(fs::read(&db).unwrap(), b"SQLite format 3\0patients");

    ctl.ensure_encrypted_on_exit();
    assert!(!db.exists());
    assert_eq!(ctl.state(), StorageState::EncryptedAtRest);
}

#[test]
fn every_enable_uses_a_fresh_salt() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    ctl.enable("1234").unwrap();
    let first = read_config(&ctl)["salt"].clone();

    ctl.ensure_decrypted();
    ctl.enable("1234").unwrap();
    let second = read_config(&ctl)["salt"].clone();
    assert_ne!(first, second);
}

// ─── 3: Wrong PIN ───────────────────────────────────────────────────────────

#[test]
fn wrong_pin_key_fails_with_integrity_error() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    fs::write(&ctl.settings().database_path, b"notes").unwrap();
    ctl.enable("1234").unwrap();

    let salt = ctl.config_store().read().salt_bytes().unwrap();
    let wrong = derive_key("9999", &salt);
    let out = dir.path().join("attempt.db");
    let err = decrypt_file(&ctl.settings().container_path(), &out, &wrong).unwrap_err();
    assert!(matches!(err, EncryptionError::Integrity));
    assert!(!out.exists());

    let right = derive_key("1234", &salt);
    decrypt_file(&ctl.settings().container_path(), &out, &right).unwrap();
    assert_eq!(fs::read(&out).unwrap(), b"notes");
}

// ─── 4: Crash safety ────────────────────────────────────────────────────────

#[test]
fn shutdown_interrupted_after_encrypt_keeps_plaintext() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    let enc = ctl.settings().container_path();
    fs::write(&db, b"v1").unwrap();
    ctl.enable("1234").unwrap();

    let ctl = restart(&dir);
    ctl.ensure_decrypted();
    fs::write(&db, b"v2").unwrap();

    // The shutdown hook got as far as writing the container, then died.
    let salt = ctl.config_store().read().salt_bytes().unwrap();
    ctl.session_marker().write(SessionPhase::Sealing).unwrap();
    encrypt_file(&db, &enc, &derive_key("1234", &salt)).unwrap();

    let ctl = restart(&dir);
    assert_eq!(ctl.state(), StorageState::TransientBoth);
    assert_eq!(ctl.ensure_decrypted(), EncryptionStatus { enabled: true });
    assert_eq!(fs::read(&db).unwrap(), b"v2");

    ctl.ensure_encrypted_on_exit();
    assert!(!db.exists());
    let ctl = restart(&dir);
    ctl.ensure_decrypted();
    assert_eq!(fs::read(&db).unwrap(), b"v2");
}

#[test]
fn killed_session_prefers_plaintext_over_stale_container() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"v1").unwrap();
    ctl.enable("1234").unwrap();

    let ctl = restart(&dir);
    ctl.ensure_decrypted();
    fs::write(&db, b"v1 plus today's appointments").unwrap();
    drop(ctl); // killed: no shutdown hook

    let ctl = restart(&dir);
    ctl.ensure_decrypted();
    assert_eq!(fs::read(&db).unwrap(), b"v1 plus today's appointments");
    ctl.ensure_encrypted_on_exit();

    let ctl = restart(&dir);
    ctl.ensure_decrypted();
    assert_eq!(fs::read(&db).unwrap(), b"v1 plus today's appointments");
}

#[test]
fn startup_removes_orphaned_staging_files() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let orphan = dir.path().join("records.db.enc.0000.staging");
    fs::write(&orphan, b"half a container").unwrap();
    ctl.ensure_decrypted();
    assert!(!orphan.exists());
}

#[test]
fn tampered_container_does_not_break_startup() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    fs::write(&ctl.settings().database_path, b"records").unwrap();
    ctl.enable("1234").unwrap();

    let enc = ctl.settings().container_path();
    let mut bytes = fs::read(&enc).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&enc, &bytes).unwrap();

    let ctl = restart(&dir);
    assert_eq!(ctl.ensure_decrypted(), EncryptionStatus { enabled: false });
    assert!(!ctl.settings().database_path.exists());
    assert_eq!(fs::read(&enc).unwrap(), bytes);
}

#[test]
fn corrupt_config_is_treated_as_disabled() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    fs::write(&ctl.settings().config_path, b"not json at all").unwrap();
    fs::write(&ctl.settings().database_path, b"plain").unwrap();

    assert!(!ctl.status().enabled);
    assert_eq!(ctl.ensure_decrypted(), EncryptionStatus { enabled: false });
    ctl.ensure_encrypted_on_exit();
    assert_eq!(fs::read(&ctl.settings().database_path).unwrap(), b"plain");
}

// ─── 5: Disable ─────────────────────────────────────────────────────────────

#[test]
fn disable_when_already_disabled_still_writes_config() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    for _ in 0..2 {
        let outcome = ctl.disable().unwrap();
        assert!(!outcome.enabled);
        assert!(!outcome.restored);
        assert_eq!(read_config(&ctl), serde_json::json!({ "enabled": false }));
    }
}

#[test]
fn disable_at_rest_decrypts_and_removes_container() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"history").unwrap();
    ctl.enable("1234").unwrap();

    let outcome = ctl.disable().unwrap();
    assert!(outcome.restored);
    assert_eq!(fs::read(&db).unwrap(), b"history");
    assert!(!ctl.settings().container_path().exists());
    assert_eq!(ctl.state(), StorageState::Unmanaged);
}

#[test]
fn disable_in_use_keeps_live_plaintext() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"old").unwrap();
    ctl.enable("1234").unwrap();

    let ctl = restart(&dir);
    ctl.ensure_decrypted();
    fs::write(&db, b"new since startup").unwrap();

    let outcome = ctl.disable().unwrap();
    assert!(outcome.restored);
    assert_eq!(fs::read(&db).unwrap(), b"new since startup");
    assert!(!ctl.settings().container_path().exists());
}

#[test]
fn disable_escape_hatch_moves_unopenable_container_aside() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"chart").unwrap();
    ctl.enable("1234").unwrap();

    // Another OS account cannot unseal the stored PIN.
    let foreign = Controller::new(settings(dir.path()), MemoryCustody::new("other-user"));
    let outcome = foreign.disable().unwrap();
    assert!(!outcome.restored);
    assert!(!foreign.status().enabled);
    assert!(!db.exists());
    assert!(!foreign.settings().container_path().exists());

    let abandoned = outcome.abandoned_container.expect("container moved aside");
    assert!(abandoned.exists());

    // The user still knows the PIN.
    let recovered = dir.path().join("recovered.db");
    recover_abandoned(&abandoned, "1234", &recovered).unwrap();
    assert_eq!(fs::read(&recovered).unwrap(), b"chart");
}

#[test]
fn disable_with_custody_unavailable_still_turns_encryption_off() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    fs::write(&ctl.settings().database_path, b"referrals").unwrap();
    ctl.enable("1234").unwrap();

    let offline = Controller::new(settings(dir.path()), MemoryCustody::unavailable());
    let outcome = offline.disable().unwrap();
    assert!(!outcome.restored);
    assert!(!offline.status().enabled);
    assert!(!offline.settings().container_path().exists());

    let abandoned = outcome.abandoned_container.expect("container moved aside");
    let recovered = dir.path().join("recovered.db");
    recover_abandoned(&abandoned, "1234", &recovered).unwrap();
    assert_eq!(fs::read(&recovered).unwrap(), b"referrals");
}

// ─── 6: Custody ─────────────────────────────────────────────────────────────

#[test]
fn startup_without_custody_leaves_disk_untouched() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    ctl.enable("1234").unwrap();
    let before = fs::read(ctl.settings().container_path()).unwrap();

    let offline = Controller::new(settings(dir.path()), MemoryCustody::unavailable());
    assert_eq!(offline.ensure_decrypted(), EncryptionStatus { enabled: false });
    assert!(!offline.settings().database_path.exists());
    assert_eq!(fs::read(offline.settings().container_path()).unwrap(), before);
}

#[test]
fn shutdown_without_custody_leaves_plaintext() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    ctl.enable("1234").unwrap();
    let ctl = restart(&dir);
    ctl.ensure_decrypted();

    let offline = Controller::new(settings(dir.path()), MemoryCustody::unavailable());
    offline.ensure_encrypted_on_exit();
    assert!(offline.settings().database_path.exists());
}

// ─── 7: PIN ─────────────────────────────────────────────────────────────────

#[test]
fn verify_pin_matches_only_the_sealed_pin() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    ctl.enable("1234").unwrap();
    assert!(ctl.verify_pin("1234").unwrap());
    assert!(!ctl.verify_pin("9999").unwrap());
    assert!(!ctl.verify_pin("").unwrap());

    let offline = Controller::new(settings(dir.path()), MemoryCustody::unavailable());
    assert!(matches!(
        offline.verify_pin("1234"),
        Err(EncryptionError::CustodyUnavailable)
    ));
}

#[test]
fn changing_pin_at_rest_rekeys_container() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"ledger").unwrap();
    ctl.enable("1234").unwrap();
    let old_iv = ContainerHeader::parse(&fs::read(ctl.settings().container_path()).unwrap())
        .unwrap()
        .0
        .iv;

    ctl.enable("5678").unwrap();
    assert!(!db.exists());
    assert!(ctl.verify_pin("5678").unwrap());
    assert!(!ctl.verify_pin("1234").unwrap());
    let new_iv = ContainerHeader::parse(&fs::read(ctl.settings().container_path()).unwrap())
        .unwrap()
        .0
        .iv;
    assert_ne!(old_iv, new_iv);

    let ctl = restart(&dir);
    ctl.ensure_decrypted();
    assert_eq!(fs::read(&db).unwrap(), b"ledger");
}

#[test]
fn enable_refuses_to_overwrite_unexplained_container() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let enc = ctl.settings().container_path();
    fs::write(&enc, b"PSYENC1 from somewhere else").unwrap();

    assert!(matches!(
        ctl.enable("1234"),
        Err(EncryptionError::Unrecoverable(_))
    ));
    assert_eq!(fs::read(&enc).unwrap(), b"PSYENC1 from somewhere else");
    assert!(!ctl.status().enabled);
}

// ─── 8: Session guard ───────────────────────────────────────────────────────

#[test]
fn session_guard_seals_on_drop() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"start").unwrap();
    ctl.enable("1234").unwrap();

    let ctl = restart(&dir);
    {
        let session = ctl.open_session();
        assert!(session.status().enabled);
        fs::write(&db, b"edited in session").unwrap();
    }
    assert!(!db.exists());

    let ctl = restart(&dir);
    let _session = ctl.open_session();
    assert_eq!(fs::read(&db).unwrap(), b"edited in session");
}

// ─── 9: Plaintext not produced by the container ─────────────────────────────

/// Counts unseal calls so tests can tell whether key material was touched.
struct CountingCustody {
    inner: MemoryCustody,
    unseals: Arc<AtomicUsize>,
}

impl SecretCustody for CountingCustody {
    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn seal(&self, secret: &str) -> dbseal_core::Result<Vec<u8>> {
        self.inner.seal(secret)
    }

    fn unseal(&self, wrapped: &[u8]) -> dbseal_core::Result<Zeroizing<String>> {
        self.unseals.fetch_add(1, Ordering::SeqCst);
        self.inner.unseal(wrapped)
    }
}

#[test]
fn disable_after_offline_startup_does_not_drop_the_container() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"years of patient records").unwrap();
    ctl.enable("1234").unwrap();

    let offline = Controller::new(settings(dir.path()), MemoryCustody::unavailable());
    assert_eq!(offline.ensure_decrypted(), EncryptionStatus { enabled: false });
    // The engine opens a fresh database of its own.
    fs::write(&db, b"").unwrap();
    assert_eq!(offline.state(), StorageState::TransientBoth);

    let outcome = offline.disable().unwrap();
    assert!(!outcome.restored);
    assert!(!offline.status().enabled);
    assert_eq!(fs::read(&db).unwrap(), b"");

    let abandoned = outcome.abandoned_container.expect("container moved aside");
    let recovered = dir.path().join("recovered.db");
    recover_abandoned(&abandoned, "1234", &recovered).unwrap();
    assert_eq!(fs::read(&recovered).unwrap(), b"years of patient records");
}

#[test]
fn disable_after_offline_session_restores_container_and_sets_engine_file_aside() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"real chart").unwrap();
    ctl.enable("1234").unwrap();

    let offline = Controller::new(settings(dir.path()), MemoryCustody::unavailable());
    offline.ensure_decrypted();
    fs::write(&db, b"scratch").unwrap();
    offline.ensure_encrypted_on_exit();

    let ctl = restart(&dir);
    let outcome = ctl.disable().unwrap();
    assert!(outcome.restored);
    assert_eq!(fs::read(&db).unwrap(), b"real chart");
    assert!(!ctl.settings().container_path().exists());
    let aside = outcome.displaced_plaintext.expect("engine file set aside");
    assert_eq!(fs::read(aside).unwrap(), b"scratch");
}

#[test]
fn shutdown_never_seals_a_plaintext_that_startup_could_not_produce() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    let enc = ctl.settings().container_path();
    fs::write(&db, b"intake forms").unwrap();
    ctl.enable("1234").unwrap();
    let original = ctl.config_store().read();
    let original_salt = original.salt_bytes().unwrap();

    // Same sealed PIN, different salt: the config no longer opens the container.
    let mismatched =
        EncryptionConfig::enabled_with(&[7u8; 16], &original.wrapped_secret().unwrap());
    ctl.config_store().write(&mismatched).unwrap();

    let ctl = restart(&dir);
    assert_eq!(ctl.ensure_decrypted(), EncryptionStatus { enabled: false });
    fs::write(&db, b"").unwrap();
    ctl.ensure_encrypted_on_exit();
    assert!(db.exists());

    let out = dir.path().join("check.db");
    decrypt_file(&enc, &out, &derive_key("1234", &original_salt)).unwrap();
    assert_eq!(fs::read(&out).unwrap(), b"intake forms");
}

#[test]
fn startup_with_custody_back_sets_engine_file_aside_and_decrypts() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"billing").unwrap();
    ctl.enable("1234").unwrap();

    let offline = Controller::new(settings(dir.path()), MemoryCustody::unavailable());
    offline.ensure_decrypted();
    fs::write(&db, b"typed while offline").unwrap();
    offline.ensure_encrypted_on_exit();

    let ctl = restart(&dir);
    assert_eq!(ctl.ensure_decrypted(), EncryptionStatus { enabled: true });
    assert_eq!(fs::read(&db).unwrap(), b"billing");
    assert_eq!(ctl.state(), StorageState::DecryptedInUse);

    let aside: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("records.db.displaced-"))
        .collect();
    assert_eq!(aside.len(), 1);
    assert_eq!(fs::read(aside[0].path()).unwrap(), b"typed while offline");
}

#[test]
fn enable_refuses_plaintext_that_did_not_come_from_the_container() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    let db = ctl.settings().database_path.clone();
    fs::write(&db, b"prescriptions").unwrap();
    ctl.enable("1234").unwrap();
    let before = fs::read(ctl.settings().container_path()).unwrap();

    fs::write(&db, b"").unwrap();
    assert!(matches!(
        ctl.enable("5678"),
        Err(EncryptionError::Unrecoverable(_))
    ));
    assert_eq!(fs::read(ctl.settings().container_path()).unwrap(), before);
}

#[test]
fn bad_magic_is_rejected_before_the_pin_is_unsealed() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    ctl.enable("1234").unwrap();
    let enc = ctl.settings().container_path();
    fs::write(&enc, vec![0x55u8; 200]).unwrap();

    let unseals = Arc::new(AtomicUsize::new(0));
    let ctl = Controller::new(
        settings(dir.path()),
        CountingCustody {
            inner: MemoryCustody::new(ACCOUNT),
            unseals: unseals.clone(),
        },
    );
    assert_eq!(ctl.ensure_decrypted(), EncryptionStatus { enabled: false });
    assert_eq!(unseals.load(Ordering::SeqCst), 0);

    let outcome = ctl.disable().unwrap();
    assert_eq!(unseals.load(Ordering::SeqCst), 0);
    assert!(outcome.abandoned_container.is_some());
}

#[test]
fn state_survives_a_process_boundary() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    ctl.enable("1234").unwrap();
    restart(&dir).ensure_decrypted();

    // A second process looking at the same files.
    let observer = restart(&dir);
    assert!(observer.settings().container_path().exists());
    assert_eq!(observer.state(), StorageState::DecryptedInUse);
}

#[test]
fn enabled_with_nothing_on_disk_is_reported_missing() {
    let dir = tempdir().unwrap();
    let ctl = restart(&dir);
    ctl.enable("1234").unwrap();
    fs::remove_file(ctl.settings().container_path()).unwrap();
    assert_eq!(ctl.state(), StorageState::Missing);
    assert_eq!(ctl.ensure_decrypted(), EncryptionStatus { enabled: false });
}
