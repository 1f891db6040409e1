//! Crash-safe file replacement.
//!
//! Every file this crate produces (container, materialized plaintext, config)
//! is written to a uniquely named `.staging` sibling, synced, and renamed over
//! the destination. A reader therefore sees either the previous complete file
//! or the new complete file, never a truncated one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

const STAGING_SUFFIX: &str = ".staging";

/// Atomically replace `dest` with `bytes`.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(dest);
    fs::create_dir_all(&parent)?;
    let staging_path = staging_path_for(dest);
    let written = (|| -> Result<()> {
        let mut file = File::create(&staging_path)?;
        restrict_file_permissions(&staging_path);
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&staging_path, dest)?;
        fsync_dir(&parent)?;
        Ok(())
    })();
    if written.is_err() {
        let _ = fs::remove_file(&staging_path);
    }
    written
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            fsync_dir(&parent_dir(path))?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove leftover staging files for `dest` from a previous crash.
pub fn cleanup_staging(dest: &Path) -> usize {
    let Some(prefix) = dest.file_name().map(|n| format!("{}.", n.to_string_lossy())) else {
        return 0;
    };
    let Ok(entries) = fs::read_dir(parent_dir(dest)) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(STAGING_SUFFIX) {
            warn!(path = %entry.path().display(), "removing orphaned staging file");
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

pub fn restrict_file_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn staging_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent_dir(dest).join(format!("{}.{}{}", name, Uuid::new_v4(), STAGING_SUFFIX));
    debug!(path = %staging.display(), "staging write");
    staging
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = fs::OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
