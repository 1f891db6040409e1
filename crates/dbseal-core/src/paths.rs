use directories::ProjectDirs;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "dbseal";
pub const APP_NAME: &str = "dbseal";

pub const DEFAULT_DB_FILE_NAME: &str = "records.db";
pub const CONTAINER_EXTENSION: &str = "enc";
pub const UNRECOVERABLE_SUFFIX: &str = "unrecoverable";
pub const SESSION_EXTENSION: &str = "session";
pub const DISPLACED_SUFFIX: &str = "displaced";

pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "cannot determine data directory")
    })?;
    Ok(dirs.data_dir().to_path_buf())
}

/// `<database file name>.enc`, next to the database.
pub fn container_path_for(database_path: &Path) -> PathBuf {
    append_extension(database_path, CONTAINER_EXTENSION)
}

/// Where an undecryptable container is moved by the disable escape hatch.
pub fn unrecoverable_path_for(container_path: &Path, stamp: &str) -> PathBuf {
    append_extension(container_path, &format!("{UNRECOVERABLE_SUFFIX}-{stamp}"))
}

/// `<database file name>.session`, see [`crate::session`].
pub fn session_path_for(database_path: &Path) -> PathBuf {
    append_extension(database_path, SESSION_EXTENSION)
}

/// Where a plaintext that did not come from the container is set aside
/// before the container is decrypted over it.
pub fn displaced_path_for(database_path: &Path, stamp: &str) -> PathBuf {
    append_extension(database_path, &format!("{DISPLACED_SUFFIX}-{stamp}"))
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
