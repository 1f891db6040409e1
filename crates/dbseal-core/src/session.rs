//! Session marker kept next to the database.
//!
//! `<db>.session` exists only while the plaintext on disk was produced from
//! the container by a successful decrypt. A plaintext without the marker did
//! not come from the container (for example a fresh file the database engine
//! created after a failed startup) and must never replace it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;
use crate::paths::session_path_for;
use crate::storage::{remove_if_exists, write_atomic};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Plaintext decrypted from the container and handed to the engine.
    Open,
    /// Shutdown hook started writing the container from the plaintext.
    Sealing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub phase: SessionPhase,
    pub since: DateTime<Utc>,
}

pub struct SessionMarker {
    path: PathBuf,
}

impl SessionMarker {
    pub fn for_database(database_path: &Path) -> Self {
        Self {
            path: session_path_for(database_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// An unreadable marker counts as absent.
    pub fn read(&self) -> Option<SessionRecord> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring corrupt session marker: {e}");
                None
            }
        }
    }

    pub fn is_present(&self) -> bool {
        self.read().is_some()
    }

    pub fn write(&self, phase: SessionPhase) -> Result<()> {
        let record = SessionRecord {
            phase,
            since: Utc::now(),
        };
        write_atomic(&self.path, &serde_json::to_vec(&record)?)
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path)?;
        Ok(())
    }
}
