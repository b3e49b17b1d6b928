//! Snapshot message ledger (`.dsg/sync-messages.json`).
//!
//! A version-tagged, append-only record of every snapshot's message, kept
//! uncompressed beside the current manifest so `log` does not have to open
//! the archive for the common case.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::{ManifestError, ManifestResult};

/// Ledger format version.
pub const MESSAGES_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMessage {
    pub snapshot_id: String,
    pub created_at: String,
    pub created_by: String,
    pub message: String,
    pub snapshot_notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncMessages {
    pub version: String,
    pub messages: Vec<SnapshotMessage>,
}

impl Default for SyncMessages {
    fn default() -> Self {
        Self {
            version: MESSAGES_VERSION.to_string(),
            messages: Vec::new(),
        }
    }
}

impl SyncMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the ledger, or an empty one when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> ManifestResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path).map_err(|e| {
            ManifestError::io_error(format!("cannot read {}", path.display()), e)
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ManifestError::parse_error(format!("bad messages ledger: {}", e)))
    }

    pub fn append(&mut self, record: SnapshotMessage) {
        self.messages.push(record);
    }

    pub fn save(&self, path: &Path) -> ManifestResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ManifestError::parse_error(format!("serialize failed: {}", e)))?;
        let mut file = File::create(path).map_err(|e| {
            ManifestError::io_error(format!("cannot create {}", path.display()), e)
        })?;
        file.write_all(json.as_bytes()).map_err(|e| {
            ManifestError::io_error(format!("cannot write {}", path.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            ManifestError::io_error(format!("cannot fsync {}", path.display()), e)
        })?;
        Ok(())
    }
}
