//! On-disk repository layout.
//!
//! Everything DSG persists lives under `<repo-root>/.dsg/`. The working copy
//! itself is untouched outside transaction commit windows.

use std::path::{Path, PathBuf};

/// Metadata directory name at the repository root.
pub const DSG_DIR: &str = ".dsg";

/// Project configuration file at the repository root.
pub const PROJECT_CONFIG_FILE: &str = ".dsgconfig.yml";

/// Current manifest, pretty JSON, rewritten atomically at commit.
pub const LAST_SYNC_FILE: &str = "last-sync.json";

/// Version-tagged ledger of snapshot messages.
pub const SYNC_MESSAGES_FILE: &str = "sync-messages.json";

/// Compressed archived manifests, one per snapshot.
pub const ARCHIVE_DIR: &str = "archive";

/// Transaction-scoped client staging trees.
pub const STAGING_DIR: &str = "staging";

/// Present only mid-transaction; holds the in-progress marker.
pub const BACKUP_DIR: &str = "backup";

/// Marker file whose presence means a client transaction never finished.
pub const TX_MARKER_FILE: &str = "transaction-in-progress";

/// Active lock record.
pub const LOCK_FILE: &str = "sync.lock";

/// Lock release tombstone.
pub const LOCK_RELEASED_FILE: &str = "sync.lock.released";

/// Transport temp files.
pub const TMP_DIR: &str = "tmp";

/// Repo-relative paths of the metadata files a sync always pushes.
pub const METADATA_FILES: [&str; 2] = [
    ".dsg/last-sync.json",
    ".dsg/sync-messages.json",
];

pub fn dsg_dir(root: &Path) -> PathBuf {
    root.join(DSG_DIR)
}

pub fn last_sync_path(root: &Path) -> PathBuf {
    dsg_dir(root).join(LAST_SYNC_FILE)
}

pub fn sync_messages_path(root: &Path) -> PathBuf {
    dsg_dir(root).join(SYNC_MESSAGES_FILE)
}

pub fn archive_dir(root: &Path) -> PathBuf {
    dsg_dir(root).join(ARCHIVE_DIR)
}

/// Archived manifest path for a snapshot id, e.g. `s3` -> `archive/s3-sync.json.gz`.
pub fn archive_path(root: &Path, snapshot_id: &str) -> PathBuf {
    archive_dir(root).join(format!("{}-sync.json.gz", snapshot_id))
}

pub fn staging_dir(root: &Path, tx_id: &str) -> PathBuf {
    dsg_dir(root).join(STAGING_DIR).join(tx_id)
}

pub fn backup_dir(root: &Path) -> PathBuf {
    dsg_dir(root).join(BACKUP_DIR)
}

pub fn tx_marker_path(root: &Path) -> PathBuf {
    backup_dir(root).join(TX_MARKER_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    dsg_dir(root).join(LOCK_FILE)
}

pub fn lock_released_path(root: &Path) -> PathBuf {
    dsg_dir(root).join(LOCK_RELEASED_FILE)
}

pub fn tmp_dir(root: &Path) -> PathBuf {
    dsg_dir(root).join(TMP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_path_naming() {
        let p = archive_path(Path::new("/repo"), "s12");
        assert_eq!(p, Path::new("/repo/.dsg/archive/s12-sync.json.gz"));
    }

    #[test]
    fn test_metadata_files_are_dsg_relative() {
        for f in METADATA_FILES {
            assert!(f.starts_with(".dsg/"));
        }
    }
}
