//! Client-side working copy with staged writes and crash recovery.
//!
//! Every write lands in `.dsg/staging/<tx>/` first; deletions are recorded
//! as tombstones. Commit promotes staging with atomic renames, backing up
//! working files that would be silently clobbered. A marker file under
//! `.dsg/backup/` makes an interrupted commit resumable: recovery completes
//! the renames the marker describes and clears the transaction debris.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::{StorageError, StorageResult};
use crate::layout;
use crate::manifest::{entry::mtime_millis, Manifest, ManifestEntry};
use crate::observability::Logger;
use crate::transport::{ContentStream, FileContentStream, TempFile};

/// Commit-time marker describing what an in-flight transaction will rename.
#[derive(Debug, Serialize, Deserialize)]
struct TxMarker {
    tx_id: String,
    files: Vec<String>,
    tombstones: Vec<String>,
}

pub struct ClientFilesystem {
    project_root: PathBuf,
    backup_on_conflict: bool,
    tx_id: Option<String>,
    staged_files: Vec<String>,
    tombstones: Vec<String>,
    cache: Manifest,
    /// Millisecond mtimes to restore on staged downloads, so a fresh scan
    /// shallow-matches the manifest that described them.
    expected_mtimes: std::collections::BTreeMap<String, i64>,
}

impl ClientFilesystem {
    pub fn new(project_root: &Path, backup_on_conflict: bool) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            backup_on_conflict,
            tx_id: None,
            staged_files: Vec::new(),
            tombstones: Vec::new(),
            cache: Manifest::new(),
            expected_mtimes: std::collections::BTreeMap::new(),
        }
    }

    /// Declare the mtimes downloaded files must carry after commit.
    pub fn set_expected_mtimes(
        &mut self,
        mtimes: std::collections::BTreeMap<String, i64>,
    ) {
        self.expected_mtimes = mtimes;
    }

    fn staging_dir(&self) -> PathBuf {
        layout::staging_dir(
            &self.project_root,
            self.tx_id.as_deref().unwrap_or("none"),
        )
    }

    fn staging_path(&self, rel_path: &str) -> PathBuf {
        self.staging_dir().join(rel_path)
    }

    fn working_path(&self, rel_path: &str) -> PathBuf {
        self.project_root.join(rel_path)
    }

    fn pending_path(&self, rel_path: &str) -> PathBuf {
        let tx = self.tx_id.as_deref().unwrap_or("none");
        let working = self.working_path(rel_path);
        let name = working
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        working.with_file_name(format!("{}.pending-{}", name, tx))
    }

    /// Begin a transaction: create staging, back up the cache manifest, and
    /// load it for clobber detection.
    pub fn begin(&mut self, tx_id: &str) -> StorageResult<()> {
        self.tx_id = Some(tx_id.to_string());
        self.staged_files.clear();
        self.tombstones.clear();

        fs::create_dir_all(self.staging_dir()).map_err(|e| {
            StorageError::client_io("cannot create staging directory", e)
        })?;
        let backup_dir = layout::backup_dir(&self.project_root);
        fs::create_dir_all(&backup_dir)
            .map_err(|e| StorageError::client_io("cannot create backup directory", e))?;

        let last_sync = layout::last_sync_path(&self.project_root);
        if last_sync.exists() {
            fs::copy(&last_sync, backup_dir.join(layout::LAST_SYNC_FILE)).map_err(
                |e| StorageError::client_io("cannot back up last-sync.json", e),
            )?;
            self.cache = Manifest::from_file(&last_sync)
                .map_err(|e| StorageError::client(format!("bad cache manifest: {}", e)))?;
        } else {
            self.cache = Manifest::new();
        }
        Ok(())
    }

    /// Stream a file for upload: the staged copy when present, the working
    /// copy otherwise.
    pub fn send_file(&self, rel_path: &str) -> StorageResult<Box<dyn ContentStream>> {
        let staged = self.staging_path(rel_path);
        let source = if staged.exists() {
            staged
        } else {
            self.working_path(rel_path)
        };
        let stream = FileContentStream::open(&source).map_err(|e| {
            StorageError::client_io(format!("cannot open {}", source.display()), e)
        })?;
        Ok(Box::new(stream))
    }

    /// Move a transport temp file into client staging.
    pub fn recv_file(&mut self, rel_path: &str, temp: &mut TempFile) -> StorageResult<()> {
        let staged = self.staging_path(rel_path);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::client_io("cannot create staging parent", e)
            })?;
        }
        match fs::rename(&temp.path, &staged) {
            Ok(()) => {}
            // Cross-device temp dir: fall back to copy.
            Err(_) => {
                fs::copy(&temp.path, &staged).map_err(|e| {
                    StorageError::client_io(
                        format!("cannot stage {}", staged.display()),
                        e,
                    )
                })?;
            }
        }
        temp.disarm();
        self.record_staged(rel_path);
        Ok(())
    }

    /// Stage file content directly (manifest and ledger writes).
    pub fn stage_file_bytes(&mut self, rel_path: &str, content: &[u8]) -> StorageResult<()> {
        let staged = self.staging_path(rel_path);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::client_io("cannot create staging parent", e)
            })?;
        }
        fs::write(&staged, content).map_err(|e| {
            StorageError::client_io(format!("cannot stage {}", staged.display()), e)
        })?;
        self.record_staged(rel_path);
        Ok(())
    }

    /// Record a deletion for commit time.
    pub fn delete_file(&mut self, rel_path: &str) {
        if !self.tombstones.iter().any(|t| t == rel_path) {
            self.tombstones.push(rel_path.to_string());
        }
    }

    /// Recreate a symlink in staging.
    pub fn create_symlink(&mut self, rel_path: &str, target: &str) -> StorageResult<()> {
        let staged = self.staging_path(rel_path);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::client_io("cannot create staging parent", e)
            })?;
        }
        let link_text = super::relative_link_text(rel_path, target);
        #[cfg(unix)]
        {
            if staged.exists() {
                let _ = fs::remove_file(&staged);
            }
            std::os::unix::fs::symlink(&link_text, &staged).map_err(|e| {
                StorageError::client_io(
                    format!("cannot create symlink {}", staged.display()),
                    e,
                )
            })?;
        }
        #[cfg(not(unix))]
        {
            let _ = link_text;
            return Err(StorageError::client("symlinks require a unix platform"));
        }
        self.record_staged(rel_path);
        Ok(())
    }

    /// Whether the local working file is a symlink.
    pub fn is_symlink(&self, rel_path: &str) -> bool {
        fs::symlink_metadata(self.working_path(rel_path))
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    /// Target of a local working symlink, as the on-disk link text.
    pub fn symlink_target(&self, rel_path: &str) -> StorageResult<String> {
        let path = self.working_path(rel_path);
        let target = fs::read_link(&path).map_err(|e| {
            StorageError::client_io(format!("cannot read link {}", path.display()), e)
        })?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn record_staged(&mut self, rel_path: &str) {
        if !self.staged_files.iter().any(|f| f == rel_path) {
            self.staged_files.push(rel_path.to_string());
        }
    }

    /// Does the working file differ from the cache manifest's record?
    /// A file the cache never saw counts as differing.
    fn would_clobber(&self, rel_path: &str) -> bool {
        let working = self.working_path(rel_path);
        let meta = match fs::symlink_metadata(&working) {
            Ok(m) => m,
            Err(_) => return false,
        };
        let Some(cache_entry) = self.cache.get(rel_path) else {
            return true;
        };
        match cache_entry {
            ManifestEntry::File(f) => {
                if meta.len() != f.filesize {
                    return true;
                }
                let disk_ms = meta
                    .modified()
                    .ok()
                    .map(chrono::DateTime::<chrono::Local>::from)
                    .map(|t| t.timestamp_millis());
                disk_ms != mtime_millis(&f.mtime)
            }
            ManifestEntry::Link(l) => {
                let disk_target = fs::read_link(&working)
                    .ok()
                    .map(|t| t.to_string_lossy().into_owned());
                let expected = super::relative_link_text(rel_path, &l.reference);
                disk_target.as_deref() != Some(expected.as_str())
            }
        }
    }

    fn backup_aside(&self, rel_path: &str) -> StorageResult<()> {
        let working = self.working_path(rel_path);
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let suffix: u16 = rand::thread_rng().gen();
        let name = working
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let backup = working.with_file_name(format!("{}~{}-{:04x}~", name, stamp, suffix));
        fs::rename(&working, &backup).map_err(|e| {
            StorageError::client_io(
                format!("cannot back up {}", working.display()),
                e,
            )
        })?;
        Logger::info(
            "CLIENT_BACKUP_CREATED",
            &[("path", rel_path), ("backup", &backup.display().to_string())],
        );
        Ok(())
    }

    /// Promote staging to the working copy.
    ///
    /// The marker is written first, so a crash at any later point is
    /// completed deterministically by [`recover`].
    pub fn commit(&mut self, tx_id: &str) -> StorageResult<()> {
        let marker = TxMarker {
            tx_id: tx_id.to_string(),
            files: self.staged_files.clone(),
            tombstones: self.tombstones.clone(),
        };
        let marker_json = serde_json::to_vec(&marker)
            .map_err(|e| StorageError::client(format!("cannot encode marker: {}", e)))?;
        fs::write(layout::tx_marker_path(&self.project_root), marker_json)
            .map_err(|e| StorageError::client_io("cannot write transaction marker", e))?;

        // Restore recorded mtimes before promotion so the next scan
        // shallow-matches the manifest.
        for (rel_path, ms) in &self.expected_mtimes {
            let staged = self.staging_path(rel_path);
            if staged.exists() {
                let ft = filetime::FileTime::from_unix_time(
                    ms.div_euclid(1000),
                    (ms.rem_euclid(1000) as u32) * 1_000_000,
                );
                if let Err(e) = filetime::set_file_mtime(&staged, ft) {
                    Logger::warn(
                        "CLIENT_MTIME_RESTORE_FAILED",
                        &[("path", rel_path.as_str()), ("error", &e.to_string())],
                    );
                }
            }
        }

        // Move staged files next to their targets first, so the final rename
        // is same-directory atomic.
        for rel_path in &self.staged_files {
            let staged = self.staging_path(rel_path);
            let pending = self.pending_path(rel_path);
            if let Some(parent) = pending.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    StorageError::client_io("cannot create target parent", e)
                })?;
            }
            fs::rename(&staged, &pending).map_err(|e| {
                StorageError::client_io(
                    format!("cannot move {} into place", staged.display()),
                    e,
                )
            })?;
        }

        for rel_path in &self.staged_files.clone() {
            let pending = self.pending_path(rel_path);
            let working = self.working_path(rel_path);
            // Metadata under .dsg/ is transaction-managed and never backed
            // up; working files are, when they drifted from the cache.
            let backup_candidate = !rel_path.starts_with(".dsg/");
            if backup_candidate
                && working.exists()
                && self.backup_on_conflict
                && self.would_clobber(rel_path)
            {
                self.backup_aside(rel_path)?;
            }
            fs::rename(&pending, &working).map_err(|e| {
                StorageError::client_io(
                    format!("cannot promote {}", working.display()),
                    e,
                )
            })?;
        }

        for rel_path in &self.tombstones {
            let working = self.working_path(rel_path);
            match fs::remove_file(&working) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StorageError::client_io(
                        format!("cannot delete {}", working.display()),
                        e,
                    ))
                }
            }
        }

        self.clear_transaction_state()?;
        Logger::info(
            "CLIENT_COMMIT",
            &[
                ("tx", tx_id),
                ("files", &self.staged_files.len().to_string()),
                ("deletes", &self.tombstones.len().to_string()),
            ],
        );
        Ok(())
    }

    /// Discard staging and restore the cache manifest backup.
    pub fn rollback(&mut self, _tx_id: &str) -> StorageResult<()> {
        let staging = self.staging_dir();
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .map_err(|e| StorageError::client_io("cannot remove staging", e))?;
        }
        let backup = layout::backup_dir(&self.project_root).join(layout::LAST_SYNC_FILE);
        if backup.exists() {
            fs::copy(&backup, layout::last_sync_path(&self.project_root))
                .map_err(|e| StorageError::client_io("cannot restore last-sync.json", e))?;
        }
        let backup_dir = layout::backup_dir(&self.project_root);
        if backup_dir.exists() {
            let _ = fs::remove_dir_all(&backup_dir);
        }
        Logger::info("CLIENT_ROLLBACK", &[]);
        Ok(())
    }

    fn clear_transaction_state(&self) -> StorageResult<()> {
        let marker = layout::tx_marker_path(&self.project_root);
        if marker.exists() {
            fs::remove_file(&marker)
                .map_err(|e| StorageError::client_io("cannot remove marker", e))?;
        }
        let backup_dir = layout::backup_dir(&self.project_root);
        if backup_dir.exists() {
            let _ = fs::remove_dir_all(&backup_dir);
        }
        let staging = self.staging_dir();
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        Ok(())
    }

    /// Complete an interrupted commit on next open.
    ///
    /// If the in-progress marker exists, every file it lists is either still
    /// in staging, parked as `.pending-<tx>`, or already promoted; recovery
    /// finishes the renames, applies tombstones, and clears the debris. The
    /// result equals a completed commit.
    pub fn recover(project_root: &Path) -> StorageResult<bool> {
        let marker_path = layout::tx_marker_path(project_root);
        if !marker_path.exists() {
            return Ok(false);
        }
        let marker: TxMarker = serde_json::from_slice(
            &fs::read(&marker_path)
                .map_err(|e| StorageError::client_io("cannot read marker", e))?,
        )
        .map_err(|e| StorageError::client(format!("bad marker: {}", e)))?;

        Logger::warn("CLIENT_RECOVERY_BEGIN", &[("tx", &marker.tx_id)]);
        let staging_root = layout::staging_dir(project_root, &marker.tx_id);

        for rel_path in &marker.files {
            let working = project_root.join(rel_path);
            let name = working
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let pending =
                working.with_file_name(format!("{}.pending-{}", name, marker.tx_id));
            let staged = staging_root.join(rel_path);

            if let Some(parent) = working.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if pending.exists() {
                fs::rename(&pending, &working).map_err(|e| {
                    StorageError::client_io(
                        format!("recovery cannot promote {}", working.display()),
                        e,
                    )
                })?;
            } else if staged.exists() {
                fs::rename(&staged, &working).map_err(|e| {
                    StorageError::client_io(
                        format!("recovery cannot promote {}", working.display()),
                        e,
                    )
                })?;
            }
            // Neither exists: this file was already promoted.
        }

        for rel_path in &marker.tombstones {
            let working = project_root.join(rel_path);
            match fs::remove_file(&working) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StorageError::client_io(
                        format!("recovery cannot delete {}", working.display()),
                        e,
                    ))
                }
            }
        }

        let _ = fs::remove_file(&marker_path);
        let _ = fs::remove_dir_all(layout::backup_dir(project_root));
        let _ = fs::remove_dir_all(&staging_root);
        Logger::info("CLIENT_RECOVERY_DONE", &[("tx", &marker.tx_id)]);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ClientFilesystem) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("input")).unwrap();
        fs::create_dir_all(tmp.path().join(".dsg")).unwrap();
        let client = ClientFilesystem::new(tmp.path(), true);
        (tmp, client)
    }

    #[test]
    fn test_stage_and_commit_new_file() {
        let (tmp, mut client) = setup();
        client.begin("tx-aaaa0001").unwrap();
        client
            .stage_file_bytes("input/new.csv", b"fresh\n")
            .unwrap();
        client.commit("tx-aaaa0001").unwrap();

        assert_eq!(fs::read(tmp.path().join("input/new.csv")).unwrap(), b"fresh\n");
        assert!(!layout::tx_marker_path(tmp.path()).exists());
        assert!(!layout::backup_dir(tmp.path()).exists());
    }

    #[test]
    fn test_tombstone_deletes_on_commit() {
        let (tmp, mut client) = setup();
        fs::write(tmp.path().join("input/old.csv"), b"bye").unwrap();
        client.begin("tx-aaaa0002").unwrap();
        client.delete_file("input/old.csv");
        client.commit("tx-aaaa0002").unwrap();
        assert!(!tmp.path().join("input/old.csv").exists());
    }

    #[test]
    fn test_overwrite_of_untracked_file_makes_backup() {
        let (tmp, mut client) = setup();
        fs::write(tmp.path().join("input/a.csv"), b"local edit").unwrap();

        client.begin("tx-aaaa0003").unwrap();
        client.stage_file_bytes("input/a.csv", b"remote wins").unwrap();
        client.commit("tx-aaaa0003").unwrap();

        assert_eq!(
            fs::read(tmp.path().join("input/a.csv")).unwrap(),
            b"remote wins"
        );
        let backups: Vec<_> = fs::read_dir(tmp.path().join("input"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("a.csv~") && n.ends_with('~'))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            fs::read(tmp.path().join("input").join(&backups[0])).unwrap(),
            b"local edit"
        );
    }

    #[test]
    fn test_no_backup_when_disabled() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("input")).unwrap();
        fs::create_dir_all(tmp.path().join(".dsg")).unwrap();
        fs::write(tmp.path().join("input/a.csv"), b"local edit").unwrap();

        let mut client = ClientFilesystem::new(tmp.path(), false);
        client.begin("tx-aaaa0004").unwrap();
        client.stage_file_bytes("input/a.csv", b"remote wins").unwrap();
        client.commit("tx-aaaa0004").unwrap();

        let backups: Vec<_> = fs::read_dir(tmp.path().join("input"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains('~'))
            .collect();
        assert!(backups.is_empty());
    }

    #[test]
    fn test_rollback_restores_cache_manifest() {
        let (tmp, mut client) = setup();
        let original = br#"{"entries":{}}"#;
        fs::write(layout::last_sync_path(tmp.path()), original).unwrap();

        client.begin("tx-aaaa0005").unwrap();
        client
            .stage_file_bytes(".dsg/last-sync.json", b"{\"entries\":{\"x\":1}}")
            .unwrap();
        // Something corrupted the live manifest mid-transaction.
        fs::write(layout::last_sync_path(tmp.path()), b"garbage").unwrap();
        client.rollback("tx-aaaa0005").unwrap();

        assert_eq!(
            fs::read(layout::last_sync_path(tmp.path())).unwrap(),
            original.to_vec()
        );
        assert!(!layout::staging_dir(tmp.path(), "tx-aaaa0005").exists());
    }

    #[test]
    fn test_recover_completes_interrupted_commit() {
        let (tmp, mut client) = setup();
        client.begin("tx-aaaa0006").unwrap();
        client
            .stage_file_bytes("input/new.csv", b"content")
            .unwrap();
        client.delete_file("input/gone.csv");
        fs::write(tmp.path().join("input/gone.csv"), b"x").unwrap();

        // Simulate the crash window: marker written, renames not yet done.
        let marker = TxMarker {
            tx_id: "tx-aaaa0006".to_string(),
            files: vec!["input/new.csv".to_string()],
            tombstones: vec!["input/gone.csv".to_string()],
        };
        fs::write(
            layout::tx_marker_path(tmp.path()),
            serde_json::to_vec(&marker).unwrap(),
        )
        .unwrap();

        assert!(ClientFilesystem::recover(tmp.path()).unwrap());
        assert_eq!(
            fs::read(tmp.path().join("input/new.csv")).unwrap(),
            b"content"
        );
        assert!(!tmp.path().join("input/gone.csv").exists());
        assert!(!layout::tx_marker_path(tmp.path()).exists());
        // Idempotent: nothing left to recover.
        assert!(!ClientFilesystem::recover(tmp.path()).unwrap());
    }

    #[test]
    fn test_send_file_prefers_staged_copy() {
        let (tmp, mut client) = setup();
        fs::write(tmp.path().join("input/a.csv"), b"working").unwrap();
        client.begin("tx-aaaa0007").unwrap();
        client.stage_file_bytes("input/a.csv", b"staged!").unwrap();

        let mut stream = client.send_file("input/a.csv").unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut out).unwrap();
        assert_eq!(out, b"staged!");
        assert_eq!(stream.size(), 7);
    }
}
