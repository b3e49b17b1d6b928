//! History walker over archived manifests.
//!
//! Snapshots live compressed in `.dsg/archive/` with the newest manifest
//! duplicated uncompressed as `last-sync.json`. `log` walks newest-first;
//! `blame` replays a single path oldest-first, classifying adjacent-manifest
//! differences into events. The three-way variant also consults the
//! grand-predecessor to name reverts and recreations.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::layout;
use crate::manifest::{snapshot_number, Manifest, ManifestResult};
use crate::merger::entries_equal;

/// One line of `dsg log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub snapshot_id: String,
    pub created_at: String,
    pub created_by: String,
    pub entry_count: usize,
    pub snapshot_message: String,
}

/// What happened to a path in one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Added,
    Modified,
    Deleted,
    /// Content returned to the grand-predecessor's version.
    Reverted,
    /// Path came back after being deleted.
    Recreated,
}

impl FileEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEvent::Added => "add",
            FileEvent::Modified => "modify",
            FileEvent::Deleted => "delete",
            FileEvent::Reverted => "revert",
            FileEvent::Recreated => "recreate",
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One line of `dsg blame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameEntry {
    pub snapshot_id: String,
    pub created_at: String,
    pub created_by: String,
    pub event: FileEvent,
    pub snapshot_message: String,
}

pub struct HistoryWalker {
    repo_root: PathBuf,
}

impl HistoryWalker {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }

    /// Snapshot numbers present in the archive, ascending.
    fn archived_numbers(&self) -> Vec<u64> {
        let archive = layout::archive_dir(&self.repo_root);
        let mut numbers = BTreeSet::new();
        if let Ok(entries) = std::fs::read_dir(&archive) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(id) = name.strip_suffix("-sync.json.gz") {
                    if let Some(n) = snapshot_number(id) {
                        numbers.insert(n);
                    }
                }
            }
        }
        numbers.into_iter().collect()
    }

    /// Load one snapshot by number: the archive copy, or the current
    /// manifest when it matches and the archive lacks it.
    fn load_snapshot(&self, number: u64) -> ManifestResult<Manifest> {
        let id = format!("s{}", number);
        let archived = layout::archive_path(&self.repo_root, &id);
        if archived.exists() {
            return Manifest::from_gz_file(&archived);
        }
        Manifest::from_file(&layout::last_sync_path(&self.repo_root))
    }

    /// All snapshot numbers, ascending, including the current manifest when
    /// it is newer than anything archived.
    fn all_numbers(&self) -> Vec<u64> {
        let mut numbers = self.archived_numbers();
        if let Ok(current) = Manifest::from_file(&layout::last_sync_path(&self.repo_root)) {
            if let Some(n) = current.snapshot_id().and_then(snapshot_number) {
                if !numbers.contains(&n) {
                    numbers.push(n);
                    numbers.sort_unstable();
                }
            }
        }
        numbers
    }

    /// Newest-first log, optionally filtered by author and a lower bound on
    /// creation time.
    pub fn log(
        &self,
        limit: Option<usize>,
        author: Option<&str>,
        since: Option<&DateTime<Utc>>,
    ) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for number in self.all_numbers().into_iter().rev() {
            if let Some(limit) = limit {
                if entries.len() >= limit {
                    break;
                }
            }
            let Ok(manifest) = self.load_snapshot(number) else {
                continue;
            };
            let Some(meta) = manifest.metadata.as_ref() else {
                continue;
            };
            if let Some(author) = author {
                if meta.created_by != author {
                    continue;
                }
            }
            if let Some(since) = since {
                match DateTime::parse_from_rfc3339(&meta.created_at) {
                    Ok(t) if t.with_timezone(&Utc) < *since => continue,
                    Err(_) => continue,
                    _ => {}
                }
            }
            entries.push(LogEntry {
                snapshot_id: meta.snapshot_id.clone(),
                created_at: meta.created_at.clone(),
                created_by: meta.created_by.clone(),
                entry_count: meta.entry_count,
                snapshot_message: meta.snapshot_message.clone(),
            });
        }
        entries
    }

    /// Two-way blame: adjacent-manifest classification into add, modify, and
    /// delete events, oldest first.
    pub fn blame(&self, path: &str) -> Vec<BlameEntry> {
        self.blame_inner(path, false)
    }

    /// Three-way blame: also names reverts (content equals the
    /// grand-predecessor's) and recreations (path returns after deletion).
    pub fn blame_3way(&self, path: &str) -> Vec<BlameEntry> {
        self.blame_inner(path, true)
    }

    fn blame_inner(&self, path: &str, three_way: bool) -> Vec<BlameEntry> {
        let mut events = Vec::new();
        let mut prev: Option<Manifest> = None;
        let mut grand_prev: Option<Manifest> = None;

        for number in self.all_numbers() {
            let Ok(current) = self.load_snapshot(number) else {
                continue;
            };
            let current_entry = current.get(path);
            let prev_entry = prev.as_ref().and_then(|m| m.get(path));
            let grand_entry = grand_prev.as_ref().and_then(|m| m.get(path));

            let event = match (prev_entry, current_entry) {
                (None, Some(_)) => {
                    if three_way && grand_entry.is_some() {
                        Some(FileEvent::Recreated)
                    } else {
                        Some(FileEvent::Added)
                    }
                }
                (Some(p), Some(c)) if !entries_equal(p, c) => {
                    let reverted = three_way
                        && grand_entry.map(|g| entries_equal(g, c)).unwrap_or(false);
                    if reverted {
                        Some(FileEvent::Reverted)
                    } else {
                        Some(FileEvent::Modified)
                    }
                }
                (Some(_), None) => Some(FileEvent::Deleted),
                _ => None,
            };

            if let (Some(event), Some(meta)) = (event, current.metadata.as_ref()) {
                events.push(BlameEntry {
                    snapshot_id: meta.snapshot_id.clone(),
                    created_at: meta.created_at.clone(),
                    created_by: meta.created_by.clone(),
                    event,
                    snapshot_message: meta.snapshot_message.clone(),
                });
            }

            grand_prev = prev;
            prev = Some(current);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileRef, ManifestEntry};
    use std::fs;
    use tempfile::TempDir;

    fn entry(path: &str, hash: &str) -> ManifestEntry {
        ManifestEntry::File(FileRef {
            path: path.to_string(),
            user: "pb@example.org".to_string(),
            filesize: 8,
            mtime: format!("2026-01-01T10:00:00.{:03}+00:00", hash.len()),
            hash: hash.to_string(),
        })
    }

    /// Archive a chain of snapshots; each item is (message, [(path, hash)]).
    fn build_history(tmp: &TempDir, snapshots: &[(&str, Vec<(&str, &str)>)]) {
        fs::create_dir_all(layout::archive_dir(tmp.path())).unwrap();
        let mut prev_hash: Option<String> = None;
        let mut prev_id: Option<String> = None;
        for (i, (message, files)) in snapshots.iter().enumerate() {
            let id = format!("s{}", i + 1);
            let mut m = Manifest::new();
            for (path, hash) in files {
                m.insert(entry(path, hash));
            }
            let m = m.with_metadata(
                &id,
                &format!("2026-01-{:02}T10:00:00+00:00", i + 1),
                "pb@example.org",
                message,
                prev_id.as_deref(),
                prev_hash.as_deref(),
                if i == 0 { "init" } else { "sync" },
                None,
            );
            prev_hash = Some(m.metadata.as_ref().unwrap().snapshot_hash.clone());
            prev_id = Some(id.clone());
            m.to_gz_file(&layout::archive_path(tmp.path(), &id)).unwrap();
            // Newest manifest is also the uncompressed current one.
            if i == snapshots.len() - 1 {
                m.to_file(&layout::last_sync_path(tmp.path())).unwrap();
            }
        }
    }

    fn sample_tmp() -> TempDir {
        let tmp = TempDir::new().unwrap();
        build_history(
            &tmp,
            &[
                ("first", vec![("input/a.csv", "aaaaaaaaaaaaaaaa")]),
                (
                    "modify a",
                    vec![("input/a.csv", "bbbbbbbbbbbbbbbb"), ("input/b.csv", "cccccccccccccccc")],
                ),
                ("delete a", vec![("input/b.csv", "cccccccccccccccc")]),
                (
                    "bring a back",
                    vec![("input/a.csv", "aaaaaaaaaaaaaaaa"), ("input/b.csv", "cccccccccccccccc")],
                ),
            ],
        );
        tmp
    }

    #[test]
    fn test_log_newest_first_with_limit() {
        let tmp = sample_tmp();
        let walker = HistoryWalker::new(tmp.path());
        let entries = walker.log(Some(2), None, None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].snapshot_id, "s4");
        assert_eq!(entries[1].snapshot_id, "s3");
        assert_eq!(entries[0].snapshot_message, "bring a back");
    }

    #[test]
    fn test_log_author_filter() {
        let tmp = sample_tmp();
        let walker = HistoryWalker::new(tmp.path());
        assert_eq!(walker.log(None, Some("pb@example.org"), None).len(), 4);
        assert!(walker.log(None, Some("nobody@example.org"), None).is_empty());
    }

    #[test]
    fn test_log_since_filter() {
        let tmp = sample_tmp();
        let walker = HistoryWalker::new(tmp.path());
        let since = DateTime::parse_from_rfc3339("2026-01-03T00:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let entries = walker.log(None, None, Some(&since));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_blame_two_way_events() {
        let tmp = sample_tmp();
        let walker = HistoryWalker::new(tmp.path());
        let events = walker.blame("input/a.csv");
        let kinds: Vec<_> = events.iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            vec![
                FileEvent::Added,
                FileEvent::Modified,
                FileEvent::Deleted,
                FileEvent::Added,
            ]
        );
        assert_eq!(events[2].snapshot_id, "s3");
    }

    #[test]
    fn test_blame_three_way_names_recreate() {
        let tmp = sample_tmp();
        let walker = HistoryWalker::new(tmp.path());
        let events = walker.blame_3way("input/a.csv");
        let kinds: Vec<_> = events.iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            vec![
                FileEvent::Added,
                FileEvent::Modified,
                FileEvent::Deleted,
                FileEvent::Recreated,
            ]
        );
    }

    #[test]
    fn test_blame_three_way_names_revert() {
        let tmp = TempDir::new().unwrap();
        build_history(
            &tmp,
            &[
                ("first", vec![("input/a.csv", "aaaaaaaaaaaaaaaa")]),
                ("change", vec![("input/a.csv", "bbbbbbbbbbbbbbbb")]),
                ("undo", vec![("input/a.csv", "aaaaaaaaaaaaaaaa")]),
            ],
        );
        let walker = HistoryWalker::new(tmp.path());
        let events = walker.blame_3way("input/a.csv");
        assert_eq!(events[2].event, FileEvent::Reverted);
        // Two-way sees only a modification.
        assert_eq!(walker.blame("input/a.csv")[2].event, FileEvent::Modified);
    }

    #[test]
    fn test_blame_untouched_path_is_empty() {
        let tmp = sample_tmp();
        let walker = HistoryWalker::new(tmp.path());
        assert!(walker.blame("input/never.csv").is_empty());
    }
}
