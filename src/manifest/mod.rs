//! Content-addressed file inventory with snapshot metadata.
//!
//! A manifest is an insertion-ordered map from repository-relative path to
//! entry, plus optional metadata carrying the snapshot chain linkage. Once a
//! manifest's snapshot hash is computed it is treated as immutable; archived
//! manifests are never rewritten.

pub mod entry;
pub mod errors;
pub mod hashing;
pub mod messages;

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use entry::{FileRef, LinkRef, ManifestEntry, UNKNOWN_HASH};
pub use errors::{ManifestError, ManifestResult};
pub use messages::SyncMessages;

/// Version tag written into every manifest's metadata.
pub const MANIFEST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Snapshot metadata block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestMetadata {
    pub manifest_version: String,
    /// Snapshot id, `s1`, `s2`, ...
    pub snapshot_id: String,
    pub created_at: String,
    pub entry_count: usize,
    /// Stable hash of the entry map; see [`hashing::entries_hash`].
    pub entries_hash: String,
    pub created_by: String,
    pub snapshot_message: String,
    /// Id of the parent snapshot, None for the first.
    pub snapshot_previous: Option<String>,
    /// Deterministic hash of (entries_hash, message, parent snapshot hash).
    pub snapshot_hash: String,
    /// Short tag such as "init" or "sync".
    pub snapshot_notes: String,
    /// Project configuration at snapshot time, embedded for auditability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_config: Option<serde_json::Value>,
}

/// Insertion-ordered entry map plus optional metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Manifest {
    pub entries: IndexMap<String, ManifestEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ManifestMetadata>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    /// Insert an entry under its own path.
    pub fn insert(&mut self, entry: ManifestEntry) {
        self.entries.insert(entry.path().to_string(), entry);
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.snapshot_id.as_str())
    }

    /// Stable hash of the entry map in insertion order.
    pub fn entries_hash(&self) -> String {
        hashing::entries_hash(self.entries.values())
    }

    /// Snapshot hash chaining this manifest to its parent.
    pub fn compute_snapshot_hash(
        &self,
        message: &str,
        prev_snapshot_hash: Option<&str>,
    ) -> String {
        hashing::snapshot_hash(&self.entries_hash(), message, prev_snapshot_hash)
    }

    /// Attach snapshot metadata, computing entry count, entries hash, and the
    /// chained snapshot hash.
    #[allow(clippy::too_many_arguments)]
    pub fn with_metadata(
        mut self,
        snapshot_id: &str,
        created_at: &str,
        created_by: &str,
        message: &str,
        snapshot_previous: Option<&str>,
        prev_snapshot_hash: Option<&str>,
        notes: &str,
        project_config: Option<serde_json::Value>,
    ) -> Manifest {
        let entries_hash = self.entries_hash();
        let snapshot_hash = hashing::snapshot_hash(&entries_hash, message, prev_snapshot_hash);
        self.metadata = Some(ManifestMetadata {
            manifest_version: MANIFEST_VERSION.to_string(),
            snapshot_id: snapshot_id.to_string(),
            created_at: created_at.to_string(),
            entry_count: self.entries.len(),
            entries_hash,
            created_by: created_by.to_string(),
            snapshot_message: message.to_string(),
            snapshot_previous: snapshot_previous.map(str::to_string),
            snapshot_hash,
            snapshot_notes: notes.to_string(),
            project_config,
        });
        self
    }

    /// Check the structural invariants: every key equals its entry's path,
    /// and every path passes the relative-path rules.
    pub fn validate(&self) -> ManifestResult<()> {
        for (key, e) in &self.entries {
            if key != e.path() {
                return Err(ManifestError::invalid_path(format!(
                    "entry key {:?} does not match entry path {:?}",
                    key,
                    e.path()
                )));
            }
            entry::validate_rel_path(key)?;
        }
        Ok(())
    }

    /// Drop links whose resolved target is not a file entry in this manifest.
    /// Returns one warning per dropped link.
    pub fn prune_dangling_links(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        let dangling: Vec<String> = self
            .entries
            .iter()
            .filter_map(|(path, e)| match e {
                ManifestEntry::Link(l) => {
                    let ok = self
                        .entries
                        .get(&l.reference)
                        .map(|t| t.is_file())
                        .unwrap_or(false);
                    if ok {
                        None
                    } else {
                        Some(path.clone())
                    }
                }
                _ => None,
            })
            .collect();
        for path in dangling {
            if let Some(ManifestEntry::Link(l)) = self.entries.shift_remove(&path) {
                warnings.push(format!(
                    "dropped link {} with unresolved target {}",
                    l.path, l.reference
                ));
            }
        }
        warnings
    }

    pub fn to_json(&self) -> ManifestResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ManifestError::parse_error(format!("serialize failed: {}", e)))
    }

    pub fn from_json(json: &str) -> ManifestResult<Self> {
        let manifest: Manifest = serde_json::from_str(json)
            .map_err(|e| ManifestError::parse_error(format!("parse failed: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write pretty JSON with fsync.
    pub fn to_file(&self, path: &Path) -> ManifestResult<()> {
        let json = self.to_json()?;
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

    pub fn from_file(path: &Path) -> ManifestResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ManifestError::io_error(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_json(&content)
    }

    /// Write the gzip-compressed archive form (`sN-sync.json.gz`).
    pub fn to_gz_file(&self, path: &Path) -> ManifestResult<()> {
        let json = self.to_json()?;
        let file = File::create(path).map_err(|e| {
            ManifestError::io_error(format!("cannot create {}", path.display()), e)
        })?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(json.as_bytes()).map_err(|e| {
            ManifestError::io_error(format!("cannot write {}", path.display()), e)
        })?;
        let file = encoder.finish().map_err(|e| {
            ManifestError::io_error(format!("cannot finish {}", path.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            ManifestError::io_error(format!("cannot fsync {}", path.display()), e)
        })?;
        Ok(())
    }

    pub fn from_gz_file(path: &Path) -> ManifestResult<Self> {
        let file = File::open(path).map_err(|e| {
            ManifestError::io_error(format!("cannot open {}", path.display()), e)
        })?;
        let mut decoder = GzDecoder::new(file);
        let mut json = String::new();
        decoder.read_to_string(&mut json).map_err(|e| {
            ManifestError::io_error(format!("cannot decompress {}", path.display()), e)
        })?;
        Self::from_json(&json)
    }
}

/// Parse a snapshot id like `s12` into its numeric part.
pub fn snapshot_number(snapshot_id: &str) -> Option<u64> {
    snapshot_id.strip_prefix('s')?.parse().ok()
}

/// Successor snapshot id: `s3` after `s2`, or `s1` from nothing.
pub fn next_snapshot_id(previous: Option<&str>) -> String {
    let n = previous.and_then(snapshot_number).unwrap_or(0);
    format!("s{}", n + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_manifest() -> Manifest {
        let mut m = Manifest::new();
        m.insert(ManifestEntry::File(FileRef {
            path: "input/a.csv".to_string(),
            user: "pb@example.org".to_string(),
            filesize: 8,
            mtime: "2026-01-01T10:00:00.000+00:00".to_string(),
            hash: "00000000deadbeef".to_string(),
        }));
        m.insert(ManifestEntry::Link(LinkRef {
            path: "input/b".to_string(),
            reference: "input/a.csv".to_string(),
        }));
        m
    }

    #[test]
    fn test_json_roundtrip_preserves_order_and_hashes() {
        let m = sample_manifest().with_metadata(
            "s1",
            "2026-01-01T10:00:00+00:00",
            "pb@example.org",
            "first snapshot",
            None,
            None,
            "init",
            None,
        );
        let json = m.to_json().unwrap();
        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(m, back);
        assert_eq!(m.entries_hash(), back.entries_hash());
        assert_eq!(
            m.metadata.as_ref().unwrap().snapshot_hash,
            back.metadata.as_ref().unwrap().snapshot_hash
        );
        let keys: Vec<_> = back.entries.keys().cloned().collect();
        assert_eq!(keys, vec!["input/a.csv", "input/b"]);
    }

    #[test]
    fn test_entry_type_tags_in_json() {
        let json = sample_manifest().to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["entries"]["input/a.csv"]["type"], "file");
        assert_eq!(v["entries"]["input/b"]["type"], "link");
        assert_eq!(v["entries"]["input/b"]["reference"], "input/a.csv");
    }

    #[test]
    fn test_gz_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s1-sync.json.gz");
        let m = sample_manifest();
        m.to_gz_file(&path).unwrap();
        let back = Manifest::from_gz_file(&path).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn test_validate_rejects_mismatched_key() {
        let mut m = Manifest::new();
        m.entries.insert(
            "wrong/key".to_string(),
            ManifestEntry::Link(LinkRef {
                path: "input/b".to_string(),
                reference: "input/a.csv".to_string(),
            }),
        );
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_prune_dangling_links() {
        let mut m = Manifest::new();
        m.insert(ManifestEntry::Link(LinkRef {
            path: "input/ghost".to_string(),
            reference: "input/missing.csv".to_string(),
        }));
        let warnings = m.prune_dangling_links();
        assert_eq!(warnings.len(), 1);
        assert!(m.is_empty());
    }

    #[test]
    fn test_snapshot_id_helpers() {
        assert_eq!(snapshot_number("s12"), Some(12));
        assert_eq!(snapshot_number("x1"), None);
        assert_eq!(next_snapshot_id(None), "s1");
        assert_eq!(next_snapshot_id(Some("s7")), "s8");
    }

    #[test]
    fn test_metadata_chain_fields() {
        let m1 = sample_manifest().with_metadata(
            "s1",
            "2026-01-01T10:00:00+00:00",
            "pb@example.org",
            "first",
            None,
            None,
            "init",
            None,
        );
        let h1 = m1.metadata.as_ref().unwrap().snapshot_hash.clone();
        let m2 = sample_manifest().with_metadata(
            "s2",
            "2026-01-02T10:00:00+00:00",
            "pb@example.org",
            "second",
            Some("s1"),
            Some(&h1),
            "sync",
            None,
        );
        let meta = m2.metadata.as_ref().unwrap();
        assert_eq!(meta.snapshot_previous.as_deref(), Some("s1"));
        assert_eq!(
            meta.snapshot_hash,
            m2.compute_snapshot_hash("second", Some(&h1))
        );
    }
}
