//! Manifest entries: regular files and symbolic links.
//!
//! An entry records what one path looked like at snapshot time. Equality comes
//! in two strengths: shallow (type, path, size, millisecond mtime) for cheap
//! status checks, and deep (shallow plus content hash) when both sides have
//! computed hashes.

use std::fs;
use std::path::{Component, Path};

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};

use super::errors::{ManifestError, ManifestResult};
use super::hashing::hash_file;

/// Sentinel hash value meaning "not yet computed".
pub const UNKNOWN_HASH: &str = "__UNKNOWN__";

/// A regular file in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    /// Repository-relative POSIX path, NFC-normalized.
    pub path: String,
    /// Last-modifier identity (email-shaped).
    pub user: String,
    /// Size in bytes.
    pub filesize: u64,
    /// RFC3339 timestamp with offset; millisecond precision is significant.
    pub mtime: String,
    /// Lowercase hex xxh3_64 of content, or [`UNKNOWN_HASH`].
    pub hash: String,
}

/// A symbolic link in a snapshot. The target is stored as a string and never
/// dereferenced at scan time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkRef {
    pub path: String,
    /// Link target as a repository-relative POSIX path.
    pub reference: String,
}

/// Tagged union of the two entry kinds, discriminated by `type` in JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ManifestEntry {
    #[serde(rename = "file")]
    File(FileRef),
    #[serde(rename = "link")]
    Link(LinkRef),
}

impl ManifestEntry {
    /// Repository-relative path of this entry.
    pub fn path(&self) -> &str {
        match self {
            ManifestEntry::File(f) => &f.path,
            ManifestEntry::Link(l) => &l.path,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ManifestEntry::File(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self, ManifestEntry::Link(_))
    }

    /// File size, zero for links.
    pub fn filesize(&self) -> u64 {
        match self {
            ManifestEntry::File(f) => f.filesize,
            ManifestEntry::Link(_) => 0,
        }
    }

    /// Whether this entry carries a computed content hash.
    pub fn has_hash(&self) -> bool {
        match self {
            ManifestEntry::File(f) => f.hash != UNKNOWN_HASH && !f.hash.is_empty(),
            ManifestEntry::Link(_) => false,
        }
    }

    /// Shallow equality: same kind, path, size, and floor-millisecond mtime.
    /// Hash and user are deliberately ignored.
    pub fn eq_shallow(&self, other: &ManifestEntry) -> bool {
        match (self, other) {
            (ManifestEntry::File(a), ManifestEntry::File(b)) => {
                a.path == b.path
                    && a.filesize == b.filesize
                    && mtime_millis(&a.mtime) == mtime_millis(&b.mtime)
            }
            (ManifestEntry::Link(a), ManifestEntry::Link(b)) => {
                a.path == b.path && a.reference == b.reference
            }
            _ => false,
        }
    }

    /// Deep equality: shallow plus equal content hashes. Both sides must have
    /// real hashes; the unknown sentinel never deep-compares equal.
    pub fn eq_deep(&self, other: &ManifestEntry) -> bool {
        if !self.eq_shallow(other) {
            return false;
        }
        match (self, other) {
            (ManifestEntry::File(a), ManifestEntry::File(b)) => {
                self.has_hash() && other.has_hash() && a.hash == b.hash
            }
            (ManifestEntry::Link(_), ManifestEntry::Link(_)) => true,
            _ => false,
        }
    }

    /// Build an entry from a path on disk.
    ///
    /// Regular files are stat'ed and optionally hashed by streaming their
    /// content; symlinks record their target string without dereferencing.
    /// The recorded path is `path_on_disk` relative to `base_path`.
    ///
    /// # Errors
    ///
    /// Fails on paths outside `base_path`, on link targets that are absolute
    /// or escape the repository, and on any I/O error (permission failures
    /// are not swallowed here; the scanner decides whether to skip).
    pub fn from_disk(
        path_on_disk: &Path,
        base_path: &Path,
        user: &str,
        compute_hash: bool,
    ) -> ManifestResult<ManifestEntry> {
        let rel = path_on_disk.strip_prefix(base_path).map_err(|_| {
            ManifestError::invalid_path(format!(
                "path is outside the repository: {}",
                path_on_disk.display()
            ))
        })?;
        let rel_str = posix_path_string(rel)?;
        validate_rel_path(&rel_str)?;

        let meta = fs::symlink_metadata(path_on_disk).map_err(|e| {
            ManifestError::io_error(
                format!("cannot stat {}", path_on_disk.display()),
                e,
            )
        })?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(path_on_disk).map_err(|e| {
                ManifestError::io_error(
                    format!("cannot read link {}", path_on_disk.display()),
                    e,
                )
            })?;
            let target_str = target.to_string_lossy().into_owned();
            let resolved = resolve_link_target(&rel_str, &target_str).ok_or_else(|| {
                ManifestError::invalid_path(format!(
                    "link {} target escapes the repository: {}",
                    rel_str, target_str
                ))
            })?;
            return Ok(ManifestEntry::Link(LinkRef {
                path: rel_str,
                reference: resolved,
            }));
        }

        if !meta.file_type().is_file() {
            return Err(ManifestError::invalid_path(format!(
                "not a regular file or symlink: {}",
                path_on_disk.display()
            )));
        }

        let mtime = format_mtime(&meta)?;
        let hash = if compute_hash {
            hash_file(path_on_disk).map_err(|e| {
                ManifestError::io_error(
                    format!("cannot hash {}", path_on_disk.display()),
                    e,
                )
            })?
        } else {
            UNKNOWN_HASH.to_string()
        };

        Ok(ManifestEntry::File(FileRef {
            path: rel_str,
            user: user.to_string(),
            filesize: meta.len(),
            mtime,
            hash,
        }))
    }
}

/// Parse an RFC3339 mtime and floor to epoch milliseconds. Unparseable
/// timestamps compare as None, which never equals a real value.
pub fn mtime_millis(mtime: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(mtime)
        .ok()
        .map(|t| t.timestamp_millis())
}

fn format_mtime(meta: &fs::Metadata) -> ManifestResult<String> {
    let modified = meta
        .modified()
        .map_err(|e| ManifestError::io_error("mtime unavailable", e))?;
    let dt: DateTime<Local> = modified.into();
    Ok(dt.to_rfc3339_opts(SecondsFormat::Millis, false))
}

/// Render a relative path with `/` separators regardless of host OS.
fn posix_path_string(rel: &Path) -> ManifestResult<String> {
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(os) => match os.to_str() {
                Some(s) => parts.push(s.to_string()),
                None => {
                    return Err(ManifestError::invalid_path(format!(
                        "path is not valid UTF-8: {}",
                        rel.display()
                    )))
                }
            },
            other => {
                return Err(ManifestError::invalid_path(format!(
                    "unexpected path component {:?} in {}",
                    other,
                    rel.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Reject absolute paths, `..` traversal, empty paths, and non-NFC names.
pub fn validate_rel_path(path: &str) -> ManifestResult<()> {
    if path.is_empty() {
        return Err(ManifestError::invalid_path("empty path"));
    }
    if path.starts_with('/') {
        return Err(ManifestError::invalid_path(format!(
            "absolute path not allowed: {}",
            path
        )));
    }
    if path.split('/').any(|c| c == "..") {
        return Err(ManifestError::invalid_path(format!(
            "parent traversal not allowed: {}",
            path
        )));
    }
    if !unicode_normalization::is_nfc(path) {
        return Err(ManifestError::invalid_path(format!(
            "path is not NFC-normalized: {}",
            path
        )));
    }
    Ok(())
}

/// Resolve a link target against the link's parent directory, staying inside
/// the repository. Returns the canonical repo-relative target, or None when
/// the target is absolute or escapes the repository root.
pub fn resolve_link_target(link_path: &str, target: &str) -> Option<String> {
    if target.starts_with('/') {
        return None;
    }
    let parent = match link_path.rfind('/') {
        Some(idx) => &link_path[..idx],
        None => "",
    };
    let mut stack: Vec<&str> = if parent.is_empty() {
        Vec::new()
    } else {
        parent.split('/').collect()
    };
    for comp in target.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return None;
                }
            }
            c => stack.push(c),
        }
    }
    if stack.is_empty() {
        return None;
    }
    Some(stack.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn file_entry(path: &str, size: u64, mtime: &str, hash: &str) -> ManifestEntry {
        ManifestEntry::File(FileRef {
            path: path.to_string(),
            user: "pb@example.org".to_string(),
            filesize: size,
            mtime: mtime.to_string(),
            hash: hash.to_string(),
        })
    }

    #[test]
    fn test_shallow_ignores_hash_and_user() {
        let a = file_entry("input/a.csv", 8, "2026-01-01T10:00:00.123+00:00", "aaaa");
        let mut b = a.clone();
        if let ManifestEntry::File(f) = &mut b {
            f.hash = "bbbb".to_string();
            f.user = "other@example.org".to_string();
        }
        assert!(a.eq_shallow(&b));
        assert!(!a.eq_deep(&b));
    }

    #[test]
    fn test_shallow_millisecond_floor() {
        let a = file_entry("x", 1, "2026-01-01T10:00:00.123+00:00", UNKNOWN_HASH);
        let b = file_entry("x", 1, "2026-01-01T10:00:00.124+00:00", UNKNOWN_HASH);
        assert!(!a.eq_shallow(&b));
        let c = file_entry("x", 1, "2026-01-01T11:00:00.123+01:00", UNKNOWN_HASH);
        // Same instant expressed in a different offset.
        assert!(a.eq_shallow(&c));
    }

    #[test]
    fn test_deep_requires_real_hashes() {
        let a = file_entry("x", 1, "2026-01-01T10:00:00.000+00:00", UNKNOWN_HASH);
        let b = a.clone();
        assert!(a.eq_shallow(&b));
        assert!(!a.eq_deep(&b));
    }

    #[test]
    fn test_from_disk_regular_file() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("input");
        fs::create_dir(&dir).unwrap();
        let file = dir.join("a.csv");
        let mut f = fs::File::create(&file).unwrap();
        f.write_all(b"1,2,3,4\n").unwrap();

        let entry =
            ManifestEntry::from_disk(&file, tmp.path(), "pb@example.org", true).unwrap();
        match &entry {
            ManifestEntry::File(fr) => {
                assert_eq!(fr.path, "input/a.csv");
                assert_eq!(fr.filesize, 8);
                assert_ne!(fr.hash, UNKNOWN_HASH);
                assert_eq!(fr.hash.len(), 16);
            }
            _ => panic!("expected file entry"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_from_disk_symlink_records_target() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("input");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.csv"), b"12345678").unwrap();
        std::os::unix::fs::symlink("a.csv", dir.join("b")).unwrap();

        let entry = ManifestEntry::from_disk(
            &dir.join("b"),
            tmp.path(),
            "pb@example.org",
            true,
        )
        .unwrap();
        match entry {
            ManifestEntry::Link(l) => {
                assert_eq!(l.path, "input/b");
                assert_eq!(l.reference, "input/a.csv");
            }
            _ => panic!("expected link entry"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_from_disk_rejects_escaping_symlink() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("input");
        fs::create_dir(&dir).unwrap();
        std::os::unix::fs::symlink("../../etc/passwd", dir.join("evil")).unwrap();

        let err = ManifestEntry::from_disk(
            &dir.join("evil"),
            tmp.path(),
            "pb@example.org",
            false,
        )
        .unwrap_err();
        assert_eq!(err.code().code(), "DSG_MANIFEST_INVALID_PATH");
    }

    #[test]
    fn test_validate_rel_path() {
        assert!(validate_rel_path("input/a.csv").is_ok());
        assert!(validate_rel_path("/etc/passwd").is_err());
        assert!(validate_rel_path("input/../../x").is_err());
        assert!(validate_rel_path("").is_err());
        // NFD form is rejected; manifests record NFC only.
        assert!(validate_rel_path("input/cafe\u{0065}\u{0301}.csv").is_err());
        assert!(validate_rel_path("input/caf\u{00e9}.csv").is_ok());
    }

    #[test]
    fn test_resolve_link_target() {
        assert_eq!(
            resolve_link_target("input/b", "a.csv").as_deref(),
            Some("input/a.csv")
        );
        assert_eq!(
            resolve_link_target("input/sub/b", "../a.csv").as_deref(),
            Some("input/a.csv")
        );
        assert_eq!(resolve_link_target("input/b", "/abs"), None);
        assert_eq!(resolve_link_target("input/b", "../../escape"), None);
    }
}
