//! Unicode NFC normalization of on-disk names.
//!
//! Manifests record NFC paths only. When the scanner meets a name that is not
//! NFC (macOS tooling tends to hand back NFD), it may rename the on-disk
//! entry, provided the parent is writable and the NFC twin does not already
//! exist. Filesystems that re-present NFD after a rename are tolerated; the
//! recorded path stays NFC either way.

use std::fs;
use std::path::{Path, PathBuf};

use unicode_normalization::{is_nfc, UnicodeNormalization};

/// NFC-normalize a single path component.
pub fn nfc(component: &str) -> String {
    if is_nfc(component) {
        component.to_string()
    } else {
        component.nfc().collect()
    }
}

/// NFC-normalize a `/`-separated repo-relative path.
pub fn nfc_path(rel_path: &str) -> String {
    if is_nfc(rel_path) {
        rel_path.to_string()
    } else {
        rel_path.split('/').map(nfc).collect::<Vec<_>>().join("/")
    }
}

/// Whether a repo-relative path is already NFC.
pub fn is_nfc_path(rel_path: &str) -> bool {
    is_nfc(rel_path)
}

/// Outcome of attempting to normalize one on-disk entry.
#[derive(Debug, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// Name was already NFC.
    AlreadyNormalized,
    /// On-disk entry renamed to its NFC form.
    Renamed(PathBuf),
    /// Could not rename; the caller should warn and skip the entry.
    Failed(String),
}

/// Rename `path`'s final component to NFC form if needed.
pub fn normalize_on_disk(path: &Path) -> NormalizeOutcome {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return NormalizeOutcome::Failed("name is not valid UTF-8".to_string()),
    };
    if is_nfc(name) {
        return NormalizeOutcome::AlreadyNormalized;
    }
    let normalized = nfc(name);
    let target = match path.parent() {
        Some(parent) => parent.join(&normalized),
        None => return NormalizeOutcome::Failed("no parent directory".to_string()),
    };
    if target.exists() {
        return NormalizeOutcome::Failed(format!(
            "NFC twin already exists: {}",
            target.display()
        ));
    }
    match fs::rename(path, &target) {
        Ok(()) => NormalizeOutcome::Renamed(target),
        Err(e) => NormalizeOutcome::Failed(format!("rename failed: {}", e)),
    }
}
