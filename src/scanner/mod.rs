//! Working-directory scanner.
//!
//! Walks the tree under the project root, applies the ignore rules, and
//! produces a manifest. Per-file problems (unreadable files, escaping
//! symlinks, names that cannot be NFC-normalized) become warnings; a scan
//! never aborts because of a single entry.

pub mod errors;
pub mod ignore;
pub mod normalize;

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::cell::RefCell;

use walkdir::WalkDir;

use crate::config::ProjectSettings;
use crate::manifest::{Manifest, ManifestEntry};
use crate::observability::logger::Logger;

pub use errors::{ScanError, ScanResultT};
pub use ignore::IgnoreRules;
use normalize::{is_nfc_path, normalize_on_disk, NormalizeOutcome};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Identity recorded on new file entries.
    pub user_id: String,
    /// Compute content hashes; deferred for status checks that only need
    /// shallow equality.
    pub compute_hashes: bool,
    /// Rename non-NFC names on disk before recording them.
    pub normalize: bool,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub manifest: Manifest,
    /// Repo-relative paths skipped by the ignore rules.
    pub ignored: Vec<String>,
    pub warnings: Vec<String>,
}

fn rel_posix(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for c in rel.components() {
        parts.push(c.as_os_str().to_str()?.to_string());
    }
    Some(parts.join("/"))
}

/// Rename non-NFC names to NFC, deepest entries first so parent renames do
/// not invalidate child paths. Failures become warnings.
fn normalize_tree(root: &Path, warnings: &mut Vec<String>) {
    let mut candidates: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| !normalize::is_nfc_path(n))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    candidates.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for path in candidates {
        match normalize_on_disk(&path) {
            NormalizeOutcome::Renamed(new_path) => {
                Logger::info(
                    "SCAN_NORMALIZED",
                    &[("to", &new_path.display().to_string())],
                );
            }
            NormalizeOutcome::AlreadyNormalized => {}
            NormalizeOutcome::Failed(reason) => {
                warnings.push(format!(
                    "cannot normalize {}: {}",
                    path.display(),
                    reason
                ));
            }
        }
    }
}

/// Scan the working directory and build a manifest.
///
/// Iteration order is lexicographic by on-disk name, so two scans of an
/// unchanged tree produce identical manifests.
pub fn scan_directory(
    root: &Path,
    settings: &ProjectSettings,
    opts: &ScanOptions,
) -> ScanResultT<ScanOutcome> {
    if !root.is_dir() {
        return Err(ScanError::new(format!(
            "not a directory: {}",
            root.display()
        )));
    }

    let mut warnings: Vec<String> = Vec::new();
    if opts.normalize {
        normalize_tree(root, &mut warnings);
    }

    let rules = IgnoreRules::from_settings(settings);
    let ignored: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let mut manifest = Manifest::new();

    let root_owned = root.to_path_buf();
    let rules_for_filter = rules.clone();
    let ignored_for_filter = Rc::clone(&ignored);
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |e| {
            if !e.file_type().is_dir() {
                return true;
            }
            match rel_posix(&root_owned, e.path()) {
                Some(rel) => {
                    if rules_for_filter.prune_dir(&rel) {
                        ignored_for_filter.borrow_mut().push(rel);
                        false
                    } else {
                        true
                    }
                }
                None => false,
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warnings.push(format!("walk error: {}", e));
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = match rel_posix(root, entry.path()) {
            Some(r) => r,
            None => {
                warnings.push(format!(
                    "skipping non-UTF-8 name: {}",
                    entry.path().display()
                ));
                continue;
            }
        };
        if rules.skip_file(&rel) {
            ignored.borrow_mut().push(rel);
            continue;
        }
        if !is_nfc_path(&rel) {
            warnings.push(format!("skipping non-NFC path: {}", rel));
            continue;
        }
        match ManifestEntry::from_disk(
            entry.path(),
            root,
            &opts.user_id,
            opts.compute_hashes,
        ) {
            Ok(manifest_entry) => manifest.insert(manifest_entry),
            Err(e) => warnings.push(format!("skipping {}: {}", rel, e)),
        }
    }

    // Links must point at files recorded in this same manifest.
    warnings.extend(manifest.prune_dangling_links());

    let ignored = Rc::try_unwrap(ignored)
        .map(RefCell::into_inner)
        .unwrap_or_default();

    Ok(ScanOutcome {
        manifest,
        ignored,
        warnings,
    })
}
