//! Three-way manifest merger.
//!
//! For every path in the union of the Local, Cache, and Remote manifests,
//! compute one of fifteen sync states from the 3-bit presence pattern and the
//! pairwise equalities. Equality is hash-aware: deep when both sides carry a
//! computed hash, shallow otherwise.

use std::collections::BTreeMap;
use std::fmt;

use crate::manifest::{Manifest, ManifestEntry};

/// One cell of the presence grid × equality subdivision.
///
/// The name encodes presence (`x` marks the absent side) and which pairwise
/// equality holds.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// 111: all present and identical; synced.
    sLCR__all_eq,
    /// 111: remote changed; pull.
    sLCR__L_eq_C_ne_R,
    /// 111: another user uploaded an identical file; cache is outdated.
    sLCR__L_eq_R_ne_C,
    /// 111: local changed; push.
    sLCR__C_eq_R_ne_L,
    /// 111: all three copies differ; conflict.
    sLCR__all_ne,
    /// 011: deleted locally; delete on remote.
    sxLCR__C_eq_R,
    /// 011: deleted locally but remote changed; conflict.
    sxLCR__C_ne_R,
    /// 101: cache missing; local and remote match, refresh cache only.
    sLxCR__L_eq_R,
    /// 101: cache missing and the sides disagree; conflict.
    sLxCR__L_ne_R,
    /// 110: remote deleted; delete locally.
    sLCxR__L_eq_C,
    /// 110: local modified while remote deleted; conflict.
    sLCxR__L_ne_C,
    /// 001: new on remote; download.
    sxLCxR__only_R,
    /// 010: cache-only ghost; clean cache.
    sxLCRx__only_C,
    /// 100: new locally; upload.
    sLxCxR__only_L,
    /// 000: not present anywhere; should not occur.
    sxLxCxR__none,
}

impl SyncState {
    pub fn description(&self) -> &'static str {
        match self {
            SyncState::sLCR__all_eq => "111: local, cache, and remote all present and identical",
            SyncState::sLCR__L_eq_C_ne_R => "111: remote changed; local and cache match",
            SyncState::sLCR__L_eq_R_ne_C => {
                "111: another user uploaded identical file; cache is outdated"
            }
            SyncState::sLCR__C_eq_R_ne_L => "111: local changed; remote and cache match",
            SyncState::sLCR__all_ne => "111: all three copies differ",
            SyncState::sxLCR__C_eq_R => "011: local missing; remote and cache match",
            SyncState::sxLCR__C_ne_R => "011: local missing; remote and cache differ",
            SyncState::sLxCR__L_eq_R => "101: cache missing; local and remote match",
            SyncState::sLxCR__L_ne_R => "101: cache missing; local and remote differ",
            SyncState::sLCxR__L_eq_C => "110: remote missing; local and cache match",
            SyncState::sLCxR__L_ne_C => "110: remote missing; local and cache differ",
            SyncState::sxLCxR__only_R => "001: only remote has the file",
            SyncState::sxLCRx__only_C => "010: only cache has the file",
            SyncState::sLxCxR__only_L => "100: only local has the file",
            SyncState::sxLxCxR__none => "000: file not present in any manifest",
        }
    }

    /// States that require the user to resolve before a sync can proceed.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SyncState::sLCR__all_ne
                | SyncState::sxLCR__C_ne_R
                | SyncState::sLxCR__L_ne_R
                | SyncState::sLCxR__L_ne_C
        )
    }

    /// Stable name used in status output and conflicts.txt.
    pub fn name(&self) -> &'static str {
        match self {
            SyncState::sLCR__all_eq => "sLCR__all_eq",
            SyncState::sLCR__L_eq_C_ne_R => "sLCR__L_eq_C_ne_R",
            SyncState::sLCR__L_eq_R_ne_C => "sLCR__L_eq_R_ne_C",
            SyncState::sLCR__C_eq_R_ne_L => "sLCR__C_eq_R_ne_L",
            SyncState::sLCR__all_ne => "sLCR__all_ne",
            SyncState::sxLCR__C_eq_R => "sxLCR__C_eq_R",
            SyncState::sxLCR__C_ne_R => "sxLCR__C_ne_R",
            SyncState::sLxCR__L_eq_R => "sLxCR__L_eq_R",
            SyncState::sLxCR__L_ne_R => "sLxCR__L_ne_R",
            SyncState::sLCxR__L_eq_C => "sLCxR__L_eq_C",
            SyncState::sLCxR__L_ne_C => "sLCxR__L_ne_C",
            SyncState::sxLCxR__only_R => "sxLCxR__only_R",
            SyncState::sxLCRx__only_C => "sxLCRx__only_C",
            SyncState::sLxCxR__only_L => "sLxCxR__only_L",
            SyncState::sxLxCxR__none => "sxLxCxR__none",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Hash-aware equality: deep when both sides have real hashes, shallow
/// otherwise.
pub fn entries_equal(a: &ManifestEntry, b: &ManifestEntry) -> bool {
    if a.has_hash() && b.has_hash() {
        a.eq_deep(b)
    } else {
        a.eq_shallow(b)
    }
}

/// Classifier over the three manifests.
pub struct ManifestMerger<'a> {
    local: &'a Manifest,
    cache: &'a Manifest,
    remote: &'a Manifest,
}

impl<'a> ManifestMerger<'a> {
    pub fn new(local: &'a Manifest, cache: &'a Manifest, remote: &'a Manifest) -> Self {
        Self {
            local,
            cache,
            remote,
        }
    }

    /// Classify every path in the union. Iteration is over the sorted union
    /// of path sets, independent of map internals.
    pub fn merge(&self) -> BTreeMap<String, SyncState> {
        let mut all_paths: Vec<&str> = self
            .local
            .entries
            .keys()
            .chain(self.cache.entries.keys())
            .chain(self.remote.entries.keys())
            .map(String::as_str)
            .collect();
        all_paths.sort_unstable();
        all_paths.dedup();

        all_paths
            .into_iter()
            .map(|path| (path.to_string(), self.classify(path)))
            .collect()
    }

    /// Classify one path from presence bits plus pairwise equality.
    pub fn classify(&self, path: &str) -> SyncState {
        let l = self.local.get(path);
        let c = self.cache.get(path);
        let r = self.remote.get(path);

        let eq = |a: Option<&ManifestEntry>, b: Option<&ManifestEntry>| match (a, b) {
            (Some(a), Some(b)) => entries_equal(a, b),
            _ => false,
        };

        match (l.is_some(), c.is_some(), r.is_some()) {
            (true, true, true) => {
                let lc = eq(l, c);
                let lr = eq(l, r);
                let cr = eq(c, r);
                if lc && lr {
                    SyncState::sLCR__all_eq
                } else if lc {
                    SyncState::sLCR__L_eq_C_ne_R
                } else if lr {
                    SyncState::sLCR__L_eq_R_ne_C
                } else if cr {
                    SyncState::sLCR__C_eq_R_ne_L
                } else {
                    SyncState::sLCR__all_ne
                }
            }
            (false, true, true) => {
                if eq(c, r) {
                    SyncState::sxLCR__C_eq_R
                } else {
                    SyncState::sxLCR__C_ne_R
                }
            }
            (true, false, true) => {
                if eq(l, r) {
                    SyncState::sLxCR__L_eq_R
                } else {
                    SyncState::sLxCR__L_ne_R
                }
            }
            (true, true, false) => {
                if eq(l, c) {
                    SyncState::sLCxR__L_eq_C
                } else {
                    SyncState::sLCxR__L_ne_C
                }
            }
            (false, false, true) => SyncState::sxLCxR__only_R,
            (false, true, false) => SyncState::sxLCRx__only_C,
            (true, false, false) => SyncState::sLxCxR__only_L,
            (false, false, false) => SyncState::sxLxCxR__none,
        }
    }
}
