//! Sync planner.
//!
//! Translates the merger's per-path states into four disjoint operation
//! lists. Cache-only adjustments produce no file operations; they are carried
//! separately so the commit can refresh the cache manifest. Conflict states
//! appear in no list — the caller must resolve them (see [`conflicts`])
//! before any transaction begins.

pub mod conflicts;

use std::collections::BTreeMap;

use crate::layout::METADATA_FILES;
use crate::merger::SyncState;

pub use conflicts::{
    apply_resolutions, parse_conflicts_file, write_conflicts_file, Resolution,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub upload_files: Vec<String>,
    pub download_files: Vec<String>,
    pub delete_local: Vec<String>,
    pub delete_remote: Vec<String>,
    /// Paths whose cache record changes without any file operation.
    pub cache_refresh: Vec<String>,
}

impl SyncPlan {
    /// True when the plan moves or deletes no files. A no-op sync still
    /// rewrites identical manifests.
    pub fn is_empty(&self) -> bool {
        self.upload_files.len() <= METADATA_FILES.len()
            && self
                .upload_files
                .iter()
                .all(|f| METADATA_FILES.contains(&f.as_str()))
            && self.download_files.is_empty()
            && self.delete_local.is_empty()
            && self.delete_remote.is_empty()
    }

    pub fn file_operation_count(&self) -> usize {
        self.upload_files
            .iter()
            .filter(|f| !METADATA_FILES.contains(&f.as_str()))
            .count()
            + self.download_files.len()
            + self.delete_local.len()
            + self.delete_remote.len()
    }
}

/// Unresolved conflicts found in a state map.
pub fn conflict_paths(states: &BTreeMap<String, SyncState>) -> Vec<(String, SyncState)> {
    states
        .iter()
        .filter(|(_, s)| s.is_conflict())
        .map(|(p, s)| (p.clone(), *s))
        .collect()
}

/// Build the operation lists from classified states.
///
/// The repository's own metadata files are appended to the uploads so the
/// committed remote state always contains the manifest describing itself.
pub fn calculate_sync_plan(states: &BTreeMap<String, SyncState>) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (path, state) in states {
        match state {
            SyncState::sLxCxR__only_L | SyncState::sLCR__C_eq_R_ne_L => {
                plan.upload_files.push(path.clone());
            }
            SyncState::sxLCxR__only_R | SyncState::sLCR__L_eq_C_ne_R => {
                plan.download_files.push(path.clone());
            }
            SyncState::sLCxR__L_eq_C => plan.delete_local.push(path.clone()),
            SyncState::sxLCR__C_eq_R => plan.delete_remote.push(path.clone()),
            SyncState::sLxCR__L_eq_R
            | SyncState::sxLCRx__only_C
            | SyncState::sLCR__L_eq_R_ne_C => {
                plan.cache_refresh.push(path.clone());
            }
            // Synced, impossible, or conflict: no operation. Conflicts are
            // rejected before planning.
            SyncState::sLCR__all_eq
            | SyncState::sxLxCxR__none
            | SyncState::sLCR__all_ne
            | SyncState::sxLCR__C_ne_R
            | SyncState::sLxCR__L_ne_R
            | SyncState::sLCxR__L_ne_C => {}
        }
    }

    for metadata_file in METADATA_FILES {
        plan.upload_files.push(metadata_file.to_string());
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states_of(pairs: &[(&str, SyncState)]) -> BTreeMap<String, SyncState> {
        pairs
            .iter()
            .map(|(p, s)| (p.to_string(), *s))
            .collect()
    }

    #[test]
    fn test_states_map_to_lists() {
        let states = states_of(&[
            ("new_local", SyncState::sLxCxR__only_L),
            ("pushed", SyncState::sLCR__C_eq_R_ne_L),
            ("new_remote", SyncState::sxLCxR__only_R),
            ("pulled", SyncState::sLCR__L_eq_C_ne_R),
            ("del_local", SyncState::sLCxR__L_eq_C),
            ("del_remote", SyncState::sxLCR__C_eq_R),
            ("synced", SyncState::sLCR__all_eq),
            ("ghost", SyncState::sxLCRx__only_C),
        ]);
        let plan = calculate_sync_plan(&states);
        assert!(plan.upload_files.contains(&"new_local".to_string()));
        assert!(plan.upload_files.contains(&"pushed".to_string()));
        assert_eq!(
            plan.download_files,
            vec!["new_remote".to_string(), "pulled".to_string()]
        );
        assert_eq!(plan.delete_local, vec!["del_local".to_string()]);
        assert_eq!(plan.delete_remote, vec!["del_remote".to_string()]);
        assert_eq!(plan.cache_refresh, vec!["ghost".to_string()]);
    }

    #[test]
    fn test_metadata_files_always_uploaded() {
        let plan = calculate_sync_plan(&BTreeMap::new());
        assert!(plan
            .upload_files
            .contains(&".dsg/last-sync.json".to_string()));
        assert!(plan
            .upload_files
            .contains(&".dsg/sync-messages.json".to_string()));
        assert!(plan.is_empty());
        assert_eq!(plan.file_operation_count(), 0);
    }

    #[test]
    fn test_conflicts_omitted_from_all_lists() {
        let states = states_of(&[
            ("c1", SyncState::sLCR__all_ne),
            ("c2", SyncState::sxLCR__C_ne_R),
            ("c3", SyncState::sLxCR__L_ne_R),
            ("c4", SyncState::sLCxR__L_ne_C),
        ]);
        let plan = calculate_sync_plan(&states);
        assert_eq!(plan.file_operation_count(), 0);
        assert_eq!(conflict_paths(&states).len(), 4);
    }

    #[test]
    fn test_disjoint_lists() {
        let states = states_of(&[
            ("a", SyncState::sLxCxR__only_L),
            ("b", SyncState::sxLCxR__only_R),
            ("c", SyncState::sLCxR__L_eq_C),
            ("d", SyncState::sxLCR__C_eq_R),
        ]);
        let plan = calculate_sync_plan(&states);
        let mut all: Vec<&String> = plan
            .upload_files
            .iter()
            .chain(&plan.download_files)
            .chain(&plan.delete_local)
            .chain(&plan.delete_remote)
            .collect();
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(before, all.len());
    }
}
