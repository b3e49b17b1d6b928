//! The conflicts.txt resolution protocol.
//!
//! When a sync meets conflict states it writes `conflicts.txt` at the repo
//! root, one line per path, and exits without touching the remote. The user
//! annotates each line with `L`, `C`, or `R` (keep local, cache, or remote);
//! the next sync reads the annotations, rewrites the affected states to
//! their resolved equivalents, and schedules a working-copy backup whenever
//! the chosen side is not local.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::merger::SyncState;

/// Resolution file name at the repository root.
pub const CONFLICTS_FILE: &str = "conflicts.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Local,
    Cache,
    Remote,
}

impl Resolution {
    fn parse(token: &str) -> Option<Resolution> {
        match token.trim() {
            "L" | "l" => Some(Resolution::Local),
            "C" | "c" => Some(Resolution::Cache),
            "R" | "r" => Some(Resolution::Remote),
            _ => None,
        }
    }
}

pub fn conflicts_path(repo_root: &Path) -> PathBuf {
    repo_root.join(CONFLICTS_FILE)
}

/// Write the annotation template listing each conflicting path.
pub fn write_conflicts_file(
    repo_root: &Path,
    conflicts: &[(String, SyncState)],
) -> std::io::Result<()> {
    let mut content = String::new();
    content.push_str("# Unresolved sync conflicts.\n");
    content.push_str("# Annotate each path with L (keep local), C (keep cache), or R (keep remote),\n");
    content.push_str("# then run `dsg sync` again. Example:  input/a.csv = R\n");
    content.push('\n');
    for (path, state) in conflicts {
        content.push_str(&format!("# {}\n{} =\n", state.description(), path));
    }
    fs::write(conflicts_path(repo_root), content)
}

/// Parse annotations from an existing conflicts.txt. Lines without a valid
/// annotation are reported back as still unresolved.
pub fn parse_conflicts_file(
    repo_root: &Path,
) -> std::io::Result<(BTreeMap<String, Resolution>, Vec<String>)> {
    let content = fs::read_to_string(conflicts_path(repo_root))?;
    let mut resolutions = BTreeMap::new();
    let mut unresolved = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.rsplit_once('=') {
            Some((path, annotation)) => {
                let path = path.trim().to_string();
                match Resolution::parse(annotation) {
                    Some(r) => {
                        resolutions.insert(path, r);
                    }
                    None => unresolved.push(path),
                }
            }
            None => unresolved.push(line.to_string()),
        }
    }
    Ok((resolutions, unresolved))
}

/// Rewrite resolved conflict states to their actionable equivalents.
///
/// Returns the paths that need a working-copy backup before commit (the
/// chosen side is not local, so the local file will be replaced or kept only
/// in backup form).
pub fn apply_resolutions(
    states: &mut BTreeMap<String, SyncState>,
    resolutions: &BTreeMap<String, Resolution>,
) -> Vec<String> {
    let mut backup_paths = Vec::new();

    for (path, resolution) in resolutions {
        let Some(state) = states.get(path).copied() else {
            continue;
        };
        if !state.is_conflict() {
            continue;
        }
        let resolved = match resolution {
            // Local wins: behave as if only local changed; push.
            Resolution::Local => SyncState::sLCR__C_eq_R_ne_L,
            // Cache wins: no file operation, cache refresh only.
            Resolution::Cache => SyncState::sLCR__L_eq_R_ne_C,
            // Remote wins: behave as if only remote changed; pull.
            Resolution::Remote => SyncState::sLCR__L_eq_C_ne_R,
        };
        if *resolution != Resolution::Local {
            backup_paths.push(path.clone());
        }
        states.insert(path.clone(), resolved);
    }

    backup_paths
}

/// Remove a consumed conflicts.txt; missing file is fine.
pub fn clear_conflicts_file(repo_root: &Path) {
    let _ = fs::remove_file(conflicts_path(repo_root));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_parse_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let conflicts = vec![
            ("input/a.csv".to_string(), SyncState::sLCR__all_ne),
            ("input/b.csv".to_string(), SyncState::sLCxR__L_ne_C),
        ];
        write_conflicts_file(tmp.path(), &conflicts).unwrap();

        // Nothing annotated yet.
        let (resolutions, unresolved) = parse_conflicts_file(tmp.path()).unwrap();
        assert!(resolutions.is_empty());
        assert_eq!(unresolved.len(), 2);

        // Annotate both.
        let content = fs::read_to_string(conflicts_path(tmp.path()))
            .unwrap()
            .replace("input/a.csv =", "input/a.csv = R")
            .replace("input/b.csv =", "input/b.csv = L");
        fs::write(conflicts_path(tmp.path()), content).unwrap();

        let (resolutions, unresolved) = parse_conflicts_file(tmp.path()).unwrap();
        assert!(unresolved.is_empty());
        assert_eq!(resolutions["input/a.csv"], Resolution::Remote);
        assert_eq!(resolutions["input/b.csv"], Resolution::Local);
    }

    #[test]
    fn test_apply_resolutions_rewrites_states() {
        let mut states: BTreeMap<String, SyncState> = [
            ("a".to_string(), SyncState::sLCR__all_ne),
            ("b".to_string(), SyncState::sxLCR__C_ne_R),
            ("c".to_string(), SyncState::sLxCR__L_ne_R),
        ]
        .into_iter()
        .collect();
        let resolutions: BTreeMap<String, Resolution> = [
            ("a".to_string(), Resolution::Remote),
            ("b".to_string(), Resolution::Local),
            ("c".to_string(), Resolution::Cache),
        ]
        .into_iter()
        .collect();

        let backups = apply_resolutions(&mut states, &resolutions);
        assert_eq!(states["a"], SyncState::sLCR__L_eq_C_ne_R);
        assert_eq!(states["b"], SyncState::sLCR__C_eq_R_ne_L);
        assert_eq!(states["c"], SyncState::sLCR__L_eq_R_ne_C);
        // a (remote wins) and c (cache wins) clobber the local copy.
        assert_eq!(backups, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_apply_ignores_non_conflicts() {
        let mut states: BTreeMap<String, SyncState> =
            [("a".to_string(), SyncState::sLCR__all_eq)].into_iter().collect();
        let resolutions: BTreeMap<String, Resolution> =
            [("a".to_string(), Resolution::Remote)].into_iter().collect();
        let backups = apply_resolutions(&mut states, &resolutions);
        assert!(backups.is_empty());
        assert_eq!(states["a"], SyncState::sLCR__all_eq);
    }
}
