//! Ignore rules for the working-directory walk.
//!
//! Three user-configurable layers (names, suffixes, exact paths) on top of a
//! fixed always-ignored set. Files outside the configured `data_dirs`
//! top-levels are outside the repository for sync purposes.

use std::collections::BTreeSet;

use crate::config::ProjectSettings;

/// Names ignored everywhere, regardless of configuration.
pub const ALWAYS_IGNORED_NAMES: [&str; 7] = [
    ".dsg",
    ".git",
    ".snap",
    ".zfs",
    "HEAD",
    "lost+found",
    "__pycache__",
];

/// Hidden components that are nonetheless allowed.
const ALLOWED_HIDDEN: [&str; 2] = [".dsg", ".zfs"];

#[derive(Debug, Clone)]
pub struct IgnoreRules {
    data_dirs: BTreeSet<String>,
    names: BTreeSet<String>,
    suffixes: BTreeSet<String>,
    paths: BTreeSet<String>,
}

impl IgnoreRules {
    pub fn from_settings(settings: &ProjectSettings) -> Self {
        Self {
            data_dirs: settings.data_dirs.clone(),
            names: settings.ignore.names.clone(),
            suffixes: settings.ignore.suffixes.clone(),
            paths: settings.ignore.paths.clone(),
        }
    }

    fn is_always_ignored(name: &str) -> bool {
        if ALWAYS_IGNORED_NAMES.contains(&name) {
            return true;
        }
        name.starts_with('.') && !ALLOWED_HIDDEN.contains(&name)
    }

    /// Should a directory at `rel_path` be pruned from the walk entirely?
    /// `rel_path` is repo-relative with `/` separators; the name is its last
    /// component.
    pub fn prune_dir(&self, rel_path: &str) -> bool {
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        if Self::is_always_ignored(name) {
            return true;
        }
        if self.names.contains(name) {
            return true;
        }
        if self.paths.contains(rel_path) {
            return true;
        }
        // Top-level directories must be declared data_dirs.
        if !rel_path.contains('/') && !self.data_dirs.contains(rel_path) {
            return true;
        }
        false
    }

    /// Should a file or symlink at `rel_path` be skipped?
    pub fn skip_file(&self, rel_path: &str) -> bool {
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        if Self::is_always_ignored(name) {
            return true;
        }
        if self.names.contains(name) {
            return true;
        }
        if self.suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            return true;
        }
        if self.paths.contains(rel_path) {
            return true;
        }
        // Top-level loose files are outside every data_dir.
        if !rel_path.contains('/') {
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IgnoreSettings, ProjectSettings};

    fn rules() -> IgnoreRules {
        let mut settings = ProjectSettings::default();
        settings.ignore = IgnoreSettings {
            paths: ["output/scratch".to_string()].into_iter().collect(),
            names: [".DS_Store".to_string()].into_iter().collect(),
            suffixes: [".tmp".to_string()].into_iter().collect(),
        };
        IgnoreRules::from_settings(&settings)
    }

    #[test]
    fn test_data_dirs_gate_top_level() {
        let r = rules();
        assert!(!r.prune_dir("input"));
        assert!(!r.prune_dir("output"));
        assert!(r.prune_dir("docs"));
        assert!(r.skip_file("README.md"));
    }

    #[test]
    fn test_always_ignored() {
        let r = rules();
        assert!(r.prune_dir(".git"));
        assert!(r.prune_dir("input/__pycache__"));
        assert!(r.skip_file("input/HEAD"));
        assert!(r.skip_file("input/.hidden"));
    }

    #[test]
    fn test_configured_rules() {
        let r = rules();
        assert!(r.skip_file("input/.DS_Store"));
        assert!(r.skip_file("input/build.tmp"));
        assert!(r.prune_dir("output/scratch"));
        assert!(r.skip_file("output/scratch"));
        assert!(!r.skip_file("input/a.csv"));
    }
}
