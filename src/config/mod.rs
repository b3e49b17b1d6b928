//! User and project configuration.
//!
//! User config (`dsg.yml`) merges across four locations, lowest to highest
//! priority: `/etc/dsg/`, `~/.config/dsg/`, `$XDG_CONFIG_HOME/dsg/`,
//! `$DSG_CONFIG_HOME/`. System configs under `/etc/dsg/` must not carry
//! personal identity fields; that is an error, not a warning.
//!
//! Project config (`.dsgconfig.yml`) names the repository, selects the
//! transport, and declares which top-level directories hold data plus the
//! ignore rules the scanner applies.

pub mod errors;

use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use errors::{ConfigError, ConfigResult};

/// User config filename.
pub const USER_CFG: &str = "dsg.yml";

/// Fields that must never appear in a system-wide config.
pub const PERSONAL_FIELDS: [&str; 2] = ["user_name", "user_id"];

fn default_true() -> bool {
    true
}

// ---- project config ----

/// Backend storage flavor behind an SSH transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Zfs,
    Xfs,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ssh,
    Rclone,
    Ipfs,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ssh => "ssh",
            TransportKind::Rclone => "rclone",
            TransportKind::Ipfs => "ipfs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshRepositoryConfig {
    pub host: String,
    /// Repository parent path on the remote host (ZFS mount base or plain dir).
    pub path: PathBuf,
    /// Legacy field; prefer top-level `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RcloneRepositoryConfig {
    pub remote: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpfsRepositoryConfig {
    pub did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub encrypted: bool,
}

fn default_names() -> BTreeSet<String> {
    [".DS_Store", ".Rdata", ".rdata", ".RData", ".Rproj.user"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_suffixes() -> BTreeSet<String> {
    [".tmp", ".pyc"].iter().map(|s| s.to_string()).collect()
}

fn default_data_dirs() -> BTreeSet<String> {
    ["input", "output", "frozen"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Scanner ignore rules from project config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IgnoreSettings {
    /// Exact repo-relative paths.
    #[serde(default)]
    pub paths: BTreeSet<String>,
    /// Literal file or directory names, matched anywhere.
    #[serde(default = "default_names")]
    pub names: BTreeSet<String>,
    /// Filename suffixes.
    #[serde(default = "default_suffixes")]
    pub suffixes: BTreeSet<String>,
}

impl Default for IgnoreSettings {
    fn default() -> Self {
        Self {
            paths: BTreeSet::new(),
            names: default_names(),
            suffixes: default_suffixes(),
        }
    }
}

impl IgnoreSettings {
    /// Strip trailing slashes from path rules so `output/tmp/` and
    /// `output/tmp` match the same directory.
    pub fn normalized(mut self) -> Self {
        self.paths = self
            .paths
            .into_iter()
            .map(|p| p.trim_end_matches('/').to_string())
            .collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSettings {
    /// Top-level directory names that are inside the repository for sync.
    #[serde(default = "default_data_dirs")]
    pub data_dirs: BTreeSet<String>,
    #[serde(default)]
    pub ignore: IgnoreSettings,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            data_dirs: default_data_dirs(),
            ignore: IgnoreSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Repository name; auto-migrated from the transport section when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshRepositoryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rclone: Option<RcloneRepositoryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipfs: Option<IpfsRepositoryConfig>,
    #[serde(default)]
    pub project: ProjectSettings,
}

impl ProjectConfig {
    /// Validate transport consistency and migrate the legacy name field.
    pub fn finalize(mut self) -> ConfigResult<Self> {
        let set_count = [
            self.ssh.is_some(),
            self.rclone.is_some(),
            self.ipfs.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if set_count != 1 {
            return Err(ConfigError::invalid(
                "exactly one transport section (ssh, rclone, or ipfs) must be set",
            ));
        }
        let section_matches = match self.transport {
            TransportKind::Ssh => self.ssh.is_some(),
            TransportKind::Rclone => self.rclone.is_some(),
            TransportKind::Ipfs => self.ipfs.is_some(),
        };
        if !section_matches {
            return Err(ConfigError::invalid(format!(
                "transport is {} but that section is missing",
                self.transport.as_str()
            )));
        }

        if self.name.is_none() {
            // Legacy configs carried the repository name inside the
            // transport section.
            self.name = match self.transport {
                TransportKind::Ssh => self.ssh.as_ref().and_then(|s| s.name.clone()),
                TransportKind::Rclone => self.rclone.as_ref().and_then(|s| s.name.clone()),
                TransportKind::Ipfs => self.ipfs.as_ref().and_then(|s| s.name.clone()),
            };
        }
        if self.name.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::invalid(
                "repository name is required (top level or in the transport section)",
            ));
        }
        self.project.ignore = std::mem::take(&mut self.project.ignore).normalized();
        Ok(self)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::io_error(format!("cannot read {}", path.display()), e)
        })?;
        let config: ProjectConfig = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::parse_error(format!("bad YAML in {}: {}", path.display(), e))
        })?;
        config.finalize()
    }

    /// Repository name; only valid after [`finalize`](Self::finalize).
    pub fn repo_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Embeddable JSON form for manifest auditing.
    pub fn to_audit_value(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self).ok()
    }
}

// ---- user config ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    pub user_name: String,
    /// Email-shaped identity recorded as the last-modifier on entries.
    pub user_id: String,
    /// Back up working-copy files before a conflicting overwrite.
    #[serde(default = "default_true")]
    pub backup_on_conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_project_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_log: Option<PathBuf>,
}

impl UserConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.user_name.trim().is_empty() {
            return Err(ConfigError::invalid("user_name must not be empty"));
        }
        let id = self.user_id.as_str();
        let at = id.find('@');
        let valid = match at {
            Some(idx) => idx > 0 && id[idx + 1..].contains('.'),
            None => false,
        };
        if !valid {
            return Err(ConfigError::invalid(format!(
                "user_id must be email-shaped, got {:?}",
                id
            )));
        }
        Ok(())
    }
}

/// Search paths for `dsg.yml`, lowest priority first. Empty env vars are
/// skipped so `$XDG_CONFIG_HOME=` does not turn into a root-relative path.
pub fn user_config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/dsg").join(USER_CFG)];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join("dsg").join(USER_CFG));
    }
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            paths.push(PathBuf::from(xdg).join("dsg").join(USER_CFG));
        }
    }
    if let Ok(explicit) = env::var("DSG_CONFIG_HOME") {
        if !explicit.is_empty() {
            paths.push(PathBuf::from(explicit).join(USER_CFG));
        }
    }
    paths
}

fn is_system_config(path: &Path) -> bool {
    path.starts_with("/etc/dsg")
}

/// Reject personal fields in system configs.
fn check_system_config(
    mapping: &serde_yaml::Mapping,
    path: &Path,
) -> ConfigResult<()> {
    let mut found: Vec<&str> = Vec::new();
    for field in PERSONAL_FIELDS {
        if mapping.contains_key(&serde_yaml::Value::String(field.to_string())) {
            found.push(field);
        }
    }
    if found.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::personal_fields(format!(
            "system config {} contains personal fields: {}",
            path.display(),
            found.join(", ")
        )))
    }
}

/// Load and merge user config from every search location, later wins.
pub fn load_merged_user_config() -> ConfigResult<UserConfig> {
    load_merged_user_config_from(&user_config_search_paths())
}

/// Same, with explicit candidates (used by tests).
pub fn load_merged_user_config_from(candidates: &[PathBuf]) -> ConfigResult<UserConfig> {
    let mut merged = serde_yaml::Mapping::new();
    let mut found = false;

    for candidate in candidates {
        if !candidate.exists() {
            continue;
        }
        let content = std::fs::read_to_string(candidate).map_err(|e| {
            ConfigError::io_error(format!("cannot read {}", candidate.display()), e)
        })?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::parse_error(format!("bad YAML in {}: {}", candidate.display(), e))
        })?;
        let mapping = match value {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            _ => {
                return Err(ConfigError::parse_error(format!(
                    "{} is not a YAML mapping",
                    candidate.display()
                )))
            }
        };
        if is_system_config(candidate) {
            check_system_config(&mapping, candidate)?;
        }
        for (k, v) in mapping {
            merged.insert(k, v);
        }
        found = true;
    }

    if !found {
        return Err(ConfigError::missing(format!(
            "no {} found in /etc/dsg, ~/.config/dsg, $XDG_CONFIG_HOME/dsg, or $DSG_CONFIG_HOME",
            USER_CFG
        )));
    }

    let config: UserConfig =
        serde_yaml::from_value(serde_yaml::Value::Mapping(merged)).map_err(|e| {
            ConfigError::parse_error(format!("merged user config invalid: {}", e))
        })?;
    config.validate()?;
    Ok(config)
}

/// Walk up from `start` looking for `.dsgconfig.yml`.
pub fn find_project_config_path(start: &Path) -> ConfigResult<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        let candidate = dir.join(crate::layout::PROJECT_CONFIG_FILE);
        if candidate.exists() {
            return Ok(candidate);
        }
        current = dir.parent();
    }
    Err(ConfigError::missing(format!(
        "no {} found in {} or any parent",
        crate::layout::PROJECT_CONFIG_FILE,
        start.display()
    ))
    .with_hint("run dsg from inside a repository, or create one with dsg init"))
}

/// Combined user + project configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub user: UserConfig,
    pub project: ProjectConfig,
    pub project_root: PathBuf,
}

impl Config {
    pub fn load(start: &Path) -> ConfigResult<Config> {
        let user = load_merged_user_config()?;
        let project_path = find_project_config_path(start)?;
        let project_root = project_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let project = ProjectConfig::load(&project_path)?;
        Ok(Config {
            user,
            project,
            project_root,
        })
    }
}

/// Collect validation problems without failing on the first.
pub fn validate_config(start: &Path) -> Vec<String> {
    let mut problems = Vec::new();

    match find_project_config_path(start) {
        Ok(path) => {
            if let Err(e) = ProjectConfig::load(&path) {
                problems.push(format!("project config: {}", e));
            }
        }
        Err(e) => {
            problems.push(format!("project config: {}", e));
            return problems;
        }
    }

    match load_merged_user_config() {
        Ok(user) => {
            if let Some(log_dir) = &user.local_log {
                if !log_dir.is_absolute() {
                    problems.push(format!(
                        "local_log path must be absolute: {}",
                        log_dir.display()
                    ));
                }
            }
        }
        Err(e) => problems.push(format!("user config: {}", e)),
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROJECT_YAML: &str = r#"
name: test-repo
transport: ssh
ssh:
  host: storage.example.org
  path: /var/repos/zsd
  type: zfs
project:
  data_dirs: [input, output]
  ignore:
    names: [.DS_Store]
    suffixes: [.tmp]
    paths: [output/scratch/]
"#;

    #[test]
    fn test_project_config_parses() {
        let config: ProjectConfig = serde_yaml::from_str(PROJECT_YAML).unwrap();
        let config = config.finalize().unwrap();
        assert_eq!(config.repo_name(), "test-repo");
        assert_eq!(config.transport, TransportKind::Ssh);
        let ssh = config.ssh.as_ref().unwrap();
        assert_eq!(ssh.backend_type, BackendType::Zfs);
        // Trailing slash stripped.
        assert!(config.project.ignore.paths.contains("output/scratch"));
    }

    #[test]
    fn test_legacy_name_migration() {
        let yaml = r#"
transport: ssh
ssh:
  host: h
  path: /srv
  name: legacy-name
  type: xfs
"#;
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        let config = config.finalize().unwrap();
        assert_eq!(config.repo_name(), "legacy-name");
    }

    #[test]
    fn test_transport_section_mismatch_rejected() {
        let yaml = r#"
name: r
transport: rclone
ssh:
  host: h
  path: /srv
  type: zfs
"#;
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.finalize().is_err());
    }

    #[test]
    fn test_missing_name_rejected() {
        let yaml = r#"
transport: ssh
ssh:
  host: h
  path: /srv
  type: zfs
"#;
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.finalize().is_err());
    }

    #[test]
    fn test_user_config_merge_and_precedence() {
        let tmp = TempDir::new().unwrap();
        let low = tmp.path().join("low");
        let high = tmp.path().join("high");
        std::fs::create_dir_all(&low).unwrap();
        std::fs::create_dir_all(&high).unwrap();
        std::fs::write(
            low.join(USER_CFG),
            "user_name: PB\nuser_id: pb@example.org\ndefault_host: old.example.org\n",
        )
        .unwrap();
        std::fs::write(high.join(USER_CFG), "default_host: new.example.org\n").unwrap();

        let config = load_merged_user_config_from(&[
            low.join(USER_CFG),
            high.join(USER_CFG),
        ])
        .unwrap();
        assert_eq!(config.user_name, "PB");
        assert_eq!(config.default_host.as_deref(), Some("new.example.org"));
        assert!(config.backup_on_conflict);
    }

    #[test]
    fn test_user_id_must_be_email_shaped() {
        let config = UserConfig {
            user_name: "PB".to_string(),
            user_id: "not-an-email".to_string(),
            backup_on_conflict: true,
            default_host: None,
            default_project_path: None,
            local_log: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_find_project_config_walks_up() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".dsgconfig.yml"), PROJECT_YAML).unwrap();
        let nested = tmp.path().join("input").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        let found = find_project_config_path(&nested).unwrap();
        assert_eq!(found, tmp.path().join(".dsgconfig.yml"));
    }
}
