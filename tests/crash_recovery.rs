//! Crash-window recovery scenarios.
//!
//! A client commit can be interrupted between the transaction marker write
//! and the final renames. Reopening the repository must complete the
//! interrupted commit deterministically before any new operation runs.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use dsg::config::{
    BackendType, Config, IgnoreSettings, ProjectConfig, ProjectSettings,
    SshRepositoryConfig, TransportKind, UserConfig,
};
use dsg::lifecycle::{init_repository, sync_repository, SyncOptions};
use dsg::storage::ClientFilesystem;

fn make_config(workdir: &Path, remote_base: &Path) -> Config {
    Config {
        user: UserConfig {
            user_name: "alice".to_string(),
            user_id: "alice@example.org".to_string(),
            backup_on_conflict: true,
            default_host: None,
            default_project_path: None,
            local_log: None,
        },
        project: ProjectConfig {
            name: Some("crash-repo".to_string()),
            transport: TransportKind::Ssh,
            ssh: Some(SshRepositoryConfig {
                host: "localhost".to_string(),
                path: remote_base.to_path_buf(),
                name: None,
                backend_type: BackendType::Xfs,
                port: None,
            }),
            rclone: None,
            ipfs: None,
            project: ProjectSettings {
                data_dirs: ["input"].iter().map(|s| s.to_string()).collect(),
                ignore: IgnoreSettings::default(),
            },
        },
        project_root: workdir.to_path_buf(),
    }
}

/// Leave the debris of a commit that died right after its marker was
/// written: marker present, content still in staging.
fn plant_interrupted_commit(root: &Path, tx_id: &str, rel: &str, content: &[u8]) {
    let staging = root.join(".dsg/staging").join(tx_id);
    let staged = staging.join(rel);
    fs::create_dir_all(staged.parent().unwrap()).unwrap();
    fs::write(&staged, content).unwrap();

    let backup_dir = root.join(".dsg/backup");
    fs::create_dir_all(&backup_dir).unwrap();
    fs::write(
        backup_dir.join("transaction-in-progress"),
        format!(
            r#"{{"tx_id":"{}","files":["{}"],"tombstones":[]}}"#,
            tx_id, rel
        ),
    )
    .unwrap();
}

#[test]
fn test_recover_promotes_files_the_marker_lists() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("input")).unwrap();
    fs::create_dir_all(root.join(".dsg")).unwrap();

    plant_interrupted_commit(root, "tx-cafe0001", "input/landed.csv", b"made it\n");
    assert!(ClientFilesystem::recover(root).unwrap());

    assert_eq!(fs::read(root.join("input/landed.csv")).unwrap(), b"made it\n");
    assert!(!root.join(".dsg/backup").exists());
    assert!(!root.join(".dsg/staging/tx-cafe0001").exists());
}

#[test]
fn test_recover_is_a_noop_without_marker() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join(".dsg")).unwrap();
    assert!(!ClientFilesystem::recover(tmp.path()).unwrap());
}

#[test]
fn test_sync_after_crash_finishes_the_interrupted_commit_first() {
    let remote = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    fs::create_dir_all(work.path().join("input")).unwrap();
    fs::write(work.path().join("input/a.csv"), b"base\n").unwrap();
    let config = make_config(work.path(), remote.path());

    init_repository(&config, &SyncOptions::default()).unwrap();

    // A download crashed mid-commit: the file sits in staging with its
    // marker. The next sync must promote it, then treat it as local state.
    plant_interrupted_commit(
        work.path(),
        "tx-cafe0002",
        "input/recovered.csv",
        b"from the crashed transaction\n",
    );

    let outcome = sync_repository(&config, &SyncOptions::default()).unwrap();
    assert_eq!(
        fs::read(work.path().join("input/recovered.csv")).unwrap(),
        b"from the crashed transaction\n"
    );
    assert!(!work.path().join(".dsg/backup/transaction-in-progress").exists());
    // The recovered file is now ordinary local content and was pushed.
    assert_eq!(outcome.uploads, 1);
    assert_eq!(outcome.snapshot_id.as_deref(), Some("s2"));
}

#[test]
fn test_interrupted_then_recovered_equals_clean_state() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("input")).unwrap();
    fs::create_dir_all(root.join(".dsg")).unwrap();
    fs::write(root.join("input/old.csv"), b"stale\n").unwrap();

    // Crash happened after some renames: one file already promoted, one
    // still pending next to its target, one tombstone unapplied.
    let tx = "tx-cafe0003";
    fs::write(root.join("input/done.csv"), b"already promoted\n").unwrap();
    fs::write(
        root.join(format!("input/late.csv.pending-{}", tx)),
        b"parked\n",
    )
    .unwrap();
    let backup_dir = root.join(".dsg/backup");
    fs::create_dir_all(&backup_dir).unwrap();
    fs::write(
        backup_dir.join("transaction-in-progress"),
        format!(
            r#"{{"tx_id":"{}","files":["input/done.csv","input/late.csv"],"tombstones":["input/old.csv"]}}"#,
            tx
        ),
    )
    .unwrap();

    assert!(ClientFilesystem::recover(root).unwrap());
    assert_eq!(fs::read(root.join("input/done.csv")).unwrap(), b"already promoted\n");
    assert_eq!(fs::read(root.join("input/late.csv")).unwrap(), b"parked\n");
    assert!(!root.join("input/old.csv").exists());
    assert!(!root.join(format!("input/late.csv.pending-{}", tx)).exists());
}
