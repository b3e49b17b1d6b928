//! ZFS remote filesystem: atomic commit via clone-then-promote.
//!
//! The repository is a dataset `<pool>/<repo>` mounted at
//! `<mount_base>/<repo>`. A sync transaction clones a temp snapshot, stages
//! every write inside the clone, then publishes by promoting the clone and
//! swapping dataset names. Readers of the mounted path observe either the
//! pre-promote or the post-promote tree, never a half-written one.
//!
//! All `zfs` invocations go through a [`CommandRunner`] so the same code
//! drives a local pool or one behind SSH, and tests substitute a recorder.

use std::io::Read;
use std::path::PathBuf;

use super::errors::{StorageError, StorageResult};
use super::RemoteFilesystem;
use crate::observability::Logger;
use crate::transport::{
    pool, CommandRunner, ContentStream, FileContentStream, TempFile,
};

/// Where the backend's commands and files physically are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendLocation {
    Local,
    Ssh { host: String, port: u16 },
}

/// Shelled-out ZFS command sequences for init and sync transactions.
pub struct ZfsOperations {
    runner: Box<dyn CommandRunner>,
    pool_name: String,
    repo_name: String,
    mount_base: PathBuf,
}

impl ZfsOperations {
    pub fn new(
        runner: Box<dyn CommandRunner>,
        pool_name: &str,
        repo_name: &str,
        mount_base: PathBuf,
    ) -> Self {
        Self {
            runner,
            pool_name: pool_name.to_string(),
            repo_name: repo_name.to_string(),
            mount_base,
        }
    }

    fn dataset(&self) -> String {
        format!("{}/{}", self.pool_name, self.repo_name)
    }

    fn side_dataset(&self, kind: &str, tx_id: &str) -> String {
        format!("{}/{}-{}-{}", self.pool_name, self.repo_name, kind, tx_id)
    }

    fn side_mount(&self, kind: &str, tx_id: &str) -> PathBuf {
        self.mount_base
            .join(format!("{}-{}-{}", self.repo_name, kind, tx_id))
    }

    pub fn mountpoint(&self) -> PathBuf {
        self.mount_base.join(&self.repo_name)
    }

    fn zfs_checked(&self, args: &[&str]) -> StorageResult<String> {
        let mut argv = vec!["zfs"];
        argv.extend_from_slice(args);
        let output = self.runner.run(&argv)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(StorageError::zfs(&argv, output.exit_code, &output.stderr))
        }
    }

    /// Run a zfs command whose failure must not undo prior progress
    /// (cleanup destroys after a successful promotion).
    fn zfs_ignore_failure(&self, args: &[&str]) {
        let mut argv = vec!["zfs"];
        argv.extend_from_slice(args);
        match self.runner.run(&argv) {
            Ok(output) if !output.success() => {
                Logger::warn(
                    "ZFS_CLEANUP_SKIPPED",
                    &[
                        ("command", &argv.join(" ")),
                        ("stderr", output.stderr.trim()),
                    ],
                );
            }
            Err(e) => {
                Logger::warn(
                    "ZFS_CLEANUP_SKIPPED",
                    &[("command", &argv.join(" ")), ("error", e.message())],
                );
            }
            _ => {}
        }
    }

    /// Does the main dataset exist? Decides init versus sync.
    pub fn dataset_exists(&self) -> StorageResult<bool> {
        let output = self.runner.run(&["zfs", "list", &self.dataset()])?;
        Ok(output.success())
    }

    /// Create the init-side dataset and hand its mountpoint to the caller.
    pub fn begin_init(&self, tx_id: &str) -> StorageResult<PathBuf> {
        let dataset = self.side_dataset("init", tx_id);
        let mount = self.side_mount("init", tx_id);
        self.zfs_checked(&["create", &dataset])?;
        self.zfs_checked(&[
            "set",
            &format!("mountpoint={}", mount.display()),
            &dataset,
        ])?;

        // The transport writes as the invoking user, not as root.
        if let Ok(user) = std::env::var("USER") {
            let mount_str = mount.display().to_string();
            let _ = self.runner.run(&["chown", "-R", &user, &mount_str]);
            let _ = self.runner.run(&["chmod", "-R", "u+rwX", &mount_str]);
        }
        Logger::info("ZFS_INIT_BEGIN", &[("dataset", &dataset)]);
        Ok(mount)
    }

    pub fn commit_init(&self, tx_id: &str) -> StorageResult<()> {
        let temp_dataset = self.side_dataset("init", tx_id);
        let dataset = self.dataset();
        self.zfs_checked(&["rename", &temp_dataset, &dataset])?;
        self.zfs_checked(&[
            "set",
            &format!("mountpoint={}", self.mountpoint().display()),
            &dataset,
        ])?;
        self.zfs_checked(&["snapshot", &format!("{}@init-snapshot", dataset)])?;
        Logger::info("ZFS_INIT_COMMIT", &[("dataset", &dataset)]);
        Ok(())
    }

    pub fn rollback_init(&self, tx_id: &str) {
        self.zfs_ignore_failure(&["destroy", "-r", &self.side_dataset("init", tx_id)]);
        Logger::info("ZFS_INIT_ROLLBACK", &[("tx", tx_id)]);
    }

    /// Snapshot the live dataset and clone it as the staging tree.
    pub fn begin_sync(&self, tx_id: &str) -> StorageResult<PathBuf> {
        let dataset = self.dataset();
        let snapshot = format!("{}@sync-temp-{}", dataset, tx_id);
        let clone = self.side_dataset("sync", tx_id);
        let mount = self.side_mount("sync", tx_id);

        self.zfs_checked(&["snapshot", &snapshot])?;
        self.zfs_checked(&["clone", &snapshot, &clone])?;
        self.zfs_checked(&[
            "set",
            &format!("mountpoint={}", mount.display()),
            &clone,
        ])?;
        Logger::info("ZFS_SYNC_BEGIN", &[("clone", &clone)]);
        Ok(mount)
    }

    /// Publish the staged clone: safety snapshot, promote, name swap, then
    /// failure-ignored cleanup of the old dataset.
    pub fn commit_sync(&self, tx_id: &str) -> StorageResult<()> {
        let dataset = self.dataset();
        let clone = self.side_dataset("sync", tx_id);
        let old_dataset = self.side_dataset("old", tx_id);

        self.zfs_checked(&["snapshot", &format!("{}@pre-sync-{}", dataset, tx_id)])?;
        self.zfs_checked(&["promote", &clone])?;
        self.zfs_checked(&["rename", &dataset, &old_dataset])?;
        self.zfs_checked(&["rename", &clone, &dataset])?;
        self.zfs_checked(&[
            "set",
            &format!("mountpoint={}", self.mountpoint().display()),
            &dataset,
        ])?;

        // Past this point the new tree is live; cleanup must not fail the
        // commit.
        self.zfs_ignore_failure(&["destroy", &format!("{}@sync-temp-{}", dataset, tx_id)]);
        self.zfs_ignore_failure(&["destroy", "-r", &old_dataset]);
        Logger::info("ZFS_SYNC_COMMIT", &[("dataset", &dataset)]);
        Ok(())
    }

    pub fn rollback_sync(&self, tx_id: &str) {
        let dataset = self.dataset();
        let pre_sync = format!("{}@pre-sync-{}", dataset, tx_id);
        if self.snapshot_exists(&pre_sync) {
            self.zfs_ignore_failure(&["rollback", &pre_sync]);
            self.zfs_ignore_failure(&["destroy", &pre_sync]);
        }
        self.zfs_ignore_failure(&["destroy", "-r", &self.side_dataset("sync", tx_id)]);
        self.zfs_ignore_failure(&["destroy", &format!("{}@sync-temp-{}", dataset, tx_id)]);
        Logger::info("ZFS_SYNC_ROLLBACK", &[("tx", tx_id)]);
    }

    fn snapshot_exists(&self, snapshot: &str) -> bool {
        self.runner
            .run(&["zfs", "list", "-t", "snapshot", snapshot])
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxMode {
    Init,
    Sync,
}

/// RemoteFilesystem over a ZFS dataset.
pub struct ZfsFilesystem {
    ops: ZfsOperations,
    location: BackendLocation,
    mode: Option<TxMode>,
    staging_mount: Option<PathBuf>,
}

impl ZfsFilesystem {
    pub fn new(ops: ZfsOperations, location: BackendLocation) -> Self {
        Self {
            ops,
            location,
            mode: None,
            staging_mount: None,
        }
    }

    fn staging_root(&self) -> StorageResult<&PathBuf> {
        self.staging_mount
            .as_ref()
            .ok_or_else(|| StorageError::remote("no transaction in progress"))
    }

    fn staged_path(&self, rel_path: &str) -> StorageResult<PathBuf> {
        Ok(self.staging_root()?.join(rel_path))
    }

    fn run_checked(&self, argv: &[&str]) -> StorageResult<String> {
        self.ops
            .runner
            .run_checked(argv)
            .map(|o| o.stdout)
            .map_err(StorageError::from)
    }
}

impl RemoteFilesystem for ZfsFilesystem {
    fn begin(&mut self, tx_id: &str) -> StorageResult<()> {
        if self.ops.dataset_exists()? {
            self.mode = Some(TxMode::Sync);
            self.staging_mount = Some(self.ops.begin_sync(tx_id)?);
        } else {
            self.mode = Some(TxMode::Init);
            self.staging_mount = Some(self.ops.begin_init(tx_id)?);
        }
        Ok(())
    }

    fn send_file(&mut self, rel_path: &str) -> StorageResult<Box<dyn ContentStream>> {
        // The clone starts as a copy of live, so reads during a sync see the
        // pre-transaction content until this transaction overwrites it.
        let path = match &self.staging_mount {
            Some(root) => root.join(rel_path),
            None => self.ops.mountpoint().join(rel_path),
        };
        match &self.location {
            BackendLocation::Local => {
                let stream = FileContentStream::open(&path).map_err(|e| {
                    StorageError::remote_io(format!("cannot open {}", path.display()), e)
                })?;
                Ok(Box::new(stream))
            }
            BackendLocation::Ssh { host, port } => {
                let stream = pool::global()
                    .read_stream(host, *port, &path.to_string_lossy())
                    .map_err(StorageError::from)?;
                Ok(Box::new(stream))
            }
        }
    }

    fn recv_file(&mut self, rel_path: &str, temp: &mut TempFile) -> StorageResult<()> {
        let dest = self.staged_path(rel_path)?;
        let temp_str = temp.path.to_string_lossy().to_string();
        let dest_str = dest.to_string_lossy().to_string();
        if let Some(parent) = dest.parent() {
            self.run_checked(&["mkdir", "-p", &parent.to_string_lossy()])?;
        }
        self.run_checked(&["mv", &temp_str, &dest_str])?;
        temp.disarm();
        Ok(())
    }

    fn delete_file(&mut self, rel_path: &str) -> StorageResult<()> {
        let path = self.staged_path(rel_path)?;
        self.run_checked(&["rm", "-f", &path.to_string_lossy()])?;
        Ok(())
    }

    fn create_symlink(&mut self, rel_path: &str, target: &str) -> StorageResult<()> {
        let path = self.staged_path(rel_path)?;
        let link_text = super::relative_link_text(rel_path, target);
        if let Some(parent) = path.parent() {
            self.run_checked(&["mkdir", "-p", &parent.to_string_lossy()])?;
        }
        self.run_checked(&["ln", "-sfn", &link_text, &path.to_string_lossy()])?;
        Ok(())
    }

    fn is_symlink(&self, rel_path: &str) -> StorageResult<bool> {
        let path = match &self.staging_mount {
            Some(root) => root.join(rel_path),
            None => self.ops.mountpoint().join(rel_path),
        };
        let output = self
            .ops
            .runner
            .run(&["test", "-h", &path.to_string_lossy()])
            .map_err(StorageError::from)?;
        Ok(output.success())
    }

    fn symlink_target(&self, rel_path: &str) -> StorageResult<String> {
        let path = match &self.staging_mount {
            Some(root) => root.join(rel_path),
            None => self.ops.mountpoint().join(rel_path),
        };
        let text = self.run_checked(&["readlink", &path.to_string_lossy()])?;
        let text = text.trim();
        crate::manifest::entry::resolve_link_target(rel_path, text).ok_or_else(|| {
            StorageError::remote(format!(
                "remote link {} target escapes the repository: {}",
                rel_path, text
            ))
        })
    }

    fn read_file(&self, rel_path: &str) -> StorageResult<Vec<u8>> {
        let path = self.ops.mountpoint().join(rel_path);
        match &self.location {
            BackendLocation::Local => std::fs::read(&path).map_err(|e| {
                StorageError::remote_io(format!("cannot read {}", path.display()), e)
            }),
            BackendLocation::Ssh { host, port } => {
                let mut stream = pool::global()
                    .read_stream(host, *port, &path.to_string_lossy())
                    .map_err(StorageError::from)?;
                let mut content = Vec::new();
                stream.read_to_end(&mut content).map_err(|e| {
                    StorageError::remote_io(format!("cannot read {}", path.display()), e)
                })?;
                Ok(content)
            }
        }
    }

    fn file_exists(&self, rel_path: &str) -> StorageResult<bool> {
        let path = self.ops.mountpoint().join(rel_path);
        match &self.location {
            BackendLocation::Local => Ok(path.exists()),
            BackendLocation::Ssh { .. } => {
                let output = self
                    .ops
                    .runner
                    .run(&["test", "-e", &path.to_string_lossy()])
                    .map_err(StorageError::from)?;
                Ok(output.success())
            }
        }
    }

    fn commit(&mut self, tx_id: &str) -> StorageResult<()> {
        match self.mode {
            Some(TxMode::Init) => self.ops.commit_init(tx_id)?,
            Some(TxMode::Sync) => self.ops.commit_sync(tx_id)?,
            None => return Err(StorageError::remote("commit without begin")),
        }
        self.mode = None;
        self.staging_mount = None;
        Ok(())
    }

    fn rollback(&mut self, tx_id: &str) -> StorageResult<()> {
        match self.mode {
            Some(TxMode::Init) => self.ops.rollback_init(tx_id),
            Some(TxMode::Sync) => self.ops.rollback_sync(tx_id),
            None => {}
        }
        self.mode = None;
        self.staging_mount = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CommandOutput;
    use std::sync::Mutex;

    /// Records every command; scripted exit codes per command prefix.
    struct FakeRunner {
        calls: std::sync::Arc<Mutex<Vec<Vec<String>>>>,
        fail_prefixes: Vec<(Vec<String>, i32)>,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                calls: std::sync::Arc::new(Mutex::new(Vec::new())),
                fail_prefixes: Vec::new(),
            }
        }

        fn failing_on(mut self, prefix: &[&str], code: i32) -> Self {
            self.fail_prefixes
                .push((prefix.iter().map(|s| s.to_string()).collect(), code));
            self
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            argv: &[&str],
        ) -> crate::transport::TransportResult<CommandOutput> {
            let call: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
            self.calls.lock().unwrap().push(call.clone());
            for (prefix, code) in &self.fail_prefixes {
                if call.len() >= prefix.len() && &call[..prefix.len()] == prefix.as_slice()
                {
                    return Ok(CommandOutput {
                        exit_code: *code,
                        stdout: String::new(),
                        stderr: "scripted failure".to_string(),
                    });
                }
            }
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn ops_with(
        runner: FakeRunner,
    ) -> (ZfsOperations, std::sync::Arc<Mutex<Vec<Vec<String>>>>) {
        let calls = std::sync::Arc::clone(&runner.calls);
        let ops = ZfsOperations::new(
            Box::new(runner),
            "dsgtest",
            "test-repo",
            PathBuf::from("/var/tmp/test"),
        );
        (ops, calls)
    }

    fn recorded(calls: &std::sync::Arc<Mutex<Vec<Vec<String>>>>) -> Vec<Vec<String>> {
        calls.lock().unwrap().clone()
    }

    #[test]
    fn test_detect_init_when_dataset_missing() {
        let runner = FakeRunner::new().failing_on(&["zfs", "list"], 1);
        let (ops, _) = ops_with(runner);
        assert!(!ops.dataset_exists().unwrap());
    }

    #[test]
    fn test_detect_sync_when_dataset_exists() {
        let (ops, _) = ops_with(FakeRunner::new());
        assert!(ops.dataset_exists().unwrap());
    }

    #[test]
    fn test_begin_init_command_sequence() {
        let (ops, calls) = ops_with(FakeRunner::new());
        let mount = ops.begin_init("tx-abc123").unwrap();
        assert_eq!(mount, PathBuf::from("/var/tmp/test/test-repo-init-tx-abc123"));

        let recorded = recorded(&calls);
        assert_eq!(
            recorded[0],
            vec!["zfs", "create", "dsgtest/test-repo-init-tx-abc123"]
        );
        assert_eq!(
            recorded[1],
            vec![
                "zfs",
                "set",
                "mountpoint=/var/tmp/test/test-repo-init-tx-abc123",
                "dsgtest/test-repo-init-tx-abc123"
            ]
        );
    }

    #[test]
    fn test_commit_init_command_sequence() {
        let (ops, calls) = ops_with(FakeRunner::new());
        ops.commit_init("tx-abc123").unwrap();
        let recorded = recorded(&calls);
        assert_eq!(
            recorded[0],
            vec![
                "zfs",
                "rename",
                "dsgtest/test-repo-init-tx-abc123",
                "dsgtest/test-repo"
            ]
        );
        assert_eq!(
            recorded[1],
            vec![
                "zfs",
                "set",
                "mountpoint=/var/tmp/test/test-repo",
                "dsgtest/test-repo"
            ]
        );
        assert_eq!(
            recorded[2],
            vec!["zfs", "snapshot", "dsgtest/test-repo@init-snapshot"]
        );
    }

    #[test]
    fn test_begin_sync_command_sequence() {
        let (ops, calls) = ops_with(FakeRunner::new());
        let mount = ops.begin_sync("tx-def456").unwrap();
        assert_eq!(mount, PathBuf::from("/var/tmp/test/test-repo-sync-tx-def456"));

        let recorded = recorded(&calls);
        assert_eq!(
            recorded[0],
            vec!["zfs", "snapshot", "dsgtest/test-repo@sync-temp-tx-def456"]
        );
        assert_eq!(
            recorded[1],
            vec![
                "zfs",
                "clone",
                "dsgtest/test-repo@sync-temp-tx-def456",
                "dsgtest/test-repo-sync-tx-def456"
            ]
        );
        assert_eq!(
            recorded[2],
            vec![
                "zfs",
                "set",
                "mountpoint=/var/tmp/test/test-repo-sync-tx-def456",
                "dsgtest/test-repo-sync-tx-def456"
            ]
        );
    }

    #[test]
    fn test_commit_sync_promote_sequence() {
        let (ops, calls) = ops_with(FakeRunner::new());
        ops.commit_sync("tx-def456").unwrap();
        let recorded = recorded(&calls);
        assert_eq!(
            recorded[0],
            vec!["zfs", "snapshot", "dsgtest/test-repo@pre-sync-tx-def456"]
        );
        assert_eq!(
            recorded[1],
            vec!["zfs", "promote", "dsgtest/test-repo-sync-tx-def456"]
        );
        assert_eq!(
            recorded[2],
            vec![
                "zfs",
                "rename",
                "dsgtest/test-repo",
                "dsgtest/test-repo-old-tx-def456"
            ]
        );
        assert_eq!(
            recorded[3],
            vec![
                "zfs",
                "rename",
                "dsgtest/test-repo-sync-tx-def456",
                "dsgtest/test-repo"
            ]
        );
        // Cleanup destroys come last.
        let destroys: Vec<_> = recorded
            .iter()
            .filter(|c| c.get(1).map(String::as_str) == Some("destroy"))
            .collect();
        assert_eq!(destroys.len(), 2);
        assert_eq!(destroys[0][2], "dsgtest/test-repo@sync-temp-tx-def456");
        assert_eq!(destroys[1][2], "-r");
        assert_eq!(destroys[1][3], "dsgtest/test-repo-old-tx-def456");
    }

    #[test]
    fn test_commit_sync_cleanup_failure_does_not_fail_commit() {
        let runner = FakeRunner::new().failing_on(&["zfs", "destroy"], 1);
        let (ops, _) = ops_with(runner);
        // Destroys fail, promotion stands.
        ops.commit_sync("tx-def456").unwrap();
    }

    #[test]
    fn test_commit_sync_promote_failure_is_fatal() {
        let runner = FakeRunner::new().failing_on(&["zfs", "promote"], 1);
        let (ops, _) = ops_with(runner);
        let err = ops.commit_sync("tx-def456").unwrap_err();
        assert_eq!(err.code().code(), "DSG_ZFS_OPERATION");
        assert!(err.details().unwrap().contains("zfs promote"));
    }

    #[test]
    fn test_rollback_sync_uses_pre_sync_snapshot() {
        let (ops, calls) = ops_with(FakeRunner::new());
        ops.rollback_sync("tx-def456");
        let recorded = recorded(&calls);
        // First the snapshot existence probe, then rollback + cleanup.
        assert_eq!(recorded[0][..3].join(" "), "zfs list -t");
        assert!(recorded
            .iter()
            .any(|c| c.get(1).map(String::as_str) == Some("rollback")));
        assert!(recorded
            .iter()
            .any(|c| c.contains(&"dsgtest/test-repo-sync-tx-def456".to_string())));
    }

    #[test]
    fn test_filesystem_auto_detects_init() {
        let runner = FakeRunner::new().failing_on(&["zfs", "list"], 1);
        let ops = ZfsOperations::new(
            Box::new(runner),
            "dsgtest",
            "test-repo",
            PathBuf::from("/var/tmp/test"),
        );
        let mut fs = ZfsFilesystem::new(ops, BackendLocation::Local);
        fs.begin("tx-abc123").unwrap();
        assert_eq!(fs.mode, Some(TxMode::Init));
    }

    #[test]
    fn test_filesystem_auto_detects_sync() {
        let ops = ZfsOperations::new(
            Box::new(FakeRunner::new()),
            "dsgtest",
            "test-repo",
            PathBuf::from("/var/tmp/test"),
        );
        let mut fs = ZfsFilesystem::new(ops, BackendLocation::Local);
        fs.begin("tx-def456").unwrap();
        assert_eq!(fs.mode, Some(TxMode::Sync));
        assert!(fs.staging_mount.is_some());
    }
}
