//! Plain-POSIX remote filesystem.
//!
//! For backends without snapshot semantics: staging is a sibling directory
//! `<repo>.staging-<tx>` populated from the live tree, and commit is a
//! two-step rename (live away, staging in) followed by removal of the old
//! copy. The window between the renames is not atomic; the distributed lock
//! guarantees no other reader is active, which is the only configuration
//! this backend is suitable for.

use std::io::Read;
use std::path::PathBuf;

use super::errors::{StorageError, StorageResult};
use super::zfs::BackendLocation;
use super::RemoteFilesystem;
use crate::observability::Logger;
use crate::transport::{pool, CommandRunner, ContentStream, FileContentStream, TempFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxMode {
    Init,
    Sync,
}

pub struct XfsFilesystem {
    runner: Box<dyn CommandRunner>,
    location: BackendLocation,
    /// Live repository directory.
    repo_path: PathBuf,
    mode: Option<TxMode>,
    staging: Option<PathBuf>,
}

impl XfsFilesystem {
    pub fn new(
        runner: Box<dyn CommandRunner>,
        location: BackendLocation,
        repo_path: PathBuf,
    ) -> Self {
        Self {
            runner,
            location,
            repo_path,
            mode: None,
            staging: None,
        }
    }

    fn sibling(&self, suffix: &str, tx_id: &str) -> PathBuf {
        let name = self
            .repo_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.repo_path
            .with_file_name(format!("{}.{}-{}", name, suffix, tx_id))
    }

    fn run_checked(&self, argv: &[&str]) -> StorageResult<String> {
        self.runner
            .run_checked(argv)
            .map(|o| o.stdout)
            .map_err(StorageError::from)
    }

    fn path_exists(&self, path: &PathBuf) -> StorageResult<bool> {
        match &self.location {
            BackendLocation::Local => Ok(path.exists()),
            BackendLocation::Ssh { .. } => {
                let output = self
                    .runner
                    .run(&["test", "-e", &path.to_string_lossy()])
                    .map_err(StorageError::from)?;
                Ok(output.success())
            }
        }
    }

    fn staging_root(&self) -> StorageResult<&PathBuf> {
        self.staging
            .as_ref()
            .ok_or_else(|| StorageError::remote("no transaction in progress"))
    }
}

impl RemoteFilesystem for XfsFilesystem {
    fn begin(&mut self, tx_id: &str) -> StorageResult<()> {
        let staging = self.sibling("staging", tx_id);
        if self.path_exists(&self.repo_path.clone())? {
            self.mode = Some(TxMode::Sync);
            // Staging starts as a full copy of live, so unchanged files
            // survive the rename swap.
            self.run_checked(&[
                "cp",
                "-a",
                &self.repo_path.to_string_lossy(),
                &staging.to_string_lossy(),
            ])?;
        } else {
            self.mode = Some(TxMode::Init);
            self.run_checked(&["mkdir", "-p", &staging.to_string_lossy()])?;
        }
        Logger::info(
            "XFS_TX_BEGIN",
            &[
                ("staging", &staging.display().to_string()),
                ("mode", if self.mode == Some(TxMode::Init) { "init" } else { "sync" }),
            ],
        );
        self.staging = Some(staging);
        Ok(())
    }

    fn send_file(&mut self, rel_path: &str) -> StorageResult<Box<dyn ContentStream>> {
        let path = match &self.staging {
            Some(root) => root.join(rel_path),
            None => self.repo_path.join(rel_path),
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
        let dest = self.staging_root()?.join(rel_path);
        if let Some(parent) = dest.parent() {
            self.run_checked(&["mkdir", "-p", &parent.to_string_lossy()])?;
        }
        self.run_checked(&[
            "mv",
            &temp.path.to_string_lossy(),
            &dest.to_string_lossy(),
        ])?;
        temp.disarm();
        Ok(())
    }

    fn delete_file(&mut self, rel_path: &str) -> StorageResult<()> {
        let path = self.staging_root()?.join(rel_path);
        self.run_checked(&["rm", "-f", &path.to_string_lossy()])?;
        Ok(())
    }

    fn create_symlink(&mut self, rel_path: &str, target: &str) -> StorageResult<()> {
        let path = self.staging_root()?.join(rel_path);
        let link_text = super::relative_link_text(rel_path, target);
        if let Some(parent) = path.parent() {
            self.run_checked(&["mkdir", "-p", &parent.to_string_lossy()])?;
        }
        self.run_checked(&["ln", "-sfn", &link_text, &path.to_string_lossy()])?;
        Ok(())
    }

    fn is_symlink(&self, rel_path: &str) -> StorageResult<bool> {
        let path = match &self.staging {
            Some(root) => root.join(rel_path),
            None => self.repo_path.join(rel_path),
        };
        let output = self
            .runner
            .run(&["test", "-h", &path.to_string_lossy()])
            .map_err(StorageError::from)?;
        Ok(output.success())
    }

    fn symlink_target(&self, rel_path: &str) -> StorageResult<String> {
        let path = match &self.staging {
            Some(root) => root.join(rel_path),
            None => self.repo_path.join(rel_path),
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
        let path = self.repo_path.join(rel_path);
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
        self.path_exists(&self.repo_path.join(rel_path))
    }

    fn commit(&mut self, tx_id: &str) -> StorageResult<()> {
        let staging = self.staging_root()?.clone();
        match self.mode {
            Some(TxMode::Init) => {
                if let Some(parent) = self.repo_path.parent() {
                    self.run_checked(&["mkdir", "-p", &parent.to_string_lossy()])?;
                }
                self.run_checked(&[
                    "mv",
                    &staging.to_string_lossy(),
                    &self.repo_path.to_string_lossy(),
                ])?;
            }
            Some(TxMode::Sync) => {
                let old = self.sibling("old", tx_id);
                // Two renames; not atomic, but no reader is active under
                // the repository lock.
                self.run_checked(&[
                    "mv",
                    &self.repo_path.to_string_lossy(),
                    &old.to_string_lossy(),
                ])?;
                self.run_checked(&[
                    "mv",
                    &staging.to_string_lossy(),
                    &self.repo_path.to_string_lossy(),
                ])?;
                if let Err(e) = self.run_checked(&["rm", "-rf", &old.to_string_lossy()])
                {
                    Logger::warn(
                        "XFS_OLD_CLEANUP_SKIPPED",
                        &[("path", &old.display().to_string()), ("error", e.message())],
                    );
                }
            }
            None => return Err(StorageError::remote("commit without begin")),
        }
        Logger::info("XFS_TX_COMMIT", &[("tx", tx_id)]);
        self.mode = None;
        self.staging = None;
        Ok(())
    }

    fn rollback(&mut self, tx_id: &str) -> StorageResult<()> {
        if let Some(staging) = self.staging.take() {
            if let Err(e) = self.run_checked(&["rm", "-rf", &staging.to_string_lossy()]) {
                Logger::warn(
                    "XFS_ROLLBACK_CLEANUP_SKIPPED",
                    &[("error", e.message())],
                );
            }
        }
        Logger::info("XFS_TX_ROLLBACK", &[("tx", tx_id)]);
        self.mode = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalRunner;
    use std::fs;
    use tempfile::TempDir;

    fn xfs(repo: PathBuf) -> XfsFilesystem {
        XfsFilesystem::new(Box::new(LocalRunner), BackendLocation::Local, repo)
    }

    #[test]
    fn test_init_transaction_creates_repo() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("test-repo");
        let mut fs_backend = xfs(repo.clone());

        fs_backend.begin("tx-00000001").unwrap();
        let mut temp_src = crate::transport::TempFile::local(
            tmp.path().join("incoming"),
            5,
        );
        fs::write(&temp_src.path, b"hello").unwrap();
        fs_backend.recv_file("input/a.csv", &mut temp_src).unwrap();
        fs_backend.commit("tx-00000001").unwrap();

        assert_eq!(fs::read(repo.join("input/a.csv")).unwrap(), b"hello");
        assert!(!tmp.path().join("test-repo.staging-tx-00000001").exists());
    }

    #[test]
    fn test_sync_transaction_preserves_unchanged_files() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("test-repo");
        fs::create_dir_all(repo.join("input")).unwrap();
        fs::write(repo.join("input/keep.csv"), b"keep me").unwrap();

        let mut fs_backend = xfs(repo.clone());
        fs_backend.begin("tx-00000002").unwrap();
        let mut temp_src =
            crate::transport::TempFile::local(tmp.path().join("incoming"), 3);
        fs::write(&temp_src.path, b"new").unwrap();
        fs_backend.recv_file("input/new.csv", &mut temp_src).unwrap();
        fs_backend.commit("tx-00000002").unwrap();

        assert_eq!(fs::read(repo.join("input/keep.csv")).unwrap(), b"keep me");
        assert_eq!(fs::read(repo.join("input/new.csv")).unwrap(), b"new");
        assert!(!tmp.path().join("test-repo.old-tx-00000002").exists());
    }

    #[test]
    fn test_rollback_leaves_live_untouched() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("test-repo");
        fs::create_dir_all(repo.join("input")).unwrap();
        fs::write(repo.join("input/a.csv"), b"original").unwrap();

        let mut fs_backend = xfs(repo.clone());
        fs_backend.begin("tx-00000003").unwrap();
        fs_backend.delete_file("input/a.csv").unwrap();
        fs_backend.rollback("tx-00000003").unwrap();

        assert_eq!(fs::read(repo.join("input/a.csv")).unwrap(), b"original");
        assert!(!tmp.path().join("test-repo.staging-tx-00000003").exists());
    }

    #[test]
    fn test_delete_applies_only_on_commit() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("test-repo");
        fs::create_dir_all(repo.join("input")).unwrap();
        fs::write(repo.join("input/a.csv"), b"going away").unwrap();

        let mut fs_backend = xfs(repo.clone());
        fs_backend.begin("tx-00000004").unwrap();
        fs_backend.delete_file("input/a.csv").unwrap();
        // Live copy still intact before commit.
        assert!(repo.join("input/a.csv").exists());
        fs_backend.commit("tx-00000004").unwrap();
        assert!(!repo.join("input/a.csv").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("test-repo");
        fs::create_dir_all(repo.join("input")).unwrap();
        fs::write(repo.join("input/a.csv"), b"data").unwrap();

        let mut fs_backend = xfs(repo.clone());
        fs_backend.begin("tx-00000005").unwrap();
        fs_backend
            .create_symlink("input/b", "input/a.csv")
            .unwrap();
        fs_backend.commit("tx-00000005").unwrap();

        let fs_backend = xfs(repo.clone());
        assert!(fs_backend.is_symlink("input/b").unwrap());
        assert_eq!(
            fs_backend.symlink_target("input/b").unwrap(),
            "input/a.csv"
        );
    }
}
