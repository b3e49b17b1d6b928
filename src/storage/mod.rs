//! Storage backends: the client working copy and the remote repository.
//!
//! The remote side is a capability trait with two implementations: ZFS
//! (atomic commit via clone-then-promote) and plain POSIX (sibling staging
//! directory, atomic only under the distributed lock). The client side is
//! always a local working copy with staged writes and crash recovery.

pub mod client;
pub mod errors;
pub mod xfs;
pub mod zfs;

pub use client::ClientFilesystem;
pub use errors::{StorageError, StorageErrorCode, StorageResult};
pub use xfs::XfsFilesystem;
pub use zfs::{BackendLocation, ZfsFilesystem, ZfsOperations};

use crate::transport::{ContentStream, TempFile};

/// Remote repository operations inside one transaction.
///
/// `begin` creates backend-specific staging; every mutation lands in staging;
/// `commit` publishes it atomically (or as close as the backend allows);
/// `rollback` discards it.
pub trait RemoteFilesystem {
    fn begin(&mut self, tx_id: &str) -> StorageResult<()>;

    /// Stream a repository file for download.
    fn send_file(&mut self, rel_path: &str) -> StorageResult<Box<dyn ContentStream>>;

    /// Move a transport temp file into its final staged path.
    fn recv_file(&mut self, rel_path: &str, temp: &mut TempFile) -> StorageResult<()>;

    /// Stage a deletion.
    fn delete_file(&mut self, rel_path: &str) -> StorageResult<()>;

    /// Recreate a symlink in staging.
    fn create_symlink(&mut self, rel_path: &str, target: &str) -> StorageResult<()>;

    fn is_symlink(&self, rel_path: &str) -> StorageResult<bool>;

    /// Link target as recorded on the remote, repo-relative.
    fn symlink_target(&self, rel_path: &str) -> StorageResult<String>;

    /// Read a small repository file (manifest, ledger) from committed state.
    fn read_file(&self, rel_path: &str) -> StorageResult<Vec<u8>>;

    fn file_exists(&self, rel_path: &str) -> StorageResult<bool>;

    fn commit(&mut self, tx_id: &str) -> StorageResult<()>;

    fn rollback(&mut self, tx_id: &str) -> StorageResult<()>;
}

/// On-disk text for a symlink at `link_path` pointing at `target`, both
/// repo-relative. The link is written relative to its own parent directory.
pub fn relative_link_text(link_path: &str, target: &str) -> String {
    let link_parent: Vec<&str> = match link_path.rfind('/') {
        Some(idx) => link_path[..idx].split('/').collect(),
        None => Vec::new(),
    };
    let target_parts: Vec<&str> = target.split('/').collect();

    let common = link_parent
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = Vec::new();
    for _ in common..link_parent.len() {
        parts.push("..".to_string());
    }
    for part in &target_parts[common..] {
        parts.push(part.to_string());
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_link_same_dir() {
        assert_eq!(relative_link_text("input/b", "input/a.csv"), "a.csv");
    }

    #[test]
    fn test_relative_link_up_and_down() {
        assert_eq!(
            relative_link_text("input/sub/b", "input/a.csv"),
            "../a.csv"
        );
        assert_eq!(
            relative_link_text("input/b", "output/r.txt"),
            "../output/r.txt"
        );
    }

    #[test]
    fn test_relative_link_from_top_level() {
        assert_eq!(relative_link_text("b", "input/a.csv"), "input/a.csv");
    }
}
