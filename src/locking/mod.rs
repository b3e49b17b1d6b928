//! Distributed file-based locking.
//!
//! Serializes sync, init, and clone against one repository across hosts and
//! processes. The lock is a JSON record at `.dsg/sync.lock`; because the
//! abstract store can only overwrite files, never delete them, a clean
//! release is marked by writing a tombstone at `.dsg/sync.lock.released`.
//! An empty tombstone means "consumed by a later acquisition".
//!
//! Staleness is timestamp-based only; there is no liveness probe of the
//! holder's process.

pub mod errors;

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::layout;
use crate::observability::Logger;

pub use errors::{LockError, LockResult};

/// Default bound on waiting for the lock.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A lock older than this is presumed abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Pause between writing our record and verifying it survived, to catch
/// write-write races through the non-atomic store.
const VERIFY_DELAY: Duration = Duration::from_millis(100);

/// Minimal file operations the lock needs from a backend. Deletion is
/// deliberately absent; some backends can only overwrite.
pub trait LockStore {
    fn file_exists(&self, rel_path: &str) -> bool;
    fn read_file(&self, rel_path: &str) -> std::io::Result<Vec<u8>>;
    fn write_file(&self, rel_path: &str, content: &[u8]) -> std::io::Result<()>;
}

/// Lock store over a local repository root.
pub struct LocalLockStore {
    root: PathBuf,
}

impl LocalLockStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }
}

impl LockStore for LocalLockStore {
    fn file_exists(&self, rel_path: &str) -> bool {
        self.resolve(rel_path).exists()
    }

    fn read_file(&self, rel_path: &str) -> std::io::Result<Vec<u8>> {
        fs::read(self.resolve(rel_path))
    }

    fn write_file(&self, rel_path: &str, content: &[u8]) -> std::io::Result<()> {
        let path = self.resolve(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }
}

impl LockStore for Box<dyn LockStore> {
    fn file_exists(&self, rel_path: &str) -> bool {
        self.as_ref().file_exists(rel_path)
    }

    fn read_file(&self, rel_path: &str) -> std::io::Result<Vec<u8>> {
        self.as_ref().read_file(rel_path)
    }

    fn write_file(&self, rel_path: &str, content: &[u8]) -> std::io::Result<()> {
        self.as_ref().write_file(rel_path, content)
    }
}

/// Lock store over a remote repository root, through the pooled SSH
/// connections.
pub struct SshLockStore {
    host: String,
    port: u16,
    repo_root: PathBuf,
}

impl SshLockStore {
    pub fn new(host: &str, port: u16, repo_root: &Path) -> Self {
        Self {
            host: host.to_string(),
            port,
            repo_root: repo_root.to_path_buf(),
        }
    }

    fn resolve(&self, rel_path: &str) -> String {
        self.repo_root.join(rel_path).to_string_lossy().into_owned()
    }
}

impl LockStore for SshLockStore {
    fn file_exists(&self, rel_path: &str) -> bool {
        crate::transport::pool::global()
            .run_command(&self.host, self.port, &["test", "-e", &self.resolve(rel_path)])
            .map(|(code, _, _)| code == 0)
            .unwrap_or(false)
    }

    fn read_file(&self, rel_path: &str) -> std::io::Result<Vec<u8>> {
        let mut stream = crate::transport::pool::global()
            .read_stream(&self.host, self.port, &self.resolve(rel_path))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.message().to_string()))?;
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut content)?;
        Ok(content)
    }

    fn write_file(&self, rel_path: &str, content: &[u8]) -> std::io::Result<()> {
        let path = self.resolve(rel_path);
        let pool = crate::transport::pool::global();
        if let Some(parent) = self.repo_root.join(rel_path).parent() {
            let _ = pool.run_command(
                &self.host,
                self.port,
                &["mkdir", "-p", &parent.to_string_lossy()],
            );
        }
        let mut stream =
            crate::transport::streams::MemoryContentStream::new(content.to_vec());
        pool.write_stream(&self.host, self.port, &path, &mut stream)
            .map(|_| ())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.message().to_string()))
    }
}

/// The JSON record written to `.dsg/sync.lock`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub user_id: String,
    /// "sync", "init", or "clone".
    pub operation: String,
    /// RFC3339 UTC acquisition time.
    pub timestamp: String,
    pub pid: u32,
    pub hostname: String,
    pub lock_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tombstone {
    released_at: String,
    released_by: String,
}

fn lock_rel() -> String {
    format!("{}/{}", layout::DSG_DIR, layout::LOCK_FILE)
}

fn tombstone_rel() -> String {
    format!("{}/{}", layout::DSG_DIR, layout::LOCK_RELEASED_FILE)
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Distributed lock over one repository.
pub struct SyncLock<S: LockStore> {
    store: S,
    user_id: String,
    operation: String,
    timeout: Duration,
    stale_after: Duration,
    lock_id: Option<String>,
    acquired: bool,
}

impl<S: LockStore> SyncLock<S> {
    pub fn new(store: S, user_id: &str, operation: &str) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
            operation: operation.to_string(),
            timeout: DEFAULT_TIMEOUT,
            stale_after: STALE_AFTER,
            lock_id: None,
            acquired: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Acquire the lock, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// `DSG_LOCK_CONFLICT` when the wait expired while another holder was
    /// active, `DSG_LOCK_TIMEOUT` when it expired without an identifiable
    /// holder.
    pub fn acquire(&mut self) -> LockResult<()> {
        if self.acquired {
            return Ok(());
        }
        let lock_id = Uuid::new_v4().to_string();
        self.lock_id = Some(lock_id);
        let start = Instant::now();

        // Adaptive poll: short timeouts poll fast, long ones back off.
        let poll = Duration::from_secs_f64(
            (self.timeout.as_secs_f64() / 10.0).clamp(0.01, 1.0),
        );

        loop {
            if self.try_acquire()? {
                self.acquired = true;
                Logger::info(
                    "LOCK_ACQUIRED",
                    &[
                        ("operation", &self.operation),
                        ("user", &self.user_id),
                        ("lock_id", self.lock_id.as_deref().unwrap_or("")),
                    ],
                );
                return Ok(());
            }
            if self.should_abort_waiting() || start.elapsed() >= self.timeout {
                break;
            }
            thread::sleep(poll);
        }

        match self.current_lock() {
            Some(holder) => Err(LockError::conflict(format!(
                "repository locked by {} for {} since {} (host: {})",
                holder.user_id, holder.operation, holder.timestamp, holder.hostname
            ))),
            None => Err(LockError::timeout(format!(
                "timed out waiting for repository lock after {:?}",
                self.timeout
            ))),
        }
    }

    /// Release by writing a tombstone. Idempotent; never fails a completed
    /// operation.
    pub fn release(&mut self) {
        if !self.acquired {
            return;
        }
        let our_id = self.lock_id.clone().unwrap_or_default();
        if let Some(current) = self.current_lock() {
            if current.lock_id != our_id {
                Logger::warn(
                    "LOCK_RELEASE_SKIPPED",
                    &[("held_by", &current.lock_id), ("our_id", &our_id)],
                );
                return;
            }
        }
        self.write_tombstone(&our_id);
        Logger::info("LOCK_RELEASED", &[("lock_id", &our_id)]);
        self.acquired = false;
        self.lock_id = None;
    }

    /// Whether the repository is currently locked, and by whom.
    pub fn is_locked(&self) -> (bool, Option<LockInfo>) {
        if self.tombstone_is_valid() {
            return (false, None);
        }
        match self.current_lock() {
            Some(info) if !self.is_stale(&info) => (true, Some(info)),
            _ => (false, None),
        }
    }

    fn try_acquire(&self) -> LockResult<bool> {
        if !self.tombstone_is_valid() && self.store.file_exists(&lock_rel()) {
            if let Some(current) = self.current_lock() {
                if !self.is_stale(&current) {
                    return Ok(false);
                }
                Logger::info(
                    "LOCK_STALE_OVERRIDE",
                    &[("stale_since", &current.timestamp)],
                );
            }
        }

        let info = LockInfo {
            user_id: self.user_id.clone(),
            operation: self.operation.clone(),
            timestamp: Utc::now().to_rfc3339(),
            pid: std::process::id(),
            hostname: local_hostname(),
            lock_id: self.lock_id.clone().unwrap_or_default(),
        };
        let record = serde_json::to_vec(&info)
            .map_err(|e| LockError::io(format!("cannot encode lock record: {}", e)))?;
        if self.store.write_file(&lock_rel(), &record).is_err() {
            return Ok(false);
        }

        // Re-read after a pause; if another writer overwrote us, we lost.
        thread::sleep(VERIFY_DELAY);
        match self.current_lock() {
            Some(verify) if Some(&verify.lock_id) == self.lock_id.as_ref() => {
                // Our lock stands; invalidate any tombstone.
                let _ = self.store.write_file(&tombstone_rel(), b"");
                Ok(true)
            }
            _ => {
                Logger::trace("LOCK_RACE_LOST", &[]);
                Ok(false)
            }
        }
    }

    fn current_lock(&self) -> Option<LockInfo> {
        let data = self.store.read_file(&lock_rel()).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// A tombstone with content marks a clean release; an empty one was
    /// already consumed.
    fn tombstone_is_valid(&self) -> bool {
        if !self.store.file_exists(&tombstone_rel()) {
            return false;
        }
        match self.store.read_file(&tombstone_rel()) {
            Ok(content) => !content.is_empty(),
            // Unreadable tombstone: assume released.
            Err(_) => true,
        }
    }

    fn is_stale(&self, info: &LockInfo) -> bool {
        match DateTime::parse_from_rfc3339(&info.timestamp) {
            Ok(t) => {
                let age = Utc::now().signed_duration_since(t.with_timezone(&Utc));
                age.to_std().map(|a| a > self.stale_after).unwrap_or(false)
            }
            // Unparseable timestamp: treat as stale.
            Err(_) => true,
        }
    }

    fn should_abort_waiting(&self) -> bool {
        let Some(current) = self.current_lock() else {
            return false;
        };
        if self.is_stale(&current) {
            return false;
        }
        // Sub-second timeouts fail fast on an active holder.
        self.timeout < Duration::from_secs(1)
    }

    fn write_tombstone(&self, lock_id: &str) {
        let tombstone = Tombstone {
            released_at: Utc::now().to_rfc3339(),
            released_by: lock_id.to_string(),
        };
        if let Ok(data) = serde_json::to_vec(&tombstone) {
            if self.store.write_file(&tombstone_rel(), &data).is_err() {
                Logger::error("LOCK_TOMBSTONE_WRITE_FAILED", &[("lock_id", lock_id)]);
            }
        }
    }
}

impl<S: LockStore> Drop for SyncLock<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> LocalLockStore {
        LocalLockStore::new(tmp.path())
    }

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let mut lock = SyncLock::new(store(&tmp), "pb@example.org", "sync");
        lock.acquire().unwrap();
        assert!(tmp.path().join(".dsg/sync.lock").exists());
        lock.release();
        let tombstone = fs::read(tmp.path().join(".dsg/sync.lock.released")).unwrap();
        assert!(!tombstone.is_empty());
    }

    #[test]
    fn test_second_holder_fails_fast_on_short_timeout() {
        let tmp = TempDir::new().unwrap();
        let mut first = SyncLock::new(store(&tmp), "a@example.org", "sync");
        first.acquire().unwrap();

        let mut second = SyncLock::new(store(&tmp), "b@example.org", "sync")
            .with_timeout(Duration::from_millis(300));
        let err = second.acquire().unwrap_err();
        assert_eq!(err.code().code(), "DSG_LOCK_CONFLICT");
        assert!(err.message().contains("a@example.org"));
    }

    #[test]
    fn test_acquire_after_release() {
        let tmp = TempDir::new().unwrap();
        let mut first = SyncLock::new(store(&tmp), "a@example.org", "sync");
        first.acquire().unwrap();
        first.release();

        let mut second = SyncLock::new(store(&tmp), "b@example.org", "init")
            .with_timeout(Duration::from_secs(2));
        second.acquire().unwrap();
        let (locked, info) = second.is_locked();
        assert!(locked);
        assert_eq!(info.unwrap().user_id, "b@example.org");
    }

    #[test]
    fn test_stale_lock_overridden() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        let old = LockInfo {
            user_id: "ghost@example.org".to_string(),
            operation: "sync".to_string(),
            timestamp: "2020-01-01T00:00:00+00:00".to_string(),
            pid: 1,
            hostname: "gone".to_string(),
            lock_id: "dead".to_string(),
        };
        s.write_file(".dsg/sync.lock", &serde_json::to_vec(&old).unwrap())
            .unwrap();

        let mut lock = SyncLock::new(store(&tmp), "b@example.org", "sync")
            .with_timeout(Duration::from_secs(2));
        lock.acquire().unwrap();
    }

    #[test]
    fn test_release_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut lock = SyncLock::new(store(&tmp), "a@example.org", "sync");
        lock.acquire().unwrap();
        lock.release();
        lock.release();
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let root = root.clone();
                let successes = Arc::clone(&successes);
                thread::spawn(move || {
                    let mut lock = SyncLock::new(
                        LocalLockStore::new(&root),
                        &format!("user{}@example.org", i),
                        "sync",
                    )
                    .with_timeout(Duration::from_millis(400));
                    if lock.acquire().is_ok() {
                        successes.fetch_add(1, Ordering::SeqCst);
                        // Hold long enough that the loser's timeout expires.
                        thread::sleep(Duration::from_millis(600));
                        lock.release();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }
}
