//! Transaction coordinator.
//!
//! Drives one sync plan through the client filesystem, the remote
//! filesystem, and the transport, all-or-nothing. Commit order is remote
//! first, then client: a failed remote commit rolls everything back, while a
//! client failure after the remote has committed is a fatal inconsistency
//! that is reported, never concealed by a silent retry. The transport
//! session is ended on every path out.

pub mod errors;
pub mod factory;
pub mod retry;

use rand::Rng;

use crate::manifest::entry::resolve_link_target;
use crate::observability::{metrics, Logger};
use crate::planner::SyncPlan;
use crate::storage::{ClientFilesystem, RemoteFilesystem};
use crate::transport::{TempFile, Transport, TransportError};

pub use errors::{TransactionError, TransactionResult};
pub use factory::create_transaction;
pub use retry::RetryPolicy;

/// Process-local transaction id, `tx-XXXXXXXX`.
pub fn generate_transaction_id() -> String {
    format!("tx-{:08x}", rand::thread_rng().gen::<u32>())
}

/// Extra content staged into the client before transfers run, so uploads of
/// freshly computed metadata read the new bytes.
pub type StagedWrite = (String, Vec<u8>);

pub struct Transaction {
    client: ClientFilesystem,
    remote: Box<dyn RemoteFilesystem>,
    transport: Box<dyn Transport>,
    tx_id: String,
    retry: RetryPolicy,
    remote_committed: bool,
}

impl Transaction {
    pub fn new(
        client: ClientFilesystem,
        remote: Box<dyn RemoteFilesystem>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            client,
            remote,
            transport,
            tx_id: generate_transaction_id(),
            retry: RetryPolicy::default(),
            remote_committed: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn id(&self) -> &str {
        &self.tx_id
    }

    /// Run the plan to completion: begin, stage writes, transfer, commit.
    /// Any failure before the remote commit triggers symmetric rollback.
    pub fn execute(
        mut self,
        plan: &SyncPlan,
        staged_writes: &[StagedWrite],
    ) -> TransactionResult<()> {
        Logger::info("TX_BEGIN", &[("tx", &self.tx_id)]);
        let result = (|| {
            self.begin()?;
            self.stage_writes(staged_writes)?;
            self.sync_files(plan)?;
            self.commit()
        })();

        let outcome = match result {
            Ok(()) => {
                metrics::global().increment_commits();
                Logger::info("TX_COMMITTED", &[("tx", &self.tx_id)]);
                Ok(())
            }
            Err(mut e) => {
                if self.remote_committed {
                    // The remote moved forward; rolling back would diverge
                    // further. Surface the inconsistency instead.
                    Logger::fatal(
                        "TX_INCONSISTENT",
                        &[("tx", &self.tx_id), ("error", e.message())],
                    );
                } else {
                    metrics::global().increment_rollbacks();
                    self.rollback_all(&mut e);
                }
                Err(e)
            }
        };

        if let Err(te) = self.transport.end_session() {
            Logger::error(
                "TRANSPORT_SESSION_END_FAILED",
                &[("tx", &self.tx_id), ("error", te.message())],
            );
        }
        outcome
    }

    fn begin(&mut self) -> TransactionResult<()> {
        let tx_id = self.tx_id.clone();
        self.client
            .begin(&tx_id)
            .map_err(|e| TransactionError::general(&tx_id, format!("client begin: {}", e)))?;
        self.remote
            .begin(&tx_id)
            .map_err(|e| TransactionError::general(&tx_id, format!("remote begin: {}", e)))?;
        self.transport
            .begin_session()
            .map_err(|e| TransactionError::general(&tx_id, format!("transport begin: {}", e)))?;
        Ok(())
    }

    fn stage_writes(&mut self, staged_writes: &[StagedWrite]) -> TransactionResult<()> {
        let tx_id = self.tx_id.clone();
        for (rel_path, content) in staged_writes {
            self.client.stage_file_bytes(rel_path, content).map_err(|e| {
                TransactionError::general(&tx_id, format!("staging {}: {}", rel_path, e))
            })?;
        }
        Ok(())
    }

    /// Transfers and deletes, in plan order: uploads, downloads, local
    /// deletes, remote deletes. The remote commit follows in [`commit`].
    fn sync_files(&mut self, plan: &SyncPlan) -> TransactionResult<()> {
        for rel_path in &plan.upload_files {
            if self.client.is_symlink(rel_path) {
                self.upload_symlink(rel_path)?;
            } else {
                self.upload_regular(rel_path)?;
            }
        }
        for rel_path in &plan.download_files {
            let is_link = self.remote.is_symlink(rel_path).unwrap_or(false);
            if is_link {
                self.download_symlink(rel_path)?;
            } else {
                self.download_regular(rel_path)?;
            }
        }
        for rel_path in &plan.delete_local {
            self.client.delete_file(rel_path);
        }
        let tx_id = self.tx_id.clone();
        for rel_path in &plan.delete_remote {
            self.remote.delete_file(rel_path).map_err(|e| {
                TransactionError::general(
                    &tx_id,
                    format!("deleting {} on remote: {}", rel_path, e),
                )
            })?;
        }
        Ok(())
    }

    fn upload_regular(&mut self, rel_path: &str) -> TransactionResult<()> {
        let tx_id = self.tx_id.clone();
        let declared_size = self
            .client
            .send_file(rel_path)
            .map_err(|e| TransactionError::general(&tx_id, format!("{}", e)))?
            .size();
        Logger::trace(
            "UPLOAD_BEGIN",
            &[("path", rel_path), ("bytes", &declared_size.to_string())],
        );

        let client = &self.client;
        let transport = &mut self.transport;
        let mut temp: TempFile = self
            .retry
            .run(rel_path, || {
                let mut stream = client
                    .send_file(rel_path)
                    .map_err(|e| TransportError::io_message(e.message().to_string()))?;
                transport.transfer_to_remote(stream.as_mut())
            })
            .map_err(|e| {
                TransactionError::general(
                    &tx_id,
                    format!("upload of {} failed: {}", rel_path, e),
                )
                .with_hint("check network connectivity and remote disk space")
            })?;

        if temp.size != declared_size {
            return Err(TransactionError::integrity(
                &tx_id,
                format!(
                    "transfer size mismatch for {}: expected {}, got {}",
                    rel_path, declared_size, temp.size
                ),
            ));
        }

        self.remote.recv_file(rel_path, &mut temp).map_err(|e| {
            TransactionError::general(&tx_id, format!("staging {} on remote: {}", rel_path, e))
                .with_hint("check file permissions and disk space")
        })?;
        // Temp cleanup is the TempFile's drop guarantee on every other path.
        Ok(())
    }

    fn download_regular(&mut self, rel_path: &str) -> TransactionResult<()> {
        let tx_id = self.tx_id.clone();
        let declared_size = self
            .remote
            .send_file(rel_path)
            .map_err(|e| TransactionError::general(&tx_id, format!("{}", e)))?
            .size();
        Logger::trace(
            "DOWNLOAD_BEGIN",
            &[("path", rel_path), ("bytes", &declared_size.to_string())],
        );

        let remote = &mut self.remote;
        let transport = &mut self.transport;
        let mut temp: TempFile = self
            .retry
            .run(rel_path, || {
                let mut stream = remote
                    .send_file(rel_path)
                    .map_err(|e| TransportError::io_message(e.message().to_string()))?;
                transport.transfer_to_local(stream.as_mut())
            })
            .map_err(|e| {
                TransactionError::general(
                    &tx_id,
                    format!("download of {} failed: {}", rel_path, e),
                )
                .with_hint("check network connectivity and local disk space")
            })?;

        if temp.size != declared_size {
            return Err(TransactionError::integrity(
                &tx_id,
                format!(
                    "transfer size mismatch for {}: expected {}, got {}",
                    rel_path, declared_size, temp.size
                ),
            ));
        }

        self.client.recv_file(rel_path, &mut temp).map_err(|e| {
            TransactionError::general(&tx_id, format!("staging {} locally: {}", rel_path, e))
        })?;
        Ok(())
    }

    fn upload_symlink(&mut self, rel_path: &str) -> TransactionResult<()> {
        let tx_id = self.tx_id.clone();
        let link_text = self.client.symlink_target(rel_path).map_err(|e| {
            TransactionError::general(&tx_id, format!("reading link {}: {}", rel_path, e))
        })?;
        let reference = resolve_link_target(rel_path, &link_text).ok_or_else(|| {
            TransactionError::general(
                &tx_id,
                format!("link {} target escapes the repository: {}", rel_path, link_text),
            )
        })?;
        self.remote
            .create_symlink(rel_path, &reference)
            .map_err(|e| {
                TransactionError::general(
                    &tx_id,
                    format!("creating remote link {}: {}", rel_path, e),
                )
            })
    }

    fn download_symlink(&mut self, rel_path: &str) -> TransactionResult<()> {
        let tx_id = self.tx_id.clone();
        let reference = self.remote.symlink_target(rel_path).map_err(|e| {
            TransactionError::general(&tx_id, format!("reading remote link {}: {}", rel_path, e))
        })?;
        self.client
            .create_symlink(rel_path, &reference)
            .map_err(|e| {
                TransactionError::general(
                    &tx_id,
                    format!("creating local link {}: {}", rel_path, e),
                )
            })
    }

    /// Remote first, then client. See the module docs for why the order is
    /// load-bearing.
    fn commit(&mut self) -> TransactionResult<()> {
        let tx_id = self.tx_id.clone();
        self.remote.commit(&tx_id).map_err(|e| {
            TransactionError::commit(&tx_id, format!("remote commit failed: {}", e))
                .with_hint("check remote filesystem permissions and available space")
        })?;
        self.remote_committed = true;

        self.client.commit(&tx_id).map_err(|e| {
            TransactionError::commit(
                &tx_id,
                format!("client commit failed after remote commit: {}", e),
            )
            .with_hint("manual intervention may be required to sync client state with remote")
        })?;
        Ok(())
    }

    /// Roll back remote then client, folding cleanup failures into the
    /// primary error without replacing it.
    fn rollback_all(&mut self, primary: &mut TransactionError) {
        let tx_id = self.tx_id.clone();
        Logger::warn(
            "TX_ROLLBACK",
            &[("tx", &tx_id), ("cause", primary.message())],
        );
        if let Err(e) = self.remote.rollback(&tx_id) {
            let msg = format!("remote rollback failed: {}", e);
            Logger::error("TX_ROLLBACK_FAILED", &[("tx", &tx_id), ("error", &msg)]);
            primary.record_rollback_error(msg);
        }
        if let Err(e) = self.client.rollback(&tx_id) {
            let msg = format!("client rollback failed: {}", e);
            Logger::error("TX_ROLLBACK_FAILED", &[("tx", &tx_id), ("error", &msg)]);
            primary.record_rollback_error(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx-"));
        assert_eq!(id.len(), 11);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_transaction_ids_unique() {
        let a = generate_transaction_id();
        let b = generate_transaction_id();
        assert_ne!(a, b);
    }
}
