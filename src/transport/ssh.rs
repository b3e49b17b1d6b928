//! SSH transport.
//!
//! Byte streams ride pooled OpenSSH control-master connections (see
//! [`super::pool`]). Uploads land in the remote repository's `.dsg/tmp/`;
//! downloads spool into the local `.dsg/tmp/`. The observed byte count comes
//! from the receiving side so the coordinator's integrity check compares
//! what actually hit the disk.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use uuid::Uuid;

use super::errors::{TransportError, TransportResult};
use super::pool;
use super::streams::{ContentStream, TempFile, TRANSFER_CHUNK_SIZE};
use super::Transport;
use crate::observability::{metrics, Logger};

pub struct SshTransport {
    host: String,
    port: u16,
    /// `.dsg/tmp` inside the remote repository.
    remote_tmp_dir: PathBuf,
    /// `.dsg/tmp` inside the local project.
    local_tmp_dir: PathBuf,
}

impl SshTransport {
    pub fn new(
        host: &str,
        port: u16,
        remote_tmp_dir: PathBuf,
        local_tmp_dir: PathBuf,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            remote_tmp_dir,
            local_tmp_dir,
        }
    }
}

impl Transport for SshTransport {
    fn begin_session(&mut self) -> TransportResult<()> {
        fs::create_dir_all(&self.local_tmp_dir).map_err(|e| {
            TransportError::io(
                format!("cannot create tmp dir {}", self.local_tmp_dir.display()),
                e,
            )
        })?;
        let remote_tmp = self.remote_tmp_dir.to_string_lossy().to_string();
        pool::global().run_command_checked(
            &self.host,
            self.port,
            &["mkdir", "-p", &remote_tmp],
        )?;
        Logger::trace(
            "TRANSPORT_SESSION_BEGIN",
            &[("kind", "ssh"), ("host", &self.host)],
        );
        Ok(())
    }

    fn end_session(&mut self) -> TransportResult<()> {
        // Masters stay pooled for the next transaction; teardown happens at
        // process exit via close_all_connections.
        Logger::trace(
            "TRANSPORT_SESSION_END",
            &[("kind", "ssh"), ("host", &self.host)],
        );
        Ok(())
    }

    fn transfer_to_remote(
        &mut self,
        stream: &mut dyn ContentStream,
    ) -> TransportResult<TempFile> {
        let temp_path = self
            .remote_tmp_dir
            .join(format!("transfer-{}", Uuid::new_v4()));
        let dest = temp_path.to_string_lossy().to_string();
        let written =
            pool::global().write_stream(&self.host, self.port, &dest, stream)?;
        metrics::global().add_upload(written);
        Ok(TempFile::remote(temp_path, written, &self.host, self.port))
    }

    fn transfer_to_local(
        &mut self,
        stream: &mut dyn ContentStream,
    ) -> TransportResult<TempFile> {
        let temp_path = self
            .local_tmp_dir
            .join(format!("transfer-{}", Uuid::new_v4()));
        let mut out = File::create(&temp_path).map_err(|e| {
            TransportError::io(format!("cannot create {}", temp_path.display()), e)
        })?;
        let mut buf = [0u8; TRANSFER_CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = stream
                .read(&mut buf)
                .map_err(|e| TransportError::io("reading remote stream", e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).map_err(|e| {
                TransportError::io(format!("writing {}", temp_path.display()), e)
            })?;
            written += n as u64;
        }
        out.sync_all().map_err(|e| {
            TransportError::io(format!("cannot fsync {}", temp_path.display()), e)
        })?;
        metrics::global().add_download(written);
        Ok(TempFile::local(temp_path, written))
    }
}
