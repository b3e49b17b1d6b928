//! Localhost transport.
//!
//! Used whenever the configured remote host resolves to this machine: both
//! sides of a transfer are local paths, so the "transfer" is a chunked copy
//! through a temp file under `<project>/.dsg/tmp/`. No network, no pooling;
//! metrics are still recorded.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use uuid::Uuid;

use super::errors::{TransportError, TransportResult};
use super::streams::{ContentStream, TempFile, TRANSFER_CHUNK_SIZE};
use super::Transport;
use crate::observability::{metrics, Logger};

pub struct LocalhostTransport {
    tmp_dir: PathBuf,
}

impl LocalhostTransport {
    pub fn new(tmp_dir: PathBuf) -> Self {
        Self { tmp_dir }
    }

    fn spool(&self, stream: &mut dyn ContentStream) -> TransportResult<TempFile> {
        let temp_path = self.tmp_dir.join(format!("transfer-{}", Uuid::new_v4()));
        let mut out = File::create(&temp_path).map_err(|e| {
            TransportError::io(format!("cannot create {}", temp_path.display()), e)
        })?;
        let mut buf = [0u8; TRANSFER_CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = stream
                .read(&mut buf)
                .map_err(|e| TransportError::io("reading content stream", e))?;
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
        Ok(TempFile::local(temp_path, written))
    }
}

impl Transport for LocalhostTransport {
    fn begin_session(&mut self) -> TransportResult<()> {
        fs::create_dir_all(&self.tmp_dir).map_err(|e| {
            TransportError::io(
                format!("cannot create tmp dir {}", self.tmp_dir.display()),
                e,
            )
        })?;
        Logger::trace("TRANSPORT_SESSION_BEGIN", &[("kind", "localhost")]);
        Ok(())
    }

    fn end_session(&mut self) -> TransportResult<()> {
        Logger::trace("TRANSPORT_SESSION_END", &[("kind", "localhost")]);
        Ok(())
    }

    fn transfer_to_remote(
        &mut self,
        stream: &mut dyn ContentStream,
    ) -> TransportResult<TempFile> {
        let temp = self.spool(stream)?;
        metrics::global().add_upload(temp.size);
        Ok(temp)
    }

    fn transfer_to_local(
        &mut self,
        stream: &mut dyn ContentStream,
    ) -> TransportResult<TempFile> {
        let temp = self.spool(stream)?;
        metrics::global().add_download(temp.size);
        Ok(temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::streams::MemoryContentStream;
    use tempfile::TempDir;

    #[test]
    fn test_transfer_spools_full_content() {
        let tmp = TempDir::new().unwrap();
        let mut transport = LocalhostTransport::new(tmp.path().join("tmp"));
        transport.begin_session().unwrap();

        let content = vec![7u8; TRANSFER_CHUNK_SIZE * 2 + 11];
        let mut stream = MemoryContentStream::new(content.clone());
        let temp = transport.transfer_to_remote(&mut stream).unwrap();

        assert_eq!(temp.size, content.len() as u64);
        assert_eq!(fs::read(&temp.path).unwrap(), content);
        transport.end_session().unwrap();
    }

    #[test]
    fn test_temp_files_land_in_tmp_dir() {
        let tmp = TempDir::new().unwrap();
        let tmp_dir = tmp.path().join("tmp");
        let mut transport = LocalhostTransport::new(tmp_dir.clone());
        transport.begin_session().unwrap();

        let mut stream = MemoryContentStream::new(b"abc".to_vec());
        let temp = transport.transfer_to_local(&mut stream).unwrap();
        assert!(temp.path.starts_with(&tmp_dir));
    }
}
