//! Content streams and temp-file handles.
//!
//! A [`ContentStream`] moves file bytes in chunks with a declared total size
//! so receivers can verify transfer integrity. A [`TempFile`] is the
//! transport's landing spot; cleanup is guaranteed on drop, best-effort for
//! remote paths.

use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use crate::observability::Logger;

/// Chunk size for transfers.
pub const TRANSFER_CHUNK_SIZE: usize = 8 * 1024;

/// A readable byte stream with a declared total size.
pub trait ContentStream: Read {
    /// Total content size in bytes.
    fn size(&self) -> u64;
}

/// Stream over a local file.
pub struct FileContentStream {
    file: File,
    size: u64,
}

impl FileContentStream {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Read for FileContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ContentStream for FileContentStream {
    fn size(&self) -> u64 {
        self.size
    }
}

/// In-memory stream; used for remote command output and in tests.
pub struct MemoryContentStream {
    cursor: Cursor<Vec<u8>>,
    size: u64,
}

impl MemoryContentStream {
    pub fn new(content: Vec<u8>) -> Self {
        let size = content.len() as u64;
        Self {
            cursor: Cursor::new(content),
            size,
        }
    }
}

impl Read for MemoryContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl ContentStream for MemoryContentStream {
    fn size(&self) -> u64 {
        self.size
    }
}

/// Where a temp file lives, which decides how cleanup happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempLocation {
    Local,
    /// Remote path reachable through the given host's pooled connection.
    Remote {
        host: String,
        port: u16,
    },
}

/// Handle to a transferred temp file.
///
/// `size` is the byte count the transport observed; the coordinator compares
/// it against the stream's declared size before staging.
#[derive(Debug)]
pub struct TempFile {
    pub path: PathBuf,
    pub size: u64,
    location: TempLocation,
    cleaned: bool,
}

impl TempFile {
    pub fn local(path: PathBuf, size: u64) -> Self {
        Self {
            path,
            size,
            location: TempLocation::Local,
            cleaned: false,
        }
    }

    pub fn remote(path: PathBuf, size: u64, host: &str, port: u16) -> Self {
        Self {
            path,
            size,
            location: TempLocation::Remote {
                host: host.to_string(),
                port,
            },
        cleaned: false,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.location, TempLocation::Remote { .. })
    }

    /// Mark the file as consumed (moved into staging); no removal on drop.
    pub fn disarm(&mut self) {
        self.cleaned = true;
    }

    /// Remove the temp file. Idempotent; remote removal is best-effort.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        match &self.location {
            TempLocation::Local => {
                if let Err(e) = fs::remove_file(&self.path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        Logger::warn(
                            "TEMP_CLEANUP_FAILED",
                            &[("path", &self.path.display().to_string())],
                        );
                    }
                }
            }
            TempLocation::Remote { host, port } => {
                let path = self.path.to_string_lossy().to_string();
                if super::pool::global()
                    .run_command(host, *port, &["rm", "-f", &path])
                    .is_err()
                {
                    Logger::warn(
                        "TEMP_CLEANUP_FAILED",
                        &[("host", host.as_str()), ("path", path.as_str())],
                    );
                }
            }
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_file_stream_reports_size_and_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"12345678").unwrap();
        drop(f);

        let mut stream = FileContentStream::open(&path).unwrap();
        assert_eq!(stream.size(), 8);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"12345678");
    }

    #[test]
    fn test_local_tempfile_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t");
        fs::write(&path, b"x").unwrap();
        {
            let _temp = TempFile::local(path.clone(), 1);
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_disarmed_tempfile_survives_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t");
        fs::write(&path, b"x").unwrap();
        {
            let mut temp = TempFile::local(path.clone(), 1);
            temp.disarm();
        }
        assert!(path.exists());
    }

    #[test]
    fn test_cleanup_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t");
        fs::write(&path, b"x").unwrap();
        let mut temp = TempFile::local(path.clone(), 1);
        temp.cleanup();
        temp.cleanup();
        assert!(!path.exists());
    }
}
