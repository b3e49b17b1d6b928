//! Transport layer: moving byte streams between local and remote staging.
//!
//! Two implementations: [`localhost::LocalhostTransport`] when the configured
//! host is this machine, and [`ssh::SshTransport`] over the pooled OpenSSH
//! control masters in [`pool`].

pub mod errors;
pub mod localhost;
pub mod pool;
pub mod runner;
pub mod ssh;
pub mod streams;

pub use errors::{TransportError, TransportErrorCode, TransportResult};
pub use localhost::LocalhostTransport;
pub use pool::close_all_connections;
pub use runner::{CommandOutput, CommandRunner, LocalRunner, SshCommandRunner};
pub use ssh::SshTransport;
pub use streams::{ContentStream, FileContentStream, MemoryContentStream, TempFile};

/// Session-scoped byte mover between client and remote staging.
pub trait Transport {
    fn begin_session(&mut self) -> TransportResult<()>;
    fn end_session(&mut self) -> TransportResult<()>;
    /// Move a stream into remote staging, returning the landed temp file.
    fn transfer_to_remote(
        &mut self,
        stream: &mut dyn ContentStream,
    ) -> TransportResult<TempFile>;
    /// Move a stream into local staging, returning the landed temp file.
    fn transfer_to_local(
        &mut self,
        stream: &mut dyn ContentStream,
    ) -> TransportResult<TempFile>;
}

/// Whether the configured host is this machine: exact hostname match,
/// `localhost`, or a loopback address.
pub fn is_local_host(host: &str) -> bool {
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return true;
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|local| local == host || local.split('.').next() == Some(host))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_is_local() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("::1"));
    }

    #[test]
    fn test_own_hostname_is_local() {
        if let Ok(name) = hostname::get() {
            if let Ok(name) = name.into_string() {
                assert!(is_local_host(&name));
            }
        }
    }

    #[test]
    fn test_other_host_is_not_local() {
        assert!(!is_local_host("storage.example.org"));
    }
}
