//! Process-wide SSH connection pool.
//!
//! Connections are OpenSSH control masters, one socket per pooled slot,
//! keyed by `host:port`. The pool is bounded per host and expires idle
//! masters. Commands and streams ride an existing master, so repeated
//! transfers pay the handshake once.
//!
//! The pool mutex protects bookkeeping only, never in-flight byte streams.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use super::errors::{TransportError, TransportResult};
use super::streams::{ContentStream, TRANSFER_CHUNK_SIZE};
use crate::observability::Logger;

/// Bound on pooled masters per host.
pub const DEFAULT_MAX_PER_HOST: usize = 5;

/// Idle masters older than this are closed on the next checkout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// SSH handshake deadline.
pub const CONNECT_TIMEOUT_SECS: u32 = 30;

/// Deadline for small remote commands (stat, rm, mkdir).
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Waiting cap when every slot for a host is busy.
const CHECKOUT_WAIT_CAP: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Master {
    control_path: PathBuf,
    last_used: Instant,
    in_use: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    masters: HashMap<String, Vec<Master>>,
}

/// Bounded pool of SSH control masters.
pub struct SshConnectionPool {
    state: Mutex<PoolState>,
    max_per_host: usize,
    idle_timeout: Duration,
    control_dir: PathBuf,
}

fn pool_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Quote one shell word for the remote side.
fn sh_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/=+:@%".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn wait_with_timeout(mut child: Child, timeout: Duration) -> TransportResult<std::process::Output> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                return child
                    .wait_with_output()
                    .map_err(|e| TransportError::io("waiting on ssh", e));
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TransportError::timeout(format!(
                        "remote command exceeded {:?}",
                        timeout
                    )));
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(TransportError::io("polling ssh", e)),
        }
    }
}

impl SshConnectionPool {
    pub fn new(max_per_host: usize, idle_timeout: Duration) -> Self {
        let control_dir = std::env::temp_dir().join("dsg-ssh");
        Self {
            state: Mutex::new(PoolState::default()),
            max_per_host,
            idle_timeout,
            control_dir,
        }
    }

    /// Check out a master for `host:port`, establishing one when none is
    /// free and the per-host bound allows it.
    fn checkout(&self, host: &str, port: u16) -> TransportResult<PathBuf> {
        let key = pool_key(host, port);
        let wait_start = Instant::now();
        loop {
            let mut candidate: Option<PathBuf> = None;
            let mut must_establish = false;
            {
                let mut state = self.state.lock().expect("pool mutex poisoned");
                let masters = state.masters.entry(key.clone()).or_default();

                // Expire idle masters first.
                let idle_timeout = self.idle_timeout;
                let mut expired: Vec<PathBuf> = Vec::new();
                masters.retain(|m| {
                    if !m.in_use && m.last_used.elapsed() > idle_timeout {
                        expired.push(m.control_path.clone());
                        false
                    } else {
                        true
                    }
                });
                for path in &expired {
                    Self::close_master(host, port, path);
                }

                if let Some(m) = masters.iter_mut().find(|m| !m.in_use) {
                    m.in_use = true;
                    m.last_used = Instant::now();
                    candidate = Some(m.control_path.clone());
                } else if masters.len() < self.max_per_host {
                    let control_path = self.control_dir.join(format!(
                        "cm-{}-{}-{:08x}",
                        host,
                        port,
                        rand::thread_rng().gen::<u32>()
                    ));
                    masters.push(Master {
                        control_path: control_path.clone(),
                        last_used: Instant::now(),
                        in_use: true,
                    });
                    candidate = Some(control_path);
                    must_establish = true;
                }
            }

            if let Some(control_path) = candidate {
                if must_establish {
                    if let Err(e) = self.establish(host, port, &control_path) {
                        self.forget(host, port, &control_path);
                        return Err(e);
                    }
                }
                return Ok(control_path);
            }

            if wait_start.elapsed() > CHECKOUT_WAIT_CAP {
                return Err(TransportError::timeout(format!(
                    "all {} connections to {} busy",
                    self.max_per_host, key
                )));
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn checkin(&self, host: &str, port: u16, control_path: &PathBuf) {
        let key = pool_key(host, port);
        let mut state = self.state.lock().expect("pool mutex poisoned");
        if let Some(masters) = state.masters.get_mut(&key) {
            if let Some(m) = masters
                .iter_mut()
                .find(|m| &m.control_path == control_path)
            {
                m.in_use = false;
                m.last_used = Instant::now();
            }
        }
    }

    fn forget(&self, host: &str, port: u16, control_path: &PathBuf) {
        let key = pool_key(host, port);
        let mut state = self.state.lock().expect("pool mutex poisoned");
        if let Some(masters) = state.masters.get_mut(&key) {
            masters.retain(|m| &m.control_path != control_path);
        }
    }

    fn establish(&self, host: &str, port: u16, control_path: &PathBuf) -> TransportResult<()> {
        std::fs::create_dir_all(&self.control_dir)
            .map_err(|e| TransportError::io("cannot create control dir", e))?;
        let output = Command::new("ssh")
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg("ControlPersist=60")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(port.to_string())
            .arg(host)
            .arg("true")
            .output()
            .map_err(|e| TransportError::io("cannot spawn ssh", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::from_ssh_stderr(
                &format!("ssh handshake with {}", host),
                &stderr,
            ));
        }
        Logger::trace("SSH_MASTER_ESTABLISHED", &[("host", host)]);
        Ok(())
    }

    fn master_command(host: &str, port: u16, control_path: &PathBuf) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(port.to_string())
            .arg(host);
        cmd
    }

    fn close_master(host: &str, port: u16, control_path: &PathBuf) {
        let _ = Command::new("ssh")
            .arg("-O")
            .arg("exit")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-p")
            .arg(port.to_string())
            .arg(host)
            .stderr(Stdio::null())
            .status();
    }

    /// Run a small remote command over a pooled connection. Non-zero remote
    /// exits are reported in the output, not as transport errors; only
    /// spawn, timeout, and connection failures error out.
    pub fn run_command(
        &self,
        host: &str,
        port: u16,
        argv: &[&str],
    ) -> TransportResult<(i32, String, String)> {
        let control_path = self.checkout(host, port)?;
        let result = (|| {
            let remote = argv.iter().map(|w| sh_quote(w)).collect::<Vec<_>>().join(" ");
            let child = Self::master_command(host, port, &control_path)
                .arg(remote)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| TransportError::io("cannot spawn ssh", e))?;
            let output = wait_with_timeout(child, COMMAND_TIMEOUT)?;
            // Exit 255 is the ssh client itself failing, not the remote
            // command.
            if output.status.code() == Some(255) {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(TransportError::from_ssh_stderr(
                    &format!("ssh connection to {}", host),
                    &stderr,
                ));
            }
            Ok((
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        })();
        self.checkin(host, port, &control_path);
        result
    }

    /// Run a remote command and fail unless it exits zero.
    pub fn run_command_checked(
        &self,
        host: &str,
        port: u16,
        argv: &[&str],
    ) -> TransportResult<String> {
        let (code, stdout, stderr) = self.run_command(host, port, argv)?;
        if code == 0 {
            Ok(stdout)
        } else {
            Err(TransportError::io_message(format!(
                "remote command {:?} on {} exited {}: {}",
                argv.join(" "),
                host,
                code,
                stderr.trim()
            )))
        }
    }

    /// Stream content into a remote file, returning the byte count the
    /// remote observed.
    pub fn write_stream(
        &self,
        host: &str,
        port: u16,
        dest: &str,
        stream: &mut dyn ContentStream,
    ) -> TransportResult<u64> {
        let control_path = self.checkout(host, port)?;
        let result = (|| {
            let mut child = Self::master_command(host, port, &control_path)
                .arg(format!("cat > {}", sh_quote(dest)))
                .stdin(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| TransportError::io("cannot spawn ssh", e))?;

            let mut stdin = child.stdin.take().expect("piped stdin");
            let mut buf = [0u8; TRANSFER_CHUNK_SIZE];
            loop {
                let n = stream
                    .read(&mut buf)
                    .map_err(|e| TransportError::io("reading content stream", e))?;
                if n == 0 {
                    break;
                }
                stdin
                    .write_all(&buf[..n])
                    .map_err(|e| TransportError::io("writing to ssh stdin", e))?;
            }
            drop(stdin);

            let output = child
                .wait_with_output()
                .map_err(|e| TransportError::io("waiting on ssh", e))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(TransportError::from_ssh_stderr(
                    &format!("upload to {}", host),
                    &stderr,
                ));
            }
            Ok(())
        })();
        self.checkin(host, port, &control_path);
        result?;

        // Observed size, from the remote's point of view.
        let counted = self.run_command_checked(host, port, &["wc", "-c", dest])?;
        counted
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| {
                TransportError::io_message(format!("unparseable wc output: {}", counted))
            })
    }

    /// Open a reading stream over a remote file. The declared size comes
    /// from a remote stat before the read begins.
    pub fn read_stream(
        &self,
        host: &str,
        port: u16,
        src: &str,
    ) -> TransportResult<SshReadStream> {
        let size_output = self.run_command_checked(host, port, &["wc", "-c", src])?;
        let size = size_output
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| {
                TransportError::io_message(format!("unparseable wc output: {}", size_output))
            })?;

        let control_path = self.checkout(host, port)?;
        let spawn = Self::master_command(host, port, &control_path)
            .arg(format!("cat {}", sh_quote(src)))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        match spawn {
            Ok(mut child) => {
                let stdout = child.stdout.take().expect("piped stdout");
                Ok(SshReadStream {
                    child: Some(child),
                    stdout,
                    size,
                    host: host.to_string(),
                    port,
                    control_path,
                })
            }
            Err(e) => {
                self.checkin(host, port, &control_path);
                Err(TransportError::io("cannot spawn ssh", e))
            }
        }
    }

    /// Close every pooled master. Called at process teardown.
    pub fn close_all_connections(&self) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        for (key, masters) in state.masters.drain() {
            let (host, port) = match key.rsplit_once(':') {
                Some((h, p)) => (h.to_string(), p.parse().unwrap_or(22)),
                None => (key, 22),
            };
            for m in masters {
                Self::close_master(&host, port, &m.control_path);
            }
        }
    }

    /// Pooled master count for a host, for tests and diagnostics.
    pub fn pooled_count(&self, host: &str, port: u16) -> usize {
        let state = self.state.lock().expect("pool mutex poisoned");
        state
            .masters
            .get(&pool_key(host, port))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Reading stream backed by a pooled `ssh cat`.
pub struct SshReadStream {
    child: Option<Child>,
    stdout: std::process::ChildStdout,
    size: u64,
    host: String,
    port: u16,
    control_path: PathBuf,
}

impl Read for SshReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl ContentStream for SshReadStream {
    fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for SshReadStream {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        global().checkin(&self.host, self.port, &self.control_path);
    }
}

static GLOBAL_POOL: OnceLock<SshConnectionPool> = OnceLock::new();

/// The process-wide pool, created lazily.
pub fn global() -> &'static SshConnectionPool {
    GLOBAL_POOL
        .get_or_init(|| SshConnectionPool::new(DEFAULT_MAX_PER_HOST, DEFAULT_IDLE_TIMEOUT))
}

/// Tear down every pooled connection.
pub fn close_all_connections() {
    if let Some(pool) = GLOBAL_POOL.get() {
        pool.close_all_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("plain-file.txt"), "plain-file.txt");
        assert_eq!(sh_quote("has space"), "'has space'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn test_pool_key() {
        assert_eq!(pool_key("storage.example.org", 22), "storage.example.org:22");
    }

    #[test]
    fn test_private_pool_starts_empty() {
        let pool = SshConnectionPool::new(3, Duration::from_secs(1));
        assert_eq!(pool.pooled_count("nowhere.example.org", 22), 0);
    }
}
