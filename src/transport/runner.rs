//! Command execution, local or over a pooled SSH connection.
//!
//! Remote filesystems and the ZFS engine shell out through this trait so the
//! same backend code drives a repository on this machine or behind SSH, and
//! so tests can substitute a recording fake.

use std::process::Command;

use super::errors::{TransportError, TransportResult};
use super::pool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run a command, returning its output regardless of exit status.
    fn run(&self, argv: &[&str]) -> TransportResult<CommandOutput>;

    /// Run a command and fail on non-zero exit.
    fn run_checked(&self, argv: &[&str]) -> TransportResult<CommandOutput> {
        let output = self.run(argv)?;
        if output.success() {
            Ok(output)
        } else {
            Err(TransportError::io_message(format!(
                "command {:?} failed with status {}: {}",
                argv.join(" "),
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

/// Runs commands on this machine.
pub struct LocalRunner;

impl CommandRunner for LocalRunner {
    fn run(&self, argv: &[&str]) -> TransportResult<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TransportError::io_message("empty command"))?;
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| TransportError::io(format!("cannot spawn {}", program), e))?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs commands on a remote host through the connection pool.
pub struct SshCommandRunner {
    host: String,
    port: u16,
}

impl SshCommandRunner {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl CommandRunner for SshCommandRunner {
    fn run(&self, argv: &[&str]) -> TransportResult<CommandOutput> {
        let (exit_code, stdout, stderr) =
            pool::global().run_command(&self.host, self.port, argv)?;
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_runner_captures_output() {
        let out = LocalRunner.run(&["echo", "hello"]).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_local_runner_nonzero_exit() {
        let out = LocalRunner.run(&["false"]).unwrap();
        assert!(!out.success());
        assert!(LocalRunner.run_checked(&["false"]).is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(LocalRunner.run(&[]).is_err());
    }
}
