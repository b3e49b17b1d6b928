//! CLI argument definitions using clap.
//!
//! Commands:
//! - dsg init / clone / sync: lifecycle operations
//! - dsg status / log / blame / list-files / list-repos: read-only queries
//! - dsg validate-config / validate-file / validate-snapshot /
//!   validate-chain: integrity checks
//!
//! Shared flags: --verbose/--quiet (mutually exclusive), --dry-run,
//! --force, --normalize, --json.

use clap::{Parser, Subcommand};

/// DSG - snapshot-based data synchronization for research repositories
#[derive(Parser, Debug)]
#[command(name = "dsg")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit TRACE-level detail
    #[arg(long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Emit errors only
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Plan but do not write anything
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Skip working-copy backups on overwrite
    #[arg(long, global = true)]
    pub force: bool,

    /// NFC-normalize on-disk names while scanning
    #[arg(long, global = true)]
    pub normalize: bool,

    /// Structured JSON output
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the first snapshot and the remote repository
    Init {
        /// Snapshot message
        #[arg(long)]
        message: Option<String>,
    },

    /// Download a remote repository into this empty working copy
    Clone {
        /// Repository to clone, as configured in .dsgconfig.yml
        source: String,
    },

    /// Synchronize the working copy with the remote repository
    Sync {
        /// Snapshot message
        #[arg(long)]
        message: Option<String>,
    },

    /// Classify every path against cache and remote without changing anything
    Status,

    /// Show snapshot history, newest first
    Log {
        /// Maximum entries to print
        #[arg(long)]
        limit: Option<usize>,

        /// Only snapshots by this author
        #[arg(long)]
        author: Option<String>,

        /// Only snapshots at or after this RFC3339 time
        #[arg(long)]
        since: Option<String>,
    },

    /// Per-snapshot event history of one file
    Blame {
        /// Repository-relative path
        file: String,
    },

    /// List files in the current manifest
    ListFiles {
        /// Only paths under this prefix
        #[arg(long)]
        path: Option<String>,
    },

    /// List repositories under the configured default project path
    ListRepos,

    /// Check user and project configuration
    ValidateConfig {
        /// Also probe the configured backend
        #[arg(long)]
        check_backend: bool,
    },

    /// Check one working file against the current manifest
    ValidateFile {
        /// Repository-relative path
        file: String,
    },

    /// Check an archived snapshot's internal integrity
    ValidateSnapshot {
        /// Snapshot number (defaults to the newest archived)
        #[arg(long)]
        num: Option<u64>,
    },

    /// Verify the id and hash linkage of the whole snapshot chain
    ValidateChain,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_subcommands() {
        let cli = Cli::try_parse_from(["dsg", "sync", "--message", "push results"]).unwrap();
        match cli.command {
            Command::Sync { message } => assert_eq!(message.as_deref(), Some("push results")),
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["dsg", "--json", "--dry-run", "status"]).unwrap();
        assert!(cli.json);
        assert!(cli.dry_run);
        assert!(!cli.force);
    }

    #[test]
    fn test_verbose_quiet_mutually_exclusive() {
        assert!(Cli::try_parse_from(["dsg", "--verbose", "--quiet", "status"]).is_err());
    }

    #[test]
    fn test_kebab_case_commands() {
        assert!(Cli::try_parse_from(["dsg", "list-files"]).is_ok());
        assert!(Cli::try_parse_from(["dsg", "validate-chain"]).is_ok());
        assert!(Cli::try_parse_from(["dsg", "validate-snapshot", "--num", "3"]).is_ok());
    }
}
