//! Component wiring: configuration to a ready Transaction.
//!
//! The client side is always the local working copy. The remote filesystem
//! and transport depend on the project's transport section: an SSH host that
//! resolves to this machine gets the localhost transport and local command
//! execution; a real remote host gets pooled SSH for both. The rclone and
//! ipfs transports parse in configuration but refuse here.

use std::path::{Path, PathBuf};

use super::Transaction;
use crate::config::{BackendType, Config, TransportKind};
use crate::layout;
use crate::storage::{
    BackendLocation, ClientFilesystem, RemoteFilesystem, StorageError, StorageResult,
    XfsFilesystem, ZfsFilesystem, ZfsOperations,
};
use crate::transport::{
    is_local_host, CommandRunner, LocalRunner, LocalhostTransport, SshCommandRunner,
    SshTransport, Transport,
};

const DEFAULT_SSH_PORT: u16 = 22;

/// Find the pool owning `mount_base`: the dataset whose mountpoint is the
/// base or an ancestor of it. Falls back to the base's last path component
/// when no dataset matches (or zfs itself is unavailable).
pub fn detect_zfs_pool(runner: &dyn CommandRunner, mount_base: &Path) -> String {
    let fallback = || {
        mount_base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tank".to_string())
    };
    let output = match runner.run(&["zfs", "list", "-H", "-o", "name,mountpoint"]) {
        Ok(o) if o.success() => o.stdout,
        _ => return fallback(),
    };
    let base = mount_base.to_string_lossy();
    for line in output.lines() {
        let mut cols = line.split('\t');
        let (Some(name), Some(mountpoint)) = (cols.next(), cols.next()) else {
            continue;
        };
        if base == mountpoint || base.starts_with(&format!("{}/", mountpoint)) {
            return name
                .split('/')
                .next()
                .map(str::to_string)
                .unwrap_or_else(fallback);
        }
    }
    fallback()
}

/// Build the remote filesystem for the configured backend.
pub fn create_remote_filesystem(config: &Config) -> StorageResult<Box<dyn RemoteFilesystem>> {
    match config.project.transport {
        TransportKind::Ssh => {}
        TransportKind::Rclone => return Err(StorageError::unsupported_backend("rclone")),
        TransportKind::Ipfs => return Err(StorageError::unsupported_backend("ipfs")),
    }
    let ssh = config
        .project
        .ssh
        .as_ref()
        .ok_or_else(|| StorageError::remote("ssh section missing"))?;
    let repo_name = config.project.repo_name().to_string();
    let mount_base = ssh.path.clone();
    let port = ssh.port.unwrap_or(DEFAULT_SSH_PORT);

    let (runner, location): (Box<dyn CommandRunner>, BackendLocation) =
        if is_local_host(&ssh.host) {
            (Box::new(LocalRunner), BackendLocation::Local)
        } else {
            (
                Box::new(SshCommandRunner::new(&ssh.host, port)),
                BackendLocation::Ssh {
                    host: ssh.host.clone(),
                    port,
                },
            )
        };

    match ssh.backend_type {
        BackendType::Zfs => {
            let pool = detect_zfs_pool(runner.as_ref(), &mount_base);
            let ops = ZfsOperations::new(runner, &pool, &repo_name, mount_base);
            Ok(Box::new(ZfsFilesystem::new(ops, location)))
        }
        BackendType::Xfs => Ok(Box::new(XfsFilesystem::new(
            runner,
            location,
            mount_base.join(&repo_name),
        ))),
    }
}

/// Build the transport for the configured backend.
pub fn create_transport(config: &Config) -> StorageResult<Box<dyn Transport>> {
    match config.project.transport {
        TransportKind::Ssh => {}
        TransportKind::Rclone => return Err(StorageError::unsupported_backend("rclone")),
        TransportKind::Ipfs => return Err(StorageError::unsupported_backend("ipfs")),
    }
    let ssh = config
        .project
        .ssh
        .as_ref()
        .ok_or_else(|| StorageError::remote("ssh section missing"))?;
    let local_tmp = layout::tmp_dir(&config.project_root);

    if is_local_host(&ssh.host) {
        Ok(Box::new(LocalhostTransport::new(local_tmp)))
    } else {
        let port = ssh.port.unwrap_or(DEFAULT_SSH_PORT);
        let remote_tmp: PathBuf = ssh
            .path
            .join(config.project.repo_name())
            .join(layout::DSG_DIR)
            .join(layout::TMP_DIR);
        Ok(Box::new(SshTransport::new(
            &ssh.host, port, remote_tmp, local_tmp,
        )))
    }
}

/// Assemble a Transaction from configuration.
pub fn create_transaction(config: &Config) -> StorageResult<Transaction> {
    let client = ClientFilesystem::new(&config.project_root, config.user.backup_on_conflict);
    let remote = create_remote_filesystem(config)?;
    let transport = create_transport(config)?;
    Ok(Transaction::new(client, remote, transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, UserConfig};
    use crate::transport::CommandOutput;

    struct ScriptedRunner {
        stdout: String,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(
            &self,
            _argv: &[&str],
        ) -> crate::transport::TransportResult<CommandOutput> {
            Ok(CommandOutput {
                exit_code: 0,
                stdout: self.stdout.clone(),
                stderr: String::new(),
            })
        }
    }

    fn config_with_transport(yaml: &str) -> Config {
        let project: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        Config {
            user: UserConfig {
                user_name: "PB".to_string(),
                user_id: "pb@example.org".to_string(),
                backup_on_conflict: true,
                default_host: None,
                default_project_path: None,
                local_log: None,
            },
            project: project.finalize().unwrap(),
            project_root: PathBuf::from("/tmp/proj"),
        }
    }

    #[test]
    fn test_detect_pool_by_mountpoint_prefix() {
        let runner = ScriptedRunner {
            stdout: "dsgtest\t/var/repos/zsd\ndsgtest/other\t/var/repos/zsd/other\n"
                .to_string(),
        };
        let pool = detect_zfs_pool(&runner, Path::new("/var/repos/zsd"));
        assert_eq!(pool, "dsgtest");
        let pool = detect_zfs_pool(&runner, Path::new("/var/repos/zsd/deep"));
        assert_eq!(pool, "dsgtest");
    }

    #[test]
    fn test_detect_pool_falls_back_to_path_component() {
        let runner = ScriptedRunner {
            stdout: "tank\t/tank\n".to_string(),
        };
        let pool = detect_zfs_pool(&runner, Path::new("/var/repos/zsd"));
        assert_eq!(pool, "zsd");
    }

    #[test]
    fn test_rclone_backend_refused() {
        let config = config_with_transport(
            r#"
name: r
transport: rclone
rclone:
  remote: drive
  path: /backup
"#,
        );
        let err = match create_remote_filesystem(&config) {
            Err(e) => e,
            Ok(_) => panic!("expected create_remote_filesystem to fail"),
        };
        assert_eq!(err.code().code(), "DSG_BACKEND_UNSUPPORTED");
        assert!(create_transport(&config).is_err());
    }

    #[test]
    fn test_ipfs_backend_refused() {
        let config = config_with_transport(
            r#"
name: r
transport: ipfs
ipfs:
  did: did:key:z6Mk
"#,
        );
        let err = match create_remote_filesystem(&config) {
            Err(e) => e,
            Ok(_) => panic!("expected create_remote_filesystem to fail"),
        };
        assert_eq!(err.code().code(), "DSG_BACKEND_UNSUPPORTED");
    }

    #[test]
    fn test_localhost_ssh_gets_local_components() {
        let config = config_with_transport(
            r#"
name: test-repo
transport: ssh
ssh:
  host: localhost
  path: /var/tmp/repos
  type: xfs
"#,
        );
        // Builds without touching the network.
        assert!(create_remote_filesystem(&config).is_ok());
        assert!(create_transport(&config).is_ok());
        assert!(create_transaction(&config).is_ok());
    }
}
