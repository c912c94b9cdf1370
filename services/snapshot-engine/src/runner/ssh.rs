//! SSH command runner.
//!
//! Runs each [`StorageCommand`] as one non-interactive `ssh` invocation and
//! turns the exit status and stderr into a [`CommandError`]. This is the only
//! place in the engine that looks at command output.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};
use volsnap_id::NodeId;

use super::{shell_join, CommandError, CommandOutput, CommandRunner, FailureKind, StorageCommand};

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// SSH transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// Path to the ssh client.
    pub binary: String,
    /// Remote user.
    pub user: String,
    /// Seconds allowed for the TCP connection and key exchange.
    pub connect_timeout_secs: u64,
    /// Prefix privileged commands with `sudo -n`.
    pub use_sudo: bool,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=no`.
    #[serde(default)]
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            user: "root".to_string(),
            connect_timeout_secs: 10,
            use_sudo: false,
            options: Vec::new(),
        }
    }
}

/// Command runner that reaches nodes over SSH.
pub struct SshRunner {
    config: SshConfig,
}

impl SshRunner {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Builds the full local argument list for `ssh`.
    fn ssh_args(&self, node: &NodeId, command: &StorageCommand) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];
        for option in &self.config.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(format!("{}@{}", self.config.user, node));
        args.push("--".to_string());

        let mut remote = Vec::new();
        if self.config.use_sudo && command.requires_root() {
            remote.push("sudo".to_string());
            remote.push("-n".to_string());
        }
        remote.extend(command.argv());
        args.push(shell_join(&remote));
        args
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(
        &self,
        node: &NodeId,
        command: &StorageCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let args = self.ssh_args(node, command);
        debug!(node = %node, command = command.name(), "Running remote command");

        let child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(node = %node, error = %e, "Failed to spawn ssh");
                return Err(CommandError::Failed {
                    node: node.clone(),
                    kind: FailureKind::CommandFailed,
                    message: format!("failed to run {}: {e}", self.config.binary),
                });
            }
            Err(_) => {
                warn!(node = %node, command = command.name(), "Remote command timed out");
                return Err(CommandError::Timeout {
                    node: node.clone(),
                    after: timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
                return Err(CommandError::Unreachable { node: node.clone() });
            }
            let kind = FailureKind::classify(&stderr);
            warn!(
                node = %node,
                command = command.name(),
                exit_code = ?output.status.code(),
                kind = %kind,
                stderr = %stderr,
                "Remote command failed"
            );
            let message = if stderr.is_empty() {
                format!(
                    "{} exited with {:?} on node \"{}\"",
                    command.name(),
                    output.status.code(),
                    node
                )
            } else {
                stderr
            };
            return Err(CommandError::Failed {
                node: node.clone(),
                kind,
                message,
            });
        }

        inspect_report(node, command, &stdout)?;
        Ok(CommandOutput { stdout })
    }
}

/// Interprets the report printed by the inspect commands.
///
/// `lvs` prints `attr,merging,invalid`; `vxsnap print` lists the snapshot
/// with its state columns.
fn inspect_report(
    node: &NodeId,
    command: &StorageCommand,
    stdout: &str,
) -> Result<(), CommandError> {
    let fail = |kind: FailureKind, message: String| CommandError::Failed {
        node: node.clone(),
        kind,
        message,
    };

    match command {
        StorageCommand::InspectLvmSnapshot { snapshot } => {
            let report = stdout.trim();
            let mut fields = report.split(',').map(str::trim);
            let attr = fields.next().unwrap_or_default();
            let merging = fields.next().unwrap_or_default();
            let invalid = fields.next().unwrap_or_default();

            if report.is_empty() {
                Err(fail(
                    FailureKind::Missing,
                    format!("Failed to find logical volume \"{snapshot}\""),
                ))
            } else if !merging.is_empty() {
                Err(fail(
                    FailureKind::Merging,
                    format!(
                        "Snapshot \"{}\" on node \"{}\" is merging, can't proceed.",
                        snapshot.name, node
                    ),
                ))
            } else if !invalid.is_empty() || attr.starts_with('S') {
                Err(fail(
                    FailureKind::Invalid,
                    format!("Snapshot \"{snapshot}\" on node \"{node}\" is invalid"),
                ))
            } else {
                Ok(())
            }
        }
        StorageCommand::InspectVxvmSnapshot { snapshot } => {
            let line = stdout
                .lines()
                .find(|l| l.split_whitespace().any(|w| w == snapshot.name));
            match line {
                None => Err(fail(
                    FailureKind::Missing,
                    format!(
                        "Snapshot volume \"{}\" not found in disk group \"{}\"",
                        snapshot.name, snapshot.disk_group
                    ),
                )),
                Some(l) if l.contains("DETACHED") || l.contains("INVALID") => Err(fail(
                    FailureKind::DetachedInvalid,
                    format!("{}  DETACHED INVALID", snapshot.name),
                )),
                Some(_) => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{LvmSnapshot, VxvmSnapshot};

    fn node() -> NodeId {
        NodeId::parse("node1").unwrap()
    }

    fn lvm() -> LvmSnapshot {
        LvmSnapshot {
            volume_group: "vg_app".into(),
            origin: "vg1_data".into(),
            name: "L_vg1_data_".into(),
        }
    }

    #[test]
    fn test_ssh_args_batch_mode_and_sudo() {
        let runner = SshRunner::new(SshConfig {
            user: "litp-admin".into(),
            use_sudo: true,
            options: vec!["StrictHostKeyChecking=no".into()],
            ..SshConfig::default()
        });

        let args = runner.ssh_args(&node(), &StorageCommand::Reboot);
        assert_eq!(args[1], "BatchMode=yes");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"litp-admin@node1".to_string()));
        assert_eq!(args.last().unwrap(), "sudo -n shutdown -r +1");

        let ping = runner.ssh_args(&node(), &StorageCommand::Ping);
        assert_eq!(ping.last().unwrap(), "true");
    }

    #[test]
    fn test_inspect_lvm_report() {
        let cmd = StorageCommand::InspectLvmSnapshot { snapshot: lvm() };

        assert!(inspect_report(&node(), &cmd, "  swi-a-s---,,\n").is_ok());

        let err = inspect_report(&node(), &cmd, "  Swi-I-s---,,invalid\n").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Invalid);

        let err = inspect_report(&node(), &cmd, "  swi-a-s---,merging,\n").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Merging);
        assert!(err.to_string().contains("is merging, can't proceed"));

        let err = inspect_report(&node(), &cmd, "").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Missing);
    }

    #[test]
    fn test_inspect_vxvm_report() {
        let cmd = StorageCommand::InspectVxvmSnapshot {
            snapshot: VxvmSnapshot {
                disk_group: "vxdg1".into(),
                volume: "fs1".into(),
                name: "L_fs1_".into(),
            },
        };

        let healthy = "NAME    SNAPOBJECT  TYPE\nfs1  --  volume\nL_fs1_  fs1_snp  volume\n";
        assert!(inspect_report(&node(), &cmd, healthy).is_ok());

        let detached = "L_fs1_  fs1_snp  volume  DETACHED INVALID\n";
        let err = inspect_report(&node(), &cmd, detached).unwrap_err();
        assert_eq!(err.kind(), FailureKind::DetachedInvalid);

        let err = inspect_report(&node(), &cmd, "fs1 -- volume\n").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Missing);
    }
}
