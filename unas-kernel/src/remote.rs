//! Remote command channel over the system `ssh` client
//!
//! One multiplexed master connection per kernel (`ControlMaster=auto`, `ControlPersist`).
//! A dropped master is not repaired eagerly: the next command simply opens a new one.
//! Exit status 255 is ssh's own failure code and is reported as a transport error.

use crate::config::SshConf;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use std::process::Output;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use unas_core::{CommandOutput, RemoteShell, ShellError};

const SSH_FAILURE: i32 = 255;

pub struct SshShell {
    conf: SshConf,
    timeout: Duration,
}

impl SshShell {
    pub fn new(conf: SshConf) -> Self {
        let timeout = conf.timeout();
        Self { conf, timeout }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.conf.user, self.conf.host)
    }

    fn control_path(&self) -> String {
        self.conf
            .control_dir
            .join(format!("unas-{}-{}.sock", self.conf.host, self.conf.port))
            .to_string_lossy()
            .into_owned()
    }

    /// Arguments for `ssh`, without the program name.
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.conf.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.conf.connect_timeout_secs),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path()),
            "-o".to_string(),
            "ControlPersist=60".to_string(),
        ];
        if let Some(identity) = &self.conf.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, ShellError> {
        let mut child = Command::new("ssh")
            .args(self.ssh_args(command))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShellError::Spawn(e.to_string()))?;

        let output = finish(child, stdin, self.timeout).await?;

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if code == SSH_FAILURE {
            warn!("ssh to {} failed: {}", self.conf.host, stderr.trim());
            return Err(ShellError::Transport(stderr.trim().to_string()));
        }
        Ok(CommandOutput { stdout: String::from_utf8_lossy(&output.stdout).into_owned(), stderr, exit_code: code })
    }
}

/// Feed stdin and collect the output under one deadline. A remote side that stops
/// reading cannot stall the write past `limit`; the child is killed when dropped.
async fn finish(mut child: Child, stdin: Option<&[u8]>, limit: Duration) -> Result<Output, ShellError> {
    let io = async move {
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)
                .await
                .map_err(|e| ShellError::Transport(format!("stdin: {e}")))?;
            // close stdin so the remote `cat` sees EOF
            drop(pipe);
        }
        child.wait_with_output().await.map_err(|e| ShellError::Transport(e.to_string()))
    };
    tokio::time::timeout(limit, io)
        .await
        .map_err(|_| ShellError::Timeout(limit.as_secs()))?
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
        debug!("ssh {}: {}", self.conf.host, command);
        self.exec(command, None).await
    }

    async fn upload(&self, remote_path: &str, content: &[u8], mode: u32) -> Result<(), ShellError> {
        let path = shell_words::quote(remote_path);
        let command = format!("cat > {path}.tmp && chmod {mode:o} {path}.tmp && mv {path}.tmp {path}");
        let out = self.exec(&command, Some(content)).await?;
        if !out.success() {
            return Err(ShellError::Exit {
                code: out.exit_code,
                detail: format!("upload to {remote_path}: {}", out.stderr.trim()),
            });
        }
        debug!("Uploaded {} bytes to {}", content.len(), remote_path);
        Ok(())
    }
}

/// True when every marker file exists. An empty marker list is trivially present.
pub async fn markers_present(shell: &dyn RemoteShell, markers: &[String]) -> Result<bool, ShellError> {
    if markers.is_empty() {
        return Ok(true);
    }
    let check = markers
        .iter()
        .map(|m| format!("test -f {}", shell_words::quote(m)))
        .collect::<Vec<_>>()
        .join(" && ");
    Ok(shell.run(&check).await?.success())
}

/// `systemctl is-active` prints `active` only for a running unit.
pub async fn service_active(shell: &dyn RemoteShell, service: &str) -> Result<bool, ShellError> {
    let out = shell.run(&format!("systemctl is-active {}", shell_words::quote(service))).await?;
    Ok(out.stdout.trim() == "active")
}
