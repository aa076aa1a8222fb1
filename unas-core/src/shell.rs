//! Remote command seam
//!
//! The kernel reaches the appliance through a shell transport (SSH in production,
//! a scripted fake in tests). Commands are plain strings; quoting is the caller's job.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { stdout: stdout.into(), stderr: String::new(), exit_code: 0 }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self { stdout: String::new(), stderr: stderr.into(), exit_code }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn transport: {0}")]
    Spawn(String),
    #[error("command timed out after {0}s")]
    Timeout(u64),
    #[error("transport failure: {0}")]
    Transport(String),
    /// The appliance was reached but refused the operation.
    #[error("remote command exited {code}: {detail}")]
    Exit { code: i32, detail: String },
}

impl ShellError {
    /// True when the appliance could not be talked to at all.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Exit { .. })
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a command on the appliance. A non-zero exit is reported in the output,
    /// not as an error; errors mean the command could not be run at all.
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError>;

    /// Write `content` to `remote_path` with the given permission bits.
    async fn upload(&self, remote_path: &str, content: &[u8], mode: u32) -> Result<(), ShellError>;
}
