//! Local command execution
//!
//! The telemetry reader shells out to `udevadm`, `smartctl`, `df` and `dpkg-query`. Every call
//! goes through `CommandRunner` with a hard timeout so a hung tool cannot stall a cycle; tests
//! substitute a table of canned outputs.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
}

/// Stdout of a finished command. Non-zero exits still return their stdout: `smartctl` sets
/// status bits on healthy drives and its JSON is what matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub exit_code: i32,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Captured, ExecError>;
}

pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Captured, ExecError> {
        debug!("Executing {} {:?} (timeout: {:?})", program, args, self.timeout);
        let output = tokio::time::timeout(
            self.timeout,
            AsyncCommand::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ExecError::Timeout { program: program.to_string(), secs: self.timeout.as_secs() })?
        .map_err(|source| ExecError::Spawn { program: program.to_string(), source })?;

        Ok(Captured {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_execution() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let out = runner.run("echo", &["Hello World"]).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "Hello World");
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_stdout() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let out = runner.run("sh", &["-c", "echo partial; exit 4"]).await.unwrap();
        assert_eq!(out.exit_code, 4);
        assert_eq!(out.stdout.trim(), "partial");
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let runner = SystemRunner::new(Duration::from_millis(200));
        let err = runner.run("sleep", &["10"]).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = SystemRunner::new(Duration::from_secs(1));
        let err = runner.run("definitely-not-a-real-binary-unas", &[]).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
