/*!
Scripted remote shell

Stands in for the SSH transport. It understands the handful of command shapes the kernel
sends (`test -f` chains, `systemctl` verbs) against an in-memory file set and service table;
anything else succeeds with empty output unless a scripted reply matches first.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use unas_core::{CommandOutput, RemoteShell, ShellError};

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub path: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

#[derive(Clone, Default)]
pub struct ScriptedShell {
    files: Arc<Mutex<HashSet<String>>>,
    services: Arc<Mutex<HashMap<String, bool>>>,
    replies: Arc<Mutex<Vec<(String, Reply)>>>,
    commands: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<Upload>>>,
    upload_failures: Arc<Mutex<Vec<(String, CommandOutput)>>>,
    unreachable: Arc<AtomicBool>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str) -> &Self {
        self.files.lock().insert(path.to_string());
        self
    }

    pub fn remove_file(&self, path: &str) -> &Self {
        self.files.lock().remove(path);
        self
    }

    pub fn set_service(&self, name: &str, active: bool) -> &Self {
        self.services.lock().insert(unit_name(name), active);
        self
    }

    pub fn service_active(&self, name: &str) -> bool {
        self.services.lock().get(&unit_name(name)).copied().unwrap_or(false)
    }

    /// Reply with `output` to any command containing `needle`. Later replies win.
    pub fn reply(&self, needle: &str, output: CommandOutput) -> &Self {
        self.replies.lock().push((needle.to_string(), Reply::Output(output)));
        self
    }

    /// Fail any command containing `needle` at the transport level.
    pub fn fail(&self, needle: &str, reason: &str) -> &Self {
        self.replies.lock().push((needle.to_string(), Reply::TransportError(reason.to_string())));
        self
    }

    /// Uploads whose path contains `needle` reach the appliance but exit non-zero.
    pub fn fail_upload(&self, needle: &str, code: i32, stderr: &str) -> &Self {
        self.upload_failures
            .lock()
            .push((needle.to_string(), CommandOutput::failed(code, stderr)));
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands.lock().iter().any(|c| c.contains(needle))
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().clone()
    }

    fn scripted(&self, command: &str) -> Option<Reply> {
        self.replies
            .lock()
            .iter()
            .rev()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
    }

    fn interpret(&self, command: &str) -> CommandOutput {
        let mut stdout = String::new();
        for segment in command.split("&&") {
            let words = match shell_words::split(segment.trim()) {
                Ok(words) => words,
                Err(e) => return CommandOutput::failed(2, format!("parse error: {e}")),
            };
            let words: Vec<&str> = words.iter().map(String::as_str).collect();
            let (code, out) = self.interpret_segment(&words);
            stdout.push_str(&out);
            if code != 0 {
                return CommandOutput { stdout, stderr: String::new(), exit_code: code };
            }
        }
        CommandOutput::ok(stdout)
    }

    fn interpret_segment(&self, words: &[&str]) -> (i32, String) {
        match words {
            ["test", "-f", path] => {
                let present = self.files.lock().contains(*path);
                (if present { 0 } else { 1 }, String::new())
            }
            ["systemctl", "is-active", name] => {
                if self.service_active(name) {
                    (0, "active\n".to_string())
                } else {
                    (3, "inactive\n".to_string())
                }
            }
            ["systemctl", "start" | "restart", names @ ..] => {
                self.mark(names, true);
                (0, String::new())
            }
            ["systemctl", "enable", "--now", names @ ..] => {
                self.mark(names, true);
                (0, String::new())
            }
            ["systemctl", "stop", names @ ..] => {
                self.mark(names, false);
                (0, String::new())
            }
            _ => (0, String::new()),
        }
    }

    fn mark(&self, names: &[&str], active: bool) {
        let mut services = self.services.lock();
        for name in names {
            services.insert(unit_name(name), active);
        }
    }
}

fn unit_name(name: &str) -> String {
    name.trim_end_matches(".service").to_string()
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
        self.commands.lock().push(command.to_string());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ShellError::Transport("connection refused".to_string()));
        }
        match self.scripted(command) {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::TransportError(reason)) => Err(ShellError::Transport(reason)),
            None => Ok(self.interpret(command)),
        }
    }

    async fn upload(&self, remote_path: &str, content: &[u8], mode: u32) -> Result<(), ShellError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ShellError::Transport("connection refused".to_string()));
        }
        let rejected = self
            .upload_failures
            .lock()
            .iter()
            .find(|(needle, _)| remote_path.contains(needle.as_str()))
            .map(|(_, out)| out.clone());
        if let Some(out) = rejected {
            return Err(ShellError::Exit { code: out.exit_code, detail: out.stderr });
        }
        self.uploads.lock().push(Upload {
            path: remote_path.to_string(),
            content: content.to_vec(),
            mode,
        });
        self.files.lock().insert(remote_path.to_string());
        log::info!("📦 [MOCK] uploaded {} bytes to {remote_path}", content.len());
        Ok(())
    }
}
