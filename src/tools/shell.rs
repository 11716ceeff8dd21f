//! 命令执行工具：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、python3）；禁止 rm -rf、wget、chmod 777 等子串；
//! 执行通过 sh -c，工作目录固定为工作区，带超时与 tracing 审计。

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::core::AgentError;
use crate::tools::{Capability, Tool, ToolOutput};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "sudo ",
    ":(){ :|:& };:", // fork bomb
];

pub struct CommandTool {
    allowed_commands: HashSet<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(allowed_commands: Vec<String>, workdir: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            workdir: workdir.into(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    fn check_allowed(&self, raw: &str) -> Result<(), AgentError> {
        let raw_lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| raw_lower.contains(*f)) {
            return Err(AgentError::Authorization(format!("Forbidden pattern: {forbidden}")));
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err(AgentError::Tool("Empty command".into()));
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(AgentError::Authorization(format!("Command '{name}' not in allowlist")))
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn capability(&self) -> Capability {
        Capability::Command
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command inside the workspace. Args: {\"command\": \"ls -la\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, AgentError> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.check_allowed(command)?;

        tracing::info!(command = %command, "command tool execute");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command])
            .current_dir(&self.workdir)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AgentError::Timeout(format!("Command timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| AgentError::Tool(format!("Execution failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(AgentError::Tool(format!(
                "Exit {:?}\nstderr: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(ToolOutput::text(if stderr.is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        }))
    }
}
