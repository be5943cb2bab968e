// Shell command execution inside the sandbox root

use crate::tools::{truncate_output, ToolsConfig};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use toolgate_core::registry::{json_schema_integer, json_schema_object, json_schema_string};
use toolgate_core::{Sandbox, Tool, ToolDescriptor};

#[derive(Debug, Deserialize)]
struct ExecArgs {
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Tool to run a shell command with the sandbox root as working directory.
///
/// The child is killed when the timeout expires.
pub struct ExecTool {
    sandbox: Sandbox,
    default_timeout: Duration,
    max_timeout: Duration,
    max_output_bytes: usize,
}

impl ExecTool {
    pub fn new(sandbox: Sandbox, config: &ToolsConfig) -> Self {
        Self {
            sandbox,
            default_timeout: config.exec_timeout(),
            max_timeout: Duration::from_millis(config.max_exec_timeout_ms),
            max_output_bytes: config.max_output_bytes,
        }
    }

    fn command(&self, line: &str) -> Command {
        let mut command = if cfg!(windows) {
            let mut command = Command::new("cmd");
            command.arg("/C").arg(line);
            command
        } else {
            let mut command = Command::new("sh");
            command.arg("-c").arg(line);
            command
        };

        command
            .current_dir(self.sandbox.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait::async_trait]
impl Tool for ExecTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "exec".to_string(),
            description: format!(
                "Run a shell command in the workspace root and return its exit code and output. Default timeout {}ms.",
                self.default_timeout.as_millis()
            ),
            parameters: json_schema_object(
                serde_json::json!({
                    "command": json_schema_string("Shell command line to run"),
                    "timeout_ms": json_schema_integer("Timeout in milliseconds")
                }),
                vec!["command"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: ExecArgs = serde_json::from_value(params).context("Invalid arguments for exec")?;
        let timeout = args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout);

        tracing::info!(command = %args.command, timeout_ms = timeout.as_millis() as u64, "Running command");

        let child = self
            .command(&args.command)
            .spawn()
            .with_context(|| format!("Failed to start: {}", args.command))?;

        // Dropping the wait future on timeout drops the child, which kills it
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("Command timed out after {}ms: {}", timeout.as_millis(), args.command))?
            .context("Failed to collect command output")?;

        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "killed by signal".to_string());

        let mut result = format!("Exit code: {}", code);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            result.push_str(&format!("\n\nstdout:\n{}", stdout.trim_end()));
        }
        if !stderr.is_empty() {
            result.push_str(&format!("\n\nstderr:\n{}", stderr.trim_end()));
        }

        Ok(truncate_output(result, self.max_output_bytes))
    }
}
