use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_common::{Error, Result};
use parley_security::{ApprovalGate, is_dangerous};
use serde_json::json;
use tracing::{info, warn};

use crate::tools::{Tool, ToolContext, ToolOutput};

const DEFAULT_MAX_OUTPUT_BYTES: usize = 32_768;

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s[..cutoff].to_string()
}

/// `exec` tool: runs a command through `sh -c`.
///
/// Commands matching the destructive denylist wait on the approval gate and
/// only run when a human approves. The child is killed when the run is
/// cancelled or the timeout elapses.
pub struct ShellTool {
    gate: Arc<ApprovalGate>,
    timeout: Duration,
    max_output: usize,
}

impl ShellTool {
    pub fn new(gate: Arc<ApprovalGate>, timeout: Duration) -> Self {
        Self {
            gate,
            timeout,
            max_output: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    async fn approved(&self, context: &ToolContext, command: &str) -> Result<bool> {
        let ticket = self
            .gate
            .request_approval(&context.conversation_id, command)
            .await;
        let request_id = ticket.request_id.clone();

        tokio::select! {
            biased;
            _ = context.cancel.cancelled() => {
                // Resolve the slot so the pending entry does not outlive the run.
                self.gate.handle_decision(&request_id, false);
                Err(Error::Cancelled)
            }
            approved = self.gate.await_decision(ticket) => Ok(approved),
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn description(&self) -> &'static str {
        "Execute a shell command and return its combined stdout and stderr. \
         Destructive commands require human approval before they run."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let command = args["command"]
            .as_str()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Agent("missing or invalid 'command' argument".to_string()))?;

        if is_dangerous(command) {
            info!(conversation = %context.conversation_id, "command needs approval: {}", command);
            if !self.approved(context, command).await? {
                return Ok(ToolOutput::error(format!(
                    "command denied: `{command}` was not approved"
                )));
            }
        }

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => {
                warn!(conversation = %context.conversation_id, "run cancelled, killing `{}`", command);
                return Err(Error::Cancelled);
            }
            result = tokio::time::timeout(self.timeout, child) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(Error::Agent(format!("failed to spawn `{command}`: {e}"))),
                Err(_) => {
                    return Ok(ToolOutput::error(format!(
                        "command timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut combined = format!("{stdout}{stderr}");
        if combined.len() > self.max_output {
            combined = truncate_utf8(&combined, self.max_output);
            combined.push_str("\n... (truncated)");
        }

        if output.status.success() {
            Ok(ToolOutput::success(combined))
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Ok(ToolOutput::error(format!("exit status {code}\n{combined}")))
        }
    }
}
