// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Tool, ToolCall, ToolCategory, ToolOutput};

pub struct ExecuteCommandTool {
    workdir: PathBuf,
    timeout: Duration,
}

impl ExecuteCommandTool {
    pub fn new(workdir: PathBuf, timeout: Duration) -> Self {
        Self { workdir, timeout }
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Runs a shell command in the working directory and returns stdout, \
         stderr, and the exit code."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command line, run via `sh -c`"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Execution
    }
    fn priority(&self) -> u32 {
        10
    }
    fn is_mutating(&self) -> bool {
        true
    }
    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput {
        let Some(command) = call.args["command"].as_str() else {
            return ToolOutput::err(&call.id, "missing required parameter `command`");
        };
        debug!(%command, "execute_command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("spawn error: {e}")),
        };

        // kill_on_drop reaps the subprocess when cancellation wins the race.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return ToolOutput::err(&call.id, "cancelled");
            }
            result = child.wait_with_output() => match result {
                Ok(o) => o,
                Err(e) => return ToolOutput::err(&call.id, format!("wait error: {e}")),
            },
        };

        let response = json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exit_code": output.status.code().unwrap_or(-1),
        });
        if output.status.success() {
            ToolOutput::ok(&call.id, response)
        } else {
            ToolOutput {
                call_id: call.id.clone(),
                response,
                is_error: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(dir: &std::path::Path) -> ExecuteCommandTool {
        ExecuteCommandTool::new(dir.to_path_buf(), Duration::from_secs(10))
    }

    fn call(cmd: &str) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: "execute_command".into(),
            args: json!({ "command": cmd }),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(dir.path())
            .execute(&call("echo hello"), CancellationToken::new())
            .await;
        assert!(!out.is_error);
        assert_eq!(out.response["stdout"], "hello\n");
        assert_eq!(out.response["exit_code"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_flagged_as_error_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(dir.path())
            .execute(&call("echo oops >&2; exit 3"), CancellationToken::new())
            .await;
        assert!(out.is_error);
        assert_eq!(out.response["exit_code"], 3);
        assert_eq!(out.response["stderr"], "oops\n");
    }

    #[tokio::test]
    async fn runs_in_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let out = tool(dir.path())
            .execute(&call("ls"), CancellationToken::new())
            .await;
        assert!(out.response["stdout"].as_str().unwrap().contains("marker"));
    }

    #[tokio::test]
    async fn cancellation_kills_a_running_command_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killer.cancel();
        });
        let start = std::time::Instant::now();
        let out = tool(dir.path()).execute(&call("sleep 30"), cancel).await;
        assert!(out.is_error);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
