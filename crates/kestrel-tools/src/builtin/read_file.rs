// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::builtin::resolve_path;
use crate::{Tool, ToolCall, ToolCategory, ToolOutput};

/// Default number of lines returned when the caller does not specify a
/// limit.  The agent paginates with offset + limit for more.
const DEFAULT_LINE_LIMIT: usize = 200;

pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a text file. Returns up to 200 lines starting at the 1-indexed \
         `offset`; pass `limit` to read more or less. A pagination note shows \
         the next offset when more lines exist."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or working-directory-relative path"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 200)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileOps
    }
    fn priority(&self) -> u32 {
        10
    }
    fn usage_hint(&self) -> Option<&str> {
        Some("grep first, then read only the relevant region with offset+limit")
    }
    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
        let Some(path) = call.args["path"].as_str() else {
            return ToolOutput::err(&call.id, "missing required parameter `path`");
        };
        let offset = call.args["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = call.args["limit"]
            .as_u64()
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        let resolved = resolve_path(&self.root, path);
        debug!(path = %resolved.display(), offset, limit, "read_file");

        let text = match tokio::fs::read_to_string(&resolved).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let lines: Vec<&str> = text.lines().collect();
        let total = lines.len();
        let window: Vec<String> = lines
            .iter()
            .skip(offset - 1)
            .take(limit)
            .map(|l| l.to_string())
            .collect();
        let shown = window.len();

        let mut response = json!({
            "path": path,
            "content": window.join("\n"),
            "total_lines": total,
        });
        if offset - 1 + shown < total {
            response["next_offset"] = json!(offset + shown);
        }
        ToolOutput::ok(&call.id, response)
    }
}
