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

pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Writes `content` to a file, replacing it entirely. Parent \
         directories are created as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or working-directory-relative path"
                },
                "content": {
                    "type": "string",
                    "description": "Full new file content"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::CodeEditing
    }
    fn priority(&self) -> u32 {
        10
    }
    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
        let Some(path) = call.args["path"].as_str() else {
            return ToolOutput::err(&call.id, "missing required parameter `path`");
        };
        let Some(content) = call.args["content"].as_str() else {
            return ToolOutput::err(&call.id, "missing required parameter `content`");
        };

        let resolved = resolve_path(&self.root, path);
        debug!(path = %resolved.display(), bytes = content.len(), "write_file");

        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => ToolOutput::ok(
                &call.id,
                json!({ "path": path, "bytes_written": content.len() }),
            ),
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}
