// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::builtin::resolve_path;
use crate::{Tool, ToolCall, ToolCategory, ToolOutput};

pub struct ListDirTool {
    root: PathBuf,
}

impl ListDirTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "Lists the entries of a directory, sorted by name. Directories \
         carry a trailing slash."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: the working directory)"
                }
            },
            "additionalProperties": false
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileOps
    }
    fn priority(&self) -> u32 {
        8
    }
    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
        let path = call.args["path"].as_str().unwrap_or(".");
        let resolved = resolve_path(&self.root, path);

        let mut reader = match tokio::fs::read_dir(&resolved).await {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("list error: {e}")),
        };

        let mut entries = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    entries.push(if is_dir { format!("{name}/") } else { name });
                }
                Ok(None) => break,
                Err(e) => return ToolOutput::err(&call.id, format!("list error: {e}")),
            }
        }
        entries.sort();

        ToolOutput::ok(&call.id, json!({ "path": path, "entries": entries }))
    }
}
