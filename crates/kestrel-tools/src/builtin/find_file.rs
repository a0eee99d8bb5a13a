// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::builtin::resolve_path;
use crate::{Tool, ToolCall, ToolCategory, ToolOutput};

const DEFAULT_MAX_RESULTS: usize = 200;

pub struct FindFileTool {
    root: PathBuf,
}

impl FindFileTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for FindFileTool {
    fn name(&self) -> &str {
        "find_file"
    }

    fn description(&self) -> &str {
        "Finds files whose path contains the given substring (case \
         insensitive), searching recursively. Hidden directories are \
         skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Substring to match against the relative path"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (default: the working directory)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of paths to return (default 200)"
                }
            },
            "required": ["name"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Search
    }
    fn priority(&self) -> u32 {
        8
    }
    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput {
        let Some(name) = call.args["name"].as_str() else {
            return ToolOutput::err(&call.id, "missing required parameter `name`");
        };
        let path = call.args["path"].as_str().unwrap_or(".");
        let max_results = call.args["max_results"]
            .as_u64()
            .unwrap_or(DEFAULT_MAX_RESULTS as u64) as usize;

        let needle = name.to_lowercase();
        let resolved = resolve_path(&self.root, path);
        let display_root = self.root.clone();
        let call_id = call.id.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let mut truncated = false;
            for entry in WalkDir::new(&resolved)
                .into_iter()
                .filter_entry(|e| !is_hidden(e))
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                if cancel.is_cancelled() {
                    break;
                }
                let shown = entry
                    .path()
                    .strip_prefix(&display_root)
                    .unwrap_or(entry.path())
                    .display()
                    .to_string();
                if shown.to_lowercase().contains(&needle) {
                    if files.len() >= max_results {
                        truncated = true;
                        break;
                    }
                    files.push(shown);
                }
            }
            files.sort();
            (files, truncated)
        })
        .await;

        match result {
            Ok((files, truncated)) => {
                let mut response = json!({ "count": files.len(), "files": files });
                if truncated {
                    response["truncated"] = json!(true);
                }
                ToolOutput::ok(&call_id, response)
            }
            Err(e) => ToolOutput::err(&call_id, format!("search task failed: {e}")),
        }
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: "find_file".into(),
            args,
        }
    }

    #[tokio::test]
    async fn matches_substring_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/Main.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        let tool = FindFileTool::new(dir.path().to_path_buf());
        let out = tool
            .execute(&call(json!({ "name": "main" })), CancellationToken::new())
            .await;
        assert_eq!(out.response["count"], 1);
        assert_eq!(out.response["files"][0], "src/Main.rs");
    }

    #[tokio::test]
    async fn hidden_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cache")).unwrap();
        std::fs::write(dir.path().join(".cache/notes.txt"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        let tool = FindFileTool::new(dir.path().to_path_buf());
        let out = tool
            .execute(&call(json!({ "name": "notes" })), CancellationToken::new())
            .await;
        assert_eq!(out.response["count"], 1);
        assert_eq!(out.response["files"][0], "notes.txt");
    }

    #[tokio::test]
    async fn results_are_sorted_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("log{i}.txt")), "").unwrap();
        }
        let tool = FindFileTool::new(dir.path().to_path_buf());
        let out = tool
            .execute(
                &call(json!({ "name": "log", "max_results": 3 })),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(out.response["count"], 3);
        assert_eq!(out.response["truncated"], true);
    }
}
