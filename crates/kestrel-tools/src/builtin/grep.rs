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

const DEFAULT_MAX_RESULTS: usize = 100;
/// Files larger than this are skipped; they are almost never source code.
const MAX_FILE_BYTES: u64 = 1_000_000;

pub struct GrepTool {
    root: PathBuf,
}

impl GrepTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Searches file contents recursively with a regular expression. \
         Returns `file:line: text` matches, leading matches first. Hidden \
         directories and files over 1 MB are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory or file to search (default: the working directory)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of matches to return (default 100)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Search
    }
    fn priority(&self) -> u32 {
        10
    }
    fn usage_hint(&self) -> Option<&str> {
        Some("prefer a specific pattern over paging through broad results")
    }
    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput {
        let Some(pattern) = call.args["pattern"].as_str() else {
            return ToolOutput::err(&call.id, "missing required parameter `pattern`");
        };
        let path = call.args["path"].as_str().unwrap_or(".");
        let max_results = call.args["max_results"]
            .as_u64()
            .unwrap_or(DEFAULT_MAX_RESULTS as u64) as usize;

        let regex = match regex::Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid pattern: {e}")),
        };
        let resolved = resolve_path(&self.root, path);
        let call_id = call.id.clone();
        let display_root = self.root.clone();

        // The directory walk is blocking work; keep it off the async
        // executor so cancellation of sibling tasks stays responsive.
        let result = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            let mut truncated = false;
            'walk: for entry in WalkDir::new(&resolved)
                .into_iter()
                .filter_entry(|e| !is_hidden(e))
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                if cancel.is_cancelled() {
                    break;
                }
                if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let shown = entry
                    .path()
                    .strip_prefix(&display_root)
                    .unwrap_or(entry.path())
                    .display()
                    .to_string();
                for (lineno, line) in text.lines().enumerate() {
                    if regex.is_match(line) {
                        if matches.len() >= max_results {
                            truncated = true;
                            break 'walk;
                        }
                        matches.push(format!("{shown}:{}: {}", lineno + 1, line.trim_end()));
                    }
                }
            }
            (matches, truncated)
        })
        .await;

        match result {
            Ok((matches, truncated)) => {
                let mut response = json!({
                    "count": matches.len(),
                    "matches": matches,
                });
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
