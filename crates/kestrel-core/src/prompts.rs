// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use kestrel_tools::ToolRegistry;

const IDENTITY: &str = "\
You are kestrel, an autonomous coding agent running in a terminal. You help \
the user read, understand, and change code in their working directory by \
calling the tools listed below. Work in small verifiable steps: inspect \
before you edit, run commands to confirm behaviour, and report what you \
actually observed.";

// ─── Guidelines module ───────────────────────────────────────────────────────
// Modular guideline blocks for easier maintenance and testing.

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools to gather facts instead of guessing.\n\
         - Quote file paths and line numbers when you reference code.\n\
         - Answer directly when no tool is needed; do not narrate tool calls you\n\
           did not make."
    }

    pub fn tool_usage() -> &'static str {
        "- Never use `execute_command` for file I/O — use `read_file`, `write_file`,\n\
           `list_dir`, `find_file`, and `grep`.\n\
         - Discovery workflow: `find_file` to locate candidates, `grep` to narrow,\n\
           then `read_file` with offset+limit for the relevant region only.\n\
         - Side-effect-free calls (reads, searches) may be issued together in one\n\
           turn; they run in parallel. Order matters only for writes and commands.\n\
         - Large outputs are truncated with an omission notice; refine the request\n\
           (a tighter pattern, a narrower line range) rather than re-running it."
    }

    pub fn code_quality() -> &'static str {
        "- Preserve the existing structure, naming, and style of the code you touch.\n\
         - Prefer minimal, focused edits; re-read a file region before rewriting it.\n\
         - Do not create new files unless the task requires them.\n\
         - After an edit, verify it: run the build, the tests, or the command the\n\
           user cares about, and report the actual output."
    }

    pub fn error_handling() -> &'static str {
        "- When a command or tool fails, read the error, adjust, and retry or\n\
           explain why it cannot work.\n\
         - A tool result containing an `error` field is an observation, not a\n\
           dead end — recover or pick another approach.\n\
         - Never fabricate output you did not observe."
    }

    pub fn completion() -> &'static str {
        "- When the task is complete, summarise what changed, where, and how it\n\
           was verified.\n\
         - List anything left undone or any follow-up the user should know about."
    }
}

/// The ambient facts a system prompt is assembled from.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceContext {
    pub working_dir: PathBuf,
    pub platform: String,
    /// Contents of the project context file (AGENTS.md or
    /// .kestrel/context.md), read once at startup.
    pub project_context: Option<String>,
}

impl WorkspaceContext {
    pub fn current() -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            project_context: load_project_context(&working_dir),
            working_dir,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Look for a project context file in the working directory.  First match
/// wins.
pub fn load_project_context(working_dir: &std::path::Path) -> Option<String> {
    for candidate in ["AGENTS.md", ".kestrel/context.md"] {
        let path = working_dir.join(candidate);
        if let Ok(text) = std::fs::read_to_string(&path) {
            if !text.trim().is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Assemble the system prompt: identity (or the caller's override), the
/// workspace facts, the project context file, and the tool catalog
/// grouped by category in priority order.  The catalog and workspace
/// sections are always present so an override cannot leave the model
/// blind to its tools.
pub fn system_prompt(
    ctx: &WorkspaceContext,
    tools: &ToolRegistry,
    override_prompt: Option<&str>,
) -> String {
    let mut out = String::new();
    match override_prompt {
        Some(custom) => out.push_str(custom.trim()),
        None => out.push_str(IDENTITY),
    }

    out.push_str("\n\n# Workspace\n");
    out.push_str(&format!(
        "Working directory: {}\nPlatform: {}\n",
        ctx.working_dir.display(),
        ctx.platform
    ));

    if let Some(project) = &ctx.project_context {
        out.push_str("\n# Project context\n");
        out.push_str(project.trim());
        out.push('\n');
    }

    out.push_str("\n# Tools\n");
    for section in tools.catalog() {
        out.push_str(&format!("\n## {}\n", section.category));
        for entry in &section.tools {
            out.push_str(&format!("- {}: {}", entry.name, entry.description));
            if let Some(hint) = &entry.usage_hint {
                out.push_str(&format!(" ({hint})"));
            }
            out.push('\n');
        }
    }

    if override_prompt.is_none() {
        out.push_str("\n# Guidelines\n");
        for block in [
            guidelines::general(),
            guidelines::tool_usage(),
            guidelines::code_quality(),
            guidelines::error_handling(),
            guidelines::completion(),
        ] {
            out.push_str(block);
            out.push('\n');
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use kestrel_tools::{Tool, ToolCall, ToolCategory, ToolOutput};
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct FakeTool {
        name: &'static str,
        category: ToolCategory,
        priority: u32,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "does things"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn category(&self) -> ToolCategory {
            self.category
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        fn is_mutating(&self) -> bool {
            false
        }
        async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
            ToolOutput::ok(&call.id, json!("ok"))
        }
    }

    fn ctx() -> WorkspaceContext {
        WorkspaceContext {
            working_dir: PathBuf::from("/work"),
            platform: "linux".into(),
            project_context: None,
        }
    }

    #[test]
    fn prompt_contains_workspace_and_tools() {
        let reg = ToolRegistry::new();
        reg.register(FakeTool {
            name: "read_file",
            category: ToolCategory::FileOps,
            priority: 1,
        })
        .unwrap();
        let p = system_prompt(&ctx(), &reg, None);
        assert!(p.contains("Working directory: /work"));
        assert!(p.contains("## file operations"));
        assert!(p.contains("- read_file: does things"));
        assert!(p.contains("# Guidelines"));
    }

    #[test]
    fn guideline_blocks_all_render() {
        let reg = ToolRegistry::new();
        let p = system_prompt(&ctx(), &reg, None);
        assert!(p.contains("Discovery workflow"));
        assert!(p.contains("Preserve the existing structure"));
        assert!(p.contains("Never fabricate output"));
        assert!(p.contains("summarise what changed"));
    }

    #[test]
    fn higher_priority_tools_render_first_within_category() {
        let reg = ToolRegistry::new();
        reg.register(FakeTool {
            name: "minor",
            category: ToolCategory::Search,
            priority: 1,
        })
        .unwrap();
        reg.register(FakeTool {
            name: "major",
            category: ToolCategory::Search,
            priority: 9,
        })
        .unwrap();
        let p = system_prompt(&ctx(), &reg, None);
        let major = p.find("- major").unwrap();
        let minor = p.find("- minor").unwrap();
        assert!(major < minor);
    }

    #[test]
    fn override_replaces_identity_but_keeps_tools() {
        let reg = ToolRegistry::new();
        reg.register(FakeTool {
            name: "grep",
            category: ToolCategory::Search,
            priority: 0,
        })
        .unwrap();
        let p = system_prompt(&ctx(), &reg, Some("You only review code."));
        assert!(p.starts_with("You only review code."));
        assert!(!p.contains("You are kestrel"));
        assert!(p.contains("- grep"));
        assert!(!p.contains("# Guidelines"));
    }

    #[test]
    fn project_context_file_is_injected() {
        let reg = ToolRegistry::new();
        let mut c = ctx();
        c.project_context = Some("Always run `make check` before finishing.".into());
        let p = system_prompt(&c, &reg, None);
        assert!(p.contains("# Project context"));
        assert!(p.contains("make check"));
    }

    #[test]
    fn load_project_context_prefers_agents_md() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".kestrel")).unwrap();
        std::fs::write(dir.path().join(".kestrel/context.md"), "secondary").unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "primary").unwrap();
        assert_eq!(load_project_context(dir.path()).as_deref(), Some("primary"));
    }

    #[test]
    fn load_project_context_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_project_context(dir.path()).is_none());
    }
}
