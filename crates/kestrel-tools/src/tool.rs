// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Catalog groups, in the order they render into the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolCategory {
    FileOps,
    CodeEditing,
    Search,
    Execution,
    Display,
    AgentManagement,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 6] = [
        ToolCategory::FileOps,
        ToolCategory::CodeEditing,
        ToolCategory::Search,
        ToolCategory::Execution,
        ToolCategory::Display,
        ToolCategory::AgentManagement,
    ];
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolCategory::FileOps => "file operations",
            ToolCategory::CodeEditing => "code editing",
            ToolCategory::Search => "search",
            ToolCategory::Execution => "execution",
            ToolCategory::Display => "display",
            ToolCategory::AgentManagement => "agent management",
        };
        write!(f, "{s}")
    }
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// The result of executing a tool.
///
/// A failed tool is still a result: `response` carries an
/// `{"error": ...}` payload and `is_error` is set.  Errors never
/// propagate out of the tool layer as exceptions.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub call_id: String,
    pub response: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, response: Value) -> Self {
        Self {
            call_id: call_id.into(),
            response,
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            response: json!({ "error": msg.into() }),
            is_error: true,
        }
    }
}

/// Trait every built-in and remote tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object.
    fn parameters_schema(&self) -> Value;
    fn category(&self) -> ToolCategory;
    /// Higher sorts earlier within a category.
    fn priority(&self) -> u32 {
        0
    }
    /// Optional one-liner appended after the description in the prompt.
    fn usage_hint(&self) -> Option<&str> {
        None
    }
    /// Mutating tools run serially in model order; side-effect-free tools
    /// may run in parallel.
    fn is_mutating(&self) -> bool;
    /// Wall-clock budget for one invocation; the registry cancels the
    /// call's context when it is exceeded.
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
    /// Execute the tool.  Failures are reported via [`ToolOutput::err`].
    /// Implementations must return promptly once `cancel` fires.
    async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_order_matches_prompt_order() {
        assert!(ToolCategory::FileOps < ToolCategory::CodeEditing);
        assert!(ToolCategory::Search < ToolCategory::Execution);
        assert!(ToolCategory::Display < ToolCategory::AgentManagement);
    }

    #[test]
    fn err_output_wraps_message_in_error_payload() {
        let out = ToolOutput::err("t1", "file not found");
        assert!(out.is_error);
        assert_eq!(out.response["error"], "file not found");
    }

    #[test]
    fn ok_output_passes_payload_through() {
        let out = ToolOutput::ok("t1", json!({ "files": ["a", "b"] }));
        assert!(!out.is_error);
        assert_eq!(out.response["files"][0], "a");
    }

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Display
        }
        fn is_mutating(&self) -> bool {
            false
        }
        async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
            ToolOutput::ok(&call.id, json!("ok"))
        }
    }

    #[test]
    fn trait_defaults_apply() {
        let t = MinimalTool;
        assert_eq!(t.priority(), 0);
        assert!(t.usage_hint().is_none());
        assert_eq!(t.timeout(), Duration::from_secs(60));
    }
}
