// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that must be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Named agent profiles runnable with `/run-agent <name> <task>`.
    ///
    /// ```yaml
    /// agents:
    ///   reviewer:
    ///     description: strict code reviewer
    ///     system_prompt: |
    ///       You review code changes and point out defects. You never edit files.
    /// ```
    #[serde(default)]
    pub agents: HashMap<String, AgentProfile>,
    /// MCP servers launched at startup; their tools register as `<name>.<tool>`.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Backend identifier: "gemini" | "vertexai" | "openai" | "ollama".
    pub backend: String,
    /// Model name or shorthand forwarded to the backend (aliases resolve
    /// at startup, e.g. "flash" → "gemini-2.5-flash").
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    /// When unset, the backend registry's canonical env var is used.
    pub api_key_env: Option<String>,
    /// Base URL override for local proxies or self-hosted servers.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff.
    pub top_p: Option<f32>,
    /// Request model-internal reasoning where the backend supports it.
    #[serde(default)]
    pub thinking_enabled: bool,
    /// Token budget for reasoning when `thinking_enabled` is set.
    pub thinking_budget_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "gemini".into(),
            name: "gemini-2.5-flash".into(),
            api_key_env: None,
            base_url: None,
            max_output_tokens: Some(8192),
            temperature: Some(0.2),
            top_p: None,
            thinking_enabled: false,
            thinking_budget_tokens: None,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    32
}
fn default_tool_workers() -> usize {
    4
}
fn default_tool_result_char_cap() -> usize {
    16_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on model→tool rounds within one invocation.  Hitting it
    /// terminates the turn with an error event.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Upper bound on concurrently running tool calls.  Mutating tools run
    /// serially regardless of this value.
    #[serde(default = "default_tool_workers")]
    pub tool_workers: usize,
    /// Maximum characters of a single tool result persisted into history.
    /// Longer results are head-truncated with an omission notice.
    /// 0 disables truncation.
    #[serde(default = "default_tool_result_char_cap")]
    pub tool_result_char_cap: usize,
    /// System prompt override; None uses the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            tool_workers: default_tool_workers(),
            tool_result_char_cap: default_tool_result_char_cap(),
            system_prompt: None,
        }
    }
}

fn default_invocation_threshold() -> usize {
    10
}
fn default_overlap_window() -> usize {
    2
}
fn default_token_threshold() -> u64 {
    200_000
}
fn default_safety_ratio() -> f64 {
    0.8
}

/// Compaction trigger settings.
///
/// Compaction replaces a prefix of the session log — in the model-visible
/// window only — with one LLM-written summary event.  The raw prefix stays
/// on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Trigger when more than this many completed invocations accumulate
    /// since the last compaction.
    #[serde(default = "default_invocation_threshold")]
    pub invocation_threshold: usize,
    /// Most-recent invocations kept verbatim (never summarised).
    #[serde(default = "default_overlap_window")]
    pub overlap_window: usize,
    /// Hard ceiling on the model's input context, in tokens.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,
    /// Headroom fraction in (0, 1]: the token trigger fires at
    /// `token_threshold * safety_ratio`.
    #[serde(default = "default_safety_ratio")]
    pub safety_ratio: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            invocation_threshold: default_invocation_threshold(),
            overlap_window: default_overlap_window(),
            token_threshold: default_token_threshold(),
            safety_ratio: default_safety_ratio(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default timeout in seconds for a single tool call.  Individual tools
    /// may declare a longer or shorter timeout in their metadata.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_app_name() -> String {
    "kestrel".into()
}
fn default_user_id() -> String {
    "local".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite session store.  Defaults to `~/.kestrel/sessions.db`.
    /// `~` and environment variables are expanded.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            app_name: default_app_name(),
            user_id: default_user_id(),
        }
    }
}

impl StoreConfig {
    /// Resolve the store path: explicit config value (expanded) or the
    /// default `~/.<app>/sessions.db`.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).into_owned()),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(format!(".{}", self.app_name))
                .join("sessions.db"),
        }
    }
}

/// A named agent profile: a system-prompt override run under its own
/// author name in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
}

/// One MCP server launched as a child process at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Registry namespace: tools register as `<name>.<tool>`.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
