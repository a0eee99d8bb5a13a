// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single typed fragment of an event's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    /// The model requests a tool invocation.
    FunctionCall {
        id: String,
        name: String,
        args: Value,
    },
    /// The result of a tool call.  Errors ride in the response payload
    /// (`{"error": ...}`) — a failed tool is still a response, never an
    /// exception out of the loop.
    FunctionResponse {
        id: String,
        name: String,
        response: Value,
    },
    /// Model-internal reasoning.  Kept in the log, stripped from requests.
    Thought {
        text: String,
    },
    /// Binary content such as an image, base64-encoded.
    InlineData {
        mime_type: String,
        data: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought { text: text.into() }
    }

    pub fn function_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    pub fn function_response(
        id: impl Into<String>,
        name: impl Into<String>,
        response: Value,
    ) -> Self {
        Self::FunctionResponse {
            id: id.into(),
            name: name.into(),
            response,
        }
    }
}

/// Side effects an event carries besides its content.
///
/// Keys in `state_delta` are scope-prefixed: `app:` and `user:` write into
/// the wider scopes, `temp:` keys live only for the invocation and are
/// never persisted, everything else is session state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_delta: BTreeMap<String, Value>,
}

impl EventActions {
    pub fn is_empty(&self) -> bool {
        self.state_delta.is_empty()
    }
}

/// Cumulative token counts as reported by the model for one request.
///
/// These are the raw counters off the wire; per-request deltas are derived
/// by the token tracker, which clamps resets to the reported value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub candidate_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub thought_tokens: u64,
    #[serde(default)]
    pub tool_use_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Metadata carried by a compaction event.  Consumers detect compaction
/// events by the presence of these fields in `custom_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionInfo {
    /// Number of plain (non-compaction) events this summary covers.
    pub compacted_event_count: usize,
    pub original_tokens: u64,
    pub compacted_tokens: u64,
    pub compression_ratio: f64,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

/// The atomic unit of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Groups all events of one user turn.
    pub invocation_id: String,
    /// `user` | `model` | `system` | a named agent.
    pub author: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub content: Vec<Part>,
    #[serde(default)]
    pub actions: EventActions,
    /// IDs of tool calls still outstanding across turns (approval gates).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_running_tool_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_metadata: Option<Value>,
    /// True only for streamed chunks; such events are never persisted.
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Event {
    /// A bare event with fresh id and timestamp and the given author.
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            timestamp: Utc::now(),
            branch: None,
            content: Vec::new(),
            actions: EventActions::default(),
            long_running_tool_ids: Vec::new(),
            grounding_metadata: None,
            custom_metadata: None,
            usage_metadata: None,
            citation_metadata: None,
            partial: false,
            turn_complete: false,
            interrupted: false,
            error_code: None,
            error_message: None,
        }
    }

    /// A user-authored text event.
    pub fn user_message(invocation_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut e = Self::new(invocation_id, "user");
        e.content.push(Part::text(text));
        e
    }

    /// The synthetic event appended when a turn is interrupted.
    pub fn interruption(invocation_id: impl Into<String>) -> Self {
        let mut e = Self::new(invocation_id, "system");
        e.interrupted = true;
        e.turn_complete = true;
        e
    }

    /// A compaction event: a system-authored summary carrying
    /// [`CompactionInfo`] in `custom_metadata`.
    pub fn compaction(summary: impl Into<String>, info: &CompactionInfo) -> Self {
        let mut e = Self::new(Uuid::new_v4().to_string(), "system");
        e.content.push(Part::text(summary));
        e.custom_metadata =
            Some(serde_json::to_value(info).expect("CompactionInfo serializes"));
        e.turn_complete = true;
        e
    }

    /// True when this event is a compaction summary.
    pub fn is_compaction(&self) -> bool {
        self.custom_metadata
            .as_ref()
            .map(|m| m.get("compacted_event_count").is_some())
            .unwrap_or(false)
    }

    /// Decode the compaction metadata, if present.
    pub fn compaction_info(&self) -> Option<CompactionInfo> {
        self.custom_metadata
            .as_ref()
            .and_then(|m| serde_json::from_value(m.clone()).ok())
    }

    /// Concatenated text of all `Text` parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All function-call parts, in emission order.
    pub fn function_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { id, name, args } => {
                    Some((id.as_str(), name.as_str(), args))
                }
                _ => None,
            })
            .collect()
    }

    /// Rough token estimate used for compaction budgeting (4 chars ≈ 1 token).
    pub fn approx_tokens(&self) -> u64 {
        let chars: usize = self
            .content
            .iter()
            .map(|p| match p {
                Part::Text { text } | Part::Thought { text } => text.len(),
                Part::FunctionCall { name, args, .. } => name.len() + args.to_string().len(),
                Part::FunctionResponse { name, response, .. } => {
                    name.len() + response.to_string().len()
                }
                Part::InlineData { data, .. } => data.len(),
            })
            .sum();
        ((chars / 4).max(1)) as u64
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
