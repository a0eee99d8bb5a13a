// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use kestrel_tools::ToolCall;

use crate::usage::RequestUsage;

/// Events emitted by the agent during a single turn.  The renderer (REPL
/// output task) subscribes to these to drive its output; nothing here is
/// persisted.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// The complete text response (after streaming finishes).
    TextComplete(String),
    /// A reasoning chunk from the model.
    ThoughtDelta(String),
    /// The complete reasoning block.
    ThoughtComplete(String),
    /// The model has requested a tool call.
    ToolCallStarted(ToolCall),
    /// A tool call finished.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Token usage of the model request that just completed.
    TokenUsage(RequestUsage),
    /// Older history was summarised into a compaction event.
    ContextCompacted {
        events_summarized: usize,
        original_tokens: u64,
        compacted_tokens: u64,
    },
    /// The invocation finished normally.
    TurnComplete,
    /// The invocation was interrupted by the user.
    Aborted,
    /// A terminal error ended the invocation.
    Error(String),
}
