use kestrel_store::{Event, UsageMetadata};
use serde_json::Value;

/// Sampling and reasoning knobs sent with every completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub thinking_enabled: bool,
    /// Token budget for model-internal reasoning; only consulted when
    /// `thinking_enabled` is set and the backend supports it.
    pub thinking_budget_tokens: Option<u32>,
}

/// A tool made available to the model for this request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: Value,
}

/// One streaming chat request.
///
/// `history` is the *effective window* of the session: compaction summary
/// events followed by the verbatim tail.  Drivers serialize it into their
/// provider's wire format; `Thought` parts are never sent back.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub history: Vec<Event>,
    pub tools: Vec<ToolDeclaration>,
    pub generation: GenerationConfig,
}

/// Why the model stopped emitting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Tool,
    Safety,
    Interrupted,
}

/// A single streamed event from the model.
///
/// Text and thought arrive as incremental deltas; a function call is
/// always delivered complete (drivers coalesce piecewise argument chunks
/// internally).  Usage updates carry cumulative counts — the latest one
/// wins.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ThoughtDelta(String),
    FunctionCall {
        id: String,
        name: String,
        args: Value,
    },
    UsageUpdate(UsageMetadata),
    TurnComplete(FinishReason),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
