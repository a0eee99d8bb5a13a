// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming chat abstraction over multiple LLM providers.
//!
//! The invocation loop talks to [`ModelBackend`] only; the concrete
//! drivers (`gemini`, `vertexai`, `openai`, `ollama`) translate the
//! provider wire formats into a uniform stream of [`ModelEvent`]s, with
//! causal ordering preserved within a single `stream_chat` call.

mod backend;
mod error;
pub mod gemini;
pub mod mock;
pub mod ollama;
pub mod openai;
mod registry;
mod sse;
mod types;
pub mod vertexai;

pub use backend::{ModelBackend, ModelEventStream};
pub use error::ModelError;
pub use registry::{
    create_backend, get_backend_meta, list_aliases, list_backends, parse_model_spec,
    resolve_alias, resolve_selection, BackendMeta, BackendOptions, ModelSelection,
};
pub use types::{ChatRequest, FinishReason, GenerationConfig, ModelEvent, ToolDeclaration};
