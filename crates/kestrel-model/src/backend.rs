// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{ChatRequest, ModelError, ModelEvent};

pub type ModelEventStream =
    Pin<Box<dyn Stream<Item = Result<ModelEvent, ModelError>> + Send>>;

/// Abstract streaming chat with tool calling.
///
/// Implementations must preserve causal ordering within one `stream_chat`
/// call and should emit a final `TurnComplete` event; consumers treat
/// end-of-stream without one as an implicit stop.  When `cancel` fires the
/// backend aborts the underlying transport promptly and ends the stream.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend identifier: `gemini` | `vertexai` | `openai` | `ollama`.
    fn backend_id(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    async fn stream_chat(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ModelEventStream, ModelError>;
}
