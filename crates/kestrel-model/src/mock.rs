// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use kestrel_store::UsageMetadata;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::{ModelBackend, ModelEventStream};
use crate::{ChatRequest, FinishReason, ModelError, ModelEvent};

/// A pre-scripted backend.  Each `stream_chat` call pops the next event
/// script from the front of the queue, so tests can specify exact event
/// sequences — including tool calls — without network access.  Every
/// request is recorded for inspection.
pub struct ScriptedBackend {
    scripts: Mutex<Vec<Vec<ModelEvent>>>,
    /// Every `ChatRequest` seen, in call order.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedBackend {
    /// Build a backend from an ordered list of per-call event scripts.
    pub fn new(scripts: Vec<Vec<ModelEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: a single text reply with usage, then stop.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ModelEvent::TextDelta(reply.into()),
            ModelEvent::UsageUpdate(UsageMetadata {
                prompt_tokens: 5,
                candidate_tokens: 5,
                total_tokens: 10,
                ..Default::default()
            }),
            ModelEvent::TurnComplete(FinishReason::Stop),
        ]])
    }

    /// Convenience: round 1 emits a tool call, round 2 a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ModelEvent::FunctionCall {
                    id: tool_id.into(),
                    name: tool_name.into(),
                    args,
                },
                ModelEvent::TurnComplete(FinishReason::Tool),
            ],
            vec![
                ModelEvent::TextDelta(final_text.into()),
                ModelEvent::TurnComplete(FinishReason::Stop),
            ],
        ])
    }

    /// Number of completed `stream_chat` calls.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The last request seen, if any.
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn backend_id(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock"
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ModelEventStream, ModelError> {
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    ModelEvent::TextDelta("[no more scripts]".into()),
                    ModelEvent::TurnComplete(FinishReason::Stop),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<ModelEvent, ModelError>> =
            events.into_iter().map(Ok).collect();
        use futures::StreamExt;
        Ok(Box::pin(
            stream::iter(wrapped).take_until(cancel.cancelled_owned()),
        ))
    }
}

/// A backend that always fails, for error-path tests.
pub struct FailingBackend {
    pub error_status: u16,
}

#[async_trait]
impl ModelBackend for FailingBackend {
    fn backend_id(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "failing-mock"
    }

    async fn stream_chat(
        &self,
        _req: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<ModelEventStream, ModelError> {
        Err(ModelError::from_status(
            self.error_status,
            "scripted failure".into(),
        ))
    }
}

/// Script fragment helpers used across tests.
pub fn text_turn(text: &str, total_tokens: u64) -> Vec<ModelEvent> {
    vec![
        ModelEvent::TextDelta(text.to_string()),
        ModelEvent::UsageUpdate(UsageMetadata {
            prompt_tokens: total_tokens / 2,
            candidate_tokens: total_tokens - total_tokens / 2,
            total_tokens,
            ..Default::default()
        }),
        ModelEvent::TurnComplete(FinishReason::Stop),
    ]
}

/// A turn that calls the named tools (empty args) then completes.
pub fn call_turn(names: &[&str]) -> Vec<ModelEvent> {
    let mut evs: Vec<ModelEvent> = names
        .iter()
        .enumerate()
        .map(|(i, name)| ModelEvent::FunctionCall {
            id: format!("t{i}"),
            name: name.to_string(),
            args: json!({}),
        })
        .collect();
    evs.push(ModelEvent::TurnComplete(FinishReason::Tool));
    evs
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn req() -> ChatRequest {
        ChatRequest {
            system_prompt: "sys".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let b = ScriptedBackend::always_text("hello world");
        let mut stream = b
            .stream_chat(req(), CancellationToken::new())
            .await
            .unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert_eq!(ev, ModelEvent::TextDelta("hello world".into()));
    }

    #[tokio::test]
    async fn scripted_records_requests() {
        let b = ScriptedBackend::always_text("x");
        let _ = b.stream_chat(req(), CancellationToken::new()).await;
        assert_eq!(b.call_count(), 1);
        assert_eq!(b.last_request().unwrap().system_prompt, "sys");
    }

    #[tokio::test]
    async fn scripted_fallback_when_exhausted() {
        let b = ScriptedBackend::new(vec![]);
        let mut stream = b
            .stream_chat(req(), CancellationToken::new())
            .await
            .unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ModelEvent::TextDelta(t) if t.contains("no more scripts")));
    }

    #[tokio::test]
    async fn cancelled_token_ends_stream_early() {
        let b = ScriptedBackend::always_text("never seen");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = b.stream_chat(req(), cancel).await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failing_backend_surfaces_typed_error() {
        let b = FailingBackend { error_status: 429 };
        let err = match b.stream_chat(req(), CancellationToken::new()).await {
            Ok(_) => panic!("expected stream_chat to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ModelError::Quota(_)));
    }
}
