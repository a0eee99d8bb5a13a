// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `streamGenerateContent` endpoint with SSE framing.  Supports
//! text, tool calls, usage metadata, and thinking deltas via `thought`
//! parts.
//!
//! # Auth
//! API key via the `x-goog-api-key` header.
//!
//! # Endpoint pattern
//! `POST {base}/v1beta/models/{model}:streamGenerateContent?alt=sse`

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_store::{Event, Part, UsageMetadata};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ModelBackend, ModelEventStream};
use crate::sse::{sse_data, LineBuffer};
use crate::{ChatRequest, FinishReason, ModelError, ModelEvent};

pub struct GeminiBackend {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(model: String, api_key: String, base_url: String) -> Self {
        Self {
            model,
            api_key,
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    fn backend_id(&self) -> &str {
        "gemini"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ModelEventStream, ModelError> {
        let body = build_request_body(&req);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model,
        );

        debug!(model = %self.model, "sending Gemini request");
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, text));
        }

        Ok(gemini_event_stream(resp, cancel))
    }
}

/// Per-stream parse state shared by the gemini and vertexai drivers.
#[derive(Default)]
pub(crate) struct ChunkState {
    saw_function_call: bool,
}

/// Wrap an open SSE response into a [`ModelEventStream`].
pub(crate) fn gemini_event_stream(
    resp: reqwest::Response,
    cancel: CancellationToken,
) -> ModelEventStream {
    let stream = resp
        .bytes_stream()
        .scan(
            (LineBuffer::default(), ChunkState::default()),
            |(buf, st), chunk| {
                let out: Vec<Result<ModelEvent, ModelError>> = match chunk {
                    Ok(bytes) => buf
                        .push(&bytes)
                        .iter()
                        .filter_map(|line| sse_data(line))
                        .filter(|data| *data != "[DONE]")
                        .flat_map(|data| match serde_json::from_str::<Value>(data) {
                            Ok(v) => parse_chunk(&v, st).into_iter().map(Ok).collect(),
                            Err(e) => {
                                debug!(error = %e, "skipping unparseable SSE line");
                                Vec::new()
                            }
                        })
                        .collect(),
                    Err(e) => vec![Err(ModelError::Transport(e))],
                };
                futures::future::ready(Some(out))
            },
        )
        .flat_map(futures::stream::iter);

    Box::pin(stream.take_until(cancel.cancelled_owned()))
}

/// Serialize a [`ChatRequest`] into the Gemini request body.
pub(crate) fn build_request_body(req: &ChatRequest) -> Value {
    let contents: Vec<Value> = req
        .history
        .iter()
        .filter_map(event_to_content)
        .collect();

    let mut generation = json!({});
    if let Some(t) = req.generation.temperature {
        generation["temperature"] = json!(t);
    }
    if let Some(p) = req.generation.top_p {
        generation["topP"] = json!(p);
    }
    if let Some(m) = req.generation.max_output_tokens {
        generation["maxOutputTokens"] = json!(m);
    }
    if req.generation.thinking_enabled {
        let mut thinking = json!({ "includeThoughts": true });
        if let Some(budget) = req.generation.thinking_budget_tokens {
            thinking["thinkingBudget"] = json!(budget);
        }
        generation["thinkingConfig"] = thinking;
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation,
    });
    if !req.system_prompt.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": req.system_prompt }] });
    }
    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    body
}

/// Convert one stored event into a Gemini `content` entry.  Thought parts
/// are never sent back; events with nothing sendable are skipped.
fn event_to_content(event: &Event) -> Option<Value> {
    let role = if event.author == "model" { "model" } else { "user" };
    let parts: Vec<Value> = event
        .content
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(json!({ "text": text })),
            Part::FunctionCall { name, args, .. } => Some(json!({
                "functionCall": { "name": name, "args": args }
            })),
            Part::FunctionResponse { name, response, .. } => {
                // Gemini matches responses to calls by function name and
                // expects an object payload.
                let payload = if response.is_object() {
                    response.clone()
                } else {
                    json!({ "output": response })
                };
                Some(json!({
                    "functionResponse": { "name": name, "response": payload }
                }))
            }
            Part::Thought { .. } => None,
            Part::InlineData { mime_type, data } => Some(json!({
                "inline_data": { "mime_type": mime_type, "data": data }
            })),
        })
        .collect();

    if parts.is_empty() {
        return None;
    }
    Some(json!({ "role": role, "parts": parts }))
}

/// Translate one parsed SSE chunk into model events.
pub(crate) fn parse_chunk(v: &Value, st: &mut ChunkState) -> Vec<ModelEvent> {
    let mut events = Vec::new();

    if let Some(meta) = v.get("usageMetadata") {
        events.push(ModelEvent::UsageUpdate(UsageMetadata {
            prompt_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
            candidate_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
            cached_tokens: meta["cachedContentTokenCount"].as_u64().unwrap_or(0),
            thought_tokens: meta["thoughtsTokenCount"].as_u64().unwrap_or(0),
            tool_use_tokens: meta["toolUsePromptTokenCount"].as_u64().unwrap_or(0),
            total_tokens: meta["totalTokenCount"].as_u64().unwrap_or(0),
        }));
    }

    let candidate = &v["candidates"][0];
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                if let Some(text) = part["text"].as_str() {
                    events.push(ModelEvent::ThoughtDelta(text.to_string()));
                }
                continue;
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc["name"].as_str().unwrap_or("").to_string();
                st.saw_function_call = true;
                events.push(ModelEvent::FunctionCall {
                    // Gemini has no opaque call ids; it matches responses
                    // to calls by function name.
                    id: name.clone(),
                    name,
                    args: fc["args"].clone(),
                });
                continue;
            }
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(ModelEvent::TextDelta(text.to_string()));
                }
            }
        }
    }

    if let Some(reason) = candidate["finishReason"].as_str() {
        let finish = match reason {
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" => FinishReason::Safety,
            _ if st.saw_function_call => FinishReason::Tool,
            _ => FinishReason::Stop,
        };
        events.push(ModelEvent::TurnComplete(finish));
    }

    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDeclaration;

    #[test]
    fn backend_id_and_model() {
        let b = GeminiBackend::new("gemini-2.5-flash".into(), "k".into(), "http://x".into());
        assert_eq!(b.backend_id(), "gemini");
        assert_eq!(b.model_name(), "gemini-2.5-flash");
    }

    #[test]
    fn usage_chunk_parsed() {
        let v = json!({
            "usageMetadata": {
                "promptTokenCount": 100,
                "candidatesTokenCount": 50,
                "totalTokenCount": 150,
            }
        });
        let mut st = ChunkState::default();
        let evs = parse_chunk(&v, &mut st);
        assert!(matches!(
            evs[0],
            ModelEvent::UsageUpdate(u) if u.prompt_tokens == 100 && u.total_tokens == 150
        ));
    }

    #[test]
    fn text_delta_parsed() {
        let v = json!({ "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }] });
        let evs = parse_chunk(&v, &mut ChunkState::default());
        assert_eq!(evs, vec![ModelEvent::TextDelta("hello".into())]);
    }

    #[test]
    fn thought_delta_parsed() {
        let v = json!({
            "candidates": [{ "content": { "parts": [{ "text": "hmm", "thought": true }] } }]
        });
        let evs = parse_chunk(&v, &mut ChunkState::default());
        assert_eq!(evs, vec![ModelEvent::ThoughtDelta("hmm".into())]);
    }

    #[test]
    fn function_call_parsed_and_finish_maps_to_tool() {
        let mut st = ChunkState::default();
        let v = json!({
            "candidates": [{
                "content": { "parts": [{ "functionCall": { "name": "grep", "args": { "q": "x" } } }] },
                "finishReason": "STOP"
            }]
        });
        let evs = parse_chunk(&v, &mut st);
        assert!(matches!(&evs[0], ModelEvent::FunctionCall { name, .. } if name == "grep"));
        assert_eq!(evs[1], ModelEvent::TurnComplete(FinishReason::Tool));
    }

    #[test]
    fn finish_without_calls_maps_to_stop() {
        let v = json!({ "candidates": [{ "content": {}, "finishReason": "STOP" }] });
        let evs = parse_chunk(&v, &mut ChunkState::default());
        assert_eq!(evs, vec![ModelEvent::TurnComplete(FinishReason::Stop)]);
    }

    #[test]
    fn max_tokens_maps_to_length() {
        let v = json!({ "candidates": [{ "finishReason": "MAX_TOKENS" }] });
        let evs = parse_chunk(&v, &mut ChunkState::default());
        assert_eq!(evs, vec![ModelEvent::TurnComplete(FinishReason::Length)]);
    }

    // ── Request building ──────────────────────────────────────────────────────

    #[test]
    fn request_carries_system_instruction_and_tools() {
        let req = ChatRequest {
            system_prompt: "be terse".into(),
            history: vec![Event::user_message("inv", "hi")],
            tools: vec![ToolDeclaration {
                name: "grep".into(),
                description: "search".into(),
                parameters: json!({ "type": "object" }),
            }],
            ..Default::default()
        };
        let body = build_request_body(&req);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "grep");
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[test]
    fn thought_parts_are_not_sent_back() {
        let mut e = Event::new("inv", "model");
        e.content.push(Part::thought("internal"));
        e.content.push(Part::text("visible"));
        let content = event_to_content(&e).unwrap();
        let parts = content["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "visible");
    }

    #[test]
    fn thought_only_event_is_skipped() {
        let mut e = Event::new("inv", "model");
        e.content.push(Part::thought("internal"));
        assert!(event_to_content(&e).is_none());
    }

    #[test]
    fn function_response_wraps_non_object_payload() {
        let mut e = Event::new("inv", "user");
        e.content
            .push(Part::function_response("t1", "grep", json!("two matches")));
        let content = event_to_content(&e).unwrap();
        assert_eq!(
            content["parts"][0]["functionResponse"]["response"]["output"],
            "two matches"
        );
    }

    #[test]
    fn model_events_use_model_role() {
        let mut e = Event::new("inv", "model");
        e.content.push(Part::text("reply"));
        assert_eq!(event_to_content(&e).unwrap()["role"], "model");
        // Tool responses are user-authored and ride the user role.
        let mut t = Event::new("inv", "user");
        t.content
            .push(Part::function_response("t1", "grep", json!({"out": 1})));
        assert_eq!(event_to_content(&t).unwrap()["role"], "user");
    }

    #[test]
    fn thinking_config_included_when_enabled() {
        let req = ChatRequest {
            generation: crate::GenerationConfig {
                thinking_enabled: true,
                thinking_budget_tokens: Some(2048),
                ..Default::default()
            },
            ..Default::default()
        };
        let body = build_request_body(&req);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            2048
        );
    }
}
