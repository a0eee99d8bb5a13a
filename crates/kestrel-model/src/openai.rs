// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI driver — chat completions API with SSE streaming.
//!
//! Tool-call argument fragments arrive interleaved by index across
//! deltas; this driver coalesces them internally and emits each
//! [`ModelEvent::FunctionCall`] complete, when the provider signals
//! `finish_reason: "tool_calls"`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_store::{Event, Part, UsageMetadata};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{ModelBackend, ModelEventStream};
use crate::sse::{sse_data, LineBuffer};
use crate::{ChatRequest, FinishReason, ModelError, ModelEvent};

pub struct OpenAiBackend {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiBackend {
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
impl ModelBackend for OpenAiBackend {
    fn backend_id(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ModelEventStream, ModelError> {
        let body = build_request_body(&self.model, &req);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        debug!(model = %self.model, "sending OpenAI request");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, text));
        }

        let stream = resp
            .bytes_stream()
            .scan(
                (LineBuffer::default(), StreamState::default()),
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

        Ok(Box::pin(stream.take_until(cancel.cancelled_owned())))
    }
}

fn build_request_body(model: &str, req: &ChatRequest) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if !req.system_prompt.is_empty() {
        messages.push(json!({ "role": "system", "content": req.system_prompt }));
    }
    for event in &req.history {
        messages.extend(event_to_messages(event));
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    if let Some(t) = req.generation.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.generation.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(m) = req.generation.max_output_tokens {
        body["max_tokens"] = json!(m);
    }
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

/// Map one stored event onto the OpenAI message list.
///
/// A model event mixing text and function calls becomes a single
/// assistant message carrying both; a tool-response event becomes one
/// `tool` message per `function_response` part.
fn event_to_messages(event: &Event) -> Vec<Value> {
    let mut out = Vec::new();

    let text = event.text();
    let tool_calls: Vec<Value> = event
        .content
        .iter()
        .filter_map(|p| match p {
            Part::FunctionCall { id, name, args } => Some(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": args.to_string() },
            })),
            _ => None,
        })
        .collect();
    let responses: Vec<(&str, &Value)> = event
        .content
        .iter()
        .filter_map(|p| match p {
            Part::FunctionResponse { id, response, .. } => Some((id.as_str(), response)),
            _ => None,
        })
        .collect();

    if event.author == "model" {
        if !text.is_empty() || !tool_calls.is_empty() {
            let mut msg = json!({ "role": "assistant" });
            msg["content"] = if text.is_empty() {
                Value::Null
            } else {
                json!(text)
            };
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(tool_calls);
            }
            out.push(msg);
        }
    } else if !responses.is_empty() {
        for (id, response) in responses {
            let content = match response {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(json!({ "role": "tool", "tool_call_id": id, "content": content }));
        }
    } else if !text.is_empty() {
        out.push(json!({ "role": "user", "content": text }));
    }

    out
}

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingCall {
    fn finish(self) -> ModelEvent {
        // Always resolve to a JSON object; providers reject null tool input.
        let args = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.args_buf).unwrap_or_else(|e| {
                warn!(
                    tool_name = %self.name,
                    error = %e,
                    "model sent tool call with invalid JSON arguments; substituting {{}}"
                );
                Value::Object(Default::default())
            })
        };
        ModelEvent::FunctionCall {
            id: self.id,
            name: self.name,
            args,
        }
    }
}

#[derive(Default)]
struct StreamState {
    pending: BTreeMap<u64, PendingCall>,
}

fn parse_chunk(v: &Value, st: &mut StreamState) -> Vec<ModelEvent> {
    let mut events = Vec::new();

    // The usage chunk arrives after finish_reason, with an empty choices
    // array, when stream_options.include_usage is set.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        events.push(ModelEvent::UsageUpdate(UsageMetadata {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            candidate_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cached_tokens: usage["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0),
            thought_tokens: usage["completion_tokens_details"]["reasoning_tokens"]
                .as_u64()
                .unwrap_or(0),
            tool_use_tokens: 0,
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
        }));
    }

    let choice = &v["choices"][0];
    let delta = &choice["delta"];

    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            events.push(ModelEvent::TextDelta(text.to_string()));
        }
    }
    if let Some(text) = delta["reasoning_content"].as_str() {
        if !text.is_empty() {
            events.push(ModelEvent::ThoughtDelta(text.to_string()));
        }
    }
    if let Some(calls) = delta["tool_calls"].as_array() {
        for call in calls {
            let index = call["index"].as_u64().unwrap_or(0);
            let pending = st.pending.entry(index).or_default();
            if let Some(id) = call["id"].as_str() {
                if !id.is_empty() {
                    pending.id = id.to_string();
                }
            }
            if let Some(name) = call["function"]["name"].as_str() {
                if !name.is_empty() {
                    pending.name = name.to_string();
                }
            }
            if let Some(args) = call["function"]["arguments"].as_str() {
                pending.args_buf.push_str(args);
            }
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        if reason == "tool_calls" {
            // Flush coalesced calls, ordered by provider index.
            let pending = std::mem::take(&mut st.pending);
            for (i, (_, mut call)) in pending.into_iter().enumerate() {
                if call.name.is_empty() {
                    warn!("dropping tool call with empty name from model");
                    continue;
                }
                if call.id.is_empty() {
                    call.id = format!("call_{i}");
                }
                events.push(call.finish());
            }
        }
        let finish = match reason {
            "tool_calls" => FinishReason::Tool,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::Safety,
            _ => FinishReason::Stop,
        };
        events.push(ModelEvent::TurnComplete(finish));
    }

    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
