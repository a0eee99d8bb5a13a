// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ollama driver — native `/api/chat` endpoint with NDJSON streaming.
//!
//! Ollama delivers tool calls complete in a single message (no piecewise
//! argument fragments) and reports token counts on the final `done`
//! record.

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_store::{Event, Part, UsageMetadata};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ModelBackend, ModelEventStream};
use crate::sse::LineBuffer;
use crate::{ChatRequest, FinishReason, ModelError, ModelEvent};

pub struct OllamaBackend {
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(model: String, base_url: String) -> Self {
        Self {
            model,
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn backend_id(&self) -> &str {
        "ollama"
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
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));

        debug!(model = %self.model, "sending Ollama request");
        let resp = self.client.post(&url).json(&body).send().await?;

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
                            .filter(|line| !line.is_empty())
                            .flat_map(|line| match serde_json::from_str::<Value>(line) {
                                Ok(v) => parse_record(&v, st).into_iter().map(Ok).collect(),
                                Err(e) => {
                                    debug!(error = %e, "skipping unparseable NDJSON line");
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

    let mut options = json!({});
    if let Some(t) = req.generation.temperature {
        options["temperature"] = json!(t);
    }
    if let Some(p) = req.generation.top_p {
        options["top_p"] = json!(p);
    }
    if let Some(m) = req.generation.max_output_tokens {
        options["num_predict"] = json!(m);
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "options": options,
    });
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

fn event_to_messages(event: &Event) -> Vec<Value> {
    let mut out = Vec::new();
    let text = event.text();

    let tool_calls: Vec<Value> = event
        .content
        .iter()
        .filter_map(|p| match p {
            Part::FunctionCall { name, args, .. } => Some(json!({
                "function": { "name": name, "arguments": args }
            })),
            _ => None,
        })
        .collect();
    let responses: Vec<&Value> = event
        .content
        .iter()
        .filter_map(|p| match p {
            Part::FunctionResponse { response, .. } => Some(response),
            _ => None,
        })
        .collect();

    if event.author == "model" {
        if !text.is_empty() || !tool_calls.is_empty() {
            let mut msg = json!({ "role": "assistant", "content": text });
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(tool_calls);
            }
            out.push(msg);
        }
    } else if !responses.is_empty() {
        for response in responses {
            let content = match response {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(json!({ "role": "tool", "content": content }));
        }
    } else if !text.is_empty() {
        out.push(json!({ "role": "user", "content": text }));
    }
    out
}

#[derive(Default)]
struct StreamState {
    saw_function_call: bool,
    call_seq: u32,
}

fn parse_record(v: &Value, st: &mut StreamState) -> Vec<ModelEvent> {
    let mut events = Vec::new();
    let message = &v["message"];

    if let Some(text) = message["thinking"].as_str() {
        if !text.is_empty() {
            events.push(ModelEvent::ThoughtDelta(text.to_string()));
        }
    }
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            events.push(ModelEvent::TextDelta(text.to_string()));
        }
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let name = call["function"]["name"].as_str().unwrap_or("").to_string();
            if name.is_empty() {
                continue;
            }
            st.saw_function_call = true;
            let id = format!("call_{}", st.call_seq);
            st.call_seq += 1;
            events.push(ModelEvent::FunctionCall {
                id,
                name,
                args: call["function"]["arguments"].clone(),
            });
        }
    }

    if v["done"].as_bool() == Some(true) {
        let prompt = v["prompt_eval_count"].as_u64().unwrap_or(0);
        let completion = v["eval_count"].as_u64().unwrap_or(0);
        events.push(ModelEvent::UsageUpdate(UsageMetadata {
            prompt_tokens: prompt,
            candidate_tokens: completion,
            total_tokens: prompt + completion,
            ..Default::default()
        }));
        let finish = match v["done_reason"].as_str() {
            Some("length") => FinishReason::Length,
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

    #[test]
    fn content_record_is_text_delta() {
        let v = json!({ "message": { "role": "assistant", "content": "hey" }, "done": false });
        let evs = parse_record(&v, &mut StreamState::default());
        assert_eq!(evs, vec![ModelEvent::TextDelta("hey".into())]);
    }

    #[test]
    fn done_record_emits_usage_then_turn_complete() {
        let v = json!({
            "message": { "role": "assistant", "content": "" },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 12,
            "eval_count": 8,
        });
        let evs = parse_record(&v, &mut StreamState::default());
        assert!(matches!(
            evs[0],
            ModelEvent::UsageUpdate(u) if u.prompt_tokens == 12 && u.total_tokens == 20
        ));
        assert_eq!(evs[1], ModelEvent::TurnComplete(FinishReason::Stop));
    }

    #[test]
    fn tool_calls_arrive_complete_with_synthetic_ids() {
        let mut st = StreamState::default();
        let v = json!({
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    { "function": { "name": "list_dir", "arguments": { "path": "." } } },
                    { "function": { "name": "grep", "arguments": { "pattern": "x" } } }
                ]
            },
            "done": false
        });
        let evs = parse_record(&v, &mut st);
        assert_eq!(evs.len(), 2);
        match (&evs[0], &evs[1]) {
            (
                ModelEvent::FunctionCall { id: a, .. },
                ModelEvent::FunctionCall { id: b, name, .. },
            ) => {
                assert_eq!(a, "call_0");
                assert_eq!(b, "call_1");
                assert_eq!(name, "grep");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn done_after_tool_calls_maps_to_tool_finish() {
        let mut st = StreamState::default();
        parse_record(
            &json!({
                "message": { "tool_calls": [{ "function": { "name": "t", "arguments": {} } }] },
                "done": false
            }),
            &mut st,
        );
        let evs = parse_record(&json!({ "done": true, "done_reason": "stop" }), &mut st);
        assert_eq!(evs[1], ModelEvent::TurnComplete(FinishReason::Tool));
    }

    #[test]
    fn request_body_uses_native_options() {
        let req = ChatRequest {
            system_prompt: "sys".into(),
            generation: crate::GenerationConfig {
                temperature: Some(0.1),
                max_output_tokens: Some(256),
                ..Default::default()
            },
            ..Default::default()
        };
        let body = build_request_body("llama3.2", &req);
        assert_eq!(body["options"]["temperature"], 0.1);
        assert_eq!(body["options"]["num_predict"], 256);
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[test]
    fn tool_call_arguments_stay_structured() {
        let mut e = Event::new("inv", "model");
        e.content
            .push(Part::function_call("t1", "grep", json!({"pattern": "x"})));
        let msgs = event_to_messages(&e);
        // Ollama takes the argument object directly, not a JSON string.
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["arguments"]["pattern"], "x");
    }
}
