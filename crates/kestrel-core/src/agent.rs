// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kestrel_config::{AgentConfig, CompactionConfig};
use kestrel_model::{
    ChatRequest, GenerationConfig, ModelBackend, ModelError, ModelEvent, ToolDeclaration,
};
use kestrel_store::{Event, Part, Session, SessionStore, UsageMetadata};
use kestrel_tools::{ToolCall, ToolOutput, ToolRegistry};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compact::{effective_window, Compactor};
use crate::events::AgentEvent;
use crate::prompts::{system_prompt, WorkspaceContext};
use crate::usage::TokenTracker;

/// How many times the initial model request of a round is attempted.
/// Mid-stream failures are terminal regardless.
const MAX_STREAM_ATTEMPTS: u32 = 3;

/// The core agent: drives one invocation at a time through the
/// model ↔ tool state machine, persisting every step to the session
/// store.
///
/// Per turn: the user event is appended first (so an interruption still
/// leaves a faithful log), then the loop streams a model response,
/// dispatches any tool calls (side-effect-free calls in parallel under a
/// bounded worker pool, mutating calls serially in model order), appends
/// the tool-response event, and re-enters the model until it completes a
/// turn without calls, errors out, hits the round cap, or is cancelled.
pub struct Agent {
    store: Arc<SessionStore>,
    backend: Arc<dyn ModelBackend>,
    tools: Arc<ToolRegistry>,
    tracker: Arc<TokenTracker>,
    compactor: Compactor,
    config: AgentConfig,
    generation: GenerationConfig,
    workspace: WorkspaceContext,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SessionStore>,
        backend: Arc<dyn ModelBackend>,
        tools: Arc<ToolRegistry>,
        tracker: Arc<TokenTracker>,
        config: AgentConfig,
        compaction: CompactionConfig,
        generation: GenerationConfig,
        workspace: WorkspaceContext,
    ) -> Self {
        let compactor = Compactor::new(Arc::clone(&backend), compaction);
        Self {
            store,
            backend,
            tools,
            tracker,
            compactor,
            config,
            generation,
            workspace,
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn tracker(&self) -> &Arc<TokenTracker> {
        &self.tracker
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    /// Swap the model backend for subsequent turns.  The compactor
    /// follows so summarization uses the same model.
    pub fn set_backend(&mut self, backend: Arc<dyn ModelBackend>) {
        self.compactor = Compactor::new(Arc::clone(&backend), self.compactor.config().clone());
        self.backend = backend;
    }

    /// The system prompt the next turn will use.
    pub fn current_system_prompt(&self) -> String {
        system_prompt(&self.workspace, &self.tools, self.config.system_prompt.as_deref())
    }

    /// Run one invocation for a plain user message.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        user_text: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.run_turn_as(session, None, None, user_text, tx, cancel)
            .await
    }

    /// Run one invocation under a named agent profile: the model events
    /// are authored with `agent_name` and the profile's system prompt
    /// replaces the built-in identity.
    pub async fn run_turn_as(
        &self,
        session: &mut Session,
        agent_name: Option<&str>,
        prompt_override: Option<&str>,
        user_text: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        // The registry must not change once a turn has run; the prompt
        // rendered from it is part of the conversation record.
        if !self.tools.is_sealed() {
            self.tools.seal();
        }

        let invocation_id = Uuid::new_v4().to_string();
        let model_author = agent_name.unwrap_or("model").to_string();
        let prompt = system_prompt(
            &self.workspace,
            &self.tools,
            prompt_override.or(self.config.system_prompt.as_deref()),
        );
        let declarations: Vec<ToolDeclaration> = self
            .tools
            .schemas()
            .into_iter()
            .map(|s| ToolDeclaration {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        // The user event lands before the first model call so that an
        // interrupted turn still reads correctly from the log.
        self.store
            .append_event(session, &Event::user_message(&invocation_id, user_text))?;

        let mut rounds = 0u32;
        loop {
            if cancel.is_cancelled() {
                return self.finish_interrupted(session, &invocation_id, &tx).await;
            }

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                let msg = format!(
                    "invocation exceeded {} tool rounds",
                    self.config.max_tool_rounds
                );
                self.append_error_event(session, &invocation_id, "max_tool_rounds", &msg)?;
                let _ = tx.send(AgentEvent::Error(msg)).await;
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(());
            }

            let request = ChatRequest {
                system_prompt: prompt.clone(),
                history: effective_window(&session.events),
                tools: declarations.clone(),
                generation: self.generation.clone(),
            };

            let stream = self.open_stream_with_retry(request, &cancel).await;
            let mut stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let code = error_code(&e);
                    let msg = e.to_string();
                    self.append_error_event(session, &invocation_id, code, &msg)?;
                    let _ = tx.send(AgentEvent::Error(msg)).await;
                    return Ok(());
                }
            };

            // Accumulate the streamed response.  Partial chunks exist only
            // here; the store receives the coalesced event.
            let mut text = String::new();
            let mut thought = String::new();
            let mut calls: Vec<ToolCall> = Vec::new();
            let mut usage: Option<UsageMetadata> = None;
            let mut interrupted = false;
            let mut stream_error: Option<ModelError> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        interrupted = true;
                        break;
                    }
                    item = stream.next() => match item {
                        None => break,
                        Some(Ok(ModelEvent::TextDelta(delta))) => {
                            let _ = tx.send(AgentEvent::TextDelta(delta.clone())).await;
                            text.push_str(&delta);
                        }
                        Some(Ok(ModelEvent::ThoughtDelta(delta))) => {
                            let _ = tx.send(AgentEvent::ThoughtDelta(delta.clone())).await;
                            thought.push_str(&delta);
                        }
                        Some(Ok(ModelEvent::FunctionCall { id, name, args })) => {
                            calls.push(ToolCall { id, name, args });
                        }
                        Some(Ok(ModelEvent::UsageUpdate(u))) => {
                            // Cumulative counts: the latest report wins.
                            usage = Some(u);
                        }
                        Some(Ok(ModelEvent::TurnComplete(_))) => {
                            // Keep draining: providers send usage after the
                            // finish marker.
                        }
                        Some(Err(e)) => {
                            stream_error = Some(e);
                            break;
                        }
                    }
                }
            }
            drop(stream);

            if interrupted {
                // The aborted partial response is discarded (never
                // persisted) and its usage is not committed.
                return self.finish_interrupted(session, &invocation_id, &tx).await;
            }
            if let Some(e) = stream_error {
                let code = error_code(&e);
                let msg = format!("model stream failed: {e}");
                self.append_error_event(session, &invocation_id, code, &msg)?;
                let _ = tx.send(AgentEvent::Error(msg)).await;
                return Ok(());
            }

            // Persist the coalesced model event.
            let mut model_event = Event::new(&invocation_id, &model_author);
            if !thought.is_empty() {
                model_event.content.push(Part::thought(thought.clone()));
            }
            if !text.is_empty() {
                model_event.content.push(Part::text(text.clone()));
            }
            for call in &calls {
                model_event.content.push(Part::function_call(
                    &call.id,
                    &call.name,
                    call.args.clone(),
                ));
            }
            model_event.usage_metadata = usage;
            model_event.turn_complete = calls.is_empty();
            self.store.append_event(session, &model_event)?;

            if !thought.is_empty() {
                let _ = tx.send(AgentEvent::ThoughtComplete(thought)).await;
            }
            if !text.is_empty() {
                let _ = tx.send(AgentEvent::TextComplete(text)).await;
            }
            if let Some(u) = &usage {
                let request_usage = self.tracker.record(&session.id, u);
                let _ = tx.send(AgentEvent::TokenUsage(request_usage)).await;
            }

            if calls.is_empty() {
                let _ = tx.send(AgentEvent::TurnComplete).await;
                self.compactor
                    .maybe_compact(&self.store, session, &tx)
                    .await;
                return Ok(());
            }

            debug!(round = rounds, count = calls.len(), "dispatching tool calls");
            let (outputs, dispatch_interrupted) =
                self.dispatch_tools(&calls, &tx, &cancel).await;

            // One function_response part per call, in the model's call
            // order regardless of completion timing.
            let mut response_event = Event::new(&invocation_id, "user");
            for (call, output) in calls.iter().zip(outputs.iter()) {
                response_event.content.push(Part::function_response(
                    &call.id,
                    &call.name,
                    truncate_response(
                        output.response.clone(),
                        self.config.tool_result_char_cap,
                    ),
                ));
            }
            self.store.append_event(session, &response_event)?;

            if dispatch_interrupted {
                return self.finish_interrupted(session, &invocation_id, &tx).await;
            }
        }
    }

    /// Execute tool calls under the dispatch policy: consecutive
    /// side-effect-free calls run concurrently (bounded by the worker
    /// pool), mutating calls run serially in emission order, and a
    /// mutating call never starts before the reads emitted ahead of it
    /// have finished.  Returns outputs in call order plus whether the
    /// dispatch was interrupted.
    async fn dispatch_tools(
        &self,
        calls: &[ToolCall],
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> (Vec<ToolOutput>, bool) {
        let workers = self.config.tool_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut outputs: Vec<Option<ToolOutput>> = calls.iter().map(|_| None).collect();
        let mut interrupted = false;

        let mut i = 0;
        while i < calls.len() {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }

            if self.tools.is_mutating(&calls[i].name) {
                let call = &calls[i];
                let _ = tx.send(AgentEvent::ToolCallStarted(call.clone())).await;
                let output = self.tools.invoke(call, cancel.child_token()).await;
                self.emit_finished(tx, call, &output).await;
                outputs[i] = Some(output);
                i += 1;
                continue;
            }

            // A run of consecutive side-effect-free calls.
            let mut j = i;
            while j < calls.len() && !self.tools.is_mutating(&calls[j].name) {
                j += 1;
            }
            let mut handles = Vec::with_capacity(j - i);
            for call in &calls[i..j] {
                let _ = tx.send(AgentEvent::ToolCallStarted(call.clone())).await;
                let call = call.clone();
                let registry = Arc::clone(&self.tools);
                let permits = Arc::clone(&semaphore);
                let child = cancel.child_token();
                handles.push(tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    registry.invoke(&call, child).await
                }));
            }
            for (offset, handle) in handles.into_iter().enumerate() {
                let call = &calls[i + offset];
                let output = match handle.await {
                    Ok(o) => o,
                    Err(e) => ToolOutput::err(&call.id, format!("tool task panicked: {e}")),
                };
                self.emit_finished(tx, call, &output).await;
                outputs[i + offset] = Some(output);
            }
            i = j;
        }

        // Calls that never started still need a response part so the log
        // pairs every call with a result.
        let outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(k, o)| {
                o.unwrap_or_else(|| ToolOutput::err(&calls[k].id, "interrupted before start"))
            })
            .collect();
        (outputs, interrupted || cancel.is_cancelled())
    }

    async fn emit_finished(
        &self,
        tx: &mpsc::Sender<AgentEvent>,
        call: &ToolCall,
        output: &ToolOutput,
    ) {
        let _ = tx
            .send(AgentEvent::ToolCallFinished {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                output: output.response.to_string(),
                is_error: output.is_error,
            })
            .await;
    }

    /// Open the model stream, retrying retryable failures of the initial
    /// request with jittered exponential backoff.
    async fn open_stream_with_retry(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<kestrel_model::ModelEventStream, ModelError> {
        let mut attempt = 0u32;
        loop {
            match self
                .backend
                .stream_chat(request.clone(), cancel.child_token())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_STREAM_ATTEMPTS => {
                    attempt += 1;
                    let backoff = Duration::from_millis(200 * (1 << attempt)) + jitter();
                    warn!(error = %e, attempt, "model request failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish_interrupted(
        &self,
        session: &mut Session,
        invocation_id: &str,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        self.store
            .append_event(session, &Event::interruption(invocation_id))?;
        let _ = tx.send(AgentEvent::Aborted).await;
        Ok(())
    }

    fn append_error_event(
        &self,
        session: &mut Session,
        invocation_id: &str,
        code: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut event = Event::new(invocation_id, "system");
        event.error_code = Some(code.to_string());
        event.error_message = Some(message.to_string());
        event.turn_complete = true;
        self.store.append_event(session, &event)?;
        Ok(())
    }
}

fn error_code(e: &ModelError) -> &'static str {
    match e {
        ModelError::Quota(_) => "quota_exhausted",
        ModelError::Transport(_) => "transport_error",
        ModelError::MissingApiKey(_) => "missing_api_key",
        _ => "backend_error",
    }
}

fn jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(nanos % 100)
}

/// Head-truncate every oversized string in a tool response so one huge
/// result cannot blow the context budget.  `cap = 0` disables truncation.
fn truncate_response(value: Value, cap: usize) -> Value {
    if cap == 0 {
        return value;
    }
    match value {
        Value::String(s) if s.len() > cap => {
            let cut = s
                .char_indices()
                .take_while(|(i, _)| *i < cap)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(cap);
            let omitted = s.len() - cut;
            Value::String(format!("{}… [{omitted} bytes omitted]", &s[..cut]))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| truncate_response(v, cap))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, truncate_response(v, cap)))
                .collect(),
        ),
        other => other,
    }
}
