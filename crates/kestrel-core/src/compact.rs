// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use futures::StreamExt;
use kestrel_config::CompactionConfig;
use kestrel_model::{ChatRequest, ModelBackend, ModelEvent};
use kestrel_store::{CompactionInfo, Event, Part, Session, SessionStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::AgentEvent;

const SUMMARIZE_PROMPT: &str = "\
You are a context compaction assistant for a coding agent. Summarise the \
conversation history you are given into one information-dense paragraph \
sequence. Preserve: the user's goals, every decision made and why, all file \
paths touched, commands run and their outcomes, and open questions. Keep \
technical identifiers verbatim. The summary replaces the original history, \
so include everything a continuation would need.";

/// Longest serialized form of a single part fed into the summarization
/// prompt; longer parts are cut with a notice.
const MAX_PART_CHARS: usize = 2_000;

/// Compute the model-visible window of a session's event log: every
/// compaction event in order, followed by the plain events no compaction
/// covers.  The raw prefix stays on disk untouched.
pub fn effective_window(events: &[Event]) -> Vec<Event> {
    let covered: usize = events
        .iter()
        .filter_map(|e| e.compaction_info())
        .map(|i| i.compacted_event_count)
        .sum();

    let mut window: Vec<Event> = events.iter().filter(|e| e.is_compaction()).cloned().collect();
    let mut plain_index = 0usize;
    for event in events {
        if event.is_compaction() {
            continue;
        }
        if plain_index >= covered {
            window.push(event.clone());
        }
        plain_index += 1;
    }
    window
}

/// Distinct invocation ids of plain events in `window`, in order of first
/// appearance.
fn invocation_ids(window: &[Event]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for event in window.iter().filter(|e| !e.is_compaction()) {
        if ids.last().map(String::as_str) != Some(event.invocation_id.as_str())
            && !ids.contains(&event.invocation_id)
        {
            ids.push(event.invocation_id.clone());
        }
    }
    ids
}

/// Background policy that keeps the effective window bounded.
///
/// After each committed invocation the controller re-measures the window;
/// when either threshold is crossed it summarises the prefix (everything
/// before the last `overlap_window` invocations) through the model and
/// appends one compaction event.  Summarization failure leaves the log
/// unchanged.  Runs single-flight per session.
pub struct Compactor {
    backend: Arc<dyn ModelBackend>,
    config: CompactionConfig,
    in_flight: tokio::sync::Mutex<()>,
}

impl Compactor {
    pub fn new(backend: Arc<dyn ModelBackend>, config: CompactionConfig) -> Self {
        Self {
            backend,
            config,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Inspect the session and compact if a threshold is crossed.  All
    /// failures are logged and swallowed; compaction never fails the
    /// containing turn.
    pub async fn maybe_compact(
        &self,
        store: &SessionStore,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        if !self.config.enabled {
            return;
        }
        // Single-flight: a concurrent trigger returns immediately.
        let Ok(_guard) = self.in_flight.try_lock() else {
            return;
        };

        let window = effective_window(&session.events);
        let invocations = invocation_ids(&window);
        let window_tokens: u64 = window.iter().map(Event::approx_tokens).sum();
        let token_trigger =
            (self.config.token_threshold as f64 * self.config.safety_ratio) as u64;

        let crossed = invocations.len() > self.config.invocation_threshold
            || window_tokens > token_trigger;
        if !crossed {
            return;
        }

        // The prefix: everything strictly before the last overlap_window
        // invocations.  Only plain events get summarised; previous
        // compaction events stay in the window on their own.
        let keep = self.config.overlap_window.min(invocations.len());
        let tail_ids: Vec<&String> = invocations[invocations.len() - keep..].iter().collect();
        let prefix: Vec<&Event> = window
            .iter()
            .filter(|e| !e.is_compaction())
            .take_while(|e| !tail_ids.contains(&&e.invocation_id))
            .collect();
        if prefix.is_empty() {
            return;
        }

        let serialized = serialize_events(&prefix);
        let original_tokens: u64 = prefix.iter().map(|e| e.approx_tokens()).sum();
        debug!(
            events = prefix.len(),
            original_tokens, "running history compaction"
        );

        let summary = match self.summarize(serialized).await {
            Ok(s) if !s.trim().is_empty() => s,
            Ok(_) => {
                warn!("compaction summary came back empty; leaving history unchanged");
                return;
            }
            Err(e) => {
                warn!(error = %e, "compaction model call failed; leaving history unchanged");
                return;
            }
        };

        let compacted_tokens = (summary.len() / 4).max(1) as u64;
        let info = CompactionInfo {
            compacted_event_count: prefix.len(),
            original_tokens,
            compacted_tokens,
            compression_ratio: compacted_tokens as f64 / original_tokens.max(1) as f64,
            start_ts: prefix[0].timestamp,
            end_ts: prefix[prefix.len() - 1].timestamp,
        };
        let event = Event::compaction(summary, &info);
        if let Err(e) = store.append_event(session, &event) {
            warn!(error = %e, "failed to persist compaction event");
            return;
        }

        let _ = tx
            .send(AgentEvent::ContextCompacted {
                events_summarized: info.compacted_event_count,
                original_tokens: info.original_tokens,
                compacted_tokens: info.compacted_tokens,
            })
            .await;
    }

    /// One tool-free model call producing the summary text.
    async fn summarize(&self, history_text: String) -> anyhow::Result<String> {
        let req = ChatRequest {
            system_prompt: SUMMARIZE_PROMPT.to_string(),
            history: vec![Event::user_message(
                Uuid::new_v4().to_string(),
                history_text,
            )],
            tools: Vec::new(),
            generation: Default::default(),
        };
        let mut stream = self
            .backend
            .stream_chat(req, CancellationToken::new())
            .await?;
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            if let ModelEvent::TextDelta(delta) = item? {
                text.push_str(&delta);
            }
        }
        Ok(text)
    }
}

/// Serialise events into plain text for the summarization prompt.  Tool
/// calls and responses become short descriptors; oversized parts are cut.
fn serialize_events(events: &[&Event]) -> String {
    events
        .iter()
        .map(|e| {
            let body = e
                .content
                .iter()
                .map(|p| match p {
                    Part::Text { text } => clip(text),
                    Part::Thought { .. } => "[thinking]".to_string(),
                    Part::FunctionCall { name, args, .. } => {
                        format!("[tool_call: {name}({})]", clip(&args.to_string()))
                    }
                    Part::FunctionResponse { name, response, .. } => {
                        format!("[tool_result: {name} -> {}]", clip(&response.to_string()))
                    }
                    Part::InlineData { mime_type, .. } => format!("[inline data: {mime_type}]"),
                })
                .collect::<Vec<_>>()
                .join(" ");
            format!("{}: {}", e.author, body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn clip(s: &str) -> String {
    if s.len() <= MAX_PART_CHARS {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .take_while(|(i, _)| *i < MAX_PART_CHARS)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(MAX_PART_CHARS);
    format!("{}… [{} chars cut]", &s[..cut], s.len() - cut)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn plain(invocation: &str, text: &str) -> Event {
        Event::user_message(invocation, text)
    }

    fn compaction_covering(n: usize) -> Event {
        let info = CompactionInfo {
            compacted_event_count: n,
            original_tokens: 100,
            compacted_tokens: 10,
            compression_ratio: 0.1,
            start_ts: chrono::Utc::now(),
            end_ts: chrono::Utc::now(),
        };
        Event::compaction("earlier history summary", &info)
    }

    // ── effective_window ──────────────────────────────────────────────────────

    #[test]
    fn window_without_compactions_is_the_full_log() {
        let events = vec![plain("a", "1"), plain("a", "2"), plain("b", "3")];
        let window = effective_window(&events);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn window_replaces_covered_prefix_with_summary() {
        // e1 e2 e3 e4 C(covers 2) → window = [C, e3, e4]
        let mut events = vec![
            plain("a", "one"),
            plain("a", "two"),
            plain("b", "three"),
            plain("b", "four"),
        ];
        events.push(compaction_covering(2));
        let window = effective_window(&events);
        assert_eq!(window.len(), 3);
        assert!(window[0].is_compaction());
        assert_eq!(window[1].text(), "three");
        assert_eq!(window[2].text(), "four");
    }

    #[test]
    fn window_sums_coverage_across_multiple_compactions() {
        let mut events = vec![plain("a", "1"), plain("b", "2")];
        events.push(compaction_covering(2));
        events.extend([plain("c", "3"), plain("d", "4")]);
        events.push(compaction_covering(2));
        events.push(plain("e", "5"));
        let window = effective_window(&events);
        // Both compaction events, then only the uncovered tail.
        assert_eq!(window.len(), 3);
        assert!(window[0].is_compaction() && window[1].is_compaction());
        assert_eq!(window[2].text(), "5");
    }

    #[test]
    fn audit_trail_full_history_remains_in_the_log() {
        // P6: covered events ∪ uncovered tail = the full on-disk history.
        let mut events = vec![plain("a", "1"), plain("b", "2"), plain("c", "3")];
        events.push(compaction_covering(2));
        let covered: usize = events
            .iter()
            .filter_map(|e| e.compaction_info())
            .map(|i| i.compacted_event_count)
            .sum();
        let plain_total = events.iter().filter(|e| !e.is_compaction()).count();
        let window_plain = effective_window(&events)
            .iter()
            .filter(|e| !e.is_compaction())
            .count();
        assert_eq!(covered + window_plain, plain_total);
    }

    // ── invocation_ids ────────────────────────────────────────────────────────

    #[test]
    fn invocation_ids_are_deduplicated_in_order() {
        let events = vec![
            plain("a", "1"),
            plain("a", "2"),
            plain("b", "3"),
            plain("c", "4"),
        ];
        assert_eq!(invocation_ids(&events), vec!["a", "b", "c"]);
    }

    #[test]
    fn invocation_ids_skip_compaction_events() {
        let events = vec![plain("a", "1"), compaction_covering(1), plain("b", "2")];
        assert_eq!(invocation_ids(&events), vec!["a", "b"]);
    }

    // ── serialization ─────────────────────────────────────────────────────────

    #[test]
    fn serialization_keeps_tool_structure_as_descriptors() {
        let mut e = Event::new("inv", "model");
        e.content
            .push(Part::function_call("t1", "grep", json!({"pattern": "x"})));
        let mut r = Event::new("inv", "user");
        r.content
            .push(Part::function_response("t1", "grep", json!({"count": 2})));
        let text = serialize_events(&[&e, &r]);
        assert!(text.contains("[tool_call: grep("));
        assert!(text.contains("[tool_result: grep ->"));
    }

    #[test]
    fn serialization_clips_oversized_parts() {
        let huge = "x".repeat(50_000);
        let e = plain("inv", &huge);
        let text = serialize_events(&[&e]);
        assert!(text.len() < 5_000);
        assert!(text.contains("chars cut"));
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let s = format!("{}ü", "a".repeat(MAX_PART_CHARS - 1));
        let clipped = clip(&s);
        assert!(clipped.contains("chars cut") || clipped == s);
    }
}
