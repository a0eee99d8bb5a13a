// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use kestrel_store::UsageMetadata;

/// Per-request token deltas, derived from the model's cumulative counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestUsage {
    pub prompt_tokens: u64,
    pub candidate_tokens: u64,
    pub cached_tokens: u64,
    pub thought_tokens: u64,
    pub tool_use_tokens: u64,
    /// Sum of the component deltas above.
    pub total_tokens: u64,
}

impl RequestUsage {
    fn add(&mut self, other: &RequestUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.candidate_tokens += other.candidate_tokens;
        self.cached_tokens += other.cached_tokens;
        self.thought_tokens += other.thought_tokens;
        self.tool_use_tokens += other.tool_use_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct SessionUsageSummary {
    pub session_id: String,
    pub totals: RequestUsage,
    pub request_count: u64,
    pub average_tokens_per_request: u64,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalUsageSummary {
    pub totals: RequestUsage,
    pub request_count: u64,
    pub session_count: usize,
}

struct SessionEntry {
    previous: UsageMetadata,
    totals: RequestUsage,
    request_count: u64,
    started_at: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

/// Tracks token usage per session and globally.
///
/// Models report *cumulative* counts; the per-request delta is
/// `current − previous` per component, clamped on resets: when a reported
/// count drops below the previous one, the delta is the reported value
/// itself, never negative.
pub struct TokenTracker {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record one usage report and return the derived request delta.
    pub fn record(&self, session_id: &str, reported: &UsageMetadata) -> RequestUsage {
        let mut sessions = self.sessions.lock().expect("tracker lock poisoned");
        let now = Utc::now();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                previous: UsageMetadata::default(),
                totals: RequestUsage::default(),
                request_count: 0,
                started_at: now,
                last_update: now,
            });

        let mut usage = RequestUsage {
            prompt_tokens: delta(reported.prompt_tokens, entry.previous.prompt_tokens),
            candidate_tokens: delta(reported.candidate_tokens, entry.previous.candidate_tokens),
            cached_tokens: delta(reported.cached_tokens, entry.previous.cached_tokens),
            thought_tokens: delta(reported.thought_tokens, entry.previous.thought_tokens),
            tool_use_tokens: delta(reported.tool_use_tokens, entry.previous.tool_use_tokens),
            total_tokens: 0,
        };
        usage.total_tokens = usage.prompt_tokens
            + usage.candidate_tokens
            + usage.cached_tokens
            + usage.thought_tokens
            + usage.tool_use_tokens;

        entry.previous = *reported;
        entry.totals.add(&usage);
        entry.request_count += 1;
        entry.last_update = now;
        usage
    }

    pub fn session_summary(&self, session_id: &str) -> Option<SessionUsageSummary> {
        let sessions = self.sessions.lock().expect("tracker lock poisoned");
        sessions.get(session_id).map(|e| SessionUsageSummary {
            session_id: session_id.to_string(),
            totals: e.totals,
            request_count: e.request_count,
            average_tokens_per_request: if e.request_count == 0 {
                0
            } else {
                e.totals.total_tokens / e.request_count
            },
            started_at: e.started_at,
            last_update: e.last_update,
        })
    }

    pub fn global_summary(&self) -> GlobalUsageSummary {
        let sessions = self.sessions.lock().expect("tracker lock poisoned");
        let mut summary = GlobalUsageSummary {
            session_count: sessions.len(),
            ..Default::default()
        };
        for e in sessions.values() {
            summary.totals.add(&e.totals);
            summary.request_count += e.request_count;
        }
        summary
    }
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative→delta with reset clamping: a drop in the reported count
/// contributes the reported value, not a negative number.
fn delta(current: u64, previous: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
