// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Event ⇄ row mapping.
//!
//! Scalar attributes map to scalar columns; the structured attributes
//! (`content`, `actions`, metadata blobs, `long_running_tool_ids`) are
//! independent nullable JSON columns.  A NULL blob decodes to the empty
//! value of its field.  Encoding is a pure function of the event.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;
use crate::event::{Event, EventActions, UsageMetadata};
use crate::state::strip_temp;

/// Fixed-width RFC 3339 UTC, so lexicographic order equals time order.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::BadTimestamp(s.to_string()))
}

/// The column values of one `events` row, ready to bind.
pub(crate) struct EventRow {
    pub id: String,
    pub timestamp: String,
    pub invocation_id: String,
    pub author: String,
    pub actions: Option<String>,
    pub long_running_tool_ids_json: Option<String>,
    pub branch: Option<String>,
    pub content: Option<String>,
    pub grounding_metadata: Option<String>,
    pub custom_metadata: Option<String>,
    pub usage_metadata: Option<String>,
    pub citation_metadata: Option<String>,
    pub partial: bool,
    pub turn_complete: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub interrupted: bool,
}

pub(crate) fn encode_event(event: &Event) -> Result<EventRow, StoreError> {
    // The persisted delta keeps scope prefixes but never `temp:` keys.
    let persisted_delta = strip_temp(&event.actions.state_delta);
    let actions = if persisted_delta.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&EventActions {
            state_delta: persisted_delta,
        })?)
    };

    Ok(EventRow {
        id: event.id.clone(),
        timestamp: encode_ts(&event.timestamp),
        invocation_id: event.invocation_id.clone(),
        author: event.author.clone(),
        actions,
        long_running_tool_ids_json: if event.long_running_tool_ids.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.long_running_tool_ids)?)
        },
        branch: event.branch.clone(),
        content: if event.content.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.content)?)
        },
        grounding_metadata: opt_json(&event.grounding_metadata)?,
        custom_metadata: opt_json(&event.custom_metadata)?,
        usage_metadata: event
            .usage_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        citation_metadata: opt_json(&event.citation_metadata)?,
        partial: event.partial,
        turn_complete: event.turn_complete,
        error_code: event.error_code.clone(),
        error_message: event.error_message.clone(),
        interrupted: event.interrupted,
    })
}

fn opt_json(v: &Option<serde_json::Value>) -> Result<Option<String>, StoreError> {
    Ok(v.as_ref().map(serde_json::to_string).transpose()?)
}

/// Decode an `events` row selected with the canonical column list
/// (see `store::EVENT_COLUMNS`).
pub(crate) fn decode_event(row: &rusqlite::Row<'_>) -> Result<Event, StoreError> {
    let ts: String = row.get("timestamp")?;
    let actions: Option<String> = row.get("actions")?;
    let lrt: Option<String> = row.get("long_running_tool_ids_json")?;
    let content: Option<String> = row.get("content")?;
    let grounding: Option<String> = row.get("grounding_metadata")?;
    let custom: Option<String> = row.get("custom_metadata")?;
    let usage: Option<String> = row.get("usage_metadata")?;
    let citation: Option<String> = row.get("citation_metadata")?;

    Ok(Event {
        id: row.get("id")?,
        invocation_id: row.get("invocation_id")?,
        author: row.get("author")?,
        timestamp: decode_ts(&ts)?,
        branch: row.get("branch")?,
        content: match content {
            Some(s) => serde_json::from_str(&s)?,
            None => Vec::new(),
        },
        actions: match actions {
            Some(s) => serde_json::from_str(&s)?,
            None => EventActions::default(),
        },
        long_running_tool_ids: match lrt {
            Some(s) => serde_json::from_str(&s)?,
            None => Vec::new(),
        },
        grounding_metadata: grounding.map(|s| serde_json::from_str(&s)).transpose()?,
        custom_metadata: custom.map(|s| serde_json::from_str(&s)).transpose()?,
        usage_metadata: match usage {
            Some(s) => Some(serde_json::from_str::<UsageMetadata>(&s)?),
            None => None,
        },
        citation_metadata: citation.map(|s| serde_json::from_str(&s)).transpose()?,
        partial: row.get::<_, Option<bool>>("partial")?.unwrap_or(false),
        turn_complete: row
            .get::<_, Option<bool>>("turn_complete")?
            .unwrap_or(false),
        interrupted: row.get::<_, Option<bool>>("interrupted")?.unwrap_or(false),
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
