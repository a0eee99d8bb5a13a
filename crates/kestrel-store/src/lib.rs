// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation event model and the append-only session store.
//!
//! A session is keyed by `(app_name, user_id, session_id)` and owns an
//! ordered log of [`Event`]s plus three scoped state maps (app, user,
//! session).  Everything is persisted in a single SQLite file; every
//! append is one transaction covering the event row and the state
//! upserts it implies.

mod codec;
mod error;
mod event;
mod state;
mod store;

pub use error::StoreError;
pub use event::{CompactionInfo, Event, EventActions, Part, UsageMetadata};
pub use state::{merged_view, split_delta, SplitDelta, APP_PREFIX, TEMP_PREFIX, USER_PREFIX};
pub use store::{Session, SessionStore, SessionSummary};
