// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent core: the per-turn invocation loop that drives the model ↔
//! tool cycle against the session store, the compaction controller that
//! keeps the model-visible window bounded, and the token tracker.

mod agent;
mod compact;
mod events;
mod prompts;
mod usage;


pub use agent::Agent;
pub use compact::{effective_window, Compactor};
pub use events::AgentEvent;
pub use prompts::{load_project_context, system_prompt, WorkspaceContext};
pub use usage::{GlobalUsageSummary, RequestUsage, SessionUsageSummary, TokenTracker};
