// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP client: launches configured servers as child processes speaking
//! line-delimited JSON-RPC 2.0 over stdio, enumerates their tools, and
//! registers each into the tool registry as `<server>.<tool>`.
//!
//! Each connection runs two background tasks (a stdin writer fed by an
//! outbox channel and a stdout reader) and correlates replies to
//! requests by id, so concurrent tool calls share one server process.

mod client;
mod wire;

pub use client::{register_servers, McpClient, McpError, McpTool};
pub use wire::{RemoteTool, RpcFailure};
