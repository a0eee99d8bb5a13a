// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire helpers for the MCP dialect of JSON-RPC 2.0.
//!
//! Outgoing messages are assembled as JSON values directly; there is no
//! request struct to keep in sync with the spec.  Incoming stdout lines
//! all decode into one [`Incoming`] shape, and the reader decides from
//! its fields whether a line is a reply worth routing.  Server
//! notifications, server-initiated requests, and stray log output simply
//! fail the reply test and are dropped.

use serde::Deserialize;
use serde_json::{json, Value};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Serialize one request line.  `Value::Null` params are omitted.
pub fn request_line(id: i64, method: &str, params: Value) -> String {
    let mut msg = json!({ "jsonrpc": "2.0", "id": id, "method": method });
    if !params.is_null() {
        msg["params"] = params;
    }
    msg.to_string()
}

/// Serialize one notification line (no id, no reply expected).
pub fn notification_line(method: &str) -> String {
    json!({ "jsonrpc": "2.0", "method": method }).to_string()
}

/// The parameter block for the `initialize` handshake.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "kestrel",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// One decoded stdout line.
///
/// The id is kept as a raw JSON value because JSON-RPC permits both
/// numeric and string ids; kestrel issues numeric ids but tolerates
/// servers that echo them back as strings.
#[derive(Debug, Deserialize)]
pub struct Incoming {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcFailure>,
}

impl Incoming {
    /// The request id this line answers — `None` when the line is not a
    /// reply at all (a notification or a server-side request carries an
    /// id but no result/error; log noise usually has neither).
    pub fn reply_id(&self) -> Option<i64> {
        if self.result.is_none() && self.error.is_none() {
            return None;
        }
        let id = self.id.as_ref()?;
        id.as_i64().or_else(|| id.as_str()?.parse().ok())
    }

    /// Collapse into the call outcome.  An error object wins even if the
    /// server also sent a result, which the spec forbids anyway.
    pub fn into_outcome(self) -> Result<Value, RpcFailure> {
        match self.error {
            Some(failure) => Err(failure),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcFailure {
    /// Synthetic failure for a connection that went away mid-call.
    pub fn stream_closed() -> Self {
        Self {
            code: -32000,
            message: "connection closed before the server replied".into(),
            data: None,
        }
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcFailure {}

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.  Servers that omit it get a
    /// permissive empty object schema.
    pub input_schema: Value,
}

/// Decode a `tools/list` result payload.  A tool without a name is a
/// protocol violation; missing descriptions and schemas get defaults.
pub fn decode_tool_list(result: &Value) -> Result<Vec<RemoteTool>, String> {
    let Some(items) = result["tools"].as_array() else {
        return Err("tools/list result carries no `tools` array".into());
    };
    items
        .iter()
        .map(|item| {
            let name = item["name"]
                .as_str()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| "tool entry without a name".to_string())?;
            Ok(RemoteTool {
                name: name.to_string(),
                description: item["description"].as_str().unwrap_or_default().to_string(),
                input_schema: if item["inputSchema"].is_object() {
                    item["inputSchema"].clone()
                } else {
                    json!({ "type": "object", "properties": {} })
                },
            })
        })
        .collect()
}

/// Flatten a `tools/call` result into `(text, is_error)`: the text items
/// of the content array joined by newlines, plus the server's error flag.
pub fn decode_call_result(result: &Value) -> (String, bool) {
    let is_error = result["isError"].as_bool().unwrap_or(false);
    let text = match result["content"].as_array() {
        Some(items) => items
            .iter()
            .filter(|item| item["type"] == "text")
            .filter_map(|item| item["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        // Some servers answer with a bare result object; pass it through
        // so the model still sees something useful.
        None => result.to_string(),
    };
    (text, is_error)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
