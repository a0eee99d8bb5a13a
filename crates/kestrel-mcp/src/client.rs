// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kestrel_config::McpServerConfig;
use kestrel_tools::{Tool, ToolCall, ToolCategory, ToolOutput, ToolRegistry};

use crate::wire::{
    self, decode_call_result, decode_tool_list, Incoming, RemoteTool, RpcFailure,
};

/// Wall-clock budget for one request/reply exchange.
const CALL_TIMEOUT: Duration = Duration::from_secs(20);
/// How long a server gets between stdin closing and a kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("MCP server `{0}` is disconnected")]
    Disconnected(String),

    #[error("MCP server gave no reply within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Rpc(#[from] RpcFailure),

    #[error("malformed MCP payload: {0}")]
    Protocol(String),
}

/// Reply slots keyed by request id; the reader task fills them.
type PendingReplies = Arc<StdMutex<HashMap<i64, oneshot::Sender<Result<Value, RpcFailure>>>>>;

/// One live server process.
///
/// Two background tasks own the pipes: a writer draining an outbox
/// channel into stdin, and a reader routing each stdout reply to the
/// waiting caller through [`PendingReplies`].  Correlating replies by id
/// means concurrent callers share the connection without taking turns;
/// anything on stdout that is not a reply to one of our ids (server
/// notifications, log noise) is dropped by the reader.
struct Connection {
    server: String,
    outbox: mpsc::Sender<String>,
    pending: PendingReplies,
    next_id: AtomicI64,
    child: tokio::sync::Mutex<Child>,
    eof: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl Connection {
    fn launch(config: &McpServerConfig) -> Result<Arc<Self>, McpError> {
        let mut command = tokio::process::Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            // An unread stderr pipe would eventually block the child;
            // servers that want to be heard must log elsewhere.
            .stderr(std::process::Stdio::null());

        let mut child = command.spawn().map_err(|source| McpError::Spawn {
            command: config.command.clone(),
            source,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("child process has no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("child process has no stdout pipe".into()))?;

        let stop = CancellationToken::new();
        let (outbox, mut outbox_rx) = mpsc::channel::<String>(32);

        // Writer: owns stdin.  Exits on shutdown or a broken pipe, and
        // dropping stdin is what tells a well-behaved server to leave.
        let writer_stop = stop.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                let line = tokio::select! {
                    _ = writer_stop.cancelled() => break,
                    item = outbox_rx.recv() => match item {
                        Some(line) => line,
                        None => break,
                    },
                };
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        // Reader: owns stdout.  Routes replies until EOF, then fails
        // every caller still waiting so nobody blocks on a dead server.
        let pending: PendingReplies = Arc::new(StdMutex::new(HashMap::new()));
        let eof = Arc::new(AtomicBool::new(false));
        {
            let pending = Arc::clone(&pending);
            let eof = Arc::clone(&eof);
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(incoming) = serde_json::from_str::<Incoming>(&line) else {
                        debug!(server = %server, "dropping non-JSON-RPC stdout line");
                        continue;
                    };
                    let Some(id) = incoming.reply_id() else {
                        continue;
                    };
                    let slot = pending.lock().expect("pending map poisoned").remove(&id);
                    match slot {
                        Some(tx) => {
                            let _ = tx.send(incoming.into_outcome());
                        }
                        None => debug!(server = %server, id, "reply for an unknown request id"),
                    }
                }
                eof.store(true, Ordering::SeqCst);
                let drained: Vec<_> = pending
                    .lock()
                    .expect("pending map poisoned")
                    .drain()
                    .collect();
                for (_, tx) in drained {
                    let _ = tx.send(Err(RpcFailure::stream_closed()));
                }
            });
        }

        Ok(Arc::new(Self {
            server: config.name.clone(),
            outbox,
            pending,
            next_id: AtomicI64::new(1),
            child: tokio::sync::Mutex::new(child),
            eof,
            stop,
        }))
    }

    fn is_open(&self) -> bool {
        !self.eof.load(Ordering::SeqCst)
    }

    /// One request/reply exchange.  Times out after [`CALL_TIMEOUT`];
    /// concurrent calls interleave freely.
    async fn call(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, reply_tx);

        let sent = self.outbox.send(wire::request_line(id, method, params)).await;
        if sent.is_err() || !self.is_open() {
            // The reader may already have drained the map; remove our
            // slot either way so it cannot leak.
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&id);
            return Err(McpError::Disconnected(self.server.clone()));
        }

        match tokio::time::timeout(CALL_TIMEOUT, reply_rx).await {
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&id);
                Err(McpError::Timeout(CALL_TIMEOUT))
            }
            Ok(Err(_)) => Err(McpError::Disconnected(self.server.clone())),
            Ok(Ok(outcome)) => Ok(outcome?),
        }
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        self.outbox
            .send(wire::notification_line(method))
            .await
            .map_err(|_| McpError::Disconnected(self.server.clone()))
    }

    /// Stop the writer (closing stdin), give the server the grace
    /// period, then kill and reap it.
    async fn close(&self) {
        self.stop.cancel();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(server = %self.server, ?status, "MCP server exited"),
            Ok(Err(e)) => debug!(server = %self.server, error = %e, "error reaping MCP server"),
            Err(_) => {
                warn!(server = %self.server, "MCP server ignored stdin close; killing");
                if child.start_kill().is_ok() {
                    let _ = child.wait().await;
                }
            }
        }
    }
}

struct ClientState {
    config: McpServerConfig,
    conn: RwLock<Option<Arc<Connection>>>,
    reconnecting: AtomicBool,
}

impl ClientState {
    /// Launch the server, run the handshake, and enumerate its tools.
    async fn connect(&self) -> Result<Vec<RemoteTool>, McpError> {
        let conn = Connection::launch(&self.config)?;
        conn.call("initialize", wire::initialize_params()).await?;
        conn.notify("notifications/initialized").await?;
        let listed = conn.call("tools/list", Value::Null).await?;
        let tools = decode_tool_list(&listed).map_err(McpError::Protocol)?;

        *self.conn.write().await = Some(conn);
        info!(server = %self.config.name, tools = tools.len(), "MCP server connected");
        Ok(tools)
    }
}

/// One configured MCP server.
///
/// On connection loss, calls fail fast with [`McpError::Disconnected`]
/// while a background task retries the connection with exponential
/// backoff.  Cheap to clone.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientState>,
}

impl McpClient {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            inner: Arc::new(ClientState {
                config,
                conn: RwLock::new(None),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .conn
            .read()
            .await
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    pub async fn connect(&self) -> Result<Vec<RemoteTool>, McpError> {
        self.inner.connect().await
    }

    /// Invoke a remote tool.  A dead connection fails fast and kicks off
    /// background reconnection.
    pub async fn call_tool(&self, name: &str, args: &Value) -> Result<Value, McpError> {
        let conn = { self.inner.conn.read().await.clone() };
        let Some(conn) = conn else {
            self.spawn_reconnect();
            return Err(McpError::Disconnected(self.name().to_string()));
        };
        if !conn.is_open() {
            self.mark_disconnected().await;
            return Err(McpError::Disconnected(self.name().to_string()));
        }

        let result = conn
            .call("tools/call", json!({ "name": name, "arguments": args }))
            .await;
        if !conn.is_open() {
            self.mark_disconnected().await;
        }
        result
    }

    pub async fn shutdown(&self) {
        if let Some(conn) = self.inner.conn.write().await.take() {
            conn.close().await;
        }
    }

    async fn mark_disconnected(&self) {
        *self.inner.conn.write().await = None;
        self.spawn_reconnect();
    }

    /// At most one reconnect loop runs at a time.
    fn spawn_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                tokio::time::sleep(backoff).await;
                match state.connect().await {
                    Ok(_) => {
                        info!(server = %state.config.name, "MCP server reconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(server = %state.config.name, error = %e, "MCP reconnect failed");
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
            state.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

/// A remote tool registered as `<server>.<tool>`.
///
/// Side effects of remote tools are unknown, so they are treated as
/// mutating and dispatch serially.
pub struct McpTool {
    client: McpClient,
    qualified_name: String,
    remote: RemoteTool,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }
    fn description(&self) -> &str {
        &self.remote.description
    }
    fn parameters_schema(&self) -> Value {
        self.remote.input_schema.clone()
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::AgentManagement
    }
    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return ToolOutput::err(&call.id, "cancelled");
            }
            r = self.client.call_tool(&self.remote.name, &call.args) => r,
        };
        match result {
            Ok(value) => {
                let (text, is_error) = decode_call_result(&value);
                if is_error {
                    ToolOutput::err(&call.id, text)
                } else {
                    ToolOutput::ok(&call.id, json!({ "content": text }))
                }
            }
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

/// Connect every configured server and register its tools.  A server
/// that fails to start is logged and skipped; the rest still register.
pub async fn register_servers(
    configs: &[McpServerConfig],
    registry: &ToolRegistry,
) -> Vec<McpClient> {
    let mut clients = Vec::new();
    for config in configs {
        let client = McpClient::new(config.clone());
        match client.connect().await {
            Ok(tools) => {
                for remote in tools {
                    let qualified = format!("{}.{}", config.name, remote.name);
                    let tool = McpTool {
                        client: client.clone(),
                        qualified_name: qualified.clone(),
                        remote,
                    };
                    if let Err(e) = registry.register(tool) {
                        warn!(tool = %qualified, error = %e, "skipping MCP tool");
                    }
                }
                clients.push(client);
            }
            Err(e) => {
                warn!(server = %config.name, error = %e, "failed to start MCP server");
            }
        }
    }
    clients
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn server(name: &str, script: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
        }
    }

    /// Answers every request with `{"ok":true}`, echoing the id back.
    const ECHO_OK: &str = r#"while read line; do
        id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
        [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
    done"#;

    /// Full handshake plus one `ping` tool whose call returns "pong".
    const PING_SERVER: &str = r#"while read line; do
        id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
        [ -z "$id" ] && continue
        case "$line" in
            *initialize*)
                printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05"}}\n' "$id" ;;
            *tools/list*)
                printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"replies"}]}}\n' "$id" ;;
            *tools/call*)
                printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
            *)
                printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"no such method"}}\n' "$id" ;;
        esac
    done"#;

    // ── Connection level ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_calls_share_one_connection() {
        let conn = Connection::launch(&server("echo", ECHO_OK)).unwrap();
        let (a, b) = tokio::join!(
            conn.call("one", Value::Null),
            conn.call("two", Value::Null),
        );
        assert_eq!(a.unwrap()["ok"], true);
        assert_eq!(b.unwrap()["ok"], true);
        conn.close().await;
    }

    #[tokio::test]
    async fn stdout_log_noise_is_ignored() {
        let noisy = r#"while read line; do
            echo "booting subsystem..."
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
        done"#;
        let conn = Connection::launch(&server("noisy", noisy)).unwrap();
        assert!(conn.call("anything", Value::Null).await.is_ok());
        conn.close().await;
    }

    #[tokio::test]
    async fn rpc_error_objects_become_typed_failures() {
        let conn = Connection::launch(&server("ping", PING_SERVER)).unwrap();
        let err = conn.call("bogus/method", Value::Null).await.unwrap_err();
        assert!(matches!(err, McpError::Rpc(f) if f.code == -32601));
        conn.close().await;
    }

    #[tokio::test]
    async fn exited_server_fails_callers_promptly() {
        let conn = Connection::launch(&server("gone", "exit 0")).unwrap();
        // Let the reader observe EOF first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.is_open());
        let start = std::time::Instant::now();
        let err = conn.call("tools/list", Value::Null).await.unwrap_err();
        assert!(matches!(err, McpError::Disconnected(_)));
        assert!(start.elapsed() < Duration::from_secs(1));
        conn.close().await;
    }

    #[tokio::test]
    async fn unlaunchable_command_is_a_spawn_error() {
        let config = McpServerConfig {
            name: "bad".into(),
            command: "/does/not/exist/mcp".into(),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(matches!(
            Connection::launch(&config).map(|_| ()),
            Err(McpError::Spawn { .. })
        ));
    }

    // ── Client level ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_runs_handshake_and_lists_tools() {
        let client = McpClient::new(server("files", PING_SERVER));
        let tools = client.connect().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");
        assert!(client.is_connected().await);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn call_tool_round_trips_text_content() {
        let client = McpClient::new(server("files", PING_SERVER));
        client.connect().await.unwrap();
        let value = client.call_tool("ping", &json!({})).await.unwrap();
        let (text, is_error) = decode_call_result(&value);
        assert_eq!(text, "pong");
        assert!(!is_error);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn never_connected_client_fails_fast() {
        let client = McpClient::new(server("files", PING_SERVER));
        let err = client.call_tool("ping", &json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Disconnected(s) if s == "files"));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn register_servers_namespaces_tools() {
        let registry = ToolRegistry::new();
        let clients = register_servers(&[server("files", PING_SERVER)], &registry).await;
        assert_eq!(clients.len(), 1);
        assert!(registry.get("files.ping").is_some());
        for c in &clients {
            c.shutdown().await;
        }
    }

    #[tokio::test]
    async fn failed_server_is_skipped() {
        let registry = ToolRegistry::new();
        let bad = McpServerConfig {
            name: "broken".into(),
            command: "/does/not/exist/mcp".into(),
            args: vec![],
            env: HashMap::new(),
        };
        let clients = register_servers(&[bad], &registry).await;
        assert!(clients.is_empty());
        assert!(registry.names().is_empty());
    }
}
