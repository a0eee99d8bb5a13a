// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The interactive loop: reads lines from stdin, routes slash commands
//! to built-ins and everything else into the invocation loop.  One
//! invocation runs at a time; Ctrl-C cancels the active turn.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kestrel_config::Config;
use kestrel_core::{Agent, AgentEvent};
use kestrel_mcp::McpClient;
use kestrel_model::{
    create_backend, list_aliases, list_backends, resolve_selection, BackendOptions,
    ModelSelection,
};
use kestrel_store::{Session, SessionStore};

const HELP: &str = "\
Commands:
  /help                     show this help
  /tools                    list the tool catalog
  /models                   list model shorthands and defaults
  /providers                list supported backends
  /current-model            show the active backend and model
  /set-model <spec>         switch model (provider/model or shorthand)
  /tokens                   token usage for this session and overall
  /compaction               compaction settings and state
  /session                  current session info
  /new-session <name>       create and switch to a fresh session
  /list-sessions            list stored sessions
  /delete-session <name>    delete a session and its events
  /agents                   list configured agent profiles
  /run-agent <name> <task>  run one turn under an agent profile
  /mcp                      list MCP servers and connection state
  /prompt                   print the assembled system prompt
  /exit, /quit              leave";

pub struct Repl {
    agent: Agent,
    store: Arc<SessionStore>,
    session: Session,
    config: Config,
    selection: ModelSelection,
    mcp_clients: Vec<McpClient>,
}

impl Repl {
    pub fn new(
        agent: Agent,
        store: Arc<SessionStore>,
        session: Session,
        config: Config,
        selection: ModelSelection,
        mcp_clients: Vec<McpClient>,
    ) -> Self {
        Self {
            agent,
            store,
            session,
            config,
            selection,
            mcp_clients,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        println!(
            "kestrel {} — session `{}`, model {}/{}. /help for commands.",
            env!("CARGO_PKG_VERSION"),
            self.session.id,
            self.selection.backend_id,
            self.selection.model,
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("kestrel> ");
            let _ = std::io::stdout().flush();
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(command) = line.strip_prefix('/') {
                if !self.handle_command(command).await? {
                    break;
                }
            } else {
                self.run_agent_turn(None, line).await;
            }
        }

        for client in &self.mcp_clients {
            client.shutdown().await;
        }
        Ok(())
    }

    /// Run one invocation, rendering events concurrently and wiring
    /// Ctrl-C into the turn's cancellation context.
    async fn run_agent_turn(&mut self, profile: Option<(String, String)>, text: &str) {
        let (tx, rx) = mpsc::channel(256);
        let renderer = tokio::spawn(render_events(rx));
        let cancel = CancellationToken::new();

        let agent = &self.agent;
        let session = &mut self.session;
        let turn_cancel = cancel.clone();
        let turn = async move {
            match &profile {
                Some((name, prompt)) => {
                    agent
                        .run_turn_as(
                            session,
                            Some(name.as_str()),
                            Some(prompt.as_str()),
                            text,
                            tx,
                            turn_cancel,
                        )
                        .await
                }
                None => agent.run_turn(session, text, tx, turn_cancel).await,
            }
        };
        tokio::pin!(turn);

        let result = loop {
            tokio::select! {
                r = &mut turn => break r,
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    cancel.cancel();
                }
            }
        };
        let _ = renderer.await;
        if let Err(e) = result {
            eprintln!("error: {e:#}");
        }
    }

    /// Returns `Ok(false)` when the REPL should exit.
    async fn handle_command(&mut self, command: &str) -> anyhow::Result<bool> {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first().copied().unwrap_or("") {
            "help" => println!("{HELP}"),
            "exit" | "quit" => return Ok(false),

            "tools" => {
                for section in self.agent.tools().catalog() {
                    println!("{}:", section.category);
                    for tool in &section.tools {
                        println!("  {} — {}", tool.name, first_line(&tool.description));
                    }
                }
            }

            "models" => {
                println!("shorthands:");
                for (short, full) in list_aliases() {
                    println!("  {short:<12} → {full}");
                }
                println!("backend defaults:");
                for meta in list_backends() {
                    println!("  {:<10} {}", meta.id, meta.default_model);
                }
            }

            "providers" => {
                for meta in list_backends() {
                    let key = meta
                        .default_api_key_env
                        .map(|v| format!(" (key: {v})"))
                        .unwrap_or_default();
                    println!("{:<10} {}{key}", meta.id, meta.description);
                }
            }

            "current-model" => {
                let backend = self.agent.backend();
                println!("{}/{}", backend.backend_id(), backend.model_name());
            }

            "set-model" => match parts.get(1) {
                None => println!("usage: /set-model <provider/model | model>"),
                Some(spec) => self.set_model(spec),
            },

            "tokens" => {
                match self.agent.tracker().session_summary(&self.session.id) {
                    Some(s) => println!(
                        "session `{}`: {} requests, {} tokens total \
                         ({} prompt / {} output / {} cached), avg {}/request",
                        s.session_id,
                        s.request_count,
                        s.totals.total_tokens,
                        s.totals.prompt_tokens,
                        s.totals.candidate_tokens,
                        s.totals.cached_tokens,
                        s.average_tokens_per_request,
                    ),
                    None => println!("no usage recorded for this session yet"),
                }
                let g = self.agent.tracker().global_summary();
                println!(
                    "overall: {} sessions, {} requests, {} tokens",
                    g.session_count, g.request_count, g.totals.total_tokens
                );
            }

            "compaction" => {
                let c = &self.config.compaction;
                println!(
                    "enabled: {} | invocation threshold: {} | overlap: {} | \
                     token ceiling: {} × {:.2}",
                    c.enabled,
                    c.invocation_threshold,
                    c.overlap_window,
                    c.token_threshold,
                    c.safety_ratio,
                );
                let compactions = self
                    .session
                    .events
                    .iter()
                    .filter(|e| e.is_compaction())
                    .count();
                println!(
                    "session: {} events on disk, {} compaction summaries",
                    self.session.events.len(),
                    compactions
                );
            }

            "session" => println!(
                "`{}` — {} events, created {}, updated {}",
                self.session.id,
                self.session.events.len(),
                self.session.create_time.format("%Y-%m-%d %H:%M"),
                self.session.update_time.format("%Y-%m-%d %H:%M"),
            ),

            "new-session" => match parts.get(1) {
                None => println!("usage: /new-session <name>"),
                Some(name) => {
                    match self.store.create_session(
                        &self.config.store.app_name,
                        &self.config.store.user_id,
                        Some(*name),
                        BTreeMap::new(),
                    ) {
                        Ok(session) => {
                            self.session = session;
                            println!("switched to new session `{name}`");
                        }
                        Err(e) => println!("error: {e}"),
                    }
                }
            },

            "list-sessions" => {
                let sessions = self
                    .store
                    .list_sessions(&self.config.store.app_name, &self.config.store.user_id)?;
                for s in sessions {
                    let marker = if s.id == self.session.id { "*" } else { " " };
                    println!(
                        "{marker} {}  (updated {})",
                        s.id,
                        s.update_time.format("%Y-%m-%d %H:%M")
                    );
                }
            }

            "delete-session" => match parts.get(1) {
                None => println!("usage: /delete-session <name>"),
                Some(name) => {
                    match self.store.delete_session(
                        &self.config.store.app_name,
                        &self.config.store.user_id,
                        name,
                    ) {
                        Ok(()) => {
                            println!("deleted session `{name}`");
                            if *name == self.session.id {
                                self.session = self.store.create_session(
                                    &self.config.store.app_name,
                                    &self.config.store.user_id,
                                    Some(*name),
                                    BTreeMap::new(),
                                )?;
                                println!("current session recreated empty");
                            }
                        }
                        Err(e) => println!("error: {e}"),
                    }
                }
            },

            "agents" => {
                if self.config.agents.is_empty() {
                    println!("no agent profiles configured");
                }
                for (name, profile) in &self.config.agents {
                    println!("{name} — {}", first_line(&profile.description));
                }
            }

            "run-agent" => {
                if parts.len() < 3 {
                    println!("usage: /run-agent <name> <task>");
                } else {
                    let name = parts[1].to_string();
                    let task = parts[2..].join(" ");
                    match self.config.agents.get(&name).cloned() {
                        Some(profile) => {
                            self.run_agent_turn(Some((name, profile.system_prompt)), &task)
                                .await;
                        }
                        None => println!("unknown agent profile: {name}"),
                    }
                }
            }

            "mcp" => {
                if self.mcp_clients.is_empty() {
                    println!("no MCP servers configured");
                }
                for client in &self.mcp_clients {
                    let state = if client.is_connected().await {
                        "connected"
                    } else {
                        "disconnected"
                    };
                    println!("{} — {state}", client.name());
                }
            }

            "prompt" => println!("{}", self.agent.current_system_prompt()),

            other => println!("unknown command `/{other}` — /help lists commands"),
        }
        Ok(true)
    }

    fn set_model(&mut self, spec: &str) {
        let resolved = resolve_selection(
            Some(spec),
            &self.config.model.backend,
            &self.config.model.name,
        );
        let selection = match resolved {
            Ok(s) => s,
            Err(e) => {
                println!("error: {e}");
                return;
            }
        };
        let options = BackendOptions {
            api_key: None,
            api_key_env: self.config.model.api_key_env.clone(),
            base_url: self.config.model.base_url.clone(),
        };
        match create_backend(&selection, &options) {
            Ok(backend) => {
                self.agent.set_backend(backend);
                println!(
                    "model set to {}/{}",
                    selection.backend_id, selection.model
                );
                self.selection = selection;
            }
            Err(e) => println!("error: {e}"),
        }
    }
}

/// The renderer task: the only writer to stdout while a turn runs.
async fn render_events(mut rx: mpsc::Receiver<AgentEvent>) {
    let mut needs_newline = false;
    let mut thinking_announced = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta(delta) => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
                needs_newline = !delta.ends_with('\n');
            }
            AgentEvent::TextComplete(_) => {
                if needs_newline {
                    println!();
                    needs_newline = false;
                }
            }
            AgentEvent::ThoughtDelta(_) => {
                if !thinking_announced {
                    println!("(thinking…)");
                    thinking_announced = true;
                }
            }
            AgentEvent::ThoughtComplete(_) => thinking_announced = false,
            AgentEvent::ToolCallStarted(call) => {
                println!("→ {} {}", call.name, call.args);
            }
            AgentEvent::ToolCallFinished {
                tool_name,
                is_error,
                ..
            } => {
                println!("← {tool_name} {}", if is_error { "failed" } else { "ok" });
            }
            AgentEvent::TokenUsage(usage) => {
                tracing::debug!(total = usage.total_tokens, "request usage");
            }
            AgentEvent::ContextCompacted {
                events_summarized,
                original_tokens,
                compacted_tokens,
            } => println!(
                "(compacted {events_summarized} events: {original_tokens} → {compacted_tokens} tokens)"
            ),
            AgentEvent::TurnComplete => {
                if needs_newline {
                    println!();
                    needs_newline = false;
                }
            }
            AgentEvent::Aborted => println!("(interrupted)"),
            AgentEvent::Error(message) => eprintln!("error: {message}"),
        }
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
