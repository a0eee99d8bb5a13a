// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod repl;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use kestrel_core::{load_project_context, Agent, TokenTracker, WorkspaceContext};
use kestrel_model::{create_backend, resolve_selection, BackendOptions, GenerationConfig};
use kestrel_store::SessionStore;
use kestrel_tools::{builtin::register_builtins, ToolRegistry};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli).await {
        eprintln!("kestrel: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = kestrel_config::load(cli.config.as_deref()).context("loading config")?;
    apply_cli_overrides(&cli, &mut config);

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| config.store.resolved_path());
    let store =
        Arc::new(SessionStore::open(&db_path).with_context(|| {
            format!("opening session store at {}", db_path.display())
        })?);
    let app = config.store.app_name.clone();
    let user = config.store.user_id.clone();

    // Store-management subcommands run without touching the model.
    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::NewSession { name } => {
                store.create_session(&app, &user, Some(name.as_str()), BTreeMap::new())?;
                println!("created session `{name}`");
            }
            Commands::ListSessions => {
                let sessions = store.list_sessions(&app, &user)?;
                if sessions.is_empty() {
                    println!("no sessions");
                }
                for s in sessions {
                    println!("{}  (updated {})", s.id, s.update_time.format("%Y-%m-%d %H:%M"));
                }
            }
            Commands::DeleteSession { name } => {
                store.delete_session(&app, &user, name)?;
                println!("deleted session `{name}`");
            }
        }
        return Ok(());
    }

    // ADK_PROJECT_ROOT overrides the working directory for agent discovery.
    let working_dir: PathBuf = cli
        .working_directory
        .clone()
        .or_else(|| std::env::var("ADK_PROJECT_ROOT").ok().map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let workspace = WorkspaceContext {
        project_context: load_project_context(&working_dir),
        working_dir: working_dir.clone(),
        platform: std::env::consts::OS.to_string(),
    };

    let selection = resolve_selection(
        cli.model.as_deref(),
        &config.model.backend,
        &config.model.name,
    )?;
    let backend_options = BackendOptions {
        api_key: None,
        api_key_env: config.model.api_key_env.clone(),
        base_url: config.model.base_url.clone(),
    };
    let backend = create_backend(&selection, &backend_options)
        .with_context(|| format!("initializing backend `{}`", selection.backend_id))?;

    let registry = Arc::new(ToolRegistry::new());
    register_builtins(
        &registry,
        working_dir,
        Duration::from_secs(config.tools.timeout_secs),
    )
    .context("registering built-in tools")?;
    // MCP tools land after the static set, before the registry seals on
    // the first turn.
    let mcp_clients = kestrel_mcp::register_servers(&config.mcp_servers, &registry).await;

    let generation = GenerationConfig {
        temperature: config.model.temperature,
        top_p: config.model.top_p,
        max_output_tokens: config.model.max_output_tokens,
        thinking_enabled: config.model.thinking_enabled
            || config.model.thinking_budget_tokens.is_some(),
        thinking_budget_tokens: config.model.thinking_budget_tokens,
    };

    let tracker = Arc::new(TokenTracker::new());
    let agent = Agent::new(
        Arc::clone(&store),
        backend,
        Arc::clone(&registry),
        Arc::clone(&tracker),
        config.agent.clone(),
        config.compaction.clone(),
        generation,
        workspace,
    );

    let session_name = cli.session.clone().unwrap_or_else(|| "default".into());
    let session = match store.get_session(&app, &user, &session_name)? {
        Some(s) => s,
        None => store.create_session(&app, &user, Some(&session_name), BTreeMap::new())?,
    };

    let mut repl = repl::Repl::new(agent, store, session, config, selection, mcp_clients);
    repl.run().await
}

/// Flags win over the config file, which wins over defaults.
fn apply_cli_overrides(cli: &Cli, config: &mut kestrel_config::Config) {
    if let Some(backend) = &cli.backend {
        config.model.backend = backend.clone();
    }
    if let Some(enabled) = cli.enable_thinking {
        config.model.thinking_enabled = enabled;
    }
    if let Some(budget) = cli.thinking_budget {
        config.model.thinking_budget_tokens = Some(budget);
    }
    if let Some(enabled) = cli.compaction {
        config.compaction.enabled = enabled;
    }
    if let Some(threshold) = cli.compaction_threshold {
        config.compaction.invocation_threshold = threshold;
    }
    if let Some(overlap) = cli.compaction_overlap {
        config.compaction.overlap_window = overlap;
    }
    if let Some(tokens) = cli.compaction_tokens {
        config.compaction.token_threshold = tokens;
    }
    if let Some(safety) = cli.compaction_safety {
        config.compaction.safety_ratio = safety.clamp(f64::EPSILON, 1.0);
    }
}
