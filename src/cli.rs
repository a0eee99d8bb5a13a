// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "kestrel",
    about = "An autonomous coding agent with a persistent, compacting session log",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Session name to open or create (default: "default")
    #[arg(long)]
    pub session: Option<String>,

    /// Model to use: "provider/model-or-shorthand" or "model-or-shorthand",
    /// e.g. "gemini/2.5-flash" or "flash"
    #[arg(long, short = 'M', env = "KESTREL_MODEL")]
    pub model: Option<String>,

    /// Backend when the model spec names no provider
    /// (gemini | vertexai | openai | ollama)
    #[arg(long)]
    pub backend: Option<String>,

    /// Request model-internal reasoning where supported
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub enable_thinking: Option<bool>,

    /// Token budget for reasoning (implies --enable-thinking)
    #[arg(long, value_name = "TOKENS")]
    pub thinking_budget: Option<u32>,

    /// Enable or disable history compaction
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub compaction: Option<bool>,

    /// Compact when more than this many invocations accumulate
    #[arg(long, value_name = "N")]
    pub compaction_threshold: Option<usize>,

    /// Most-recent invocations kept verbatim during compaction
    #[arg(long, value_name = "N")]
    pub compaction_overlap: Option<usize>,

    /// Token ceiling of the model-visible window
    #[arg(long, value_name = "TOKENS")]
    pub compaction_tokens: Option<u64>,

    /// Headroom fraction in (0, 1] applied to the token ceiling
    #[arg(long, value_name = "RATIO")]
    pub compaction_safety: Option<f64>,

    /// Working directory the tools operate in (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub working_directory: Option<PathBuf>,

    /// Path to the session store (default: ~/.kestrel/sessions.db)
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Path to a config file (overrides auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a named session and exit
    NewSession { name: String },
    /// List sessions of the local user and exit
    ListSessions,
    /// Delete a session and all its events, then exit
    DeleteSession { name: String },
}
