// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end: a disk-backed store, the real built-in tools against a
//! temporary workspace, and a scripted backend driving the loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kestrel_config::{AgentConfig, CompactionConfig};
use kestrel_core::{Agent, TokenTracker, WorkspaceContext};
use kestrel_model::mock::ScriptedBackend;
use kestrel_model::{FinishReason, ModelBackend, ModelEvent};
use kestrel_store::{Part, SessionStore, UsageMetadata};
use kestrel_tools::{builtin::register_builtins, ToolRegistry};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn agent_over(
    store: &Arc<SessionStore>,
    backend: Arc<ScriptedBackend>,
    workdir: &std::path::Path,
) -> Agent {
    let tools = Arc::new(ToolRegistry::new());
    register_builtins(&tools, workdir.to_path_buf(), Duration::from_secs(10)).unwrap();
    Agent::new(
        Arc::clone(store),
        backend as Arc<dyn ModelBackend>,
        tools,
        Arc::new(TokenTracker::new()),
        AgentConfig::default(),
        CompactionConfig {
            enabled: false,
            ..Default::default()
        },
        Default::default(),
        WorkspaceContext {
            working_dir: workdir.to_path_buf(),
            platform: std::env::consts::OS.to_string(),
            project_context: None,
        },
    )
}

#[tokio::test]
async fn agent_reads_a_real_file_and_survives_a_restart() {
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
    let db = tempfile::tempdir().unwrap();
    let db_path = db.path().join("sessions.db");

    {
        let store = Arc::new(SessionStore::open(&db_path).unwrap());
        let mut session = store
            .create_session("kestrel", "local", Some("e2e"), BTreeMap::new())
            .unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec![
            vec![
                ModelEvent::FunctionCall {
                    id: "t1".into(),
                    name: "read_file".into(),
                    args: json!({ "path": "notes.txt" }),
                },
                ModelEvent::TurnComplete(FinishReason::Tool),
            ],
            vec![
                ModelEvent::TextDelta("The file lists alpha and beta.".into()),
                ModelEvent::UsageUpdate(UsageMetadata {
                    prompt_tokens: 40,
                    candidate_tokens: 8,
                    total_tokens: 48,
                    ..Default::default()
                }),
                ModelEvent::TurnComplete(FinishReason::Stop),
            ],
        ]));
        let agent = agent_over(&store, backend, workdir.path());

        let (tx, mut rx) = mpsc::channel(256);
        agent
            .run_turn(
                &mut session,
                "what's in notes.txt?",
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        // The tool actually read the workspace file.
        let response = session
            .events
            .iter()
            .find_map(|e| {
                e.content.iter().find_map(|p| match p {
                    Part::FunctionResponse { response, .. } => Some(response.clone()),
                    _ => None,
                })
            })
            .expect("tool response persisted");
        assert_eq!(response["content"], "alpha\nbeta");
    }

    // A fresh process sees the same ordered log.
    let store = SessionStore::open(&db_path).unwrap();
    let session = store.get_session("kestrel", "local", "e2e").unwrap().unwrap();
    let authors: Vec<&str> = session.events.iter().map(|e| e.author.as_str()).collect();
    assert_eq!(authors, vec!["user", "model", "user", "model"]);
    assert_eq!(session.events[3].text(), "The file lists alpha and beta.");
    assert!(session.events.iter().all(|e| !e.partial));
}

#[tokio::test]
async fn agent_writes_then_reads_back_through_tools() {
    let workdir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let mut session = store
        .create_session("kestrel", "local", Some("rw"), BTreeMap::new())
        .unwrap();

    let backend = Arc::new(ScriptedBackend::new(vec![
        vec![
            ModelEvent::FunctionCall {
                id: "w1".into(),
                name: "write_file".into(),
                args: json!({ "path": "out/greeting.txt", "content": "hello from kestrel" }),
            },
            ModelEvent::FunctionCall {
                id: "r1".into(),
                name: "read_file".into(),
                args: json!({ "path": "out/greeting.txt" }),
            },
            ModelEvent::TurnComplete(FinishReason::Tool),
        ],
        vec![
            ModelEvent::TextDelta("Written and verified.".into()),
            ModelEvent::TurnComplete(FinishReason::Stop),
        ],
    ]));
    let agent = agent_over(&store, backend, workdir.path());

    let (tx, mut rx) = mpsc::channel(256);
    agent
        .run_turn(&mut session, "create a greeting", tx, CancellationToken::new())
        .await
        .unwrap();
    while rx.try_recv().is_ok() {}

    // The mutating write ran before the read that depends on it.
    let on_disk = std::fs::read_to_string(workdir.path().join("out/greeting.txt")).unwrap();
    assert_eq!(on_disk, "hello from kestrel");

    let responses: Vec<&Part> = session
        .events
        .iter()
        .flat_map(|e| e.content.iter())
        .filter(|p| matches!(p, Part::FunctionResponse { .. }))
        .collect();
    assert_eq!(responses.len(), 2);
    match responses[1] {
        Part::FunctionResponse { response, .. } => {
            assert_eq!(response["content"], "hello from kestrel");
        }
        _ => unreachable!(),
    }
}
