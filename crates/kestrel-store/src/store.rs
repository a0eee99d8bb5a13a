// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use crate::codec::{decode_event, decode_ts, encode_event, encode_ts};
use crate::error::StoreError;
use crate::event::Event;
use crate::state::{merged_view, split_delta, strip_temp};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    app_name    TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    id          TEXT NOT NULL,
    state       TEXT,
    create_time TIMESTAMP NOT NULL,
    update_time TIMESTAMP NOT NULL,
    PRIMARY KEY (app_name, user_id, id)
);
CREATE TABLE IF NOT EXISTS events (
    id                         TEXT NOT NULL,
    app_name                   TEXT NOT NULL,
    user_id                    TEXT NOT NULL,
    session_id                 TEXT NOT NULL,
    timestamp                  TIMESTAMP NOT NULL,
    invocation_id              TEXT NOT NULL,
    author                     TEXT NOT NULL,
    actions                    TEXT,
    long_running_tool_ids_json TEXT,
    branch                     TEXT,
    content                    TEXT,
    grounding_metadata         TEXT,
    custom_metadata            TEXT,
    usage_metadata             TEXT,
    citation_metadata          TEXT,
    partial                    INTEGER,
    turn_complete              INTEGER,
    error_code                 TEXT,
    error_message              TEXT,
    interrupted                INTEGER,
    PRIMARY KEY (app_name, user_id, session_id, id)
);
CREATE INDEX IF NOT EXISTS idx_events_session_time
    ON events (app_name, user_id, session_id, timestamp);
CREATE TABLE IF NOT EXISTS app_states (
    app_name    TEXT PRIMARY KEY,
    state       TEXT,
    update_time TIMESTAMP NOT NULL
);
CREATE TABLE IF NOT EXISTS user_states (
    app_name    TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    state       TEXT,
    update_time TIMESTAMP NOT NULL,
    PRIMARY KEY (app_name, user_id)
);
";

const EVENT_COLUMNS: &str = "id, app_name, user_id, session_id, timestamp, invocation_id, \
     author, actions, long_running_tool_ids_json, branch, content, grounding_metadata, \
     custom_metadata, usage_metadata, citation_metadata, partial, turn_complete, \
     error_code, error_message, interrupted";

/// A materialized session: its full event log plus the merged three-scope
/// state view (`app:`/`user:` keys prefixed, session keys bare).
#[derive(Debug, Clone)]
pub struct Session {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    pub state: BTreeMap<String, Value>,
    pub events: Vec<Event>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Session metadata without the event log, as returned by `list_sessions`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Append-only event store over a single SQLite file.
///
/// All multi-row operations run in one transaction; on failure nothing is
/// written and the in-memory [`Session`] passed to [`append_event`] is left
/// untouched.
///
/// [`append_event`]: SessionStore::append_event
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (creating if needed) the store at `path`.  Parent directories
    /// are created on first use.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a session, splitting `initial_state` by scope prefix into the
    /// app/user/session tables atomically.  `temp:` keys are dropped.
    pub fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<&str>,
        initial_state: BTreeMap<String, Value>,
    ) -> Result<Session, StoreError> {
        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let split = split_delta(&initial_state);

        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![app_name, user_id, id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::SessionExists {
                app_name: app_name.into(),
                user_id: user_id.into(),
                session_id: id,
            });
        }

        let app_state = upsert_app_state(&tx, app_name, &split.app, &now)?;
        let user_state = upsert_user_state(&tx, app_name, user_id, &split.user, &now)?;
        tx.execute(
            "INSERT INTO sessions (app_name, user_id, id, state, create_time, update_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                app_name,
                user_id,
                id,
                serde_json::to_string(&split.session)?,
                encode_ts(&now),
                encode_ts(&now),
            ],
        )?;
        tx.commit()?;

        debug!(app_name, user_id, session_id = %id, "created session");
        Ok(Session {
            app_name: app_name.into(),
            user_id: user_id.into(),
            id,
            state: merged_view(&app_state, &user_state, &split.session),
            events: Vec::new(),
            create_time: now,
            update_time: now,
        })
    }

    /// Load a session with its events ordered by (timestamp, id) and the
    /// merged state view.  Returns `Ok(None)` when it does not exist.
    pub fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");

        let head = conn
            .query_row(
                "SELECT state, create_time, update_time FROM sessions \
                 WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![app_name, user_id, session_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((session_state, create_time, update_time)) = head else {
            return Ok(None);
        };

        let session_state: BTreeMap<String, Value> = match session_state {
            Some(s) => serde_json::from_str(&s)?,
            None => BTreeMap::new(),
        };
        let app_state = read_app_state(&conn, app_name)?;
        let user_state = read_user_state(&conn, app_name, user_id)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 \
             ORDER BY timestamp ASC, id ASC"
        ))?;
        let events = stmt
            .query_map(params![app_name, user_id, session_id], |row| {
                Ok(decode_event(row))
            })?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?
            .into_iter()
            .collect::<Result<Vec<Event>, StoreError>>()?;

        Ok(Some(Session {
            app_name: app_name.into(),
            user_id: user_id.into(),
            id: session_id.into(),
            state: merged_view(&app_state, &user_state, &session_state),
            events,
            create_time: decode_ts(&create_time)?,
            update_time: decode_ts(&update_time)?,
        }))
    }

    /// List sessions of an (app, user) pair without materializing events.
    pub fn list_sessions(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, create_time, update_time FROM sessions \
             WHERE app_name = ?1 AND user_id = ?2 ORDER BY update_time DESC",
        )?;
        let rows = stmt
            .query_map(params![app_name, user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;

        rows.into_iter()
            .map(|(id, ct, ut)| {
                Ok(SessionSummary {
                    app_name: app_name.into(),
                    user_id: user_id.into(),
                    id,
                    create_time: decode_ts(&ct)?,
                    update_time: decode_ts(&ut)?,
                })
            })
            .collect()
    }

    /// Delete a session and all its events.
    pub fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM events WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
            params![app_name, user_id, session_id],
        )?;
        let deleted = tx.execute(
            "DELETE FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
            params![app_name, user_id, session_id],
        )?;
        tx.commit()?;
        if deleted == 0 {
            return Err(StoreError::SessionNotFound {
                app_name: app_name.into(),
                user_id: user_id.into(),
                session_id: session_id.into(),
            });
        }
        Ok(())
    }

    /// Append an event to the session.
    ///
    /// Partial (streamed) events return early and are never written.  For
    /// everything else, the event row and the scoped state upserts implied
    /// by its delta are committed in one transaction; only after the commit
    /// succeeds is the in-memory session mutated.  Returns the stored copy
    /// (its timestamp may have been nudged forward to keep the per-session
    /// order strict).
    pub fn append_event(
        &self,
        session: &mut Session,
        event: &Event,
    ) -> Result<Event, StoreError> {
        if event.partial {
            return Ok(event.clone());
        }

        let mut stored = event.clone();
        // Strict order within a session even when two appends land in the
        // same microsecond.
        if stored.timestamp <= session.update_time {
            stored.timestamp = session.update_time + Duration::microseconds(1);
        }
        stored.actions.state_delta = strip_temp(&stored.actions.state_delta);

        let split = split_delta(&stored.actions.state_delta);
        let row = encode_event(&stored)?;
        let now_enc = encode_ts(&stored.timestamp);

        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            &format!(
                "INSERT INTO events ({EVENT_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                  ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                row.id,
                session.app_name,
                session.user_id,
                session.id,
                row.timestamp,
                row.invocation_id,
                row.author,
                row.actions,
                row.long_running_tool_ids_json,
                row.branch,
                row.content,
                row.grounding_metadata,
                row.custom_metadata,
                row.usage_metadata,
                row.citation_metadata,
                row.partial,
                row.turn_complete,
                row.error_code,
                row.error_message,
                row.interrupted,
            ],
        )?;

        let app_state = upsert_app_state(&tx, &session.app_name, &split.app, &stored.timestamp)?;
        let user_state = upsert_user_state(
            &tx,
            &session.app_name,
            &session.user_id,
            &split.user,
            &stored.timestamp,
        )?;

        let mut session_state: BTreeMap<String, Value> = tx
            .query_row(
                "SELECT state FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![session.app_name, session.user_id, session.id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten()
            .map(|s| serde_json::from_str(&s))
            .transpose()?
            .unwrap_or_default();
        session_state.extend(split.session.clone());
        let updated = tx.execute(
            "UPDATE sessions SET state = ?4, update_time = ?5 \
             WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
            params![
                session.app_name,
                session.user_id,
                session.id,
                serde_json::to_string(&session_state)?,
                now_enc,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound {
                app_name: session.app_name.clone(),
                user_id: session.user_id.clone(),
                session_id: session.id.clone(),
            });
        }
        tx.commit()?;

        // Only now touch the in-memory session.
        session.state = merged_view(&app_state, &user_state, &session_state);
        session.update_time = stored.timestamp;
        session.events.push(stored.clone());
        Ok(stored)
    }
}

// ─── Scoped state helpers ─────────────────────────────────────────────────────

fn merge_state_json(
    current: Option<String>,
    delta: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, StoreError> {
    let mut state: BTreeMap<String, Value> = match current {
        Some(s) => serde_json::from_str(&s)?,
        None => BTreeMap::new(),
    };
    state.extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(state)
}

fn upsert_app_state(
    tx: &rusqlite::Transaction<'_>,
    app_name: &str,
    delta: &BTreeMap<String, Value>,
    now: &DateTime<Utc>,
) -> Result<BTreeMap<String, Value>, StoreError> {
    let current: Option<String> = tx
        .query_row(
            "SELECT state FROM app_states WHERE app_name = ?1",
            params![app_name],
            |row| row.get(0),
        )
        .optional()?;
    let merged = merge_state_json(current, delta)?;
    tx.execute(
        "INSERT INTO app_states (app_name, state, update_time) VALUES (?1, ?2, ?3) \
         ON CONFLICT (app_name) DO UPDATE SET state = ?2, update_time = ?3",
        params![app_name, serde_json::to_string(&merged)?, encode_ts(now)],
    )?;
    Ok(merged)
}

fn upsert_user_state(
    tx: &rusqlite::Transaction<'_>,
    app_name: &str,
    user_id: &str,
    delta: &BTreeMap<String, Value>,
    now: &DateTime<Utc>,
) -> Result<BTreeMap<String, Value>, StoreError> {
    let current: Option<String> = tx
        .query_row(
            "SELECT state FROM user_states WHERE app_name = ?1 AND user_id = ?2",
            params![app_name, user_id],
            |row| row.get(0),
        )
        .optional()?;
    let merged = merge_state_json(current, delta)?;
    tx.execute(
        "INSERT INTO user_states (app_name, user_id, state, update_time) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (app_name, user_id) DO UPDATE SET state = ?3, update_time = ?4",
        params![
            app_name,
            user_id,
            serde_json::to_string(&merged)?,
            encode_ts(now)
        ],
    )?;
    Ok(merged)
}

fn read_app_state(
    conn: &Connection,
    app_name: &str,
) -> Result<BTreeMap<String, Value>, StoreError> {
    let current: Option<Option<String>> = conn
        .query_row(
            "SELECT state FROM app_states WHERE app_name = ?1",
            params![app_name],
            |row| row.get(0),
        )
        .optional()?;
    merge_state_json(current.flatten(), &BTreeMap::new())
}

fn read_user_state(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
) -> Result<BTreeMap<String, Value>, StoreError> {
    let current: Option<Option<String>> = conn
        .query_row(
            "SELECT state FROM user_states WHERE app_name = ?1 AND user_id = ?2",
            params![app_name, user_id],
            |row| row.get(0),
        )
        .optional()?;
    merge_state_json(current.flatten(), &BTreeMap::new())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::Part;

    fn store() -> SessionStore {
        SessionStore::open_in_memory().unwrap()
    }

    fn event_with_delta(delta: &[(&str, Value)]) -> Event {
        let mut e = Event::user_message("inv-1", "hi");
        for (k, v) in delta {
            e.actions.state_delta.insert(k.to_string(), v.clone());
        }
        e
    }

    // ── Create / get / list / delete ──────────────────────────────────────────

    #[test]
    fn create_assigns_id_when_absent() {
        let s = store();
        let sess = s.create_session("app", "u", None, BTreeMap::new()).unwrap();
        assert!(!sess.id.is_empty());
    }

    #[test]
    fn create_with_explicit_id_is_fetchable() {
        let s = store();
        s.create_session("app", "u", Some("main"), BTreeMap::new())
            .unwrap();
        let got = s.get_session("app", "u", "main").unwrap().unwrap();
        assert_eq!(got.id, "main");
        assert!(got.events.is_empty());
    }

    #[test]
    fn create_duplicate_id_is_an_error() {
        let s = store();
        s.create_session("app", "u", Some("x"), BTreeMap::new())
            .unwrap();
        let err = s
            .create_session("app", "u", Some("x"), BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionExists { .. }));
    }

    #[test]
    fn create_splits_initial_state_by_prefix() {
        let s = store();
        let init = BTreeMap::from([
            ("app:theme".to_string(), json!("dark")),
            ("user:lang".to_string(), json!("en")),
            ("cwd".to_string(), json!("/tmp")),
            ("temp:x".to_string(), json!(1)),
        ]);
        let sess = s.create_session("app", "u", Some("s"), init).unwrap();
        assert_eq!(sess.state.get("app:theme"), Some(&json!("dark")));
        assert_eq!(sess.state.get("user:lang"), Some(&json!("en")));
        assert_eq!(sess.state.get("cwd"), Some(&json!("/tmp")));
        assert!(!sess.state.contains_key("temp:x"));
    }

    #[test]
    fn get_missing_session_is_none() {
        let s = store();
        assert!(s.get_session("app", "u", "nope").unwrap().is_none());
    }

    #[test]
    fn list_sessions_returns_metadata_only() {
        let s = store();
        s.create_session("app", "u", Some("a"), BTreeMap::new())
            .unwrap();
        s.create_session("app", "u", Some("b"), BTreeMap::new())
            .unwrap();
        s.create_session("app", "other", Some("c"), BTreeMap::new())
            .unwrap();
        let list = s.list_sessions("app", "u").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|m| m.user_id == "u"));
    }

    #[test]
    fn delete_cascades_events() {
        let s = store();
        let mut sess = s.create_session("app", "u", Some("d"), BTreeMap::new()).unwrap();
        s.append_event(&mut sess, &Event::user_message("inv", "one"))
            .unwrap();
        s.delete_session("app", "u", "d").unwrap();
        assert!(s.get_session("app", "u", "d").unwrap().is_none());
        // Recreating with the same id starts from an empty log.
        let sess2 = s.create_session("app", "u", Some("d"), BTreeMap::new()).unwrap();
        assert!(sess2.events.is_empty());
    }

    #[test]
    fn delete_missing_session_is_not_found() {
        let s = store();
        let err = s.delete_session("app", "u", "ghost").unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound { .. }));
    }

    // ── Append semantics ──────────────────────────────────────────────────────

    #[test]
    fn append_preserves_order_on_reload() {
        let s = store();
        let mut sess = s.create_session("app", "u", Some("o"), BTreeMap::new()).unwrap();
        for i in 0..10 {
            s.append_event(&mut sess, &Event::user_message("inv", format!("msg {i}")))
                .unwrap();
        }
        let loaded = s.get_session("app", "u", "o").unwrap().unwrap();
        let texts: Vec<String> = loaded.events.iter().map(|e| e.text()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("msg {i}")).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn append_partial_event_is_a_no_op() {
        let s = store();
        let mut sess = s.create_session("app", "u", Some("p"), BTreeMap::new()).unwrap();
        let mut e = Event::user_message("inv", "chunk");
        e.partial = true;
        s.append_event(&mut sess, &e).unwrap();
        assert!(sess.events.is_empty());
        let loaded = s.get_session("app", "u", "p").unwrap().unwrap();
        assert!(loaded.events.is_empty());
    }

    #[test]
    fn append_to_deleted_session_fails_without_mutating() {
        let s = store();
        let mut sess = s.create_session("app", "u", Some("gone"), BTreeMap::new()).unwrap();
        s.delete_session("app", "u", "gone").unwrap();
        let err = s
            .append_event(&mut sess, &Event::user_message("inv", "late"))
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound { .. }));
        assert!(sess.events.is_empty(), "in-memory session must stay unchanged");
    }

    #[test]
    fn state_delta_scoping_across_sessions_and_users() {
        // The P4 scenario: one append, observed from three vantage points.
        let s = store();
        let mut sess = s.create_session("A", "U", Some("S"), BTreeMap::new()).unwrap();
        let e = event_with_delta(&[
            ("app:x", json!(1)),
            ("user:y", json!(2)),
            ("z", json!(3)),
            ("temp:t", json!(4)),
        ]);
        s.append_event(&mut sess, &e).unwrap();

        // Same app, same user, different session: app + user state visible.
        let s2 = s.create_session("A", "U", Some("S2"), BTreeMap::new()).unwrap();
        assert_eq!(s2.state.get("app:x"), Some(&json!(1)));
        assert_eq!(s2.state.get("user:y"), Some(&json!(2)));
        assert!(!s2.state.contains_key("z"));
        assert!(!s2.state.contains_key("temp:t"));

        // Same app, different user: only app state visible.
        let s3 = s.create_session("A", "V", Some("S3"), BTreeMap::new()).unwrap();
        assert_eq!(s3.state.get("app:x"), Some(&json!(1)));
        assert!(!s3.state.contains_key("user:y"));
        assert!(!s3.state.contains_key("z"));

        // The origin session sees all three scopes.
        let origin = s.get_session("A", "U", "S").unwrap().unwrap();
        assert_eq!(origin.state.get("app:x"), Some(&json!(1)));
        assert_eq!(origin.state.get("user:y"), Some(&json!(2)));
        assert_eq!(origin.state.get("z"), Some(&json!(3)));
        assert!(!origin.state.contains_key("temp:t"));
    }

    #[test]
    fn temp_keys_absent_from_persisted_event_row() {
        let s = store();
        let mut sess = s.create_session("A", "U", Some("S"), BTreeMap::new()).unwrap();
        let e = event_with_delta(&[("temp:t", json!(4)), ("z", json!(3))]);
        s.append_event(&mut sess, &e).unwrap();
        let loaded = s.get_session("A", "U", "S").unwrap().unwrap();
        let delta = &loaded.events[0].actions.state_delta;
        assert!(delta.contains_key("z"));
        assert!(!delta.keys().any(|k| k.starts_with("temp:")));
    }

    #[test]
    fn append_updates_in_memory_state_and_update_time() {
        let s = store();
        let mut sess = s.create_session("A", "U", Some("S"), BTreeMap::new()).unwrap();
        let before = sess.update_time;
        s.append_event(&mut sess, &event_with_delta(&[("k", json!("v"))]))
            .unwrap();
        assert_eq!(sess.state.get("k"), Some(&json!("v")));
        assert!(sess.update_time > before);
    }

    #[test]
    fn same_instant_appends_get_strictly_increasing_timestamps() {
        let s = store();
        let mut sess = s.create_session("A", "U", Some("S"), BTreeMap::new()).unwrap();
        let ts = Utc::now();
        for i in 0..3 {
            let mut e = Event::user_message("inv", format!("m{i}"));
            e.timestamp = ts;
            s.append_event(&mut sess, &e).unwrap();
        }
        let loaded = s.get_session("A", "U", "S").unwrap().unwrap();
        assert!(loaded.events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        let texts: Vec<String> = loaded.events.iter().map(|e| e.text()).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn complex_event_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let stored = {
            let s = SessionStore::open(&path).unwrap();
            let mut sess = s.create_session("A", "U", Some("S"), BTreeMap::new()).unwrap();
            let mut e = Event::new("inv-7", "model");
            e.content.push(Part::thought("let me check"));
            e.content.push(Part::text("Running a search."));
            e.content
                .push(Part::function_call("t1", "grep", json!({"pattern": "fn main"})));
            e.usage_metadata = Some(crate::UsageMetadata {
                prompt_tokens: 42,
                candidate_tokens: 7,
                total_tokens: 49,
                ..Default::default()
            });
            e.long_running_tool_ids = vec!["t1".into()];
            s.append_event(&mut sess, &e).unwrap()
        };
        // Reopen the file — survives process restarts.
        let s = SessionStore::open(&path).unwrap();
        let loaded = s.get_session("A", "U", "S").unwrap().unwrap();
        assert_eq!(loaded.events.len(), 1);
        assert_eq!(loaded.events[0], stored);
    }
}
