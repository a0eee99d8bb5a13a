// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Scope-prefixed state handling.
//!
//! State keys carry their scope as a prefix: `app:` is shared by all
//! sessions of an app, `user:` by all sessions of an (app, user) pair,
//! `temp:` lives only for the current invocation and is never persisted,
//! and unprefixed keys are session-private.  Prefixes exist only at the
//! serialization boundary: storage holds each scope in its own table with
//! the prefix stripped, and the merged read view adds them back.

use std::collections::BTreeMap;

use serde_json::Value;

pub const APP_PREFIX: &str = "app:";
pub const USER_PREFIX: &str = "user:";
pub const TEMP_PREFIX: &str = "temp:";

/// A state delta split by scope, prefixes stripped, `temp:` keys dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitDelta {
    pub app: BTreeMap<String, Value>,
    pub user: BTreeMap<String, Value>,
    pub session: BTreeMap<String, Value>,
}

impl SplitDelta {
    pub fn is_empty(&self) -> bool {
        self.app.is_empty() && self.user.is_empty() && self.session.is_empty()
    }
}

/// Split a prefixed delta into its three persistent scopes.
///
/// `temp:` keys are filtered out here — they must never reach any scope
/// table or the persisted event row.
pub fn split_delta(delta: &BTreeMap<String, Value>) -> SplitDelta {
    let mut out = SplitDelta::default();
    for (key, value) in delta {
        if let Some(k) = key.strip_prefix(APP_PREFIX) {
            out.app.insert(k.to_string(), value.clone());
        } else if let Some(k) = key.strip_prefix(USER_PREFIX) {
            out.user.insert(k.to_string(), value.clone());
        } else if key.starts_with(TEMP_PREFIX) {
            continue;
        } else {
            out.session.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Build the merged view returned to consumers: session keys unprefixed,
/// app and user keys re-prefixed.  The scopes are disjoint by construction
/// (prefixes differ), so no key can shadow another.
pub fn merged_view(
    app: &BTreeMap<String, Value>,
    user: &BTreeMap<String, Value>,
    session: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (k, v) in app {
        out.insert(format!("{APP_PREFIX}{k}"), v.clone());
    }
    for (k, v) in user {
        out.insert(format!("{USER_PREFIX}{k}"), v.clone());
    }
    for (k, v) in session {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// Strip `temp:` keys from a raw delta, keeping scope prefixes intact.
/// This is the form persisted into the event row's `actions` column.
pub fn strip_temp(delta: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    delta
        .iter()
        .filter(|(k, _)| !k.starts_with(TEMP_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn delta() -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("app:x".to_string(), json!(1)),
            ("user:y".to_string(), json!(2)),
            ("z".to_string(), json!(3)),
            ("temp:t".to_string(), json!(4)),
        ])
    }

    #[test]
    fn split_routes_each_prefix_to_its_scope() {
        let s = split_delta(&delta());
        assert_eq!(s.app.get("x"), Some(&json!(1)));
        assert_eq!(s.user.get("y"), Some(&json!(2)));
        assert_eq!(s.session.get("z"), Some(&json!(3)));
    }

    #[test]
    fn split_drops_temp_keys() {
        let s = split_delta(&delta());
        assert!(!s.app.contains_key("t"));
        assert!(!s.user.contains_key("t"));
        assert!(!s.session.contains_key("t"));
    }

    #[test]
    fn split_strips_prefixes() {
        let s = split_delta(&delta());
        assert!(!s.app.contains_key("app:x"));
        assert!(s.app.contains_key("x"));
    }

    #[test]
    fn merged_view_round_trips_prefixes() {
        let s = split_delta(&delta());
        let merged = merged_view(&s.app, &s.user, &s.session);
        assert_eq!(merged.get("app:x"), Some(&json!(1)));
        assert_eq!(merged.get("user:y"), Some(&json!(2)));
        assert_eq!(merged.get("z"), Some(&json!(3)));
        assert!(!merged.keys().any(|k| k.starts_with(TEMP_PREFIX)));
    }

    #[test]
    fn strip_temp_keeps_other_prefixes() {
        let stripped = strip_temp(&delta());
        assert_eq!(stripped.len(), 3);
        assert!(stripped.contains_key("app:x"));
        assert!(stripped.contains_key("user:y"));
        assert!(stripped.contains_key("z"));
        assert!(!stripped.contains_key("temp:t"));
    }

    #[test]
    fn empty_delta_splits_empty() {
        let s = split_delta(&BTreeMap::new());
        assert!(s.is_empty());
    }
}
