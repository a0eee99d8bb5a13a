// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model: {0}")]
    ModelNotFound(String),

    #[error("invalid model spec `{0}`: expected `provider/model` or `model`")]
    InvalidModelSpec(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("missing API key: set {0}")]
    MissingApiKey(String),

    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("quota exhausted: {0}")]
    Quota(String),

    #[error("backend error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// True for failures worth one jittered retry before the first byte of
    /// a response has been consumed.  Mid-stream failures are terminal for
    /// the turn regardless.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Transport(_) => true,
            ModelError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Classify an HTTP error status into the right error kind.  429 is a
    /// quota problem and is never retried.
    pub fn from_status(status: u16, message: String) -> Self {
        if status == 429 {
            ModelError::Quota(message)
        } else {
            ModelError::Api { status, message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_not_retryable() {
        assert!(!ModelError::from_status(429, "slow down".into()).is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(ModelError::from_status(503, "overloaded".into()).is_retryable());
    }

    #[test]
    fn client_errors_are_terminal() {
        assert!(!ModelError::from_status(400, "bad request".into()).is_retryable());
    }

    #[test]
    fn status_429_maps_to_quota() {
        assert!(matches!(
            ModelError::from_status(429, "x".into()),
            ModelError::Quota(_)
        ));
    }
}
