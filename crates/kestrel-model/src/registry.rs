// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Backend registry: static metadata for every supported backend, the
//! shorthand alias map, and the `provider/model` selection grammar.
//!
//! This module is the single source of truth for which backend IDs exist
//! and what their defaults are; construction itself lives in
//! [`create_backend`].

use std::sync::Arc;

use crate::{
    gemini::GeminiBackend, ollama::OllamaBackend, openai::OpenAiBackend,
    vertexai::VertexAiBackend, ModelBackend, ModelError,
};

/// Metadata describing a registered backend.
#[derive(Debug, Clone)]
pub struct BackendMeta {
    /// Unique backend id used on the CLI (`--backend gemini`).
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// One-line description shown by `/providers`.
    pub description: &'static str,
    /// Environment variable that holds the API key, if one is required.
    pub default_api_key_env: Option<&'static str>,
    /// Default base URL when no override is configured.
    pub default_base_url: Option<&'static str>,
    /// Default model when only a backend is selected.
    pub default_model: &'static str,
}

pub static BACKENDS: &[BackendMeta] = &[
    BackendMeta {
        id: "gemini",
        name: "Google Gemini",
        description: "Gemini models via the Generative Language API",
        default_api_key_env: Some("GOOGLE_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
        default_model: "gemini-2.5-flash",
    },
    BackendMeta {
        id: "vertexai",
        name: "Vertex AI",
        description: "Gemini models via Google Cloud Vertex AI (uses GOOGLE_CLOUD_PROJECT / GOOGLE_CLOUD_LOCATION)",
        default_api_key_env: Some("GOOGLE_API_KEY"),
        default_base_url: None,
        default_model: "gemini-2.5-flash",
    },
    BackendMeta {
        id: "openai",
        name: "OpenAI",
        description: "OpenAI GPT and o-series models",
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        default_model: "gpt-4o",
    },
    BackendMeta {
        id: "ollama",
        name: "Ollama",
        description: "Ollama local model runner (http://localhost:11434)",
        default_api_key_env: None,
        default_base_url: Some("http://localhost:11434"),
        default_model: "llama3.2",
    },
];

/// Shorthand → full model id.  Shorthands are what users type; the mapped
/// name is what goes on the wire.
static ALIASES: &[(&str, &str)] = &[
    ("flash", "gemini-2.5-flash"),
    ("flash-lite", "gemini-2.5-flash-lite"),
    ("pro", "gemini-2.5-pro"),
    ("4o", "gpt-4o"),
    ("4o-mini", "gpt-4o-mini"),
    ("llama", "llama3.2"),
];

/// A resolved model selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub backend_id: String,
    pub model: String,
}

/// Returns all registered backends in declaration order.
pub fn list_backends() -> &'static [BackendMeta] {
    BACKENDS
}

/// Look up a backend by its id.
pub fn get_backend_meta(id: &str) -> Option<&'static BackendMeta> {
    BACKENDS.iter().find(|b| b.id == id)
}

/// The shorthand table, for display surfaces.
pub fn list_aliases() -> &'static [(&'static str, &'static str)] {
    ALIASES
}

/// Resolve a shorthand through the alias map; unknown names pass through.
pub fn resolve_alias(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(short, _)| *short == name)
        .map(|(_, full)| *full)
        .unwrap_or(name)
}

/// Parse a `provider/model-or-shorthand | model-or-shorthand` spec.
///
/// Rules: surrounding whitespace is trimmed; at most one `/`; when a `/`
/// is present neither side may be empty.  Returns
/// `(provider, model)` with an empty provider when none was given.
pub fn parse_model_spec(spec: &str) -> Result<(String, String), ModelError> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(ModelError::InvalidModelSpec(spec.to_string()));
    }
    let mut parts = trimmed.split('/');
    let first = parts.next().unwrap_or_default();
    match (parts.next(), parts.next()) {
        (None, _) => Ok((String::new(), first.to_string())),
        (Some(second), None) => {
            if first.is_empty() || second.is_empty() {
                Err(ModelError::InvalidModelSpec(spec.to_string()))
            } else {
                Ok((first.to_string(), second.to_string()))
            }
        }
        (Some(_), Some(_)) => Err(ModelError::InvalidModelSpec(spec.to_string())),
    }
}

/// Turn a spec plus a fallback backend into a concrete selection.
///
/// When the spec names no provider, the backend is inferred from the
/// resolved model name prefix (`gemini-*`, `gpt-*`/`o*`), falling back to
/// `default_backend`.  `GOOGLE_GENAI_USE_VERTEXAI` (truthy) rewrites a
/// `gemini` inference to `vertexai`.
pub fn resolve_selection(
    spec: Option<&str>,
    default_backend: &str,
    default_model: &str,
) -> Result<ModelSelection, ModelError> {
    let (provider, raw_model) = match spec {
        Some(s) => parse_model_spec(s)?,
        None => (String::new(), default_model.to_string()),
    };
    let model = resolve_alias(&raw_model).to_string();

    let backend_id = if provider.is_empty() {
        infer_backend(&model).unwrap_or(default_backend).to_string()
    } else {
        provider
    };

    let backend_id = if backend_id == "gemini" && vertexai_env_enabled() {
        "vertexai".to_string()
    } else {
        backend_id
    };

    if get_backend_meta(&backend_id).is_none() {
        return Err(ModelError::UnknownBackend(backend_id));
    }
    Ok(ModelSelection { backend_id, model })
}

fn infer_backend(model: &str) -> Option<&'static str> {
    if model.starts_with("gemini-") {
        Some("gemini")
    } else if model.starts_with("gpt-") || model.starts_with("o1") || model.starts_with("o3") {
        Some("openai")
    } else {
        None
    }
}

fn vertexai_env_enabled() -> bool {
    std::env::var("GOOGLE_GENAI_USE_VERTEXAI")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Construction inputs shared by every backend.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Explicit API key; when None the backend's canonical env var is read.
    pub api_key: Option<String>,
    /// Environment variable to read the key from, overriding the default.
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
}

impl BackendOptions {
    fn resolve_api_key(&self, meta: &BackendMeta) -> Result<Option<String>, ModelError> {
        if let Some(k) = &self.api_key {
            return Ok(Some(k.clone()));
        }
        let env = self
            .api_key_env
            .as_deref()
            .or(meta.default_api_key_env);
        match env {
            Some(var) => match std::env::var(var) {
                Ok(v) if !v.is_empty() => Ok(Some(v)),
                _ => Err(ModelError::MissingApiKey(var.to_string())),
            },
            None => Ok(None),
        }
    }
}

/// Construct a backend for the given selection.
pub fn create_backend(
    selection: &ModelSelection,
    opts: &BackendOptions,
) -> Result<Arc<dyn ModelBackend>, ModelError> {
    let meta = get_backend_meta(&selection.backend_id)
        .ok_or_else(|| ModelError::UnknownBackend(selection.backend_id.clone()))?;
    let model = selection.model.clone();
    let base_url = opts
        .base_url
        .clone()
        .or_else(|| meta.default_base_url.map(str::to_string));

    match meta.id {
        "gemini" => {
            let key = opts.resolve_api_key(meta)?.unwrap_or_default();
            Ok(Arc::new(GeminiBackend::new(
                model,
                key,
                base_url.unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            )))
        }
        "vertexai" => {
            let key = opts.resolve_api_key(meta)?.unwrap_or_default();
            let project = std::env::var("GOOGLE_CLOUD_PROJECT")
                .map_err(|_| ModelError::MissingEnv("GOOGLE_CLOUD_PROJECT".into()))?;
            let location = std::env::var("GOOGLE_CLOUD_LOCATION")
                .unwrap_or_else(|_| "us-central1".into());
            Ok(Arc::new(VertexAiBackend::new(model, key, project, location)))
        }
        "openai" => {
            let key = opts.resolve_api_key(meta)?.unwrap_or_default();
            Ok(Arc::new(OpenAiBackend::new(
                model,
                key,
                base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            )))
        }
        "ollama" => Ok(Arc::new(OllamaBackend::new(
            model,
            base_url.unwrap_or_else(|| "http://localhost:11434".into()),
        ))),
        other => Err(ModelError::UnknownBackend(other.to_string())),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_model_spec ──────────────────────────────────────────────────────

    #[test]
    fn spec_with_provider_and_model() {
        assert_eq!(
            parse_model_spec("gemini/2.5-flash").unwrap(),
            ("gemini".to_string(), "2.5-flash".to_string())
        );
    }

    #[test]
    fn spec_bare_model_has_empty_provider() {
        assert_eq!(
            parse_model_spec("flash").unwrap(),
            (String::new(), "flash".to_string())
        );
    }

    #[test]
    fn spec_leading_slash_is_an_error() {
        assert!(parse_model_spec("/flash").is_err());
    }

    #[test]
    fn spec_trailing_slash_is_an_error() {
        assert!(parse_model_spec("gemini/").is_err());
    }

    #[test]
    fn spec_two_slashes_is_an_error() {
        assert!(parse_model_spec("a/b/c").is_err());
    }

    #[test]
    fn spec_whitespace_is_trimmed() {
        assert_eq!(
            parse_model_spec("  gemini/flash  ").unwrap(),
            ("gemini".to_string(), "flash".to_string())
        );
    }

    #[test]
    fn spec_empty_is_an_error() {
        assert!(parse_model_spec("").is_err());
        assert!(parse_model_spec("   ").is_err());
    }

    // ── Aliases ───────────────────────────────────────────────────────────────

    #[test]
    fn alias_flash_resolves() {
        assert_eq!(resolve_alias("flash"), "gemini-2.5-flash");
    }

    #[test]
    fn unknown_alias_passes_through() {
        assert_eq!(resolve_alias("gemini-2.5-pro"), "gemini-2.5-pro");
    }

    // ── resolve_selection ─────────────────────────────────────────────────────

    #[test]
    fn selection_infers_gemini_from_model_prefix() {
        let sel = resolve_selection(Some("flash"), "openai", "gpt-4o").unwrap();
        assert_eq!(sel.backend_id, "gemini");
        assert_eq!(sel.model, "gemini-2.5-flash");
    }

    #[test]
    fn selection_infers_openai_from_gpt_prefix() {
        let sel = resolve_selection(Some("4o"), "gemini", "gemini-2.5-flash").unwrap();
        assert_eq!(sel.backend_id, "openai");
        assert_eq!(sel.model, "gpt-4o");
    }

    #[test]
    fn selection_explicit_provider_wins() {
        let sel = resolve_selection(Some("ollama/llama"), "gemini", "x").unwrap();
        assert_eq!(sel.backend_id, "ollama");
        assert_eq!(sel.model, "llama3.2");
    }

    #[test]
    fn selection_unknown_provider_is_typed_error() {
        let err = resolve_selection(Some("acme/foo"), "gemini", "x").unwrap_err();
        assert!(matches!(err, ModelError::UnknownBackend(b) if b == "acme"));
    }

    #[test]
    fn selection_defaults_apply_without_spec() {
        let sel = resolve_selection(None, "gemini", "gemini-2.5-flash").unwrap();
        assert_eq!(sel.backend_id, "gemini");
        assert_eq!(sel.model, "gemini-2.5-flash");
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    #[test]
    fn all_backend_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for b in BACKENDS {
            assert!(seen.insert(b.id), "duplicate backend id: {}", b.id);
        }
    }

    #[test]
    fn required_backends_are_registered() {
        for id in ["gemini", "vertexai", "openai", "ollama"] {
            assert!(get_backend_meta(id).is_some(), "missing backend: {id}");
        }
    }

    #[test]
    fn ollama_needs_no_api_key() {
        let meta = get_backend_meta("ollama").unwrap();
        assert!(meta.default_api_key_env.is_none());
    }
}
