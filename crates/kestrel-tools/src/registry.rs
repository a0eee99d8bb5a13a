// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Tool, ToolCall, ToolCategory, ToolOutput};

/// A tool schema as handed to the model layer.  Mirrors the model crate's
/// declaration type without depending on it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One rendered catalog entry for the system-prompt builder.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub usage_hint: Option<String>,
}

/// One category section of the rendered catalog, tools in priority order.
#[derive(Debug, Clone)]
pub struct CatalogSection {
    pub category: ToolCategory,
    pub tools: Vec<CatalogEntry>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool: {0}")]
    Duplicate(String),
    #[error("registry is sealed; tools can only be registered before the first turn")]
    Sealed,
}

/// Central registry holding all available tools.
///
/// Thread-safe under concurrent reads; registration is exclusive and
/// rejected after [`seal`] so the tool set (and therefore the system
/// prompt) stays stable for the lifetime of a run.  MCP-discovered tools
/// register at startup after the static set, before sealing.
///
/// [`seal`]: ToolRegistry::seal
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    sealed: AtomicBool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    pub fn register(&self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(RegistryError::Sealed);
        }
        let mut tools = self.tools.write().expect("registry lock poisoned");
        let name = tool.name().to_string();
        if tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tools.insert(name, tool);
        Ok(())
    }

    /// Freeze the catalog.  Called once before the first invocation turn.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Schemas for every registered tool, catalog-ordered.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.sorted_tools()
            .into_iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// The hierarchical catalog consumed by the system-prompt builder:
    /// categories in declaration order, tools by descending priority
    /// (name as tie-break) within each.
    pub fn catalog(&self) -> Vec<CatalogSection> {
        let tools = self.sorted_tools();
        ToolCategory::ALL
            .iter()
            .filter_map(|cat| {
                let entries: Vec<CatalogEntry> = tools
                    .iter()
                    .filter(|t| t.category() == *cat)
                    .map(|t| CatalogEntry {
                        name: t.name().to_string(),
                        description: t.description().to_string(),
                        usage_hint: t.usage_hint().map(str::to_string),
                    })
                    .collect();
                if entries.is_empty() {
                    None
                } else {
                    Some(CatalogSection {
                        category: *cat,
                        tools: entries,
                    })
                }
            })
            .collect()
    }

    /// True when the named tool mutates state.  Unknown tools are treated
    /// as mutating so they serialize conservatively.
    pub fn is_mutating(&self, name: &str) -> bool {
        self.get(name).map(|t| t.is_mutating()).unwrap_or(true)
    }

    /// Invoke a tool: look it up, validate arguments against its declared
    /// schema, then delegate to the executor under its timeout with a
    /// child cancellation context.  All failures come back as error
    /// outputs, never as panics or exceptions.
    pub async fn invoke(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput {
        let Some(tool) = self.get(&call.name) else {
            return ToolOutput::err(&call.id, format!("unknown tool: {}", call.name));
        };
        if let Err(msg) = validate_args(&tool.parameters_schema(), &call.args) {
            return ToolOutput::err(&call.id, format!("invalid arguments: {msg}"));
        }
        if cancel.is_cancelled() {
            return ToolOutput::err(&call.id, "cancelled");
        }

        let child = cancel.child_token();
        match tokio::time::timeout(tool.timeout(), tool.execute(call, child.clone())).await {
            Ok(output) => output,
            Err(_) => {
                child.cancel();
                warn!(tool = %call.name, "tool call timed out");
                ToolOutput::err(
                    &call.id,
                    format!("timed out after {:?}", tool.timeout()),
                )
            }
        }
    }

    fn sorted_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self
            .tools
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        tools.sort_by(|a, b| {
            a.category()
                .cmp(&b.category())
                .then(b.priority().cmp(&a.priority()))
                .then(a.name().cmp(b.name()))
        });
        tools
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check `args` against the declared JSON schema: it must be an object,
/// every `required` property must be present, and present properties with
/// a declared primitive type must match it.
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".into());
    };
    if let Some(required) = schema["required"].as_array() {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                return Err(format!("missing required property `{key}`"));
            }
        }
    }
    if let Some(props) = schema["properties"].as_object() {
        for (key, value) in obj {
            let Some(decl) = props.get(key) else { continue };
            let Some(expected) = decl["type"].as_str() else { continue };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("property `{key}` must be of type {expected}"));
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
