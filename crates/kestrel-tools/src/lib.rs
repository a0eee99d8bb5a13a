// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The tool catalog: a typed registry of named capabilities the model can
//! invoke, plus the built-in file-system, search, and execution tools.

pub mod builtin;
mod registry;
mod tool;

pub use registry::{CatalogEntry, CatalogSection, RegistryError, ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolCall, ToolCategory, ToolOutput};
