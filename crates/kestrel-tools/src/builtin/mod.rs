// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in tools: the file-system, search, and execution capabilities
//! the agent ships with.  MCP servers extend this set at startup.

mod execute_command;
mod find_file;
mod grep;
mod list_dir;
mod read_file;
mod write_file;

use std::path::PathBuf;
use std::time::Duration;

pub use execute_command::ExecuteCommandTool;
pub use find_file::FindFileTool;
pub use grep::GrepTool;
pub use list_dir::ListDirTool;
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;

use crate::{RegistryError, ToolRegistry};

/// Register the built-in tool set rooted at `workdir`.
pub fn register_builtins(
    registry: &ToolRegistry,
    workdir: PathBuf,
    command_timeout: Duration,
) -> Result<(), RegistryError> {
    registry.register(ReadFileTool::new(workdir.clone()))?;
    registry.register(ListDirTool::new(workdir.clone()))?;
    registry.register(WriteFileTool::new(workdir.clone()))?;
    registry.register(GrepTool::new(workdir.clone()))?;
    registry.register(FindFileTool::new(workdir.clone()))?;
    registry.register(ExecuteCommandTool::new(workdir, command_timeout))?;
    Ok(())
}

/// Resolve a tool-supplied path against the working directory.  Absolute
/// paths pass through.
pub(crate) fn resolve_path(root: &std::path::Path, path: &str) -> PathBuf {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_builtins_fills_the_catalog() {
        let reg = ToolRegistry::new();
        register_builtins(&reg, PathBuf::from("."), Duration::from_secs(30)).unwrap();
        let names = reg.names();
        for expected in [
            "read_file",
            "write_file",
            "list_dir",
            "grep",
            "find_file",
            "execute_command",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let p = resolve_path(std::path::Path::new("/work"), "src/main.rs");
        assert_eq!(p, PathBuf::from("/work/src/main.rs"));
    }

    #[test]
    fn absolute_paths_pass_through() {
        let p = resolve_path(std::path::Path::new("/work"), "/etc/hosts");
        assert_eq!(p, PathBuf::from("/etc/hosts"));
    }
}
