//! Built-in tools.
//!
//! Registered once at startup; built-in names can never be shadowed by
//! extensions or remote tools.

pub mod file_search;
pub mod list_dir;
pub mod memory;
pub mod profile;
pub mod read;
pub mod run_python;
pub mod secrets;
pub mod tool_call;
pub mod write;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::{ToolCtx, ToolDescriptor, ToolOrigin, ToolRegistry};
use crate::config::ToolLimitsConfig;
use crate::error::PithError;

/// Inline truncation cap for listing-style tool output.
pub(crate) const MAX_TOOL_OUTPUT_CHARS: usize = 8_000;

/// Truncate `s` to at most `max` bytes on a char boundary, appending a
/// marker when trimmed.
pub(crate) fn truncate_output(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...", &s[..end])
}

/// Helper: build a built-in descriptor around an async handler fn.
fn builtin(
    name: &str,
    description: &str,
    parameters: Value,
    timeout: Duration,
    max_output_bytes: usize,
    handler: super::ToolHandler,
) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        origin: ToolOrigin::Builtin,
        description: description.to_string(),
        parameters,
        timeout,
        max_output_bytes,
        fingerprint: None,
        handler,
    }
}

macro_rules! handler {
    ($path:path) => {
        Arc::new(|args: Value, ctx: ToolCtx| Box::pin(async move { $path(args, &ctx).await }))
    };
}

/// Register every built-in tool. Called once at startup, before any
/// extension or remote registration.
pub fn register_builtins(
    registry: &ToolRegistry,
    limits: &ToolLimitsConfig,
) -> Result<(), PithError> {
    let file_timeout = Duration::from_secs(limits.file_timeout_seconds);
    let default_timeout = Duration::from_secs(limits.timeout_seconds);
    let cap = limits.max_output_bytes;

    registry.register(builtin(
        "read",
        "Read a file from the workspace.",
        read::schema(),
        file_timeout,
        cap,
        handler!(read::run),
    ))?;
    registry.register(builtin(
        "write",
        "Write content to a file in the workspace.",
        write::write_schema(),
        file_timeout,
        cap,
        handler!(write::run_write),
    ))?;
    registry.register(builtin(
        "edit",
        "Edit a file by replacing old text with new text.",
        write::edit_schema(),
        file_timeout,
        cap,
        handler!(write::run_edit),
    ))?;
    registry.register(builtin(
        "list_dir",
        "List files and directories at a workspace path. Use glob to filter (e.g. '*.py'). Non-recursive by default.",
        list_dir::schema(),
        file_timeout,
        cap,
        handler!(list_dir::run),
    ))?;
    registry.register(builtin(
        "file_search",
        "Search file contents for a pattern (regex or literal). Returns matching lines with file path and line number.",
        file_search::schema(),
        file_timeout,
        cap,
        handler!(file_search::run),
    ))?;
    registry.register(builtin(
        "run_python",
        "Run Python code in a sandboxed interpreter. No network or import access beyond the standard sandbox. Returns printed output.",
        run_python::schema(),
        default_timeout.min(Duration::from_secs(30)),
        cap,
        handler!(run_python::run),
    ))?;
    registry.register(builtin(
        "memory_save",
        "Save a memory entry for future recall.",
        memory::save_schema(),
        default_timeout,
        cap,
        handler!(memory::run_save),
    ))?;
    registry.register(builtin(
        "memory_search",
        "Search memory entries by query.",
        memory::search_schema(),
        default_timeout,
        cap,
        handler!(memory::run_search),
    ))?;
    registry.register(builtin(
        "set_profile",
        "Set a profile field for agent or user identity.",
        profile::schema(),
        default_timeout,
        cap,
        handler!(profile::run),
    ))?;
    registry.register(builtin(
        "list_secrets",
        "List the names of configured secrets. Returns only key names, never values.",
        secrets::schema(),
        default_timeout,
        cap,
        handler!(secrets::run),
    ))?;
    registry.register(builtin(
        "tool_call",
        "Call an extension or remote tool by name. Use for tools not built-in.",
        tool_call::schema(),
        default_timeout,
        cap,
        handler!(tool_call::run),
    ))?;

    tracing::debug!(total = registry.len(), "built-in tools registered");
    Ok(())
}
