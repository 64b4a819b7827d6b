//! Built-in `list_dir` tool.

use serde_json::{json, Value};

use super::{truncate_output, MAX_TOOL_OUTPUT_CHARS};
use crate::tools::{sandbox_path, ToolCtx};

/// List directory contents, optionally filtered by a glob on file names.
///
/// Args: `{ "path": ".", "glob?": "*.py", "recursive?": false }`.
/// Returns one workspace-relative entry per line; directories get a
/// trailing `/`.
pub async fn run(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
    let glob = args.get("glob").and_then(Value::as_str);
    let recursive = args
        .get("recursive")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let target = sandbox_path(&ctx.workspace, raw)?;
    if !target.is_dir() {
        return Ok(Value::String(format!("not a directory: {raw}")));
    }
    let ws_root = ctx.workspace.canonicalize()?;

    let mut entries = Vec::new();
    collect(&target, recursive, &mut entries)?;
    entries.sort();

    let mut lines = Vec::new();
    for entry in entries {
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(pattern) = glob {
            if !glob_match(pattern, &name) {
                continue;
            }
        }
        let rel = entry.strip_prefix(&ws_root).unwrap_or(&entry);
        let suffix = if entry.is_dir() { "/" } else { "" };
        lines.push(format!("{}{suffix}", rel.display()));
    }

    let output = lines.join("\n");
    if output.is_empty() {
        return Ok(Value::String("(empty)".to_string()));
    }
    Ok(Value::String(truncate_output(output, MAX_TOOL_OUTPUT_CHARS)))
}

fn collect(
    dir: &std::path::Path,
    recursive: bool,
    out: &mut Vec<std::path::PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_dir = path.is_dir();
        out.push(path.clone());
        if recursive && is_dir {
            collect(&path, true, out)?;
        }
    }
    Ok(())
}

/// Minimal glob matching: `*` and `?` wildcards over the file name.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    matches_at(&p, 0, &n, 0)
}

fn matches_at(p: &[char], pi: usize, n: &[char], ni: usize) -> bool {
    if pi == p.len() {
        return ni == n.len();
    }
    match p[pi] {
        '*' => {
            (ni..=n.len()).any(|next| matches_at(p, pi + 1, n, next))
        }
        '?' => ni < n.len() && matches_at(p, pi + 1, n, ni + 1),
        c => ni < n.len() && n[ni] == c && matches_at(p, pi + 1, n, ni + 1),
    }
}

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": "Workspace-relative directory. Defaults to the workspace root." },
            "glob": { "type": "string", "description": "Optional glob filter on entry names (e.g. '*.py')." },
            "recursive": { "type": "boolean", "description": "Recurse into subdirectories. Defaults to false." }
        },
        "additionalProperties": false
    })
}
