//! Built-in `file_search` tool — grep-like search across workspace files.

use regex::Regex;
use serde_json::{json, Value};

use super::{truncate_output, MAX_TOOL_OUTPUT_CHARS};
use crate::tools::ToolCtx;

/// Search file contents for a pattern.
///
/// Args: `{ "pattern": "…", "glob?": "*", "recursive?": true,
/// "literal?": false, "max_results?": 50 }`.
/// Returns `path:line: text` matches, one per line.
pub async fn run(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let pattern = args
        .get("pattern")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("file_search: missing `pattern` argument"))?;
    let glob = args.get("glob").and_then(Value::as_str).unwrap_or("*");
    let recursive = args
        .get("recursive")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let literal = args
        .get("literal")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let max_results = args
        .get("max_results")
        .and_then(Value::as_u64)
        .unwrap_or(50) as usize;

    let regex = if literal {
        Regex::new(&regex::escape(pattern)).expect("escaped pattern is valid")
    } else {
        match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return Ok(Value::String(format!("invalid regex: {e}"))),
        }
    };

    let ws_root = ctx.workspace.canonicalize()?;
    let mut files = Vec::new();
    collect_files(&ws_root, recursive, &mut files)?;
    files.sort();

    let mut matches = Vec::new();
    'files: for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !super::list_dir::glob_match(glob, &name) {
            continue;
        }
        // Skip binary / non-UTF-8 files.
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let rel = path.strip_prefix(&ws_root).unwrap_or(&path);
        for (lineno, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("{}:{}: {line}", rel.display(), lineno + 1));
                if matches.len() >= max_results {
                    break 'files;
                }
            }
        }
    }

    if matches.is_empty() {
        return Ok(Value::String("no matches".to_string()));
    }
    Ok(Value::String(truncate_output(
        matches.join("\n"),
        MAX_TOOL_OUTPUT_CHARS,
    )))
}

fn collect_files(
    dir: &std::path::Path,
    recursive: bool,
    out: &mut Vec<std::path::PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                collect_files(&path, true, out)?;
            }
        } else {
            out.push(path);
        }
    }
    Ok(())
}

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "pattern": { "type": "string", "description": "Regex (or literal text with literal=true) to search for." },
            "glob": { "type": "string", "description": "Glob filter on file names. Defaults to '*'." },
            "recursive": { "type": "boolean", "description": "Search subdirectories. Defaults to true." },
            "literal": { "type": "boolean", "description": "Treat pattern as literal text." },
            "max_results": { "type": "integer", "description": "Stop after this many matches. Defaults to 50." }
        },
        "required": ["pattern"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests_support::test_ctx;

    #[tokio::test]
    async fn finds_matching_lines() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(ctx.workspace.join("a.txt"), "alpha\nbeta\ngamma alpha").unwrap();
        let out = run(json!({"pattern": "alpha"}), &ctx).await.unwrap();
        let text = out.as_str().unwrap();
        assert!(text.contains("a.txt:1: alpha"));
        assert!(text.contains("a.txt:3: gamma alpha"));
    }

    #[tokio::test]
    async fn literal_mode_escapes_metachars() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(ctx.workspace.join("a.txt"), "price is $5.00 (sale)").unwrap();
        let out = run(
            json!({"pattern": "$5.00 (sale)", "literal": true}),
            &ctx,
        )
        .await
        .unwrap();
        assert!(out.as_str().unwrap().contains("a.txt:1"));
    }

    #[tokio::test]
    async fn invalid_regex_reports_not_errors() {
        let (_dir, ctx) = test_ctx();
        let out = run(json!({"pattern": "[unclosed"}), &ctx).await.unwrap();
        assert!(out.as_str().unwrap().starts_with("invalid regex"));
    }

    #[tokio::test]
    async fn max_results_caps_output() {
        let (_dir, ctx) = test_ctx();
        let body: String = (0..20).map(|i| format!("match {i}\n")).collect();
        std::fs::write(ctx.workspace.join("m.txt"), body).unwrap();
        let out = run(json!({"pattern": "match", "max_results": 3}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.as_str().unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn no_matches_message() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(ctx.workspace.join("a.txt"), "nothing here").unwrap();
        let out = run(json!({"pattern": "zzz"}), &ctx).await.unwrap();
        assert_eq!(out, "no matches");
    }
}
