//! Built-in `write` and `edit` tools.

use serde_json::{json, Value};

use crate::tools::{sandbox_path, ToolCtx};

/// Write content to a workspace file, creating parent directories.
///
/// Args: `{ "path": "…", "content": "…" }`.
pub async fn run_write(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let raw = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("write: missing `path` argument"))?;
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("write: missing `content` argument"))?;

    let path = sandbox_path(&ctx.workspace, raw)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| anyhow::anyhow!("write: cannot write {}: {e}", path.display()))?;

    Ok(Value::String(format!("written {}", path.display())))
}

/// Replace the first occurrence of `old` with `new` in a workspace file.
///
/// Args: `{ "path": "…", "old": "…", "new": "…" }`.
pub async fn run_edit(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let raw = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("edit: missing `path` argument"))?;
    let old = args
        .get("old")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("edit: missing `old` argument"))?;
    let new = args
        .get("new")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("edit: missing `new` argument"))?;

    let path = sandbox_path(&ctx.workspace, raw)?;
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| anyhow::anyhow!("edit: cannot read {}: {e}", path.display()))?;

    if !text.contains(old) {
        return Ok(Value::String("old content not found".to_string()));
    }
    let text = text.replacen(old, new, 1);
    tokio::fs::write(&path, text).await?;

    Ok(Value::String(format!("edited {}", path.display())))
}

pub fn write_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": "Workspace-relative path." },
            "content": { "type": "string", "description": "Full file contents to write." }
        },
        "required": ["path", "content"],
        "additionalProperties": false
    })
}

pub fn edit_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": "Workspace-relative path." },
            "old": { "type": "string", "description": "Text to replace (first occurrence)." },
            "new": { "type": "string", "description": "Replacement text." }
        },
        "required": ["path", "old", "new"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests_support::test_ctx;

    #[tokio::test]
    async fn write_creates_parents() {
        let (_dir, ctx) = test_ctx();
        run_write(json!({"path": "a/b/c.txt", "content": "deep"}), &ctx)
            .await
            .unwrap();
        let text = std::fs::read_to_string(ctx.workspace.join("a/b/c.txt")).unwrap();
        assert_eq!(text, "deep");
    }

    #[tokio::test]
    async fn edit_replaces_first_occurrence() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(ctx.workspace.join("f.txt"), "one two one").unwrap();
        run_edit(
            json!({"path": "f.txt", "old": "one", "new": "three"}),
            &ctx,
        )
        .await
        .unwrap();
        let text = std::fs::read_to_string(ctx.workspace.join("f.txt")).unwrap();
        assert_eq!(text, "three two one");
    }

    #[tokio::test]
    async fn edit_reports_missing_old_text() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(ctx.workspace.join("f.txt"), "hello").unwrap();
        let out = run_edit(
            json!({"path": "f.txt", "old": "absent", "new": "x"}),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(out, "old content not found");
    }
}
