//! Built-in `read` tool — reads a file inside the workspace.

use serde_json::{json, Value};

use crate::tools::{sandbox_path, ToolCtx};

/// Read a file at a workspace-relative path.
///
/// Args: `{ "path": "…" }`. Returns the file contents as a string.
pub async fn run(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let raw = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("read: missing `path` argument"))?;

    let path = sandbox_path(&ctx.workspace, raw)?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| anyhow::anyhow!("read: cannot read {}: {e}", path.display()))?;

    Ok(Value::String(content))
}

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {
                "type": "string",
                "description": "Workspace-relative path to the file."
            }
        },
        "required": ["path"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests_support::test_ctx;

    #[tokio::test]
    async fn reads_workspace_file() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(ctx.workspace.join("notes.md"), "remember the milk").unwrap();
        let out = run(json!({"path": "notes.md"}), &ctx).await.unwrap();
        assert_eq!(out, "remember the milk");
    }

    #[tokio::test]
    async fn missing_file_errors() {
        let (_dir, ctx) = test_ctx();
        assert!(run(json!({"path": "absent.txt"}), &ctx).await.is_err());
    }

    #[tokio::test]
    async fn rejects_escape() {
        let (_dir, ctx) = test_ctx();
        assert!(run(json!({"path": "../secret"}), &ctx).await.is_err());
    }
}
