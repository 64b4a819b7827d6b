//! Built-in `run_python` tool — executes code in an isolated interpreter.
//!
//! Runs `python3 -I` (isolated mode: no user site, no env injection) as a
//! subprocess with the workspace as its working directory. The registry's
//! per-tool deadline bounds the child; the child is killed on timeout.

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use super::{truncate_output, MAX_TOOL_OUTPUT_CHARS};
use crate::tools::ToolCtx;

/// Execute Python code and return its printed output.
///
/// Args: `{ "code": "…" }`.
pub async fn run(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let code = args
        .get("code")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("run_python: missing `code` argument"))?;

    let mut child = tokio::process::Command::new("python3")
        .arg("-I")
        .arg("-")
        .current_dir(&ctx.workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("run_python: cannot spawn python3: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(code.as_bytes()).await?;
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let mut combined = stdout.trim_end().to_string();
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim_end());
    }
    if !output.status.success() && combined.is_empty() {
        combined = format!("exited with status {}", output.status);
    }

    Ok(Value::String(truncate_output(
        combined,
        MAX_TOOL_OUTPUT_CHARS,
    )))
}

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "code": { "type": "string", "description": "Python source to execute." }
        },
        "required": ["code"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests_support::test_ctx;

    #[tokio::test]
    async fn captures_stdout() {
        let (_dir, ctx) = test_ctx();
        let out = run(json!({"code": "print(2 + 3)"}), &ctx).await.unwrap();
        assert_eq!(out, "5");
    }

    #[tokio::test]
    async fn captures_errors() {
        let (_dir, ctx) = test_ctx();
        let out = run(json!({"code": "1/0"}), &ctx).await.unwrap();
        assert!(out.as_str().unwrap().contains("ZeroDivisionError"));
    }

    #[tokio::test]
    async fn runs_in_workspace_cwd() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(ctx.workspace.join("data.txt"), "42").unwrap();
        let out = run(
            json!({"code": "print(open('data.txt').read())"}),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(out, "42");
    }
}
