//! Built-in `list_secrets` tool — secret names only, never values.

use serde_json::{json, Value};

use crate::tools::ToolCtx;

/// List the key names found in the `.env` sidecar.
///
/// Args: `{}`. Returns a JSON array of names.
pub async fn run(_args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let Ok(contents) = tokio::fs::read_to_string(&ctx.env_path).await else {
        return Ok(Value::Array(Vec::new()));
    };
    let mut names = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, _)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !key.is_empty() {
            names.push(Value::String(key.to_string()));
        }
    }
    Ok(Value::Array(names))
}

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests_support::test_ctx;

    #[tokio::test]
    async fn lists_names_never_values() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(
            &ctx.env_path,
            "# comment\nOPENAI_API_KEY=sk-secret\nTELEGRAM_TOKEN=abc\n\nnot a pair\n",
        )
        .unwrap();

        let out = run(json!({}), &ctx).await.unwrap();
        let names: Vec<&str> = out
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(names, vec!["OPENAI_API_KEY", "TELEGRAM_TOKEN"]);
        assert!(!out.to_string().contains("sk-secret"));
    }

    #[tokio::test]
    async fn missing_env_file_is_empty() {
        let (_dir, ctx) = test_ctx();
        let out = run(json!({}), &ctx).await.unwrap();
        assert!(out.as_array().unwrap().is_empty());
    }
}
