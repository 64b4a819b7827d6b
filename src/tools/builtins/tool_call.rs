//! Built-in `tool_call` — indirection for extension and remote tools.
//!
//! Exists so models can call dynamically registered tools even when the
//! provider does not surface them as first-class schemas. Refuses to call
//! itself; unknown names (including unregistered `MCP__…` names) surface
//! as not-found from the registry.

use serde_json::{json, Value};

use crate::tools::ToolCtx;

/// Re-enter registry dispatch with `{ "name": "…", "args?": {…} }`.
pub async fn run(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let name = args
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("tool_call: missing `name` argument"))?
        .to_string();
    if name == "tool_call" {
        anyhow::bail!("tool_call: refusing to call itself");
    }
    let inner_args = args.get("args").cloned().unwrap_or_else(|| json!({}));

    let registry = ctx.registry.clone();
    let result = registry
        .invoke(&name, inner_args, ctx.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(result)
}

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "description": "Registered tool name (extension or MCP__server__tool)." },
            "args": { "type": "object", "description": "Arguments for the target tool." }
        },
        "required": ["name"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests_support::test_ctx_with_registry;
    use crate::tools::{ToolDescriptor, ToolOrigin, ToolRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    fn echo_descriptor(name: &str, origin: ToolOrigin) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            origin,
            description: "echo".into(),
            parameters: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            timeout: Duration::from_secs(5),
            max_output_bytes: 4096,
            fingerprint: None,
            handler: Arc::new(|args, _ctx| {
                Box::pin(async move { Ok(args.get("text").cloned().unwrap_or(json!(""))) })
            }),
        }
    }

    #[tokio::test]
    async fn dispatches_to_extension_tool() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(echo_descriptor("echo", ToolOrigin::Extension))
            .unwrap();
        let (_dir, ctx) = test_ctx_with_registry(registry);

        let out = run(json!({"name": "echo", "args": {"text": "ok"}}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "ok");
    }

    #[tokio::test]
    async fn dispatches_to_remote_tool_when_registered() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(echo_descriptor("MCP__srv__echo", ToolOrigin::Remote))
            .unwrap();
        let (_dir, ctx) = test_ctx_with_registry(registry);

        let out = run(
            json!({"name": "MCP__srv__echo", "args": {"text": "remote"}}),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(out, "remote");
    }

    #[tokio::test]
    async fn refuses_recursion() {
        let (_dir, ctx) = test_ctx_with_registry(Arc::new(ToolRegistry::new()));
        let err = run(json!({"name": "tool_call"}), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[tokio::test]
    async fn unknown_remote_name_not_found() {
        let (_dir, ctx) = test_ctx_with_registry(Arc::new(ToolRegistry::new()));
        let err = run(json!({"name": "MCP__ghost__tool"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }
}
