//! Remote tools over streamable JSON-RPC (MCP-style servers).
//!
//! At startup each configured server is asked for its tool list via
//! `tools/list`; every discovered tool registers as
//! `MCP__<server>__<tool>`. Invocation posts `tools/call` and joins the
//! returned content parts. Unreachable servers are logged and skipped —
//! discovery never fails startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{McpServerConfig, ToolLimitsConfig};
use crate::tools::{ToolDescriptor, ToolOrigin, ToolRegistry};

const JSONRPC_VERSION: &str = "2.0";

/// Registry name for a remote tool.
pub fn remote_tool_name(server: &str, tool: &str) -> String {
    format!("MCP__{server}__{tool}")
}

/// One discovered remote tool.
#[derive(Debug, Clone)]
struct DiscoveredTool {
    name: String,
    description: String,
    input_schema: Value,
}

/// Discover and register the tools of every configured server.
///
/// Returns the number of tools registered. Per-server failures (network,
/// protocol, name collisions) are warnings, not errors.
pub async fn discover_and_register(
    registry: &ToolRegistry,
    servers: &[McpServerConfig],
    limits: &ToolLimitsConfig,
) -> usize {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "cannot build HTTP client for remote tools");
            return 0;
        }
    };

    let mut registered = 0usize;
    for server in servers {
        let tools = match discover_tools(&client, server).await {
            Ok(t) => t,
            Err(e) => {
                warn!(server = %server.name, error = %e, "remote tool server skipped");
                continue;
            }
        };
        for tool in tools {
            let descriptor = remote_descriptor(client.clone(), server, &tool, limits);
            match registry.register(descriptor) {
                Ok(()) => registered += 1,
                Err(e) => {
                    warn!(server = %server.name, tool = %tool.name, error = %e, "remote tool skipped");
                }
            }
        }
    }
    if registered > 0 {
        info!(count = registered, "remote tools registered");
    }
    registered
}

fn remote_descriptor(
    client: reqwest::Client,
    server: &McpServerConfig,
    tool: &DiscoveredTool,
    limits: &ToolLimitsConfig,
) -> ToolDescriptor {
    let url = server.url.clone();
    let headers = server.headers.clone();
    let tool_name = tool.name.clone();

    ToolDescriptor {
        name: remote_tool_name(&server.name, &tool.name),
        origin: ToolOrigin::Remote,
        description: tool.description.clone(),
        parameters: if tool.input_schema.is_object() {
            tool.input_schema.clone()
        } else {
            json!({"type": "object", "properties": {}})
        },
        timeout: Duration::from_secs(limits.timeout_seconds),
        max_output_bytes: limits.max_output_bytes,
        fingerprint: None,
        handler: Arc::new(move |args, _ctx| {
            let client = client.clone();
            let url = url.clone();
            let headers = headers.clone();
            let tool_name = tool_name.clone();
            Box::pin(async move {
                let result = rpc_call(
                    &client,
                    &url,
                    &headers,
                    "tools/call",
                    json!({ "name": tool_name, "arguments": args }),
                )
                .await?;

                // tools/call returns { content: [{type, text}, ...] }.
                let parts: Vec<String> = result
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|item| {
                                item.get("text")
                                    .and_then(Value::as_str)
                                    .map(String::from)
                                    .unwrap_or_else(|| item.to_string())
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Value::String(parts.join("\n")))
            })
        }),
    }
}

async fn discover_tools(
    client: &reqwest::Client,
    server: &McpServerConfig,
) -> anyhow::Result<Vec<DiscoveredTool>> {
    let result = rpc_call(client, &server.url, &server.headers, "tools/list", json!({})).await?;
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok(tools
        .iter()
        .map(|t| DiscoveredTool {
            name: t
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            description: t
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input_schema: t.get("inputSchema").cloned().unwrap_or(json!({})),
        })
        .filter(|t| !t.name.is_empty())
        .collect())
}

async fn rpc_call(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    method: &str,
    params: Value,
) -> anyhow::Result<Value> {
    let payload = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": 1,
        "method": method,
        "params": params,
    });

    let mut request = client.post(url).json(&payload);
    for (k, v) in headers {
        request = request.header(k, v);
    }

    let resp = request.send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("server returned {status}");
    }
    let body: Value = resp.json().await?;

    if let Some(err) = body.get("error") {
        anyhow::bail!(
            "rpc error {}: {}",
            err.get("code").and_then(Value::as_i64).unwrap_or(0),
            err.get("message").and_then(Value::as_str).unwrap_or("?")
        );
    }
    Ok(body.get("result").cloned().unwrap_or(json!({})))
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_names_use_reserved_prefix() {
        assert_eq!(remote_tool_name("search", "query"), "MCP__search__query");
    }

    #[tokio::test]
    async fn unreachable_server_is_skipped() {
        let registry = ToolRegistry::new();
        let servers = vec![McpServerConfig {
            name: "ghost".into(),
            url: "http://127.0.0.1:1/rpc".into(),
            headers: HashMap::new(),
        }];
        let n = discover_and_register(&registry, &servers, &ToolLimitsConfig::default()).await;
        assert_eq!(n, 0);
        assert_eq!(registry.len(), 0);
    }
}
