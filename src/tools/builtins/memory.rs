//! Built-in `memory_save` and `memory_search` tools.

use serde_json::{json, Value};

use crate::tools::ToolCtx;

/// Persist a memory entry.
///
/// Args: `{ "content": "…", "kind?": "durable"|"episodic", "tags?": [...] }`.
/// Returns `memory_saved:<id>`.
pub async fn run_save(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("memory_save: missing `content` argument"))?;
    let kind = args
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("durable");
    if kind != "durable" && kind != "episodic" {
        anyhow::bail!("memory_save: kind must be 'durable' or 'episodic'");
    }
    let tags: Vec<String> = args
        .get("tags")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let id = ctx.store.save_memory(content, kind, &tags, "tool")?;
    Ok(Value::String(format!("memory_saved:{id}")))
}

/// Search stored memories by query.
///
/// Args: `{ "query": "…", "limit?": 8 }`. Returns a JSON array of entries.
pub async fn run_search(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let query = args
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("memory_search: missing `query` argument"))?;
    let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(8) as usize;

    let records = ctx
        .store
        .search_memory(query, limit, ctx.memory_recency_weight)?;
    let payload: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "content": r.content,
                "kind": r.kind,
                "tags": r.tags,
                "source": r.source,
            })
        })
        .collect();
    Ok(Value::Array(payload))
}

pub fn save_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "content": { "type": "string", "description": "The fact or note to remember." },
            "kind": { "type": "string", "description": "'durable' for lasting facts, 'episodic' for recent context. Defaults to 'durable'." },
            "tags": { "type": "array", "description": "Optional tag strings for retrieval." }
        },
        "required": ["content"],
        "additionalProperties": false
    })
}

pub fn search_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": "Full-text query." },
            "limit": { "type": "integer", "description": "Max entries to return. Defaults to 8." }
        },
        "required": ["query"],
        "additionalProperties": false
    })
}
