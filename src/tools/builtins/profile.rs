//! Built-in `set_profile` tool — writes agent/user identity fields.

use serde_json::{json, Value};

use crate::tools::ToolCtx;

/// Set a profile field.
///
/// Args: `{ "profile_type": "agent"|"user", "key": "…", "value": "…" }`.
/// Every write is recorded as a `profile_update` audit event.
pub async fn run(args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let profile_type = args
        .get("profile_type")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("set_profile: missing `profile_type` argument"))?;
    if profile_type != "agent" && profile_type != "user" {
        return Ok(Value::String(
            "profile_type must be 'agent' or 'user'".to_string(),
        ));
    }
    let key = args
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("set_profile: missing `key` argument"))?;
    let value = args
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("set_profile: missing `value` argument"))?;

    ctx.store.set_profile(profile_type, key, value)?;
    ctx.store.log_event(
        "profile_update",
        "info",
        &json!({ "profile_type": profile_type, "key": key }),
    )?;

    Ok(Value::String(format!(
        "profile_set:{profile_type}.{key}={value}"
    )))
}

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "profile_type": { "type": "string", "description": "'agent' or 'user'." },
            "key": { "type": "string", "description": "Field name (e.g. 'name', 'timezone')." },
            "value": { "type": "string", "description": "Field value." }
        },
        "required": ["profile_type", "key", "value"],
        "additionalProperties": false
    })
}
