//! Tool registry and invocation pipeline.
//!
//! One map `name → descriptor` covers built-in, extension, and remote
//! tools. Registration enforces the namespace rules: the `MCP__` prefix is
//! reserved for remote tools, and a name can exist at most once — built-ins
//! can never be shadowed.
//!
//! [`ToolRegistry::invoke`] validates arguments against the declared
//! schema, runs the handler under the per-tool deadline, and caps the
//! serialised output size.

pub mod builtins;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::error::{PithError, RegistryErrorKind, ToolErrorKind};
use crate::models::ToolSchema;
use crate::store::Store;

/// Names beginning with this prefix are reserved for remote tools.
pub const RESERVED_REMOTE_PREFIX: &str = "MCP__";

/// Where a tool came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    Builtin,
    Extension,
    Remote,
}

/// Source identity of an extension file, used to skip no-op reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime_ms: u64,
    pub content_hash: u64,
}

/// Per-call context handed to every tool handler.
#[derive(Clone)]
pub struct ToolCtx {
    /// Sandbox root for file operations.
    pub workspace: PathBuf,
    pub store: Arc<Store>,
    /// Registry handle so `tool_call` can re-enter dispatch.
    pub registry: Arc<ToolRegistry>,
    /// `.env` sidecar consulted by `list_secrets` (names only).
    pub env_path: PathBuf,
    /// Recency weight forwarded to memory search.
    pub memory_recency_weight: f64,
}

/// Async tool handler.
pub type ToolHandler = Arc<
    dyn Fn(Value, ToolCtx) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// A registered, invocable tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub origin: ToolOrigin,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    /// Set for extension tools only.
    pub fingerprint: Option<Fingerprint>,
    pub handler: ToolHandler,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Registry summary for `/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub builtin: usize,
    pub extension: usize,
    pub remote: usize,
}

/// Unified tool registry.
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, Arc<ToolDescriptor>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ToolDescriptor>>> {
        self.entries.read().expect("tool registry poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ToolDescriptor>>> {
        self.entries.write().expect("tool registry poisoned")
    }

    /// Register a new tool. Fails loudly on any name collision; extension
    /// names may not use the reserved remote prefix.
    pub fn register(&self, descriptor: ToolDescriptor) -> Result<(), PithError> {
        if descriptor.origin == ToolOrigin::Extension
            && descriptor.name.starts_with(RESERVED_REMOTE_PREFIX)
        {
            return Err(PithError::Registry {
                kind: RegistryErrorKind::ReservedPrefix,
                detail: format!(
                    "extension tool {} uses the reserved {RESERVED_REMOTE_PREFIX} prefix",
                    descriptor.name
                ),
            });
        }
        let mut entries = self.write();
        if entries.contains_key(&descriptor.name) {
            return Err(PithError::Registry {
                kind: RegistryErrorKind::NameCollision,
                detail: format!("tool {} is already registered", descriptor.name),
            });
        }
        entries.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Swap (or insert) an extension descriptor atomically.
    ///
    /// Replacing an existing *extension* entry is the hot-reload path;
    /// colliding with a built-in or remote tool is refused and the old
    /// descriptor stays.
    pub fn swap_extension(&self, descriptor: ToolDescriptor) -> Result<(), PithError> {
        if descriptor.origin != ToolOrigin::Extension {
            return Err(PithError::Registry {
                kind: RegistryErrorKind::LoadFailure,
                detail: "swap_extension only accepts extension descriptors".into(),
            });
        }
        if descriptor.name.starts_with(RESERVED_REMOTE_PREFIX) {
            return Err(PithError::Registry {
                kind: RegistryErrorKind::ReservedPrefix,
                detail: format!(
                    "extension tool {} uses the reserved {RESERVED_REMOTE_PREFIX} prefix",
                    descriptor.name
                ),
            });
        }
        let mut entries = self.write();
        if let Some(existing) = entries.get(&descriptor.name) {
            if existing.origin != ToolOrigin::Extension {
                return Err(PithError::Registry {
                    kind: RegistryErrorKind::NameCollision,
                    detail: format!(
                        "extension tool {} collides with a {:?} tool",
                        descriptor.name, existing.origin
                    ),
                });
            }
        }
        entries.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Remove an extension descriptor (file deleted). Returns true when an
    /// extension entry was removed; other origins are left untouched.
    pub fn remove_extension(&self, name: &str) -> bool {
        let mut entries = self.write();
        match entries.get(name) {
            Some(d) if d.origin == ToolOrigin::Extension => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Sorted tool names, optionally filtered by origin.
    pub fn names(&self, origin: Option<ToolOrigin>) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .values()
            .filter(|d| origin.map(|o| d.origin == o).unwrap_or(true))
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Name and description pairs for prompt awareness lists.
    pub fn descriptions(&self, origin: ToolOrigin) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .read()
            .values()
            .filter(|d| d.origin == origin)
            .map(|d| (d.name.clone(), d.description.clone()))
            .collect();
        out.sort();
        out
    }

    /// Schemas for every registered tool, sorted by name, in the shape the
    /// model layer expects.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .read()
            .values()
            .map(|d| ToolSchema {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.parameters.clone(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn summary(&self) -> RegistrySummary {
        let entries = self.read();
        let count = |o: ToolOrigin| entries.values().filter(|d| d.origin == o).count();
        RegistrySummary {
            total: entries.len(),
            builtin: count(ToolOrigin::Builtin),
            extension: count(ToolOrigin::Extension),
            remote: count(ToolOrigin::Remote),
        }
    }

    /// Look up, validate, run, and cap a tool call.
    pub async fn invoke(&self, name: &str, args: Value, ctx: ToolCtx) -> Result<Value, PithError> {
        let descriptor = self.get(name).ok_or_else(|| PithError::Tool {
            kind: ToolErrorKind::NotFound,
            detail: format!("unknown tool: {name}"),
        })?;

        let args = validate_args(&descriptor.parameters, args).map_err(|detail| {
            PithError::Tool {
                kind: ToolErrorKind::Schema,
                detail: format!("{name}: {detail}"),
            }
        })?;

        let fut = (descriptor.handler)(args, ctx);
        let result = tokio::time::timeout(descriptor.timeout, fut)
            .await
            .map_err(|_| PithError::Tool {
                kind: ToolErrorKind::Timeout,
                detail: format!(
                    "{name} exceeded its {}s deadline",
                    descriptor.timeout.as_secs()
                ),
            })?
            .map_err(|e| PithError::Tool {
                kind: ToolErrorKind::Execution,
                detail: format!("{e:#}"),
            })?;

        let size = result.to_string().len();
        if size > descriptor.max_output_bytes {
            return Err(PithError::Tool {
                kind: ToolErrorKind::OutputTooLarge,
                detail: format!(
                    "{name} produced {size} bytes (cap {})",
                    descriptor.max_output_bytes
                ),
            });
        }
        Ok(result)
    }
}

// ── Argument validation ──────────────────────────────────────

/// Validate `args` against a JSON-Schema-shaped `parameters` object,
/// coercing string values to numbers/booleans where unambiguous. Returns
/// the (possibly coerced) args or a human-readable problem description.
pub fn validate_args(schema: &Value, args: Value) -> Result<Value, String> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(args);
    };
    let mut obj = match args {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => return Err(format!("arguments must be an object, got {other}")),
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required {
            let Some(field) = field.as_str() else { continue };
            if !obj.contains_key(field) {
                return Err(format!("missing required argument `{field}`"));
            }
        }
    }

    for (key, value) in obj.iter_mut() {
        let Some(expected) = properties
            .get(key)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if let Some(coerced) = coerce(value, expected) {
            *value = coerced;
        } else {
            return Err(format!(
                "argument `{key}` should be {expected}, got {value}"
            ));
        }
    }

    Ok(Value::Object(obj))
}

/// Returns the value coerced to `expected`, or None on a hard mismatch.
fn coerce(value: &Value, expected: &str) -> Option<Value> {
    match (expected, value) {
        ("string", Value::String(_)) => Some(value.clone()),
        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => Some(value.clone()),
        ("integer", Value::Number(n)) => {
            let f = n.as_f64()?;
            (f.fract() == 0.0).then(|| Value::from(f as i64))
        }
        ("integer", Value::String(s)) => s.parse::<i64>().ok().map(Value::from),
        ("number", Value::Number(_)) => Some(value.clone()),
        ("number", Value::String(s)) => s.parse::<f64>().ok().and_then(|f| {
            serde_json::Number::from_f64(f).map(Value::Number)
        }),
        ("boolean", Value::Bool(_)) => Some(value.clone()),
        ("boolean", Value::String(s)) => match s.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        ("array", Value::Array(_)) => Some(value.clone()),
        ("object", Value::Object(_)) => Some(value.clone()),
        _ => None,
    }
}

// ── Workspace sandboxing ─────────────────────────────────────

/// Resolve `raw` against `workspace` and ensure the result stays inside.
/// Absolute paths and `..` components are rejected outright.
pub(crate) fn sandbox_path(workspace: &Path, raw: &str) -> anyhow::Result<PathBuf> {
    if Path::new(raw).is_absolute() {
        anyhow::bail!("absolute paths are not allowed: {raw}");
    }
    if raw.split(['/', '\\']).any(|c| c == "..") {
        anyhow::bail!("path traversal ('..') is not allowed: {raw}");
    }

    let candidate = workspace.join(raw);
    let ws_canon = workspace
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("workspace canonicalize failed: {e}"))?;
    let resolved = canon_or_resolve(&candidate)?;

    if !resolved.starts_with(&ws_canon) {
        anyhow::bail!(
            "path escapes workspace: {} is not under {}",
            resolved.display(),
            ws_canon.display()
        );
    }
    Ok(resolved)
}

/// Canonicalize the longest existing prefix, then re-append the tail so
/// not-yet-created files (write targets) still resolve.
pub(crate) fn canon_or_resolve(p: &Path) -> anyhow::Result<PathBuf> {
    if p.exists() {
        return Ok(p.canonicalize()?);
    }
    let mut existing = p.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        if let Some(file) = existing.file_name() {
            tail.push(file.to_os_string());
        } else {
            anyhow::bail!("cannot resolve path: {}", p.display());
        }
        existing = existing
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cannot resolve path: {}", p.display()))?
            .to_path_buf();
    }
    let mut resolved = existing.canonicalize()?;
    for component in tail.into_iter().rev() {
        resolved.push(component);
    }
    Ok(resolved)
}

// ── Test support ─────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Fresh ToolCtx over a tempdir workspace and empty registry.
    pub(crate) fn test_ctx() -> (tempfile::TempDir, ToolCtx) {
        test_ctx_with_registry(Arc::new(ToolRegistry::new()))
    }

    /// Fresh ToolCtx wired to a caller-supplied registry.
    pub(crate) fn test_ctx_with_registry(
        registry: Arc<ToolRegistry>,
    ) -> (tempfile::TempDir, ToolCtx) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let store = Arc::new(Store::open(&dir.path().join("memory.db")).unwrap());
        let ctx = ToolCtx {
            workspace,
            store,
            registry,
            env_path: dir.path().join(".env"),
            memory_recency_weight: 0.1,
        };
        (dir, ctx)
    }
}

// ── Tests ────────────────────────────────────────────────────
