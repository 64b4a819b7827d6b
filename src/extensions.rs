//! Extension tools: one Python file per tool under
//! `workspace/extensions/tools/`.
//!
//! There is no runtime code loader in the host process. Each file is a
//! declarative unit: the tool name is the file stem, the parameter schema
//! is derived from the typed signature of its `async def run(...)`
//! entrypoint, and the description from the entrypoint docstring.
//! Invocation executes the file in an isolated `python3 -I` subprocess,
//! passing arguments as JSON on stdin. Files that start with `_` are
//! helpers and are skipped.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use crate::config::ToolLimitsConfig;
use crate::error::{PithError, RegistryErrorKind};
use crate::tools::{
    Fingerprint, ToolCtx, ToolDescriptor, ToolOrigin, ToolRegistry, RESERVED_REMOTE_PREFIX,
};

static RUN_SIGNATURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)async\s+def\s+run\s*\(([^)]*)\)\s*(?:->\s*[^:]+)?:").expect("run signature regex")
});

static DOCSTRING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)^\s*(?:"""(.*?)"""|'''(.*?)''')"#).expect("docstring regex")
});

/// Python driver: loads the extension file, calls `run(**args)` with the
/// JSON object read from stdin, and prints the result.
const DRIVER: &str = r#"
import asyncio, importlib.util, inspect, json, sys
spec = importlib.util.spec_from_file_location("pith_extension", sys.argv[1])
mod = importlib.util.module_from_spec(spec)
spec.loader.exec_module(mod)
args = json.load(sys.stdin)
fn = mod.run
if inspect.iscoroutinefunction(fn):
    result = asyncio.run(fn(**args))
else:
    result = fn(**args)
print("" if result is None else str(result))
"#;

/// A successfully parsed extension file.
#[derive(Debug, Clone)]
pub struct ParsedExtension {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

/// Parse an extension file into name, description, and parameter schema.
///
/// Fails with `reserved_prefix` for `MCP__…` stems and `load_failure` when
/// the entrypoint or its schema cannot be extracted.
pub fn parse_extension_file(path: &Path) -> Result<ParsedExtension, PithError> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| load_failure(path, "unreadable file name"))?
        .to_string();

    if name.starts_with(RESERVED_REMOTE_PREFIX) {
        return Err(PithError::Registry {
            kind: RegistryErrorKind::ReservedPrefix,
            detail: format!("extension tool {name} uses the reserved {RESERVED_REMOTE_PREFIX} prefix"),
        });
    }

    let source = std::fs::read_to_string(path)
        .map_err(|e| load_failure(path, &format!("cannot read: {e}")))?;

    let captures = RUN_SIGNATURE_RE
        .captures(&source)
        .ok_or_else(|| load_failure(path, "no `async def run(...)` entrypoint"))?;
    let params_src = captures.get(1).map(|m| m.as_str()).unwrap_or("");
    let body_start = captures.get(0).map(|m| m.end()).unwrap_or(0);

    let parameters = schema_from_signature(params_src)
        .map_err(|detail| load_failure(path, &detail))?;

    let description = DOCSTRING_RE
        .captures(&source[body_start..])
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let metadata = std::fs::metadata(path)
        .map_err(|e| load_failure(path, &format!("cannot stat: {e}")))?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);

    Ok(ParsedExtension {
        name,
        description,
        parameters,
        path: path.to_path_buf(),
        fingerprint: Fingerprint {
            mtime_ms,
            content_hash: hasher.finish(),
        },
    })
}

fn load_failure(path: &Path, detail: &str) -> PithError {
    PithError::Registry {
        kind: RegistryErrorKind::LoadFailure,
        detail: format!("{}: {detail}", path.display()),
    }
}

/// Derive a JSON schema from the Python parameter list of `run`.
fn schema_from_signature(params_src: &str) -> Result<Value, String> {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for param in split_params(params_src) {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        if param.starts_with('*') {
            return Err(format!("unsupported parameter form `{param}`"));
        }

        let (head, default) = match split_top_level(param, '=') {
            Some((h, d)) => (h.trim(), Some(d.trim())),
            None => (param, None),
        };
        let (name, annotation) = match split_top_level(head, ':') {
            Some((n, a)) => (n.trim(), Some(a.trim())),
            None => (head, None),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(format!("cannot parse parameter `{param}`"));
        }

        let json_type = annotation.map(python_type_to_json).unwrap_or("string");
        properties.insert(name.to_string(), json!({ "type": json_type }));
        if default.is_none() {
            required.push(Value::String(name.to_string()));
        }
    }

    Ok(json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": Value::Array(required),
        "additionalProperties": false
    }))
}

/// Split a parameter list on commas at bracket depth zero.
fn split_params(src: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in src.chars() {
        match c {
            '[' | '(' | '{' => {
                depth += 1;
                current.push(c);
            }
            ']' | ')' | '}' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

/// Split once on `sep` at bracket depth zero.
fn split_top_level(src: &str, sep: char) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    for (i, c) in src.char_indices() {
        match c {
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                return Some((&src[..i], &src[i + c.len_utf8()..]));
            }
            _ => {}
        }
    }
    None
}

fn python_type_to_json(annotation: &str) -> &'static str {
    let base = annotation
        .split(['[', '|'])
        .next()
        .unwrap_or(annotation)
        .trim();
    match base {
        "str" => "string",
        "int" => "integer",
        "float" => "number",
        "bool" => "boolean",
        "list" => "array",
        "dict" => "object",
        _ => "string",
    }
}

/// Build an invocable descriptor for a parsed extension.
pub fn descriptor_for(parsed: &ParsedExtension, limits: &ToolLimitsConfig) -> ToolDescriptor {
    let path = parsed.path.clone();
    ToolDescriptor {
        name: parsed.name.clone(),
        origin: ToolOrigin::Extension,
        description: parsed.description.clone(),
        parameters: parsed.parameters.clone(),
        timeout: Duration::from_secs(limits.timeout_seconds),
        max_output_bytes: limits.max_output_bytes,
        fingerprint: Some(parsed.fingerprint),
        handler: Arc::new(move |args, ctx| {
            let path = path.clone();
            Box::pin(async move { invoke_subprocess(&path, args, &ctx).await })
        }),
    }
}

/// Run the extension file in an isolated interpreter subprocess.
async fn invoke_subprocess(path: &Path, args: Value, ctx: &ToolCtx) -> anyhow::Result<Value> {
    let mut child = tokio::process::Command::new("python3")
        .arg("-I")
        .arg("-c")
        .arg(DRIVER)
        .arg(path)
        .current_dir(&ctx.workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("cannot spawn python3: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(args.to_string().as_bytes()).await?;
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "extension exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Value::String(stdout.trim_end().to_string()))
}

/// Load (or reload) one extension file into the registry.
///
/// On success the descriptor is swapped in atomically. On failure the
/// previous descriptor, if any, is retained and the error returned.
pub fn load_file(
    registry: &ToolRegistry,
    path: &Path,
    limits: &ToolLimitsConfig,
) -> Result<String, PithError> {
    let parsed = parse_extension_file(path)?;

    // Unchanged source: keep the existing descriptor.
    if let Some(existing) = registry.get(&parsed.name) {
        if existing.fingerprint == Some(parsed.fingerprint) {
            return Ok(parsed.name);
        }
    }

    registry.swap_extension(descriptor_for(&parsed, limits))?;
    Ok(parsed.name)
}

/// Scan the extensions directory and load every eligible file.
///
/// Returns `(path, result)` per file so the caller can audit and emit
/// reload-failure events; a missing directory is an empty scan.
pub fn scan_dir(
    registry: &ToolRegistry,
    tools_dir: &Path,
    limits: &ToolLimitsConfig,
) -> Vec<(PathBuf, Result<String, PithError>)> {
    let mut results = Vec::new();
    let Ok(entries) = std::fs::read_dir(tools_dir) else {
        return results;
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_tool_source(p))
        .collect();
    paths.sort();

    for path in paths {
        let result = load_file(registry, &path, limits);
        results.push((path, result));
    }
    results
}

/// True for `*.py` files whose stem does not start with `_`.
pub fn is_tool_source(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("py")
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| !s.starts_with('_'))
            .unwrap_or(false)
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tool(dir: &Path, name: &str, source: &str) -> PathBuf {
        let path = dir.join(format!("{name}.py"));
        std::fs::write(&path, source).unwrap();
        path
    }

    const ECHO: &str = r#"
async def run(text: str) -> str:
    """Echo the given text back."""
    return text
"#;

    #[test]
    fn parses_typed_signature_and_docstring() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tool(dir.path(), "echo", ECHO);
        let parsed = parse_extension_file(&path).unwrap();

        assert_eq!(parsed.name, "echo");
        assert_eq!(parsed.description, "Echo the given text back.");
        assert_eq!(parsed.parameters["properties"]["text"]["type"], "string");
        assert_eq!(parsed.parameters["required"][0], "text");
    }

    #[test]
    fn parses_defaults_and_mixed_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tool(
            dir.path(),
            "mixer",
            r#"
async def run(count: int, ratio: float = 0.5, deep: bool = False, items: list[str] = None):
    """Mix things."""
    return count
"#,
        );
        let parsed = parse_extension_file(&path).unwrap();
        let props = &parsed.parameters["properties"];
        assert_eq!(props["count"]["type"], "integer");
        assert_eq!(props["ratio"]["type"], "number");
        assert_eq!(props["deep"]["type"], "boolean");
        assert_eq!(props["items"]["type"], "array");
        let required = parsed.parameters["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "count");
    }

    #[test]
    fn missing_entrypoint_is_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tool(dir.path(), "broken", "def other():\n    pass\n");
        let err = parse_extension_file(&path).unwrap_err();
        assert!(matches!(
            err,
            PithError::Registry {
                kind: RegistryErrorKind::LoadFailure,
                ..
            }
        ));
    }

    #[test]
    fn reserved_prefix_stem_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tool(dir.path(), "MCP__x", ECHO);
        let err = parse_extension_file(&path).unwrap_err();
        assert!(matches!(
            err,
            PithError::Registry {
                kind: RegistryErrorKind::ReservedPrefix,
                ..
            }
        ));
    }

    #[test]
    fn starred_params_are_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tool(
            dir.path(),
            "vararg",
            "async def run(*args):\n    return ''\n",
        );
        assert!(parse_extension_file(&path).is_err());
    }

    #[test]
    fn helper_files_are_skipped_by_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_tool(dir.path(), "echo", ECHO);
        write_tool(dir.path(), "_helpers", "def util():\n    pass\n");
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();

        let registry = ToolRegistry::new();
        let results = scan_dir(&registry, dir.path(), &ToolLimitsConfig::default());
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert!(registry.get("echo").is_some());
        assert!(registry.get("_helpers").is_none());
    }

    #[test]
    fn scan_reports_reserved_prefix_and_keeps_registry_size() {
        let dir = tempfile::tempdir().unwrap();
        write_tool(dir.path(), "MCP__x", ECHO);

        let registry = ToolRegistry::new();
        let results = scan_dir(&registry, dir.path(), &ToolLimitsConfig::default());
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0].1.as_ref().unwrap_err(),
            PithError::Registry {
                kind: RegistryErrorKind::ReservedPrefix,
                ..
            }
        ));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn reload_with_unchanged_source_keeps_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tool(dir.path(), "echo", ECHO);
        let registry = ToolRegistry::new();
        let limits = ToolLimitsConfig::default();

        load_file(&registry, &path, &limits).unwrap();
        let first = registry.get("echo").unwrap();
        load_file(&registry, &path, &limits).unwrap();
        let second = registry.get("echo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn reload_failure_retains_previous_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tool(dir.path(), "echo", ECHO);
        let registry = ToolRegistry::new();
        let limits = ToolLimitsConfig::default();
        load_file(&registry, &path, &limits).unwrap();

        // Break the file; reload fails but the old descriptor stays.
        std::fs::write(&path, "def run_is_gone():\n    pass\n").unwrap();
        assert!(load_file(&registry, &path, &limits).is_err());
        assert!(registry.get("echo").is_some());
    }

    #[tokio::test]
    async fn subprocess_invocation_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tool(dir.path(), "echo", ECHO);
        let parsed = parse_extension_file(&path).unwrap();
        let descriptor = descriptor_for(&parsed, &ToolLimitsConfig::default());

        let registry = Arc::new(ToolRegistry::new());
        registry.register(descriptor).unwrap();
        let (_ws, ctx) = crate::tools::tests_support::test_ctx_with_registry(registry.clone());

        let out = registry
            .invoke("echo", serde_json::json!({"text": "ok"}), ctx)
            .await
            .unwrap();
        assert_eq!(out, "ok");
    }
}
