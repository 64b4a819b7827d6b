//! Operator configuration loading.
//!
//! The config file is YAML, located via `PITH_CONFIG` or the default
//! `~/.config/pith/config.yaml`. String values support `${VAR}`
//! substitution from the process environment. A `.env` sidecar next to the
//! config file is loaded into the environment at startup (existing
//! variables win). Workspace paths are derived from the config directory
//! unless overridden.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PithError;

static ENV_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var regex"));

/// Default config path: `~/.config/pith/config.yaml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pith")
        .join("config.yaml")
}

/// Resolve the config path from `PITH_CONFIG` or the default location.
pub fn resolve_config_path() -> PathBuf {
    match std::env::var("PITH_CONFIG") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => default_config_path(),
    }
}

// ── Config sections ──────────────────────────────────────────

/// Derived runtime paths and tuning knobs.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RuntimeConfig {
    /// Root of agent-visible files. Defaults to `<config_dir>/workspace`.
    #[serde(default)]
    pub workspace_path: Option<String>,
    /// Store backing file. Defaults to `<config_dir>/memory.db`.
    #[serde(default)]
    pub memory_db_path: Option<String>,
    /// JSONL audit log directory. Defaults to `<workspace>/.pith/logs`.
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub tool: ToolLimitsConfig,
}

/// Context-assembly tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextConfig {
    /// Recent-message window size N.
    #[serde(default = "default_window_messages")]
    pub window_messages: usize,
    /// Top-K memories retrieved per turn.
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
    /// Token budget for the assembled prompt.
    #[serde(default = "default_window_budget_tokens")]
    pub window_budget_tokens: usize,
    /// Recency weight for memory ranking (relevance dominates by default).
    #[serde(default = "default_recency_weight")]
    pub memory_recency_weight: f64,
}

fn default_window_messages() -> usize {
    40
}
fn default_memory_top_k() -> usize {
    5
}
fn default_window_budget_tokens() -> usize {
    24_000
}
fn default_recency_weight() -> f64 {
    0.1
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_messages: default_window_messages(),
            memory_top_k: default_memory_top_k(),
            window_budget_tokens: default_window_budget_tokens(),
            memory_recency_weight: default_recency_weight(),
        }
    }
}

/// Turn-orchestration limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TurnConfig {
    /// Tool-call loop cap per turn.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Total-turn deadline in seconds.
    #[serde(default = "default_turn_deadline")]
    pub deadline_seconds: u64,
    /// Compaction trigger: message count per session.
    #[serde(default = "default_compact_after_messages")]
    pub compact_after_messages: usize,
    /// Compaction trigger: summed token estimate per session.
    #[serde(default = "default_compact_after_tokens")]
    pub compact_after_tokens: i64,
}

fn default_max_tool_iterations() -> usize {
    16
}
fn default_turn_deadline() -> u64 {
    300
}
fn default_compact_after_messages() -> usize {
    200
}
fn default_compact_after_tokens() -> i64 {
    100_000
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            deadline_seconds: default_turn_deadline(),
            compact_after_messages: default_compact_after_messages(),
            compact_after_tokens: default_compact_after_tokens(),
        }
    }
}

/// Per-tool invocation limits (overridable per tool at registration).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolLimitsConfig {
    /// Default per-tool deadline in seconds.
    #[serde(default = "default_tool_timeout")]
    pub timeout_seconds: u64,
    /// Deadline for the built-in file tools.
    #[serde(default = "default_file_tool_timeout")]
    pub file_timeout_seconds: u64,
    /// Output cap in bytes for any single tool result.
    #[serde(default = "default_tool_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_tool_timeout() -> u64 {
    30
}
fn default_file_tool_timeout() -> u64 {
    5
}
fn default_tool_output_bytes() -> usize {
    64 * 1024
}

impl Default for ToolLimitsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_tool_timeout(),
            file_timeout_seconds: default_file_tool_timeout(),
            max_output_bytes: default_tool_output_bytes(),
        }
    }
}

/// Language-model provider settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Provider identifier (e.g. "openai").
    pub provider: String,
    /// Model name to request.
    pub model: String,
    /// Name of the env var holding the API key — the key itself is never
    /// written to disk.
    pub api_key_env: String,
    /// Optional non-default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-model-call deadline in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,
}

fn default_temperature() -> f32 {
    0.2
}
fn default_model_timeout() -> u64 {
    120
}

/// HTTP API listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// A remote tool server reachable over streamable JSON-RPC.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Remote tool configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// Channel connector settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

/// Telegram long-poll channel config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    /// Env var holding the bot token.
    pub bot_token_env: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    /// Read, expand, parse and validate a config file.
    ///
    /// Loads the `.env` sidecar next to the file first so `${VAR}`
    /// references can resolve against it.
    pub fn load(path: &Path) -> Result<Config, PithError> {
        let config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        load_env_sidecar(&config_dir.join(".env"));

        let raw = std::fs::read_to_string(path)
            .map_err(|e| PithError::Config(format!("cannot read {}: {e}", path.display())))?;
        let expanded = expand_env_vars(&raw);

        let mut cfg: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| PithError::Config(format!("cannot parse {}: {e}", path.display())))?;

        cfg.apply_derived_paths(&config_dir);
        cfg.validate()?;

        tracing::debug!(
            path = %path.display(),
            workspace = %cfg.workspace_path().display(),
            "configuration loaded"
        );

        Ok(cfg)
    }

    /// Fill in unset paths from the config directory.
    fn apply_derived_paths(&mut self, config_dir: &Path) {
        if self.runtime.workspace_path.is_none() {
            self.runtime.workspace_path =
                Some(config_dir.join("workspace").to_string_lossy().to_string());
        }
        if self.runtime.memory_db_path.is_none() {
            self.runtime.memory_db_path =
                Some(config_dir.join("memory.db").to_string_lossy().to_string());
        }
        if self.runtime.log_dir.is_none() {
            self.runtime.log_dir = Some(
                self.workspace_path()
                    .join(".pith")
                    .join("logs")
                    .to_string_lossy()
                    .to_string(),
            );
        }
    }

    /// Validate semantic constraints serde cannot enforce.
    fn validate(&self) -> Result<(), PithError> {
        if self.version != 1 {
            return Err(PithError::Config(format!(
                "unsupported config version {} (expected 1)",
                self.version
            )));
        }
        for required in [
            ("model.provider", &self.model.provider),
            ("model.model", &self.model.model),
            ("model.api_key_env", &self.model.api_key_env),
        ] {
            if required.1.trim().is_empty() {
                return Err(PithError::Config(format!("{} is required", required.0)));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.mcp.servers {
            if server.name.trim().is_empty() || server.url.trim().is_empty() {
                return Err(PithError::Config(
                    "mcp.servers entries need both name and url".into(),
                ));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(PithError::Config(format!(
                    "duplicate mcp server name: {}",
                    server.name
                )));
            }
        }
        Ok(())
    }

    pub fn workspace_path(&self) -> PathBuf {
        PathBuf::from(self.runtime.workspace_path.as_deref().unwrap_or("workspace"))
    }

    pub fn memory_db_path(&self) -> PathBuf {
        PathBuf::from(self.runtime.memory_db_path.as_deref().unwrap_or("memory.db"))
    }

    pub fn log_dir(&self) -> PathBuf {
        match self.runtime.log_dir.as_deref() {
            Some(d) => PathBuf::from(d),
            None => self.workspace_path().join(".pith").join("logs"),
        }
    }

    /// Extension tool sources: `<workspace>/extensions/tools`.
    pub fn extensions_tools_dir(&self) -> PathBuf {
        self.workspace_path().join("extensions").join("tools")
    }

    /// Extension channel sources: `<workspace>/extensions/channels`.
    pub fn extensions_channels_dir(&self) -> PathBuf {
        self.workspace_path().join("extensions").join("channels")
    }
}

/// Replace `${VAR}` with the environment value; unknown vars are left as-is.
pub fn expand_env_vars(raw: &str) -> String {
    ENV_VAR_RE
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Load `KEY=VALUE` lines from a `.env` file into the process environment.
/// Existing variables are not overridden.
fn load_env_sidecar(path: &Path) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if !key.is_empty() && std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: 1
model:
  provider: openai
  model: gpt-4o-mini
  api_key_env: OPENAI_API_KEY
"#;

    fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), MINIMAL);
        let cfg = Config::load(&path).unwrap();

        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.model.provider, "openai");
        assert_eq!(cfg.server.port, 8420);
        assert_eq!(cfg.runtime.context.window_messages, 40);
        assert_eq!(cfg.runtime.context.memory_top_k, 5);
        assert_eq!(cfg.runtime.turn.max_tool_iterations, 16);
        assert_eq!(cfg.workspace_path(), tmp.path().join("workspace"));
        assert_eq!(cfg.memory_db_path(), tmp.path().join("memory.db"));
        assert!(cfg.log_dir().ends_with(".pith/logs"));
    }

    #[test]
    fn missing_model_section_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "version: 1\n");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, PithError::Config(_)));
    }

    #[test]
    fn wrong_version_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let yaml = MINIMAL.replace("version: 1", "version: 2");
        let path = write_config(tmp.path(), &yaml);
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn env_var_expansion() {
        std::env::set_var("PITH_TEST_URL", "http://example.test/rpc");
        let expanded = expand_env_vars("url: ${PITH_TEST_URL}\nother: ${PITH_TEST_MISSING}");
        assert!(expanded.contains("http://example.test/rpc"));
        // Unknown vars stay verbatim.
        assert!(expanded.contains("${PITH_TEST_MISSING}"));
    }

    #[test]
    fn mcp_servers_parse_with_headers() {
        let tmp = tempfile::tempdir().unwrap();
        let yaml = format!(
            "{MINIMAL}mcp:\n  servers:\n    - name: search\n      url: http://localhost:9000/rpc\n      headers:\n        Authorization: Bearer abc\n"
        );
        let path = write_config(tmp.path(), &yaml);
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.mcp.servers.len(), 1);
        assert_eq!(cfg.mcp.servers[0].name, "search");
        assert_eq!(
            cfg.mcp.servers[0].headers.get("Authorization").unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn duplicate_mcp_server_names_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let yaml = format!(
            "{MINIMAL}mcp:\n  servers:\n    - name: a\n      url: http://x/\n    - name: a\n      url: http://y/\n"
        );
        let path = write_config(tmp.path(), &yaml);
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn env_sidecar_loaded_without_override() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(".env"),
            "PITH_TEST_SIDECAR=from_file\nPITH_TEST_EXISTING=from_file\n",
        )
        .unwrap();
        std::env::set_var("PITH_TEST_EXISTING", "from_env");

        let path = write_config(tmp.path(), MINIMAL);
        Config::load(&path).unwrap();

        assert_eq!(std::env::var("PITH_TEST_SIDECAR").unwrap(), "from_file");
        assert_eq!(std::env::var("PITH_TEST_EXISTING").unwrap(), "from_env");
    }
}
