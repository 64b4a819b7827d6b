//! Error kinds shared across the runtime.
//!
//! One enum covers every failure family the runtime distinguishes; the
//! sub-kind enums carry the machine-readable classification that ends up
//! in `turn_finished` events and audit records.

use thiserror::Error;

/// Classification of model-provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    /// Worth retrying (timeouts, 429s, 5xx).
    Transient,
    /// Retrying will not help (auth failure, bad request).
    Permanent,
}

/// Classification of tool-invocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    NotFound,
    Schema,
    Execution,
    Timeout,
    OutputTooLarge,
}

/// Classification of registry mutation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryErrorKind {
    NameCollision,
    ReservedPrefix,
    LoadFailure,
}

/// Top-level error type for the runtime.
#[derive(Debug, Error)]
pub enum PithError {
    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("model error ({kind:?}): {detail}")]
    Model {
        kind: ModelErrorKind,
        detail: String,
    },

    #[error("tool error ({kind:?}): {detail}")]
    Tool { kind: ToolErrorKind, detail: String },

    #[error("registry error ({kind:?}): {detail}")]
    Registry {
        kind: RegistryErrorKind,
        detail: String,
    },

    #[error("assembled context exceeds the token budget")]
    ContextOverflow,

    #[error("session is busy with another turn")]
    Busy,

    #[error("deadline exceeded")]
    Timeout,

    #[error("channel error: {0}")]
    Channel(String),
}

impl PithError {
    /// Short machine-readable kind string used in events and audit lines.
    pub fn kind_str(&self) -> &'static str {
        match self {
            PithError::Config(_) => "config",
            PithError::Storage(_) => "storage",
            PithError::Model {
                kind: ModelErrorKind::Transient,
                ..
            } => "model_transient",
            PithError::Model {
                kind: ModelErrorKind::Permanent,
                ..
            } => "model_permanent",
            PithError::Tool { kind, .. } => match kind {
                ToolErrorKind::NotFound => "tool_not_found",
                ToolErrorKind::Schema => "tool_schema",
                ToolErrorKind::Execution => "tool_execution",
                ToolErrorKind::Timeout => "tool_timeout",
                ToolErrorKind::OutputTooLarge => "tool_output_too_large",
            },
            PithError::Registry { kind, .. } => match kind {
                RegistryErrorKind::NameCollision => "name_collision",
                RegistryErrorKind::ReservedPrefix => "reserved_prefix",
                RegistryErrorKind::LoadFailure => "load_failure",
            },
            PithError::ContextOverflow => "context_overflow",
            PithError::Busy => "busy",
            PithError::Timeout => "timeout",
            PithError::Channel(_) => "channel",
        }
    }

    /// True when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PithError::Model {
                kind: ModelErrorKind::Transient,
                ..
            }
        )
    }
}

impl From<rusqlite::Error> for PithError {
    fn from(e: rusqlite::Error) -> Self {
        PithError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for PithError {
    fn from(e: std::io::Error) -> Self {
        PithError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(
            PithError::Tool {
                kind: ToolErrorKind::Timeout,
                detail: "slow".into()
            }
            .kind_str(),
            "tool_timeout"
        );
        assert_eq!(
            PithError::Registry {
                kind: RegistryErrorKind::ReservedPrefix,
                detail: "MCP__x".into()
            }
            .kind_str(),
            "reserved_prefix"
        );
        assert_eq!(PithError::Busy.kind_str(), "busy");
    }

    #[test]
    fn transient_detection() {
        let t = PithError::Model {
            kind: ModelErrorKind::Transient,
            detail: "429".into(),
        };
        let p = PithError::Model {
            kind: ModelErrorKind::Permanent,
            detail: "401".into(),
        };
        assert!(t.is_transient());
        assert!(!p.is_transient());
        assert!(!PithError::Timeout.is_transient());
    }
}
