//! pith — a single-user, self-extending conversational agent runtime.
//!
//! A long-running server owns a [`runtime::Runtime`] that, for each
//! inbound user message, assembles a structured prompt, streams a model
//! response, dispatches tool calls against a hot-reloadable registry, and
//! persists conversation and memory state in an embedded SQLite store.
//! The agent can author new tool files on disk which become callable in
//! subsequent turns without a restart.
//!
//! This library crate re-exports the modules so integration tests (under
//! `tests/`) can drive them directly.

pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod extensions;
pub mod mcp;
pub mod models;
pub mod runtime;
pub mod server;
pub mod store;
pub mod tools;
pub mod watcher;
