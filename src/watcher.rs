//! Hot-reload of extension tools via filesystem events.
//!
//! Watches `workspace/extensions/tools/`: create/modify/rename re-parses
//! the affected file and swaps its descriptor atomically; delete removes
//! it. A failed load keeps the previous descriptor, records an
//! `extension_reload` audit event, and publishes a `reload_failure` event.
//! The runtime stays alive through every outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ToolLimitsConfig;
use crate::error::PithError;
use crate::events::{EventBus, TurnEvent};
use crate::extensions;
use crate::store::Store;
use crate::tools::ToolRegistry;

/// Running watcher; dropping it stops event delivery.
pub struct ExtensionWatcher {
    _watcher: notify::RecommendedWatcher,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Start watching the extension tools directory.
pub fn spawn_extension_watcher(
    registry: Arc<ToolRegistry>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    tools_dir: PathBuf,
    limits: ToolLimitsConfig,
) -> Result<ExtensionWatcher, PithError> {
    std::fs::create_dir_all(&tools_dir)
        .map_err(|e| PithError::Config(format!("cannot create {}: {e}", tools_dir.display())))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<NotifyEvent>();

    let mut watcher = notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
        match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "extension watcher error"),
        }
    })
    .map_err(|e| PithError::Config(format!("cannot create file watcher: {e}")))?;

    watcher
        .watch(&tools_dir, RecursiveMode::NonRecursive)
        .map_err(|e| {
            PithError::Config(format!("cannot watch {}: {e}", tools_dir.display()))
        })?;

    info!(dir = %tools_dir.display(), "extension watcher started");

    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            );
            if !relevant {
                continue;
            }
            for path in &event.paths {
                if !extensions::is_tool_source(path) {
                    continue;
                }
                apply_change(&registry, &store, &bus, path, &limits);
            }
        }
        debug!("extension watcher task exiting");
    });

    Ok(ExtensionWatcher {
        _watcher: watcher,
        handle,
    })
}

/// React to a single file change. Shared by the watcher task and tests so
/// the reload semantics can be exercised without real fs event timing.
pub fn apply_change(
    registry: &Arc<ToolRegistry>,
    store: &Arc<Store>,
    bus: &Arc<EventBus>,
    path: &Path,
    limits: &ToolLimitsConfig,
) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    if !path.exists() {
        if registry.remove_extension(&stem) {
            info!(tool = %stem, "extension removed");
            let _ = store.log_event(
                "extension_reload",
                "info",
                &serde_json::json!({ "name": stem, "outcome": "removed" }),
            );
        }
        return;
    }

    match extensions::load_file(registry, path, limits) {
        Ok(name) => {
            info!(tool = %name, "extension loaded");
            let _ = store.log_event(
                "extension_reload",
                "info",
                &serde_json::json!({ "name": name, "outcome": "loaded" }),
            );
        }
        Err(e) => {
            warn!(tool = %stem, error = %e, "extension reload failed, previous descriptor retained");
            let _ = store.log_event(
                "extension_reload",
                "error",
                &serde_json::json!({ "name": stem, "outcome": "failed", "kind": e.kind_str(), "detail": e.to_string() }),
            );
            bus.publish_all(TurnEvent::ReloadFailure {
                name: stem,
                kind: e.kind_str().to_string(),
                detail: e.to_string(),
            });
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
