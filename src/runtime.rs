//! Turn orchestration.
//!
//! One turn: acquire the per-session lock, persist the user message,
//! assemble context, then loop model → tool dispatch until the model
//! produces a terminal assistant message, the iteration cap trips, the
//! deadline expires, or an unrecoverable error ends the turn. Every turn
//! ends with exactly one `turn_finished` event and never panics or raises
//! out of the orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt as _;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::{estimate_tokens, AssembledContext, ContextAssembler};
use crate::error::PithError;
use crate::events::{EventBus, TurnEvent, TurnStatus};
use crate::models::{ChatMessage, Model, ModelEvent, ModelRequest, ToolCallRequest};
use crate::store::{NewMessage, Role, Store};
use crate::tools::{ToolCtx, ToolRegistry};

/// How many recent messages a compaction pass keeps out of the summary.
const COMPACT_KEEP_RECENT: usize = 50;
/// Transient model errors are retried this many times in total.
const MODEL_RETRY_ATTEMPTS: u32 = 3;

/// Result of a completed (or failed-but-contained) turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn_id: String,
    pub status: TurnStatus,
    pub reply: String,
}

/// Exclusive right to run one turn on a session.
pub struct TurnPermit {
    #[allow(dead_code)]
    guard: tokio::sync::OwnedMutexGuard<()>,
    pub turn_id: String,
}

/// Session-control commands, also reachable as `/new`, `/compact`, `/info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeCommand {
    New,
    Compact,
    Info,
}

impl RuntimeCommand {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "compact" => Some(Self::Compact),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

/// The runtime: the single owned value the API, channels, and entrypoint
/// collaborate through.
pub struct Runtime {
    cfg: Arc<Config>,
    store: Arc<Store>,
    registry: Arc<ToolRegistry>,
    model: Arc<dyn Model>,
    bus: Arc<EventBus>,
    assembler: ContextAssembler,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    started_at: std::time::Instant,
}

impl Runtime {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<Store>,
        registry: Arc<ToolRegistry>,
        model: Arc<dyn Model>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let assembler = ContextAssembler::new(
            store.clone(),
            registry.clone(),
            cfg.workspace_path(),
            cfg.runtime.context.clone(),
        );
        Arc::new(Self {
            cfg,
            store,
            registry,
            model,
            bus,
            assembler,
            locks: Mutex::new(HashMap::new()),
            started_at: std::time::Instant::now(),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("session locks poisoned");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn tool_ctx(&self) -> ToolCtx {
        let workspace = self.cfg.workspace_path();
        let env_path = workspace
            .parent()
            .map(|p| p.join(".env"))
            .unwrap_or_else(|| workspace.join(".env"));
        ToolCtx {
            workspace,
            store: self.store.clone(),
            registry: self.registry.clone(),
            env_path,
            memory_recency_weight: self.cfg.runtime.context.memory_recency_weight,
        }
    }

    // ── public surface ───────────────────────────────────────

    /// Allocate a fresh session.
    pub fn new_session(&self) -> Result<String, PithError> {
        self.store.new_session()
    }

    /// Synthesised status for `/info` and `GET /status`.
    pub fn get_info(&self, session_id: &str) -> Result<Value, PithError> {
        let (agent, user) = self.store.all_profile_fields()?;
        Ok(json!({
            "session_id": session_id,
            "bootstrap_complete": self.store.bootstrap_complete()?,
            "agent_profile": agent,
            "user_profile": user,
            "message_count": self.store.message_count(session_id)?,
        }))
    }

    /// Server-wide status summary.
    pub fn status(&self) -> Result<Value, PithError> {
        Ok(json!({
            "bootstrap_complete": self.store.bootstrap_complete()?,
            "sessions": self.store.session_count()?,
            "registry": self.registry.summary(),
            "model": self.model.name(),
            "uptime_seconds": self.started_at.elapsed().as_secs(),
        }))
    }

    /// Run a session-control command. `/compact` waits for the session
    /// lock; `/new` and `/info` never block.
    pub async fn run_command(
        &self,
        session_id: &str,
        cmd: RuntimeCommand,
    ) -> Result<Value, PithError> {
        match cmd {
            RuntimeCommand::New => {
                let id = self.new_session()?;
                debug!(session_id = %id, "new session via command");
                Ok(json!({ "session_id": id }))
            }
            RuntimeCommand::Compact => {
                let lock = self.session_lock(session_id);
                let _guard = lock.lock().await;
                let result = self.compact_locked(session_id).await?;
                Ok(json!({ "result": result }))
            }
            RuntimeCommand::Info => self.get_info(session_id),
        }
    }

    /// Acquire the per-session lock for a new turn without blocking.
    ///
    /// A session already running a turn (or compaction) yields `Busy`.
    /// The permit carries the allocated turn id; drop it to release the
    /// session without running.
    pub fn begin_turn(&self, session_id: &str) -> Result<TurnPermit, PithError> {
        let lock = self.session_lock(session_id);
        let guard = lock.try_lock_owned().map_err(|_| PithError::Busy)?;
        Ok(TurnPermit {
            guard,
            turn_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Submit one user turn.
    ///
    /// Returns `Busy` when another turn holds the session. All other
    /// failures are contained: the turn ends with a `turn_finished` event
    /// and a persisted human-readable marker, and the outcome reports the
    /// terminal status.
    pub async fn submit_turn(
        &self,
        session_id: &str,
        user_text: &str,
        deadline: Option<Duration>,
    ) -> Result<TurnOutcome, PithError> {
        // Slash commands never reach the model.
        if let Some(cmd) = user_text.trim().strip_prefix('/').and_then(RuntimeCommand::parse) {
            let value = self.run_command(session_id, cmd).await?;
            return Ok(TurnOutcome {
                turn_id: String::new(),
                status: TurnStatus::Ok,
                reply: render_command_reply(cmd, &value),
            });
        }

        let permit = self.begin_turn(session_id)?;
        Ok(self
            .run_permitted_turn(permit, session_id, user_text, deadline)
            .await)
    }

    /// Run a turn under an already-acquired permit. Never fails: every
    /// internal error is contained in the outcome.
    pub async fn run_permitted_turn(
        &self,
        permit: TurnPermit,
        session_id: &str,
        user_text: &str,
        deadline: Option<Duration>,
    ) -> TurnOutcome {
        let turn_id = permit.turn_id.clone();
        let turn_start = std::time::Instant::now();

        if let Err(e) = self.store.create_session_if_missing(session_id) {
            return self.finish_error(session_id, &turn_id, turn_start, &e);
        }

        let total = Duration::from_secs(self.cfg.runtime.turn.deadline_seconds);
        let deadline_at = Instant::now() + deadline.map(|d| d.min(total)).unwrap_or(total);

        let outcome = self
            .run_turn(session_id, &turn_id, user_text, deadline_at)
            .await;

        // Auto-compaction rides the same lock as the turn.
        let over_messages = self.store.message_count(session_id).unwrap_or(0)
            > self.cfg.runtime.turn.compact_after_messages;
        let over_tokens = self.store.token_total(session_id).unwrap_or(0)
            > self.cfg.runtime.turn.compact_after_tokens;
        if over_messages || over_tokens {
            if let Err(e) = self.compact_locked(session_id).await {
                warn!(error = %e, "auto-compaction failed");
            }
        }
        drop(permit);

        outcome
    }

    // ── turn internals ───────────────────────────────────────

    /// The contained turn body: every exit path emits `turn_finished`.
    async fn run_turn(
        &self,
        session_id: &str,
        turn_id: &str,
        user_text: &str,
        deadline_at: Instant,
    ) -> TurnOutcome {
        let turn_start = std::time::Instant::now();

        let user_msg_id = match self.store.append_message(&NewMessage::plain(
            session_id,
            Role::User,
            user_text,
            estimate_tokens(user_text) as i64,
        )) {
            Ok(id) => id,
            Err(e) => {
                return self.finish_error(session_id, turn_id, turn_start, &e);
            }
        };
        self.bus.publish(
            session_id,
            Some(turn_id),
            TurnEvent::TurnStarted {
                message_id: user_msg_id,
            },
        );

        let assembled = match self
            .assembler
            .assemble(session_id, user_text, Some(user_msg_id))
        {
            Ok(a) => a,
            Err(e) => return self.finish_error(session_id, turn_id, turn_start, &e),
        };
        let bootstrap_was_incomplete = assembled.bootstrap;
        let AssembledContext {
            system_prompt,
            mut messages,
            ..
        } = assembled;

        let max_iters = self.cfg.runtime.turn.max_tool_iterations;
        let mut set_profile_succeeded = false;
        let mut tool_calls_run = 0usize;

        let outcome = 'turn: {
            // `max_iters` bounds the tool rounds; the model gets one more
            // call after the last permitted round so a turn that used its
            // full allowance can still deliver a real answer. The cap
            // trips only when that extra call asks for tools again.
            for iteration in 0..=max_iters {
                let request = ModelRequest {
                    system_prompt: system_prompt.clone(),
                    messages: messages.clone(),
                    tools: self.registry.schemas(),
                    temperature: self.cfg.model.temperature,
                };

                let (text, calls) = match self
                    .call_model_with_retries(session_id, turn_id, request, deadline_at)
                    .await
                {
                    Ok(r) => r,
                    Err(e) if matches!(e, PithError::Timeout) => {
                        break 'turn self.finish_timeout(session_id, turn_id, turn_start);
                    }
                    Err(e) => {
                        break 'turn self.finish_error(session_id, turn_id, turn_start, &e)
                    }
                };

                if calls.is_empty() {
                    // Terminal assistant message.
                    let id = match self.store.append_message(&NewMessage::plain(
                        session_id,
                        Role::Assistant,
                        &text,
                        estimate_tokens(&text) as i64,
                    )) {
                        Ok(id) => id,
                        Err(e) => {
                            break 'turn self.finish_error(session_id, turn_id, turn_start, &e)
                        }
                    };
                    self.bus.publish(
                        session_id,
                        Some(turn_id),
                        TurnEvent::AssistantMessage {
                            id,
                            text: text.clone(),
                        },
                    );
                    self.bus.publish(
                        session_id,
                        Some(turn_id),
                        TurnEvent::TurnFinished {
                            status: TurnStatus::Ok,
                            kind: None,
                            detail: None,
                        },
                    );
                    break 'turn TurnOutcome {
                        turn_id: turn_id.to_string(),
                        status: TurnStatus::Ok,
                        reply: text,
                    };
                }

                if iteration == max_iters {
                    // Still requesting tools after the last permitted
                    // round: fall through to the cap.
                    break;
                }

                // Dispatch each requested tool, then re-enter the model
                // with the extended conversation.
                let mut assistant = ChatMessage::new("assistant", text.clone());
                assistant.tool_calls = Some(
                    calls
                        .iter()
                        .map(|c| (c.id.clone(), c.name.clone(), c.args.clone()))
                        .collect(),
                );
                messages.push(assistant);

                for call in calls {
                    tool_calls_run += 1;
                    match self
                        .dispatch_tool(session_id, turn_id, &call, deadline_at)
                        .await
                    {
                        Ok((result_text, ok)) => {
                            if call.name == "set_profile"
                                && ok
                                && result_text.contains("profile_set:")
                            {
                                set_profile_succeeded = true;
                            }
                            let mut result_msg = ChatMessage::new("tool", result_text);
                            result_msg.tool_call_id = Some(call.id.clone());
                            messages.push(result_msg);
                        }
                        Err(PithError::Timeout) => {
                            break 'turn self.finish_timeout(session_id, turn_id, turn_start);
                        }
                        Err(e) => {
                            break 'turn self.finish_error(session_id, turn_id, turn_start, &e)
                        }
                    }
                }
            }

            // Iteration cap reached.
            let note = format!(
                "I hit the limit of {max_iters} tool iterations for this request and stopped here."
            );
            if let Ok(id) = self.store.append_message(&NewMessage::plain(
                session_id,
                Role::Assistant,
                &note,
                estimate_tokens(&note) as i64,
            )) {
                self.bus.publish(
                    session_id,
                    Some(turn_id),
                    TurnEvent::AssistantMessage {
                        id,
                        text: note.clone(),
                    },
                );
            }
            self.bus.publish(
                session_id,
                Some(turn_id),
                TurnEvent::TurnFinished {
                    status: TurnStatus::ToolLoopCap,
                    kind: None,
                    detail: None,
                },
            );
            TurnOutcome {
                turn_id: turn_id.to_string(),
                status: TurnStatus::ToolLoopCap,
                reply: note,
            }
        };

        // Bootstrap completion check: flips at most once, then announces.
        if bootstrap_was_incomplete && set_profile_succeeded {
            match self.store.mark_bootstrap_complete() {
                Ok(true) => {
                    info!("bootstrap complete — all required profile fields set");
                    self.bus.publish(
                        session_id,
                        Some(turn_id),
                        TurnEvent::AppStateChanged {
                            key: "bootstrap_complete".into(),
                            value: "true".into(),
                        },
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "bootstrap completion check failed"),
            }
        }

        let _ = self.store.log_event(
            "turn",
            "info",
            &json!({
                "session_id": session_id,
                "turn_id": turn_id,
                "status": outcome.status,
                "duration_ms": turn_start.elapsed().as_millis() as u64,
                "tool_calls": tool_calls_run,
            }),
        );

        outcome
    }

    /// One model call with streaming, bounded by the turn deadline.
    /// Transient failures retry with exponential backoff.
    async fn call_model_with_retries(
        &self,
        session_id: &str,
        turn_id: &str,
        request: ModelRequest,
        deadline_at: Instant,
    ) -> Result<(String, Vec<ToolCallRequest>), PithError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .call_model_once(session_id, turn_id, request.clone(), deadline_at)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < MODEL_RETRY_ATTEMPTS => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt - 1));
                    warn!(attempt, error = %e, "transient model error, retrying");
                    if Instant::now() + backoff >= deadline_at {
                        return Err(PithError::Timeout);
                    }
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_model_once(
        &self,
        session_id: &str,
        turn_id: &str,
        request: ModelRequest,
        deadline_at: Instant,
    ) -> Result<(String, Vec<ToolCallRequest>), PithError> {
        let mut stream = self.model.stream_turn(request);
        let mut text = String::new();
        let mut calls = Vec::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline_at) => {
                    return Err(PithError::Timeout);
                }
                item = stream.next() => match item {
                    None => break,
                    Some(Ok(ModelEvent::TextDelta(delta))) => {
                        self.bus.publish(
                            session_id,
                            Some(turn_id),
                            TurnEvent::AssistantDelta { text: delta.clone() },
                        );
                        text.push_str(&delta);
                    }
                    Some(Ok(ModelEvent::ToolCall(call))) => calls.push(call),
                    Some(Err(e)) => return Err(e),
                }
            }
        }
        Ok((text, calls))
    }

    /// Persist, announce, invoke, and answer one tool call.
    ///
    /// Tool failures are contained: the error is persisted as a synthetic
    /// result and fed back to the model. Only the turn deadline escapes.
    async fn dispatch_tool(
        &self,
        session_id: &str,
        turn_id: &str,
        call: &ToolCallRequest,
        deadline_at: Instant,
    ) -> Result<(String, bool), PithError> {
        let args_json = call.args.to_string();
        self.store.append_message(&NewMessage {
            session_id,
            role: Role::ToolRequest,
            text: "",
            tool_name: Some(&call.name),
            tool_args: Some(&args_json),
            token_estimate: estimate_tokens(&args_json) as i64,
        })?;
        self.bus.publish(
            session_id,
            Some(turn_id),
            TurnEvent::ToolCallStarted {
                name: call.name.clone(),
                args_preview: preview(&args_json),
            },
        );

        let started = std::time::Instant::now();
        let invocation = self
            .registry
            .invoke(&call.name, call.args.clone(), self.tool_ctx());

        let result = tokio::select! {
            _ = tokio::time::sleep_until(deadline_at) => {
                // Turn deadline expired mid-call: record the synthetic
                // result so no orphan request survives, then end the turn.
                let detail = "turn deadline exceeded during tool call";
                self.persist_tool_result(session_id, &call.name, &format!("error: {detail}"))?;
                self.bus.publish(
                    session_id,
                    Some(turn_id),
                    TurnEvent::ToolCallFinished {
                        name: call.name.clone(),
                        ok: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                        result_preview: detail.to_string(),
                    },
                );
                return Err(PithError::Timeout);
            }
            r = invocation => r,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (result_text, ok) = match result {
            Ok(value) => (value_to_text(&value), true),
            Err(e) => (format!("error: {e}"), false),
        };

        self.persist_tool_result(session_id, &call.name, &result_text)?;
        self.bus.publish(
            session_id,
            Some(turn_id),
            TurnEvent::ToolCallFinished {
                name: call.name.clone(),
                ok,
                duration_ms,
                result_preview: preview(&result_text),
            },
        );
        let _ = self.store.log_event(
            "tool_call",
            if ok { "info" } else { "error" },
            &json!({
                "session_id": session_id,
                "turn_id": turn_id,
                "name": call.name,
                "ok": ok,
                "duration_ms": duration_ms,
            }),
        );

        Ok((result_text, ok))
    }

    fn persist_tool_result(
        &self,
        session_id: &str,
        name: &str,
        text: &str,
    ) -> Result<(), PithError> {
        self.store.append_message(&NewMessage {
            session_id,
            role: Role::ToolResult,
            text,
            tool_name: Some(name),
            tool_args: None,
            token_estimate: estimate_tokens(text) as i64,
        })?;
        Ok(())
    }

    fn finish_error(
        &self,
        session_id: &str,
        turn_id: &str,
        turn_start: std::time::Instant,
        error: &PithError,
    ) -> TurnOutcome {
        let marker = format!("Something went wrong and I had to stop this turn: {error}");
        let _ = self.store.append_message(&NewMessage::plain(
            session_id,
            Role::Assistant,
            &marker,
            estimate_tokens(&marker) as i64,
        ));
        self.bus.publish(
            session_id,
            Some(turn_id),
            TurnEvent::TurnFinished {
                status: TurnStatus::Error,
                kind: Some(error.kind_str().to_string()),
                detail: Some(error.to_string()),
            },
        );
        let _ = self.store.log_event(
            "turn",
            "error",
            &json!({
                "session_id": session_id,
                "turn_id": turn_id,
                "status": "error",
                "kind": error.kind_str(),
                "duration_ms": turn_start.elapsed().as_millis() as u64,
            }),
        );
        TurnOutcome {
            turn_id: turn_id.to_string(),
            status: TurnStatus::Error,
            reply: marker,
        }
    }

    fn finish_timeout(
        &self,
        session_id: &str,
        turn_id: &str,
        turn_start: std::time::Instant,
    ) -> TurnOutcome {
        let marker = "I ran out of time on this turn before finishing.".to_string();
        let _ = self.store.append_message(&NewMessage::plain(
            session_id,
            Role::Assistant,
            &marker,
            estimate_tokens(&marker) as i64,
        ));
        self.bus.publish(
            session_id,
            Some(turn_id),
            TurnEvent::TurnFinished {
                status: TurnStatus::Timeout,
                kind: Some("timeout".into()),
                detail: None,
            },
        );
        let _ = self.store.log_event(
            "turn",
            "warn",
            &json!({
                "session_id": session_id,
                "turn_id": turn_id,
                "status": "timeout",
                "duration_ms": turn_start.elapsed().as_millis() as u64,
            }),
        );
        TurnOutcome {
            turn_id: turn_id.to_string(),
            status: TurnStatus::Timeout,
            reply: marker,
        }
    }

    // ── compaction ───────────────────────────────────────────

    /// Summarise the oldest un-summarised contiguous range through the
    /// model. Caller must hold the session lock.
    async fn compact_locked(&self, session_id: &str) -> Result<String, PithError> {
        let since = self.store.last_summary_end(session_id)?;
        let pending = self.store.list_messages(session_id, since, None)?;
        if pending.len() <= COMPACT_KEEP_RECENT {
            return Ok(format!(
                "nothing to compact in session {session_id} ({} recent messages)",
                pending.len()
            ));
        }

        let range = &pending[..pending.len() - COMPACT_KEEP_RECENT];
        let transcript: String = range
            .iter()
            .map(|m| format!("[{}] {}\n", m.role.as_str(), m.text))
            .collect();

        let request = ModelRequest {
            system_prompt: "Summarise the following conversation excerpt in a short paragraph. \
                            Preserve names, decisions, preferences, and open tasks. Output only \
                            the summary."
                .to_string(),
            messages: vec![ChatMessage::new("user", transcript)],
            tools: Vec::new(),
            temperature: 0.0,
        };

        let mut stream = self.model.stream_turn(request);
        let mut summary = String::new();
        while let Some(item) = stream.next().await {
            match item? {
                ModelEvent::TextDelta(d) => summary.push_str(&d),
                ModelEvent::ToolCall(_) => {}
            }
        }

        let from = range.first().map(|m| m.id).unwrap_or(0);
        let to = range.last().map(|m| m.id).unwrap_or(0);
        self.store.add_summary(session_id, from, to, summary.trim())?;
        info!(session_id, from, to, "session range compacted");

        Ok(format!("compacted session {session_id} ({from}..{to})"))
    }
}

/// Human-readable reply for a slash command.
fn render_command_reply(cmd: RuntimeCommand, value: &Value) -> String {
    match cmd {
        RuntimeCommand::New => format!(
            "new session started: {}",
            value["session_id"].as_str().unwrap_or("?")
        ),
        RuntimeCommand::Compact => value["result"].as_str().unwrap_or("compacted").to_string(),
        RuntimeCommand::Info => serde_json::to_string_pretty(value).unwrap_or_default(),
    }
}

/// Tool result rendered for persistence and the model.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Short single-line preview for events and audit lines.
fn preview(s: &str) -> String {
    let line = s.replace('\n', " ");
    let mut end = 200.min(line.len());
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].to_string()
}
