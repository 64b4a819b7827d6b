//! Embedded persistence — SQLite with FTS5 full-text search.
//!
//! One database file holds sessions, messages, memory entries, profiles,
//! app-state, session summaries, and the audit log. The single
//! `Connection` behind a mutex is the write-execution queue: writes are
//! serialised, committed writes are never undone by caller cancellation.
//!
//! The memory table is mirrored into an FTS5 index (content + tags) kept
//! in sync by triggers; tombstoned entries never surface in search.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PithError;

/// Required agent profile fields; bootstrap completes only when all are set.
pub const REQUIRED_AGENT_FIELDS: &[&str] = &["name", "nature", "vibe", "emoji"];
/// Required user profile fields.
pub const REQUIRED_USER_FIELDS: &[&str] = &["name", "preferred_address", "timezone"];

// ── Records ──────────────────────────────────────────────────

/// Message role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolRequest,
    ToolResult,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolRequest => "tool_request",
            Role::ToolResult => "tool_result",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Role {
        match s {
            "assistant" => Role::Assistant,
            "tool_request" => Role::ToolRequest,
            "tool_result" => Role::ToolResult,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub text: String,
    pub tool_name: Option<String>,
    /// JSON-encoded tool arguments (tool_request rows).
    pub tool_args: Option<String>,
    pub token_estimate: i64,
    pub created_at: String,
}

/// Input for [`Store::append_message`].
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub session_id: &'a str,
    pub role: Role,
    pub text: &'a str,
    pub tool_name: Option<&'a str>,
    pub tool_args: Option<&'a str>,
    pub token_estimate: i64,
}

impl<'a> NewMessage<'a> {
    /// Plain message without tool metadata.
    pub fn plain(session_id: &'a str, role: Role, text: &'a str, token_estimate: i64) -> Self {
        Self {
            session_id,
            role,
            text,
            tool_name: None,
            tool_args: None,
            token_estimate,
        }
    }
}

/// A memory entry, optionally scored when returned from search.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub content: String,
    pub kind: String,
    pub tags: Vec<String>,
    pub source: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// A compaction summary covering a contiguous message range.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub id: i64,
    pub session_id: String,
    pub from_msg_id: i64,
    pub to_msg_id: i64,
    pub summary: String,
    pub created_at: String,
}

// ── Store ────────────────────────────────────────────────────

/// SQLite-backed store with a companion JSONL audit sink.
pub struct Store {
    conn: Mutex<Connection>,
    /// When set, audit events are also appended to `<log_path>` as JSONL.
    log_path: Mutex<Option<PathBuf>>,
}

impl Store {
    /// Open (or create) the database at `db_path` and ensure the schema.
    pub fn open(db_path: &Path) -> Result<Self, PithError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            log_path: Mutex::new(None),
        })
    }

    /// Point the audit sink at `<log_dir>/events.jsonl`.
    pub fn set_log_dir(&self, log_dir: &Path) {
        *self.log_path.lock().expect("store log path poisoned") =
            Some(log_dir.join("events.jsonl"));
    }

    fn ensure_schema(conn: &Connection) -> Result<(), PithError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS app_state(
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS profiles(
                profile_type TEXT NOT NULL,
                key          TEXT NOT NULL,
                value        TEXT,
                updated_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                PRIMARY KEY (profile_type, key)
            );
            CREATE TABLE IF NOT EXISTS sessions(
                id         TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE TABLE IF NOT EXISTS messages(
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id     TEXT NOT NULL,
                role           TEXT NOT NULL,
                content        TEXT NOT NULL,
                tool_name      TEXT,
                tool_args      TEXT,
                token_estimate INTEGER NOT NULL DEFAULT 0,
                created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_created
                ON messages(session_id, created_at, id);
            CREATE TABLE IF NOT EXISTS session_summaries(
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL,
                from_msg_id INTEGER NOT NULL,
                to_msg_id   INTEGER NOT NULL,
                summary     TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS memory_entries(
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                content    TEXT NOT NULL,
                kind       TEXT NOT NULL DEFAULT 'episodic',
                tags       TEXT NOT NULL DEFAULT '[]',
                source     TEXT NOT NULL DEFAULT 'runtime',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                deleted    INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS audit_log(
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                ts      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                event   TEXT NOT NULL,
                level   TEXT NOT NULL DEFAULT 'info',
                payload TEXT
            );",
        )?;

        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
                content, tags,
                content='memory_entries',
                content_rowid='id'
            );",
        )?;
        conn.execute_batch(
            "CREATE TRIGGER IF NOT EXISTS memory_ai AFTER INSERT ON memory_entries BEGIN
                INSERT INTO memory_fts(rowid, content, tags)
                VALUES (new.id, new.content, new.tags);
            END;
            CREATE TRIGGER IF NOT EXISTS memory_ad AFTER DELETE ON memory_entries BEGIN
                INSERT INTO memory_fts(memory_fts, rowid, content, tags)
                VALUES ('delete', old.id, old.content, old.tags);
            END;
            CREATE TRIGGER IF NOT EXISTS memory_au AFTER UPDATE ON memory_entries BEGIN
                INSERT INTO memory_fts(memory_fts, rowid, content, tags)
                VALUES ('delete', old.id, old.content, old.tags);
                INSERT INTO memory_fts(rowid, content, tags)
                VALUES (new.id, new.content, new.tags);
            END;",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    /// True when the database answers a trivial query.
    pub fn healthcheck(&self) -> bool {
        self.lock()
            .query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .is_ok()
    }

    // ── sessions ─────────────────────────────────────────────

    /// Allocate a fresh session, make it active, and return its id.
    pub fn new_session(&self) -> Result<String, PithError> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock();
        conn.execute("INSERT INTO sessions(id) VALUES(?1)", params![id])?;
        conn.execute(
            "INSERT INTO app_state(key,value) VALUES('active_session_id',?1)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![id],
        )?;
        Ok(id)
    }

    /// Create a session row for an externally supplied id. Idempotent.
    pub fn create_session_if_missing(&self, id: &str) -> Result<(), PithError> {
        self.lock()
            .execute("INSERT OR IGNORE INTO sessions(id) VALUES(?1)", params![id])?;
        Ok(())
    }

    /// Return the active session id, allocating one when none exists.
    pub fn ensure_active_session(&self) -> Result<String, PithError> {
        if let Some(id) = self.get_app_state("active_session_id")? {
            return Ok(id);
        }
        self.new_session()
    }

    pub fn set_active_session(&self, id: &str) -> Result<(), PithError> {
        self.set_app_state("active_session_id", id)
    }

    pub fn session_exists(&self, id: &str) -> Result<bool, PithError> {
        let exists: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM sessions WHERE id=?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn session_count(&self) -> Result<usize, PithError> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    // ── messages ─────────────────────────────────────────────

    /// Append a message; touches the owning session. Returns the row id.
    pub fn append_message(&self, msg: &NewMessage<'_>) -> Result<i64, PithError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages(session_id, role, content, tool_name, tool_args, token_estimate)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                msg.session_id,
                msg.role.as_str(),
                msg.text,
                msg.tool_name,
                msg.tool_args,
                msg.token_estimate
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE sessions SET updated_at=strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id=?1",
            params![msg.session_id],
        )?;
        Ok(id)
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
        Ok(MessageRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: Role::parse(&row.get::<_, String>(2)?),
            text: row.get(3)?,
            tool_name: row.get(4)?,
            tool_args: row.get(5)?,
            token_estimate: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    /// List messages in `(created_at, id)` order, optionally after
    /// `since_id` and capped at `limit`.
    pub fn list_messages(
        &self,
        session_id: &str,
        since_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, PithError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, tool_name, tool_args, token_estimate, created_at
             FROM messages
             WHERE session_id=?1 AND id > ?2
             ORDER BY created_at, id
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                session_id,
                since_id.unwrap_or(0),
                limit.map(|l| l as i64).unwrap_or(-1)
            ],
            Self::row_to_message,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The most recent `limit` messages, returned in chronological order.
    pub fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, PithError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, tool_name, tool_args, token_estimate, created_at
             FROM messages
             WHERE session_id=?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], Self::row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }

    pub fn message_count(&self, session_id: &str) -> Result<usize, PithError> {
        let n: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id=?1",
            params![session_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Total token estimate across a session's messages.
    pub fn token_total(&self, session_id: &str) -> Result<i64, PithError> {
        let n: i64 = self.lock().query_row(
            "SELECT COALESCE(SUM(token_estimate), 0) FROM messages WHERE session_id=?1",
            params![session_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // ── memory ───────────────────────────────────────────────

    /// Insert a memory entry; returns its id.
    pub fn save_memory(
        &self,
        content: &str,
        kind: &str,
        tags: &[String],
        source: &str,
    ) -> Result<i64, PithError> {
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".into());
        let conn = self.lock();
        conn.execute(
            "INSERT INTO memory_entries(content, kind, tags, source) VALUES(?1, ?2, ?3, ?4)",
            params![content, kind, tags_json, source],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Tombstone a memory entry. Returns true when a live row was marked.
    pub fn delete_memory(&self, id: i64) -> Result<bool, PithError> {
        let n = self.lock().execute(
            "UPDATE memory_entries
             SET deleted=1, updated_at=strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id=?1 AND deleted=0",
            params![id],
        )?;
        Ok(n > 0)
    }

    /// Ranked full-text search over live memory entries.
    ///
    /// BM25 relevance dominates; a recency bonus of
    /// `recency_weight / (1 + age_days)` breaks near-ties. Queries FTS5
    /// cannot parse (or that match nothing) fall back to substring search.
    pub fn search_memory(
        &self,
        query: &str,
        limit: usize,
        recency_weight: f64,
    ) -> Result<Vec<MemoryRecord>, PithError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let fts_query = sanitize_fts_query(query);
        let mut scored = self.search_memory_fts(&fts_query, limit * 4)?;

        if scored.is_empty() {
            scored = self.search_memory_like(query, limit)?;
        }

        // Combine relevance with the recency bonus, then re-rank.
        let now = chrono::Utc::now();
        let mut combined: Vec<(f64, MemoryRecord)> = scored
            .into_iter()
            .map(|mut rec| {
                let relevance = rec.score.unwrap_or(0.0);
                let age_days = chrono::DateTime::parse_from_rfc3339(&rec.created_at)
                    .map(|t| (now - t.with_timezone(&chrono::Utc)).num_seconds() as f64 / 86_400.0)
                    .unwrap_or(0.0)
                    .max(0.0);
                let score = relevance + recency_weight / (1.0 + age_days);
                rec.score = Some(score);
                (score, rec)
            })
            .collect();
        combined.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        combined.truncate(limit);
        Ok(combined.into_iter().map(|(_, r)| r).collect())
    }

    fn search_memory_fts(
        &self,
        fts_query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, PithError> {
        let conn = self.lock();
        let mut stmt = match conn.prepare(
            "SELECT m.id, m.content, m.kind, m.tags, m.source, m.created_at, m.updated_at,
                    bm25(memory_fts) AS rank
             FROM memory_fts f
             JOIN memory_entries m ON m.id = f.rowid
             WHERE m.deleted = 0 AND memory_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        ) {
            Ok(s) => s,
            Err(_) => return Ok(Vec::new()),
        };
        let rows = stmt.query_map(params![fts_query, limit as i64], |row| {
            // bm25 is lower-is-better; negate so higher is better.
            let rank: f64 = row.get(7)?;
            Ok(MemoryRecord {
                id: row.get(0)?,
                content: row.get(1)?,
                kind: row.get(2)?,
                tags: parse_tags(&row.get::<_, String>(3)?),
                source: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
                score: Some(-rank),
            })
        });
        let rows = match rows {
            Ok(r) => r,
            Err(_) => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(rec) => out.push(rec),
                Err(_) => return Ok(Vec::new()),
            }
        }
        Ok(out)
    }

    fn search_memory_like(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, PithError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content, kind, tags, source, created_at, updated_at
             FROM memory_entries
             WHERE deleted = 0 AND content LIKE ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let pattern = format!("%{query}%");
        let rows = stmt.query_map(params![pattern, limit as i64], |row| {
            Ok(MemoryRecord {
                id: row.get(0)?,
                content: row.get(1)?,
                kind: row.get(2)?,
                tags: parse_tags(&row.get::<_, String>(3)?),
                source: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
                score: Some(0.0),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── profiles ─────────────────────────────────────────────

    pub fn set_profile(&self, profile_type: &str, key: &str, value: &str) -> Result<(), PithError> {
        self.lock().execute(
            "INSERT INTO profiles(profile_type, key, value, updated_at)
             VALUES(?1, ?2, ?3, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
             ON CONFLICT(profile_type, key)
             DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
            params![profile_type, key, value],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, profile_type: &str) -> Result<HashMap<String, String>, PithError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM profiles WHERE profile_type=?1 AND value IS NOT NULL ORDER BY key",
        )?;
        let rows = stmt.query_map(params![profile_type], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (k, v) = row?;
            out.insert(k, v);
        }
        Ok(out)
    }

    /// Agent and user profiles together.
    pub fn all_profile_fields(
        &self,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>), PithError> {
        Ok((self.get_profile("agent")?, self.get_profile("user")?))
    }

    /// True iff every required agent and user field is non-empty.
    pub fn profiles_complete(&self) -> Result<bool, PithError> {
        let (agent, user) = self.all_profile_fields()?;
        let filled = |m: &HashMap<String, String>, fields: &[&str]| {
            fields
                .iter()
                .all(|f| m.get(*f).map(|v| !v.trim().is_empty()).unwrap_or(false))
        };
        Ok(filled(&agent, REQUIRED_AGENT_FIELDS) && filled(&user, REQUIRED_USER_FIELDS))
    }

    // ── app state ────────────────────────────────────────────

    pub fn set_app_state(&self, key: &str, value: &str) -> Result<(), PithError> {
        self.lock().execute(
            "INSERT INTO app_state(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_app_state(&self, key: &str) -> Result<Option<String>, PithError> {
        let value: Option<String> = self
            .lock()
            .query_row(
                "SELECT value FROM app_state WHERE key=?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// `bootstrap_complete` flag, falling back to a live profile check so a
    /// fully configured database never presents as un-bootstrapped.
    pub fn bootstrap_complete(&self) -> Result<bool, PithError> {
        if self.get_app_state("bootstrap_complete")?.as_deref() == Some("1") {
            return Ok(true);
        }
        self.profiles_complete()
    }

    /// Flip `bootstrap_complete` when the required fields are all set.
    /// Returns true only on the transition (at most once per version).
    pub fn mark_bootstrap_complete(&self) -> Result<bool, PithError> {
        if self.get_app_state("bootstrap_complete")?.as_deref() == Some("1") {
            return Ok(false);
        }
        if !self.profiles_complete()? {
            return Ok(false);
        }
        self.set_app_state("bootstrap_complete", "1")?;
        let version = self
            .get_app_state("bootstrap_version")?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        self.set_app_state("bootstrap_version", &version.to_string())?;
        Ok(true)
    }

    // ── summaries ────────────────────────────────────────────

    pub fn add_summary(
        &self,
        session_id: &str,
        from_msg_id: i64,
        to_msg_id: i64,
        summary: &str,
    ) -> Result<i64, PithError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO session_summaries(session_id, from_msg_id, to_msg_id, summary)
             VALUES(?1, ?2, ?3, ?4)",
            params![session_id, from_msg_id, to_msg_id, summary],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_summaries(&self, session_id: &str) -> Result<Vec<SummaryRecord>, PithError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, from_msg_id, to_msg_id, summary, created_at
             FROM session_summaries WHERE session_id=?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(SummaryRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                from_msg_id: row.get(2)?,
                to_msg_id: row.get(3)?,
                summary: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Highest message id already covered by a summary, if any.
    pub fn last_summary_end(&self, session_id: &str) -> Result<Option<i64>, PithError> {
        let end: Option<i64> = self
            .lock()
            .query_row(
                "SELECT MAX(to_msg_id) FROM session_summaries WHERE session_id=?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(end)
    }

    // ── audit ────────────────────────────────────────────────

    /// Record an audit event in the database and, when configured, as a
    /// JSONL line in the log directory. JSONL failures are non-fatal.
    pub fn log_event(&self, event: &str, level: &str, payload: &Value) -> Result<(), PithError> {
        let payload_text = payload.to_string();
        self.lock().execute(
            "INSERT INTO audit_log(event, level, payload) VALUES(?1, ?2, ?3)",
            params![event, level, payload_text],
        )?;

        let log_path = self.log_path.lock().expect("store log path poisoned").clone();
        if let Some(path) = log_path {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "event": event,
                "level": level,
                "payload": payload,
            });
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                let _ = writeln!(f, "{line}");
            }
        }
        Ok(())
    }

    /// Number of audit rows for a given event name (test/status helper).
    pub fn audit_count(&self, event: &str) -> Result<usize, PithError> {
        let n: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM audit_log WHERE event=?1",
            params![event],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }
}

fn parse_tags(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

/// Quote each query word for FTS5 with a prefix variant so partial words
/// still match.
fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            let clean = w.replace('"', "");
            format!("\"{clean}\" OR \"{clean}\"*")
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("memory.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn session_roundtrip() {
        let (_dir, store) = temp_store();
        let id = store.new_session().unwrap();
        assert!(store.session_exists(&id).unwrap());
        assert_eq!(store.ensure_active_session().unwrap(), id);
        assert_eq!(store.session_count().unwrap(), 1);
    }

    #[test]
    fn new_session_replaces_active() {
        let (_dir, store) = temp_store();
        let a = store.new_session().unwrap();
        let b = store.new_session().unwrap();
        assert_ne!(a, b);
        assert_eq!(store.ensure_active_session().unwrap(), b);
    }

    #[test]
    fn external_session_id_is_idempotent() {
        let (_dir, store) = temp_store();
        store.create_session_if_missing("client-1").unwrap();
        store.create_session_if_missing("client-1").unwrap();
        assert_eq!(store.session_count().unwrap(), 1);
    }

    #[test]
    fn messages_preserve_append_order() {
        let (_dir, store) = temp_store();
        let sid = store.new_session().unwrap();
        for i in 0..5 {
            store
                .append_message(&NewMessage::plain(&sid, Role::User, &format!("msg {i}"), 3))
                .unwrap();
        }
        let msgs = store.list_messages(&sid, None, None).unwrap();
        assert_eq!(msgs.len(), 5);
        for (i, m) in msgs.iter().enumerate() {
            assert_eq!(m.text, format!("msg {i}"));
        }
        // Ids strictly increase with append order.
        assert!(msgs.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn list_messages_since_and_limit() {
        let (_dir, store) = temp_store();
        let sid = store.new_session().unwrap();
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(
                store
                    .append_message(&NewMessage::plain(&sid, Role::User, &format!("m{i}"), 1))
                    .unwrap(),
            );
        }
        let after = store.list_messages(&sid, Some(ids[2]), None).unwrap();
        assert_eq!(after.len(), 3);
        assert_eq!(after[0].text, "m3");

        let capped = store.list_messages(&sid, None, Some(2)).unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].text, "m0");
    }

    #[test]
    fn recent_messages_chronological() {
        let (_dir, store) = temp_store();
        let sid = store.new_session().unwrap();
        for i in 0..10 {
            store
                .append_message(&NewMessage::plain(&sid, Role::User, &format!("m{i}"), 1))
                .unwrap();
        }
        let recent = store.recent_messages(&sid, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].text, "m7");
        assert_eq!(recent[2].text, "m9");
    }

    #[test]
    fn tool_messages_carry_metadata() {
        let (_dir, store) = temp_store();
        let sid = store.new_session().unwrap();
        store
            .append_message(&NewMessage {
                session_id: &sid,
                role: Role::ToolRequest,
                text: "",
                tool_name: Some("echo"),
                tool_args: Some(r#"{"text":"hi"}"#),
                token_estimate: 4,
            })
            .unwrap();
        let msgs = store.list_messages(&sid, None, None).unwrap();
        assert_eq!(msgs[0].role, Role::ToolRequest);
        assert_eq!(msgs[0].tool_name.as_deref(), Some("echo"));
        assert!(msgs[0].tool_args.as_deref().unwrap().contains("hi"));
    }

    #[test]
    fn memory_save_then_exact_search_ranks_first() {
        let (_dir, store) = temp_store();
        store
            .save_memory("Ada prefers metric units", "durable", &[], "tool")
            .unwrap();
        store
            .save_memory("The cat is called Whiskers", "episodic", &[], "tool")
            .unwrap();
        let hits = store.search_memory("metric units", 5, 0.1).unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].content.contains("metric"));
    }

    #[test]
    fn deleted_memory_never_surfaces() {
        let (_dir, store) = temp_store();
        let id = store
            .save_memory("secret launch codes", "durable", &[], "tool")
            .unwrap();
        assert!(store.delete_memory(id).unwrap());
        assert!(!store.delete_memory(id).unwrap());
        let hits = store.search_memory("launch codes", 5, 0.1).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn memory_tags_are_indexed() {
        let (_dir, store) = temp_store();
        store
            .save_memory("likes espresso", "durable", &["coffee".into()], "tool")
            .unwrap();
        let hits = store.search_memory("coffee", 5, 0.1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tags, vec!["coffee"]);
    }

    #[test]
    fn search_special_chars_does_not_error() {
        let (_dir, store) = temp_store();
        store
            .save_memory("user's email is ada@example.com", "durable", &[], "tool")
            .unwrap();
        let hits = store.search_memory("user's email", 5, 0.1).unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn profile_roundtrip_and_completeness() {
        let (_dir, store) = temp_store();
        assert!(!store.profiles_complete().unwrap());

        for (k, v) in [
            ("name", "pith"),
            ("nature", "AI assistant"),
            ("vibe", "curious"),
            ("emoji", "🌱"),
        ] {
            store.set_profile("agent", k, v).unwrap();
        }
        assert!(!store.profiles_complete().unwrap());

        for (k, v) in [
            ("name", "Ada"),
            ("preferred_address", "Ada"),
            ("timezone", "UTC"),
        ] {
            store.set_profile("user", k, v).unwrap();
        }
        assert!(store.profiles_complete().unwrap());

        let agent = store.get_profile("agent").unwrap();
        assert_eq!(agent.get("name").map(String::as_str), Some("pith"));
    }

    #[test]
    fn bootstrap_flips_once() {
        let (_dir, store) = temp_store();
        assert!(!store.bootstrap_complete().unwrap());
        // Not flippable until profiles complete.
        assert!(!store.mark_bootstrap_complete().unwrap());

        for (k, v) in [("name", "p"), ("nature", "n"), ("vibe", "v"), ("emoji", "e")] {
            store.set_profile("agent", k, v).unwrap();
        }
        for (k, v) in [("name", "u"), ("preferred_address", "u"), ("timezone", "UTC")] {
            store.set_profile("user", k, v).unwrap();
        }

        assert!(store.mark_bootstrap_complete().unwrap());
        assert!(store.bootstrap_complete().unwrap());
        // Second call is a no-op.
        assert!(!store.mark_bootstrap_complete().unwrap());
        assert_eq!(
            store.get_app_state("bootstrap_version").unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn summaries_track_ranges() {
        let (_dir, store) = temp_store();
        let sid = store.new_session().unwrap();
        assert!(store.last_summary_end(&sid).unwrap().is_none());

        store.add_summary(&sid, 1, 10, "they talked about units").unwrap();
        store.add_summary(&sid, 11, 20, "they named the agent").unwrap();

        assert_eq!(store.last_summary_end(&sid).unwrap(), Some(20));
        let summaries = store.list_summaries(&sid).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].from_msg_id, 1);
        assert_eq!(summaries[1].to_msg_id, 20);
    }

    #[test]
    fn audit_log_writes_table_and_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("memory.db")).unwrap();
        store.set_log_dir(&dir.path().join("logs"));

        store
            .log_event("tool_call", "info", &serde_json::json!({"name": "read"}))
            .unwrap();
        assert_eq!(store.audit_count("tool_call").unwrap(), 1);

        let jsonl = std::fs::read_to_string(dir.path().join("logs").join("events.jsonl")).unwrap();
        let entry: Value = serde_json::from_str(jsonl.trim()).unwrap();
        assert_eq!(entry["event"], "tool_call");
        assert_eq!(entry["payload"]["name"], "read");
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("memory.db");
        let sid;
        {
            let store = Store::open(&db).unwrap();
            sid = store.new_session().unwrap();
            store
                .append_message(&NewMessage::plain(&sid, Role::User, "hello", 1))
                .unwrap();
            store.save_memory("persisted fact", "durable", &[], "tool").unwrap();
            store.set_app_state("telegram_cursor", "42").unwrap();
        }
        let store = Store::open(&db).unwrap();
        assert_eq!(store.ensure_active_session().unwrap(), sid);
        assert_eq!(store.list_messages(&sid, None, None).unwrap().len(), 1);
        assert_eq!(store.search_memory("persisted", 5, 0.1).unwrap().len(), 1);
        assert_eq!(
            store.get_app_state("telegram_cursor").unwrap().as_deref(),
            Some("42")
        );
    }

    #[test]
    fn token_total_sums_estimates() {
        let (_dir, store) = temp_store();
        let sid = store.new_session().unwrap();
        store
            .append_message(&NewMessage::plain(&sid, Role::User, "a", 10))
            .unwrap();
        store
            .append_message(&NewMessage::plain(&sid, Role::Assistant, "b", 7))
            .unwrap();
        assert_eq!(store.token_total(&sid).unwrap(), 17);
    }
}
