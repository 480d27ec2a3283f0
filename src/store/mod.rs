//! Embedded relational store (§4.11, §6 schema).
//!
//! A single writer thread owns the `rusqlite::Connection` and drains a
//! bounded channel of operations — the "single writer-goroutine pattern"
//! the design calls for (§4.11). Readers (callers) never touch the
//! connection directly; every operation round-trips through the writer via
//! a oneshot reply, so concurrent callers never contend on the connection
//! itself, only on the channel.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::session::{Session, SessionStatus, SessionType};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    number INTEGER NOT NULL,
    alias TEXT NOT NULL,
    type TEXT NOT NULL CHECK (type IN ('assistant-cli','interactive-shell','one-shot')),
    working_dir TEXT NOT NULL,
    mux_session TEXT NOT NULL,
    mux_pane_id TEXT,
    pid INTEGER,
    status TEXT NOT NULL CHECK (status IN ('running','paused','waiting','error','exited','rate-limited')),
    color_token TEXT NOT NULL,
    token_used INTEGER NOT NULL DEFAULT 0,
    token_limit INTEGER NOT NULL DEFAULT 0,
    last_activity INTEGER NOT NULL,
    last_summary TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    source TEXT NOT NULL CHECK (source IN ('user','auto','system')),
    input TEXT NOT NULL,
    context TEXT,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS auto_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern TEXT NOT NULL,
    response TEXT NOT NULL,
    match_type TEXT NOT NULL CHECK (match_type IN ('regex','contains','exact')),
    enabled INTEGER NOT NULL DEFAULT 1,
    hit_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    event_type TEXT NOT NULL CHECK (event_type IN
        ('input-required','token-warning','error','completed','rate-limit','auto-response','system')),
    message TEXT NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0,
    platform_message_id TEXT,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_commands_session_ts ON commands(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type_ack ON events(event_type, acknowledged);
"#;

const PRUNE_AFTER: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Clone)]
pub struct CommandRow {
    pub session_id: String,
    pub source: CommandSource,
    pub input: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    User,
    Auto,
    System,
}

impl CommandSource {
    fn as_str(&self) -> &'static str {
        match self {
            CommandSource::User => "user",
            CommandSource::Auto => "auto",
            CommandSource::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Regex => "regex",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoRuleRow {
    pub id: i64,
    pub pattern: String,
    pub response: String,
    pub match_type: MatchType,
    pub enabled: bool,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    InputRequired,
    TokenWarning,
    Error,
    Completed,
    RateLimit,
    AutoResponse,
    System,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::InputRequired => "input-required",
            EventType::TokenWarning => "token-warning",
            EventType::Error => "error",
            EventType::Completed => "completed",
            EventType::RateLimit => "rate-limit",
            EventType::AutoResponse => "auto-response",
            EventType::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub session_id: String,
    pub event_type: EventType,
    pub message: String,
    pub acknowledged: bool,
    pub platform_message_id: Option<String>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Op {
    UpsertSession(Session, Reply<()>),
    InsertCommand(CommandRow, Reply<i64>),
    InsertAutoRule {
        pattern: String,
        response: String,
        match_type: MatchType,
        reply: Reply<i64>,
    },
    ListAutoRules(Reply<Vec<AutoRuleRow>>),
    IncrementRuleHit(i64, Reply<()>),
    InsertEvent {
        session_id: String,
        event_type: EventType,
        message: String,
        reply: Reply<i64>,
    },
    SetEventPlatformMessageId(i64, String, Reply<()>),
    AckEvent(i64, Reply<()>),
    PruneOld(Reply<u64>),
    ListSessions(Reply<Vec<Session>>),
}

/// Handle held by every other component. Cloning is cheap (an mpsc sender).
#[derive(Clone)]
pub struct Store {
    tx: mpsc::Sender<Op>,
}

impl Store {
    /// Open (or create) the sqlite file at `path` and spawn the writer
    /// thread. Runs the boot-time pruner once before returning.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set store busy timeout")?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply store schema")?;

        let (tx, rx) = mpsc::channel(256);
        std::thread::Builder::new()
            .name("conductor-store-writer".into())
            .spawn(move || writer_loop(conn, rx))
            .context("failed to spawn store writer thread")?;

        Ok(Store { tx })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set store busy timeout")?;
        conn.execute_batch(SCHEMA).context("failed to apply store schema")?;
        let (tx, rx) = mpsc::channel(256);
        std::thread::spawn(move || writer_loop(conn, rx));
        Ok(Store { tx })
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Op) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow!("store writer thread is gone"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("store writer thread dropped the reply"))?
    }

    pub async fn upsert_session(&self, session: &Session) -> Result<()> {
        self.call(|reply| Op::UpsertSession(session.clone(), reply)).await
    }

    pub async fn insert_command(&self, row: CommandRow) -> Result<i64> {
        self.call(|reply| Op::InsertCommand(row, reply)).await
    }

    pub async fn insert_auto_rule(
        &self,
        pattern: String,
        response: String,
        match_type: MatchType,
    ) -> Result<i64> {
        // Invalid regex is rejected at creation time (§3 AutoRule invariant).
        if match_type == MatchType::Regex {
            regex::Regex::new(&pattern)
                .with_context(|| format!("invalid regex auto-rule pattern: {pattern}"))?;
        }
        self.call(|reply| Op::InsertAutoRule {
            pattern,
            response,
            match_type,
            reply,
        })
        .await
    }

    pub async fn list_auto_rules(&self) -> Result<Vec<AutoRuleRow>> {
        self.call(Op::ListAutoRules).await
    }

    pub async fn increment_rule_hit(&self, id: i64) -> Result<()> {
        self.call(|reply| Op::IncrementRuleHit(id, reply)).await
    }

    pub async fn insert_event(
        &self,
        session_id: String,
        event_type: EventType,
        message: String,
    ) -> Result<i64> {
        self.call(|reply| Op::InsertEvent {
            session_id,
            event_type,
            message,
            reply,
        })
        .await
    }

    pub async fn set_event_platform_message_id(&self, id: i64, platform_id: String) -> Result<()> {
        self.call(|reply| Op::SetEventPlatformMessageId(id, platform_id, reply))
            .await
    }

    pub async fn ack_event(&self, id: i64) -> Result<()> {
        self.call(|reply| Op::AckEvent(id, reply)).await
    }

    /// Delete Commands and Events older than 30 days (§4.11, §8). Called
    /// once at boot, immediately after `open`.
    pub async fn prune_old(&self) -> Result<u64> {
        self.call(Op::PruneOld).await
    }

    /// Snapshot of every persisted session row, for `/status` and startup
    /// reconciliation. The in-memory `SessionManager` remains the source of
    /// truth during a run; this reflects the last-persisted state.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.call(Op::ListSessions).await
    }
}

fn writer_loop(conn: Connection, mut rx: mpsc::Receiver<Op>) {
    while let Some(op) = rx.blocking_recv() {
        match op {
            Op::UpsertSession(session, reply) => {
                let _ = reply.send(upsert_session(&conn, &session));
            }
            Op::InsertCommand(row, reply) => {
                let _ = reply.send(insert_command(&conn, &row));
            }
            Op::InsertAutoRule {
                pattern,
                response,
                match_type,
                reply,
            } => {
                let _ = reply.send(insert_auto_rule(&conn, &pattern, &response, match_type));
            }
            Op::ListAutoRules(reply) => {
                let _ = reply.send(list_auto_rules(&conn));
            }
            Op::IncrementRuleHit(id, reply) => {
                let _ = reply.send(increment_rule_hit(&conn, id));
            }
            Op::InsertEvent {
                session_id,
                event_type,
                message,
                reply,
            } => {
                let _ = reply.send(insert_event(&conn, &session_id, event_type, &message));
            }
            Op::SetEventPlatformMessageId(id, platform_id, reply) => {
                let _ = reply.send(set_event_platform_message_id(&conn, id, &platform_id));
            }
            Op::AckEvent(id, reply) => {
                let _ = reply.send(ack_event(&conn, id));
            }
            Op::PruneOld(reply) => {
                let _ = reply.send(prune_old(&conn));
            }
            Op::ListSessions(reply) => {
                let _ = reply.send(list_sessions(&conn));
            }
        }
    }
}

fn upsert_session(conn: &Connection, s: &Session) -> Result<()> {
    let type_str = match s.session_type {
        SessionType::AssistantCli => "assistant-cli",
        SessionType::InteractiveShell => "interactive-shell",
        SessionType::OneShot => "one-shot",
    };
    let status_str = match s.status {
        SessionStatus::Running => "running",
        SessionStatus::Paused => "paused",
        SessionStatus::Waiting => "waiting",
        SessionStatus::Error => "error",
        SessionStatus::Exited => "exited",
        SessionStatus::RateLimited => "rate-limited",
    };
    conn.execute(
        "INSERT INTO sessions (id, number, alias, type, working_dir, mux_session, mux_pane_id,
            pid, status, color_token, token_used, token_limit, last_activity, last_summary,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, 0, 0, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
            number = excluded.number, alias = excluded.alias, status = excluded.status,
            pid = excluded.pid, last_activity = excluded.last_activity,
            last_summary = excluded.last_summary, updated_at = excluded.updated_at",
        rusqlite::params![
            s.id,
            s.number,
            s.alias,
            type_str,
            s.working_dir,
            s.mux_target,
            s.pid,
            status_str,
            s.color_token,
            epoch_secs(s.last_activity),
            s.last_summary,
            epoch_secs(s.created_at),
            epoch_secs(s.updated_at),
        ],
    )
    .context("failed to upsert session row")?;
    Ok(())
}

fn epoch_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn insert_command(conn: &Connection, row: &CommandRow) -> Result<i64> {
    conn.execute(
        "INSERT INTO commands (session_id, source, input, context, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            row.session_id,
            row.source.as_str(),
            row.input,
            row.context,
            unix_now()
        ],
    )
    .context("failed to insert command row")?;
    Ok(conn.last_insert_rowid())
}

fn insert_auto_rule(
    conn: &Connection,
    pattern: &str,
    response: &str,
    match_type: MatchType,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO auto_rules (pattern, response, match_type, enabled, hit_count, created_at)
         VALUES (?1, ?2, ?3, 1, 0, ?4)",
        rusqlite::params![pattern, response, match_type.as_str(), unix_now()],
    )
    .context("failed to insert auto_rule row")?;
    Ok(conn.last_insert_rowid())
}

fn list_auto_rules(conn: &Connection) -> Result<Vec<AutoRuleRow>> {
    let mut stmt = conn
        .prepare("SELECT id, pattern, response, match_type, enabled, hit_count FROM auto_rules ORDER BY id")
        .context("failed to prepare auto_rules query")?;
    let rows = stmt
        .query_map([], |row| {
            let match_type_str: String = row.get(3)?;
            let match_type = match match_type_str.as_str() {
                "exact" => MatchType::Exact,
                "contains" => MatchType::Contains,
                _ => MatchType::Regex,
            };
            Ok(AutoRuleRow {
                id: row.get(0)?,
                pattern: row.get(1)?,
                response: row.get(2)?,
                match_type,
                enabled: row.get::<_, i64>(4)? != 0,
                hit_count: row.get::<_, i64>(5)? as u64,
            })
        })
        .context("failed to query auto_rules")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to collect auto_rules rows")
}

fn increment_rule_hit(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE auto_rules SET hit_count = hit_count + 1 WHERE id = ?1",
        rusqlite::params![id],
    )
    .context("failed to increment auto_rule hit count")?;
    Ok(())
}

fn insert_event(
    conn: &Connection,
    session_id: &str,
    event_type: EventType,
    message: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (session_id, event_type, message, acknowledged, platform_message_id, timestamp)
         VALUES (?1, ?2, ?3, 0, NULL, ?4)",
        rusqlite::params![session_id, event_type.as_str(), message, unix_now()],
    )
    .context("failed to insert event row")?;
    Ok(conn.last_insert_rowid())
}

fn set_event_platform_message_id(conn: &Connection, id: i64, platform_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE events SET platform_message_id = ?1 WHERE id = ?2",
        rusqlite::params![platform_id, id],
    )
    .context("failed to set event platform_message_id")?;
    Ok(())
}

fn ack_event(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE events SET acknowledged = 1 WHERE id = ?1",
        rusqlite::params![id],
    )
    .context("failed to acknowledge event")?;
    Ok(())
}

fn color_token_from_str(s: &str) -> &'static str {
    crate::session::COLOR_PALETTE
        .iter()
        .find(|c| **c == s)
        .copied()
        .unwrap_or(crate::session::COLOR_PALETTE[0])
}

fn list_sessions(conn: &Connection) -> Result<Vec<Session>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, number, alias, type, working_dir, mux_session, pid, status,
                    color_token, last_activity, last_summary, created_at, updated_at
             FROM sessions ORDER BY number",
        )
        .context("failed to prepare sessions query")?;
    let rows = stmt
        .query_map([], |row| {
            let type_str: String = row.get(3)?;
            let session_type = match type_str.as_str() {
                "interactive-shell" => SessionType::InteractiveShell,
                "one-shot" => SessionType::OneShot,
                _ => SessionType::AssistantCli,
            };
            let status_str: String = row.get(7)?;
            let status = match status_str.as_str() {
                "paused" => SessionStatus::Paused,
                "waiting" => SessionStatus::Waiting,
                "error" => SessionStatus::Error,
                "exited" => SessionStatus::Exited,
                "rate-limited" => SessionStatus::RateLimited,
                _ => SessionStatus::Running,
            };
            let color_token: String = row.get(8)?;
            let last_activity: i64 = row.get(9)?;
            let created_at: i64 = row.get(11)?;
            let updated_at: i64 = row.get(12)?;

            Ok(Session {
                id: row.get(0)?,
                number: row.get(1)?,
                alias: row.get(2)?,
                session_type,
                working_dir: row.get(4)?,
                mux_target: row.get(5)?,
                pid: row.get::<_, Option<i64>>(6)?.map(|p| p as u32),
                status,
                color_token: color_token_from_str(&color_token),
                message_count: 0,
                last_activity: UNIX_EPOCH + Duration::from_secs(last_activity.max(0) as u64),
                last_summary: row.get(10)?,
                created_at: UNIX_EPOCH + Duration::from_secs(created_at.max(0) as u64),
                updated_at: UNIX_EPOCH + Duration::from_secs(updated_at.max(0) as u64),
            })
        })
        .context("failed to query sessions")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to collect sessions rows")
}

fn prune_old(conn: &Connection) -> Result<u64> {
    let cutoff = unix_now() - PRUNE_AFTER.as_secs() as i64;
    let commands_deleted = conn
        .execute("DELETE FROM commands WHERE timestamp < ?1", rusqlite::params![cutoff])
        .context("failed to prune old commands")?;
    let events_deleted = conn
        .execute("DELETE FROM events WHERE timestamp < ?1", rusqlite::params![cutoff])
        .context("failed to prune old events")?;
    Ok((commands_deleted + events_deleted) as u64)
}
