//! The Session data model and its in-process manager (§3).
//!
//! The session manager owns every `Session` record; no other component
//! mutates one directly — cross-component communication about a session is
//! always by message, never by reaching into this table (§3 "Ownership").

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The six-element color palette, reused on teardown (§9 "Open questions").
pub const COLOR_PALETTE: [&str; 6] = ["red", "green", "yellow", "blue", "magenta", "cyan"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    AssistantCli,
    InteractiveShell,
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Running,
    Paused,
    Waiting,
    Error,
    Exited,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub number: u32,
    pub alias: String,
    pub session_type: SessionType,
    pub working_dir: String,
    pub mux_target: String,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub color_token: &'static str,
    pub message_count: u64,
    pub last_activity: SystemTime,
    pub last_summary: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Owns every non-exited `Session`, enforcing the invariants of §3:
/// unique numbers/aliases among non-exited sessions, a concurrency cap, and
/// color-token reuse via a free pool.
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    max_concurrent: u32,
    next_number: u32,
    free_numbers: Vec<u32>,
    free_colors: Vec<&'static str>,
}

impl SessionManager {
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            sessions: HashMap::new(),
            max_concurrent,
            next_number: 1,
            free_numbers: Vec::new(),
            free_colors: COLOR_PALETTE.to_vec(),
        }
    }

    fn active_count(&self) -> u32 {
        self.sessions
            .values()
            .filter(|s| s.status != SessionStatus::Exited)
            .count() as u32
    }

    fn alias_taken(&self, alias: &str) -> bool {
        self.sessions
            .values()
            .any(|s| s.status != SessionStatus::Exited && s.alias == alias)
    }

    fn derive_alias(&self, working_dir: &str) -> String {
        let base = std::path::Path::new(working_dir)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("session")
            .to_string();

        if !self.alias_taken(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.alias_taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn next_free_number(&mut self) -> u32 {
        if let Some(n) = self.free_numbers.pop() {
            return n;
        }
        let n = self.next_number;
        self.next_number += 1;
        n
    }

    fn next_free_color(&mut self) -> &'static str {
        self.free_colors
            .pop()
            .unwrap_or(COLOR_PALETTE[(self.sessions.len()) % COLOR_PALETTE.len()])
    }

    /// Create a new session. Fails if the concurrency cap (§3) is reached
    /// or the requested alias is already taken by an active session.
    pub fn create(
        &mut self,
        session_type: SessionType,
        working_dir: String,
        mux_target: String,
        alias_override: Option<String>,
    ) -> Result<Session> {
        if self.active_count() >= self.max_concurrent {
            bail!(
                "cannot create session: {} concurrent sessions already running (max {})",
                self.active_count(),
                self.max_concurrent
            );
        }

        let alias = match alias_override {
            Some(a) => {
                if self.alias_taken(&a) {
                    bail!("alias '{a}' is already in use by an active session");
                }
                a
            }
            None => self.derive_alias(&working_dir),
        };

        let now = SystemTime::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            number: self.next_free_number(),
            alias,
            session_type,
            working_dir,
            mux_target,
            pid: None,
            status: SessionStatus::Running,
            color_token: self.next_free_color(),
            message_count: 0,
            last_activity: now,
            last_summary: None,
            created_at: now,
            updated_at: now,
        };

        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<&Session> {
        self.sessions.values().find(|s| s.alias.eq_ignore_ascii_case(alias))
    }

    pub fn find_by_number(&self, number: u32) -> Option<&Session> {
        self.sessions.values().find(|s| s.number == number)
    }

    pub fn active_sessions(&self) -> Vec<&Session> {
        self.sessions
            .values()
            .filter(|s| s.status != SessionStatus::Exited)
            .collect()
    }

    /// Transition a session's status. A `Paused` session can never move
    /// directly to `Exited` without an intermediate observation (§3) — the
    /// caller must route through `Waiting`, `Running`, or `Error` first.
    pub fn set_status(&mut self, id: &str, status: SessionStatus) -> Result<()> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown session id {id}"))?;

        if session.status == SessionStatus::Paused && status == SessionStatus::Exited {
            bail!("session {id} cannot transition directly from paused to exited");
        }

        session.status = status;
        session.updated_at = SystemTime::now();

        if status == SessionStatus::Exited {
            self.free_numbers.push(session.number);
            self.free_colors.push(session.color_token);
        }

        Ok(())
    }

    pub fn touch_activity(&mut self, id: &str) {
        if let Some(s) = self.sessions.get_mut(id) {
            s.last_activity = SystemTime::now();
            s.updated_at = s.last_activity;
        }
    }

    pub fn increment_message_count(&mut self, id: &str) {
        if let Some(s) = self.sessions.get_mut(id) {
            s.message_count += 1;
        }
    }

    pub fn set_summary(&mut self, id: &str, summary: String) {
        if let Some(s) = self.sessions.get_mut(id) {
            s.last_summary = Some(summary);
        }
    }

    /// Record the OS pid backing a session's pane, resolved once at
    /// reattachment time (§3 `Session.pid`). Used by the rate-limit
    /// auto-pause mechanism (§4.10) to signal the right process.
    pub fn set_pid(&mut self, id: &str, pid: Option<u32>) {
        if let Some(s) = self.sessions.get_mut(id) {
            s.pid = pid;
        }
    }

    pub fn ids(&self) -> HashSet<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Rehydrate a manager from rows persisted by the store (e.g. at daemon
    /// startup, §4.11) without re-running `create`'s allocation logic —
    /// numbers, aliases, and color tokens were already assigned and must be
    /// reused verbatim, not reallocated.
    pub fn restore(max_concurrent: u32, rows: Vec<Session>) -> Self {
        let mut mgr = Self::new(max_concurrent);
        let mut max_number = 0;
        let mut used_colors: HashSet<&'static str> = HashSet::new();

        for session in rows {
            if session.status != SessionStatus::Exited {
                max_number = max_number.max(session.number);
                used_colors.insert(session.color_token);
            }
            mgr.sessions.insert(session.id.clone(), session);
        }

        mgr.next_number = max_number + 1;
        mgr.free_colors = COLOR_PALETTE
            .iter()
            .copied()
            .filter(|c| !used_colors.contains(c))
            .collect();
        mgr
    }
}
