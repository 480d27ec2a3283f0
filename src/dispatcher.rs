//! Event Dispatcher (§4.10): the single component that knows every other
//! component. Consumes classified pane events and orchestrates the
//! auto-responder, notifier, AI adapter, confirmation manager, token
//! estimator, and store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::ai::{self, AiAdapter};
use crate::autoresponder::{self, Decision};
use crate::classifier::{DetectionResult, DetectionType};
use crate::config::{AiConfig, AutoResponderConfig};
use crate::confirmation::ConfirmationManager;
use crate::errors::{ErrorEscalation, ErrorKind};
use crate::monitor::{MonitorEvent, MonitorEventKind};
use crate::notifier::{ButtonSpec, Notification, NotificationKind, Notifier};
use crate::pane::PaneAdapter;
use crate::session::{SessionManager, SessionStatus};
use crate::store::{CommandRow, CommandSource, EventType, Store};
use crate::tokens::{ThresholdLevel, TokenEstimator};

/// The last session a permission/input prompt was raised for, used to
/// resolve an otherwise-ambiguous reply from the user (§4.10).
struct LastPrompt {
    session_id: String,
    text: String,
    at: Instant,
}

const LAST_PROMPT_TTL: Duration = Duration::from_secs(60);

/// Default undo window for an auto-response (§4.5).
const UNDO_TTL: Duration = Duration::from_secs(30);

/// Cap on the in-memory undo/suggestion registries so a long-running daemon
/// doesn't accumulate one entry per completion/auto-response forever.
const MAX_PENDING_ENTRIES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResolution {
    Resolved(String),
    AskUser,
}

pub struct Dispatcher {
    sessions: Arc<Mutex<SessionManager>>,
    panes: Arc<Mutex<HashMap<String, Arc<dyn PaneAdapter>>>>,
    store: Store,
    notifier: Arc<Notifier>,
    ai: Arc<dyn AiAdapter>,
    ai_config: AiConfig,
    auto_responder_config: AutoResponderConfig,
    confirmations: Arc<ConfirmationManager>,
    tokens: Arc<Mutex<TokenEstimator>>,
    error_escalation: Arc<Mutex<ErrorEscalation>>,
    last_prompting: Mutex<Option<LastPrompt>>,
    globally_paused: Mutex<bool>,
    last_token_level: Mutex<HashMap<String, ThresholdLevel>>,
    /// event_id -> (session_id, created_at); consumed by `commands::undo`
    /// activating the "Undo" button (§4.5).
    pending_undos: Mutex<HashMap<i64, (String, Instant)>>,
    /// event_id -> (session_id, suggestions); read by `commands::run_suggestion`
    /// activating a "suggest:<event_id>:<index>" button (§4.9, §4.10).
    pending_suggestions: Mutex<HashMap<i64, (String, Vec<ai::Suggestion>)>>,
}

/// Evict the oldest entries (smallest event ids, since ids are
/// monotonically assigned) once a registry grows past `max`.
fn evict_oldest<V>(map: &mut HashMap<i64, V>, max: usize) {
    if map.len() <= max {
        return;
    }
    let mut keys: Vec<i64> = map.keys().copied().collect();
    keys.sort_unstable();
    for key in keys.into_iter().take(map.len() - max) {
        map.remove(&key);
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<Mutex<SessionManager>>,
        panes: Arc<Mutex<HashMap<String, Arc<dyn PaneAdapter>>>>,
        store: Store,
        notifier: Arc<Notifier>,
        ai: Arc<dyn AiAdapter>,
        ai_config: AiConfig,
        auto_responder_config: AutoResponderConfig,
        confirmations: Arc<ConfirmationManager>,
        tokens: Arc<Mutex<TokenEstimator>>,
        error_escalation: Arc<Mutex<ErrorEscalation>>,
    ) -> Self {
        Self {
            sessions,
            panes,
            store,
            notifier,
            ai,
            ai_config,
            auto_responder_config,
            confirmations,
            tokens,
            error_escalation,
            last_prompting: Mutex::new(None),
            globally_paused: Mutex::new(false),
            last_token_level: Mutex::new(HashMap::new()),
            pending_undos: Mutex::new(HashMap::new()),
            pending_suggestions: Mutex::new(HashMap::new()),
        }
    }

    /// Drain monitor events until every monitor's sender has dropped.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<MonitorEvent>) {
        while let Some(event) = events.recv().await {
            let session_id = event.session_id.clone();
            match event.kind {
                MonitorEventKind::NewOutput(lines) => self.handle_new_output(&session_id, &lines).await,
                MonitorEventKind::Detection(detection, text) => {
                    self.handle_detection(&session_id, detection, &text).await
                }
                MonitorEventKind::CompletionIdle => self.handle_completion(&session_id).await,
                MonitorEventKind::PaneGone => self.handle_pane_gone(&session_id).await,
            }
        }
    }

    async fn handle_new_output(&self, session_id: &str, lines: &[String]) {
        {
            let mut tokens = self.tokens.lock().await;
            if lines.is_empty() {
                tokens.note_idle(session_id);
            } else {
                tokens.note_output(session_id, lines.len());
            }
        }
        self.check_token_thresholds(session_id).await;
    }

    /// Re-evaluate token-budget thresholds for `session_id` on this
    /// dispatcher tick (§4.7, §4.12). Only acts on a crossing into a new,
    /// higher tier so a sustained high-usage session doesn't re-notify
    /// every tick; critical usage additionally drives the session to
    /// `rate-limited` per §8's invariant.
    async fn check_token_thresholds(&self, session_id: &str) {
        let level = {
            let mut tokens = self.tokens.lock().await;
            tokens.check_thresholds(Some(session_id))
        };

        let crossed = {
            let mut last = self.last_token_level.lock().await;
            let previous = last.insert(session_id.to_string(), level).unwrap_or(ThresholdLevel::None);
            previous != level && level != ThresholdLevel::None
        };
        if !crossed {
            return;
        }

        if level == ThresholdLevel::Critical {
            let mut sessions = self.sessions.lock().await;
            if let Err(err) = sessions.set_status(session_id, SessionStatus::RateLimited) {
                warn!(session_id, %err, "failed to mark session rate-limited after critical token usage");
            }
        }

        let label = match level {
            ThresholdLevel::Critical => "critical",
            ThresholdLevel::Danger => "danger",
            ThresholdLevel::Warning => "warning",
            ThresholdLevel::None => return,
        };
        let message = format!("token usage crossed the {label} threshold");
        let event_id = self.record_event(session_id, EventType::TokenWarning, &message).await;
        self.notifier
            .send(Notification {
                kind: NotificationKind::TokenWarning,
                body: format!("[{session_id}] {message}"),
                buttons: Vec::new(),
            })
            .await;
        let _ = event_id;
    }

    async fn handle_detection(&self, session_id: &str, detection: DetectionResult, full_text: &str) {
        match detection.detection_type {
            DetectionType::PermissionPrompt => self.handle_permission_prompt(session_id, &detection).await,
            DetectionType::InputPrompt => self.handle_input_prompt(session_id, &detection, full_text).await,
            DetectionType::RateLimit => self.handle_rate_limit(session_id, &detection).await,
            DetectionType::Error => self.handle_error(session_id, &detection).await,
            DetectionType::Completion => self.handle_completion(session_id).await,
            DetectionType::None => {}
        }
    }

    async fn remember_prompting_session(&self, session_id: &str, text: &str) {
        let mut last = self.last_prompting.lock().await;
        *last = Some(LastPrompt {
            session_id: session_id.to_string(),
            text: text.to_string(),
            at: Instant::now(),
        });
    }

    async fn handle_permission_prompt(&self, session_id: &str, detection: &DetectionResult) {
        let event_id = self
            .record_event(session_id, EventType::InputRequired, &detection.matched_text)
            .await;
        self.remember_prompting_session(session_id, &detection.matched_text).await;

        let buttons = vec![
            ButtonSpec { label: "Allow".into(), callback_data: format!("perm:allow:{session_id}") },
            ButtonSpec { label: "Deny".into(), callback_data: format!("perm:deny:{session_id}") },
            ButtonSpec { label: "Show context".into(), callback_data: format!("perm:context:{session_id}") },
        ];
        self.send_immediate(event_id, NotificationKind::PermissionPrompt, &detection.matched_text, buttons)
            .await;
    }

    async fn handle_input_prompt(&self, session_id: &str, detection: &DetectionResult, full_text: &str) {
        if self.auto_responder_config.enabled {
            let rules = self.store.list_auto_rules().await.unwrap_or_default();
            let paused = *self.globally_paused.lock().await;
            let decision = autoresponder::decide(
                detection.detection_type,
                full_text,
                paused,
                &rules,
            );

            if let Decision::Respond { response, rule_id } = decision {
                self.apply_auto_response(session_id, &response, rule_id).await;
                return;
            }
        }

        let event_id = self
            .record_event(session_id, EventType::InputRequired, &detection.matched_text)
            .await;
        self.remember_prompting_session(session_id, &detection.matched_text).await;

        let buttons = vec![ButtonSpec {
            label: "Reply in chat".into(),
            callback_data: format!("pick:{session_id}"),
        }];
        self.send_immediate(event_id, NotificationKind::InputPrompt, &detection.matched_text, buttons)
            .await;
    }

    async fn apply_auto_response(&self, session_id: &str, response: &str, rule_id: i64) {
        let pane = self.panes.lock().await.get(session_id).cloned();
        if let Some(pane) = pane {
            if let Err(err) = pane.send(response, true) {
                warn!(session_id, %err, "failed to deliver auto-response keystrokes");
                self.note_error(ErrorKind::PaneLost).await;
                return;
            }
        }

        let _ = self
            .store
            .insert_command(CommandRow {
                session_id: session_id.to_string(),
                source: CommandSource::Auto,
                input: response.to_string(),
                context: Some(rule_id.to_string()),
            })
            .await;
        let _ = self.store.increment_rule_hit(rule_id).await;

        let event_id = self
            .record_event(session_id, EventType::AutoResponse, &format!("auto-reply: {response}"))
            .await;
        self.register_undo(event_id, session_id.to_string()).await;

        let buttons = vec![ButtonSpec {
            label: "Undo".into(),
            callback_data: format!("undo:{event_id}"),
        }];
        self.notifier
            .send(Notification {
                kind: NotificationKind::AutoResponse,
                body: format!("[{session_id}] auto-replied: {response}"),
                buttons,
            })
            .await;
    }

    async fn handle_rate_limit(&self, session_id: &str, detection: &DetectionResult) {
        let pid = {
            let mut sessions = self.sessions.lock().await;
            if let Err(err) = sessions.set_status(session_id, SessionStatus::RateLimited) {
                warn!(session_id, %err, "failed to mark session rate-limited");
            }
            sessions.get(session_id).and_then(|s| s.pid)
        };
        self.auto_pause_pid(pid);

        let event_id = self
            .record_event(session_id, EventType::RateLimit, &detection.matched_text)
            .await;

        let buttons = vec![
            ButtonSpec { label: "Resume now".into(), callback_data: format!("rate:resume:{session_id}") },
            ButtonSpec { label: "Auto-resume in 15m".into(), callback_data: format!("rate:defer:{session_id}") },
            ButtonSpec { label: "Switch task".into(), callback_data: format!("rate:switch:{session_id}") },
        ];
        self.send_immediate(event_id, NotificationKind::RateLimit, &detection.matched_text, buttons)
            .await;
    }

    /// Auto-pause mechanism for a rate-limited session (§4.10): a stop
    /// signal on the running process, best-effort since the source gives no
    /// stronger contract than "platform-specific mechanism" (§9).
    #[cfg(unix)]
    fn auto_pause_pid(&self, pid: Option<u32>) {
        if let Some(pid) = pid {
            crate::pane::tmux::stop_process(pid);
        }
    }

    #[cfg(not(unix))]
    fn auto_pause_pid(&self, _pid: Option<u32>) {}

    async fn handle_error(&self, session_id: &str, detection: &DetectionResult) {
        let event_id = self
            .record_event(session_id, EventType::Error, &detection.matched_text)
            .await;
        self.send_immediate(event_id, NotificationKind::Error, &detection.matched_text, Vec::new())
            .await;
    }

    async fn handle_completion(&self, session_id: &str) {
        let recent = {
            let pane = self.panes.lock().await.get(session_id).cloned();
            match pane {
                Some(pane) => pane.capture_recent(200).unwrap_or_default().join("\n"),
                None => String::new(),
            }
        };

        let summary_timeout = ai::summarize_timeout(&self.ai_config);
        let fallback = ai::fallback_summary(&recent, self.ai_config.fallback_lines);
        let ai = self.ai.clone();
        let max_tokens = self.ai_config.summary_max_tokens;
        let text_for_summary = recent.clone();
        let (summary, summary_result) = ai::with_timeout_and_fallback(summary_timeout, fallback, move || {
            ai.summarize(&text_for_summary, max_tokens)
        })
        .await;
        if summary_result.is_err() {
            self.note_error(ErrorKind::TransportUnreachable).await;
        }

        let ai = self.ai.clone();
        let suggest_max_tokens = self.ai_config.suggestion_max_tokens;
        let text_for_suggest = recent.clone();
        let (suggestions, suggestion_result) =
            ai::with_timeout_and_fallback(summary_timeout, Vec::new(), move || {
                ai.suggest(&text_for_suggest, suggest_max_tokens)
            })
            .await;
        if suggestion_result.is_err() {
            self.note_error(ErrorKind::TransportUnreachable).await;
        }

        {
            let mut sessions = self.sessions.lock().await;
            sessions.set_summary(session_id, summary.clone());
        }
        {
            let mut tokens = self.tokens.lock().await;
            tokens.record_response_cycle(session_id);
        }
        self.check_token_thresholds(session_id).await;

        let event_id = self.record_event(session_id, EventType::Completed, &summary).await;
        self.register_suggestion(event_id, session_id.to_string(), suggestions.clone()).await;

        let buttons: Vec<ButtonSpec> = suggestions
            .iter()
            .enumerate()
            .map(|(i, s)| ButtonSpec {
                label: s.label.chars().take(40).collect(),
                callback_data: format!("suggest:{event_id}:{i}"),
            })
            .collect();

        self.notifier
            .send(Notification {
                kind: NotificationKind::Completion,
                body: format!("[{session_id}] {summary}"),
                buttons,
            })
            .await;
    }

    async fn handle_pane_gone(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Err(err) = sessions.set_status(session_id, SessionStatus::Exited) {
            warn!(session_id, %err, "failed to mark session exited after pane loss");
        }
        drop(sessions);
        self.note_error(ErrorKind::PaneLost).await;

        let event_id = self
            .record_event(session_id, EventType::System, "pane is no longer reachable")
            .await;
        self.notifier
            .send(Notification {
                kind: NotificationKind::System,
                body: format!("[{session_id}] session ended — pane is gone"),
                buttons: Vec::new(),
            })
            .await;
        let _ = event_id;
    }

    async fn record_event(&self, session_id: &str, event_type: EventType, message: &str) -> i64 {
        match self.store.insert_event(session_id.to_string(), event_type, message.to_string()).await {
            Ok(id) => id,
            Err(err) => {
                warn!(session_id, %err, "failed to persist event");
                self.note_error(ErrorKind::StoreBusy).await;
                -1
            }
        }
    }

    async fn send_immediate(
        &self,
        event_id: i64,
        kind: NotificationKind,
        body: &str,
        buttons: Vec<ButtonSpec>,
    ) {
        self.notifier
            .send_immediate(Notification {
                kind,
                body: body.to_string(),
                buttons,
            })
            .await;
        let _ = event_id;
    }

    async fn note_error(&self, kind: ErrorKind) {
        let escalate = self.error_escalation.lock().await.record(kind);
        if escalate {
            info!(?kind, "error kind escalated, sending single system alert");
            self.notifier
                .send_immediate(Notification {
                    kind: NotificationKind::System,
                    body: format!("repeated failures of kind {kind} — investigate"),
                    buttons: Vec::new(),
                })
                .await;
        }
    }

    /// Remember an auto-response as undoable for [`UNDO_TTL`] (§4.5).
    async fn register_undo(&self, event_id: i64, session_id: String) {
        if event_id < 0 {
            return;
        }
        let mut map = self.pending_undos.lock().await;
        map.insert(event_id, (session_id, Instant::now()));
        evict_oldest(&mut map, MAX_PENDING_ENTRIES);
    }

    /// Consume a pending undo, if any and still within its TTL. Called by
    /// `commands::undo` when the "Undo" button is tapped.
    pub async fn take_undo(&self, event_id: i64) -> Option<String> {
        let mut map = self.pending_undos.lock().await;
        let (session_id, created_at) = map.remove(&event_id)?;
        if created_at.elapsed() <= UNDO_TTL {
            Some(session_id)
        } else {
            None
        }
    }

    /// Remember a completion's suggestions so a button tap can replay the
    /// exact command, not a truncated label (§4.9, §4.10).
    async fn register_suggestion(&self, event_id: i64, session_id: String, suggestions: Vec<ai::Suggestion>) {
        if event_id < 0 {
            return;
        }
        let mut map = self.pending_suggestions.lock().await;
        map.insert(event_id, (session_id, suggestions));
        evict_oldest(&mut map, MAX_PENDING_ENTRIES);
    }

    /// Look up the session and command for a `suggest:<event_id>:<index>`
    /// callback. Called by `commands::run_suggestion`.
    pub async fn take_suggestion(&self, event_id: i64, index: usize) -> Option<(String, ai::Suggestion)> {
        let map = self.pending_suggestions.lock().await;
        let (session_id, suggestions) = map.get(&event_id)?;
        suggestions.get(index).map(|s| (session_id.clone(), s.clone()))
    }

    #[cfg(test)]
    pub(crate) async fn register_undo_for_test(&self, event_id: i64, session_id: String) {
        self.register_undo(event_id, session_id).await;
    }

    #[cfg(test)]
    pub(crate) async fn register_suggestion_for_test(
        &self,
        event_id: i64,
        session_id: String,
        suggestions: Vec<ai::Suggestion>,
    ) {
        self.register_suggestion(event_id, session_id, suggestions).await;
    }

    /// Ambiguous session resolution for a user-originated chat message
    /// (§4.10). Tries, in order: the last prompting session (if the message
    /// reads like a short reply), an explicit `#N`/alias reference, the
    /// sole active session, then an AI guess above the confidence floor.
    pub async fn resolve_session(&self, user_text: &str) -> SessionResolution {
        let trimmed = user_text.trim();

        if looks_like_reply(trimmed) {
            let last = self.last_prompting.lock().await;
            if let Some(prompt) = last.as_ref() {
                if prompt.at.elapsed() <= LAST_PROMPT_TTL {
                    return SessionResolution::Resolved(prompt.session_id.clone());
                }
            }
        }

        if let Some(rest) = trimmed.strip_prefix('#') {
            if let Ok(number) = rest.trim().parse::<u32>() {
                let sessions = self.sessions.lock().await;
                if let Some(session) = sessions.find_by_number(number) {
                    return SessionResolution::Resolved(session.id.clone());
                }
            }
        }
        {
            let sessions = self.sessions.lock().await;
            let lower = trimmed.to_lowercase();
            let matches: Vec<&crate::session::Session> = sessions
                .active_sessions()
                .into_iter()
                .filter(|s| lower.contains(&s.alias.to_lowercase()))
                .collect();
            if matches.len() == 1 {
                return SessionResolution::Resolved(matches[0].id.clone());
            }
        }

        {
            let sessions = self.sessions.lock().await;
            let active = sessions.active_sessions();
            if active.len() == 1 {
                return SessionResolution::Resolved(active[0].id.clone());
            }
        }

        // AI-assisted guess: accepted only above the confidence floor (§4.10
        // step 4). A miss or timeout just falls through to AskUser.
        if let Some(parsed) = self.ai_parse_nl(trimmed).await {
            if parsed.confidence > 0.8 {
                if let Some(alias) = parsed.session.as_deref() {
                    let sessions = self.sessions.lock().await;
                    if let Some(session) = sessions
                        .find_by_alias(alias)
                        .or_else(|| alias.parse::<u32>().ok().and_then(|n| sessions.find_by_number(n)))
                    {
                        return SessionResolution::Resolved(session.id.clone());
                    }
                }
            }
        }

        SessionResolution::AskUser
    }

    /// Run `parse_nl_command` with the dispatcher's configured timeout,
    /// feeding it the active session aliases and the last prompt text as
    /// context (§4.9, §4.10 step 4). `None` on timeout, error, or a
    /// below-floor/unclassified reply.
    async fn ai_parse_nl(&self, message: &str) -> Option<ai::ParsedNlCommand> {
        let session_list: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions.active_sessions().into_iter().map(|s| s.alias.clone()).collect()
        };
        let last_prompt = {
            let last = self.last_prompting.lock().await;
            last.as_ref().map(|p| p.text.clone())
        };

        let ai = self.ai.clone();
        let timeout = ai::summarize_timeout(&self.ai_config);
        let max_tokens = self.ai_config.nlp_max_tokens;
        let message = message.to_string();
        let (parsed, result) = ai::with_timeout_and_fallback(timeout, None, move || {
            ai.parse_nl_command(&message, &session_list, last_prompt.as_deref(), max_tokens)
        })
        .await;
        if result.is_err() {
            self.note_error(ErrorKind::TransportUnreachable).await;
        }
        parsed
    }

    pub async fn set_globally_paused(&self, paused: bool) {
        *self.globally_paused.lock().await = paused;
    }

    pub async fn is_globally_paused(&self) -> bool {
        *self.globally_paused.lock().await
    }

    pub fn sessions(&self) -> &Arc<Mutex<SessionManager>> {
        &self.sessions
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn confirmations(&self) -> &Arc<ConfirmationManager> {
        &self.confirmations
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }
}

/// A reply "looks like" a short acknowledgement: a handful of characters,
/// a bare digit, or a y/n-family token (§4.10 step 1).
fn looks_like_reply(text: &str) -> bool {
    if text.len() <= 3 {
        return true;
    }
    let lower = text.to_lowercase();
    matches!(lower.as_str(), "yes" | "no" | "yep" | "nope" | "sure" | "cancel")
        || lower.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_looks_like_reply() {
        assert!(looks_like_reply("y"));
        assert!(looks_like_reply("42"));
        assert!(looks_like_reply("yes"));
    }

    #[test]
    fn long_text_does_not_look_like_reply() {
        assert!(!looks_like_reply("please restart the build when you get a chance"));
    }

    use crate::ai::AiAdapter;
    use crate::config::{AiConfig, AutoResponderConfig, TokensConfig};
    use crate::notifier::telegram::{Button, ChatAdapter};
    use crate::notifier::QuietHoursWindow;
    use crate::session::{SessionManager, SessionType};
    use crate::store::MatchType;

    struct NullChatAdapter;
    impl ChatAdapter for NullChatAdapter {
        fn send_message(&self, _: &str, _: &[Button]) -> anyhow::Result<String> {
            Ok("1".into())
        }
        fn edit_message(&self, _: &str, _: &str, _: &[Button]) -> anyhow::Result<()> {
            Ok(())
        }
        fn delete_message(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn who_am_i(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn answer_callback_query(&self, _: &str, _: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NullAiAdapter;
    impl AiAdapter for NullAiAdapter {
        fn summarize(&self, _: &str, _: u32) -> anyhow::Result<String> {
            Ok("summary".into())
        }
        fn suggest(&self, _: &str, _: u32) -> anyhow::Result<Vec<ai::Suggestion>> {
            Ok(Vec::new())
        }
        fn parse_nl_command(
            &self,
            _: &str,
            _: &[String],
            _: Option<&str>,
            _: u32,
        ) -> anyhow::Result<Option<ai::ParsedNlCommand>> {
            Ok(None)
        }
    }

    async fn test_dispatcher(tokens_config: TokensConfig) -> (Arc<Dispatcher>, String) {
        let store = Store::open_in_memory().unwrap();
        let mut mgr = SessionManager::new(4);
        let session = mgr
            .create(SessionType::AssistantCli, "/tmp/proj".into(), "t:proj".into(), None)
            .unwrap();
        let session_id = session.id.clone();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Mutex::new(mgr)),
            Arc::new(Mutex::new(HashMap::new())),
            store,
            Arc::new(Notifier::new(Arc::new(NullChatAdapter), QuietHoursWindow::none())),
            Arc::new(NullAiAdapter),
            AiConfig::default(),
            AutoResponderConfig::default(),
            Arc::new(ConfirmationManager::new()),
            Arc::new(Mutex::new(TokenEstimator::new(tokens_config))),
            Arc::new(Mutex::new(ErrorEscalation::new())),
        ));
        (dispatcher, session_id)
    }

    #[tokio::test]
    async fn completion_increments_response_cycle_exactly_once() {
        let (dispatcher, session_id) = test_dispatcher(TokensConfig::default()).await;
        dispatcher.handle_completion(&session_id).await;
        let mut tokens = dispatcher.tokens.lock().await;
        assert_eq!(tokens.get_usage(Some(&session_id)).used, 1);
    }

    #[tokio::test]
    async fn completion_after_preceding_burst_does_not_double_count() {
        // The real end-to-end sequence (§8 scenario 4): a monitor reports an
        // empty (idle) burst, then a non-empty burst satisfying
        // note_output's idle+line-count criteria, then ~30s later a
        // synthetic completion for the same exchange. The counter must land
        // on exactly 1, not 2.
        let (dispatcher, session_id) = test_dispatcher(TokensConfig::default()).await;
        {
            let mut tokens = dispatcher.tokens.lock().await;
            tokens.idle_floor = Duration::from_millis(1);
        }

        dispatcher.handle_new_output(&session_id, &[]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let burst: Vec<String> = (0..6).map(|i| format!("line {i}")).collect();
        dispatcher.handle_new_output(&session_id, &burst).await;

        dispatcher.handle_completion(&session_id).await;

        let mut tokens = dispatcher.tokens.lock().await;
        assert_eq!(tokens.get_usage(Some(&session_id)).used, 1);
    }

    #[tokio::test]
    async fn critical_token_usage_marks_session_rate_limited() {
        // warning=1, danger=2, critical=3 messages — easy to cross in a test.
        let config = TokensConfig {
            plan_tier: crate::config::PlanTier::Pro,
            warning_pct: 80,
            danger_pct: 90,
            critical_pct: 95,
            window_hours: 5,
        };
        let (dispatcher, session_id) = test_dispatcher(config).await;

        {
            let mut tokens = dispatcher.tokens.lock().await;
            // 43/45 ~= 96% -> critical.
            for _ in 0..43 {
                tokens.record_response_cycle(&session_id);
            }
        }

        dispatcher.check_token_thresholds(&session_id).await;

        let sessions = dispatcher.sessions().lock().await;
        let status = sessions.active_sessions().into_iter().find(|s| s.id == session_id).map(|s| s.status);
        assert_eq!(status, Some(SessionStatus::RateLimited));
    }

    #[tokio::test]
    async fn rate_limit_detection_marks_session_rate_limited_without_a_known_pid() {
        use crate::classifier::{DetectionResult, DetectionType};
        let (dispatcher, session_id) = test_dispatcher(TokensConfig::default()).await;

        // No pid was ever recorded for this session (reattachment never ran) —
        // the auto-pause stop-signal path must be a no-op, not a panic.
        let detection = DetectionResult {
            detection_type: DetectionType::RateLimit,
            matched_text: "rate limit exceeded, try again in 30s".to_string(),
            pattern: "rate-limit-phrase".to_string(),
            confidence: 0.9,
        };
        dispatcher.handle_rate_limit(&session_id, &detection).await;

        let sessions = dispatcher.sessions().lock().await;
        let status = sessions.active_sessions().into_iter().find(|s| s.id == session_id).map(|s| s.status);
        assert_eq!(status, Some(SessionStatus::RateLimited));
    }

    #[tokio::test]
    async fn auto_rule_is_skipped_for_destructive_keyword_in_full_text() {
        use crate::classifier::{DetectionResult, DetectionType};
        let (dispatcher, session_id) = test_dispatcher(TokensConfig::default()).await;
        add_auto_rule_for_test(&dispatcher, "Continue", MatchType::Contains, "y").await;

        // "?" alone (the narrow classifier match span) contains no destructive
        // keyword, but the full prompt text does — the guard must see the
        // full text to catch it.
        let detection = DetectionResult {
            detection_type: DetectionType::InputPrompt,
            matched_text: "?".to_string(),
            pattern: "open-question".to_string(),
            confidence: 0.6,
        };
        dispatcher
            .handle_detection(&session_id, detection, "Continue deleting the branch?")
            .await;

        let commands = dispatcher.store().list_auto_rules().await.unwrap();
        assert_eq!(commands[0].hit_count, 0, "destructive prompt must not have triggered the auto-rule");
    }

    async fn add_auto_rule_for_test(dispatcher: &Dispatcher, pattern: &str, match_type: MatchType, response: &str) {
        dispatcher
            .store()
            .insert_auto_rule(pattern.to_string(), response.to_string(), match_type)
            .await
            .unwrap();
    }

    struct ConfidentAiAdapter {
        reply: ai::ParsedNlCommand,
    }

    impl AiAdapter for ConfidentAiAdapter {
        fn summarize(&self, _: &str, _: u32) -> anyhow::Result<String> {
            Ok("summary".into())
        }
        fn suggest(&self, _: &str, _: u32) -> anyhow::Result<Vec<ai::Suggestion>> {
            Ok(Vec::new())
        }
        fn parse_nl_command(
            &self,
            _: &str,
            _: &[String],
            _: Option<&str>,
            _: u32,
        ) -> anyhow::Result<Option<ai::ParsedNlCommand>> {
            Ok(Some(self.reply.clone()))
        }
    }

    #[tokio::test]
    async fn resolve_session_accepts_a_confident_ai_guess_when_otherwise_ambiguous() {
        let store = Store::open_in_memory().unwrap();
        let mut mgr = SessionManager::new(4);
        mgr.create(SessionType::AssistantCli, "/tmp/a".into(), "alpha".into(), None).unwrap();
        let target = mgr.create(SessionType::AssistantCli, "/tmp/b".into(), "bravo".into(), None).unwrap();
        let target_id = target.id.clone();

        let dispatcher = Dispatcher::new(
            Arc::new(Mutex::new(mgr)),
            Arc::new(Mutex::new(HashMap::new())),
            store,
            Arc::new(Notifier::new(Arc::new(NullChatAdapter), QuietHoursWindow::none())),
            Arc::new(ConfidentAiAdapter {
                reply: ai::ParsedNlCommand {
                    command: "pause".to_string(),
                    session: Some("bravo".to_string()),
                    args: Vec::new(),
                    confidence: 0.95,
                },
            }),
            AiConfig::default(),
            AutoResponderConfig::default(),
            Arc::new(ConfirmationManager::new()),
            Arc::new(Mutex::new(TokenEstimator::new(TokensConfig::default()))),
            Arc::new(Mutex::new(ErrorEscalation::new())),
        );

        // Long enough not to "look like a reply", names neither session, and
        // with two active sessions the sole-active-session shortcut doesn't
        // fire either — only the AI guess can resolve this.
        let resolution = dispatcher.resolve_session("go ahead and pause that one please").await;
        assert_eq!(resolution, SessionResolution::Resolved(target_id));
    }

    #[tokio::test]
    async fn resolve_session_ignores_a_low_confidence_ai_guess() {
        let store = Store::open_in_memory().unwrap();
        let mut mgr = SessionManager::new(4);
        mgr.create(SessionType::AssistantCli, "/tmp/a".into(), "alpha".into(), None).unwrap();
        mgr.create(SessionType::AssistantCli, "/tmp/b".into(), "bravo".into(), None).unwrap();

        let dispatcher = Dispatcher::new(
            Arc::new(Mutex::new(mgr)),
            Arc::new(Mutex::new(HashMap::new())),
            store,
            Arc::new(Notifier::new(Arc::new(NullChatAdapter), QuietHoursWindow::none())),
            Arc::new(ConfidentAiAdapter {
                reply: ai::ParsedNlCommand {
                    command: "pause".to_string(),
                    session: Some("bravo".to_string()),
                    args: Vec::new(),
                    confidence: 0.4,
                },
            }),
            AiConfig::default(),
            AutoResponderConfig::default(),
            Arc::new(ConfirmationManager::new()),
            Arc::new(Mutex::new(TokenEstimator::new(TokensConfig::default()))),
            Arc::new(Mutex::new(ErrorEscalation::new())),
        );

        let resolution = dispatcher.resolve_session("go ahead and pause that one please").await;
        assert_eq!(resolution, SessionResolution::AskUser);
    }

    #[tokio::test]
    async fn undo_registry_expires_after_its_ttl() {
        let (dispatcher, session_id) = test_dispatcher(TokensConfig::default()).await;
        dispatcher.register_undo_for_test(1, session_id.clone()).await;
        assert_eq!(dispatcher.take_undo(1).await, Some(session_id));
        // Consumed once — a second tap on the same event finds nothing.
        assert_eq!(dispatcher.take_undo(1).await, None);
    }

    #[tokio::test]
    async fn suggestion_registry_resolves_by_index() {
        let (dispatcher, session_id) = test_dispatcher(TokensConfig::default()).await;
        let suggestions = vec![
            ai::Suggestion { label: "Run tests".into(), command: "cargo test".into() },
            ai::Suggestion { label: "Build".into(), command: "cargo build".into() },
        ];
        dispatcher.register_suggestion_for_test(5, session_id.clone(), suggestions).await;

        let (sid, picked) = dispatcher.take_suggestion(5, 1).await.unwrap();
        assert_eq!(sid, session_id);
        assert_eq!(picked.command, "cargo build");
        assert!(dispatcher.take_suggestion(5, 9).await.is_none());
    }
}
