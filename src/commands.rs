//! In-scope slash-command handlers (§1): the subset of the chat command
//! surface that mutates core state — confirmations, auto-rules, and
//! pause/resume. Everything else (the remaining ~19-command surface named
//! in §6) is out of scope here and belongs to a chat-side command router
//! that simply calls into these functions or into the dispatcher directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::Mutex;

use crate::confirmation::ConfirmationKey;
use crate::dispatcher::Dispatcher;
use crate::pane::PaneAdapter;
use crate::session::SessionStatus;
use crate::store::{CommandRow, CommandSource, EventType, MatchType};

/// `/pause [#N|alias]` — pause one session, or every session if no target
/// is given.
pub async fn pause(dispatcher: &Dispatcher, target: Option<&str>) -> Result<String> {
    match target {
        None => {
            dispatcher.set_globally_paused(true).await;
            Ok("all sessions paused".to_string())
        }
        Some(target) => {
            let session_id = resolve_target(dispatcher, target).await?;
            let mut sessions = dispatcher.sessions().lock().await;
            sessions
                .set_status(&session_id, SessionStatus::Paused)
                .context("failed to pause session")?;
            Ok(format!("session {target} paused"))
        }
    }
}

/// `/resume [#N|alias]`.
pub async fn resume(dispatcher: &Dispatcher, target: Option<&str>) -> Result<String> {
    match target {
        None => {
            dispatcher.set_globally_paused(false).await;
            Ok("all sessions resumed".to_string())
        }
        Some(target) => {
            let session_id = resolve_target(dispatcher, target).await?;
            let mut sessions = dispatcher.sessions().lock().await;
            let pid = sessions.get(&session_id).and_then(|s| s.pid);
            sessions
                .set_status(&session_id, SessionStatus::Running)
                .context("failed to resume session")?;
            drop(sessions);
            #[cfg(unix)]
            if let Some(pid) = pid {
                crate::pane::tmux::continue_process(pid);
            }
            Ok(format!("session {target} resumed"))
        }
    }
}

/// `/addrule <pattern> <response> <match_type>` (§3 AutoRule, §6 default_rules).
pub async fn add_auto_rule(
    dispatcher: &Dispatcher,
    pattern: String,
    response: String,
    match_type: MatchType,
) -> Result<i64> {
    dispatcher
        .store()
        .insert_auto_rule(pattern, response, match_type)
        .await
}

/// `/rules` — list configured auto-rules.
pub async fn list_auto_rules(dispatcher: &Dispatcher) -> Result<String> {
    let rules = dispatcher.store().list_auto_rules().await?;
    if rules.is_empty() {
        return Ok("no auto-rules configured".to_string());
    }
    let lines: Vec<String> = rules
        .iter()
        .map(|r| {
            format!(
                "#{} [{}] {:?} -> {} (hits: {}, enabled: {})",
                r.id, r.match_type.as_str(), r.pattern, r.response, r.hit_count, r.enabled
            )
        })
        .collect();
    Ok(lines.join("\n"))
}

/// `/kill #N` — destructive, requires a second tap via the confirmation
/// manager (§4.6). First call requests confirmation; a second call with
/// `confirmed = true` (the button callback) actually tears the session down.
pub async fn kill_session(
    dispatcher: &Dispatcher,
    panes: &Arc<Mutex<HashMap<String, Arc<dyn PaneAdapter>>>>,
    user: &str,
    target: &str,
    confirmation_ttl: Duration,
    confirmed: bool,
) -> Result<String> {
    let session_id = resolve_target(dispatcher, target).await?;
    let key = ConfirmationKey {
        user: user.to_string(),
        action: "kill".to_string(),
        target_session: session_id.clone(),
    };

    if !confirmed {
        dispatcher.confirmations().request(key, confirmation_ttl).await;
        return Ok(format!("confirm killing session {target}? reply again to confirm"));
    }

    if !dispatcher.confirmations().confirm(&key).await {
        bail!("no pending confirmation for killing session {target} (or it expired)");
    }

    {
        let pane = panes.lock().await.get(&session_id).cloned();
        if let Some(pane) = pane {
            let _ = pane.send("", false);
        }
    }

    let mut sessions = dispatcher.sessions().lock().await;
    sessions
        .set_status(&session_id, SessionStatus::Waiting)
        .context("failed to route through an intermediate state before exit")?;
    sessions
        .set_status(&session_id, SessionStatus::Exited)
        .context("failed to mark session exited")?;
    drop(sessions);

    dispatcher
        .store()
        .insert_command(CommandRow {
            session_id: session_id.clone(),
            source: CommandSource::User,
            input: "kill".to_string(),
            context: Some(format!("confirmed by {user}")),
        })
        .await?;
    dispatcher
        .store()
        .insert_event(session_id, EventType::System, format!("session killed by {user}"))
        .await?;

    Ok(format!("session {target} killed"))
}

/// Cancelling keystroke sent to a pane to interrupt an in-flight auto-response
/// (§4.5) — the multiplexer's equivalent of Ctrl-C.
const UNDO_KEYSTROKE: &str = "\x03";

/// Undo button activation (§4.5): within [`crate::dispatcher::UNDO_TTL`] of an
/// auto-response, interrupt the pane and record the undo as a follow-up
/// command. Fails if the event has no pending undo or its TTL has elapsed.
pub async fn undo(
    dispatcher: &Dispatcher,
    panes: &Arc<Mutex<HashMap<String, Arc<dyn PaneAdapter>>>>,
    event_id: i64,
) -> Result<String> {
    let session_id = dispatcher
        .take_undo(event_id)
        .await
        .context("no pending undo for this event (or it expired)")?;

    let pane = panes.lock().await.get(&session_id).cloned();
    if let Some(pane) = pane {
        pane.send(UNDO_KEYSTROKE, false).context("failed to deliver undo keystroke")?;
    }

    dispatcher
        .store()
        .insert_command(CommandRow {
            session_id: session_id.clone(),
            source: CommandSource::User,
            input: "undo".to_string(),
            context: Some(event_id.to_string()),
        })
        .await?;

    Ok(format!("undid auto-response for session {session_id}"))
}

/// Suggestion button activation (§4.9, §4.10): run the suggested command in
/// its session's pane and record it as a follow-up command.
pub async fn run_suggestion(
    dispatcher: &Dispatcher,
    panes: &Arc<Mutex<HashMap<String, Arc<dyn PaneAdapter>>>>,
    event_id: i64,
    index: usize,
) -> Result<String> {
    let (session_id, suggestion) = dispatcher
        .take_suggestion(event_id, index)
        .await
        .context("no pending suggestion at this event/index")?;

    let pane = panes.lock().await.get(&session_id).cloned();
    if let Some(pane) = pane {
        pane.send(&suggestion.command, true).context("failed to run suggested command")?;
    }

    dispatcher
        .store()
        .insert_command(CommandRow {
            session_id: session_id.clone(),
            source: CommandSource::User,
            input: suggestion.command.clone(),
            context: Some(format!("suggestion:{event_id}:{index}")),
        })
        .await?;

    Ok(format!("ran suggested command in session {session_id}: {}", suggestion.command))
}

/// `/cancel` — withdraw a pending confirmation without acting on it.
pub async fn cancel_confirmation(dispatcher: &Dispatcher, user: &str, action: &str, target: &str) -> Result<String> {
    let session_id = resolve_target(dispatcher, target).await?;
    let key = ConfirmationKey {
        user: user.to_string(),
        action: action.to_string(),
        target_session: session_id,
    };
    dispatcher.confirmations().cancel(&key).await;
    Ok("confirmation cancelled".to_string())
}

async fn resolve_target(dispatcher: &Dispatcher, target: &str) -> Result<String> {
    let sessions = dispatcher.sessions().lock().await;
    if let Some(rest) = target.strip_prefix('#') {
        let number: u32 = rest.parse().context("expected a session number after '#'")?;
        return sessions
            .find_by_number(number)
            .map(|s| s.id.clone())
            .with_context(|| format!("no session numbered {number}"));
    }
    sessions
        .find_by_alias(target)
        .map(|s| s.id.clone())
        .with_context(|| format!("no session aliased '{target}'"))
}
