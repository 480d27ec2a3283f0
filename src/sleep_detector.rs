//! Sleep Detector (§4.13): detects host suspension by watching for a gap in
//! the monotonic clock between consecutive checks. A laptop that sleeps for
//! an hour and wakes up does not tick its `Instant` clock during that hour —
//! the next check observes a jump far larger than the polling interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::pane::tmux::pane_pid;
use crate::pane::PaneAdapter;
use crate::session::SessionStatus;
use crate::store::EventType;

const CHECK_INTERVAL: Duration = Duration::from_secs(1);
const WAKE_GAP_THRESHOLD: Duration = Duration::from_secs(15);

/// Returns `true` if the elapsed wall time since `last_check` exceeds the
/// threshold by more than what the check interval itself accounts for —
/// i.e. the process was not scheduled for that whole span.
fn gap_indicates_sleep(elapsed: Duration) -> bool {
    elapsed > WAKE_GAP_THRESHOLD
}

/// Run forever, firing [`health_sweep`] whenever a clock gap is observed.
pub async fn run(
    dispatcher: Arc<Dispatcher>,
    panes: Arc<Mutex<std::collections::HashMap<String, Arc<dyn PaneAdapter>>>>,
) {
    let mut last_check = Instant::now();
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let elapsed = now.duration_since(last_check);
        last_check = now;

        if gap_indicates_sleep(elapsed) {
            warn!(gap_secs = elapsed.as_secs(), "clock gap detected, host likely resumed from sleep");
            health_sweep(&dispatcher, &panes).await;
        }
    }
}

/// For each known session, verify the pane still exists and (on unix) its
/// process is still alive; mark missing ones exited and notify (§4.13).
async fn health_sweep(
    dispatcher: &Arc<Dispatcher>,
    panes: &Arc<Mutex<std::collections::HashMap<String, Arc<dyn PaneAdapter>>>>,
) {
    let targets: Vec<(String, String)> = {
        let sessions = dispatcher.sessions().lock().await;
        sessions
            .active_sessions()
            .into_iter()
            .map(|s| (s.id.clone(), s.mux_target.clone()))
            .collect()
    };

    for (session_id, mux_target) in targets {
        let pane = panes.lock().await.get(&session_id).cloned();
        let Some(pane) = pane else { continue };

        let pane_ok = pane.is_alive();
        #[cfg(unix)]
        let process_ok = tmux_pane_still_alive(&mux_target);
        #[cfg(not(unix))]
        let process_ok = pane_ok;

        if pane_ok && process_ok {
            continue;
        }

        info!(session_id = %session_id, "health sweep found session gone after wake");
        let mut sessions = dispatcher.sessions().lock().await;
        // A paused session can't jump straight to exited (§3) — route
        // through an intermediate state first, same as a normal kill.
        let _ = sessions.set_status(&session_id, SessionStatus::Waiting);
        let _ = sessions.set_status(&session_id, SessionStatus::Exited);
        drop(sessions);

        let _ = dispatcher
            .store()
            .insert_event(
                session_id.clone(),
                EventType::System,
                "session did not survive host sleep".to_string(),
            )
            .await;
    }
}

/// Liveness probe used by the health sweep on unix: confirm the pane's
/// backing process id is actually still running, beyond the multiplexer's
/// own bookkeeping.
#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs no delivery, only existence/permission checks.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(unix)]
pub fn tmux_pane_still_alive(target: &str) -> bool {
    match pane_pid(target) {
        Ok(pid) => process_is_alive(pid),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiAdapter;
    use crate::config::{AiConfig, AutoResponderConfig, TokensConfig};
    use crate::confirmation::ConfirmationManager;
    use crate::errors::ErrorEscalation;
    use crate::notifier::telegram::{Button, ChatAdapter};
    use crate::notifier::{Notifier, QuietHoursWindow};
    use crate::pane::PaneAdapter;
    use crate::session::{SessionManager, SessionType};
    use crate::store::Store;
    use crate::tokens::TokenEstimator;
    use std::collections::HashMap;

    #[test]
    fn short_gap_is_not_sleep() {
        assert!(!gap_indicates_sleep(Duration::from_secs(2)));
    }

    #[test]
    fn long_gap_indicates_sleep() {
        assert!(gap_indicates_sleep(Duration::from_secs(60)));
    }

    #[test]
    fn boundary_gap_is_not_sleep() {
        assert!(!gap_indicates_sleep(WAKE_GAP_THRESHOLD));
    }

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
            Ok(String::new())
        }
        fn suggest(&self, _: &str, _: u32) -> anyhow::Result<Vec<crate::ai::Suggestion>> {
            Ok(Vec::new())
        }
        fn parse_nl_command(
            &self,
            _: &str,
            _: &[String],
            _: Option<&str>,
            _: u32,
        ) -> anyhow::Result<Option<crate::ai::ParsedNlCommand>> {
            Ok(None)
        }
    }

    struct DeadPane;
    impl PaneAdapter for DeadPane {
        fn capture_recent(&self, _: usize) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn send(&self, _: &str, _: bool) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_alive(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn health_sweep_exits_a_paused_session_whose_pane_is_gone() {
        let store = Store::open_in_memory().unwrap();
        let mut mgr = SessionManager::new(4);
        let session = mgr
            .create(SessionType::AssistantCli, "/tmp/proj".into(), "conductor-gone".into(), None)
            .unwrap();
        let session_id = session.id.clone();
        mgr.set_status(&session_id, SessionStatus::Paused).unwrap();

        let sessions = Arc::new(Mutex::new(mgr));
        let panes: Arc<Mutex<HashMap<String, Arc<dyn PaneAdapter>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        panes.lock().await.insert(session_id.clone(), Arc::new(DeadPane));

        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            panes.clone(),
            store,
            Arc::new(Notifier::new(Arc::new(NullChatAdapter), QuietHoursWindow::none())),
            Arc::new(NullAiAdapter),
            AiConfig::default(),
            AutoResponderConfig::default(),
            Arc::new(ConfirmationManager::new()),
            Arc::new(Mutex::new(TokenEstimator::new(TokensConfig::default()))),
            Arc::new(Mutex::new(ErrorEscalation::new())),
        ));

        health_sweep(&dispatcher, &panes).await;

        let sessions = sessions.lock().await;
        assert_eq!(sessions.get(&session_id).unwrap().status, SessionStatus::Exited);
    }
}
