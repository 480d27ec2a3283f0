//! Pane Monitor (§4.4): one task per session, polling its pane at an
//! interval that adapts to how busy the pane currently looks, classifying
//! newly emitted output and forwarding the result to the dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::buffer::OutputBuffer;
use crate::classifier::{Classifier, DetectionResult, DetectionType};
use crate::config::MonitorConfig;
use crate::pane::PaneAdapter;

#[derive(Debug)]
pub enum MonitorEventKind {
    NewOutput(Vec<String>),
    Detection(DetectionResult, String),
    CompletionIdle,
    PaneGone,
}

#[derive(Debug)]
pub struct MonitorEvent {
    pub session_id: String,
    pub kind: MonitorEventKind,
}

/// Starting: first poll, before any lines have been seen. Active: new
/// output arrived within the last tick. Idle: no new output since the last
/// tick. Ending: the pane has gone away; the loop exits after this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Starting,
    Active,
    Idle,
    Ending,
}

pub struct PaneMonitor {
    session_id: String,
    pane: Arc<dyn PaneAdapter>,
    classifier: Arc<Classifier>,
    config: MonitorConfig,
    events_tx: mpsc::Sender<MonitorEvent>,
}

impl PaneMonitor {
    pub fn new(
        session_id: String,
        pane: Arc<dyn PaneAdapter>,
        classifier: Arc<Classifier>,
        config: MonitorConfig,
        events_tx: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            session_id,
            pane,
            classifier,
            config,
            events_tx,
        }
    }

    fn poll_interval(&self, state: MonitorState) -> Duration {
        match state {
            MonitorState::Starting => Duration::from_millis(self.config.poll_interval_ms),
            MonitorState::Active => Duration::from_millis(self.config.active_poll_interval_ms),
            MonitorState::Idle => Duration::from_millis(self.config.idle_poll_interval_ms),
            MonitorState::Ending => Duration::from_millis(self.config.poll_interval_ms),
        }
    }

    async fn emit(&self, kind: MonitorEventKind) {
        let event = MonitorEvent {
            session_id: self.session_id.clone(),
            kind,
        };
        if self.events_tx.send(event).await.is_err() {
            warn!(session_id = %self.session_id, "dispatcher channel closed, monitor has no one to report to");
        }
    }

    /// Run until the pane is gone or the task is cancelled.
    pub async fn run(self) {
        let mut buffer = OutputBuffer::new(self.config.output_buffer_max_lines, crate::buffer::DEFAULT_HASH_CAP);
        let mut state = MonitorState::Starting;
        let mut last_output_at = Instant::now();
        let completion_threshold = Duration::from_secs(self.config.completion_idle_threshold_s);
        let mut completion_fired_this_idle = false;

        loop {
            tokio::time::sleep(self.poll_interval(state)).await;

            if !self.pane.is_alive() {
                info!(session_id = %self.session_id, "pane no longer alive");
                self.emit(MonitorEventKind::PaneGone).await;
                return;
            }

            let captured = match self.pane.capture_recent(self.config.output_buffer_max_lines) {
                Ok(lines) => lines,
                Err(err) => {
                    warn!(session_id = %self.session_id, error = %err, "pane capture failed");
                    self.emit(MonitorEventKind::PaneGone).await;
                    return;
                }
            };

            let new_lines = buffer.ingest(&captured);

            if new_lines.is_empty() {
                state = MonitorState::Idle;
                if !completion_fired_this_idle && last_output_at.elapsed() >= completion_threshold {
                    debug!(session_id = %self.session_id, "idle threshold reached, signalling completion candidate");
                    self.emit(MonitorEventKind::CompletionIdle).await;
                    completion_fired_this_idle = true;
                }
                continue;
            }

            state = MonitorState::Active;
            last_output_at = Instant::now();
            completion_fired_this_idle = false;

            let joined = new_lines.join("\n");
            let detection = self.classifier.classify(&joined);

            self.emit(MonitorEventKind::NewOutput(new_lines)).await;
            if detection.detection_type != DetectionType::None {
                self.emit(MonitorEventKind::Detection(detection, joined)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ScriptedPane {
        captures: StdMutex<Vec<Vec<String>>>,
        alive: StdMutex<bool>,
    }

    impl ScriptedPane {
        fn new(captures: Vec<Vec<String>>) -> Self {
            Self {
                captures: StdMutex::new(captures),
                alive: StdMutex::new(true),
            }
        }
    }

    impl PaneAdapter for ScriptedPane {
        fn capture_recent(&self, _max_lines: usize) -> anyhow::Result<Vec<String>> {
            let mut captures = self.captures.lock().unwrap();
            if captures.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(captures.remove(0))
            }
        }

        fn send(&self, _text: &str, _press_enter: bool) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            *self.alive.lock().unwrap()
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: 1,
            active_poll_interval_ms: 1,
            idle_poll_interval_ms: 1,
            output_buffer_max_lines: 100,
            completion_idle_threshold_s: 0,
        }
    }

    #[tokio::test]
    async fn new_output_is_emitted_and_classified() {
        let pane = Arc::new(ScriptedPane::new(vec![vec!["Build succeeded. Done in 1.0s".to_string()]]));
        let (tx, mut rx) = mpsc::channel(16);
        let monitor = PaneMonitor::new(
            "s1".into(),
            pane,
            Arc::new(Classifier::new()),
            fast_config(),
            tx,
        );
        tokio::spawn(monitor.run());

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, MonitorEventKind::NewOutput(_)));
        let second = rx.recv().await.unwrap();
        match second.kind {
            MonitorEventKind::Detection(d, text) => {
                assert_eq!(d.detection_type, DetectionType::Completion);
                assert_eq!(text, "Build succeeded. Done in 1.0s");
            }
            other => panic!("expected Detection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pane_gone_emits_pane_gone_and_stops() {
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

        let (tx, mut rx) = mpsc::channel(16);
        let monitor = PaneMonitor::new(
            "s1".into(),
            Arc::new(DeadPane),
            Arc::new(Classifier::new()),
            fast_config(),
            tx,
        );
        monitor.run().await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, MonitorEventKind::PaneGone));
    }

    #[tokio::test]
    async fn sustained_idle_emits_completion_idle_once() {
        let pane = Arc::new(ScriptedPane::new(vec![vec!["starting up".to_string()]]));
        let (tx, mut rx) = mpsc::channel(16);
        let monitor = PaneMonitor::new(
            "s1".into(),
            pane,
            Arc::new(Classifier::new()),
            fast_config(),
            tx,
        );
        tokio::spawn(monitor.run());

        // First: NewOutput for "starting up" (no detection tier matches it).
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, MonitorEventKind::NewOutput(_)));

        // Idle threshold is 0s, so the very next empty poll should fire.
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.kind, MonitorEventKind::CompletionIdle));
    }
}
