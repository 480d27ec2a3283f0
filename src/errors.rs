//! Error-kind taxonomy and the cross-process escalation counter.
//!
//! The taxonomy is a closed set of *kinds*, not a replacement for
//! `anyhow::Result` — call sites keep using `anyhow::Result` with
//! `.context(...)` throughout, and attach a `ErrorKind` only where the
//! propagation policy of the design (retry budgets, escalation counting)
//! actually branches on which kind occurred.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// The eight error kinds that drive retry/escalation behavior.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    #[error("transport unreachable")]
    TransportUnreachable,
    #[error("transport throttled")]
    TransportThrottled,
    #[error("auth denied")]
    AuthDenied,
    #[error("pane lost")]
    PaneLost,
    #[error("store busy")]
    StoreBusy,
    #[error("classifier miss")]
    ClassifierMiss,
    #[error("config invalid")]
    ConfigInvalid,
    #[error("user input invalid")]
    UserInputInvalid,
}

/// How many occurrences of one kind within the rolling window trigger a
/// single system-level alert (§4.12).
const ESCALATION_THRESHOLD: u32 = 5;
const ESCALATION_WINDOW: Duration = Duration::from_secs(5 * 60);

struct Window {
    count: u32,
    window_start: Instant,
}

/// Process-wide counter mapping error kind to count-in-window.
///
/// When a kind's count reaches [`ESCALATION_THRESHOLD`] within the current
/// [`ESCALATION_WINDOW`], `record` returns `true` exactly once and the
/// counter for that kind resets — the caller (the dispatcher, wired to the
/// notifier) is responsible for sending the single system alert.
pub struct ErrorEscalation {
    windows: HashMap<ErrorKind, Window>,
}

impl Default for ErrorEscalation {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorEscalation {
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
        }
    }

    /// Record one occurrence of `kind`. Returns `true` iff this occurrence
    /// pushed the kind's window over the escalation threshold.
    pub fn record(&mut self, kind: ErrorKind) -> bool {
        let now = Instant::now();
        let window = self.windows.entry(kind).or_insert_with(|| Window {
            count: 0,
            window_start: now,
        });

        if now.duration_since(window.window_start) > ESCALATION_WINDOW {
            window.count = 0;
            window.window_start = now;
        }

        window.count += 1;

        if window.count >= ESCALATION_THRESHOLD {
            window.count = 0;
            window.window_start = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_on_fifth_occurrence() {
        let mut esc = ErrorEscalation::new();
        for _ in 0..4 {
            assert!(!esc.record(ErrorKind::TransportUnreachable));
        }
        assert!(esc.record(ErrorKind::TransportUnreachable));
    }

    #[test]
    fn resets_after_escalating() {
        let mut esc = ErrorEscalation::new();
        for _ in 0..5 {
            esc.record(ErrorKind::AuthDenied);
        }
        for _ in 0..4 {
            assert!(!esc.record(ErrorKind::AuthDenied));
        }
        assert!(esc.record(ErrorKind::AuthDenied));
    }

    #[test]
    fn kinds_are_independent() {
        let mut esc = ErrorEscalation::new();
        for _ in 0..4 {
            esc.record(ErrorKind::PaneLost);
        }
        assert!(!esc.record(ErrorKind::StoreBusy));
    }
}
