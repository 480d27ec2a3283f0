//! Token Estimator (§4.7): a heuristic, deliberately conservative proxy for
//! assistant usage, since no reliable counter is exposed by the underlying
//! CLI (§9 "Open questions").

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{PlanTier, TokensConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdLevel {
    None,
    Warning,
    Danger,
    Critical,
}

#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub used: u32,
    pub limit: u32,
    pub percentage: f32,
    pub reset_in_seconds: u64,
    pub tier: PlanTier,
}

fn tier_limit(tier: PlanTier) -> u32 {
    match tier {
        PlanTier::Pro => 45,
        PlanTier::Mid => 225,
        PlanTier::High => 900,
    }
}

/// One observed response cycle: an idle period of at least `idle_floor`
/// followed by a burst of at least `burst_lines` new lines (§4.7).
struct SessionTracker {
    cycles: Vec<Instant>,
    last_idle_start: Option<Instant>,
    was_idle: bool,
    /// Set once a cycle has been recorded for the current idle period,
    /// either by `note_output`'s own heuristic or by a direct
    /// `record_response_cycle` call — whichever happens first blocks the
    /// other from double-counting the same exchange. Cleared the next
    /// time `note_idle` starts a fresh idle period.
    counted_this_idle: bool,
}

impl SessionTracker {
    fn new() -> Self {
        Self {
            cycles: Vec::new(),
            last_idle_start: None,
            was_idle: false,
            counted_this_idle: false,
        }
    }

    fn prune(&mut self, window: Duration) {
        let cutoff = Instant::now() - window;
        self.cycles.retain(|t| *t >= cutoff);
    }
}

pub struct TokenEstimator {
    config: TokensConfig,
    window: Duration,
    pub(crate) idle_floor: Duration,
    pub(crate) burst_lines: usize,
    sessions: HashMap<String, SessionTracker>,
}

impl TokenEstimator {
    pub fn new(config: TokensConfig) -> Self {
        let window = Duration::from_secs(config.window_hours * 3600);
        Self {
            config,
            window,
            idle_floor: Duration::from_secs(3),
            burst_lines: 5,
            sessions: HashMap::new(),
        }
    }

    /// Record that `session_id` went idle (no new output) starting now.
    pub fn note_idle(&mut self, session_id: &str) {
        let tracker = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionTracker::new);
        if !tracker.was_idle {
            tracker.last_idle_start = Some(Instant::now());
            tracker.was_idle = true;
            tracker.counted_this_idle = false;
        }
    }

    /// Record a burst of `line_count` new lines for `session_id`. If the
    /// session had been idle for at least the idle floor, this counts as
    /// one response cycle — unless `record_response_cycle` already counted
    /// one for this idle period (§8 scenario 4: exactly one increment per
    /// exchange).
    pub fn note_output(&mut self, session_id: &str, line_count: usize) {
        let tracker = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionTracker::new);

        if tracker.was_idle && !tracker.counted_this_idle {
            if let Some(idle_since) = tracker.last_idle_start {
                if idle_since.elapsed() >= self.idle_floor && line_count >= self.burst_lines {
                    tracker.cycles.push(Instant::now());
                    tracker.counted_this_idle = true;
                }
            }
        }
        tracker.was_idle = false;
        tracker.last_idle_start = None;
    }

    /// Usage for one session, or the whole fleet if `session_id` is `None`.
    pub fn get_usage(&mut self, session_id: Option<&str>) -> Usage {
        let window = self.window;
        let used: u32 = match session_id {
            Some(id) => {
                if let Some(tracker) = self.sessions.get_mut(id) {
                    tracker.prune(window);
                    tracker.cycles.len() as u32
                } else {
                    0
                }
            }
            None => {
                let mut total = 0u32;
                for tracker in self.sessions.values_mut() {
                    tracker.prune(window);
                    total += tracker.cycles.len() as u32;
                }
                total
            }
        };

        let limit = tier_limit(self.config.plan_tier);
        let percentage = if limit == 0 {
            0.0
        } else {
            (used as f32 / limit as f32) * 100.0
        };

        Usage {
            used,
            limit,
            percentage,
            reset_in_seconds: window.as_secs(),
            tier: self.config.plan_tier,
        }
    }

    /// Directly record one response cycle for `session_id`, bypassing the
    /// idle-then-burst heuristic. Used by the completion path (§4.10): a
    /// detected or synthetic completion event is itself conclusive evidence
    /// that one full exchange just finished — but if `note_output` already
    /// counted a cycle for the burst that preceded this completion, this
    /// call is a no-op so the same exchange is never counted twice.
    pub fn record_response_cycle(&mut self, session_id: &str) {
        let tracker = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionTracker::new);
        if !tracker.counted_this_idle {
            tracker.cycles.push(Instant::now());
            tracker.counted_this_idle = true;
        }
        tracker.was_idle = false;
        tracker.last_idle_start = None;
    }

    /// Which threshold tier the usage for `session_id` currently sits at.
    pub fn check_thresholds(&mut self, session_id: Option<&str>) -> ThresholdLevel {
        let usage = self.get_usage(session_id);
        if usage.percentage >= self.config.critical_pct as f32 {
            ThresholdLevel::Critical
        } else if usage.percentage >= self.config.danger_pct as f32 {
            ThresholdLevel::Danger
        } else if usage.percentage >= self.config.warning_pct as f32 {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::None
        }
    }
}
