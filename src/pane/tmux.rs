//! tmux-backed [`PaneAdapter`].
//!
//! Shells out to the `tmux` CLI for capture and key injection, the same way
//! the rest of this codebase's session lifecycle helpers do (session/pane
//! existence checks, kill, status-line updates). This module only covers
//! the two operations the pane adapter contract exposes; session
//! create/attach/teardown live in [`crate::session`].

use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::debug;

use super::PaneAdapter;

/// A single tmux pane, addressed by target string (`session` or
/// `session:window.pane`).
pub struct TmuxPane {
    target: String,
}

impl TmuxPane {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl PaneAdapter for TmuxPane {
    fn capture_recent(&self, max_lines: usize) -> Result<Vec<String>> {
        // `-S -N` starts capture N lines back in history; `-p` prints to
        // stdout instead of a tmux buffer.
        let start = format!("-{max_lines}");
        let output = Command::new("tmux")
            .args(["capture-pane", "-t", &self.target, "-p", "-S", &start])
            .output()
            .with_context(|| format!("failed to capture pane '{}'", self.target))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux capture-pane failed for '{}': {stderr}", self.target);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().map(|l| l.to_string()).collect())
    }

    fn send(&self, text: &str, press_enter: bool) -> Result<()> {
        let mut cmd = Command::new("tmux");
        cmd.args(["send-keys", "-t", &self.target, text]);
        if press_enter {
            cmd.arg("Enter");
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to send keys to pane '{}'", self.target))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux send-keys failed for '{}': {stderr}", self.target);
        }

        debug!(target = %self.target, "sent keys");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        Command::new("tmux")
            .args(["display-message", "-p", "-t", &self.target, "#{pane_id}"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// Send a process-suspend signal to a pane's backing pid — the
/// "platform-specific mechanism" §4.10 calls for to auto-pause a
/// rate-limited session. Best-effort: a pid that has already exited is not
/// an error worth propagating, just a no-op.
#[cfg(unix)]
pub fn stop_process(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGSTOP);
    }
}

/// Undo [`stop_process`] — used when a rate-limited session is resumed.
#[cfg(unix)]
pub fn continue_process(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGCONT);
    }
}

/// Query the OS pid backing a pane target, for the sleep detector's
/// post-wake health sweep.
pub fn pane_pid(target: &str) -> Result<u32> {
    let output = Command::new("tmux")
        .args(["display-message", "-p", "-t", target, "#{pane_pid}"])
        .output()
        .with_context(|| format!("failed to resolve pane pid for '{target}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tmux display-message failed for '{target}': {stderr}");
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u32>()
        .with_context(|| format!("tmux returned non-numeric pid for '{target}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmux_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn nonexistent_pane_is_not_alive() {
        if !tmux_available() {
            return;
        }
        let pane = TmuxPane::new("conductor-test-does-not-exist");
        assert!(!pane.is_alive());
    }

    #[test]
    fn capture_and_send_round_trip() {
        if !tmux_available() {
            return;
        }
        let session = "conductor-test-capture";
        let _ = Command::new("tmux")
            .args(["kill-session", "-t", session])
            .output();
        let created = Command::new("tmux")
            .args(["new-session", "-d", "-s", session])
            .status()
            .unwrap();
        assert!(created.success());

        let pane = TmuxPane::new(session);
        assert!(pane.is_alive());
        pane.send("echo conductor-test-marker", true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));
        let lines = pane.capture_recent(100).unwrap();
        assert!(lines.iter().any(|l| l.contains("conductor-test-marker")));

        let _ = Command::new("tmux")
            .args(["kill-session", "-t", session])
            .output();
    }
}
