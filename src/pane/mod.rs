//! Pane Adapter (§4.1): the one boundary between conductor and the terminal
//! multiplexer. Two operations, both fallible; a failure of either is
//! "pane gone" and causes the owning monitor to stop and mark the session
//! exited.

pub mod tmux;

use anyhow::Result;

/// A reference to one pane inside the multiplexer. Opaque to everything
/// above this module — `tmux::TmuxPane` is the only implementation.
pub trait PaneAdapter: Send + Sync {
    /// Return the last `max_lines` lines currently visible in scrollback,
    /// including still-visible past lines, oldest first.
    fn capture_recent(&self, max_lines: usize) -> Result<Vec<String>>;

    /// Deliver keystrokes into the pane. `press_enter` appends the
    /// multiplexer's Enter key after the literal text.
    fn send(&self, text: &str, press_enter: bool) -> Result<()>;

    /// Whether the pane still exists (used by the sleep detector's health
    /// sweep and by monitors to distinguish "pane gone" from a transient
    /// capture error).
    fn is_alive(&self) -> bool;
}
