//! Output Buffer (§4.2): strips escape sequences, deduplicates by content
//! hash, and maintains a rolling window of emitted lines. One instance per
//! pane monitor — never shared across monitors.

use std::collections::{HashSet, VecDeque};

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Default rolling window size (§4.2 step 4).
pub const DEFAULT_WINDOW: usize = 5_000;
/// Default seen-hash cap (§4.2 step 5).
pub const DEFAULT_HASH_CAP: usize = 10_000;

/// Strip terminal escape sequences: CSI, OSC (both ST and BEL terminators),
/// and single-character ESC sequences, plus bare backspace/carriage-return
/// artifacts. Errs on the side of stripping rather than preserving (§9).
pub fn strip_ansi(input: &str) -> String {
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
            .expect("static ANSI regex must compile")
    });
    let stripped = ANSI_RE.replace_all(input, "");
    stripped.replace(['\x08', '\r'], "")
}

/// Content hash used for dedup. 128 bits taken from the front of a SHA-256
/// digest — collision-resistant enough for "has this exact line been seen
/// before", without pulling in an md5-style crate that's only good for that.
fn line_hash(line: &str) -> u128 {
    let digest = Sha256::digest(line.as_bytes());
    u128::from_be_bytes(digest[..16].try_into().expect("digest is >=16 bytes"))
}

/// Stateful, single-threaded output buffer for one pane.
pub struct OutputBuffer {
    window: VecDeque<String>,
    window_cap: usize,
    seen: HashSet<u128>,
    seen_order: VecDeque<u128>,
    hash_cap: usize,
}

impl OutputBuffer {
    pub fn new(window_cap: usize, hash_cap: usize) -> Self {
        Self {
            window: VecDeque::new(),
            window_cap,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            hash_cap,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_HASH_CAP)
    }

    /// Feed a fresh capture of pane scrollback. Returns only the lines not
    /// previously emitted, in first-appearance order (§4.2: a dedup
    /// promise, not an ordering promise).
    pub fn ingest(&mut self, captured: &[String]) -> Vec<String> {
        let stripped: Vec<String> = captured.iter().map(|l| strip_ansi(l)).collect();

        // Trim trailing empty lines (cursor artifacts) before comparison.
        let mut end = stripped.len();
        while end > 0 && stripped[end - 1].trim().is_empty() {
            end -= 1;
        }

        let mut emitted = Vec::new();
        for line in &stripped[..end] {
            let hash = line_hash(line);
            if self.seen.contains(&hash) {
                continue;
            }
            self.mark_seen(hash);
            self.push_window(line.clone());
            emitted.push(line.clone());
        }
        emitted
    }

    fn mark_seen(&mut self, hash: u128) {
        self.seen.insert(hash);
        self.seen_order.push_back(hash);
        if self.seen_order.len() > self.hash_cap {
            // Retain only the most recent half on overflow (§4.2 step 5).
            let keep_from = self.seen_order.len() - self.hash_cap / 2;
            for stale in self.seen_order.drain(..keep_from) {
                self.seen.remove(&stale);
            }
        }
    }

    fn push_window(&mut self, line: String) {
        self.window.push_back(line);
        while self.window.len() > self.window_cap {
            self.window.pop_front();
        }
    }

    /// Snapshot of the rolling window, oldest first.
    pub fn window(&self) -> Vec<String> {
        self.window.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_csi() {
        assert_eq!(
            strip_ansi("\x1b[31mERROR\x1b[0m: broke"),
            "ERROR: broke"
        );
    }

    #[test]
    fn strip_ansi_removes_osc_with_bel() {
        assert_eq!(strip_ansi("\x1b]0;title\x07hello"), "hello");
    }

    #[test]
    fn strip_ansi_removes_osc_with_st() {
        assert_eq!(strip_ansi("\x1b]0;title\x1b\\hello"), "hello");
    }

    #[test]
    fn strip_ansi_idempotent() {
        let input = "\x1b[1;32mok\x1b[0m \x08\r";
        let once = strip_ansi(input);
        let twice = strip_ansi(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_capture_produces_no_lines() {
        let mut buf = OutputBuffer::with_defaults();
        assert!(buf.ingest(&[]).is_empty());
    }

    #[test]
    fn identical_capture_produces_no_new_lines() {
        let mut buf = OutputBuffer::with_defaults();
        let lines = vec!["hello".to_string(), "world".to_string()];
        assert_eq!(buf.ingest(&lines), lines);
        assert!(buf.ingest(&lines).is_empty());
    }

    #[test]
    fn trailing_whitespace_only_change_produces_no_new_lines() {
        let mut buf = OutputBuffer::with_defaults();
        buf.ingest(&["hello".to_string(), "world".to_string()]);
        let again = buf.ingest(&[
            "hello".to_string(),
            "world".to_string(),
            "   ".to_string(),
            "".to_string(),
        ]);
        assert!(again.is_empty());
    }

    #[test]
    fn flickering_line_emitted_once() {
        let mut buf = OutputBuffer::with_defaults();
        buf.ingest(&["alternate screen content".to_string()]);
        buf.ingest(&["different content".to_string()]);
        let third = buf.ingest(&["alternate screen content".to_string()]);
        assert!(third.is_empty());
    }

    #[test]
    fn window_caps_at_capacity() {
        let mut buf = OutputBuffer::new(3, 100);
        for i in 0..5 {
            buf.ingest(&[format!("line-{i}")]);
        }
        let window = buf.window();
        assert_eq!(window.len(), 3);
        assert_eq!(window, vec!["line-2", "line-3", "line-4"]);
    }

    #[test]
    fn hash_cap_evicts_oldest_half() {
        let mut buf = OutputBuffer::new(10_000, 10);
        for i in 0..12 {
            buf.ingest(&[format!("line-{i}")]);
        }
        // Oldest entries fell out of the seen set, so they're treated as new again.
        let reemitted = buf.ingest(&["line-0".to_string()]);
        assert_eq!(reemitted, vec!["line-0".to_string()]);
    }

    #[test]
    fn new_lines_appear_in_arrival_order() {
        let mut buf = OutputBuffer::with_defaults();
        let emitted = buf.ingest(&["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(emitted, vec!["a", "b", "c"]);
    }
}
