//! Classifier (§4.3): a pure function from text to [`DetectionResult`].
//! Holds a pre-compiled table of regexes grouped into five priority tiers,
//! checked in a fixed order — permission-prompt first, so a permission
//! prompt that happens to contain a `?` and a y/n/always triad is never
//! misread as a plain input-prompt (§4.3 rationale).

use std::sync::LazyLock;

use regex::Regex;

/// What the classifier decided a block of new output represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionType {
    PermissionPrompt,
    InputPrompt,
    RateLimit,
    Error,
    Completion,
    None,
}

/// The classifier's verdict, carrying the matched span, the pattern that
/// fired, and a confidence score.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub detection_type: DetectionType,
    pub matched_text: String,
    pub pattern: String,
    pub confidence: f32,
}

impl DetectionResult {
    fn none() -> Self {
        Self {
            detection_type: DetectionType::None,
            matched_text: String::new(),
            pattern: String::new(),
            confidence: 0.0,
        }
    }
}

struct Tier {
    detection_type: DetectionType,
    patterns: Vec<(Regex, &'static str, f32)>,
}

/// Reserved destructive-keyword tokens (§4.3). Case-insensitive, matched as
/// plain substrings — a hard safety gate, not a classifier tier.
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "delete",
    "remove",
    "drop",
    "truncate",
    "destroy",
    "overwrite",
    "wipe",
    "purge",
    "force push",
    "hard reset",
    "rm -rf",
    "uninstall",
    "migrate",
    "rollback",
    "production",
    "deploy",
    "reset",
];

/// The priority-ordered pattern table.
pub struct Classifier {
    tiers: Vec<Tier>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            tiers: vec![
                permission_prompt_tier(),
                input_prompt_tier(),
                rate_limit_tier(),
                error_tier(),
                completion_tier(),
            ],
        }
    }

    /// Classify a block of text, returning the first tier (in priority
    /// order) that matches any of its patterns.
    pub fn classify(&self, text: &str) -> DetectionResult {
        for tier in &self.tiers {
            for (regex, name, confidence) in &tier.patterns {
                if let Some(m) = regex.find(text) {
                    return DetectionResult {
                        detection_type: tier.detection_type,
                        matched_text: m.as_str().to_string(),
                        pattern: (*name).to_string(),
                        confidence: *confidence,
                    };
                }
            }
        }
        DetectionResult::none()
    }

    /// Hard safety gate consumed by the auto-responder (§4.3, §4.5).
    pub fn has_destructive_keyword(text: &str) -> bool {
        let lower = text.to_lowercase();
        DESTRUCTIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }
}

fn compiled(pairs: &[(&'static str, &'static str, f32)]) -> Vec<(Regex, &'static str, f32)> {
    pairs
        .iter()
        .map(|(pattern, name, confidence)| {
            (
                Regex::new(pattern).expect("classifier pattern must compile"),
                *name,
                *confidence,
            )
        })
        .collect()
}

fn permission_prompt_tier() -> Tier {
    Tier {
        detection_type: DetectionType::PermissionPrompt,
        patterns: compiled(&[
            (
                r"(?i)wants to (run|edit|use|execute|write|create|delete)\b",
                "wants-to-verb",
                0.95,
            ),
            (r"(?i)allow\s+tool\b", "allow-tool", 0.95),
            (
                r"(?i)do you want to (proceed|allow|continue)\s*\(?\s*y\s*/\s*n\s*/\s*a(lways)?\)?",
                "yna-triad",
                0.9,
            ),
            (r"(?i)\(y/n/a(lways)?\)", "yna-paren", 0.85),
            (
                r"(?i)would you like to (run|allow|execute) the following",
                "would-you-like-to",
                0.9,
            ),
            (r"(?i)grant(ing)? permission", "grant-permission", 0.8),
        ]),
    }
}

fn input_prompt_tier() -> Tier {
    Tier {
        detection_type: DetectionType::InputPrompt,
        patterns: compiled(&[
            (r"(?m)^\s*\d+[.)]\s+\S", "numbered-choice", 0.7),
            (r"(?m)^\s*[>❯]\s*$", "bare-prompt-glyph", 0.75),
            (
                r"(?i)\b(enter|type|provide|specify)\b.{0,40}[:?]\s*$",
                "input-cue",
                0.7,
            ),
            (r"(?m)\?\s*$", "open-question", 0.6),
            (
                r"(?i)\?\s*\(?\s*(y(es)?\s*/\s*n(o)?|yes/no)\s*\)?",
                "question-with-yn-clause",
                0.65,
            ),
        ]),
    }
}

fn rate_limit_tier() -> Tier {
    Tier {
        detection_type: DetectionType::RateLimit,
        patterns: compiled(&[
            (r"(?i)rate\s*limit", "rate-limit-phrase", 0.9),
            (r"(?i)too many requests", "too-many-requests", 0.9),
            (r"(?i)quota exceeded", "quota-exceeded", 0.9),
            (r"(?i)try again in\s+\d+", "try-again-in-n", 0.85),
            (r"\b429\b", "status-429", 0.8),
            (r"(?i)\bcapacity\b", "capacity", 0.6),
            (r"(?i)cooldown", "cooldown", 0.7),
            (r"(?i)limit will reset", "limit-will-reset", 0.85),
        ]),
    }
}

fn error_tier() -> Tier {
    Tier {
        detection_type: DetectionType::Error,
        patterns: compiled(&[
            (r"(?i)\b(exception|traceback|panicked at)\b", "exception-marker", 0.9),
            (r"(?m)^.*exit(ed)? (with )?(code|status)\s+[1-9]\d*", "nonzero-exit", 0.85),
            (r"(?i)\b(killed|terminated|segmentation fault)\b", "termination-signal", 0.85),
            (r"(?i)npm err!|error:", "tool-error-prefix", 0.7),
            (r"(?i)connection (refused|reset|timed out)", "connection-failure", 0.85),
            (r"(?i)authentication failed|unauthorized|401\b", "auth-failure", 0.85),
            (r"(?i)\bthread '.*' panicked\b", "rust-panic-leader", 0.9),
        ]),
    }
}

fn completion_tier() -> Tier {
    Tier {
        detection_type: DetectionType::Completion,
        patterns: compiled(&[
            (r"(?i)build succeeded", "build-succeeded", 0.9),
            (r"(?i)tests? passing|test result:\s*ok", "tests-passing", 0.9),
            (r"(?i)done in\s+[\d.]+\s*(s|ms)\b", "done-in-duration", 0.85),
            (r"[✓✔]", "checkmark-glyph", 0.7),
            (r"(?i)successfully \w+ed\b", "successfully-verbed", 0.8),
        ]),
    }
}
