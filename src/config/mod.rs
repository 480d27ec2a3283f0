//! Two files, read once at startup (§6): a flat secrets file and a
//! hierarchical TOML preferences file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

const SECRETS_FILENAME: &str = "secrets.env";
const PREFS_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".conductor";

/// Required/optional keys from the secrets file.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub telegram_bot_token: String,
    pub telegram_user_id: i64,
    pub anthropic_api_key: String,
    pub log_level: Option<String>,
}

impl Secrets {
    /// Parse `key=value` lines, ignoring blank lines and `#` comments.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut map: HashMap<String, String> = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("secrets file: malformed line (expected key=value): {line}");
            };
            map.insert(key.trim().to_string(), value.trim().to_string());
        }

        let telegram_bot_token = map
            .remove("TELEGRAM_BOT_TOKEN")
            .context("secrets file missing required key TELEGRAM_BOT_TOKEN")?;
        let telegram_user_id = map
            .remove("TELEGRAM_USER_ID")
            .context("secrets file missing required key TELEGRAM_USER_ID")?
            .parse::<i64>()
            .context("TELEGRAM_USER_ID must be a numeric id")?;
        let anthropic_api_key = map
            .remove("ANTHROPIC_API_KEY")
            .context("secrets file missing required key ANTHROPIC_API_KEY")?;
        let log_level = map.remove("LOG_LEVEL");

        Ok(Self {
            telegram_bot_token,
            telegram_user_id,
            anthropic_api_key,
            log_level,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secrets file: {}", path.display()))?;
        Self::parse(&contents)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Pro,
    Mid,
    High,
}

impl Default for PlanTier {
    fn default() -> Self {
        PlanTier::Pro
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_concurrent: u32,
    pub default_type: String,
    pub default_dir: Option<String>,
    pub aliases: HashMap<String, String>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            default_type: "assistant-cli".to_string(),
            default_dir: None,
            aliases: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TokensConfig {
    pub plan_tier: PlanTier,
    pub warning_pct: u8,
    pub danger_pct: u8,
    pub critical_pct: u8,
    pub window_hours: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            plan_tier: PlanTier::Pro,
            warning_pct: 80,
            danger_pct: 90,
            critical_pct: 95,
            window_hours: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub active_poll_interval_ms: u64,
    pub idle_poll_interval_ms: u64,
    pub output_buffer_max_lines: usize,
    pub completion_idle_threshold_s: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            active_poll_interval_ms: 300,
            idle_poll_interval_ms: 2_000,
            output_buffer_max_lines: 5_000,
            completion_idle_threshold_s: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct QuietHours {
    pub enabled: bool,
    pub start: Option<String>,
    pub end: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Sounds {
    pub input_required: Option<String>,
    pub token_warning: Option<String>,
    pub error: Option<String>,
    pub completed: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationsConfig {
    pub batch_window_s: u64,
    pub confirmation_timeout_s: u64,
    pub quiet_hours: QuietHours,
    pub sounds: Sounds,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            batch_window_s: 5,
            confirmation_timeout_s: 30,
            quiet_hours: QuietHours::default(),
            sounds: Sounds::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DefaultRule {
    pub pattern: String,
    pub response: String,
    pub match_type: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AutoResponderConfig {
    pub enabled: bool,
    pub default_rules: Vec<DefaultRule>,
}

impl Default for AutoResponderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AiConfig {
    pub model: String,
    pub summary_max_tokens: u32,
    pub suggestion_max_tokens: u32,
    pub nlp_max_tokens: u32,
    pub timeout_seconds: u64,
    pub fallback_lines: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: "claude-haiku-4-5".to_string(),
            summary_max_tokens: 256,
            suggestion_max_tokens: 256,
            nlp_max_tokens: 128,
            timeout_seconds: 10,
            fallback_lines: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub redact_patterns: Vec<String>,
    pub confirm_destructive: bool,
    pub log_all_commands: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            redact_patterns: Vec::new(),
            confirm_destructive: true,
            log_all_commands: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: Option<String>,
    pub max_size_mb: u64,
    pub backup_count: u32,
    pub console_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_size_mb: 10,
            backup_count: 3,
            console_output: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Preferences {
    pub sessions: SessionsConfig,
    pub tokens: TokensConfig,
    pub monitor: MonitorConfig,
    pub notifications: NotificationsConfig,
    pub auto_responder: AutoResponderConfig,
    pub ai: AiConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

impl Preferences {
    /// Search upward from `start` for `.conductor/config.toml`. Falls back
    /// to defaults (not fatal — unlike a missing/invalid secrets file).
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = find_upward(start, PREFS_FILENAME) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let prefs: Preferences = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((prefs, Some(path)))
        } else {
            Ok((Preferences::default(), None))
        }
    }
}

/// Locate the secrets file the same way preferences are located, so both
/// files live side by side under `.conductor/`.
pub fn find_secrets_file(start: &Path) -> Option<PathBuf> {
    find_upward(start, SECRETS_FILENAME)
}

fn find_upward(start: &Path, filename: &str) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_DIR).join(filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
