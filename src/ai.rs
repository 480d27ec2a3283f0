//! AI Adapter (§4.9): summarization, suggestion, and natural-language
//! command parsing, backed by a single real provider. Every operation has a
//! hard timeout and a deterministic fallback — a slow or failing provider
//! must never block the pipeline, only count against the error escalator.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::AiConfig;

/// One suggested next action (§3 `Suggest` operation): a short button label
/// plus the exact command the button sends if tapped.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Suggestion {
    pub label: String,
    pub command: String,
}

/// `ParseNL`'s structured verdict (§4.9, §4.10 ambiguous-session-resolution
/// step 4): a classified command, the session it targets (if any), any
/// extra arguments, and a confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParsedNlCommand {
    pub command: String,
    pub session: Option<String>,
    pub args: Vec<String>,
    pub confidence: f32,
}

impl Default for ParsedNlCommand {
    fn default() -> Self {
        Self {
            command: "unknown".to_string(),
            session: None,
            args: Vec::new(),
            confidence: 0.0,
        }
    }
}

/// Out of scope per §1 beyond this contract — `AnthropicAdapter` is the one
/// concrete implementation, run inside `tokio::task::spawn_blocking` since
/// `ureq` is blocking.
pub trait AiAdapter: Send + Sync {
    fn summarize(&self, recent_output: &str, max_tokens: u32) -> Result<String>;
    fn suggest(&self, recent_output: &str, max_tokens: u32) -> Result<Vec<Suggestion>>;
    /// `session_list` is every active session's alias, `last_prompt` is the
    /// text of the prompt last shown to the user (if any and still fresh) —
    /// both feed the model's guess as context (§4.9, §4.10).
    fn parse_nl_command(
        &self,
        message: &str,
        session_list: &[String],
        last_prompt: Option<&str>,
        max_tokens: u32,
    ) -> Result<Option<ParsedNlCommand>>;
}

pub struct AnthropicAdapter {
    api_key: String,
    model: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, model: String) -> Self {
        Self { api_key, model }
    }

    fn call(&self, system: &str, user: &str, max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
        });

        let response = ureq::post("https://api.anthropic.com/v1/messages")
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", "2023-06-01")
            .set("content-type", "application/json")
            .send_json(body)
            .context("anthropic messages request failed")?;

        let parsed: MessagesResponse = response
            .into_json()
            .context("anthropic messages response was not valid JSON")?;
        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .context("anthropic response contained no text block")
    }

    /// Like [`Self::call`], but expects (and parses) a JSON-shaped reply.
    /// Models occasionally wrap JSON in a markdown code fence despite being
    /// told not to — `strip_code_fence` tolerates that.
    fn call_json<T: DeserializeOwned>(&self, system: &str, user: &str, max_tokens: u32) -> Result<T> {
        let text = self.call(system, user, max_tokens)?;
        serde_json::from_str(strip_code_fence(&text)).context("anthropic reply was not the expected JSON shape")
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AiAdapter for AnthropicAdapter {
    fn summarize(&self, recent_output: &str, max_tokens: u32) -> Result<String> {
        self.call(
            "Summarize the following terminal output in one or two short sentences.",
            recent_output,
            max_tokens,
        )
    }

    fn suggest(&self, recent_output: &str, max_tokens: u32) -> Result<Vec<Suggestion>> {
        let suggestions: Vec<Suggestion> = self.call_json(
            "Given this terminal output, suggest 1 to 3 next actions the user could take. \
             Reply with ONLY a JSON array, no other text, of objects shaped \
             {\"label\": \"<button text, 40 chars or fewer>\", \"command\": \"<the exact command to run>\"}.",
            recent_output,
            max_tokens,
        )?;
        Ok(suggestions.into_iter().take(3).collect())
    }

    fn parse_nl_command(
        &self,
        message: &str,
        session_list: &[String],
        last_prompt: Option<&str>,
        max_tokens: u32,
    ) -> Result<Option<ParsedNlCommand>> {
        let context = format!(
            "Active sessions: [{}]\nLast prompt shown to the user: {}\nMessage: {message}",
            session_list.join(", "),
            last_prompt.unwrap_or("<none>"),
        );
        let system = "Classify this chat message against the running sessions. Reply with ONLY \
             JSON, no other text, shaped {\"command\": \"pause\"|\"resume\"|\"status\"|\"unknown\", \
             \"session\": \"<alias or null>\", \"args\": [\"...\"], \"confidence\": <0.0-1.0>}. \
             Use \"unknown\" with confidence 0.0 if the message doesn't clearly name one of these.";
        let parsed: ParsedNlCommand = self.call_json(system, &context, max_tokens)?;
        if parsed.command == "unknown" {
            Ok(None)
        } else {
            Ok(Some(parsed))
        }
    }
}

/// Run `op` inside a blocking task with a per-operation timeout. On timeout
/// or error, returns `fallback` instead of propagating — §4.9 requires the
/// pipeline to never stall on a flaky provider. The caller is responsible
/// for feeding the error into the error escalator (§4.12).
pub async fn with_timeout_and_fallback<T, F>(timeout: Duration, fallback: T, op: F) -> (T, Result<()>)
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(op);
    match tokio::time::timeout(timeout, joined).await {
        Ok(Ok(Ok(value))) => (value, Ok(())),
        Ok(Ok(Err(e))) => (fallback, Err(e)),
        Ok(Err(join_err)) => (fallback, Err(anyhow::anyhow!("ai task panicked: {join_err}"))),
        Err(_) => (fallback, Err(anyhow::anyhow!("ai call timed out"))),
    }
}

/// Deterministic fallback for a timed-out or failed summarize call (§4.9):
/// the last `fallback_lines` lines of raw output, verbatim.
pub fn fallback_summary(recent_output: &str, fallback_lines: usize) -> String {
    let lines: Vec<&str> = recent_output.lines().collect();
    let start = lines.len().saturating_sub(fallback_lines);
    lines[start..].join("\n")
}

pub fn summarize_timeout(config: &AiConfig) -> Duration {
    Duration::from_secs(config.timeout_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fallback_is_returned_on_error() {
        let (text, result) = with_timeout_and_fallback(
            Duration::from_secs(1),
            "fallback text".to_string(),
            || Err(anyhow::anyhow!("boom")),
        )
        .await;
        assert_eq!(text, "fallback text");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fallback_is_returned_on_timeout() {
        let (text, result) = with_timeout_and_fallback(
            Duration::from_millis(10),
            "fallback text".to_string(),
            || {
                std::thread::sleep(Duration::from_millis(200));
                Ok("too late".to_string())
            },
        )
        .await;
        assert_eq!(text, "fallback text");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn success_returns_provider_text() {
        let (text, result) = with_timeout_and_fallback(
            Duration::from_secs(1),
            "fallback".to_string(),
            || Ok("real summary".to_string()),
        )
        .await;
        assert_eq!(text, "real summary");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn empty_suggestion_list_is_a_valid_fallback() {
        let (suggestions, result) = with_timeout_and_fallback(
            Duration::from_millis(10),
            Vec::<Suggestion>::new(),
            || {
                std::thread::sleep(Duration::from_millis(50));
                Ok(vec![Suggestion { label: "too late".into(), command: "true".into() }])
            },
        )
        .await;
        assert!(suggestions.is_empty());
        assert!(result.is_err());
    }

    #[test]
    fn fallback_summary_returns_last_n_lines() {
        let output = (1..=30).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
        let summary = fallback_summary(&output, 5);
        assert_eq!(summary.lines().count(), 5);
        assert!(summary.starts_with("line 26"));
        assert!(summary.ends_with("line 30"));
    }

    #[test]
    fn fallback_summary_handles_short_output() {
        let summary = fallback_summary("only one line", 20);
        assert_eq!(summary, "only one line");
    }

    #[test]
    fn strip_code_fence_unwraps_json_block() {
        let wrapped = "```json\n{\"command\":\"pause\"}\n```";
        assert_eq!(strip_code_fence(wrapped), "{\"command\":\"pause\"}");
    }

    #[test]
    fn strip_code_fence_is_a_no_op_on_plain_json() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn parsed_nl_command_deserializes_partial_object() {
        let parsed: ParsedNlCommand =
            serde_json::from_str(r#"{"command":"pause","session":"proj","confidence":0.9}"#).unwrap();
        assert_eq!(parsed.command, "pause");
        assert_eq!(parsed.session.as_deref(), Some("proj"));
        assert!(parsed.args.is_empty());
        assert_eq!(parsed.confidence, 0.9);
    }

    #[test]
    fn suggestion_deserializes_from_json() {
        let s: Suggestion = serde_json::from_str(r#"{"label":"Run tests","command":"cargo test"}"#).unwrap();
        assert_eq!(s.label, "Run tests");
        assert_eq!(s.command, "cargo test");
    }
}
