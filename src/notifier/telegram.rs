//! Messaging-platform adapter contract (§1, §4.8) plus a minimal, real
//! Telegram Bot API implementation — `ureq` is blocking, so every call
//! here is expected to run inside `tokio::task::spawn_blocking`.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Inline keyboard button: (label, callback data). Callback-data prefixes
/// are fixed by §6 (`confirm:`, `perm:`, `rate:`, `comp:`, `status:refresh`,
/// `suggest:`, `undo:`, `pick:`).
#[derive(Debug, Clone)]
pub struct Button {
    pub label: String,
    pub callback_data: String,
}

/// A 429 response from Telegram, distinguished from any other send failure
/// so the retry layer (§7) can honor `Retry-After` instead of guessing.
#[derive(Debug)]
pub struct Throttled {
    pub retry_after: Option<Duration>,
}

impl fmt::Display for Throttled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after {
            Some(d) => write!(f, "telegram throttled the request, retry after {}s", d.as_secs()),
            None => write!(f, "telegram throttled the request"),
        }
    }
}

impl std::error::Error for Throttled {}

/// What the messaging transport must support. Out of scope per §1 beyond
/// this contract — `TelegramAdapter` is the one concrete implementation.
pub trait ChatAdapter: Send + Sync {
    fn send_message(&self, text: &str, buttons: &[Button]) -> Result<String>;
    fn edit_message(&self, message_id: &str, text: &str, buttons: &[Button]) -> Result<()>;
    fn delete_message(&self, message_id: &str) -> Result<()>;
    /// The trivial "who am I" liveness probe (§4.8).
    fn who_am_i(&self) -> Result<()>;
    /// Stop the client-side loading spinner on a tapped inline button.
    /// `text`, if given, is shown as a brief toast.
    fn answer_callback_query(&self, callback_query_id: &str, text: Option<&str>) -> Result<()>;
}

pub struct TelegramAdapter {
    bot_token: String,
    chat_id: i64,
}

impl TelegramAdapter {
    pub fn new(bot_token: String, chat_id: i64) -> Self {
        Self { bot_token, chat_id }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    fn keyboard_json(buttons: &[Button]) -> serde_json::Value {
        let row: Vec<serde_json::Value> = buttons
            .iter()
            .map(|b| {
                serde_json::json!({
                    "text": b.label,
                    "callback_data": b.callback_data,
                })
            })
            .collect();
        serde_json::json!({ "inline_keyboard": [row] })
    }
}

#[derive(Deserialize)]
struct SendMessageResult {
    result: MessageIdPayload,
}

#[derive(Deserialize)]
struct MessageIdPayload {
    message_id: i64,
}

impl ChatAdapter for TelegramAdapter {
    fn send_message(&self, text: &str, buttons: &[Button]) -> Result<String> {
        let mut body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        if !buttons.is_empty() {
            body["reply_markup"] = Self::keyboard_json(buttons);
        }

        let response = ureq::post(&self.api_url("sendMessage"))
            .send_json(body)
            .map_err(wrap_throttled)?;
        let parsed: SendMessageResult = response
            .into_json()
            .context("telegram sendMessage returned an unexpected body")?;
        Ok(parsed.result.message_id.to_string())
    }

    fn edit_message(&self, message_id: &str, text: &str, buttons: &[Button]) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": self.chat_id,
            "message_id": message_id.parse::<i64>().unwrap_or_default(),
            "text": text,
        });
        if !buttons.is_empty() {
            body["reply_markup"] = Self::keyboard_json(buttons);
        }

        ureq::post(&self.api_url("editMessageText"))
            .send_json(body)
            .context("telegram editMessageText request failed")?;
        Ok(())
    }

    fn delete_message(&self, message_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "message_id": message_id.parse::<i64>().unwrap_or_default(),
        });

        ureq::post(&self.api_url("deleteMessage"))
            .send_json(body)
            .context("telegram deleteMessage request failed")?;
        Ok(())
    }

    fn who_am_i(&self) -> Result<()> {
        let response = ureq::get(&self.api_url("getMe"))
            .call()
            .context("telegram getMe request failed")?;
        if response.status() != 200 {
            bail!("telegram getMe returned status {}", response.status());
        }
        Ok(())
    }

    fn answer_callback_query(&self, callback_query_id: &str, text: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({ "callback_query_id": callback_query_id });
        if let Some(text) = text {
            body["text"] = serde_json::Value::String(text.to_string());
        }
        ureq::post(&self.api_url("answerCallbackQuery"))
            .send_json(body)
            .map_err(wrap_throttled)?;
        Ok(())
    }
}

/// Turn a 429 into a typed [`Throttled`] (carrying `Retry-After` if present)
/// instead of a generic context string, so the retry layer can downcast it.
fn wrap_throttled(err: ureq::Error) -> anyhow::Error {
    if let ureq::Error::Status(429, response) = &err {
        let retry_after = response
            .header("Retry-After")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return anyhow::Error::new(Throttled { retry_after });
    }
    anyhow::Error::new(err).context("telegram request failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_embeds_token() {
        let adapter = TelegramAdapter::new("abc:123".into(), 42);
        assert_eq!(
            adapter.api_url("sendMessage"),
            "https://api.telegram.org/botabc:123/sendMessage"
        );
    }

    #[test]
    fn throttled_display_includes_retry_after() {
        let t = Throttled { retry_after: Some(Duration::from_secs(5)) };
        assert_eq!(t.to_string(), "telegram throttled the request, retry after 5s");
        let t = Throttled { retry_after: None };
        assert_eq!(t.to_string(), "telegram throttled the request");
    }

    #[test]
    fn keyboard_json_shapes_single_row() {
        let buttons = vec![
            Button {
                label: "Allow".into(),
                callback_data: "perm:allow:s1".into(),
            },
            Button {
                label: "Deny".into(),
                callback_data: "perm:deny:s1".into(),
            },
        ];
        let kb = TelegramAdapter::keyboard_json(&buttons);
        assert_eq!(kb["inline_keyboard"][0].as_array().unwrap().len(), 2);
        assert_eq!(kb["inline_keyboard"][0][0]["callback_data"], "perm:allow:s1");
    }
}
