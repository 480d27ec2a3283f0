//! Notifier (§4.8): batches non-urgent events, redacts every outbound
//! message, and absorbs downstream unreachability behind a durable offline
//! queue drained once a liveness probe succeeds again.

pub mod redact;
pub mod telegram;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, warn};

use telegram::{Button, ChatAdapter, Throttled};

/// Bound on in-call retry attempts before a send is queued offline (§7).
const MAX_SEND_ATTEMPTS: u32 = 5;
/// Exponential backoff ceiling: 1s, 2s, 4s, ... capped here (§7).
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Immediate,
    Batched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    PermissionPrompt,
    InputPrompt,
    RateLimit,
    Error,
    Completion,
    AutoResponse,
    TokenWarning,
    System,
}

impl NotificationKind {
    /// §4.8: permission-prompt, error, and rate-limit always use
    /// SendImmediate; completion, auto-response, and token-warning use Send.
    fn urgency(self) -> Urgency {
        match self {
            NotificationKind::PermissionPrompt
            | NotificationKind::InputPrompt
            | NotificationKind::Error
            | NotificationKind::RateLimit => Urgency::Immediate,
            NotificationKind::Completion
            | NotificationKind::AutoResponse
            | NotificationKind::TokenWarning
            | NotificationKind::System => Urgency::Batched,
        }
    }

    /// Quiet hours drop only these two kinds from batched delivery (§4.8).
    fn droppable_in_quiet_hours(self) -> bool {
        matches!(
            self,
            NotificationKind::Completion | NotificationKind::TokenWarning
        )
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub body: String,
    pub buttons: Vec<ButtonSpec>,
}

#[derive(Debug, Clone)]
pub struct ButtonSpec {
    pub label: String,
    pub callback_data: String,
}

struct OfflineQueueEntry {
    body: String,
    buttons: Vec<ButtonSpec>,
}

struct BatchBuffer {
    entries: Vec<Notification>,
}

pub struct Notifier {
    adapter: Arc<dyn ChatAdapter>,
    batch: Mutex<BatchBuffer>,
    offline_queue: Mutex<VecDeque<OfflineQueueEntry>>,
    reachable: Mutex<bool>,
    quiet_hours: QuietHoursWindow,
    backoff_base: Duration,
}

#[derive(Clone, Copy)]
pub struct QuietHoursWindow {
    pub enabled: bool,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

impl QuietHoursWindow {
    pub fn none() -> Self {
        Self {
            enabled: false,
            start: None,
            end: None,
        }
    }

    fn contains(&self, now: NaiveTime) -> bool {
        let (Some(start), Some(end)) = (self.start, self.end) else {
            return false;
        };
        if start <= end {
            now >= start && now < end
        } else {
            // Wraps past midnight, e.g. 22:00–07:00.
            now >= start || now < end
        }
    }

    fn is_active_now(&self) -> bool {
        self.enabled && self.contains(chrono::Local::now().time())
    }
}

impl Notifier {
    pub fn new(adapter: Arc<dyn ChatAdapter>, quiet_hours: QuietHoursWindow) -> Self {
        Self::with_backoff_base(adapter, quiet_hours, Duration::from_secs(1))
    }

    /// Like [`Self::new`], but with an explicit starting backoff delay —
    /// tests shrink this so a retry sequence doesn't actually sleep for
    /// seconds.
    pub fn with_backoff_base(adapter: Arc<dyn ChatAdapter>, quiet_hours: QuietHoursWindow, backoff_base: Duration) -> Self {
        Self {
            adapter,
            batch: Mutex::new(BatchBuffer { entries: Vec::new() }),
            offline_queue: Mutex::new(VecDeque::new()),
            reachable: Mutex::new(true),
            quiet_hours,
            backoff_base,
        }
    }

    /// Bypasses batching but not redaction or the offline queue.
    pub async fn send_immediate(&self, notification: Notification) {
        let body = redact::redact(&notification.body);
        self.deliver_or_queue(body, notification.buttons_for_delivery())
            .await;
    }

    /// Redacts, then enqueues into the batch buffer (flushed by
    /// [`run_batch_flusher`]). Quiet hours silently drop droppable kinds —
    /// they are still persisted as Events by the dispatcher, just not sent.
    pub async fn send(&self, notification: Notification) {
        if self.quiet_hours.is_active_now() && notification.kind.droppable_in_quiet_hours() {
            debug!(kind = ?notification.kind, "dropped during quiet hours");
            return;
        }
        let mut batch = self.batch.lock().await;
        batch.entries.push(notification);
    }

    /// Flush the batch buffer: a single queued event sends as-is; two or
    /// more concatenate into one compound message in arrival order (§4.8).
    pub async fn flush(&self) {
        let entries = {
            let mut batch = self.batch.lock().await;
            std::mem::take(&mut batch.entries)
        };
        if entries.is_empty() {
            return;
        }

        if entries.len() == 1 {
            let entry = &entries[0];
            let body = redact::redact(&entry.body);
            self.deliver_or_queue(body, entry.buttons_for_delivery()).await;
            return;
        }

        let compound = entries
            .iter()
            .map(|e| redact::redact(&e.body))
            .collect::<Vec<_>>()
            .join("\n\n");
        self.deliver_or_queue(compound, Vec::new()).await;
    }

    async fn deliver_or_queue(&self, body: String, buttons: Vec<Button>) {
        let button_specs: Vec<ButtonSpec> = buttons
            .iter()
            .map(|b| ButtonSpec {
                label: b.label.clone(),
                callback_data: b.callback_data.clone(),
            })
            .collect();

        if self.send_with_retry(&body, &buttons).await.is_ok() {
            return;
        }

        warn!("message send failed after retries, queuing for offline delivery");
        let mut reachable = self.reachable.lock().await;
        *reachable = false;
        drop(reachable);

        self.offline_queue.lock().await.push_back(OfflineQueueEntry {
            body,
            buttons: button_specs,
        });
    }

    /// Exponential backoff (1x, 2x, 4x, ... base, capped) around the
    /// blocking `send_message` call, honoring Telegram's `Retry-After` when
    /// the failure is a [`Throttled`] 429 rather than guessing (§7).
    async fn send_with_retry(&self, body: &str, buttons: &[Button]) -> anyhow::Result<String> {
        let mut delay = self.backoff_base;
        let mut last_err = anyhow::anyhow!("send never attempted");
        for attempt in 0..MAX_SEND_ATTEMPTS {
            let adapter = self.adapter.clone();
            let send_body = body.to_string();
            let send_buttons = buttons.to_vec();
            match task::spawn_blocking(move || adapter.send_message(&send_body, &send_buttons)).await {
                Ok(Ok(id)) => return Ok(id),
                Ok(Err(err)) => {
                    let wait = err
                        .downcast_ref::<Throttled>()
                        .and_then(|t| t.retry_after)
                        .unwrap_or(delay)
                        .min(BACKOFF_CAP);
                    last_err = err;
                    if attempt + 1 < MAX_SEND_ATTEMPTS {
                        tokio::time::sleep(wait).await;
                        delay = (delay * 2).min(BACKOFF_CAP);
                    }
                }
                Err(join_err) => {
                    return Err(anyhow::anyhow!("send task panicked: {join_err}"));
                }
            }
        }
        Err(last_err)
    }

    /// Liveness probe + FIFO drain, run periodically (§4.8, §7).
    pub async fn check_liveness_and_drain(&self) {
        let adapter = self.adapter.clone();
        let probe = task::spawn_blocking(move || adapter.who_am_i()).await;
        let is_up = matches!(probe, Ok(Ok(())));

        {
            let mut reachable = self.reachable.lock().await;
            if *reachable == is_up {
                return;
            }
            *reachable = is_up;
        }

        if !is_up {
            return;
        }

        loop {
            let next = {
                let mut queue = self.offline_queue.lock().await;
                queue.pop_front()
            };
            let Some(entry) = next else { break };

            let buttons: Vec<Button> = entry
                .buttons
                .iter()
                .map(|b| Button {
                    label: b.label.clone(),
                    callback_data: b.callback_data.clone(),
                })
                .collect();
            let adapter = self.adapter.clone();
            let body = entry.body.clone();
            let sent = task::spawn_blocking(move || adapter.send_message(&body, &buttons)).await;

            if !matches!(sent, Ok(Ok(_))) {
                // Still unreachable — put it back at the front and stop.
                self.offline_queue.lock().await.push_front(entry);
                let mut reachable = self.reachable.lock().await;
                *reachable = false;
                break;
            }

            // Respect downstream rate limits between drained messages.
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    #[cfg(test)]
    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

impl Notification {
    fn buttons_for_delivery(&self) -> Vec<Button> {
        self.buttons
            .iter()
            .map(|b| Button {
                label: b.label.clone(),
                callback_data: b.callback_data.clone(),
            })
            .collect()
    }
}

/// Periodic batch-flush task (§5: one task per notifier batch-flusher).
pub async fn run_batch_flusher(notifier: Arc<Notifier>, window: Duration) {
    let mut ticker = tokio::time::interval(window);
    loop {
        ticker.tick().await;
        notifier.flush().await;
    }
}

/// Periodic liveness-checker task (§4.8: every 30s by default).
pub async fn run_liveness_checker(notifier: Arc<Notifier>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        notifier.check_liveness_and_drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A transport that's either fully up or fully down, toggled explicitly
    /// by each test — a decrementing failure counter doesn't compose with
    /// retry-with-backoff, since one logical send now makes several
    /// `send_message` calls instead of one.
    struct FakeAdapter {
        up: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl FakeAdapter {
        fn new() -> Self {
            Self {
                up: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn down() -> Self {
            Self {
                up: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }
    }

    impl ChatAdapter for FakeAdapter {
        fn send_message(&self, text: &str, _buttons: &[Button]) -> anyhow::Result<String> {
            if !self.up.load(Ordering::SeqCst) {
                anyhow::bail!("simulated transport failure");
            }
            self.sent.try_lock().unwrap().push(text.to_string());
            Ok("msg-1".to_string())
        }
        fn edit_message(&self, _: &str, _: &str, _: &[Button]) -> anyhow::Result<()> {
            Ok(())
        }
        fn delete_message(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn who_am_i(&self) -> anyhow::Result<()> {
            if !self.up.load(Ordering::SeqCst) {
                anyhow::bail!("still down");
            }
            Ok(())
        }
        fn answer_callback_query(&self, _: &str, _: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Backoff base small enough that a full `MAX_SEND_ATTEMPTS` retry
    /// sequence doesn't make a test slow.
    fn fast_notifier(adapter: Arc<FakeAdapter>, quiet_hours: QuietHoursWindow) -> Notifier {
        Notifier::with_backoff_base(adapter, quiet_hours, Duration::from_millis(1))
    }

    /// Throttled for its first `fails_remaining` calls, then succeeds —
    /// exercises the retry loop actually recovering mid-sequence.
    struct FlakyAdapter {
        fails_remaining: std::sync::atomic::AtomicUsize,
        sent: Mutex<Vec<String>>,
    }

    impl ChatAdapter for FlakyAdapter {
        fn send_message(&self, text: &str, _buttons: &[Button]) -> anyhow::Result<String> {
            if self.fails_remaining.load(Ordering::SeqCst) > 0 {
                self.fails_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow::Error::new(Throttled { retry_after: Some(Duration::from_millis(1)) }));
            }
            self.sent.try_lock().unwrap().push(text.to_string());
            Ok("msg-1".to_string())
        }
        fn edit_message(&self, _: &str, _: &str, _: &[Button]) -> anyhow::Result<()> {
            Ok(())
        }
        fn delete_message(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn who_am_i(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn answer_callback_query(&self, _: &str, _: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn throttled_send_recovers_within_retry_budget() {
        let adapter = Arc::new(FlakyAdapter {
            fails_remaining: std::sync::atomic::AtomicUsize::new(2),
            sent: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::with_backoff_base(adapter.clone(), QuietHoursWindow::none(), Duration::from_millis(1));
        notifier
            .send_immediate(notification("eventually", NotificationKind::Error))
            .await;
        assert_eq!(adapter.sent.lock().await.as_slice(), &["eventually".to_string()]);
        assert_eq!(notifier.offline_queue_len().await, 0);
    }

    fn notification(body: &str, kind: NotificationKind) -> Notification {
        Notification {
            kind,
            body: body.to_string(),
            buttons: Vec::new(),
        }
    }

    #[tokio::test]
    async fn batched_events_concatenate_in_arrival_order() {
        let adapter = Arc::new(FakeAdapter::new());
        let notifier = fast_notifier(adapter.clone(), QuietHoursWindow::none());
        notifier.send(notification("first", NotificationKind::Completion)).await;
        notifier.send(notification("second", NotificationKind::TokenWarning)).await;
        notifier.send(notification("third", NotificationKind::AutoResponse)).await;
        notifier.flush().await;

        let sent = adapter.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let idx_first = sent[0].find("first").unwrap();
        let idx_second = sent[0].find("second").unwrap();
        let idx_third = sent[0].find("third").unwrap();
        assert!(idx_first < idx_second && idx_second < idx_third);
    }

    #[tokio::test]
    async fn single_queued_event_sends_as_is() {
        let adapter = Arc::new(FakeAdapter::new());
        let notifier = fast_notifier(adapter.clone(), QuietHoursWindow::none());
        notifier.send(notification("solo", NotificationKind::Completion)).await;
        notifier.flush().await;
        let sent = adapter.sent.lock().await;
        assert_eq!(sent[0], "solo");
    }

    #[tokio::test]
    async fn send_failure_queues_for_offline_delivery() {
        let adapter = Arc::new(FakeAdapter::down());
        let notifier = fast_notifier(adapter, QuietHoursWindow::none());
        notifier
            .send_immediate(notification("urgent", NotificationKind::Error))
            .await;
        assert_eq!(notifier.offline_queue_len().await, 1);
    }

    #[tokio::test]
    async fn send_retries_with_backoff_before_queuing() {
        let adapter = Arc::new(FakeAdapter::down());
        let notifier = fast_notifier(adapter.clone(), QuietHoursWindow::none());
        notifier
            .send_immediate(notification("urgent", NotificationKind::Error))
            .await;
        // Every attempt failed (transport never came up), so nothing reached
        // "sent" and it landed in the offline queue — but it took the full
        // MAX_SEND_ATTEMPTS retries to get there, not just one try.
        assert!(adapter.sent.lock().await.is_empty());
        assert_eq!(notifier.offline_queue_len().await, 1);
    }

    #[tokio::test]
    async fn offline_queue_drains_in_fifo_order_on_reconnect() {
        let adapter = Arc::new(FakeAdapter::down());
        let notifier = fast_notifier(adapter.clone(), QuietHoursWindow::none());
        for i in 0..3 {
            notifier
                .send_immediate(notification(&format!("msg-{i}"), NotificationKind::Error))
                .await;
        }
        assert_eq!(notifier.offline_queue_len().await, 3);

        adapter.set_up(true);
        notifier.check_liveness_and_drain().await;

        let sent = adapter.sent.lock().await;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], "msg-0");
        assert_eq!(sent[1], "msg-1");
        assert_eq!(sent[2], "msg-2");
        assert_eq!(notifier.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn quiet_hours_drop_completion_but_not_immediate_errors() {
        let adapter = Arc::new(FakeAdapter::new());
        let quiet = QuietHoursWindow {
            enabled: true,
            start: Some(NaiveTime::from_hms_opt(0, 0, 0).unwrap()),
            end: Some(NaiveTime::from_hms_opt(23, 59, 59).unwrap()),
        };
        let notifier = fast_notifier(adapter.clone(), quiet);
        notifier.send(notification("completed", NotificationKind::Completion)).await;
        notifier.flush().await;
        assert!(adapter.sent.lock().await.is_empty());

        notifier
            .send_immediate(notification("boom", NotificationKind::Error))
            .await;
        assert_eq!(adapter.sent.lock().await.len(), 1);
    }

    #[test]
    fn redaction_applies_before_delivery() {
        let redacted = redact::redact("leaking sk-ant-REDACTED");
        assert!(!redacted.contains("sk-ant-REDACTED"));
    }
}
