use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::TrackerStore;
use crate::types::{DeliveryResult, Transition, TransitionKind};

/// Seam between the dispatcher and the chat service. The channel only
/// delivers a formatted message and reports success — suppression, retry,
/// and the sent-flag protocol all live in the dispatcher.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<()>;
}

/// Slack delivery via chat.postMessage with a bot token.
pub struct SlackChannel {
    client: reqwest::Client,
    base_url: String,
    token: String,
    channel_id: String,
}

impl SlackChannel {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.api_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.slack_api_url.clone(),
            token: cfg.slack_bot_token.clone(),
            channel_id: cfg.slack_channel_id.clone(),
        })
    }
}

#[async_trait]
impl DeliveryChannel for SlackChannel {
    async fn deliver(&self, text: &str) -> Result<()> {
        let url = format!("{}/chat.postMessage", self.base_url);
        let body = serde_json::json!({
            "channel": self.channel_id,
            "text": text,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Delivery(format!("Slack API returned HTTP {status}")));
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::Delivery(format!("unreadable Slack response: {e}")))?;
        if payload.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            Ok(())
        } else {
            let error = payload
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            Err(AppError::Delivery(format!("Slack API returned not ok: {error}")))
        }
    }
}

/// Maps transitions to formatted alerts and drives at-most-once delivery:
/// check the persisted sent flag, send with bounded retry, mark sent only
/// on a positive acknowledgment.
pub struct Dispatcher {
    channel: Arc<dyn DeliveryChannel>,
    store: TrackerStore,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn DeliveryChannel>, store: TrackerStore, policy: RetryPolicy) -> Self {
        Self { channel, store, policy }
    }

    /// Deliver the alert for one persisted transition. `Suppressed` means
    /// the sent flag was already set (a replayed run) and no external call
    /// was made. `Failed` means retries exhausted — the flag stays false so
    /// a later run re-attempts this same event.
    pub async fn notify(
        &self,
        transition_id: i64,
        transition: &Transition,
        title: Option<&str>,
    ) -> Result<DeliveryResult> {
        if self.store.transition_sent(transition_id).await? {
            info!(
                asin = %transition.asin,
                category_id = %transition.category_id,
                "notification already sent, suppressing",
            );
            return Ok(DeliveryResult::Suppressed);
        }

        let text = format_transition(transition, title);
        let channel = Arc::clone(&self.channel);
        match with_backoff(&self.policy, "notify", || {
            let channel = Arc::clone(&channel);
            let text = text.clone();
            async move { channel.deliver(&text).await }
        })
        .await
        {
            Ok(()) => {
                self.store
                    .mark_transition_sent(transition_id, now_secs())
                    .await?;
                Ok(DeliveryResult::Sent)
            }
            Err(e) => {
                warn!(
                    asin = %transition.asin,
                    category_id = %transition.category_id,
                    "notification delivery exhausted retries: {e}",
                );
                Ok(DeliveryResult::Failed)
            }
        }
    }

    /// One-shot operational alert (startup, high activity). Best effort —
    /// a failure is logged, never retried, and never blocks a run.
    pub async fn system_alert(&self, text: &str) {
        if let Err(e) = self.channel.deliver(text).await {
            warn!("system alert delivery failed: {e}");
        }
    }
}

/// Message taxonomy. Gained: previous rank or "new", current rank #1.
/// Lost: previous rank #1, current rank or "unranked".
pub fn format_transition(t: &Transition, title: Option<&str>) -> String {
    let product = title.unwrap_or("(title unknown)");
    let when = format_utc(t.detected_at);
    match t.kind {
        TransitionKind::Gained => {
            let from = t
                .rank_before
                .map(|r| format!("#{r}"))
                .unwrap_or_else(|| "new".to_string());
            format!(
                ":tada: *GAINED Best Seller badge*\n\
                 *ASIN:* `{}`\n\
                 *Product:* {}\n\
                 *Category:* {}\n\
                 *Rank:* {} → #1\n\
                 *Time:* {}\n\
                 <https://amazon.com/dp/{}|View on Amazon>",
                t.asin, product, t.category_name, from, when, t.asin,
            )
        }
        TransitionKind::Lost => {
            let to = t
                .rank_after
                .map(|r| format!("#{r}"))
                .unwrap_or_else(|| "unranked".to_string());
            format!(
                ":warning: *LOST Best Seller badge*\n\
                 *ASIN:* `{}`\n\
                 *Product:* {}\n\
                 *Category:* {}\n\
                 *Rank:* #1 → {}\n\
                 *Time:* {}\n\
                 <https://amazon.com/dp/{}|View on Amazon>",
                t.asin, product, t.category_name, to, when, t.asin,
            )
        }
    }
}

/// Render unix seconds as "YYYY-MM-DD HH:MM:SS UTC" without a date crate.
/// Days-to-civil conversion per the standard Gregorian era arithmetic.
pub fn format_utc(secs: i64) -> String {
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (hour, minute, second) = (rem / 3_600, (rem % 3_600) / 60, rem % 60);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02} UTC")
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemState, ProductSnapshot};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted channel: fails the first `fail_first` deliveries, counts calls.
    struct MockChannel {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl MockChannel {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self { calls: AtomicU32::new(0), fail_first })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeliveryChannel for MockChannel {
        async fn deliver(&self, _text: &str) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(AppError::Delivery("channel down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay_ms: 1, max_delay_ms: 4 }
    }

    fn transition(kind: TransitionKind) -> Transition {
        Transition {
            asin: "B0TESTASIN".to_string(),
            category_id: "595048".to_string(),
            category_name: "External Hard Drives".to_string(),
            kind,
            rank_before: match kind {
                TransitionKind::Gained => None,
                TransitionKind::Lost => Some(1),
            },
            rank_after: match kind {
                TransitionKind::Gained => Some(1),
                TransitionKind::Lost => Some(4),
            },
            detected_at: 1_700_000_000,
        }
    }

    async fn store_with_transition() -> (TrackerStore, i64, Transition) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = TrackerStore::new(pool);
        store.insert_tracked("B0TESTASIN", 60, 1, 0).await.unwrap();

        let t = transition(TransitionKind::Gained);
        let snapshot = ProductSnapshot {
            asin: "B0TESTASIN".to_string(),
            title: Some("Widget".to_string()),
            fetched_at: 1_700_000_000,
            sales_ranks: BTreeMap::new(),
            category_names: BTreeMap::new(),
            monthly_sold: None,
            complete: true,
            raw_payload: serde_json::Value::Null,
        };
        let state = ItemState::from_snapshot(&snapshot, BTreeMap::new());
        let inserted = store
            .persist_item(1, &snapshot, &state, std::slice::from_ref(&t))
            .await
            .unwrap();
        let (id, _) = inserted[0];
        (store, id, t)
    }

    #[tokio::test]
    async fn already_sent_event_is_suppressed_without_external_call() {
        let (store, id, t) = store_with_transition().await;
        store.mark_transition_sent(id, 1_700_000_050).await.unwrap();

        let channel = MockChannel::new(0);
        let dispatcher = Dispatcher::new(channel.clone(), store, policy());

        let result = dispatcher.notify(id, &t, Some("Widget")).await.unwrap();
        assert_eq!(result, DeliveryResult::Suppressed);
        assert_eq!(channel.call_count(), 0);
    }

    #[tokio::test]
    async fn acknowledged_delivery_marks_sent() {
        let (store, id, t) = store_with_transition().await;
        let channel = MockChannel::new(0);
        let dispatcher = Dispatcher::new(channel.clone(), store.clone(), policy());

        let result = dispatcher.notify(id, &t, Some("Widget")).await.unwrap();
        assert_eq!(result, DeliveryResult::Sent);
        assert_eq!(channel.call_count(), 1);
        assert!(store.transition_sent(id).await.unwrap());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let (store, id, t) = store_with_transition().await;
        let channel = MockChannel::new(2);
        let dispatcher = Dispatcher::new(channel.clone(), store.clone(), policy());

        let result = dispatcher.notify(id, &t, None).await.unwrap();
        assert_eq!(result, DeliveryResult::Sent);
        assert_eq!(channel.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_event_unsent() {
        let (store, id, t) = store_with_transition().await;
        let channel = MockChannel::new(99);
        let dispatcher = Dispatcher::new(channel.clone(), store.clone(), policy());

        let result = dispatcher.notify(id, &t, None).await.unwrap();
        assert_eq!(result, DeliveryResult::Failed);
        assert_eq!(channel.call_count(), 3);
        assert!(!store.transition_sent(id).await.unwrap());
    }

    #[test]
    fn gained_message_without_prior_rank_says_new() {
        let text = format_transition(&transition(TransitionKind::Gained), Some("Widget"));
        assert!(text.contains("GAINED"));
        assert!(text.contains("new → #1"));
        assert!(text.contains("B0TESTASIN"));
        assert!(text.contains("External Hard Drives"));
    }

    #[test]
    fn lost_message_without_current_rank_says_unranked() {
        let mut t = transition(TransitionKind::Lost);
        t.rank_after = None;
        let text = format_transition(&t, None);
        assert!(text.contains("LOST"));
        assert!(text.contains("#1 → unranked"));
        assert!(text.contains("(title unknown)"));
    }

    #[test]
    fn utc_formatting_matches_known_timestamps() {
        assert_eq!(format_utc(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_utc(1_700_000_000), "2023-11-14 22:13:20 UTC");
        assert_eq!(format_utc(951_782_400), "2000-02-29 00:00:00 UTC");
    }
}
