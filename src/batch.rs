use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::badge::{diff, extract};
use crate::config::FETCH_SPACING_MS;
use crate::error::{AppError, Result};
use crate::keepa::ProductSource;
use crate::ledger::{RunLedger, RunSummary};
use crate::notify::Dispatcher;
use crate::retry::{with_backoff, RetryPolicy};
use crate::state::ProjectionCache;
use crate::store::TrackerStore;
use crate::types::{ItemState, ProductSnapshot, TrackedAsin};

/// How many unacknowledged events from earlier runs to re-attempt per run.
const REDELIVERY_LIMIT: i64 = 100;

/// Drives one fetch-diff-notify-persist pass over a set of due ASINs.
///
/// Candidates arrive already filtered to "due" (the scheduler's job); the
/// runner partitions them into fetch groups, retries group fetches with
/// bounded backoff, and contains every group- and item-level failure inside
/// the run. Only a credential/config rejection escapes — that cannot
/// self-heal and fails the whole run.
pub struct BatchRunner {
    source: Arc<dyn ProductSource>,
    dispatcher: Arc<Dispatcher>,
    store: TrackerStore,
    cache: Arc<ProjectionCache>,
    policy: RetryPolicy,
    group_size: usize,
}

impl BatchRunner {
    pub fn new(
        source: Arc<dyn ProductSource>,
        dispatcher: Arc<Dispatcher>,
        store: TrackerStore,
        cache: Arc<ProjectionCache>,
        policy: RetryPolicy,
        group_size: usize,
    ) -> Self {
        Self {
            source,
            dispatcher,
            store,
            cache,
            policy,
            group_size: group_size.max(1),
        }
    }

    pub async fn run_batch(&self, candidates: &[TrackedAsin]) -> Result<RunSummary> {
        let started_at = now_secs();
        let run_id = self.store.create_run(started_at).await?;
        let mut ledger = RunLedger::new(run_id, started_at);

        info!(run_id, candidates = candidates.len(), "batch run started");

        self.redeliver_unsent(run_id, &mut ledger).await;

        let mut config_failure: Option<AppError> = None;

        for (group_idx, group) in candidates.chunks(self.group_size).enumerate() {
            if group_idx > 0 {
                tokio::time::sleep(Duration::from_millis(FETCH_SPACING_MS)).await;
            }

            let asins: Vec<String> = group.iter().map(|t| t.asin.clone()).collect();
            let fetch_result = with_backoff(&self.policy, "fetch", || {
                let source = Arc::clone(&self.source);
                let asins = asins.clone();
                async move { source.fetch_group(&asins).await }
            })
            .await;

            let (snapshots, usage) = match fetch_result {
                Ok(ok) => ok,
                Err(e @ AppError::Config(_)) => {
                    error!(run_id, "fetch stage cannot run: {e}");
                    self.record_error(run_id, None, &e).await;
                    config_failure = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(
                        run_id,
                        group = group_idx,
                        group_size = group.len(),
                        "group fetch exhausted retries, continuing with next group: {e}",
                    );
                    ledger.record_group_failure(group.len());
                    self.record_error(run_id, None, &e).await;
                    continue;
                }
            };

            ledger.record_usage(&usage);
            if let Err(e) = self.store.record_cost(run_id, &usage, now_secs()).await {
                warn!(run_id, "cost ledger write failed: {e}");
            }

            let mut by_asin: HashMap<String, ProductSnapshot> = snapshots
                .into_iter()
                .map(|s| (s.asin.clone(), s))
                .collect();

            for item in group {
                let Some(snapshot) = by_asin.remove(&item.asin) else {
                    warn!(asin = %item.asin, "no product data returned for ASIN");
                    ledger.record_item_failure();
                    self.record_error(
                        run_id,
                        Some(&item.asin),
                        &AppError::FetchData("no product data returned".to_string()),
                    )
                    .await;
                    continue;
                };

                match self.process_item(run_id, item, &snapshot, &mut ledger).await {
                    Ok(()) => ledger.record_item_success(),
                    Err(e) => {
                        warn!(asin = %item.asin, "item processing failed: {e}");
                        ledger.record_item_failure();
                        self.record_error(run_id, Some(&item.asin), &e).await;
                    }
                }
            }
        }

        let summary = ledger.finalize(now_secs(), config_failure.is_some());
        self.store.finalize_run(run_id, &summary).await?;

        info!(
            run_id,
            status = %summary.status,
            items_attempted = summary.items_attempted,
            items_succeeded = summary.items_succeeded,
            transitions_found = summary.transitions_found,
            notifications_sent = summary.notifications_sent,
            tokens_consumed = summary.tokens_consumed,
            estimated_cost_cents = summary.estimated_cost_cents(),
            "batch run finished",
        );

        match config_failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// One item: load baseline, extract, diff, persist, dispatch. Within an
    /// item this pipeline is strictly sequential; notifications go out in
    /// diff order (gained first), so per-item ordering is preserved on the
    /// notification stream.
    async fn process_item(
        &self,
        run_id: i64,
        item: &TrackedAsin,
        snapshot: &ProductSnapshot,
        ledger: &mut RunLedger,
    ) -> Result<()> {
        if !snapshot.complete {
            ledger.record_data_gap();
            warn!(asin = %item.asin, "snapshot has no usable rank data, recording data gap");
        }

        let previous = match self.cache.get(&item.asin) {
            Some(state) => Some(state),
            None => {
                let state = self.store.item_state(&item.asin).await?;
                if let Some(ref s) = state {
                    self.cache.put(s.clone());
                }
                state
            }
        };

        let current_badges = extract::extract(snapshot);
        let (prev_badges, prev_ranks) = previous
            .map(|s| (s.badges, s.sales_ranks))
            .unwrap_or_default();
        let transitions = diff::diff(
            &item.asin,
            &prev_badges,
            &prev_ranks,
            &current_badges,
            &snapshot.sales_ranks,
            snapshot.fetched_at,
        );
        ledger.record_transitions(transitions.len());

        // Badges in categories the response omitted carry forward — their
        // absence was inconclusive, so the baseline must not forget them.
        let merged_badges =
            diff::carry_forward(&prev_badges, current_badges, &snapshot.sales_ranks);
        let new_state = ItemState::from_snapshot(snapshot, merged_badges);
        let inserted = self
            .store
            .persist_item(run_id, snapshot, &new_state, &transitions)
            .await?;
        self.cache.put(new_state);

        let title = snapshot.title.as_deref().or(item.title.as_deref());
        for (transition_id, transition) in &inserted {
            let result = self
                .dispatcher
                .notify(*transition_id, transition, title)
                .await?;
            ledger.record_delivery(result);
        }

        Ok(())
    }

    /// Events from earlier runs whose delivery never got acknowledged are
    /// re-attempted before new work — exhausted retries park an event, they
    /// never drop it.
    async fn redeliver_unsent(&self, run_id: i64, ledger: &mut RunLedger) {
        let pending = match self.store.unsent_transitions(run_id, REDELIVERY_LIMIT).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(run_id, "could not load unsent transitions: {e}");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        info!(run_id, pending = pending.len(), "re-attempting unacknowledged notifications");
        for row in pending {
            let transition = row.to_transition();
            match self.dispatcher.notify(row.id, &transition, None).await {
                Ok(result) => ledger.record_delivery(result),
                Err(e) => warn!(transition_id = row.id, "redelivery attempt failed: {e}"),
            }
        }
    }

    async fn record_error(&self, run_id: i64, asin: Option<&str>, e: &AppError) {
        if let Err(db_err) = self
            .store
            .record_error(run_id, asin, e.kind(), &e.to_string(), now_secs())
            .await
        {
            warn!(run_id, "error record write failed: {db_err}");
        }
    }
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
    use crate::notify::DeliveryChannel;
    use crate::types::{FetchUsage, RunStatus};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted product source. Ranks are swappable between runs; a poison
    /// ASIN makes every fetch of its group fail with a transient error.
    struct MockSource {
        calls: AtomicU32,
        ranks: Mutex<HashMap<String, Vec<(String, i64)>>>,
        poison: Option<String>,
        config_error: bool,
    }

    impl MockSource {
        fn new(ranks: &[(&str, &[(&str, i64)])]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                ranks: Mutex::new(
                    ranks
                        .iter()
                        .map(|(asin, entries)| {
                            (
                                asin.to_string(),
                                entries
                                    .iter()
                                    .map(|(c, r)| (c.to_string(), *r))
                                    .collect(),
                            )
                        })
                        .collect(),
                ),
                poison: None,
                config_error: false,
            })
        }

        fn with_poison(mut source: Arc<Self>, asin: &str) -> Arc<Self> {
            Arc::get_mut(&mut source).unwrap().poison = Some(asin.to_string());
            source
        }

        fn config_rejecting() -> Arc<Self> {
            let mut source = Self::new(&[]);
            Arc::get_mut(&mut source).unwrap().config_error = true;
            source
        }

        fn set_ranks(&self, asin: &str, entries: &[(&str, i64)]) {
            self.ranks.lock().unwrap().insert(
                asin.to_string(),
                entries.iter().map(|(c, r)| (c.to_string(), *r)).collect(),
            );
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProductSource for MockSource {
        async fn fetch_group(
            &self,
            asins: &[String],
        ) -> crate::error::Result<(Vec<ProductSnapshot>, FetchUsage)> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.config_error {
                return Err(AppError::Config("bad credentials".to_string()));
            }
            if let Some(poison) = &self.poison {
                if asins.contains(poison) {
                    return Err(AppError::FetchTransport("upstream timeout".to_string()));
                }
            }

            let ranks = self.ranks.lock().unwrap();
            let snapshots = asins
                .iter()
                .filter_map(|asin| {
                    let entries = ranks.get(asin)?;
                    Some(ProductSnapshot {
                        asin: asin.clone(),
                        title: Some(format!("Product {asin}")),
                        fetched_at: 1_700_000_000,
                        sales_ranks: entries.iter().cloned().collect(),
                        category_names: BTreeMap::new(),
                        monthly_sold: None,
                        complete: true,
                        raw_payload: serde_json::Value::Null,
                    })
                })
                .collect();

            Ok((
                snapshots,
                FetchUsage {
                    asins_requested: asins.len(),
                    tokens_consumed: asins.len() as i64,
                    tokens_left: Some(10_000),
                    response_time_ms: 5,
                },
            ))
        }
    }

    /// Records every delivered message; optionally fails the first N sends.
    struct RecordingChannel {
        messages: Mutex<Vec<String>>,
        fail_first: AtomicU32,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(0),
            })
        }

        fn failing_first(n: u32) -> Arc<Self> {
            let channel = Self::new();
            channel.fail_first.store(n, Ordering::SeqCst);
            channel
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryChannel for RecordingChannel {
        async fn deliver(&self, text: &str) -> crate::error::Result<()> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::Delivery("channel down".to_string()));
            }
            self.messages.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    async fn test_store() -> TrackerStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        TrackerStore::new(pool)
    }

    async fn tracked(store: &TrackerStore, asins: &[&str]) -> Vec<TrackedAsin> {
        for asin in asins {
            store.insert_tracked(asin, 60, 1, 0).await.unwrap();
        }
        store.all_tracked().await.unwrap()
    }

    fn runner(
        source: Arc<dyn ProductSource>,
        channel: Arc<dyn DeliveryChannel>,
        store: TrackerStore,
        group_size: usize,
    ) -> BatchRunner {
        let dispatcher = Arc::new(Dispatcher::new(channel, store.clone(), policy()));
        BatchRunner::new(
            source,
            dispatcher,
            store,
            ProjectionCache::new(),
            policy(),
            group_size,
        )
    }

    #[tokio::test]
    async fn cost_accounting_across_groups() {
        let store = test_store().await;
        let asins: Vec<String> = (0..150).map(|i| format!("B{i:09}")).collect();
        let not_a_badge: [(&str, i64); 1] = [("100", 2)];
        let rank_entries: Vec<(&str, &[(&str, i64)])> = asins
            .iter()
            .map(|a| (a.as_str(), not_a_badge.as_slice()))
            .collect();
        let source = MockSource::new(&rank_entries);
        let channel = RecordingChannel::new();

        let asin_refs: Vec<&str> = asins.iter().map(|s| s.as_str()).collect();
        let candidates = tracked(&store, &asin_refs).await;

        let runner = runner(source.clone(), channel, store, 100);
        let summary = runner.run_batch(&candidates).await.unwrap();

        // 150 ASINs with max group size 100: exactly two upstream calls, and
        // the run's cost is the sum of both calls' reported tokens.
        assert_eq!(source.call_count(), 2);
        assert_eq!(summary.tokens_consumed, 150);
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.items_attempted, 150);
        assert_eq!(summary.items_succeeded, 150);
        assert_eq!(summary.transitions_found, 0);
    }

    #[tokio::test]
    async fn one_failing_group_does_not_abort_the_run() {
        let store = test_store().await;
        let source = MockSource::with_poison(
            MockSource::new(&[
                ("B0GROUP001", &[("catA", 1)]),
                ("B0GROUP002", &[("catB", 1)]),
                ("B0GROUP003", &[("catC", 1)]),
            ]),
            "B0GROUP002",
        );
        let channel = RecordingChannel::new();
        let candidates = tracked(&store, &["B0GROUP001", "B0GROUP002", "B0GROUP003"]).await;

        let runner = runner(source.clone(), channel.clone(), store.clone(), 1);
        let summary = runner.run_batch(&candidates).await.unwrap();

        assert_eq!(summary.status, RunStatus::CompletedWithErrors);
        assert_eq!(summary.items_attempted, 3);
        assert_eq!(summary.items_succeeded, 2);
        // Groups 1 and 3 produced first-sight transitions; the failed group
        // inferred none.
        assert_eq!(summary.transitions_found, 2);
        let messages = channel.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| !m.contains("B0GROUP002")));

        // Poisoned group retried to exhaustion: 1 + 2 + 1 calls total.
        assert_eq!(source.call_count(), 4);

        let failed_rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM run_errors WHERE error_kind = 'fetch_transport'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(failed_rows, 1);
    }

    #[tokio::test]
    async fn badge_swap_notifies_gained_before_lost() {
        let store = test_store().await;
        let source = MockSource::new(&[("B0SWAP0001", &[("catA", 1)])]);
        let channel = RecordingChannel::new();
        let candidates = tracked(&store, &["B0SWAP0001"]).await;

        let runner = runner(source.clone(), channel.clone(), store, 100);

        // First sight: one gained event for catA.
        let summary = runner.run_batch(&candidates).await.unwrap();
        assert_eq!(summary.transitions_found, 1);
        assert!(channel.messages()[0].contains("GAINED"));

        // Badge moves from catA to catB.
        source.set_ranks("B0SWAP0001", &[("catA", 3), ("catB", 1)]);
        let summary = runner.run_batch(&candidates).await.unwrap();
        assert_eq!(summary.transitions_found, 2);

        let messages = channel.messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[1].contains("GAINED") && messages[1].contains("catB"));
        assert!(messages[2].contains("LOST") && messages[2].contains("catA"));
        assert!(messages[2].contains("#1 → #3"));
    }

    #[tokio::test]
    async fn unchanged_badges_emit_nothing() {
        let store = test_store().await;
        let source = MockSource::new(&[("B0SAME0001", &[("catA", 1)])]);
        let channel = RecordingChannel::new();
        let candidates = tracked(&store, &["B0SAME0001"]).await;

        let runner = runner(source, channel.clone(), store, 100);
        runner.run_batch(&candidates).await.unwrap();
        let summary = runner.run_batch(&candidates).await.unwrap();

        assert_eq!(summary.transitions_found, 0);
        assert_eq!(channel.messages().len(), 1);
    }

    #[tokio::test]
    async fn config_failure_fails_the_whole_run() {
        let store = test_store().await;
        let source = MockSource::config_rejecting();
        let channel = RecordingChannel::new();
        let candidates = tracked(&store, &["B0CONF0001"]).await;

        let runner = runner(source, channel, store.clone(), 100);
        let result = runner.run_batch(&candidates).await;
        assert!(matches!(result, Err(AppError::Config(_))));

        let status: String = sqlx::query_scalar("SELECT status FROM batch_runs ORDER BY id DESC LIMIT 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn unacknowledged_event_is_redelivered_on_the_next_run() {
        let store = test_store().await;
        let source = MockSource::new(&[("B0RETRY001", &[("catA", 1)])]);
        // Both attempts of the first run fail; the channel recovers after.
        let channel = RecordingChannel::failing_first(2);
        let candidates = tracked(&store, &["B0RETRY001"]).await;

        let runner = runner(source, channel.clone(), store.clone(), 100);

        let summary = runner.run_batch(&candidates).await.unwrap();
        assert_eq!(summary.notifications_sent, 0);
        assert!(channel.messages().is_empty());

        // Next run finds no new transitions but re-attempts the parked event.
        let summary = runner.run_batch(&candidates).await.unwrap();
        assert_eq!(summary.transitions_found, 0);
        assert_eq!(summary.notifications_sent, 1);
        assert_eq!(channel.messages().len(), 1);

        let unsent: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transitions WHERE notification_sent = 0")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(unsent, 0);
    }
}
