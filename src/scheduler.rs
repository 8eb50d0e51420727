use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info};

use crate::api::health::HealthState;
use crate::batch::BatchRunner;
use crate::config::{Config, HIGH_ACTIVITY_THRESHOLD};
use crate::error::Result;
use crate::ledger::RunSummary;
use crate::notify::Dispatcher;
use crate::store::TrackerStore;

/// Upper bound on due items pulled per scheduled run.
const DUE_SELECTION_LIMIT: i64 = 1_000;

/// Periodic trigger for the batch runner: every tick, select the ASINs
/// whose monitoring interval has elapsed and hand them to one run. The
/// first tick fires immediately on startup.
pub struct Scheduler {
    cfg: Config,
    store: TrackerStore,
    runner: Arc<BatchRunner>,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthState>,
}

impl Scheduler {
    pub fn new(
        cfg: Config,
        store: TrackerStore,
        runner: Arc<BatchRunner>,
        dispatcher: Arc<Dispatcher>,
        health: Arc<HealthState>,
    ) -> Self {
        Self { cfg, store, runner, dispatcher, health }
    }

    pub async fn run(self: Arc<Self>) {
        self.health.set_scheduler_running(true);
        self.dispatcher
            .system_alert(&format!(
                ":rocket: Best Seller tracker started — checking every {} minutes",
                self.cfg.check_interval_minutes,
            ))
            .await;

        let mut ticker = interval(Duration::from_secs(self.cfg.check_interval_minutes * 60));

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!("scheduled batch failed: {e}");
            }
        }
    }

    /// One scheduled (or manually triggered) pass. Returns None when
    /// nothing was due.
    pub async fn run_once(&self) -> Result<Option<RunSummary>> {
        let due = self.store.due_asins(now_secs(), DUE_SELECTION_LIMIT).await?;
        if due.is_empty() {
            info!("no ASINs due for checking");
            return Ok(None);
        }

        let summary = self.runner.run_batch(&due).await?;
        self.health.record_run(&summary);

        if summary.transitions_found >= HIGH_ACTIVITY_THRESHOLD {
            self.dispatcher
                .system_alert(&format!(
                    ":chart_with_upwards_trend: High activity: {} badge changes across {} ASINs \
                     ({} notifications sent, ~{}¢ spent)",
                    summary.transitions_found,
                    summary.items_attempted,
                    summary.notifications_sent,
                    summary.estimated_cost_cents(),
                ))
                .await;
        }

        Ok(Some(summary))
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
