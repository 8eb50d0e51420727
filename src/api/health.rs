//! Shared health state for the /health endpoint.
//! Updated by the scheduler after each run, read by the API.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::ledger::RunSummary;

#[derive(Default)]
pub struct HealthState {
    /// True once the scheduler loop is running.
    pub scheduler_running: AtomicBool,
    /// Unix seconds of the last completed batch run (0 = none yet).
    pub last_run_at: AtomicI64,
    pub runs_completed: AtomicU64,
    pub transitions_total: AtomicU64,
    pub tokens_total: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scheduler_running(&self, v: bool) {
        self.scheduler_running.store(v, Ordering::Relaxed);
    }

    pub fn record_run(&self, summary: &RunSummary) {
        self.last_run_at.store(summary.completed_at, Ordering::Relaxed);
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        self.transitions_total
            .fetch_add(summary.transitions_found as u64, Ordering::Relaxed);
        self.tokens_total
            .fetch_add(summary.tokens_consumed.max(0) as u64, Ordering::Relaxed);
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler_running.load(Ordering::Relaxed)
    }

    pub fn last_run_at(&self) -> i64 {
        self.last_run_at.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn transitions_total(&self) -> u64 {
        self.transitions_total.load(Ordering::Relaxed)
    }

    pub fn tokens_total(&self) -> u64 {
        self.tokens_total.load(Ordering::Relaxed)
    }
}
