use crate::config::TOKEN_COST_CENTS_PER_1000;
use crate::types::{DeliveryResult, FetchUsage, RunStatus};

/// In-memory accumulator for one batch run. No retries, no external calls —
/// counters only, finalized into the persisted batch_runs row at run end.
#[derive(Debug)]
pub struct RunLedger {
    pub run_id: i64,
    pub started_at: i64,
    pub items_attempted: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
    pub transitions_found: usize,
    pub notifications_sent: usize,
    pub notifications_suppressed: usize,
    pub notifications_failed: usize,
    /// Items whose snapshot arrived without usable rank data.
    pub data_gaps: usize,
    pub fetch_calls: usize,
    pub group_failures: usize,
    pub tokens_consumed: i64,
}

impl RunLedger {
    pub fn new(run_id: i64, started_at: i64) -> Self {
        Self {
            run_id,
            started_at,
            items_attempted: 0,
            items_succeeded: 0,
            items_failed: 0,
            transitions_found: 0,
            notifications_sent: 0,
            notifications_suppressed: 0,
            notifications_failed: 0,
            data_gaps: 0,
            fetch_calls: 0,
            group_failures: 0,
            tokens_consumed: 0,
        }
    }

    pub fn record_item_success(&mut self) {
        self.items_attempted += 1;
        self.items_succeeded += 1;
    }

    pub fn record_item_failure(&mut self) {
        self.items_attempted += 1;
        self.items_failed += 1;
    }

    /// A whole group whose fetch retries exhausted: every member counts as
    /// an attempted failure.
    pub fn record_group_failure(&mut self, group_size: usize) {
        self.group_failures += 1;
        self.items_attempted += group_size;
        self.items_failed += group_size;
    }

    pub fn record_transitions(&mut self, count: usize) {
        self.transitions_found += count;
    }

    pub fn record_data_gap(&mut self) {
        self.data_gaps += 1;
    }

    pub fn record_delivery(&mut self, result: DeliveryResult) {
        match result {
            DeliveryResult::Sent => self.notifications_sent += 1,
            DeliveryResult::Suppressed => self.notifications_suppressed += 1,
            DeliveryResult::Failed => self.notifications_failed += 1,
        }
    }

    pub fn record_usage(&mut self, usage: &FetchUsage) {
        self.fetch_calls += 1;
        self.tokens_consumed += usage.tokens_consumed;
    }

    pub fn had_errors(&self) -> bool {
        self.items_failed > 0 || self.group_failures > 0
    }

    /// Read-only summary for persistence and reporting. `failed` marks the
    /// whole-run fetch-stage failure case; otherwise status derives from
    /// whether any group or item failed.
    pub fn finalize(&self, completed_at: i64, failed: bool) -> RunSummary {
        let status = if failed {
            RunStatus::Failed
        } else if self.had_errors() {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };
        RunSummary {
            run_id: self.run_id,
            status,
            started_at: self.started_at,
            completed_at,
            items_attempted: self.items_attempted,
            items_succeeded: self.items_succeeded,
            transitions_found: self.transitions_found,
            notifications_sent: self.notifications_sent,
            tokens_consumed: self.tokens_consumed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub started_at: i64,
    pub completed_at: i64,
    pub items_attempted: usize,
    pub items_succeeded: usize,
    pub transitions_found: usize,
    pub notifications_sent: usize,
    pub tokens_consumed: i64,
}

impl RunSummary {
    pub fn estimated_cost_cents(&self) -> i64 {
        estimate_cost_cents(self.tokens_consumed)
    }
}

/// Upstream pricing: $1 per 1000 tokens, minimum one cent per run.
pub fn estimate_cost_cents(tokens: i64) -> i64 {
    ((tokens * TOKEN_COST_CENTS_PER_1000) / 1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_run_finalizes_completed() {
        let mut ledger = RunLedger::new(1, 100);
        ledger.record_item_success();
        ledger.record_item_success();
        ledger.record_transitions(3);
        ledger.record_delivery(DeliveryResult::Sent);

        let summary = ledger.finalize(160, false);
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.items_attempted, 2);
        assert_eq!(summary.items_succeeded, 2);
        assert_eq!(summary.transitions_found, 3);
        assert_eq!(summary.notifications_sent, 1);
    }

    #[test]
    fn group_failure_downgrades_status_and_counts_members() {
        let mut ledger = RunLedger::new(1, 100);
        ledger.record_item_success();
        ledger.record_group_failure(50);

        let summary = ledger.finalize(160, false);
        assert_eq!(summary.status, RunStatus::CompletedWithErrors);
        assert_eq!(summary.items_attempted, 51);
        assert_eq!(summary.items_succeeded, 1);
    }

    #[test]
    fn fetch_stage_failure_wins_over_everything() {
        let mut ledger = RunLedger::new(1, 100);
        ledger.record_item_success();
        let summary = ledger.finalize(160, true);
        assert_eq!(summary.status, RunStatus::Failed);
    }

    #[test]
    fn usage_accumulates_across_calls() {
        let mut ledger = RunLedger::new(1, 100);
        ledger.record_usage(&FetchUsage {
            asins_requested: 100,
            tokens_consumed: 100,
            tokens_left: Some(900),
            response_time_ms: 250,
        });
        ledger.record_usage(&FetchUsage {
            asins_requested: 50,
            tokens_consumed: 50,
            tokens_left: Some(850),
            response_time_ms: 180,
        });
        assert_eq!(ledger.fetch_calls, 2);
        assert_eq!(ledger.tokens_consumed, 150);
    }

    #[test]
    fn cost_has_a_one_cent_floor() {
        assert_eq!(estimate_cost_cents(0), 1);
        assert_eq!(estimate_cost_cents(5), 1);
        assert_eq!(estimate_cost_cents(1000), 100);
        assert_eq!(estimate_cost_cents(1500), 150);
    }
}
