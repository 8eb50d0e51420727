use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::badge::extract;
use crate::db::models::{CurrentStateRow, SnapshotRow, TrackedAsinRow, TransitionRow};
use crate::error::Result;
use crate::ledger::RunSummary;
use crate::types::{FetchUsage, ItemState, ProductSnapshot, TrackedAsin, Transition};

/// All persistence for the tracker: tracked ASINs, the current-state
/// projection, append-only snapshots and transitions, batch runs, and the
/// cost ledger. The projection is a cache — `item_state` falls back to
/// rebuilding it from the latest snapshot so a lost row never poisons the
/// diff baseline.
#[derive(Clone)]
pub struct TrackerStore {
    pool: SqlitePool,
}

impl TrackerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Tracked ASINs
    // -----------------------------------------------------------------------

    /// Insert an ASIN for monitoring. Returns false if it was already tracked.
    pub async fn insert_tracked(
        &self,
        asin: &str,
        check_interval_minutes: i64,
        priority: i64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tracked_asins (asin, check_interval_minutes, priority, active, created_at)
            VALUES (?, ?, ?, 1, ?)
            "#,
        )
        .bind(asin)
        .bind(check_interval_minutes)
        .bind(priority)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Seed the tracked set from config on boot; already-tracked ASINs are
    /// left untouched.
    pub async fn seed_asins(&self, asins: &[String], interval_minutes: i64, now: i64) -> Result<usize> {
        let mut inserted = 0usize;
        for asin in asins {
            if self.insert_tracked(asin, interval_minutes, 1, now).await? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!("Seeded {inserted} tracked ASIN(s) from config");
        }
        Ok(inserted)
    }

    /// Toggle monitoring. Rows are never deleted, only deactivated.
    pub async fn set_active(&self, asin: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE tracked_asins SET active = ? WHERE asin = ?")
            .bind(active as i64)
            .bind(asin)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn all_tracked(&self) -> Result<Vec<TrackedAsin>> {
        let rows = sqlx::query_as::<_, TrackedAsinRow>(
            r#"
            SELECT asin, title, check_interval_minutes, priority, active, created_at, last_checked_at
            FROM tracked_asins
            ORDER BY priority ASC, asin ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Active ASINs whose monitoring interval has elapsed, highest priority
    /// first. This is the due-selection the orchestrator's input contract
    /// assumes has already happened.
    pub async fn due_asins(&self, now: i64, limit: i64) -> Result<Vec<TrackedAsin>> {
        let rows = sqlx::query_as::<_, TrackedAsinRow>(
            r#"
            SELECT asin, title, check_interval_minutes, priority, active, created_at, last_checked_at
            FROM tracked_asins
            WHERE active = 1
              AND (last_checked_at IS NULL OR last_checked_at + check_interval_minutes * 60 <= ?)
            ORDER BY priority ASC, last_checked_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // -----------------------------------------------------------------------
    // Current-state projection
    // -----------------------------------------------------------------------

    /// Load the diff baseline for an ASIN: the projection row if present,
    /// otherwise rebuilt from the latest snapshot. None means first sight.
    pub async fn item_state(&self, asin: &str) -> Result<Option<ItemState>> {
        let row = sqlx::query_as::<_, CurrentStateRow>(
            r#"
            SELECT asin, badges, sales_ranks, category_names, title, monthly_sold, updated_at
            FROM current_state
            WHERE asin = ?
            "#,
        )
        .bind(asin)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => match state_from_row(&row) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    warn!(asin, "unreadable current_state row ({e}), rebuilding from latest snapshot");
                    self.rebuild_state_from_snapshot(asin).await
                }
            },
            None => self.rebuild_state_from_snapshot(asin).await,
        }
    }

    /// Re-derive the projection from the most recent snapshot. The snapshot
    /// history is the source of truth; the projection only exists so a run
    /// never rescans it.
    pub async fn rebuild_state_from_snapshot(&self, asin: &str) -> Result<Option<ItemState>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT id, asin, fetched_at, sales_ranks, category_names, monthly_sold, complete, raw_payload
            FROM snapshots
            WHERE asin = ?
            ORDER BY fetched_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(asin)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let snapshot = ProductSnapshot {
            asin: row.asin,
            title: None,
            fetched_at: row.fetched_at,
            sales_ranks: serde_json::from_str(&row.sales_ranks)?,
            category_names: serde_json::from_str(&row.category_names)?,
            monthly_sold: row.monthly_sold,
            complete: row.complete != 0,
            raw_payload: serde_json::Value::Null,
        };
        let badges = extract::extract(&snapshot);
        Ok(Some(ItemState::from_snapshot(&snapshot, badges)))
    }

    // -----------------------------------------------------------------------
    // Per-item run writes
    // -----------------------------------------------------------------------

    /// Persist one item's results in a single transaction: the new snapshot,
    /// the detected transitions (notification_sent = 0), the updated
    /// projection, and the last-checked stamp. Returns the transition row
    /// ids paired with their events for the dispatch step.
    pub async fn persist_item(
        &self,
        run_id: i64,
        snapshot: &ProductSnapshot,
        state: &ItemState,
        transitions: &[Transition],
    ) -> Result<Vec<(i64, Transition)>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (asin, fetched_at, sales_ranks, category_names, monthly_sold, complete, raw_payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.asin)
        .bind(snapshot.fetched_at)
        .bind(serde_json::to_string(&snapshot.sales_ranks)?)
        .bind(serde_json::to_string(&snapshot.category_names)?)
        .bind(snapshot.monthly_sold)
        .bind(snapshot.complete as i64)
        .bind(serde_json::to_string(&snapshot.raw_payload)?)
        .execute(&mut *tx)
        .await?;

        let mut inserted = Vec::with_capacity(transitions.len());
        for transition in transitions {
            let result = sqlx::query(
                r#"
                INSERT INTO transitions
                    (run_id, asin, category_id, category_name, kind, rank_before, rank_after, detected_at, notification_sent)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
                "#,
            )
            .bind(run_id)
            .bind(&transition.asin)
            .bind(&transition.category_id)
            .bind(&transition.category_name)
            .bind(transition.kind.as_str())
            .bind(transition.rank_before)
            .bind(transition.rank_after)
            .bind(transition.detected_at)
            .execute(&mut *tx)
            .await?;
            inserted.push((result.last_insert_rowid(), transition.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO current_state (asin, badges, sales_ranks, category_names, title, monthly_sold, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(asin) DO UPDATE SET
                badges = excluded.badges,
                sales_ranks = excluded.sales_ranks,
                category_names = excluded.category_names,
                title = excluded.title,
                monthly_sold = excluded.monthly_sold,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.asin)
        .bind(serde_json::to_string(&state.badges)?)
        .bind(serde_json::to_string(&state.sales_ranks)?)
        .bind(serde_json::to_string(&state.category_names)?)
        .bind(&state.title)
        .bind(state.monthly_sold)
        .bind(state.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tracked_asins SET last_checked_at = ?, title = COALESCE(?, title) WHERE asin = ?",
        )
        .bind(snapshot.fetched_at)
        .bind(&snapshot.title)
        .bind(&snapshot.asin)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    // -----------------------------------------------------------------------
    // Transitions / notification state
    // -----------------------------------------------------------------------

    /// Suppression check: has this transition already been acknowledged?
    pub async fn transition_sent(&self, id: i64) -> Result<bool> {
        let sent: Option<i64> =
            sqlx::query_scalar("SELECT notification_sent FROM transitions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(sent.unwrap_or(0) != 0)
    }

    /// Flip notification_sent false -> true. Called only after a positive
    /// acknowledgment from the delivery channel.
    pub async fn mark_transition_sent(&self, id: i64, at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE transitions SET notification_sent = 1, notified_at = ? WHERE id = ?",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transitions from earlier runs whose delivery never got acknowledged.
    /// Re-attempted at the start of each run so exhausted retries are not
    /// silently dropped.
    pub async fn unsent_transitions(&self, before_run: i64, limit: i64) -> Result<Vec<TransitionRow>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT id, run_id, asin, category_id, category_name, kind,
                   rank_before, rank_after, detected_at, notification_sent, notified_at
            FROM transitions
            WHERE notification_sent = 0 AND run_id < ?
            ORDER BY detected_at ASC
            LIMIT ?
            "#,
        )
        .bind(before_run)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Batch runs + cost ledger
    // -----------------------------------------------------------------------

    pub async fn create_run(&self, started_at: i64) -> Result<i64> {
        let result = sqlx::query("INSERT INTO batch_runs (started_at, status) VALUES (?, 'running')")
            .bind(started_at)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn finalize_run(&self, run_id: i64, summary: &RunSummary) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batch_runs SET
                completed_at = ?,
                items_attempted = ?,
                items_succeeded = ?,
                transitions_found = ?,
                notifications_sent = ?,
                tokens_consumed = ?,
                status = ?
            WHERE id = ?
            "#,
        )
        .bind(summary.completed_at)
        .bind(summary.items_attempted as i64)
        .bind(summary.items_succeeded as i64)
        .bind(summary.transitions_found as i64)
        .bind(summary.notifications_sent as i64)
        .bind(summary.tokens_consumed)
        .bind(summary.status.as_str())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_cost(&self, run_id: i64, usage: &FetchUsage, at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cost_ledger (run_id, recorded_at, asins_requested, tokens_consumed, tokens_left, response_time_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(at)
        .bind(usage.asins_requested as i64)
        .bind(usage.tokens_consumed)
        .bind(usage.tokens_left)
        .bind(usage.response_time_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_error(
        &self,
        run_id: i64,
        asin: Option<&str>,
        kind: &str,
        message: &str,
        at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_errors (run_id, asin, error_kind, message, occurred_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(asin)
        .bind(kind)
        .bind(message)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn state_from_row(row: &CurrentStateRow) -> Result<ItemState> {
    Ok(ItemState {
        asin: row.asin.clone(),
        badges: serde_json::from_str(&row.badges)?,
        sales_ranks: serde_json::from_str(&row.sales_ranks)?,
        category_names: serde_json::from_str(&row.category_names)?,
        title: row.title.clone(),
        monthly_sold: row.monthly_sold,
        updated_at: row.updated_at,
    })
}
