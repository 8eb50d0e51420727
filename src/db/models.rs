//! Database row types used by sqlx `query_as`. SQLite has no boolean
//! column type, so flags come back as integers and are converted at the
//! domain boundary.

use crate::types::{TrackedAsin, Transition, TransitionKind};

#[derive(Debug, sqlx::FromRow)]
pub struct TrackedAsinRow {
    pub asin: String,
    pub title: Option<String>,
    pub check_interval_minutes: i64,
    pub priority: i64,
    pub active: i64,
    pub created_at: i64,
    pub last_checked_at: Option<i64>,
}

impl From<TrackedAsinRow> for TrackedAsin {
    fn from(row: TrackedAsinRow) -> Self {
        TrackedAsin {
            asin: row.asin,
            title: row.title,
            check_interval_minutes: row.check_interval_minutes,
            priority: row.priority,
            active: row.active != 0,
            created_at: row.created_at,
            last_checked_at: row.last_checked_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct CurrentStateRow {
    pub asin: String,
    pub badges: String,
    pub sales_ranks: String,
    pub category_names: String,
    pub title: Option<String>,
    pub monthly_sold: Option<i64>,
    pub updated_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct SnapshotRow {
    pub id: i64,
    pub asin: String,
    pub fetched_at: i64,
    pub sales_ranks: String,
    pub category_names: String,
    pub monthly_sold: Option<i64>,
    pub complete: i64,
    pub raw_payload: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransitionRow {
    pub id: i64,
    pub run_id: i64,
    pub asin: String,
    pub category_id: String,
    pub category_name: String,
    pub kind: String,
    pub rank_before: Option<i64>,
    pub rank_after: Option<i64>,
    pub detected_at: i64,
    pub notification_sent: i64,
    pub notified_at: Option<i64>,
}

impl TransitionRow {
    /// Back to the domain event; rows written by this process always carry
    /// a valid kind, anything else is treated as lost (the cautious read).
    pub fn to_transition(&self) -> Transition {
        let kind = match self.kind.as_str() {
            "gained" => TransitionKind::Gained,
            _ => TransitionKind::Lost,
        };
        Transition {
            asin: self.asin.clone(),
            category_id: self.category_id.clone(),
            category_name: self.category_name.clone(),
            kind,
            rank_before: self.rank_before,
            rank_after: self.rank_after,
            detected_at: self.detected_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct BatchRunRow {
    pub id: i64,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub items_attempted: i64,
    pub items_succeeded: i64,
    pub transitions_found: i64,
    pub notifications_sent: i64,
    pub tokens_consumed: i64,
    pub status: String,
}
