use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tracked ASIN
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedAsin {
    pub asin: String,
    pub title: Option<String>,
    pub check_interval_minutes: i64,
    /// 1 = highest. Due items are processed in priority order.
    pub priority: i64,
    pub active: bool,
    pub created_at: i64,
    pub last_checked_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Product snapshot — one fetched observation of one ASIN
// ---------------------------------------------------------------------------

/// Immutable observation parsed from one upstream product payload.
/// `sales_ranks` maps category id to the current rank in that category;
/// `complete` is false when the payload had no usable rank data, in which
/// case downstream diffing treats the fetch as a data gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub asin: String,
    pub title: Option<String>,
    pub fetched_at: i64,
    pub sales_ranks: BTreeMap<String, i64>,
    pub category_names: BTreeMap<String, String>,
    pub monthly_sold: Option<i64>,
    pub complete: bool,
    /// Raw upstream payload, retained verbatim for audit.
    pub raw_payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Badges
// ---------------------------------------------------------------------------

/// Rank #1 in one category. The set of these per ASIN is the badge state
/// the differ compares between observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub category_id: String,
    pub category_name: String,
    pub rank: i64,
}

/// Derived badge state, keyed by category id. BTreeMap keeps iteration in
/// ascending category order, which the differ relies on for determinism.
pub type BadgeSet = BTreeMap<String, Badge>;

/// Latest known state per ASIN — the diff baseline. Cached in memory and
/// persisted as the current_state row; rebuildable from the latest snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemState {
    pub asin: String,
    pub badges: BadgeSet,
    pub sales_ranks: BTreeMap<String, i64>,
    pub category_names: BTreeMap<String, String>,
    pub title: Option<String>,
    pub monthly_sold: Option<i64>,
    pub updated_at: i64,
}

impl ItemState {
    pub fn from_snapshot(snapshot: &ProductSnapshot, badges: BadgeSet) -> Self {
        Self {
            asin: snapshot.asin.clone(),
            badges,
            sales_ranks: snapshot.sales_ranks.clone(),
            category_names: snapshot.category_names.clone(),
            title: snapshot.title.clone(),
            monthly_sold: snapshot.monthly_sold,
            updated_at: snapshot.fetched_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Gained,
    Lost,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Gained => "gained",
            TransitionKind::Lost => "lost",
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A detected badge gain or loss in one category. Created only by the
/// differ; the persisted row additionally carries the run id and the
/// notification-sent flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub asin: String,
    pub category_id: String,
    pub category_name: String,
    pub kind: TransitionKind,
    /// None for a gain from an untracked category (first sight).
    pub rank_before: Option<i64>,
    /// None for a loss where the category dropped out of the response.
    pub rank_after: Option<i64>,
    pub detected_at: i64,
}

// ---------------------------------------------------------------------------
// Batch runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every attempted item succeeded.
    Completed,
    /// At least one group or item failed; the run still finished.
    CompletedWithErrors,
    /// The fetch stage could not run at all (bad credentials/config).
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Fetch usage — cost reported by the upstream product API per call
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FetchUsage {
    pub asins_requested: usize,
    pub tokens_consumed: i64,
    pub tokens_left: Option<i64>,
    pub response_time_ms: i64,
}

// ---------------------------------------------------------------------------
// Notification delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    /// Positive acknowledgment received; the event is now marked sent.
    Sent,
    /// Already marked sent — no external call performed.
    Suppressed,
    /// Retries exhausted; the event stays unsent for a later attempt.
    Failed,
}

impl std::fmt::Display for DeliveryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryResult::Sent => "sent",
            DeliveryResult::Suppressed => "suppressed",
            DeliveryResult::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
