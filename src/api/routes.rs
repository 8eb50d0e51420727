use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::db::models::{BatchRunRow, TransitionRow};
use crate::error::AppError;
use crate::ledger::estimate_cost_cents;
use crate::scheduler::Scheduler;
use crate::state::ProjectionCache;
use crate::store::TrackerStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: TrackerStore,
    pub health: Arc<HealthState>,
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<ProjectionCache>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/asins", get(get_asins).post(post_asin))
        .route("/asins/:asin/transitions", get(get_asin_transitions))
        .route("/transitions/recent", get(get_recent_transitions))
        .route("/runs/recent", get(get_recent_runs))
        .route("/runs/trigger", post(trigger_run))
        .route("/stats/summary", get(get_stats_summary))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query/body param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct TransitionsQuery {
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct AsinCreate {
    pub asin: String,
    pub check_interval_minutes: Option<i64>,
    pub priority: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scheduler_running: bool,
    pub last_run_at: Option<i64>,
    pub runs_completed: u64,
    pub active_asins: i64,
    /// Items warmed into the in-memory projection since boot.
    pub cached_items: usize,
    pub cached_badges: usize,
}

#[derive(Serialize)]
pub struct AsinResponse {
    pub asin: String,
    pub title: Option<String>,
    pub check_interval_minutes: i64,
    pub priority: i64,
    pub active: bool,
    pub last_checked_at: Option<i64>,
    pub badge_count: i64,
}

#[derive(Serialize)]
pub struct TransitionResponse {
    pub id: i64,
    pub run_id: i64,
    pub asin: String,
    pub category_id: String,
    pub category_name: String,
    pub kind: String,
    pub rank_before: Option<i64>,
    pub rank_after: Option<i64>,
    pub detected_at: i64,
    pub notification_sent: bool,
}

impl From<TransitionRow> for TransitionResponse {
    fn from(r: TransitionRow) -> Self {
        Self {
            id: r.id,
            run_id: r.run_id,
            asin: r.asin,
            category_id: r.category_id,
            category_name: r.category_name,
            kind: r.kind,
            rank_before: r.rank_before,
            rank_after: r.rank_after,
            detected_at: r.detected_at,
            notification_sent: r.notification_sent != 0,
        }
    }
}

#[derive(Serialize)]
pub struct RunResponse {
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

impl From<BatchRunRow> for RunResponse {
    fn from(r: BatchRunRow) -> Self {
        Self {
            id: r.id,
            started_at: r.started_at,
            completed_at: r.completed_at,
            items_attempted: r.items_attempted,
            items_succeeded: r.items_succeeded,
            transitions_found: r.transitions_found,
            notifications_sent: r.notifications_sent,
            tokens_consumed: r.tokens_consumed,
            status: r.status,
        }
    }
}

#[derive(Serialize)]
pub struct SummaryResponse {
    pub active_asins: i64,
    pub total_badges: i64,
    pub gained_today: i64,
    pub lost_today: i64,
    pub tokens_today: i64,
    pub estimated_cost_today_cents: i64,
}

#[derive(Serialize)]
pub struct TriggerResponse {
    pub triggered: bool,
    pub run_id: Option<i64>,
    pub items_attempted: usize,
    pub transitions_found: usize,
    pub notifications_sent: usize,
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let active_asins: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tracked_asins WHERE active = 1")
            .fetch_one(state.store.pool())
            .await?;

    let last_run_at = state.health.last_run_at();
    Ok(Json(HealthResponse {
        status: "healthy",
        scheduler_running: state.health.scheduler_running(),
        last_run_at: (last_run_at > 0).then_some(last_run_at),
        runs_completed: state.health.runs_completed(),
        active_asins,
        cached_items: state.cache.len(),
        cached_badges: state.cache.badge_count(),
    }))
}

async fn get_asins(State(state): State<ApiState>) -> Result<Json<Vec<AsinResponse>>, AppError> {
    #[derive(sqlx::FromRow)]
    struct Row {
        asin: String,
        title: Option<String>,
        check_interval_minutes: i64,
        priority: i64,
        active: i64,
        last_checked_at: Option<i64>,
        badges: Option<String>,
    }

    let rows = sqlx::query_as::<_, Row>(
        r#"
        SELECT t.asin, COALESCE(t.title, s.title) AS title, t.check_interval_minutes,
               t.priority, t.active, t.last_checked_at, s.badges
        FROM tracked_asins t
        LEFT JOIN current_state s ON t.asin = s.asin
        ORDER BY t.priority ASC, t.asin ASC
        "#,
    )
    .fetch_all(state.store.pool())
    .await?;

    let asins = rows
        .into_iter()
        .map(|r| {
            let badge_count = r
                .badges
                .as_deref()
                .and_then(|b| serde_json::from_str::<serde_json::Value>(b).ok())
                .and_then(|v| v.as_object().map(|o| o.len() as i64))
                .unwrap_or(0);
            AsinResponse {
                asin: r.asin,
                title: r.title,
                check_interval_minutes: r.check_interval_minutes,
                priority: r.priority,
                active: r.active != 0,
                last_checked_at: r.last_checked_at,
                badge_count,
            }
        })
        .collect();

    Ok(Json(asins))
}

async fn post_asin(
    State(state): State<ApiState>,
    Json(body): Json<AsinCreate>,
) -> Result<Json<serde_json::Value>, AppError> {
    let asin = body.asin.trim().to_uppercase();
    if asin.len() != 10 || !asin.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::FetchData(format!(
            "'{asin}' is not a valid ASIN (10 alphanumeric characters)"
        )));
    }

    let created = state
        .store
        .insert_tracked(
            &asin,
            body.check_interval_minutes.unwrap_or(60),
            body.priority.unwrap_or(1),
            now_secs(),
        )
        .await?;

    Ok(Json(serde_json::json!({ "asin": asin, "created": created })))
}

async fn get_asin_transitions(
    State(state): State<ApiState>,
    Path(asin): Path<String>,
    Query(params): Query<TransitionsQuery>,
) -> Result<Json<Vec<TransitionResponse>>, AppError> {
    let limit = params.limit.unwrap_or(100);

    let rows = sqlx::query_as::<_, TransitionRow>(
        r#"
        SELECT id, run_id, asin, category_id, category_name, kind,
               rank_before, rank_after, detected_at, notification_sent, notified_at
        FROM transitions
        WHERE asin = ?
        ORDER BY detected_at DESC
        LIMIT ?
        "#,
    )
    .bind(asin.to_uppercase())
    .bind(limit)
    .fetch_all(state.store.pool())
    .await?;

    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn get_recent_transitions(
    State(state): State<ApiState>,
    Query(params): Query<TransitionsQuery>,
) -> Result<Json<Vec<TransitionResponse>>, AppError> {
    let limit = params.limit.unwrap_or(50);
    let kind_filter = params.kind.unwrap_or_default();

    let rows = sqlx::query_as::<_, TransitionRow>(
        r#"
        SELECT id, run_id, asin, category_id, category_name, kind,
               rank_before, rank_after, detected_at, notification_sent, notified_at
        FROM transitions
        WHERE (? = '' OR kind = ?)
        ORDER BY detected_at DESC
        LIMIT ?
        "#,
    )
    .bind(&kind_filter)
    .bind(&kind_filter)
    .bind(limit)
    .fetch_all(state.store.pool())
    .await?;

    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn get_recent_runs(
    State(state): State<ApiState>,
    Query(params): Query<RunsQuery>,
) -> Result<Json<Vec<RunResponse>>, AppError> {
    let limit = params.limit.unwrap_or(20);

    let rows = sqlx::query_as::<_, BatchRunRow>(
        r#"
        SELECT id, started_at, completed_at, items_attempted, items_succeeded,
               transitions_found, notifications_sent, tokens_consumed, status
        FROM batch_runs
        ORDER BY started_at DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(state.store.pool())
    .await?;

    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Kick off a batch outside the schedule. Runs inline; returns once the
/// run has finalized. A config failure surfaces as 503.
async fn trigger_run(State(state): State<ApiState>) -> Result<Json<TriggerResponse>, AppError> {
    match state.scheduler.run_once().await? {
        Some(summary) => Ok(Json(TriggerResponse {
            triggered: true,
            run_id: Some(summary.run_id),
            items_attempted: summary.items_attempted,
            transitions_found: summary.transitions_found,
            notifications_sent: summary.notifications_sent,
            status: Some(summary.status.to_string()),
        })),
        None => Ok(Json(TriggerResponse {
            triggered: false,
            run_id: None,
            items_attempted: 0,
            transitions_found: 0,
            notifications_sent: 0,
            status: None,
        })),
    }
}

async fn get_stats_summary(
    State(state): State<ApiState>,
) -> Result<Json<SummaryResponse>, AppError> {
    let pool = state.store.pool();
    let day_ago = now_secs() - 24 * 3_600;

    let active_asins: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tracked_asins WHERE active = 1")
            .fetch_one(pool)
            .await?;

    let gained_today: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transitions WHERE kind = 'gained' AND detected_at > ?",
    )
    .bind(day_ago)
    .fetch_one(pool)
    .await?;

    let lost_today: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transitions WHERE kind = 'lost' AND detected_at > ?",
    )
    .bind(day_ago)
    .fetch_one(pool)
    .await?;

    let tokens_today: Option<i64> = sqlx::query_scalar(
        "SELECT SUM(tokens_consumed) FROM cost_ledger WHERE recorded_at > ?",
    )
    .bind(day_ago)
    .fetch_one(pool)
    .await?;
    let tokens_today = tokens_today.unwrap_or(0);

    // Badge totals come from the persisted projection, not the in-memory
    // cache, so the number is right even before the first run warms it.
    let badge_rows: Vec<String> = sqlx::query_scalar("SELECT badges FROM current_state")
        .fetch_all(pool)
        .await?;
    let total_badges: i64 = badge_rows
        .iter()
        .filter_map(|b| serde_json::from_str::<serde_json::Value>(b).ok())
        .filter_map(|v| v.as_object().map(|o| o.len() as i64))
        .sum();

    Ok(Json(SummaryResponse {
        active_asins,
        total_badges,
        gained_today,
        lost_today,
        tokens_today,
        estimated_cost_today_cents: estimate_cost_cents(tokens_today),
    }))
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
