mod api;
mod badge;
mod batch;
mod config;
mod db;
mod error;
mod keepa;
mod ledger;
mod notify;
mod retry;
mod scheduler;
mod state;
mod store;
mod types;

use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState};
use crate::batch::BatchRunner;
use crate::config::Config;
use crate::error::Result;
use crate::keepa::{KeepaClient, ProductSource};
use crate::notify::{DeliveryChannel, Dispatcher, SlackChannel};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::state::ProjectionCache;
use crate::store::TrackerStore;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", cfg.db_path))?
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    let store = TrackerStore::new(pool);

    // --- Seed tracked ASINs from env on first boot ---
    let seeded = store
        .seed_asins(&cfg.seed_asins, cfg.check_interval_minutes as i64, now_secs())
        .await?;
    let tracked = store.all_tracked().await?;
    info!("Tracking {} ASIN(s) ({seeded} newly seeded)", tracked.len());
    if tracked.is_empty() {
        warn!("No tracked ASINs — set TRACKED_ASINS or POST /asins to add some");
    }

    // --- Wiring: source, channel, dispatcher, runner, scheduler ---
    let source: Arc<dyn ProductSource> = Arc::new(KeepaClient::new(&cfg)?);
    let channel: Arc<dyn DeliveryChannel> = Arc::new(SlackChannel::new(&cfg)?);
    let policy = RetryPolicy::from_config(&cfg);
    let dispatcher = Arc::new(Dispatcher::new(channel, store.clone(), policy));
    let cache = ProjectionCache::new();
    let runner = Arc::new(BatchRunner::new(
        source,
        Arc::clone(&dispatcher),
        store.clone(),
        Arc::clone(&cache),
        policy,
        cfg.batch_group_size,
    ));
    let health = Arc::new(HealthState::new());

    let scheduler = Arc::new(Scheduler::new(
        cfg.clone(),
        store.clone(),
        runner,
        dispatcher,
        Arc::clone(&health),
    ));
    tokio::spawn(Arc::clone(&scheduler).run());

    // --- HTTP API server ---
    let api_state = ApiState { store, health, scheduler, cache };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
