// =============================================================================
// Synthetic OTC Market Core — Main Entry Point
// =============================================================================
//
// Wires together the price generators (one tick worker per enabled synthetic
// symbol), the real-feed adapter, the settlement dispatcher, the REST/WS API,
// and the persistence gateway. Crash recovery runs once at startup, before
// any tick worker or the dispatcher task begins, so a position that expired
// while the process was down settles against the real feed rather than
// sitting open forever.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod admin;
mod api;
mod app_state;
mod bus;
mod error;
mod exposure;
mod feed_adapter;
mod persistence;
mod positions;
mod price_generator;
mod risk_policy;
mod runtime_config;
mod scheduler;
mod settlement;
mod types;
mod wallet;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, ProcessConfig};
use crate::feed_adapter::{FeedAdapter, HttpRealPriceFetcher};
use crate::persistence::sqlite::SqlitePersistence;
use crate::persistence::PersistenceGateway;
use crate::price_generator::PriceState;
use crate::runtime_config::SymbolCatalogFile;
use crate::types::SymbolConfig;

/// Concrete application state handle threaded through every Axum handler and
/// background task. A type alias rather than a second generic parameter
/// everywhere a `PersistenceGateway` is needed — this binary only ever runs
/// against sqlite.
pub type CoreState = Arc<AppState<SqlitePersistence>>;

/// Real feed considered stale (and the symbol forced into SYNTHETIC,
/// spec.md §7) once its last observation is older than this.
const FEED_STALE_THRESHOLD: Duration = Duration::from_secs(60);

/// Target tick cadence for each synthetic symbol's generator (~10Hz,
/// spec.md §4.B).
const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("synthetic OTC market core starting up");

    let process_config = ProcessConfig::from_env();
    let catalog = SymbolCatalogFile::load_or_bootstrap(ProcessConfig::symbol_catalog_path())
        .context("failed to load symbol catalog")?;

    let persistence = Arc::new(SqlitePersistence::open(&process_config.db_path).context("failed to open sqlite database")?);

    // Persisted symbol configs, if any, take precedence over the bootstrap
    // catalog file — the database is authoritative once it has rows.
    let persisted_configs = persistence.load_symbol_configs().await.unwrap_or_default();
    let symbol_configs: Vec<SymbolConfig> = if persisted_configs.is_empty() {
        for cfg in &catalog.symbols {
            if let Err(err) = persistence.upsert_symbol_config(cfg).await {
                warn!(symbol = %cfg.symbol, error = %err, "failed to seed symbol config into database");
            }
        }
        catalog.symbols
    } else {
        persisted_configs
    };

    for cfg in &symbol_configs {
        if let Err(msg) = cfg.validate() {
            error!(symbol = %cfg.symbol, error = %msg, "symbol config failed validation, refusing to start");
            anyhow::bail!("invalid symbol config for {}: {msg}", cfg.symbol);
        }
    }
    info!(count = symbol_configs.len(), "symbol catalog loaded");

    let fetcher = HttpRealPriceFetcher::new(process_config.real_feed_base_url.clone())?;
    let feed = Arc::new(FeedAdapter::new(Arc::new(fetcher)));

    let (schedule_tx, schedule_rx) = settlement::channel();

    let state: CoreState = Arc::new(AppState::new(process_config, symbol_configs.clone(), persistence, feed.clone(), schedule_tx));

    // ── Crash recovery ───────────────────────────────────────────────────
    state.recover_on_startup().await;

    // ── Settlement dispatcher ────────────────────────────────────────────
    {
        let sink = state.clone();
        tokio::spawn(settlement::run_dispatcher(schedule_rx, sink));
    }

    // ── Admin overlay sweep (spec.md §4.G, >= 1 min cadence) ─────────────
    {
        let admin = state.admin.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let dropped = admin.sweep_expired(chrono::Utc::now());
                if dropped > 0 {
                    info!(dropped, "swept expired admin overlays");
                }
            }
        });
    }

    // ── Real-feed push subscriber (optional) ─────────────────────────────
    if let Some(ws_url) = state.process_config.real_feed_ws_url.clone() {
        let feed = feed.clone();
        tokio::spawn(feed_adapter::run_push_subscriber(feed, ws_url));
    }

    // ── Real-feed polling fallback, one per distinct base symbol ─────────
    let mut seen_bases = std::collections::HashSet::new();
    for cfg in &symbol_configs {
        if seen_bases.insert(cfg.base.clone()) {
            let feed = feed.clone();
            let base = cfg.base.clone();
            tokio::spawn(feed.run_polling_fallback(base, FEED_STALE_THRESHOLD));
        }
    }

    // ── Tick workers, one per enabled synthetic symbol ───────────────────
    for cfg in symbol_configs.iter().filter(|c| c.enabled).cloned() {
        let state = state.clone();
        let feed = feed.clone();
        tokio::spawn(async move {
            run_tick_worker(state, feed, cfg).await;
        });
    }

    // ── REST + WebSocket server ───────────────────────────────────────────
    let bind_addr = state.process_config.listen_addr.clone();
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "API server exited with error");
        }
    });

    info!("all subsystems running, press ctrl+c to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");
    server.abort();

    info!("synthetic OTC market core shut down complete");
    Ok(())
}

/// Drive one synthetic symbol's price generator forever at roughly
/// `TICK_INTERVAL` cadence, publishing each tick and re-checking feed health
/// on every cycle. Runs for the lifetime of the process; there is no
/// mechanism to stop an individual worker short of process shutdown —
/// disabling a symbol via `register_symbol` only stops new trades, existing
/// workers keep publishing so open positions still have a price to settle
/// against.
async fn run_tick_worker(state: CoreState, feed: Arc<FeedAdapter>, cfg: SymbolConfig) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    // Block until the real feed has reported at least one price for this
    // symbol's base, so the generator never has to invent an initial anchor.
    let initial_real = loop {
        let now = chrono::Utc::now();
        if let Some((price, _)) = feed.current_price(&cfg.base, now) {
            break price;
        }
        ticker.tick().await;
    };

    let mut generator = PriceState::new(cfg.market_kind, initial_real, cfg.baseline_vol, chrono::Utc::now());

    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();

        let Some(current_cfg) = state.symbol_config(&cfg.symbol) else {
            // Symbol was removed from the catalog entirely; stop publishing.
            warn!(symbol = %cfg.symbol, "symbol config disappeared, tick worker exiting");
            return;
        };

        let (last_real, feed_healthy) = match feed.current_price(&current_cfg.base, now) {
            Some((price, age)) => (price, age.to_std().unwrap_or(Duration::MAX) < FEED_STALE_THRESHOLD),
            None => (initial_real, false),
        };

        let overlay = state.admin.overlay(&current_cfg.symbol);
        let tick = generator.tick(&current_cfg, &overlay, now, last_real, feed_healthy, &mut rng);
        state.publish_tick(tick).await;
    }
}
