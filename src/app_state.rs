// =============================================================================
// Central Application State — synthetic OTC market core
// =============================================================================
//
// The single source of truth tying every subsystem together. Each subsystem
// owns its own interior mutability (an `RwLock`/`Mutex` scoped to exactly the
// data it needs); `AppState` itself only adds the version counter used to
// let WebSocket and REST callers detect "has anything changed" cheaply.
//
// Thread safety:
//   - `AtomicU64` for lock-free version tracking.
//   - `parking_lot::RwLock`/`Mutex` for shared mutable collections.
//   - `Arc` wrappers around subsystem engines that manage their own interior
//     mutability, so cloning a handle out of `AppState` is always cheap.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::admin::AdminControlPlane;
use crate::bus::{Bus, SettlementEvent};
use crate::exposure::{Exposure, ExposureBook};
use crate::feed_adapter::FeedAdapter;
use crate::persistence::PersistenceGateway;
use crate::positions::PositionBook;
use crate::price_generator::{Tick, TickCell};
use crate::risk_policy;
use crate::settlement::{self, ScheduleSender, SettlementSink};
use crate::types::{ActivityLogEntry, SettlementResult, SymbolConfig};
use crate::wallet::WalletLedger;

const MAX_RECENT_ACTIVITY: usize = 200;

/// Process-level configuration: things that come from the environment at
/// startup rather than from the hot-reloadable symbol catalog.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub listen_addr: String,
    pub db_path: String,
    pub real_feed_base_url: String,
    /// Optional websocket endpoint pushing `{base, price}` updates for the
    /// real feed. When unset, the adapter relies solely on the 2s polling
    /// fallback (spec.md §4.C still requires the poll regardless).
    pub real_feed_ws_url: Option<String>,
}

/// Central application state shared across all async tasks via
/// `Arc<AppState<P>>`. `P` is the persistence gateway implementation;
/// generic rather than `dyn` since `PersistenceGateway`'s async methods are
/// not object-safe.
pub struct AppState<P: PersistenceGateway> {
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub process_config: ProcessConfig,
    pub symbol_configs: RwLock<HashMap<String, SymbolConfig>>,
    pub tick_cells: RwLock<HashMap<String, Arc<TickCell>>>,

    pub exposure: Arc<ExposureBook>,
    pub admin: Arc<AdminControlPlane>,
    pub positions: Arc<PositionBook>,
    pub wallet: Arc<WalletLedger>,
    pub bus: Arc<Bus>,
    pub feed: Arc<FeedAdapter>,
    pub persistence: Arc<P>,

    pub schedule_tx: ScheduleSender,
    pub recent_activity: RwLock<Vec<ActivityLogEntry>>,

    pub start_time: std::time::Instant,
}

impl<P: PersistenceGateway> AppState<P> {
    pub fn new(
        process_config: ProcessConfig,
        symbol_configs: Vec<SymbolConfig>,
        persistence: Arc<P>,
        feed: Arc<FeedAdapter>,
        schedule_tx: ScheduleSender,
    ) -> Self {
        let mut configs = HashMap::new();
        let mut cells = HashMap::new();
        for cfg in symbol_configs {
            cells.insert(cfg.symbol.clone(), crate::price_generator::new_tick_cell());
            configs.insert(cfg.symbol.clone(), cfg);
        }

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),

            process_config,
            symbol_configs: RwLock::new(configs),
            tick_cells: RwLock::new(cells),

            exposure: Arc::new(ExposureBook::new()),
            admin: Arc::new(AdminControlPlane::new()),
            positions: Arc::new(PositionBook::new()),
            wallet: Arc::new(WalletLedger::new()),
            bus: Arc::new(Bus::new()),
            feed,
            persistence,

            schedule_tx,
            recent_activity: RwLock::new(Vec::new()),

            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn symbol_config(&self, symbol: &str) -> Option<SymbolConfig> {
        self.symbol_configs.read().get(symbol).cloned()
    }

    pub fn all_symbol_configs(&self) -> Vec<SymbolConfig> {
        self.symbol_configs.read().values().cloned().collect()
    }

    pub fn tick_cell(&self, symbol: &str) -> Option<Arc<TickCell>> {
        self.tick_cells.read().get(symbol).cloned()
    }

    pub fn register_symbol(&self, cfg: SymbolConfig) {
        self.tick_cells.write().entry(cfg.symbol.clone()).or_insert_with(crate::price_generator::new_tick_cell);
        self.symbol_configs.write().insert(cfg.symbol.clone(), cfg);
        self.increment_version();
    }

    /// Publish a freshly generated tick: update its lock-free cell, fan it
    /// out over the bus, and persist it for price-history queries. The
    /// persistence write is best-effort (logged, never fatal to the tick
    /// worker) since the in-memory cell and bus are already authoritative
    /// for every live reader.
    pub async fn publish_tick(&self, tick: Tick) {
        if let Some(cell) = self.tick_cell(&tick.symbol) {
            cell.store(Arc::new(Some(tick.clone())));
        }
        self.bus.publish_tick(tick.clone());
        if let Err(err) = self.persistence.record_tick(&tick).await {
            warn!(symbol = %tick.symbol, error = %err, "failed to persist tick");
        }
    }

    /// Append an entry to the operator activity log, both in the in-memory
    /// ring buffer (for fast reads) and to durable storage (best-effort).
    pub async fn log_activity(&self, entry: ActivityLogEntry) {
        {
            let mut log = self.recent_activity.write();
            log.push(entry.clone());
            while log.len() > MAX_RECENT_ACTIVITY {
                log.remove(0);
            }
        }
        if let Err(err) = self.persistence.append_activity_log(&entry).await {
            warn!(error = %err, "failed to persist activity log entry");
        }
        self.increment_version();
    }

    pub fn recent_activity(&self, limit: usize) -> Vec<ActivityLogEntry> {
        let log = self.recent_activity.read();
        log.iter().rev().take(limit).cloned().collect()
    }

    /// Settle one position: look it up, run the risk policy against its
    /// current exposure, apply the wallet payout, release its exposure, and
    /// record the outcome. No-ops (with a warning) if the position is
    /// already gone — the dispatcher and the crash-recovery scan may both
    /// try to settle the same stale entry.
    pub async fn settle_position(&self, position_id: Uuid) {
        let Some(position) = self.positions.get(position_id) else {
            warn!(%position_id, "settle_due called for unknown position");
            return;
        };
        if position.status != crate::positions::PositionStatus::Open {
            return;
        }

        let now = Utc::now();
        let Some(cfg) = self.symbol_config(&position.symbol) else {
            error!(symbol = %position.symbol, "settling position for unknown symbol, voiding");
            self.finalize_settlement(position_id, position.entry_price, SettlementResult::Void, 0.0, now).await;
            return;
        };

        // spec.md §4.F step 2: the most recent stored tick stands in for a
        // live read, but only if it isn't more than 5s older than now — a
        // tick worker that has stalled longer than that is treated the same
        // as no price being available at all.
        let latest_tick = self.tick_cell(&position.symbol).and_then(|cell| cell.load_full().as_ref().clone());
        let exit_price = latest_tick.as_ref().filter(|t| (now - t.timestamp) <= chrono::Duration::seconds(5)).map(|t| t.price);
        let Some(exit_price) = exit_price else {
            error!(symbol = %position.symbol, %position_id, "no fresh price available at settlement, voiding position");
            self.finalize_settlement(position_id, position.entry_price, SettlementResult::Void, position.stake, now).await;
            return;
        };

        let overlay = self.admin.overlay(&position.symbol);
        let exposure = self.exposure.snapshot(&position.symbol);

        let forced = if position.account_kind == crate::types::AccountKind::Real {
            if self.admin.consume_forced_win(&position.user_id) {
                Some(SettlementResult::Won)
            } else if self.admin.consume_forced_loss(&position.user_id) {
                Some(SettlementResult::Lost)
            } else {
                None
            }
        } else {
            None
        };

        let mut rng = rand::thread_rng();
        let decision = risk_policy::decide(
            &cfg,
            &overlay,
            exposure,
            position.account_kind,
            forced,
            position.direction,
            position.entry_price,
            exit_price,
            now,
            &mut rng,
        );

        // Only a genuine risk-policy nudge counts toward the per-symbol
        // intervention tally (spec.md §3) — a forced outcome bypasses the
        // policy entirely and never touches it.
        if decision.intervened && forced.is_none() {
            self.exposure.record_intervention(&position.symbol);
        }

        let payout = match decision.result {
            SettlementResult::Won => position.win_payout(),
            SettlementResult::Void => position.stake,
            SettlementResult::Lost => 0.0,
        };
        if payout > 0.0 {
            self.wallet.credit(&position.user_id, position.account_kind, payout);
            let wallet = self.wallet.wallet_of(&position.user_id, position.account_kind);
            if let Err(err) = self.persistence.save_wallet(&wallet).await {
                warn!(user_id = %position.user_id, error = %err, "failed to persist wallet after settlement credit");
            }
        }
        if position.account_kind == crate::types::AccountKind::Real {
            self.exposure.close_position(&position.symbol, position.direction, position.stake);
            let snapshot = self.exposure.snapshot(&position.symbol);
            if let Err(err) = self.persistence.upsert_exposure(&position.symbol, snapshot).await {
                warn!(symbol = %position.symbol, error = %err, "failed to persist exposure after close");
            }
        }

        self.finalize_settlement(position_id, decision.exit_price, decision.result, payout, now).await;
    }

    async fn finalize_settlement(&self, position_id: Uuid, exit_price: f64, result: SettlementResult, payout: f64, now: chrono::DateTime<Utc>) {
        let settled = match self.positions.settle(position_id, exit_price, result, payout, now) {
            Ok(p) => p,
            Err(err) => {
                warn!(%position_id, error = %err, "position already settled, skipping");
                return;
            }
        };
        if let Err(err) = self.persistence.settle_position(&settled).await {
            warn!(%position_id, error = %err, "failed to persist settlement");
        }
        self.bus.publish_settlement(SettlementEvent {
            position_id: settled.id,
            symbol: settled.symbol.clone(),
            user_id: settled.user_id.clone(),
            result,
            exit_price,
            payout,
            settled_at: now,
        });
        self.increment_version();
    }

    pub fn open_position(&self, position: &crate::positions::Position) {
        if position.account_kind == crate::types::AccountKind::Real {
            self.exposure.open_position(&position.symbol, position.direction, position.stake);
        }
    }

    /// Validate and place a new trade: debits the wallet, records the
    /// position, opens its exposure, and schedules its settlement. If
    /// persistence ultimately fails (after the gateway's own retries), the
    /// wallet debit is rolled back synchronously and no position is left
    /// behind, per spec.md §7's persistence-failure rollback requirement.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_trade(
        &self,
        user_id: &str,
        symbol: &str,
        direction: crate::types::Direction,
        stake: f64,
        duration: chrono::Duration,
        account_kind: crate::types::AccountKind,
    ) -> crate::error::CoreResult<crate::positions::Position> {
        use crate::error::CoreError;

        let cfg = self
            .symbol_config(symbol)
            .ok_or_else(|| CoreError::validation(format!("unknown symbol {symbol}")))?;
        if !cfg.enabled {
            return Err(CoreError::validation(format!("symbol {symbol} is disabled")));
        }
        if stake < cfg.trade_bounds.min || stake > cfg.trade_bounds.max {
            return Err(CoreError::validation(format!(
                "stake {stake} outside bounds [{}, {}]",
                cfg.trade_bounds.min, cfg.trade_bounds.max
            )));
        }
        if duration < chrono::Duration::seconds(5) || duration > chrono::Duration::hours(1) {
            return Err(CoreError::validation("duration must be between 5s and 1h"));
        }

        let entry_price = self
            .tick_cell(symbol)
            .and_then(|cell| cell.load_full().as_ref().clone())
            .map(|t| t.price)
            .ok_or_else(|| CoreError::validation(format!("no price available yet for {symbol}")))?;

        self.wallet.debit(user_id, account_kind, stake)?;
        {
            let wallet = self.wallet.wallet_of(user_id, account_kind);
            if let Err(err) = self.persistence.save_wallet(&wallet).await {
                warn!(user_id, error = %err, "failed to persist wallet after trade debit");
            }
        }

        let now = Utc::now();
        let position = crate::positions::Position::open(
            user_id,
            symbol,
            direction,
            account_kind,
            stake,
            cfg.payout_percent,
            entry_price,
            now,
            now + duration,
        );

        if let Err(err) = self.persistence.insert_open_position(&position).await {
            // Roll back the debit: the in-memory mutation must not outlive
            // the persistence failure that invalidates it.
            self.wallet.credit(user_id, account_kind, stake);
            let wallet = self.wallet.wallet_of(user_id, account_kind);
            if let Err(save_err) = self.persistence.save_wallet(&wallet).await {
                warn!(user_id, error = %save_err, "failed to persist wallet after rollback");
            }
            return Err(CoreError::persistence(format!("failed to persist new position: {err}")));
        }

        self.open_position(&position);
        if account_kind == crate::types::AccountKind::Real {
            let snapshot = self.exposure.snapshot(symbol);
            if let Err(err) = self.persistence.upsert_exposure(symbol, snapshot).await {
                warn!(symbol, error = %err, "failed to persist exposure after open");
            }
        }
        self.positions.insert_open(position.clone());
        self.schedule_settlement(position.id, position.expires_at);

        self.log_activity(
            crate::types::ActivityLogEntry::new(
                "trade",
                format!("{user_id} placed {direction} {stake} on {symbol}"),
                Some(user_id.to_string()),
            )
            .with_metadata(serde_json::json!({
                "position_id": position.id,
                "symbol": symbol,
                "direction": direction,
                "stake": stake,
                "account_kind": account_kind,
            })),
        )
        .await;

        Ok(position)
    }

    /// Schedule a newly opened position's expiry with the settlement
    /// dispatcher. Does not block on the dispatcher itself; the channel is
    /// unbounded and failures only happen once the dispatcher task is gone.
    pub fn schedule_settlement(&self, position_id: Uuid, expires_at: chrono::DateTime<Utc>) {
        if self.schedule_tx.send(settlement::ScheduleEntry { position_id, expires_at }).is_err() {
            error!(%position_id, "settlement dispatcher channel closed, position will never auto-settle");
        }
    }

    /// Recover any open positions left stale by a crash, settling them
    /// against the current price. Run once at startup before the
    /// dispatcher task and any tick workers begin.
    pub async fn recover_on_startup(self: &Arc<Self>)
    where
        Self: SettlementSink,
    {
        let stored = match self.persistence.load_open_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                error!(error = %err, "failed to load open positions at startup");
                return;
            }
        };
        let mut seen_wallets = std::collections::HashSet::new();
        for position in stored {
            if position.account_kind == crate::types::AccountKind::Real {
                self.exposure.open_position(&position.symbol, position.direction, position.stake);
            }
            if seen_wallets.insert((position.user_id.clone(), position.account_kind)) {
                match self.persistence.load_wallet(&position.user_id, position.account_kind).await {
                    Ok(Some(wallet)) => self.wallet.restore(wallet),
                    Ok(None) => {}
                    Err(err) => warn!(user_id = %position.user_id, error = %err, "failed to load wallet at startup"),
                }
            }
            self.positions.restore_open(position);
        }
        let now = Utc::now();
        let recovered = settlement::recover_stale(&self.positions, self.as_ref(), now).await;
        if recovered > 0 {
            warn!(recovered, "settled positions stale from before restart");
        }
        for position in self.positions.open_positions() {
            self.schedule_settlement(position.id, position.expires_at);
        }
    }

    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let symbols = self
            .symbol_configs
            .read()
            .values()
            .map(|cfg| {
                let tick = self
                    .tick_cell(&cfg.symbol)
                    .and_then(|cell| cell.load_full().as_ref().clone());
                SymbolSnapshot {
                    symbol: cfg.symbol.clone(),
                    enabled: cfg.enabled,
                    mode: tick.as_ref().map(|t| t.mode),
                    last_price: tick.as_ref().map(|t| t.price),
                    exposure: self.exposure.snapshot(&cfg.symbol),
                }
            })
            .collect();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            symbols,
            open_position_count: self.positions.open_positions().len(),
            recent_activity: self.recent_activity(50),
        }
    }
}

impl<P: PersistenceGateway> SettlementSink for AppState<P> {
    async fn settle_due(&self, position_id: Uuid) {
        self.settle_position(position_id).await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub enabled: bool,
    pub mode: Option<crate::types::PriceMode>,
    pub last_price: Option<f64>,
    pub exposure: Exposure,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub symbols: Vec<SymbolSnapshot>,
    pub open_position_count: usize,
    pub recent_activity: Vec<ActivityLogEntry>,
}
