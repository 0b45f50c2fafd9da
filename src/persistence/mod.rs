// =============================================================================
// Persistence gateway — spec.md §4.I
// =============================================================================
//
// `PersistenceGateway` is the seam between the in-memory hot path and
// durable storage. Every method is fallible and every caller treats a
// persistence failure as non-fatal to the in-memory operation it
// accompanies: the mutation already applied in memory stands, the error is
// logged, and the write is retried by the gateway implementation itself
// before giving up (spec.md §7 `CoreError::Persistence`).
// =============================================================================

pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::exposure::Exposure;
use crate::positions::Position;
use crate::price_generator::Tick;
use crate::types::{ActivityLogEntry, SymbolConfig, Wallet};

pub trait PersistenceGateway: Send + Sync + 'static {
    fn load_symbol_configs(&self) -> impl std::future::Future<Output = CoreResult<Vec<SymbolConfig>>> + Send;
    fn upsert_symbol_config(&self, cfg: &SymbolConfig) -> impl std::future::Future<Output = CoreResult<()>> + Send;

    fn upsert_exposure(&self, symbol: &str, exposure: Exposure) -> impl std::future::Future<Output = CoreResult<()>> + Send;

    fn append_activity_log(&self, entry: &ActivityLogEntry) -> impl std::future::Future<Output = CoreResult<()>> + Send;
    fn recent_activity_log(&self, limit: usize) -> impl std::future::Future<Output = CoreResult<Vec<ActivityLogEntry>>> + Send;

    fn record_tick(&self, tick: &Tick) -> impl std::future::Future<Output = CoreResult<()>> + Send;
    fn price_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl std::future::Future<Output = CoreResult<Vec<Tick>>> + Send;

    fn insert_open_position(&self, position: &Position) -> impl std::future::Future<Output = CoreResult<()>> + Send;
    fn settle_position(&self, position: &Position) -> impl std::future::Future<Output = CoreResult<()>> + Send;
    fn load_open_positions(&self) -> impl std::future::Future<Output = CoreResult<Vec<Position>>> + Send;

    fn load_wallet(&self, user_id: &str, account_kind: crate::types::AccountKind) -> impl std::future::Future<Output = CoreResult<Option<Wallet>>> + Send;
    fn save_wallet(&self, wallet: &Wallet) -> impl std::future::Future<Output = CoreResult<()>> + Send;
}
