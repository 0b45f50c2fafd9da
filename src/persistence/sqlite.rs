// =============================================================================
// SQLite-backed persistence gateway — spec.md §4.I
// =============================================================================
//
// Rows are keyed for their natural access pattern (symbol, or symbol+time
// range, or id) and the payload itself is stored as a JSON blob next to the
// indexed columns — the same "structured columns for lookup, JSON for the
// rest" split the runtime config file uses for its own on-disk format.
// Every query runs on a blocking thread via `spawn_blocking`, since rusqlite
// is synchronous; `with_retry` absorbs the transient `SQLITE_BUSY` errors a
// single-writer file database produces under concurrent access.
// =============================================================================

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CoreError, CoreResult};
use crate::exposure::Exposure;
use crate::positions::{Position, PositionStatus};
use crate::price_generator::Tick;
use crate::types::{AccountKind, ActivityLogEntry, PriceMode, SymbolConfig, Wallet};
#[cfg(test)]
use crate::types::{Direction, SettlementResult};

const MAX_ATTEMPTS: u32 = 3;

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn with_retry<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < MAX_ATTEMPTS && is_transient(&e) => {
                attempt += 1;
                std::thread::sleep(Duration::from_millis(20 * 2u64.pow(attempt)));
            }
            Err(e) => return Err(e),
        }
    }
}

fn to_core_err(err: rusqlite::Error) -> CoreError {
    CoreError::persistence(err.to_string())
}

pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

/// Run a blocking rusqlite closure on the blocking thread pool, holding the
/// connection mutex only for the duration of the closure. `spawn_blocking`
/// only fails if the runtime is shutting down, which this gateway surfaces
/// as a persistence error rather than panicking the caller.
async fn blocking<T, F>(conn: Arc<Mutex<Connection>>, f: F) -> CoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock().expect("sqlite connection poisoned");
        f(&conn)
    })
    .await
    .map_err(|err| CoreError::persistence(format!("blocking task panicked: {err}")))?
    .map_err(to_core_err)
}

impl SqlitePersistence {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let conn = Connection::open(path).map_err(to_core_err)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(to_core_err)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init_schema(conn: &Connection) -> CoreResult<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS symbol_configs (
                symbol TEXT PRIMARY KEY,
                json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS exposures (
                symbol TEXT PRIMARY KEY,
                up_stake REAL NOT NULL,
                up_count INTEGER NOT NULL DEFAULT 0,
                down_stake REAL NOT NULL,
                down_count INTEGER NOT NULL DEFAULT 0,
                interventions_applied INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS activity_log (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                actor TEXT,
                metadata TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS price_history (
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                price REAL NOT NULL,
                bid REAL NOT NULL,
                ask REAL NOT NULL,
                mode TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_price_history_symbol_time ON price_history (symbol, timestamp);
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions (status);
            CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT NOT NULL,
                account_kind TEXT NOT NULL,
                balance REAL NOT NULL,
                PRIMARY KEY (user_id, account_kind)
            );
            ",
        )
        .map_err(to_core_err)?;
        Ok(())
    }
}

impl crate::persistence::PersistenceGateway for SqlitePersistence {
    async fn load_symbol_configs(&self) -> CoreResult<Vec<SymbolConfig>> {
        let conn = self.conn.clone();
        blocking(conn, |conn| {
            with_retry(|| {
                let mut stmt = conn.prepare("SELECT json FROM symbol_configs")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    let json = row?;
                    if let Ok(cfg) = serde_json::from_str::<SymbolConfig>(&json) {
                        out.push(cfg);
                    }
                }
                Ok(out)
            })
        })
        .await
    }

    async fn upsert_symbol_config(&self, cfg: &SymbolConfig) -> CoreResult<()> {
        let conn = self.conn.clone();
        let symbol = cfg.symbol.clone();
        let json = serde_json::to_string(cfg).expect("SymbolConfig always serializes");
        blocking(conn, move |conn| {
            with_retry(|| {
                conn.execute(
                    "INSERT INTO symbol_configs (symbol, json) VALUES (?1, ?2)
                     ON CONFLICT(symbol) DO UPDATE SET json = excluded.json",
                    params![symbol, json],
                )
            })
            .map(|_| ())
        })
        .await
    }

    async fn upsert_exposure(&self, symbol: &str, exposure: Exposure) -> CoreResult<()> {
        let conn = self.conn.clone();
        let symbol = symbol.to_string();
        blocking(conn, move |conn| {
            with_retry(|| {
                conn.execute(
                    "INSERT INTO exposures (symbol, up_stake, up_count, down_stake, down_count, interventions_applied)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(symbol) DO UPDATE SET
                         up_stake = excluded.up_stake,
                         up_count = excluded.up_count,
                         down_stake = excluded.down_stake,
                         down_count = excluded.down_count,
                         interventions_applied = excluded.interventions_applied",
                    params![
                        symbol,
                        exposure.up_stake,
                        exposure.up_count as i64,
                        exposure.down_stake,
                        exposure.down_count as i64,
                        exposure.interventions_applied as i64,
                    ],
                )
            })
            .map(|_| ())
        })
        .await
    }

    async fn append_activity_log(&self, entry: &ActivityLogEntry) -> CoreResult<()> {
        let conn = self.conn.clone();
        let id = entry.id.to_string();
        let timestamp = entry.timestamp.to_rfc3339();
        let category = entry.category.clone();
        let message = entry.message.clone();
        let actor = entry.actor.clone();
        let metadata = entry.metadata.to_string();
        blocking(conn, move |conn| {
            with_retry(|| {
                conn.execute(
                    "INSERT INTO activity_log (id, timestamp, category, message, actor, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, timestamp, category, message, actor, metadata],
                )
            })
            .map(|_| ())
        })
        .await
    }

    async fn recent_activity_log(&self, limit: usize) -> CoreResult<Vec<ActivityLogEntry>> {
        let conn = self.conn.clone();
        blocking(conn, move |conn| {
            with_retry(|| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, category, message, actor, metadata
                     FROM activity_log ORDER BY timestamp DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], |row| {
                    let id: String = row.get(0)?;
                    let timestamp: String = row.get(1)?;
                    let category: String = row.get(2)?;
                    let message: String = row.get(3)?;
                    let actor: Option<String> = row.get(4)?;
                    let metadata: String = row.get(5)?;
                    Ok((id, timestamp, category, message, actor, metadata))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, timestamp, category, message, actor, metadata) = row?;
                    let Ok(id) = uuid::Uuid::parse_str(&id) else { continue };
                    let Ok(timestamp) = DateTime::parse_from_rfc3339(&timestamp) else { continue };
                    let metadata = serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null);
                    out.push(ActivityLogEntry {
                        id,
                        timestamp: timestamp.with_timezone(&Utc),
                        category,
                        message,
                        actor,
                        metadata,
                    });
                }
                Ok(out)
            })
        })
        .await
    }

    async fn record_tick(&self, tick: &Tick) -> CoreResult<()> {
        let conn = self.conn.clone();
        let symbol = tick.symbol.clone();
        let timestamp = tick.timestamp.to_rfc3339();
        let price = tick.price;
        let bid = tick.bid;
        let ask = tick.ask;
        let mode = tick.mode.to_string();
        blocking(conn, move |conn| {
            with_retry(|| {
                conn.execute(
                    "INSERT INTO price_history (symbol, timestamp, price, bid, ask, mode) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![symbol, timestamp, price, bid, ask, mode],
                )
            })
            .map(|_| ())
        })
        .await
    }

    async fn price_history(&self, symbol: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<Tick>> {
        let conn = self.conn.clone();
        let symbol = symbol.to_string();
        blocking(conn, move |conn| {
            with_retry(|| {
                let mut stmt = conn.prepare(
                    "SELECT price, bid, ask, mode, timestamp FROM price_history
                     WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp <= ?3 ORDER BY timestamp ASC",
                )?;
                let rows = stmt.query_map(params![symbol, from.to_rfc3339(), to.to_rfc3339()], |row| {
                    let price: f64 = row.get(0)?;
                    let bid: f64 = row.get(1)?;
                    let ask: f64 = row.get(2)?;
                    let mode: String = row.get(3)?;
                    let timestamp: String = row.get(4)?;
                    Ok((price, bid, ask, mode, timestamp))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (price, bid, ask, mode, timestamp) = row?;
                    let mode = match mode.as_str() {
                        "REAL_MIRROR" => PriceMode::RealMirror,
                        "ANCHORING" => PriceMode::Anchoring,
                        _ => PriceMode::Synthetic,
                    };
                    let Ok(timestamp) = DateTime::parse_from_rfc3339(&timestamp) else { continue };
                    out.push(Tick {
                        symbol: symbol.clone(),
                        price,
                        bid,
                        ask,
                        mode,
                        timestamp: timestamp.with_timezone(&Utc),
                    });
                }
                Ok(out)
            })
        })
        .await
    }

    async fn insert_open_position(&self, position: &Position) -> CoreResult<()> {
        let conn = self.conn.clone();
        let id = position.id.to_string();
        let expires_at = position.expires_at.to_rfc3339();
        let json = serde_json::to_string(position).expect("Position always serializes");
        blocking(conn, move |conn| {
            with_retry(|| {
                conn.execute(
                    "INSERT INTO positions (id, status, expires_at, json) VALUES (?1, 'OPEN', ?2, ?3)",
                    params![id, expires_at, json],
                )
            })
            .map(|_| ())
        })
        .await
    }

    async fn settle_position(&self, position: &Position) -> CoreResult<()> {
        let conn = self.conn.clone();
        let id = position.id.to_string();
        let json = serde_json::to_string(position).expect("Position always serializes");
        blocking(conn, move |conn| {
            with_retry(|| {
                conn.execute(
                    "UPDATE positions SET status = 'CLOSED', json = ?2 WHERE id = ?1",
                    params![id, json],
                )
            })
            .map(|_| ())
        })
        .await
    }

    async fn load_open_positions(&self) -> CoreResult<Vec<Position>> {
        let conn = self.conn.clone();
        blocking(conn, |conn| {
            with_retry(|| {
                let mut stmt = conn.prepare("SELECT json FROM positions WHERE status = 'OPEN'")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    let json = row?;
                    if let Ok(position) = serde_json::from_str::<Position>(&json) {
                        if position.status == PositionStatus::Open {
                            out.push(position);
                        }
                    }
                }
                Ok(out)
            })
        })
        .await
    }

    async fn load_wallet(&self, user_id: &str, account_kind: AccountKind) -> CoreResult<Option<Wallet>> {
        let conn = self.conn.clone();
        let user_id = user_id.to_string();
        blocking(conn, move |conn| {
            with_retry(|| {
                conn.query_row(
                    "SELECT balance FROM wallets WHERE user_id = ?1 AND account_kind = ?2",
                    params![user_id, account_kind.to_string()],
                    |row| row.get::<_, f64>(0),
                )
                .optional()
            })
            .map(|maybe_balance| {
                maybe_balance.map(|balance| Wallet {
                    user_id: user_id.clone(),
                    account_kind,
                    balance,
                })
            })
        })
        .await
    }

    async fn save_wallet(&self, wallet: &Wallet) -> CoreResult<()> {
        let conn = self.conn.clone();
        let user_id = wallet.user_id.clone();
        let account_kind = wallet.account_kind.to_string();
        let balance = wallet.balance;
        blocking(conn, move |conn| {
            with_retry(|| {
                conn.execute(
                    "INSERT INTO wallets (user_id, account_kind, balance) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id, account_kind) DO UPDATE SET balance = excluded.balance",
                    params![user_id, account_kind, balance],
                )
            })
            .map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistenceGateway;

    fn sample_position() -> Position {
        let now = Utc::now();
        Position::open(
            "alice",
            "EUR/USD-OTC",
            Direction::Up,
            AccountKind::Real,
            100.0,
            85.0,
            1.1,
            now,
            now + chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn symbol_config_roundtrips() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        let cfg = SymbolConfig::default_forex("EUR/USD");
        store.upsert_symbol_config(&cfg).await.unwrap();
        let loaded = store.load_symbol_configs().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].symbol, cfg.symbol);
    }

    #[tokio::test]
    async fn position_open_then_settle_transitions_status() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        let mut position = sample_position();
        store.insert_open_position(&position).await.unwrap();
        assert_eq!(store.load_open_positions().await.unwrap().len(), 1);

        position.status = PositionStatus::Closed;
        position.result = Some(SettlementResult::Won);
        store.settle_position(&position).await.unwrap();
        assert!(store.load_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn activity_log_orders_most_recent_first() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        store.append_activity_log(&ActivityLogEntry::new("admin", "first", None)).await.unwrap();
        store.append_activity_log(&ActivityLogEntry::new("admin", "second", None)).await.unwrap();
        let entries = store.recent_activity_log(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "second");
    }

    #[tokio::test]
    async fn wallet_roundtrips() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        let wallet = Wallet { user_id: "alice".into(), account_kind: AccountKind::Demo, balance: 1000.0 };
        store.save_wallet(&wallet).await.unwrap();
        let loaded = store.load_wallet("alice", AccountKind::Demo).await.unwrap().unwrap();
        assert_eq!(loaded.balance, 1000.0);
    }

    #[tokio::test]
    async fn upsert_exposure_overwrites_rather_than_duplicates() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        let exposure = Exposure {
            up_stake: 100.0,
            up_count: 2,
            down_stake: 40.0,
            down_count: 1,
            interventions_applied: 3,
        };
        store.upsert_exposure("EUR/USD-OTC", exposure).await.unwrap();
        store.upsert_exposure("EUR/USD-OTC", Exposure { up_stake: 150.0, ..exposure }).await.unwrap();

        let count: i64 = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM exposures WHERE symbol = 'EUR/USD-OTC'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn price_history_filters_by_time_range() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        let base = Utc::now();
        for (offset, price) in [(-60, 1.10), (0, 1.11), (60, 1.12)] {
            store
                .record_tick(&Tick {
                    symbol: "EUR/USD-OTC".into(),
                    price,
                    bid: price,
                    ask: price,
                    mode: PriceMode::Synthetic,
                    timestamp: base + chrono::Duration::seconds(offset),
                })
                .await
                .unwrap();
        }
        let rows = store
            .price_history("EUR/USD-OTC", base - chrono::Duration::seconds(1), base + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].price - 1.11).abs() < 1e-9);
    }
}
