// =============================================================================
// Position book — spec.md §3, §4.F
// =============================================================================
//
// A `Position` moves through exactly one transition: OPEN -> CLOSED. The
// book enforces that transition atomically so a crash-recovery scan and the
// settlement dispatcher can race on the same position without double-paying
// it (spec.md §4.F invariant: "a position settles exactly once").
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{AccountKind, Direction, SettlementResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub account_kind: AccountKind,
    pub stake: f64,
    pub payout_percent: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub result: Option<SettlementResult>,
    pub payout: Option<f64>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        user_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        account_kind: AccountKind,
        stake: f64,
        payout_percent: f64,
        entry_price: f64,
        opened_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            symbol: symbol.into(),
            direction,
            account_kind,
            stake,
            payout_percent,
            entry_price,
            opened_at,
            expires_at,
            status: PositionStatus::Open,
            exit_price: None,
            result: None,
            payout: None,
            settled_at: None,
        }
    }

    /// The full contract value returned to the user on a win (stake plus
    /// profit), computed from `payout_percent` captured at open time so a
    /// later admin change to the symbol's payout does not retroactively
    /// affect in-flight trades.
    pub fn win_payout(&self) -> f64 {
        self.stake * (1.0 + self.payout_percent / 100.0)
    }
}

#[derive(Default)]
pub struct PositionBook {
    open: RwLock<HashMap<Uuid, Position>>,
    closed: RwLock<HashMap<Uuid, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_open(&self, position: Position) -> Position {
        let mut open = self.open.write();
        open.insert(position.id, position.clone());
        position
    }

    /// Re-hydrate a position recovered from persistence without assigning a
    /// fresh id — used at startup to restore open positions across a
    /// restart (spec.md §4.F crash-recovery).
    pub fn restore_open(&self, position: Position) {
        self.open.write().insert(position.id, position);
    }

    pub fn get(&self, id: Uuid) -> Option<Position> {
        if let Some(p) = self.open.read().get(&id) {
            return Some(p.clone());
        }
        self.closed.read().get(&id).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn open_positions_for_user(&self, user_id: &str) -> Vec<Position> {
        self.open.read().values().filter(|p| p.user_id == user_id).cloned().collect()
    }

    /// Positions whose `expires_at` is at or before `cutoff` and are still
    /// open — used both by the settlement dispatcher's ready queue and by
    /// the crash-recovery scan to find stale positions a missed timer would
    /// otherwise leave open forever.
    pub fn open_positions_due_by(&self, cutoff: DateTime<Utc>) -> Vec<Position> {
        self.open
            .read()
            .values()
            .filter(|p| p.expires_at <= cutoff)
            .cloned()
            .collect()
    }

    pub fn recent_closed(&self, limit: usize) -> Vec<Position> {
        let mut closed: Vec<Position> = self.closed.read().values().cloned().collect();
        closed.sort_by(|a, b| b.settled_at.cmp(&a.settled_at));
        closed.truncate(limit);
        closed
    }

    /// Atomically transition a position from OPEN to CLOSED, stamping the
    /// settlement outcome. Returns `CoreError::Invariant` if the position is
    /// unknown or already closed, so callers racing the dispatcher and a
    /// recovery scan settle it exactly once.
    pub fn settle(
        &self,
        id: Uuid,
        exit_price: f64,
        result: SettlementResult,
        payout: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, CoreError> {
        let mut open = self.open.write();
        let Some(mut position) = open.remove(&id) else {
            return Err(CoreError::Invariant(format!("settle called on unknown or already-closed position {id}")));
        };
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.result = Some(result);
        position.payout = Some(payout);
        position.settled_at = Some(now);
        drop(open);
        self.closed.write().insert(id, position.clone());
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Position {
        let now = Utc::now();
        Position::open(
            "alice",
            "EUR/USD-OTC",
            Direction::Up,
            AccountKind::Real,
            100.0,
            85.0,
            1.1000,
            now,
            now + chrono::Duration::minutes(5),
        )
    }

    #[test]
    fn settle_moves_position_from_open_to_closed() {
        let book = PositionBook::new();
        let pos = book.insert_open(sample());
        let settled = book.settle(pos.id, 1.1010, SettlementResult::Won, pos.win_payout(), Utc::now()).unwrap();
        assert_eq!(settled.status, PositionStatus::Closed);
        assert!(book.open_positions().is_empty());
        assert_eq!(book.recent_closed(10).len(), 1);
    }

    #[test]
    fn double_settle_is_rejected() {
        let book = PositionBook::new();
        let pos = book.insert_open(sample());
        book.settle(pos.id, 1.1010, SettlementResult::Won, pos.win_payout(), Utc::now()).unwrap();
        let second = book.settle(pos.id, 1.1020, SettlementResult::Won, pos.win_payout(), Utc::now());
        assert!(second.is_err());
    }

    #[test]
    fn win_payout_reflects_captured_percent() {
        let pos = sample();
        assert_eq!(pos.win_payout(), 185.0);
    }

    #[test]
    fn due_by_cutoff_finds_expired_positions() {
        let book = PositionBook::new();
        let pos = book.insert_open(sample());
        let due = book.open_positions_due_by(pos.expires_at + chrono::Duration::seconds(1));
        assert_eq!(due.len(), 1);
        let not_due = book.open_positions_due_by(pos.opened_at);
        assert!(not_due.is_empty());
    }
}
