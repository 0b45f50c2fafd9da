// =============================================================================
// Exposure Book — spec.md §4.D
// =============================================================================
//
// Tracks, per synthetic symbol, the platform's net directional exposure from
// open REAL positions (DEMO stakes never contribute, spec.md §3). Reads are
// on the hot path of every tick's risk-policy evaluation, so the table is a
// flat map guarded by one lock — updates are O(1) and rare relative to reads.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::types::Direction;

/// Net exposure for one synthetic symbol: the platform's liability if every
/// open REAL position on this symbol settled as a win right now.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Exposure {
    pub up_stake: f64,
    pub up_count: u64,
    pub down_stake: f64,
    pub down_count: u64,
    /// Running count of settlements the risk policy nudged against the
    /// majority side (spec.md §3, §4.E step 6). Not reset by `reset()` or by
    /// ordinary open/close traffic — only a fresh process starts it at zero.
    pub interventions_applied: u64,
}

impl Exposure {
    /// Net directional stake, signed toward UP. Used by the risk policy to
    /// decide which side of the market the house is exposed to.
    pub fn net(&self) -> f64 {
        self.up_stake - self.down_stake
    }

    pub fn total(&self) -> f64 {
        self.up_stake + self.down_stake
    }

    /// Net exposure as a fraction of total stake on the symbol. Zero if there
    /// is no open stake at all.
    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            0.0
        } else {
            self.net() / total
        }
    }
}

#[derive(Default)]
pub struct ExposureBook {
    by_symbol: RwLock<HashMap<String, Exposure>>,
}

impl ExposureBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, symbol: &str) -> Exposure {
        self.by_symbol.read().get(symbol).copied().unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<String, Exposure> {
        self.by_symbol.read().clone()
    }

    /// Explicit administrative reconciliation: zero out a symbol's tracked
    /// exposure outside the normal open/close settlement path. Spec.md §9
    /// permits this only as a deliberate admin action, never as part of
    /// routine settlement — callers are responsible for logging it.
    pub fn reset(&self, symbol: &str) {
        let mut table = self.by_symbol.write();
        let entry = table.entry(symbol.to_string()).or_default();
        let interventions_applied = entry.interventions_applied;
        *entry = Exposure { interventions_applied, ..Exposure::default() };
    }

    /// Record a newly opened REAL position's stake against the book.
    pub fn open_position(&self, symbol: &str, direction: Direction, stake: f64) {
        let mut table = self.by_symbol.write();
        let entry = table.entry(symbol.to_string()).or_default();
        match direction {
            Direction::Up => {
                entry.up_stake += stake;
                entry.up_count += 1;
            }
            Direction::Down => {
                entry.down_stake += stake;
                entry.down_count += 1;
            }
        }
    }

    /// Release a settled or voided REAL position's stake from the book.
    /// Clamps to zero and logs a warning rather than going negative: a
    /// negative exposure would be an accounting bug, and crashing the
    /// settlement path over it would be worse than a momentarily stale
    /// figure (spec.md §4.D invariant).
    pub fn close_position(&self, symbol: &str, direction: Direction, stake: f64) {
        let mut table = self.by_symbol.write();
        let entry = table.entry(symbol.to_string()).or_default();
        match direction {
            Direction::Up => {
                if stake > entry.up_stake {
                    warn!(symbol, stake, current = entry.up_stake, "exposure underflow on UP side, clamping to zero");
                    entry.up_stake = 0.0;
                } else {
                    entry.up_stake -= stake;
                }
                entry.up_count = entry.up_count.saturating_sub(1);
            }
            Direction::Down => {
                if stake > entry.down_stake {
                    warn!(symbol, stake, current = entry.down_stake, "exposure underflow on DOWN side, clamping to zero");
                    entry.down_stake = 0.0;
                } else {
                    entry.down_stake -= stake;
                }
                entry.down_count = entry.down_count.saturating_sub(1);
            }
        }
    }

    /// Record that the risk policy nudged a settlement against the majority
    /// side (spec.md §4.E step 6). Distinct from a forced outcome, which
    /// never touches this counter.
    pub fn record_intervention(&self, symbol: &str) {
        let mut table = self.by_symbol.write();
        table.entry(symbol.to_string()).or_default().interventions_applied += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_close_balances_back_to_zero() {
        let book = ExposureBook::new();
        book.open_position("EUR/USD-OTC", Direction::Up, 100.0);
        book.open_position("EUR/USD-OTC", Direction::Down, 40.0);
        let snap = book.snapshot("EUR/USD-OTC");
        assert_eq!(snap.up_stake, 100.0);
        assert_eq!(snap.down_stake, 40.0);
        assert_eq!(snap.net(), 60.0);

        book.close_position("EUR/USD-OTC", Direction::Up, 100.0);
        book.close_position("EUR/USD-OTC", Direction::Down, 40.0);
        let snap = book.snapshot("EUR/USD-OTC");
        assert_eq!(snap.up_stake, 0.0);
        assert_eq!(snap.down_stake, 0.0);
    }

    #[test]
    fn underflow_clamps_to_zero_instead_of_going_negative() {
        let book = ExposureBook::new();
        book.open_position("EUR/USD-OTC", Direction::Up, 10.0);
        book.close_position("EUR/USD-OTC", Direction::Up, 50.0);
        assert_eq!(book.snapshot("EUR/USD-OTC").up_stake, 0.0);
    }

    #[test]
    fn fraction_is_zero_with_no_stake() {
        let book = ExposureBook::new();
        assert_eq!(book.snapshot("EUR/USD-OTC").fraction(), 0.0);
    }

    #[test]
    fn reset_zeroes_out_tracked_exposure() {
        let book = ExposureBook::new();
        book.open_position("EUR/USD-OTC", Direction::Up, 500.0);
        book.reset("EUR/USD-OTC");
        let snap = book.snapshot("EUR/USD-OTC");
        assert_eq!(snap.total(), 0.0);
        assert_eq!(snap.up_count, 0);
    }

    #[test]
    fn counts_track_position_count_not_just_stake() {
        let book = ExposureBook::new();
        book.open_position("EUR/USD-OTC", Direction::Up, 100.0);
        book.open_position("EUR/USD-OTC", Direction::Up, 50.0);
        let snap = book.snapshot("EUR/USD-OTC");
        assert_eq!(snap.up_count, 2);
        assert_eq!(snap.up_stake, 150.0);

        book.close_position("EUR/USD-OTC", Direction::Up, 50.0);
        assert_eq!(book.snapshot("EUR/USD-OTC").up_count, 1);
    }

    #[test]
    fn interventions_survive_a_reset() {
        let book = ExposureBook::new();
        book.record_intervention("EUR/USD-OTC");
        book.record_intervention("EUR/USD-OTC");
        book.open_position("EUR/USD-OTC", Direction::Up, 100.0);
        book.reset("EUR/USD-OTC");
        let snap = book.snapshot("EUR/USD-OTC");
        assert_eq!(snap.interventions_applied, 2);
        assert_eq!(snap.up_stake, 0.0);
    }
}
