// =============================================================================
// Clock & Scheduler — market-hours lookup and mode arbitration (spec.md §4.A)
// =============================================================================
//
// Pure, side-effect-free logic: callers own the per-symbol mode/anchoring
// state (it lives on `PriceState`, see `price_generator.rs`) and pass it in;
// this module only computes the next value. Keeping it pure makes the
// transition table trivial to unit test without spinning up a tick worker.
// =============================================================================

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::types::{MarketKind, PriceMode};

/// Market-hours rules. Stocks/indices are out of scope (spec.md §4.A).
pub struct MarketHours;

impl MarketHours {
    /// Whether `market_kind`'s underlying real market is open at `now`.
    pub fn is_open(market_kind: MarketKind, now: DateTime<Utc>) -> bool {
        match market_kind {
            MarketKind::Crypto => true,
            MarketKind::Forex => Self::is_forex_open(now),
        }
    }

    /// FOREX is closed from Friday 22:00 UTC through Sunday 22:00 UTC
    /// inclusive (which covers all of Saturday).
    fn is_forex_open(now: DateTime<Utc>) -> bool {
        match now.weekday() {
            Weekday::Fri => now.hour() < 22,
            Weekday::Sat => false,
            Weekday::Sun => now.hour() >= 22,
            _ => true,
        }
    }
}

/// Compute the next price mode for a symbol, given the market-hours state and
/// the previously observed mode. The scheduler is consulted at most once per
/// tick cycle per symbol (spec.md §4.A): mode transitions are monotonic
/// within that cycle because this function is only ever called once per
/// cycle and its output becomes the next cycle's `prev_mode`.
///
/// Returns `(next_mode, next_anchoring_started_at)`.
pub fn mode_for(
    market_kind: MarketKind,
    now: DateTime<Utc>,
    prev_mode: PriceMode,
    anchoring_started_at: Option<DateTime<Utc>>,
    anchoring_duration: chrono::Duration,
) -> (PriceMode, Option<DateTime<Utc>>) {
    if !MarketHours::is_open(market_kind, now) {
        return (PriceMode::Synthetic, None);
    }

    match prev_mode {
        PriceMode::Synthetic => (PriceMode::Anchoring, Some(now)),
        PriceMode::Anchoring => {
            let started = anchoring_started_at.unwrap_or(now);
            if now - started < anchoring_duration {
                (PriceMode::Anchoring, Some(started))
            } else {
                (PriceMode::RealMirror, None)
            }
        }
        PriceMode::RealMirror => (PriceMode::RealMirror, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, 0).unwrap()
    }

    #[test]
    fn crypto_always_open() {
        // A Saturday, normally closed for forex.
        assert!(MarketHours::is_open(MarketKind::Crypto, dt(2026, 8, 1, 12, 0)));
    }

    #[test]
    fn forex_closed_all_saturday() {
        assert!(!MarketHours::is_open(MarketKind::Forex, dt(2026, 8, 1, 0, 0)));
        assert!(!MarketHours::is_open(MarketKind::Forex, dt(2026, 8, 1, 23, 59)));
    }

    #[test]
    fn forex_closes_friday_2200() {
        assert!(MarketHours::is_open(MarketKind::Forex, dt(2026, 7, 31, 21, 59)));
        assert!(!MarketHours::is_open(MarketKind::Forex, dt(2026, 7, 31, 22, 0)));
    }

    #[test]
    fn forex_reopens_sunday_2200() {
        assert!(!MarketHours::is_open(MarketKind::Forex, dt(2026, 8, 2, 21, 59)));
        assert!(MarketHours::is_open(MarketKind::Forex, dt(2026, 8, 2, 22, 0)));
    }

    #[test]
    fn closed_market_forces_synthetic() {
        let (mode, anchor) = mode_for(
            MarketKind::Forex,
            dt(2026, 8, 1, 12, 0),
            PriceMode::RealMirror,
            None,
            chrono::Duration::minutes(15),
        );
        assert_eq!(mode, PriceMode::Synthetic);
        assert!(anchor.is_none());
    }

    #[test]
    fn reopen_begins_anchoring() {
        let now = dt(2026, 8, 2, 22, 0);
        let (mode, anchor) = mode_for(
            MarketKind::Forex,
            now,
            PriceMode::Synthetic,
            None,
            chrono::Duration::minutes(15),
        );
        assert_eq!(mode, PriceMode::Anchoring);
        assert_eq!(anchor, Some(now));
    }

    #[test]
    fn anchoring_expires_into_real_mirror() {
        let started = dt(2026, 8, 2, 22, 0);
        let later = started + chrono::Duration::minutes(15) + chrono::Duration::seconds(1);
        let (mode, anchor) = mode_for(
            MarketKind::Forex,
            later,
            PriceMode::Anchoring,
            Some(started),
            chrono::Duration::minutes(15),
        );
        assert_eq!(mode, PriceMode::RealMirror);
        assert!(anchor.is_none());
    }

    #[test]
    fn anchoring_holds_before_expiry() {
        let started = dt(2026, 8, 2, 22, 0);
        let mid = started + chrono::Duration::minutes(7) + chrono::Duration::seconds(30);
        let (mode, anchor) = mode_for(
            MarketKind::Forex,
            mid,
            PriceMode::Anchoring,
            Some(started),
            chrono::Duration::minutes(15),
        );
        assert_eq!(mode, PriceMode::Anchoring);
        assert_eq!(anchor, Some(started));
    }
}
