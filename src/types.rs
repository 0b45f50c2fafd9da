// =============================================================================
// Shared types used across the synthetic OTC market core
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// A synthetic symbol is always its base symbol with this suffix appended.
pub const OTC_SUFFIX: &str = "-OTC";

/// Derive a synthetic symbol identifier from a base real-symbol identifier.
pub fn otc_symbol(base: &str) -> String {
    format!("{base}{OTC_SUFFIX}")
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

/// Whether a position is staked against a real wallet or a demo wallet.
/// Only `Real` positions on synthetic symbols contribute to exposure and are
/// subject to the risk policy — `Demo` positions are still settled normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountKind {
    Real,
    Demo,
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => write!(f, "REAL"),
            Self::Demo => write!(f, "DEMO"),
        }
    }
}

/// Which market family a synthetic symbol's base belongs to. Determines the
/// market-hours rule the scheduler applies (spec.md §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketKind {
    Forex,
    Crypto,
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forex => write!(f, "FOREX"),
            Self::Crypto => write!(f, "CRYPTO"),
        }
    }
}

/// The pricing mode a synthetic symbol is currently operating under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceMode {
    RealMirror,
    Synthetic,
    Anchoring,
}

impl fmt::Display for PriceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RealMirror => write!(f, "REAL_MIRROR"),
            Self::Synthetic => write!(f, "SYNTHETIC"),
            Self::Anchoring => write!(f, "ANCHORING"),
        }
    }
}

/// Result of a settled position. `None` while the position is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementResult {
    Won,
    Lost,
    Void,
}

impl fmt::Display for SettlementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Won => write!(f, "WON"),
            Self::Lost => write!(f, "LOST"),
            Self::Void => write!(f, "VOID"),
        }
    }
}

/// Inclusive `[min, max]` bounds on a synthetic symbol's stake size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeBounds {
    pub min: f64,
    pub max: f64,
}

/// Inclusive `[lo, hi]` bounds on the admin-configured intervention
/// probability range (spec.md §4.E step 5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InterventionRateRange {
    pub lo: f64,
    pub hi: f64,
}

/// Static (admin-authored, hot-reloadable) configuration for one synthetic
/// symbol. See spec.md §3 for field-by-field invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    pub base: String,
    pub market_kind: MarketKind,
    pub pip_size: f64,
    pub enabled: bool,
    pub payout_percent: f64,
    pub trade_bounds: TradeBounds,
    pub baseline_vol: f64,
    pub vol_multiplier: f64,
    pub mean_reversion_strength: f64,
    pub max_deviation_fraction: f64,
    pub price_offset_pips: f64,
    pub risk_enabled: bool,
    pub exposure_threshold: f64,
    pub intervention_rate_range: InterventionRateRange,
    pub anchoring_duration_secs: u64,
}

impl SymbolConfig {
    /// A reasonable default forex configuration used to bootstrap a new
    /// symbol. Callers should override fields as needed.
    pub fn default_forex(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            symbol: otc_symbol(&base),
            base,
            market_kind: MarketKind::Forex,
            pip_size: 0.0001,
            enabled: true,
            payout_percent: 85.0,
            trade_bounds: TradeBounds {
                min: 1.0,
                max: 1000.0,
            },
            baseline_vol: 0.0006,
            vol_multiplier: 1.0,
            mean_reversion_strength: 0.15,
            max_deviation_fraction: 0.02,
            price_offset_pips: 1.0,
            risk_enabled: true,
            exposure_threshold: 0.35,
            intervention_rate_range: InterventionRateRange { lo: 0.25, hi: 0.40 },
            anchoring_duration_secs: 15 * 60,
        }
    }

    /// A reasonable default crypto configuration used to bootstrap a new
    /// symbol. Crypto markets are always open (spec.md §4.A).
    pub fn default_crypto(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            symbol: otc_symbol(&base),
            base,
            market_kind: MarketKind::Crypto,
            pip_size: 0.01,
            enabled: true,
            payout_percent: 80.0,
            trade_bounds: TradeBounds {
                min: 1.0,
                max: 1000.0,
            },
            baseline_vol: 0.0015,
            vol_multiplier: 1.0,
            mean_reversion_strength: 0.1,
            max_deviation_fraction: 0.03,
            price_offset_pips: 2.0,
            risk_enabled: true,
            exposure_threshold: 0.35,
            intervention_rate_range: InterventionRateRange { lo: 0.25, hi: 0.40 },
            anchoring_duration_secs: 15 * 60,
        }
    }

    /// Validate the invariants listed in spec.md §3. Returns a human-readable
    /// description of the first violated invariant, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.trade_bounds.min > self.trade_bounds.max {
            return Err("trade_bounds.min must be <= trade_bounds.max".into());
        }
        if self.intervention_rate_range.lo > self.intervention_rate_range.hi {
            return Err("intervention_rate_range.lo must be <= .hi".into());
        }
        if !(0.0..1.0).contains(&self.exposure_threshold) {
            return Err("exposure_threshold must be in [0,1)".into());
        }
        if self.max_deviation_fraction > 0.1 {
            return Err("max_deviation_fraction must be <= 0.1 (10%)".into());
        }
        if !(50.0..=100.0).contains(&self.payout_percent) {
            return Err("payout_percent must be in [50,100]".into());
        }
        Ok(())
    }
}

/// One entry in the append-only operator activity log: every admin mutation
/// and every automatic risk intervention is recorded here for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub category: String,
    pub message: String,
    pub actor: Option<String>,
    pub metadata: serde_json::Value,
}

impl ActivityLogEntry {
    pub fn new(category: impl Into<String>, message: impl Into<String>, actor: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            category: category.into(),
            message: message.into(),
            actor,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A user's balance on one account kind. REAL and DEMO balances are tracked
/// independently and never intermix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: String,
    pub account_kind: AccountKind,
    pub balance: f64,
}

/// Compare two prices for equality within `pip_size / 10`, per spec.md §9.
pub fn prices_approx_eq(a: f64, b: f64, pip_size: f64) -> bool {
    (a - b).abs() <= pip_size / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otc_symbol_appends_suffix() {
        assert_eq!(otc_symbol("EUR/USD"), "EUR/USD-OTC");
    }

    #[test]
    fn default_forex_validates() {
        assert!(SymbolConfig::default_forex("EUR/USD").validate().is_ok());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut cfg = SymbolConfig::default_forex("EUR/USD");
        cfg.trade_bounds = TradeBounds { min: 100.0, max: 1.0 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_max_deviation_over_ten_percent() {
        let mut cfg = SymbolConfig::default_forex("EUR/USD");
        cfg.max_deviation_fraction = 0.11;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn approx_eq_within_tenth_pip() {
        assert!(prices_approx_eq(1.10000, 1.100009, 0.0001));
        assert!(!prices_approx_eq(1.10000, 1.10005, 0.0001));
    }
}
