// =============================================================================
// Synthetic Price Generator — spec.md §4.B
// =============================================================================
//
// `PriceState` is owned exclusively by the tick worker task for its symbol
// (spec.md §5: "no lock is taken for the internal generator state"). Every
// other component only ever sees the published `Tick` via a `TickCell`, a
// lock-free single-value cell (`arc_swap::ArcSwap`) that the worker swaps
// after each tick and that readers load without blocking the writer.
// =============================================================================

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::admin::ControlOverlay;
use crate::scheduler::{self, MarketHours};
use crate::types::{MarketKind, PriceMode, SymbolConfig};

/// A single published price observation for a synthetic symbol.
#[derive(Debug, Clone, Serialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub mode: PriceMode,
    pub timestamp: DateTime<Utc>,
}

/// Lock-free single-slot publish point for a symbol's latest tick. Cheap to
/// clone (an `Arc` around the swap cell) so it can be handed to the bus, the
/// settlement dispatcher, and REST handlers alike.
pub type TickCell = ArcSwap<Option<Tick>>;

pub fn new_tick_cell() -> Arc<TickCell> {
    Arc::new(ArcSwap::from_pointee(None))
}

/// Draw one standard-normal sample via the Box-Muller transform.
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Mutable per-symbol generator state. Not `Clone`, not `Send` across
/// workers: exactly one tick worker owns one `PriceState` for the lifetime
/// of that symbol.
pub struct PriceState {
    last_synthetic: f64,
    last_real: f64,
    variance: f64,
    momentum: f64,
    last_shock: f64,
    last_tick_time: DateTime<Utc>,
    mode: PriceMode,
    anchoring_started_at: Option<DateTime<Utc>>,
}

impl PriceState {
    /// Seed generator state from the first observed real price. Starts in
    /// `REAL_MIRROR` if the underlying market happens to be open already, so
    /// a symbol enabled during live hours doesn't spend a warm-up period in
    /// `ANCHORING` it doesn't need.
    pub fn new(market_kind: MarketKind, initial_real: f64, baseline_vol: f64, now: DateTime<Utc>) -> Self {
        let mode = if MarketHours::is_open(market_kind, now) {
            PriceMode::RealMirror
        } else {
            PriceMode::Synthetic
        };
        Self {
            last_synthetic: initial_real,
            last_real: initial_real,
            variance: baseline_vol * baseline_vol,
            momentum: 0.0,
            last_shock: 0.0,
            last_tick_time: now,
            mode,
            anchoring_started_at: None,
        }
    }

    pub fn mode(&self) -> PriceMode {
        self.mode
    }

    /// Advance the generator by one tick and return the published value.
    /// `last_real` is the most recent real-feed observation for the symbol's
    /// base (possibly stale if the feed is degraded — the caller decides how
    /// stale is too stale and falls back accordingly, spec.md §4.C).
    ///
    /// `feed_healthy` reflects spec.md §7: once the real feed for this
    /// symbol's base has been stale for more than 60s, the caller passes
    /// `false` and the symbol is forced into `SYNTHETIC` regardless of what
    /// the market-hours schedule would otherwise pick.
    pub fn tick(
        &mut self,
        cfg: &SymbolConfig,
        overlay: &ControlOverlay,
        now: DateTime<Utc>,
        last_real: f64,
        feed_healthy: bool,
        rng: &mut impl Rng,
    ) -> Tick {
        self.last_real = last_real;

        let (mode, anchor) = scheduler::mode_for(
            cfg.market_kind,
            now,
            self.mode,
            self.anchoring_started_at,
            chrono::Duration::seconds(cfg.anchoring_duration_secs as i64),
        );
        self.mode = mode;
        self.anchoring_started_at = anchor;

        if !feed_healthy {
            self.mode = PriceMode::Synthetic;
            self.anchoring_started_at = None;
        }

        let dt = (now - self.last_tick_time).num_milliseconds() as f64 / 1000.0;
        let dt = dt.clamp(0.01, 1.0);
        self.last_tick_time = now;

        let effective_vol_multiplier = overlay.effective_vol_multiplier(now, cfg.vol_multiplier);
        let sigma0 = cfg.baseline_vol * effective_vol_multiplier;

        // GARCH(1,1)-style variance update.
        let omega = 0.05 * sigma0 * sigma0;
        let alpha = 0.1;
        let beta = 0.85;
        self.variance = omega + alpha * self.last_shock * self.last_shock + beta * self.variance;

        let z = standard_normal(rng);
        let shock = z * self.variance.sqrt() * dt.sqrt();
        self.last_shock = shock;

        // Mean reversion toward the real-feed anchor, clamped to the
        // configured maximum deviation so a stale or jumpy feed can't drag
        // the synthetic price arbitrarily far in one tick.
        let raw_dev = (last_real - self.last_synthetic) / self.last_synthetic;
        let dev = raw_dev.clamp(-cfg.max_deviation_fraction, cfg.max_deviation_fraction);
        let reversion = dev * cfg.mean_reversion_strength * dt;

        let bias = match overlay.effective_direction_bias(now) {
            Some((bias, strength)) => bias * strength * sigma0 * dt.sqrt(),
            None => 0.0,
        };

        self.momentum = 0.95 * self.momentum + 0.3 * shock;
        let momentum_term = 0.1 * self.momentum;

        let candidate = self.last_synthetic * (1.0 + shock + reversion + bias + momentum_term);
        let lo = last_real * (1.0 - cfg.max_deviation_fraction);
        let hi = last_real * (1.0 + cfg.max_deviation_fraction);
        let candidate = candidate.clamp(lo, hi);

        let emitted = if let Some(price) = overlay.effective_price_override(now) {
            price
        } else {
            match self.mode {
                PriceMode::Anchoring => {
                    let started = self.anchoring_started_at.unwrap_or(now);
                    let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
                    let duration = cfg.anchoring_duration_secs as f64;
                    let progress = (elapsed / duration).clamp(0.0, 1.0);
                    let w_synthetic = 0.95 * (1.0 - progress).powi(2);
                    w_synthetic * candidate + (1.0 - w_synthetic) * last_real
                }
                PriceMode::RealMirror => {
                    let jitter = rng.gen_range(-1.0..1.0) * cfg.pip_size * cfg.price_offset_pips;
                    last_real + jitter
                }
                PriceMode::Synthetic => candidate,
            }
        };

        // The emitted value (not just the raw candidate) becomes the new
        // baseline, so a tick emitted under an override or an anchoring
        // blend leaves the generator continuous once the override lapses or
        // the mode advances.
        self.last_synthetic = emitted;

        let spread = 2.0 * cfg.pip_size;
        Tick {
            symbol: cfg.symbol.clone(),
            price: emitted,
            bid: emitted - spread / 2.0,
            ask: emitted + spread / 2.0,
            mode: self.mode,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cfg() -> SymbolConfig {
        SymbolConfig::default_forex("EUR/USD")
    }

    #[test]
    fn stays_within_max_deviation_of_real_feed() {
        let mut rng = StdRng::seed_from_u64(7);
        let cfg = cfg();
        let now = Utc::now();
        let mut state = PriceState::new(cfg.market_kind, 1.10, cfg.baseline_vol, now);
        let overlay = ControlOverlay::default();
        let mut last_real = 1.10;
        for i in 0..500 {
            let t = now + chrono::Duration::milliseconds(200 * i);
            let tick = state.tick(&cfg, &overlay, t, last_real, true, &mut rng);
            let lo = last_real * (1.0 - cfg.max_deviation_fraction);
            let hi = last_real * (1.0 + cfg.max_deviation_fraction);
            assert!(tick.price >= lo - 1e-9 && tick.price <= hi + 1e-9);
            last_real += 0.0000001;
        }
    }

    #[test]
    fn price_override_takes_precedence() {
        let mut rng = StdRng::seed_from_u64(1);
        let cfg = cfg();
        let now = Utc::now();
        let mut state = PriceState::new(cfg.market_kind, 1.10, cfg.baseline_vol, now);
        let mut overlay = ControlOverlay::default();
        overlay.price_override = Some(1.2345);
        overlay.price_override_expiry = Some(now + chrono::Duration::minutes(1));
        let tick = state.tick(&cfg, &overlay, now + chrono::Duration::seconds(1), 1.10, true, &mut rng);
        assert_eq!(tick.price, 1.2345);
    }

    #[test]
    fn bid_ask_straddle_price() {
        let mut rng = StdRng::seed_from_u64(3);
        let cfg = cfg();
        let now = Utc::now();
        let mut state = PriceState::new(cfg.market_kind, 1.10, cfg.baseline_vol, now);
        let overlay = ControlOverlay::default();
        let tick = state.tick(&cfg, &overlay, now + chrono::Duration::seconds(1), 1.10, true, &mut rng);
        assert!(tick.bid < tick.price);
        assert!(tick.ask > tick.price);
    }

    #[test]
    fn unhealthy_feed_forces_synthetic_even_when_market_open() {
        let mut rng = StdRng::seed_from_u64(11);
        let cfg = cfg();
        // Monday, well inside forex trading hours.
        let now = "2024-01-08T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut state = PriceState::new(cfg.market_kind, 1.10, cfg.baseline_vol, now);
        assert_eq!(state.mode(), PriceMode::RealMirror);
        let overlay = ControlOverlay::default();
        let tick = state.tick(&cfg, &overlay, now + chrono::Duration::seconds(1), 1.10, false, &mut rng);
        assert_eq!(tick.mode, PriceMode::Synthetic);
        assert_eq!(state.mode(), PriceMode::Synthetic);
    }
}
