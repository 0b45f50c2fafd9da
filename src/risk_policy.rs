// =============================================================================
// Risk policy — spec.md §4.E
// =============================================================================
//
// Decides, at settlement time, whether the house intervenes on a position's
// outcome. Intervention is never a blanket "house always wins": it only
// nudges trades that are (a) on the side the platform is already overexposed
// to and (b) about to win naturally, and even then only probabilistically.
// Everything else — demo accounts, disabled risk, under-threshold exposure,
// an active admin price override — settles on the unmodified market outcome.
// =============================================================================

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::info;

use crate::admin::ControlOverlay;
use crate::exposure::Exposure;
use crate::types::{AccountKind, Direction, SettlementResult, SymbolConfig, prices_approx_eq};

#[derive(Debug, Clone, Copy)]
pub struct RiskDecision {
    pub exit_price: f64,
    pub result: SettlementResult,
    pub intervened: bool,
}

/// Compare the entry and exit price for a direction, returning the
/// unmodified market outcome. A tie within `pip_size / 10` (spec.md §9) is
/// VOID rather than a coin flip in either direction's favour.
pub fn natural_result(direction: Direction, entry_price: f64, exit_price: f64, pip_size: f64) -> SettlementResult {
    if prices_approx_eq(entry_price, exit_price, pip_size) {
        return SettlementResult::Void;
    }
    let up_wins = exit_price > entry_price;
    match direction {
        Direction::Up if up_wins => SettlementResult::Won,
        Direction::Down if !up_wins => SettlementResult::Won,
        _ => SettlementResult::Lost,
    }
}

/// Synthesize an exit price at least one pip on the correct side of entry so
/// a forced outcome actually produces that outcome (spec.md §4.E step 1),
/// regardless of whatever the current market tick happens to be.
fn forced_exit_price(direction: Direction, entry_price: f64, pip_size: f64, result: SettlementResult) -> f64 {
    let up_wins = match result {
        SettlementResult::Won => direction == Direction::Up,
        SettlementResult::Lost => direction == Direction::Down,
        SettlementResult::Void => return entry_price,
    };
    if up_wins {
        entry_price + pip_size
    } else {
        entry_price - pip_size
    }
}

/// Intervention probability per spec.md §4.E step 5:
/// `π = clamp(lo + (ratio − threshold) · 0.5, lo, hi)`.
fn intervention_probability(fraction: f64, threshold: f64, lo: f64, hi: f64) -> f64 {
    (lo + (fraction - threshold) * 0.5).clamp(lo, hi)
}

#[allow(clippy::too_many_arguments)]
pub fn decide(
    cfg: &SymbolConfig,
    overlay: &ControlOverlay,
    exposure: Exposure,
    account_kind: AccountKind,
    forced: Option<SettlementResult>,
    direction: Direction,
    entry_price: f64,
    market_exit_price: f64,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> RiskDecision {
    // Step 1: a one-shot forced outcome bypasses everything else. Synthesize
    // an exit price that actually produces the forced result by at least one
    // pip — the tick itself is irrelevant (spec.md §4.E step 1, S4).
    if let Some(result) = forced {
        let exit_price = forced_exit_price(direction, entry_price, cfg.pip_size, result);
        return RiskDecision {
            exit_price,
            result,
            intervened: true,
        };
    }

    let natural = natural_result(direction, entry_price, market_exit_price, cfg.pip_size);
    let passthrough = RiskDecision {
        exit_price: market_exit_price,
        result: natural,
        intervened: false,
    };

    // Step 2: an active admin price override already fully determines the
    // market outcome; the risk policy does not layer a second adjustment on
    // top of one the admin explicitly set.
    if overlay.effective_price_override(now).is_some() {
        return passthrough;
    }

    // Step 3: demo stakes and risk-disabled symbols always settle naturally.
    if account_kind == AccountKind::Demo || !cfg.risk_enabled {
        return passthrough;
    }

    // Only a natural win is a candidate for intervention — a losing or void
    // trade already costs the platform nothing extra.
    if natural != SettlementResult::Won {
        return passthrough;
    }

    // Step 4: only intervene on the side the platform is already exposed to.
    let heavy_side = if exposure.net() >= 0.0 { Direction::Up } else { Direction::Down };
    let fraction = exposure.fraction().abs();
    if direction != heavy_side || fraction < cfg.exposure_threshold {
        return passthrough;
    }

    // Step 5: draw for intervention, scaled by how far exposure has run past
    // the configured threshold.
    let probability = intervention_probability(
        fraction,
        cfg.exposure_threshold,
        cfg.intervention_rate_range.lo,
        cfg.intervention_rate_range.hi,
    );
    let draw: f64 = rng.gen_range(0.0..1.0);
    if draw >= probability {
        return passthrough;
    }

    // Step 6: subtle adjustment. Draw a losing-side candidate `m'` within
    // 1.5 spreads of entry, then blend it 65/35 with the unmodified market
    // exit so the nudge reads as ordinary noise rather than a hard clamp.
    let spread_pips = 2.0; // spread defaults to 2 * pip_size, spec.md §4.B
    let delta = rng.gen_range(0.0..(1.5 * spread_pips)) * cfg.pip_size;
    let losing_candidate = match direction {
        Direction::Up => entry_price - delta,
        Direction::Down => entry_price + delta,
    };
    let adjusted_exit = 0.65 * market_exit_price + 0.35 * losing_candidate;
    let result = natural_result(direction, entry_price, adjusted_exit, cfg.pip_size);
    info!(symbol = %cfg.symbol, fraction, probability, "risk policy intervened on settlement");
    RiskDecision {
        exit_price: adjusted_exit,
        result,
        intervened: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cfg() -> SymbolConfig {
        let mut c = SymbolConfig::default_forex("EUR/USD");
        c.exposure_threshold = 0.3;
        c.intervention_rate_range = crate::types::InterventionRateRange { lo: 1.0, hi: 1.0 };
        c
    }

    #[test]
    fn demo_account_always_passes_through() {
        let mut rng = StdRng::seed_from_u64(1);
        let exposure = Exposure { up_stake: 1000.0, down_stake: 0.0, ..Exposure::default() };
        let decision = decide(
            &cfg(),
            &ControlOverlay::default(),
            exposure,
            AccountKind::Demo,
            None,
            Direction::Up,
            1.1000,
            1.1010,
            Utc::now(),
            &mut rng,
        );
        assert_eq!(decision.result, SettlementResult::Won);
        assert!(!decision.intervened);
    }

    #[test]
    fn forced_outcome_overrides_everything() {
        let mut rng = StdRng::seed_from_u64(1);
        let decision = decide(
            &cfg(),
            &ControlOverlay::default(),
            Exposure::default(),
            AccountKind::Real,
            Some(SettlementResult::Lost),
            Direction::Up,
            1.1000,
            1.2000,
            Utc::now(),
            &mut rng,
        );
        assert_eq!(decision.result, SettlementResult::Lost);
        assert!(decision.intervened);
    }

    #[test]
    fn forced_loss_synthesizes_an_exit_price_below_entry_regardless_of_tick() {
        // Scenario S4: forced LOSE on an UP position with entry 1.10000 must
        // return exit_price <= 1.09999 and result=LOST, no matter what the
        // current market tick (1.20000 here) happens to be.
        let mut rng = StdRng::seed_from_u64(1);
        let decision = decide(
            &cfg(),
            &ControlOverlay::default(),
            Exposure::default(),
            AccountKind::Real,
            Some(SettlementResult::Lost),
            Direction::Up,
            1.10000,
            1.20000,
            Utc::now(),
            &mut rng,
        );
        assert_eq!(decision.result, SettlementResult::Lost);
        assert!(decision.exit_price <= 1.09999 + 1e-9);
    }

    #[test]
    fn forced_win_synthesizes_an_exit_price_above_entry_for_up() {
        let mut rng = StdRng::seed_from_u64(1);
        let decision = decide(
            &cfg(),
            &ControlOverlay::default(),
            Exposure::default(),
            AccountKind::Real,
            Some(SettlementResult::Won),
            Direction::Up,
            1.10000,
            1.05000,
            Utc::now(),
            &mut rng,
        );
        assert_eq!(decision.result, SettlementResult::Won);
        assert!(decision.exit_price > 1.10000);
    }

    #[test]
    fn intervention_probability_matches_spec_formula() {
        // S2's numbers: ratio ~= 0.818, threshold 0.35, lo 0.25, hi 0.40 ->
        // clamp(0.25 + (0.818 - 0.35) * 0.5, 0.25, 0.40) = 0.40.
        let p = intervention_probability(9.0 / 11.0, 0.35, 0.25, 0.40);
        assert!((p - 0.40).abs() < 1e-9);
    }

    #[test]
    fn under_threshold_exposure_passes_through() {
        let mut rng = StdRng::seed_from_u64(1);
        let exposure = Exposure { up_stake: 10.0, down_stake: 9.0, ..Exposure::default() };
        let decision = decide(
            &cfg(),
            &ControlOverlay::default(),
            exposure,
            AccountKind::Real,
            None,
            Direction::Up,
            1.1000,
            1.1010,
            Utc::now(),
            &mut rng,
        );
        assert!(!decision.intervened);
    }

    #[test]
    fn overexposed_winning_trade_is_nudged_toward_a_loss() {
        let mut rng = StdRng::seed_from_u64(1);
        let exposure = Exposure { up_stake: 1000.0, down_stake: 0.0, ..Exposure::default() };
        let market_exit = 1.1010;
        let decision = decide(
            &cfg(),
            &ControlOverlay::default(),
            exposure,
            AccountKind::Real,
            None,
            Direction::Up,
            1.1000,
            market_exit,
            Utc::now(),
            &mut rng,
        );
        // intervention_rate_range is pinned to 1.0 in this test's cfg, so the
        // draw always falls below the probability. The blend always pulls
        // the exit down from the unmodified market price on an UP trade
        // (spec.md §4.E step 6), even though a wide natural win margin like
        // this one isn't guaranteed to flip all the way to a loss.
        assert!(decision.intervened);
        assert!(decision.exit_price < market_exit);
    }

    #[test]
    fn narrow_overexposed_win_can_flip_to_a_loss() {
        // Scenario S2: a near-entry win margin (half a pip) is exactly the
        // kind of trade the intervention is meant to flip. The exact flip
        // depends on the random nudge draw, so sample many seeds rather than
        // asserting a single RNG draw's outcome.
        let exposure = Exposure { up_stake: 1000.0, down_stake: 0.0, ..Exposure::default() };
        let entry = 1.1000;
        let market_exit = entry + 0.5 * cfg().pip_size;
        let mut saw_flip = false;
        for seed in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let decision = decide(
                &cfg(),
                &ControlOverlay::default(),
                exposure,
                AccountKind::Real,
                None,
                Direction::Up,
                entry,
                market_exit,
                Utc::now(),
                &mut rng,
            );
            assert!(decision.intervened);
            assert!(decision.exit_price < market_exit);
            if decision.result == SettlementResult::Lost {
                saw_flip = true;
            }
        }
        assert!(saw_flip, "expected at least one seed to flip a near-entry win to a loss");
    }

    #[test]
    fn losing_trade_is_never_touched() {
        let mut rng = StdRng::seed_from_u64(1);
        let exposure = Exposure { up_stake: 1000.0, down_stake: 0.0, ..Exposure::default() };
        let decision = decide(
            &cfg(),
            &ControlOverlay::default(),
            exposure,
            AccountKind::Real,
            None,
            Direction::Up,
            1.1000,
            1.0900,
            Utc::now(),
            &mut rng,
        );
        assert_eq!(decision.result, SettlementResult::Lost);
        assert!(!decision.intervened);
    }

    #[test]
    fn price_override_suppresses_intervention() {
        let mut rng = StdRng::seed_from_u64(1);
        let exposure = Exposure { up_stake: 1000.0, down_stake: 0.0, ..Exposure::default() };
        let mut overlay = ControlOverlay::default();
        let now = Utc::now();
        overlay.price_override = Some(1.1010);
        overlay.price_override_expiry = Some(now + chrono::Duration::minutes(1));
        let decision = decide(
            &cfg(),
            &overlay,
            exposure,
            AccountKind::Real,
            None,
            Direction::Up,
            1.1000,
            1.1010,
            now,
            &mut rng,
        );
        assert_eq!(decision.result, SettlementResult::Won);
        assert!(!decision.intervened);
    }
}
