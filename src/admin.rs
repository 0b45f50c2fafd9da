// =============================================================================
// Admin Control Plane — spec.md §4.G
// =============================================================================
//
// Pure mutators over `ControlOverlay` (per synthetic symbol) and `UserTarget`
// (per user). Every mutator is idempotent and timestamp-bearing, and every
// mutation is recorded to the activity log by the caller (the REST handlers
// in `api/rest.rs`) — this module only owns the in-memory maps.
//
// Expiry fields are honoured lazily by the price generator and risk policy
// on next use; `sweep_expired` below is the optional periodic cleanup spec.md
// allows (>= 1 min cadence) and is not required for correctness.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Per-symbol admin overlay. All fields are optional; absence means "no
/// override in effect".
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlOverlay {
    pub direction_bias: Option<f64>,
    pub direction_strength: f64,
    pub direction_expiry: Option<DateTime<Utc>>,

    pub vol_multiplier_override: Option<f64>,
    pub vol_expiry: Option<DateTime<Utc>>,

    pub price_override: Option<f64>,
    pub price_override_expiry: Option<DateTime<Utc>>,
}

impl ControlOverlay {
    fn expired(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        matches!(expiry, Some(e) if now >= e)
    }

    /// The effective volatility multiplier: the admin override if set and not
    /// expired, else `fallback` (the symbol's configured `vol_multiplier`).
    pub fn effective_vol_multiplier(&self, now: DateTime<Utc>, fallback: f64) -> f64 {
        match self.vol_multiplier_override {
            Some(v) if !Self::expired(self.vol_expiry, now) => v,
            _ => fallback,
        }
    }

    /// The effective directional bias `(bias, strength)` if a non-expired
    /// override is set.
    pub fn effective_direction_bias(&self, now: DateTime<Utc>) -> Option<(f64, f64)> {
        match self.direction_bias {
            Some(b) if !Self::expired(self.direction_expiry, now) => Some((b, self.direction_strength)),
            _ => None,
        }
    }

    /// The effective constant price override, if set and not expired.
    pub fn effective_price_override(&self, now: DateTime<Utc>) -> Option<f64> {
        match self.price_override {
            Some(p) if !Self::expired(self.price_override_expiry, now) => Some(p),
            _ => None,
        }
    }

    /// True once every field on this overlay has either never been set or
    /// has expired — used by the periodic sweep to decide whether the whole
    /// entry can be dropped from the map.
    fn is_clean(&self, now: DateTime<Utc>) -> bool {
        let vol_clean = match self.vol_multiplier_override {
            Some(_) => Self::expired(self.vol_expiry, now),
            None => true,
        };
        self.effective_direction_bias(now).is_none() && vol_clean && self.effective_price_override(now).is_none()
    }
}

/// Per-user forced-outcome and target-win-rate state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserTarget {
    pub target_win_rate: Option<f64>,
    pub force_next_wins: u32,
    pub force_next_losses: u32,
}

/// Owning table for all per-symbol overlays and per-user targets. Guarded by
/// a single reader-preferring lock per map (spec.md §5) since updates are
/// cheap and rare relative to reads from the price generator / risk policy.
#[derive(Default)]
pub struct AdminControlPlane {
    overlays: RwLock<HashMap<String, ControlOverlay>>,
    targets: RwLock<HashMap<String, UserTarget>>,
}

impl AdminControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a snapshot of the overlay for `symbol`, or the default (empty)
    /// overlay if none has ever been set.
    pub fn overlay(&self, symbol: &str) -> ControlOverlay {
        self.overlays.read().get(symbol).cloned().unwrap_or_default()
    }

    pub fn set_direction_bias(
        &self,
        symbol: &str,
        bias: f64,
        strength: f64,
        duration: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) {
        let mut overlays = self.overlays.write();
        let entry = overlays.entry(symbol.to_string()).or_default();
        entry.direction_bias = Some(bias.clamp(-1.0, 1.0));
        entry.direction_strength = strength.clamp(0.0, 1.0);
        entry.direction_expiry = duration.map(|d| now + d);
    }

    pub fn clear_direction_bias(&self, symbol: &str) {
        let mut overlays = self.overlays.write();
        if let Some(entry) = overlays.get_mut(symbol) {
            entry.direction_bias = None;
            entry.direction_expiry = None;
        }
    }

    pub fn set_volatility(
        &self,
        symbol: &str,
        multiplier: f64,
        duration: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) {
        let mut overlays = self.overlays.write();
        let entry = overlays.entry(symbol.to_string()).or_default();
        entry.vol_multiplier_override = Some(multiplier.max(0.0));
        entry.vol_expiry = duration.map(|d| now + d);
    }

    pub fn clear_volatility(&self, symbol: &str) {
        let mut overlays = self.overlays.write();
        if let Some(entry) = overlays.get_mut(symbol) {
            entry.vol_multiplier_override = None;
            entry.vol_expiry = None;
        }
    }

    pub fn set_price_override(
        &self,
        symbol: &str,
        price: f64,
        duration: chrono::Duration,
        now: DateTime<Utc>,
    ) {
        let mut overlays = self.overlays.write();
        let entry = overlays.entry(symbol.to_string()).or_default();
        entry.price_override = Some(price);
        entry.price_override_expiry = Some(now + duration);
    }

    pub fn clear_price_override(&self, symbol: &str) {
        let mut overlays = self.overlays.write();
        if let Some(entry) = overlays.get_mut(symbol) {
            entry.price_override = None;
            entry.price_override_expiry = None;
        }
    }

    pub fn user_target(&self, user: &str) -> UserTarget {
        self.targets.read().get(user).cloned().unwrap_or_default()
    }

    pub fn set_user_target(
        &self,
        user: &str,
        target_win_rate: Option<f64>,
        force_next_wins: Option<u32>,
        force_next_losses: Option<u32>,
    ) {
        let mut targets = self.targets.write();
        let entry = targets.entry(user.to_string()).or_default();
        if let Some(w) = target_win_rate {
            entry.target_win_rate = Some(w.clamp(0.0, 1.0));
        }
        if let Some(w) = force_next_wins {
            entry.force_next_wins = w;
        }
        if let Some(l) = force_next_losses {
            entry.force_next_losses = l;
        }
    }

    pub fn clear_user_target(&self, user: &str) {
        self.targets.write().remove(user);
    }

    /// Decrement the forced-win counter for `user`, returning `true` if a
    /// forced win was consumed.
    pub fn consume_forced_win(&self, user: &str) -> bool {
        let mut targets = self.targets.write();
        if let Some(t) = targets.get_mut(user) {
            if t.force_next_wins > 0 {
                t.force_next_wins -= 1;
                return true;
            }
        }
        false
    }

    /// Decrement the forced-loss counter for `user`, returning `true` if a
    /// forced loss was consumed.
    pub fn consume_forced_loss(&self, user: &str) -> bool {
        let mut targets = self.targets.write();
        if let Some(t) = targets.get_mut(user) {
            if t.force_next_losses > 0 {
                t.force_next_losses -= 1;
                return true;
            }
        }
        false
    }

    /// Optional periodic cleanup (spec.md §4.G: "a periodic (>= 1 min)
    /// cleanup may clear clearly expired rows"). Drops overlay entries whose
    /// every field has expired; never required for correctness since every
    /// reader already checks expiry itself.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut overlays = self.overlays.write();
        let before = overlays.len();
        overlays.retain(|_, overlay| !overlay.is_clean(now));
        before - overlays.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_bias_expires() {
        let plane = AdminControlPlane::new();
        let now = Utc::now();
        plane.set_direction_bias("EUR/USD-OTC", 0.5, 0.8, Some(chrono::Duration::seconds(1)), now);
        let overlay = plane.overlay("EUR/USD-OTC");
        assert_eq!(overlay.effective_direction_bias(now), Some((0.5, 0.8)));
        assert_eq!(
            overlay.effective_direction_bias(now + chrono::Duration::seconds(2)),
            None
        );
    }

    #[test]
    fn price_override_roundtrip() {
        let plane = AdminControlPlane::new();
        let now = Utc::now();
        plane.set_price_override("EUR/USD-OTC", 1.2, chrono::Duration::minutes(15), now);
        assert_eq!(
            plane.overlay("EUR/USD-OTC").effective_price_override(now),
            Some(1.2)
        );
        plane.clear_price_override("EUR/USD-OTC");
        assert_eq!(plane.overlay("EUR/USD-OTC").effective_price_override(now), None);
    }

    #[test]
    fn forced_outcome_one_shot() {
        let plane = AdminControlPlane::new();
        plane.set_user_target("alice", None, Some(1), None);
        assert!(plane.consume_forced_win("alice"));
        assert!(!plane.consume_forced_win("alice"));
    }

    #[test]
    fn sweep_drops_fully_expired_overlay() {
        let plane = AdminControlPlane::new();
        let now = Utc::now();
        plane.set_price_override("EUR/USD-OTC", 1.2, chrono::Duration::seconds(1), now);
        let later = now + chrono::Duration::seconds(5);
        let dropped = plane.sweep_expired(later);
        assert_eq!(dropped, 1);
    }
}
