// =============================================================================
// Subscription bus — spec.md §4.H
// =============================================================================
//
// Two distinct delivery guarantees live side by side here. Ticks are
// high-frequency and a slow WebSocket client catching up on a backlog is
// worse than that client missing a few intermediate prices, so ticks fan out
// over a lossy `tokio::sync::broadcast` topic per symbol. Settlements are
// rare and must never be silently dropped, so each subscriber gets its own
// unbounded mpsc queue instead.
//
// `ConnectionHeartbeat` is the small piece of state each WebSocket handler
// keeps to implement the 30s heartbeat / 3-miss disconnect rule; it has no
// opinion on the transport itself.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::price_generator::Tick;
use crate::types::SettlementResult;

const TICK_TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SettlementEvent {
    pub position_id: uuid::Uuid,
    pub symbol: String,
    pub user_id: String,
    pub result: SettlementResult,
    pub exit_price: f64,
    pub payout: f64,
    pub settled_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
pub struct Bus {
    ticks: RwLock<HashMap<String, broadcast::Sender<Tick>>>,
    settlement_subs: RwLock<HashMap<String, mpsc::UnboundedSender<SettlementEvent>>>,
    admin_subs: RwLock<Vec<mpsc::UnboundedSender<SettlementEvent>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the lossy tick topic for `symbol`, creating it on first
    /// use.
    pub fn subscribe_ticks(&self, symbol: &str) -> broadcast::Receiver<Tick> {
        let mut topics = self.ticks.write();
        topics
            .entry(symbol.to_string())
            .or_insert_with(|| broadcast::channel(TICK_TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publish a tick to its symbol's topic. A no-op if nobody is subscribed.
    pub fn publish_tick(&self, tick: Tick) {
        let topics = self.ticks.read();
        if let Some(sender) = topics.get(&tick.symbol) {
            // Err only means there are currently zero receivers; dropping the
            // tick in that case is correct, not an error condition.
            let _ = sender.send(tick);
        }
    }

    /// Register a user's settlement queue, replacing any previous one for
    /// the same user (a reconnect supersedes the old connection).
    pub fn subscribe_settlements(&self, user_id: &str) -> mpsc::UnboundedReceiver<SettlementEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.settlement_subs.write().insert(user_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe_settlements(&self, user_id: &str) {
        self.settlement_subs.write().remove(user_id);
    }

    /// Register an admin connection to receive every settlement across every
    /// user, independent of the per-user queues above.
    pub fn subscribe_admin_settlements(&self) -> mpsc::UnboundedReceiver<SettlementEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.admin_subs.write().push(tx);
        rx
    }

    /// Deliver a settlement to its owning user (if still subscribed) and to
    /// every admin subscriber. Dead admin senders are pruned opportunistically.
    pub fn publish_settlement(&self, event: SettlementEvent) {
        if let Some(sender) = self.settlement_subs.read().get(&event.user_id) {
            if sender.send(event.clone()).is_err() {
                trace!(user_id = %event.user_id, "settlement subscriber gone, dropping queue on next write");
            }
        }
        let mut admins = self.admin_subs.write();
        admins.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

/// Per-connection heartbeat tracker: a client is expected to ping (or the
/// server is expected to receive *some* activity) at least once per
/// interval; missing three consecutive intervals disconnects it.
pub struct ConnectionHeartbeat {
    interval: Duration,
    max_missed: u32,
    last_seen: Instant,
    missed: u32,
}

impl ConnectionHeartbeat {
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 3,
            last_seen: Instant::now(),
            missed: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn note_activity(&mut self) {
        self.last_seen = Instant::now();
        self.missed = 0;
    }

    /// Call once per `interval` tick. Returns `false` once the connection has
    /// exceeded `max_missed` consecutive silent intervals and should be
    /// closed.
    pub fn tick(&mut self) -> bool {
        if self.last_seen.elapsed() >= self.interval {
            self.missed += 1;
        }
        self.missed < self.max_missed
    }
}

impl Default for ConnectionHeartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceMode;

    fn sample_tick(symbol: &str) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price: 1.1,
            bid: 1.0995,
            ask: 1.1005,
            mode: PriceMode::Synthetic,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn tick_subscriber_receives_published_tick() {
        let bus = Bus::new();
        let mut rx = bus.subscribe_ticks("EUR/USD-OTC");
        bus.publish_tick(sample_tick("EUR/USD-OTC"));
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.symbol, "EUR/USD-OTC");
    }

    #[test]
    fn settlement_reaches_owning_user_and_admin() {
        let bus = Bus::new();
        let mut user_rx = bus.subscribe_settlements("alice");
        let mut admin_rx = bus.subscribe_admin_settlements();
        let event = SettlementEvent {
            position_id: uuid::Uuid::new_v4(),
            symbol: "EUR/USD-OTC".into(),
            user_id: "alice".into(),
            result: SettlementResult::Won,
            exit_price: 1.101,
            payout: 185.0,
            settled_at: chrono::Utc::now(),
        };
        bus.publish_settlement(event);
        assert!(user_rx.try_recv().is_ok());
        assert!(admin_rx.try_recv().is_ok());
    }

    #[test]
    fn heartbeat_disconnects_after_three_missed_intervals() {
        let mut hb = ConnectionHeartbeat {
            interval: Duration::from_millis(1),
            max_missed: 3,
            last_seen: Instant::now() - Duration::from_millis(10),
            missed: 0,
        };
        assert!(hb.tick());
        assert!(hb.tick());
        assert!(!hb.tick());
    }
}
