// =============================================================================
// Settlement dispatcher — spec.md §4.F
// =============================================================================
//
// A single task owns a time-ordered queue of pending expirations and wakes
// either when a new position is scheduled or when the soonest expiration is
// due, firing settlements within ~50ms of their nominal expiry. Positions
// are scheduled by sending a `ScheduleEntry` over an unbounded channel from
// wherever a trade is placed; nothing else touches the queue directly.
//
// On restart, any OPEN position whose `expires_at` has already passed (a
// crash mid-flight, or a missed timer) is caught by `recover_stale`, which
// the caller runs once at startup before the dispatcher task is spawned.
// =============================================================================

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::positions::PositionBook;

#[derive(Debug, Clone, Copy)]
pub struct ScheduleEntry {
    pub position_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

pub type ScheduleSender = mpsc::UnboundedSender<ScheduleEntry>;
pub type ScheduleReceiver = mpsc::UnboundedReceiver<ScheduleEntry>;

pub fn channel() -> (ScheduleSender, ScheduleReceiver) {
    mpsc::unbounded_channel()
}

/// Whatever owns the position/exposure/risk state settlement needs; kept
/// generic so the dispatcher loop can be unit tested without standing up the
/// whole `AppState`.
pub trait SettlementSink: Send + Sync + 'static {
    fn settle_due(&self, position_id: Uuid) -> impl std::future::Future<Output = ()> + Send;
}

const FALLBACK_WAKE: Duration = Duration::from_secs(3600);

async fn sleep_until_due(target: Option<DateTime<Utc>>) {
    match target {
        None => tokio::time::sleep(FALLBACK_WAKE).await,
        Some(t) => {
            let remaining = (t - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Run the dispatcher loop until the schedule channel is closed. Intended to
/// be spawned as its own task for the lifetime of the process.
pub async fn run_dispatcher<S: SettlementSink>(mut rx: ScheduleReceiver, sink: std::sync::Arc<S>) {
    let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>> = BinaryHeap::new();

    loop {
        let next_due = heap.peek().map(|Reverse((t, _))| *t);
        tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(entry) => {
                        debug!(position_id = %entry.position_id, "scheduled settlement");
                        heap.push(Reverse((entry.expires_at, entry.position_id)));
                    }
                    None => {
                        warn!("settlement schedule channel closed, dispatcher shutting down");
                        break;
                    }
                }
            }
            _ = sleep_until_due(next_due) => {
                let now = Utc::now();
                while let Some(&Reverse((t, _))) = heap.peek() {
                    if t > now {
                        break;
                    }
                    let Reverse((_, id)) = heap.pop().expect("peek succeeded");
                    sink.settle_due(id).await;
                }
            }
        }
    }
}

/// Settle every OPEN position already past its expiry at startup, before the
/// dispatcher task begins accepting new schedule entries.
pub async fn recover_stale<S: SettlementSink>(position_book: &PositionBook, sink: &S, now: DateTime<Utc>) -> usize {
    let due = position_book.open_positions_due_by(now);
    let count = due.len();
    if count > 0 {
        warn!(count, "recovering stale open positions on startup");
    }
    for position in due {
        sink.settle_due(position.id).await;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct RecordingSink {
        settled: Mutex<Vec<Uuid>>,
    }

    impl SettlementSink for RecordingSink {
        async fn settle_due(&self, position_id: Uuid) {
            self.settled.lock().await.push(position_id);
        }
    }

    #[tokio::test]
    async fn fires_entries_in_expiry_order() {
        let (tx, rx) = channel();
        let sink = Arc::new(RecordingSink { settled: Mutex::new(Vec::new()) });
        let dispatcher_sink = sink.clone();
        let handle = tokio::spawn(run_dispatcher(rx, dispatcher_sink));

        let now = Utc::now();
        let later = Uuid::new_v4();
        let sooner = Uuid::new_v4();
        tx.send(ScheduleEntry { position_id: later, expires_at: now + chrono::Duration::milliseconds(120) })
            .unwrap();
        tx.send(ScheduleEntry { position_id: sooner, expires_at: now + chrono::Duration::milliseconds(20) })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(tx);
        let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;

        let settled = sink.settled.lock().await.clone();
        assert_eq!(settled, vec![sooner, later]);
    }

    #[tokio::test]
    async fn recover_stale_settles_overdue_open_positions() {
        let book = PositionBook::new();
        let now = Utc::now();
        let pos = crate::positions::Position::open(
            "alice",
            "EUR/USD-OTC",
            crate::types::Direction::Up,
            crate::types::AccountKind::Real,
            10.0,
            85.0,
            1.1,
            now - chrono::Duration::minutes(10),
            now - chrono::Duration::minutes(5),
        );
        book.insert_open(pos);

        let sink = RecordingSink { settled: Mutex::new(Vec::new()) };
        let count = recover_stale(&book, &sink, now).await;
        assert_eq!(count, 1);
        assert_eq!(sink.settled.lock().await.len(), 1);
    }
}
