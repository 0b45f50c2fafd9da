// =============================================================================
// Real-feed adapter — spec.md §4.C
// =============================================================================
//
// Each base symbol (e.g. "EUR/USD") is fed from whichever of two sources most
// recently reported a price: a push subscriber (a websocket stream wired up
// in `main.rs`, following the same `tokio_tungstenite::connect_async` shape
// the rest of this codebase uses for outbound connections) or a 2-second
// HTTP polling fallback that only activates once the push side goes stale.
// Consumers never care which source produced a price; they just read
// `current_price` and get the freshest one observed either way.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Fetches a single real-market price for a base symbol. Boxed so the
/// adapter can hold one behind a trait object without an extra dependency
/// for async trait methods.
pub trait RealPriceFetcher: Send + Sync {
    fn fetch_price<'a>(&'a self, base: &'a str) -> Pin<Box<dyn Future<Output = anyhow::Result<f64>> + Send + 'a>>;
}

/// Polls a REST endpoint of the shape `{base_url}/{symbol}` returning a JSON
/// body with a top-level `price` field.
pub struct HttpRealPriceFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRealPriceFetcher {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self { client, base_url: base_url.into() })
    }
}

impl RealPriceFetcher for HttpRealPriceFetcher {
    fn fetch_price<'a>(&'a self, base: &'a str) -> Pin<Box<dyn Future<Output = anyhow::Result<f64>> + Send + 'a>> {
        Box::pin(async move {
            let symbol = base.replace('/', "");
            let url = format!("{}/{}", self.base_url, symbol);
            let body: serde_json::Value = self.client.get(&url).send().await?.error_for_status()?.json().await?;
            body.get("price")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| anyhow::anyhow!("response for {base} missing numeric `price` field"))
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    price: f64,
    observed_at: DateTime<Utc>,
}

/// Owns the latest observed real price per base symbol, from whichever
/// source reported it most recently.
pub struct FeedAdapter {
    fetcher: Arc<dyn RealPriceFetcher>,
    latest: RwLock<HashMap<String, Observation>>,
}

impl FeedAdapter {
    pub fn new(fetcher: Arc<dyn RealPriceFetcher>) -> Self {
        Self {
            fetcher,
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Record a price observation from the push side.
    pub fn push_update(&self, base: &str, price: f64, now: DateTime<Utc>) {
        self.latest.write().insert(base.to_string(), Observation { price, observed_at: now });
    }

    /// The freshest known real price for `base`, if any has ever been
    /// observed, along with how long ago it was seen.
    pub fn current_price(&self, base: &str, now: DateTime<Utc>) -> Option<(f64, chrono::Duration)> {
        self.latest.read().get(base).map(|obs| (obs.price, now - obs.observed_at))
    }

    /// Poll on a 2-second interval, only issuing an HTTP request when the
    /// push feed has gone stale beyond `max_staleness`. Runs until the
    /// process shuts down; spawn one per base symbol.
    pub async fn run_polling_fallback(self: Arc<Self>, base: String, max_staleness: Duration) {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let stale = match self.current_price(&base, now) {
                Some((_, age)) => age.to_std().unwrap_or(Duration::ZERO) > max_staleness,
                None => true,
            };
            if !stale {
                continue;
            }
            match self.fetcher.fetch_price(&base).await {
                Ok(price) => {
                    debug!(base, price, "polling fallback refreshed stale price");
                    self.push_update(&base, price, now);
                }
                Err(err) => {
                    warn!(base, error = %err, "polling fallback request failed");
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    base: String,
    price: f64,
}

/// Hold an outbound push connection open for as long as possible, applying
/// every `{base, price}` message received to the adapter. Reconnects with a
/// fixed backoff on any error or disconnect and runs until the process shuts
/// down — intended to be spawned once for the whole feed, independent of the
/// per-base polling fallback tasks.
pub async fn run_push_subscriber(adapter: Arc<FeedAdapter>, ws_url: String) {
    loop {
        match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((stream, _)) => {
                info!(url = %ws_url, "real-feed push connection established");
                let (_, mut read) = stream.split();
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => match serde_json::from_str::<PushMessage>(&text) {
                            Ok(update) => adapter.push_update(&update.base, update.price, Utc::now()),
                            Err(err) => warn!(error = %err, "malformed push message, ignoring"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "real-feed push connection error");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(url = %ws_url, error = %err, "failed to establish real-feed push connection");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedFetcher(f64);

    impl RealPriceFetcher for FixedFetcher {
        fn fetch_price<'a>(&'a self, _base: &'a str) -> Pin<Box<dyn Future<Output = anyhow::Result<f64>> + Send + 'a>> {
            let price = self.0;
            Box::pin(async move { Ok(price) })
        }
    }

    #[test]
    fn push_update_is_visible_immediately() {
        let adapter = FeedAdapter::new(Arc::new(FixedFetcher(1.1)));
        let now = Utc::now();
        adapter.push_update("EUR/USD", 1.2345, now);
        let (price, age) = adapter.current_price("EUR/USD", now).unwrap();
        assert_eq!(price, 1.2345);
        assert_eq!(age, chrono::Duration::zero());
    }

    #[test]
    fn unknown_base_has_no_price() {
        let adapter = FeedAdapter::new(Arc::new(FixedFetcher(1.1)));
        assert!(adapter.current_price("GBP/USD", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn polling_fallback_fills_in_when_stale() {
        let adapter = Arc::new(FeedAdapter::new(Arc::new(FixedFetcher(1.3))));
        let stale_time = Utc::now() - chrono::Duration::seconds(30);
        adapter.push_update("EUR/USD", 1.1, stale_time);

        let handle = tokio::spawn(adapter.clone().run_polling_fallback("EUR/USD".to_string(), Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(2200)).await;
        handle.abort();

        let (price, _) = adapter.current_price("EUR/USD", Utc::now()).unwrap();
        assert_eq!(price, 1.3);
    }
}
