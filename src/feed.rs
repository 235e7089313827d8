// Feed: pushes a live mid/aggregate price and top-of-book snapshot for the
// trading symbol (and the hedge symbol), plus the historical-kline
// bootstrap the volatility monitor needs on startup. The wire protocol to
// any specific venue is an injected service behind the two traits below;
// `WsPriceFeed` is a venue-agnostic reference transport used in tests and
// as a template for a real one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

pub type StallFlag = Arc<AtomicBool>;

pub fn new_stall_flag() -> StallFlag {
    Arc::new(AtomicBool::new(false))
}

#[derive(Debug, Clone, Copy)]
pub struct TopOfBook {
    pub bid: f64,
    pub ask: f64,
}

impl TopOfBook {
    pub fn mid_price(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Latest top-of-book per symbol, written by the feed task and read by
/// everyone else. Each entry is replaced wholesale on update — torn reads
/// are tolerable since a stale-but-coherent snapshot is still usable for a
/// single round.
#[derive(Default)]
pub struct MarketDataBuffer {
    books: Mutex<HashMap<String, TopOfBook>>,
    last_update: Mutex<HashMap<String, Instant>>,
}

impl MarketDataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, book: TopOfBook) {
        self.books.lock().unwrap().insert(symbol.to_string(), book);
        self.last_update.lock().unwrap().insert(symbol.to_string(), Instant::now());
    }

    pub fn top_of_book(&self, symbol: &str) -> Option<TopOfBook> {
        self.books.lock().unwrap().get(symbol).copied()
    }

    pub fn is_stalled(&self, symbol: &str, timeout: Duration) -> bool {
        match self.last_update.lock().unwrap().get(symbol) {
            Some(t) => t.elapsed() >= timeout,
            None => true,
        }
    }
}

#[derive(Debug)]
pub enum FeedError {
    ConnectFailed(String),
    Decode(String),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::ConnectFailed(m) => write!(f, "feed connect failed: {m}"),
            FeedError::Decode(m) => write!(f, "feed decode error: {m}"),
        }
    }
}

impl std::error::Error for FeedError {}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn top_of_book(&self, symbol: &str) -> Option<TopOfBook>;
}

/// External collaborator: fetches recent closing prices at a fixed
/// granularity. Out of scope beyond this interface — a concrete client
/// talks to whatever historical-kline endpoint the venue exposes.
#[async_trait]
pub trait HistoricalFeed: Send + Sync {
    async fn fetch_recent_closes(&self, symbol: &str, window_secs: u64, limit: usize) -> Result<Vec<f64>, FeedError>;
}

#[derive(Debug, Deserialize)]
struct WireTick {
    symbol: String,
    bid: f64,
    ask: f64,
}

/// Reference websocket transport: connects to `url`, expects newline-
/// delimited `{symbol, bid, ask}` JSON ticks, and reconnects with backoff
/// on disconnect. A real venue adapter would replace the wire schema but
/// keep this reconnect/stall shape.
pub struct WsPriceFeed {
    buffer: Arc<MarketDataBuffer>,
    stall: StallFlag,
}

impl WsPriceFeed {
    pub fn new(buffer: Arc<MarketDataBuffer>, stall: StallFlag) -> Self {
        Self { buffer, stall }
    }

    /// Runs until `is_closed` is set; retries the connection up to 1000
    /// times with 0.5s backoff between attempts, matching the reconnect
    /// budget the rest of this stack uses for venue websockets.
    pub async fn connect_and_listen(&self, url: &str, is_closed: StallFlag) -> Result<(), FeedError> {
        const MAX_RETRIES: u32 = 1000;
        const BACKOFF: Duration = Duration::from_millis(500);
        const STALL_TIMEOUT: Duration = Duration::from_secs(30);

        let mut attempt = 0;
        while attempt < MAX_RETRIES {
            if is_closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            attempt += 1;
            match connect_async(url).await {
                Ok((mut ws, _)) => {
                    self.stall.store(false, Ordering::SeqCst);
                    attempt = 0;
                    loop {
                        if is_closed.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        match tokio::time::timeout(STALL_TIMEOUT, ws.next()).await {
                            Ok(Some(Ok(Message::Text(text)))) => {
                                if let Ok(tick) = serde_json::from_str::<WireTick>(&text) {
                                    self.buffer.update(&tick.symbol, TopOfBook { bid: tick.bid, ask: tick.ask });
                                }
                            }
                            Ok(Some(Ok(_))) => {}
                            Ok(Some(Err(e))) => {
                                log::warn!("feed ws error: {e}, reconnecting");
                                break;
                            }
                            Ok(None) => break,
                            Err(_) => {
                                self.stall.store(true, Ordering::SeqCst);
                                log::warn!("feed stalled for {STALL_TIMEOUT:?}");
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("feed connect attempt {attempt} failed: {e}");
                    tokio::time::sleep(BACKOFF).await;
                }
            }
        }
        Err(FeedError::ConnectFailed(format!("exhausted {MAX_RETRIES} reconnect attempts")))
    }
}

#[async_trait]
impl PriceFeed for WsPriceFeed {
    async fn top_of_book(&self, symbol: &str) -> Option<TopOfBook> {
        self.buffer.top_of_book(symbol)
    }
}

/// Rejects a price tick if it diverges from the trusted mid by 2% or more,
/// or if either input is missing.
pub fn price_security_check(aggregate_price: Option<f64>, mid_price: Option<f64>) -> bool {
    match (aggregate_price, mid_price) {
        (Some(aggr), Some(mid)) if mid > 0.0 => (aggr - mid).abs() / mid < 0.02,
        _ => false,
    }
}

/// Bounded FIFO of closing prices feeding the volatility estimator.
/// Bootstrapped from `HistoricalFeed`, then grown one tick at a time.
pub struct PriceHistory {
    capacity: usize,
    prices: VecDeque<f64>,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, prices: VecDeque::with_capacity(capacity) }
    }

    pub fn bootstrap(&mut self, closes: Vec<f64>) {
        self.prices.clear();
        for p in closes.into_iter().rev().take(self.capacity).collect::<Vec<_>>().into_iter().rev() {
            self.prices.push_back(p);
        }
    }

    pub fn push(&mut self, price: f64) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    pub fn as_slice(&self) -> Vec<f64> {
        self.prices.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_security_check_rejects_large_divergence() {
        assert!(price_security_check(Some(100.0), Some(100.5)));
        assert!(!price_security_check(Some(100.0), Some(102.5)));
        assert!(!price_security_check(None, Some(100.0)));
        assert!(!price_security_check(Some(100.0), None));
    }

    #[test]
    fn price_history_is_bounded_fifo() {
        let mut hist = PriceHistory::new(3);
        hist.bootstrap(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(hist.as_slice(), vec![2.0, 3.0, 4.0]);
        hist.push(5.0);
        assert_eq!(hist.as_slice(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn market_data_buffer_reports_stale_symbols_as_stalled() {
        let buf = MarketDataBuffer::new();
        assert!(buf.is_stalled("SUI", Duration::from_millis(1)));
        buf.update("SUI", TopOfBook { bid: 99.0, ask: 101.0 });
        assert!(!buf.is_stalled("SUI", Duration::from_secs(30)));
        assert_eq!(buf.top_of_book("SUI").unwrap().mid_price(), 100.0);
    }
}
