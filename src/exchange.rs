// Exchange adapter: the capability surface the runner and hedger need from
// a venue, independent of its wire protocol. `SimExchange` is the in-memory
// reference implementation used by tests and dry-run operation; a real
// venue plugs in behind the same trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::feed::{FeedError, HistoricalFeed, PriceFeed, TopOfBook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    Filled,
    Canceled,
    PartiallyFilled,
}

#[derive(Debug, Clone, Copy)]
pub struct PerpOrderStatus {
    pub state: OrderState,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub side: Side,
}

#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub side: Side,
    pub filled_size: f64,
    pub filled_quote: f64,
}

/// Normalises the GTX post-only retry loop's outcome. Earlier revisions of
/// this protocol returned `(bool, float|str)` from one code path and a bare
/// unfilled-amount float from another; callers had to guess which shape
/// they'd gotten. One sum type, matched exhaustively, replaces both.
#[derive(Debug, Clone, Copy)]
pub enum GtxOutcome {
    Filled { avg_price: f64 },
    PartiallyFilled { unfilled: f64 },
    Aborted { unfilled: f64 },
}

impl GtxOutcome {
    pub fn unfilled(self) -> f64 {
        match self {
            GtxOutcome::Filled { .. } => 0.0,
            GtxOutcome::PartiallyFilled { unfilled } | GtxOutcome::Aborted { unfilled } => unfilled,
        }
    }
}

#[derive(Debug)]
pub enum OrderError {
    InvalidOrder(String),
    NetworkError(String),
    RateLimited,
    NotFound(String),
}

impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderError::InvalidOrder(m) => write!(f, "invalid order: {m}"),
            OrderError::NetworkError(m) => write!(f, "network error: {m}"),
            OrderError::RateLimited => write!(f, "rate limited"),
            OrderError::NotFound(id) => write!(f, "order not found: {id}"),
        }
    }
}

impl std::error::Error for OrderError {}

/// Capability set required by the core. Implemented once per venue; the
/// ladder venue and the hedge venue may be the same adapter or two
/// different ones.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn batch_place_limit(
        &self,
        symbol: &str,
        orders: &[(Side, f64, f64)],
        post_only: bool,
    ) -> Result<Vec<String>, OrderError>;

    async fn batch_query_fills(
        &self,
        symbol: &str,
        oids: &[String],
    ) -> Result<HashMap<String, Fill>, OrderError>;

    async fn batch_cancel(&self, symbol: &str, oids: &[String]) -> Result<bool, OrderError>;

    /// Succeeds only if every order on `symbol` individually reports status
    /// Canceled after the call.
    async fn cancel_all(&self, symbol: &str) -> Result<bool, OrderError>;

    async fn place_perp_market(&self, symbol: &str, side: Side, size: f64) -> Result<(bool, f64), OrderError>;

    async fn place_perp_gtx(&self, symbol: &str, side: Side, size: f64, max_try: u32) -> Result<GtxOutcome, OrderError>;

    async fn place_perp_trigger(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        trigger_price: f64,
    ) -> Result<String, OrderError>;

    async fn query_perp_order(&self, symbol: &str, oid: &str) -> Result<PerpOrderStatus, OrderError>;

    async fn cancel_perp_order(&self, symbol: &str, oid: &str) -> Result<bool, OrderError>;
}

#[derive(Debug, Clone)]
struct SimOrder {
    side: Side,
    size: f64,
    price: f64,
    state: OrderState,
    filled_size: f64,
}

#[derive(Debug)]
struct SimState {
    orders: HashMap<String, SimOrder>,
    trigger_orders: HashMap<String, SimOrder>,
    next_id: u64,
    mid_price: f64,
    position: f64,
}

/// In-memory adapter used by tests and shadow/dry-run operation. Orders rest
/// until a test or the harness around it (e.g. `mark_filled`) resolves them
/// — it does not simulate a matching engine.
pub struct SimExchange {
    state: Mutex<SimState>,
}

impl SimExchange {
    pub fn new(mid_price: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                orders: HashMap::new(),
                trigger_orders: HashMap::new(),
                next_id: 1,
                mid_price,
                position: 0.0,
            }),
        }
    }

    fn next_oid(state: &mut SimState) -> String {
        let id = state.next_id;
        state.next_id += 1;
        format!("sim-{id}")
    }

    pub fn set_mid_price(&self, price: f64) {
        self.state.lock().unwrap().mid_price = price;
    }

    pub fn position(&self) -> f64 {
        self.state.lock().unwrap().position
    }

    /// Test/shadow-mode hook: resolve a resting order as filled at `price`
    /// and apply its effect on the simulated perp position.
    pub fn mark_filled(&self, oid: &str, price: f64) {
        let mut state = self.state.lock().unwrap();
        let delta = if let Some(order) = state.orders.get_mut(oid) {
            order.state = OrderState::Filled;
            order.filled_size = order.size;
            match order.side {
                Side::Buy => order.size,
                Side::Sell => -order.size,
            }
        } else if let Some(order) = state.trigger_orders.get_mut(oid) {
            order.state = OrderState::Filled;
            order.filled_size = order.size;
            match order.side {
                Side::Buy => order.size,
                Side::Sell => -order.size,
            }
        } else {
            0.0
        };
        state.position += delta;
        state.mid_price = price;
    }

    pub fn trigger_order_status(&self, oid: &str) -> Option<(OrderState, f64)> {
        let state = self.state.lock().unwrap();
        state.trigger_orders.get(oid).map(|o| (o.state, o.price))
    }
}

#[async_trait]
impl ExchangeAdapter for SimExchange {
    async fn batch_place_limit(
        &self,
        _symbol: &str,
        orders: &[(Side, f64, f64)],
        _post_only: bool,
    ) -> Result<Vec<String>, OrderError> {
        let mut state = self.state.lock().unwrap();
        let mut oids = Vec::with_capacity(orders.len());
        for &(side, size, price) in orders {
            if size <= 0.0 || price <= 0.0 {
                continue;
            }
            let oid = Self::next_oid(&mut state);
            state.orders.insert(oid.clone(), SimOrder { side, size, price, state: OrderState::New, filled_size: 0.0 });
            oids.push(oid);
        }
        Ok(oids)
    }

    async fn batch_query_fills(&self, _symbol: &str, oids: &[String]) -> Result<HashMap<String, Fill>, OrderError> {
        let state = self.state.lock().unwrap();
        let mut fills = HashMap::new();
        for oid in oids {
            if let Some(order) = state.orders.get(oid) {
                if order.state == OrderState::Filled && order.filled_size > 0.0 {
                    fills.insert(oid.clone(), Fill {
                        side: order.side,
                        filled_size: order.filled_size,
                        filled_quote: order.filled_size * order.price,
                    });
                }
            }
        }
        Ok(fills)
    }

    async fn batch_cancel(&self, _symbol: &str, oids: &[String]) -> Result<bool, OrderError> {
        let mut state = self.state.lock().unwrap();
        for oid in oids {
            if let Some(order) = state.orders.get_mut(oid) {
                if order.state == OrderState::New {
                    order.state = OrderState::Canceled;
                }
            }
        }
        Ok(true)
    }

    async fn cancel_all(&self, _symbol: &str) -> Result<bool, OrderError> {
        let mut state = self.state.lock().unwrap();
        for order in state.orders.values_mut() {
            if order.state == OrderState::New {
                order.state = OrderState::Canceled;
            }
        }
        let all_canceled = state.orders.values().all(|o| o.state == OrderState::Canceled || o.state == OrderState::Filled);
        Ok(all_canceled)
    }

    async fn place_perp_market(&self, _symbol: &str, side: Side, size: f64) -> Result<(bool, f64), OrderError> {
        if size <= 0.0 {
            return Err(OrderError::InvalidOrder("size must be positive".into()));
        }
        let mut state = self.state.lock().unwrap();
        let price = state.mid_price;
        state.position += match side {
            Side::Buy => size,
            Side::Sell => -size,
        };
        Ok((true, price))
    }

    async fn place_perp_gtx(&self, symbol: &str, side: Side, size: f64, max_try: u32) -> Result<GtxOutcome, OrderError> {
        // The deterministic sim fills a GTX order immediately at the current
        // mid on the first attempt — there is no real order book to rest on.
        let _ = max_try;
        let (_, avg_price) = self.place_perp_market(symbol, side, size).await?;
        Ok(GtxOutcome::Filled { avg_price })
    }

    async fn place_perp_trigger(&self, _symbol: &str, side: Side, size: f64, trigger_price: f64) -> Result<String, OrderError> {
        if size <= 0.0 {
            return Err(OrderError::InvalidOrder("size must be positive".into()));
        }
        let mut state = self.state.lock().unwrap();
        let oid = Self::next_oid(&mut state);
        state.trigger_orders.insert(oid.clone(), SimOrder {
            side, size, price: trigger_price, state: OrderState::New, filled_size: 0.0,
        });
        Ok(oid)
    }

    async fn query_perp_order(&self, _symbol: &str, oid: &str) -> Result<PerpOrderStatus, OrderError> {
        let state = self.state.lock().unwrap();
        let order = state.trigger_orders.get(oid).or_else(|| state.orders.get(oid))
            .ok_or_else(|| OrderError::NotFound(oid.to_string()))?;
        Ok(PerpOrderStatus {
            state: order.state,
            executed_qty: order.filled_size,
            avg_price: order.price,
            side: order.side,
        })
    }

    async fn cancel_perp_order(&self, _symbol: &str, oid: &str) -> Result<bool, OrderError> {
        let mut state = self.state.lock().unwrap();
        if let Some(order) = state.trigger_orders.get_mut(oid) {
            if order.state == OrderState::New {
                order.state = OrderState::Canceled;
            }
            return Ok(true);
        }
        if let Some(order) = state.orders.get_mut(oid) {
            if order.state == OrderState::New {
                order.state = OrderState::Canceled;
            }
            return Ok(true);
        }
        // Idempotent: canceling an unknown order is not a failure.
        Ok(true)
    }
}

/// In dry-run/shadow operation the sim adapter also stands in as the price
/// source: its `mid_price` is both what fills settle at and what the
/// planner quotes around.
#[async_trait]
impl PriceFeed for SimExchange {
    async fn top_of_book(&self, _symbol: &str) -> Option<TopOfBook> {
        let mid = self.state.lock().unwrap().mid_price;
        Some(TopOfBook { bid: mid, ask: mid })
    }
}

#[async_trait]
impl HistoricalFeed for SimExchange {
    async fn fetch_recent_closes(&self, _symbol: &str, _window_secs: u64, limit: usize) -> Result<Vec<f64>, FeedError> {
        let mid = self.state.lock().unwrap().mid_price;
        Ok(vec![mid; limit.min(2)])
    }
}

/// Per-asset metadata pulled from the venue's `meta` endpoint: size decimals
/// (for rounding order quantities) and the maximum leverage the venue allows.
#[derive(Debug, Clone, Copy)]
struct AssetInfo {
    sz_decimals: u32,
}

/// Real Hyperliquid venue adapter: signs and posts L1 actions over the
/// `/exchange` REST endpoint, reads state from `/info`. Grounded in the
/// wire format `signing::sign_l1_action`/`sign_cancel_action` implement —
/// this is the thin HTTP layer around them.
pub struct LiveExchange {
    base_url: String,
    account_address: String,
    private_key: String,
    client: reqwest::Client,
    coin_to_asset: Mutex<HashMap<String, u32>>,
    asset_info: Mutex<HashMap<u32, AssetInfo>>,
}

impl LiveExchange {
    pub fn new(account_address: String, private_key: String) -> Self {
        Self {
            base_url: "https://api.hyperliquid.xyz".to_string(),
            account_address,
            private_key,
            client: reqwest::Client::new(),
            coin_to_asset: Mutex::new(HashMap::new()),
            asset_info: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches the asset universe once at startup so symbols can be mapped
    /// to the venue's integer asset indices.
    pub async fn init(&self) -> Result<(), OrderError> {
        let data = self.post_info(serde_json::json!({ "type": "meta" })).await?;
        let mut coin_to_asset = self.coin_to_asset.lock().unwrap();
        let mut asset_info = self.asset_info.lock().unwrap();
        if let Some(universe) = data["universe"].as_array() {
            for (i, asset) in universe.iter().enumerate() {
                if let Some(name) = asset["name"].as_str() {
                    let idx = i as u32;
                    coin_to_asset.insert(name.to_string(), idx);
                    let sz_decimals = asset["szDecimals"].as_u64().unwrap_or(4) as u32;
                    asset_info.insert(idx, AssetInfo { sz_decimals });
                }
            }
        }
        log::info!("loaded {} assets from venue universe", coin_to_asset.len());
        Ok(())
    }

    fn asset_idx(&self, symbol: &str) -> Result<u32, OrderError> {
        self.coin_to_asset.lock().unwrap().get(symbol).copied()
            .ok_or_else(|| OrderError::InvalidOrder(format!("unknown symbol: {symbol}")))
    }

    fn sz_decimals(&self, asset_idx: u32) -> u32 {
        self.asset_info.lock().unwrap().get(&asset_idx).map(|i| i.sz_decimals).unwrap_or(4)
    }

    async fn post_info(&self, payload: serde_json::Value) -> Result<serde_json::Value, OrderError> {
        let resp = self.client.post(format!("{}/info", self.base_url))
            .json(&payload).send().await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        if resp.status().as_u16() == 429 {
            return Err(OrderError::RateLimited);
        }
        resp.json().await.map_err(|e| OrderError::NetworkError(e.to_string()))
    }

    async fn post_exchange(
        &self,
        action: serde_json::Value,
        nonce: u64,
        signature: crate::signing::Signature,
    ) -> Result<serde_json::Value, OrderError> {
        let payload = serde_json::json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": serde_json::Value::Null,
        });
        let resp = self.client.post(format!("{}/exchange", self.base_url))
            .json(&payload).send().await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        if resp.status().as_u16() == 429 {
            return Err(OrderError::RateLimited);
        }
        let data: serde_json::Value = resp.json().await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        if data["status"].as_str() == Some("err") {
            let msg = data["response"].as_str().unwrap_or("unknown venue error").to_string();
            if msg.contains("rate limited") {
                return Err(OrderError::RateLimited);
            }
            return Err(OrderError::InvalidOrder(msg));
        }
        Ok(data)
    }

    fn next_nonce() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    async fn place_one(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        price: f64,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<String, OrderError> {
        let asset = self.asset_idx(symbol)?;
        let sz_decimals = self.sz_decimals(asset);
        let px_str = float_to_wire(round_to_5_sig_figs(price));
        let sz_str = float_to_wire(round_f64(size, sz_decimals as usize));
        let tif = if post_only { "Alo" } else { "Ioc" };
        let order = crate::signing::OrderRequest {
            asset,
            is_buy: side == Side::Buy,
            limit_px: px_str,
            sz: sz_str,
            reduce_only,
            order_type: crate::signing::OrderTypeWire::Limit(crate::signing::LimitOrderWire { tif: tif.to_string() }),
        };
        let action = crate::signing::ActionWire { r#type: "order".to_string(), orders: vec![order], grouping: "na".to_string() };
        let nonce = Self::next_nonce();
        let (sig, action_json) = sign_l1_action(&self.private_key, action, nonce).await?;
        let result = self.post_exchange(action_json, nonce, sig).await?;
        let statuses = result["response"]["data"]["statuses"].as_array().cloned().unwrap_or_default();
        let oid = statuses.first()
            .and_then(|s| s["resting"]["oid"].as_u64().or_else(|| s["filled"]["oid"].as_u64()))
            .ok_or_else(|| OrderError::InvalidOrder("venue did not return an order id".into()))?;
        Ok(oid.to_string())
    }
}

#[async_trait]
impl ExchangeAdapter for LiveExchange {
    async fn batch_place_limit(
        &self,
        symbol: &str,
        orders: &[(Side, f64, f64)],
        post_only: bool,
    ) -> Result<Vec<String>, OrderError> {
        let mut oids = Vec::with_capacity(orders.len());
        for &(side, size, price) in orders {
            match self.place_one(symbol, side, size, price, post_only, false).await {
                Ok(oid) => oids.push(oid),
                Err(e) => {
                    log::warn!("batch_place_limit: order rejected for {symbol}: {e}");
                    break;
                }
            }
        }
        Ok(oids)
    }

    async fn batch_query_fills(&self, symbol: &str, oids: &[String]) -> Result<HashMap<String, Fill>, OrderError> {
        let payload = serde_json::json!({ "type": "orderStatus", "user": self.account_address });
        let data = self.post_info(payload).await?;
        let mut fills = HashMap::new();
        for oid in oids {
            let order = &data["order"];
            if order["order"]["coin"].as_str() != Some(symbol) {
                continue;
            }
            if order["order"]["oid"].as_u64().map(|o| o.to_string()).as_deref() != Some(oid.as_str()) {
                continue;
            }
            let filled_size = order["order"]["origSz"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0)
                - order["order"]["sz"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
            if filled_size <= 0.0 {
                continue;
            }
            let price = order["order"]["limitPx"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
            let quote = filled_size * price;
            if quote <= 0.0 {
                continue;
            }
            let side = if order["order"]["side"].as_str() == Some("B") { Side::Buy } else { Side::Sell };
            fills.insert(oid.clone(), Fill { side, filled_size, filled_quote: quote });
        }
        Ok(fills)
    }

    async fn batch_cancel(&self, symbol: &str, oids: &[String]) -> Result<bool, OrderError> {
        let asset = self.asset_idx(symbol)?;
        let mut all_ok = true;
        for (i, oid) in oids.iter().enumerate() {
            let Ok(oid_num) = oid.parse::<u64>() else { continue };
            let nonce = Self::next_nonce() + i as u64;
            let (sig, action_json) = crate::signing::sign_cancel_action(&self.private_key, asset, oid_num, nonce).await?;
            if self.post_exchange(action_json, nonce, sig).await.is_err() {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    async fn cancel_all(&self, symbol: &str) -> Result<bool, OrderError> {
        let payload = serde_json::json!({ "type": "openOrders", "user": self.account_address });
        let data = self.post_info(payload).await?;
        let orders: Vec<serde_json::Value> = data.as_array().cloned().unwrap_or_default()
            .into_iter().filter(|o| o["coin"].as_str() == Some(symbol)).collect();
        if orders.is_empty() {
            return Ok(true);
        }
        let oids: Vec<String> = orders.iter().filter_map(|o| o["oid"].as_u64()).map(|o| o.to_string()).collect();
        let cancelled = self.batch_cancel(symbol, &oids).await?;

        let remaining = self.post_info(serde_json::json!({ "type": "openOrders", "user": self.account_address })).await?;
        let still_open = remaining.as_array().cloned().unwrap_or_default()
            .into_iter().any(|o| o["coin"].as_str() == Some(symbol) && oids.contains(&o["oid"].as_u64().unwrap_or(0).to_string()));
        Ok(cancelled && !still_open)
    }

    async fn place_perp_market(&self, symbol: &str, side: Side, size: f64) -> Result<(bool, f64), OrderError> {
        let mids = self.post_info(serde_json::json!({ "type": "allMids" })).await?;
        let mid = mids[symbol].as_str().and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| OrderError::InvalidOrder(format!("no mid price for {symbol}")))?;
        let aggressive = if side == Side::Buy { mid * 1.05 } else { mid * 0.95 };
        let oid = self.place_one(symbol, side, size, aggressive, false, false).await?;
        let status = self.query_perp_order(symbol, &oid).await?;
        Ok((status.state == OrderState::Filled, status.avg_price))
    }

    async fn place_perp_gtx(&self, symbol: &str, side: Side, size: f64, max_try: u32) -> Result<GtxOutcome, OrderError> {
        let start_position = match self.query_position(symbol).await {
            Ok(p) => p,
            Err(_) => return Ok(GtxOutcome::Aborted { unfilled: size }),
        };

        let mut unfilled = size;
        for _ in 0..max_try {
            let mids = self.post_info(serde_json::json!({ "type": "l2Book", "coin": symbol })).await?;
            let levels = if side == Side::Buy { &mids["levels"][0] } else { &mids["levels"][1] };
            let quote_price = levels[0]["px"].as_str().and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| OrderError::InvalidOrder("empty book".into()))?;

            if let Ok(oid) = self.place_one(symbol, side, unfilled, quote_price, true, false).await {
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                let _ = self.cancel_perp_order(symbol, &oid).await;
            }

            let current_position = self.query_position(symbol).await.unwrap_or(start_position);
            let signed_delta = match side {
                Side::Buy => current_position - start_position,
                Side::Sell => start_position - current_position,
            };
            unfilled = (size - signed_delta).max(0.0);
            if unfilled <= 1e-9 {
                return Ok(GtxOutcome::Filled { avg_price: quote_price });
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        Ok(GtxOutcome::PartiallyFilled { unfilled })
    }

    async fn place_perp_trigger(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        trigger_price: f64,
    ) -> Result<String, OrderError> {
        let asset = self.asset_idx(symbol)?;
        let sz_decimals = self.sz_decimals(asset);
        let order = crate::signing::OrderRequest {
            asset,
            is_buy: side == Side::Buy,
            limit_px: float_to_wire(round_to_5_sig_figs(trigger_price)),
            sz: float_to_wire(round_f64(size, sz_decimals as usize)),
            reduce_only: false,
            order_type: crate::signing::OrderTypeWire::Limit(crate::signing::LimitOrderWire { tif: "Gtc".to_string() }),
        };
        let action = crate::signing::ActionWire { r#type: "order".to_string(), orders: vec![order], grouping: "na".to_string() };
        let nonce = Self::next_nonce();
        let (sig, action_json) = sign_l1_action(&self.private_key, action, nonce).await?;
        let result = self.post_exchange(action_json, nonce, sig).await?;
        let oid = result["response"]["data"]["statuses"][0]["resting"]["oid"].as_u64()
            .ok_or_else(|| OrderError::InvalidOrder("trigger order placement did not rest".into()))?;
        Ok(oid.to_string())
    }

    async fn query_perp_order(&self, _symbol: &str, oid: &str) -> Result<PerpOrderStatus, OrderError> {
        let Ok(oid_num) = oid.parse::<u64>() else {
            return Err(OrderError::NotFound(oid.to_string()));
        };
        let data = self.post_info(serde_json::json!({ "type": "orderStatus", "user": self.account_address, "oid": oid_num })).await?;
        let order = &data["order"]["order"];
        let status_str = data["order"]["status"].as_str().unwrap_or("open");
        let state = match status_str {
            "filled" => OrderState::Filled,
            "canceled" => OrderState::Canceled,
            _ => OrderState::New,
        };
        Ok(PerpOrderStatus {
            state,
            executed_qty: order["origSz"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0)
                - order["sz"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0),
            avg_price: order["limitPx"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0),
            side: if order["side"].as_str() == Some("B") { Side::Buy } else { Side::Sell },
        })
    }

    async fn cancel_perp_order(&self, symbol: &str, oid: &str) -> Result<bool, OrderError> {
        let Ok(oid_num) = oid.parse::<u64>() else { return Ok(true) };
        let asset = self.asset_idx(symbol)?;
        let nonce = Self::next_nonce();
        let (sig, action_json) = crate::signing::sign_cancel_action(&self.private_key, asset, oid_num, nonce).await?;
        match self.post_exchange(action_json, nonce, sig).await {
            Ok(_) => Ok(true),
            Err(OrderError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

impl LiveExchange {
    async fn query_position(&self, symbol: &str) -> Result<f64, OrderError> {
        const RETRIES: u32 = 5;
        for attempt in 0..RETRIES {
            let data = self.post_info(serde_json::json!({ "type": "clearinghouseState", "user": self.account_address })).await;
            if let Ok(data) = data {
                if let Some(positions) = data["assetPositions"].as_array() {
                    for p in positions {
                        if p["position"]["coin"].as_str() == Some(symbol) {
                            let sz = p["position"]["szi"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
                            return Ok(sz);
                        }
                    }
                    return Ok(0.0);
                }
            }
            if attempt + 1 < RETRIES {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
        Err(OrderError::NetworkError("position query exhausted retries".into()))
    }
}

#[async_trait]
impl HistoricalFeed for LiveExchange {
    async fn fetch_recent_closes(&self, symbol: &str, window_secs: u64, limit: usize) -> Result<Vec<f64>, FeedError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let interval = if window_secs <= 60 { "1m" } else { "1h" };
        let start_ms = now_ms - (limit as i64) * (window_secs.max(1) as i64) * 1000;
        let payload = serde_json::json!({
            "type": "candleSnapshot",
            "req": { "coin": symbol, "interval": interval, "startTime": start_ms, "endTime": now_ms },
        });
        let data = self.post_info(payload).await.map_err(|e| FeedError::Decode(e.to_string()))?;
        let closes: Vec<f64> = data.as_array().cloned().unwrap_or_default()
            .into_iter()
            .filter_map(|c| c["c"].as_str().and_then(|s| s.parse::<f64>().ok()))
            .collect();
        Ok(closes)
    }
}

/// Matches the Python SDK's `float_to_wire`: round to 8 decimals, then strip
/// trailing zeros (the server re-msgpacks this exact string to verify the
/// signature, so the format must match byte-for-byte).
fn float_to_wire(x: f64) -> String {
    let rounded = format!("{x:.8}");
    if rounded.contains('.') {
        rounded.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        rounded
    }
}

fn round_f64(val: f64, decimals: usize) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (val * factor).round() / factor
}

fn round_to_5_sig_figs(val: f64) -> f64 {
    if val == 0.0 {
        return 0.0;
    }
    let d = (5 - 1 - val.abs().log10().floor() as i32).clamp(0, 10);
    let factor = 10_f64.powi(d);
    (val * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_wire_strips_trailing_zeros() {
        assert_eq!(float_to_wire(100.0), "100");
        assert_eq!(float_to_wire(1.50000000), "1.5");
        assert_eq!(float_to_wire(0.00100000), "0.001");
    }

    #[tokio::test]
    async fn cancel_all_on_empty_book_is_a_noop_success() {
        let exch = SimExchange::new(100.0);
        assert!(exch.cancel_all("SUI").await.unwrap());
    }

    #[tokio::test]
    async fn batch_cancel_is_idempotent_on_unknown_oid() {
        let exch = SimExchange::new(100.0);
        assert!(exch.batch_cancel("SUI", &["ghost".to_string()]).await.unwrap());
    }

    #[tokio::test]
    async fn gtx_fills_immediately_in_sim() {
        let exch = SimExchange::new(100.0);
        let outcome = exch.place_perp_gtx("SUI", Side::Buy, 5.0, 30).await.unwrap();
        match outcome {
            GtxOutcome::Filled { avg_price } => assert_eq!(avg_price, 100.0),
            _ => panic!("expected Filled"),
        }
        assert_eq!(exch.position(), 5.0);
    }

    #[tokio::test]
    async fn place_query_and_cancel_trigger_order() {
        let exch = SimExchange::new(100.0);
        let oid = exch.place_perp_trigger("SUI", Side::Sell, 5.0, 98.0).await.unwrap();
        let status = exch.query_perp_order("SUI", &oid).await.unwrap();
        assert_eq!(status.state, OrderState::New);

        exch.mark_filled(&oid, 98.0);
        let status = exch.query_perp_order("SUI", &oid).await.unwrap();
        assert_eq!(status.state, OrderState::Filled);
        assert_eq!(status.executed_qty, 5.0);
    }

    #[tokio::test]
    async fn cancel_all_succeeds_only_when_every_order_is_canceled_or_filled() {
        let exch = SimExchange::new(100.0);
        let oids = exch.batch_place_limit("SUI", &[(Side::Buy, 1.0, 99.0), (Side::Sell, 1.0, 101.0)], true).await.unwrap();
        assert_eq!(oids.len(), 2);
        assert!(exch.cancel_all("SUI").await.unwrap());
        for oid in &oids {
            let status = exch.query_perp_order("SUI", oid).await.unwrap();
            assert_eq!(status.state, OrderState::Canceled);
        }
    }
}
