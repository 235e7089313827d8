// Ladder planner: turns (price, inventory, quote, volatility) into a
// two-sided ladder of resting limit orders. Four variants share the same
// inventory-skew math and bin geometry and differ only in how they size
// each bin — see `compute_spot_bins`/`compute_curve_bins`/
// `compute_bidask_bins` below, and `AutoStrategy` which dispatches across
// them by measured volatility.

use std::fmt;

#[derive(Debug, Clone, Copy)]
pub struct LadderConfig {
    pub price_up_pct_limit: f64,
    pub price_down_pct_limit: f64,
    pub bin_step_bps: f64,
    pub live_order_nums: usize,
    pub min_order_size: f64,
    pub max_order_size: f64,
    pub iqv_up_limit: f64,
    pub iqv_down_limit: f64,
    pub inventory_rb_iqv_ratio: f64,
    pub quote_rb_iqv_ratio: f64,
}

impl LadderConfig {
    fn step_ratio(&self) -> f64 {
        self.bin_step_bps / 10_000.0
    }

    pub fn ask_bin_nums(&self) -> usize {
        (self.price_up_pct_limit / self.step_ratio()).floor() as usize
    }

    pub fn bid_bin_nums(&self) -> usize {
        (self.price_down_pct_limit / self.step_ratio()).floor() as usize
    }

    pub fn max_bins_per_side(&self) -> usize {
        self.live_order_nums / 2
    }
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            price_up_pct_limit: 0.02,
            price_down_pct_limit: 0.02,
            bin_step_bps: 40.0,
            live_order_nums: 10,
            min_order_size: 0.1,
            max_order_size: 5.0,
            iqv_up_limit: 0.6,
            iqv_down_limit: -0.6,
            inventory_rb_iqv_ratio: 0.3,
            quote_rb_iqv_ratio: -0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PortfolioState {
    pub init_price: f64,
    pub init_inventory: f64,
    pub init_quote: f64,
    pub init_iqv_ratio: f64,
    pub cur_price: f64,
    pub cur_inventory: f64,
    pub cur_quote: f64,
    pub iqv_ratio: f64,
    pub iqv_move_ratio: f64,
}

#[derive(Debug)]
pub enum StrategyError {
    NonPositivePrice(f64),
    NonFiniteValue,
    ZeroInitIqvRatio,
}

impl fmt::Display for StrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyError::NonPositivePrice(p) => write!(f, "non-positive price: {p}"),
            StrategyError::NonFiniteValue => write!(f, "NaN/infinite value in portfolio math"),
            StrategyError::ZeroInitIqvRatio => write!(f, "init_iqv_ratio is zero, cannot derive iqv_move_ratio"),
        }
    }
}

impl std::error::Error for StrategyError {}

impl PortfolioState {
    pub fn new(init_price: f64, init_inventory: f64, init_quote: f64) -> Result<Self, StrategyError> {
        if init_price <= 0.0 {
            return Err(StrategyError::NonPositivePrice(init_price));
        }
        let init_value = init_inventory * init_price;
        let init_iqv_ratio = init_value / (init_value + init_quote);
        if !init_iqv_ratio.is_finite() {
            return Err(StrategyError::NonFiniteValue);
        }
        let mut state = Self {
            init_price,
            init_inventory,
            init_quote,
            init_iqv_ratio,
            cur_price: init_price,
            cur_inventory: init_inventory,
            cur_quote: init_quote,
            iqv_ratio: init_iqv_ratio,
            iqv_move_ratio: 0.0,
        };
        state.recompute()?;
        Ok(state)
    }

    /// Refreshes `cur_*` and the derived IQV ratios from fresh readings.
    pub fn update(&mut self, price: f64, inventory: f64, quote: f64) -> Result<(), StrategyError> {
        if price <= 0.0 {
            return Err(StrategyError::NonPositivePrice(price));
        }
        self.cur_price = price;
        self.cur_inventory = inventory;
        self.cur_quote = quote;
        self.recompute()
    }

    fn recompute(&mut self) -> Result<(), StrategyError> {
        if self.init_iqv_ratio == 0.0 {
            return Err(StrategyError::ZeroInitIqvRatio);
        }
        let value = self.cur_inventory * self.cur_price;
        self.iqv_ratio = value / (value + self.cur_quote);
        self.iqv_move_ratio = (self.iqv_ratio - self.init_iqv_ratio) / self.init_iqv_ratio;
        if !self.iqv_ratio.is_finite() || !self.iqv_move_ratio.is_finite() {
            return Err(StrategyError::NonFiniteValue);
        }
        Ok(())
    }
}

/// Inventory-skew kernel shared by every variant: cuts bid sizing as the
/// portfolio drifts long, floor at `iqv_up_limit`.
pub fn buy_mul(iqv_move: f64, inventory_rb: f64, iqv_up: f64) -> f64 {
    if iqv_move <= inventory_rb {
        1.0
    } else if iqv_move >= iqv_up {
        0.0
    } else {
        1.0 - (iqv_move - inventory_rb) / (iqv_up - inventory_rb)
    }
}

/// Symmetric kernel cutting ask sizing as the portfolio drifts short.
pub fn sell_mul(iqv_move: f64, quote_rb: f64, iqv_down: f64) -> f64 {
    if iqv_move >= quote_rb {
        1.0
    } else if iqv_move <= iqv_down {
        0.0
    } else {
        1.0 - (quote_rb - iqv_move) / (quote_rb - iqv_down)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bin {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Ladder {
    /// Descending in price.
    pub bids: Vec<Bin>,
    /// Ascending in price.
    pub asks: Vec<Bin>,
}

impl Ladder {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Enumerates `bin_nums` price levels off `anchor_price`, calling `size_of`
/// for the pre-clamp raw size at each level. A raw size `<= 0` skips the
/// bin (the skew multiplier zeroed it out); a positive raw size is clamped
/// into `[min_size, max_size]` before being emitted. Stops once `max_bins`
/// bins have been emitted on this side.
fn build_side(
    bin_nums: usize,
    step_ratio: f64,
    anchor_price: f64,
    ascending: bool,
    max_bins: usize,
    min_size: f64,
    max_size: f64,
    mut size_of: impl FnMut(usize, f64) -> f64,
) -> Vec<Bin> {
    let mut bins = Vec::new();
    for i in 0..bin_nums {
        let offset = (i + 1) as f64 * step_ratio * anchor_price;
        let price = if ascending { anchor_price + offset } else { anchor_price - offset };
        let raw = size_of(i, price);
        if raw > 0.0 {
            let size = raw.clamp(min_size, max_size);
            bins.push(Bin { price, size });
        }
        if bins.len() >= max_bins {
            break;
        }
    }
    bins
}

fn skew_muls(cfg: &LadderConfig, iqv_move: f64) -> (f64, f64) {
    (
        buy_mul(iqv_move, cfg.inventory_rb_iqv_ratio, cfg.iqv_up_limit),
        sell_mul(iqv_move, cfg.quote_rb_iqv_ratio, cfg.iqv_down_limit),
    )
}

/// Uniform split across all bins on a side.
pub fn compute_spot_bins(cfg: &LadderConfig, portfolio: &PortfolioState) -> Ladder {
    let price = portfolio.cur_price;
    let step_ratio = cfg.step_ratio();
    let (bmul, smul) = skew_muls(cfg, portfolio.iqv_move_ratio);
    let max_bins = cfg.max_bins_per_side();

    let base_bid = (portfolio.cur_quote / price) / cfg.bid_bin_nums() as f64;
    let base_ask = portfolio.cur_inventory / cfg.ask_bin_nums() as f64;

    let bids = build_side(
        cfg.bid_bin_nums(), step_ratio, price, false, max_bins,
        cfg.min_order_size, cfg.max_order_size,
        |_, _| base_bid * bmul,
    );
    let asks = build_side(
        cfg.ask_bin_nums(), step_ratio, price, true, max_bins,
        cfg.min_order_size, cfg.max_order_size,
        |_, _| base_ask * smul,
    );
    Ladder { bids, asks }
}

/// Geometric decay sizing normalised to exhaust the available balance.
pub fn compute_curve_bins(cfg: &LadderConfig, portfolio: &PortfolioState, decay_rate: f64) -> Ladder {
    let price = portfolio.cur_price;
    let step_ratio = cfg.step_ratio();
    let (bmul, smul) = skew_muls(cfg, portfolio.iqv_move_ratio);
    let max_bins = cfg.max_bins_per_side();

    let bid_n = cfg.bid_bin_nums();
    let ask_n = cfg.ask_bin_nums();
    let bid_decay_sum: f64 = (0..bid_n).map(|i| decay_rate.powi(i as i32)).sum();
    let ask_decay_sum: f64 = (0..ask_n).map(|i| decay_rate.powi(i as i32)).sum();

    let max_bid = if bid_decay_sum > 0.0 { (portfolio.cur_quote / price) / bid_decay_sum } else { 0.0 };
    let max_ask = if ask_decay_sum > 0.0 { portfolio.cur_inventory / ask_decay_sum } else { 0.0 };

    let bids = build_side(
        bid_n, step_ratio, price, false, max_bins,
        cfg.min_order_size, cfg.max_order_size,
        |i, _| max_bid * decay_rate.powi(i as i32) * bmul,
    );
    let asks = build_side(
        ask_n, step_ratio, price, true, max_bins,
        cfg.min_order_size, cfg.max_order_size,
        |i, _| max_ask * decay_rate.powi(i as i32) * smul,
    );
    Ladder { bids, asks }
}

/// Inverse-geometric weighting concentrating liquidity at the far ends of
/// the ladder.
pub fn compute_bidask_bins(cfg: &LadderConfig, portfolio: &PortfolioState, decay_rate: f64) -> Ladder {
    const EPSILON: f64 = 1e-6;
    let price = portfolio.cur_price;
    let step_ratio = cfg.step_ratio();
    let (bmul, smul) = skew_muls(cfg, portfolio.iqv_move_ratio);
    let max_bins = cfg.max_bins_per_side();

    let bid_n = cfg.bid_bin_nums();
    let ask_n = cfg.ask_bin_nums();
    let weight = |i: usize, decay: f64| 1.0 / (decay.powi(i as i32 + 1) + EPSILON);
    let bid_weight_sum: f64 = (0..bid_n).map(|i| weight(i, decay_rate)).sum();
    let ask_weight_sum: f64 = (0..ask_n).map(|i| weight(i, decay_rate)).sum();

    let bids = build_side(
        bid_n, step_ratio, price, false, max_bins,
        cfg.min_order_size, cfg.max_order_size,
        |i, bid_price| {
            let w = weight(i, decay_rate) / bid_weight_sum;
            portfolio.cur_quote * w / bid_price * bmul
        },
    );
    let asks = build_side(
        ask_n, step_ratio, price, true, max_bins,
        cfg.min_order_size, cfg.max_order_size,
        |i, _| {
            let w = weight(i, decay_rate) / ask_weight_sum;
            portfolio.cur_inventory * w * smul
        },
    );
    Ladder { bids, asks }
}

pub trait Strategy: Send {
    fn compute_current_bins(&mut self, current_price: f64, cur_inventory_amount: f64, cur_quote_amount: f64) -> Ladder;
    fn update_vol(&mut self, _vol: f64) {}
    fn iqv_move_ratio(&self) -> f64;
}

macro_rules! refresh_or_empty {
    ($self:ident, $price:ident, $inv:ident, $quote:ident) => {
        if let Err(e) = $self.portfolio.update($price, $inv, $quote) {
            log::error!("strategy: invariant violation refreshing portfolio state: {e}");
            return Ladder::empty();
        }
    };
}

pub struct SpotStrategy {
    pub config: LadderConfig,
    pub portfolio: PortfolioState,
}

impl SpotStrategy {
    pub fn new(config: LadderConfig, portfolio: PortfolioState) -> Self {
        Self { config, portfolio }
    }
}

impl Strategy for SpotStrategy {
    fn compute_current_bins(&mut self, current_price: f64, cur_inventory_amount: f64, cur_quote_amount: f64) -> Ladder {
        refresh_or_empty!(self, current_price, cur_inventory_amount, cur_quote_amount);
        compute_spot_bins(&self.config, &self.portfolio)
    }

    fn iqv_move_ratio(&self) -> f64 {
        self.portfolio.iqv_move_ratio
    }
}

pub struct CurveStrategy {
    pub config: LadderConfig,
    pub portfolio: PortfolioState,
    pub decay_rate: f64,
}

impl CurveStrategy {
    pub fn new(config: LadderConfig, portfolio: PortfolioState, decay_rate: f64) -> Self {
        Self { config, portfolio, decay_rate }
    }
}

impl Strategy for CurveStrategy {
    fn compute_current_bins(&mut self, current_price: f64, cur_inventory_amount: f64, cur_quote_amount: f64) -> Ladder {
        refresh_or_empty!(self, current_price, cur_inventory_amount, cur_quote_amount);
        compute_curve_bins(&self.config, &self.portfolio, self.decay_rate)
    }

    fn iqv_move_ratio(&self) -> f64 {
        self.portfolio.iqv_move_ratio
    }
}

pub struct BidAskStrategy {
    pub config: LadderConfig,
    pub portfolio: PortfolioState,
    pub decay_rate: f64,
}

impl BidAskStrategy {
    pub fn new(config: LadderConfig, portfolio: PortfolioState, decay_rate: f64) -> Self {
        Self { config, portfolio, decay_rate }
    }
}

impl Strategy for BidAskStrategy {
    fn compute_current_bins(&mut self, current_price: f64, cur_inventory_amount: f64, cur_quote_amount: f64) -> Ladder {
        refresh_or_empty!(self, current_price, cur_inventory_amount, cur_quote_amount);
        compute_bidask_bins(&self.config, &self.portfolio, self.decay_rate)
    }

    fn iqv_move_ratio(&self) -> f64 {
        self.portfolio.iqv_move_ratio
    }
}

/// Regime-switching wrapper: dispatches to the Curve/BidAsk/Spot sizing
/// depending on the latest volatility reading. `update_vol` is the only way
/// volatility enters this strategy — it does no smoothing of its own (that
/// lives in the volatility estimator/monitor).
pub struct AutoStrategy {
    pub config: LadderConfig,
    pub portfolio: PortfolioState,
    pub decay_rate: f64,
    pub vol_lower_threshold: f64,
    pub vol_upper_threshold: f64,
    vol: f64,
}

impl AutoStrategy {
    pub fn new(
        config: LadderConfig,
        portfolio: PortfolioState,
        decay_rate: f64,
        vol_lower_threshold: f64,
        vol_upper_threshold: f64,
        init_vol: f64,
    ) -> Self {
        Self { config, portfolio, decay_rate, vol_lower_threshold, vol_upper_threshold, vol: init_vol }
    }
}

impl Strategy for AutoStrategy {
    fn compute_current_bins(&mut self, current_price: f64, cur_inventory_amount: f64, cur_quote_amount: f64) -> Ladder {
        refresh_or_empty!(self, current_price, cur_inventory_amount, cur_quote_amount);

        // The mid-band (Spot-like) branch anchors off `self.portfolio.cur_price`,
        // which was just refreshed from `current_price` above — both the bin
        // offset and the bid/ask price anchor come from the same fresh reading.
        if self.vol < self.vol_lower_threshold {
            compute_curve_bins(&self.config, &self.portfolio, self.decay_rate)
        } else if self.vol > self.vol_upper_threshold {
            compute_bidask_bins(&self.config, &self.portfolio, self.decay_rate)
        } else {
            compute_spot_bins(&self.config, &self.portfolio)
        }
    }

    fn update_vol(&mut self, vol: f64) {
        self.vol = vol;
    }

    fn iqv_move_ratio(&self) -> f64 {
        self.portfolio.iqv_move_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1_config() -> LadderConfig {
        LadderConfig {
            price_up_pct_limit: 0.02,
            price_down_pct_limit: 0.02,
            bin_step_bps: 40.0,
            live_order_nums: 10,
            min_order_size: 0.1,
            max_order_size: 5.0,
            iqv_up_limit: 0.6,
            iqv_down_limit: -0.6,
            inventory_rb_iqv_ratio: 0.3,
            quote_rb_iqv_ratio: -0.3,
        }
    }

    #[test]
    fn bin_nums_derivation() {
        let cfg = s1_config();
        assert_eq!(cfg.ask_bin_nums(), 5);
        assert_eq!(cfg.bid_bin_nums(), 5);
    }

    #[test]
    fn s1_spot_ladder() {
        let cfg = s1_config();
        let portfolio = PortfolioState::new(2.0, 20.0, 100.0).unwrap();
        let ladder = compute_spot_bins(&cfg, &portfolio);

        assert_eq!(ladder.bids.len(), 5);
        assert_eq!(ladder.asks.len(), 5);
        for b in &ladder.bids {
            assert!((b.size - 5.0).abs() < 1e-9); // base_bid=10 clamped to max 5
        }
        for a in &ladder.asks {
            assert!((a.size - 4.0).abs() < 1e-9); // base_ask=20/5=4
        }
        let expected_bids = [1.9920, 1.9840, 1.9760, 1.9680, 1.9600];
        for (b, expected) in ladder.bids.iter().zip(expected_bids) {
            assert!((b.price - expected).abs() < 1e-9, "{} vs {}", b.price, expected);
        }
        let expected_asks = [2.0080, 2.0160, 2.0240, 2.0320, 2.0400];
        for (a, expected) in ladder.asks.iter().zip(expected_asks) {
            assert!((a.price - expected).abs() < 1e-9, "{} vs {}", a.price, expected);
        }
    }

    #[test]
    fn s2_skew_cutoff_zeroes_bid_side() {
        let cfg = s1_config();
        let mut portfolio = PortfolioState::new(2.0, 20.0, 100.0).unwrap();
        // force iqv_move_ratio = 0.6 = iqv_up_limit directly for this synthetic case
        portfolio.iqv_move_ratio = 0.6;
        let ladder = compute_spot_bins(&cfg, &portfolio);
        assert!(ladder.bids.is_empty());
        assert_eq!(ladder.asks.len(), 5);
    }

    #[test]
    fn s3_curve_decay() {
        let cfg = s1_config();
        let portfolio = PortfolioState::new(100.0, 10.0, 1000.0).unwrap();
        let ladder = compute_curve_bins(&cfg, &portfolio, 0.95);

        let decay_sum: f64 = (0..5).map(|i| 0.95f64.powi(i)).sum();
        assert!((decay_sum - 4.524).abs() < 1e-3);
        let max_ask = 10.0 / decay_sum;
        assert!((max_ask - 2.2105).abs() < 1e-3);

        let expected_factors = [1.0, 0.95, 0.9025, 0.857_375, 0.814_506_25];
        for (bin, factor) in ladder.asks.iter().zip(expected_factors) {
            let expected = (max_ask * factor).clamp(cfg.min_order_size, cfg.max_order_size);
            assert!((bin.size - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn curve_mode_with_unit_muls_conserves_quote_and_inventory() {
        // Wide clamp bounds so the conservation identity isn't masked by
        // per-bin clamping; iqv_move_ratio=0 keeps both multipliers at 1.
        let cfg = LadderConfig {
            price_up_pct_limit: 0.02,
            price_down_pct_limit: 0.02,
            bin_step_bps: 40.0,
            live_order_nums: 10,
            min_order_size: 0.0001,
            max_order_size: 1_000_000.0,
            iqv_up_limit: 0.6,
            iqv_down_limit: -0.6,
            inventory_rb_iqv_ratio: 0.3,
            quote_rb_iqv_ratio: -0.3,
        };
        let portfolio = PortfolioState::new(100.0, 10.0, 1000.0).unwrap();
        let ladder = compute_curve_bins(&cfg, &portfolio, 0.95);

        let bid_quote_total: f64 = ladder.bids.iter().map(|b| b.size * portfolio.cur_price).sum();
        let ask_inventory_total: f64 = ladder.asks.iter().map(|a| a.size).sum();
        assert!((bid_quote_total - portfolio.cur_quote).abs() < 1e-6, "{bid_quote_total} vs {}", portfolio.cur_quote);
        assert!((ask_inventory_total - portfolio.cur_inventory).abs() < 1e-6, "{ask_inventory_total} vs {}", portfolio.cur_inventory);
    }

    #[test]
    fn buy_mul_is_monotone_and_bounded() {
        let cfg = s1_config();
        assert_eq!(buy_mul(cfg.inventory_rb_iqv_ratio, cfg.inventory_rb_iqv_ratio, cfg.iqv_up_limit), 1.0);
        assert_eq!(buy_mul(cfg.iqv_up_limit, cfg.inventory_rb_iqv_ratio, cfg.iqv_up_limit), 0.0);
        let mid = buy_mul(0.45, cfg.inventory_rb_iqv_ratio, cfg.iqv_up_limit);
        assert!((0.0..=1.0).contains(&mid));
        let lower = buy_mul(0.31, cfg.inventory_rb_iqv_ratio, cfg.iqv_up_limit);
        let higher = buy_mul(0.59, cfg.inventory_rb_iqv_ratio, cfg.iqv_up_limit);
        assert!(lower >= higher);
    }

    #[test]
    fn spot_mode_uses_exactly_half_live_order_nums_per_side() {
        let cfg = s1_config();
        let portfolio = PortfolioState::new(2.0, 20.0, 100.0).unwrap();
        let ladder = compute_spot_bins(&cfg, &portfolio);
        assert_eq!(ladder.bids.len(), cfg.max_bins_per_side());
        assert_eq!(ladder.asks.len(), cfg.max_bins_per_side());
    }

    #[test]
    fn auto_mid_band_matches_spot() {
        let cfg = s1_config();
        let portfolio = PortfolioState::new(2.0, 20.0, 100.0).unwrap();
        let mut auto = AutoStrategy::new(cfg, portfolio, 0.95, 5.0, 20.0, 10.0);
        let ladder = auto.compute_current_bins(2.0, 20.0, 100.0);
        assert_eq!(ladder.bids.len(), 5);
        assert_eq!(ladder.asks.len(), 5);
        assert!((ladder.asks[0].size - 4.0).abs() < 1e-9);
    }

    #[test]
    fn auto_dispatches_to_curve_below_lower_threshold() {
        let cfg = s1_config();
        let portfolio = PortfolioState::new(100.0, 10.0, 1000.0).unwrap();
        let mut auto = AutoStrategy::new(cfg, portfolio, 0.95, 5.0, 20.0, 10.0);
        auto.update_vol(1.0);
        let ladder = auto.compute_current_bins(100.0, 10.0, 1000.0);
        let direct = compute_curve_bins(&cfg, &PortfolioState::new(100.0, 10.0, 1000.0).unwrap(), 0.95);
        assert_eq!(ladder.asks.len(), direct.asks.len());
        for (a, b) in ladder.asks.iter().zip(direct.asks.iter()) {
            assert!((a.size - b.size).abs() < 1e-9);
        }
    }
}
