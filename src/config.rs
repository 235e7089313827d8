// Configuration: loads every strategy/hedge/volatility parameter from the
// environment (optionally sourced from a dotenv-style file named by
// `--config-file`), range-checks it eagerly, and hands the result by value
// to the runner's constructors. No subsystem re-reads the environment after
// startup.

use std::env;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marketplace {
    BinanceSpot,
    Hyperliquid,
}

impl Marketplace {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "binance_spot" => Some(Marketplace::BinanceSpot),
            "hyperliquid" => Some(Marketplace::Hyperliquid),
            _ => None,
        }
    }

    /// `BASEQUOTE` on Binance-style spot venues, bare `BASE` on Hyperliquid.
    pub fn symbol_for(&self, underlying: &str, quote: &str) -> String {
        match self {
            Marketplace::BinanceSpot => format!("{underlying}{quote}"),
            Marketplace::Hyperliquid => underlying.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeMarketplace {
    BinancePerp,
}

impl HedgeMarketplace {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "binance_perp" => Some(HedgeMarketplace::BinancePerp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmMode {
    Spot,
    Curve,
    BidAsk,
    Auto,
}

impl MmMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "spot" => Some(MmMode::Spot),
            "curve" => Some(MmMode::Curve),
            "bid_ask" => Some(MmMode::BidAsk),
            "auto" => Some(MmMode::Auto),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Malformed { key: &'static str, value: String },
    OutOfRange { key: &'static str, detail: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing required config key: {key}"),
            ConfigError::Malformed { key, value } => write!(f, "malformed value for {key}: {value:?}"),
            ConfigError::OutOfRange { key, detail } => write!(f, "out-of-range config for {key}: {detail}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub underlying_token: String,
    pub quote_token: String,
    pub marketplace: Marketplace,
    pub hedge_marketplace: HedgeMarketplace,

    pub mm_update_interval_secs: u64,
    pub mm_price_up_pct_limit: f64,
    pub mm_price_down_pct_limit: f64,
    pub mm_bin_step_bps: f64,
    pub mm_init_inventory_amount: f64,
    pub mm_init_quote_amount: f64,
    pub mm_mode: MmMode,
    pub mm_live_order_nums: usize,
    pub mm_min_order_size: f64,
    pub mm_max_order_size: f64,
    pub mm_iqv_up_limit: f64,
    pub mm_iqv_down_limit: f64,
    pub mm_inventory_rb_iqv_ratio: f64,
    pub mm_quote_rb_iqv_ratio: f64,

    pub auto_mm_vol_lower_threshold: f64,
    pub auto_mm_vol_upper_threshold: f64,

    pub hg_passive_hedge_ratio: f64,
    pub hg_min_hedge_order_size: f64,
    pub hg_active_hedge_iqv_ratio: f64,
    pub hg_passive_hedge_sp_ratio: f64,
    pub hg_passive_hedge_proportion: f64,
    pub hg_passive_hedge_refresh_iqv_ratio: f64,
    pub hg_passive_hedge_refresh_interval_secs: u64,
    pub hg_dual_sided_hedge: bool,
    pub hg_gtx_max_try: u32,

    pub vol_his_price_window_secs: u64,
    pub vol_his_price_window_limit: usize,
    pub vol_short_window: usize,
    pub vol_long_window: usize,
    pub vol_ewma_lambda: f64,
}

fn get(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn get_or(key: &'static str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_f64(key: &'static str, raw: &str) -> Result<f64, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Malformed { key, value: raw.to_string() })
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Malformed { key, value: raw.to_string() })
}

fn parse_usize(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Malformed { key, value: raw.to_string() })
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::Malformed { key, value: raw.to_string() }),
    }
}

impl EngineConfig {
    /// Reads every key in the table below from the process environment
    /// (already populated by `dotenvy::from_filename` in `main`), then
    /// range-checks every invariant from §3/§6 before returning. The first
    /// violation aborts — no engine is constructed on a partially valid
    /// config.
    pub fn from_env() -> Result<Self, ConfigError> {
        let underlying_token = get("MM_UNDERLYING_TOKEN")?;
        let quote_token = get("MM_QUOTE_TOKEN")?;

        let marketplace_raw = get("MM_MARKETPLACE")?;
        let marketplace = Marketplace::parse(&marketplace_raw)
            .ok_or_else(|| ConfigError::Malformed { key: "MM_MARKETPLACE", value: marketplace_raw.clone() })?;

        let hedge_marketplace_raw = get("MM_HEDGE_MARKETPLACE")?;
        let hedge_marketplace = HedgeMarketplace::parse(&hedge_marketplace_raw)
            .ok_or_else(|| ConfigError::Malformed { key: "MM_HEDGE_MARKETPLACE", value: hedge_marketplace_raw.clone() })?;

        let mm_mode_raw = get("MM_MODE")?;
        let mm_mode = MmMode::parse(&mm_mode_raw)
            .ok_or_else(|| ConfigError::Malformed { key: "MM_MODE", value: mm_mode_raw.clone() })?;

        let cfg = EngineConfig {
            underlying_token,
            quote_token,
            marketplace,
            hedge_marketplace,

            mm_update_interval_secs: parse_u64("MM_UPDATE_INTERVAL", &get_or("MM_UPDATE_INTERVAL", "5"))?,
            mm_price_up_pct_limit: parse_f64("MM_PRICE_UP_PCT_LIMIT", &get_or("MM_PRICE_UP_PCT_LIMIT", "0.02"))?,
            mm_price_down_pct_limit: parse_f64("MM_PRICE_DOWN_PCT_LIMIT", &get_or("MM_PRICE_DOWN_PCT_LIMIT", "0.02"))?,
            mm_bin_step_bps: parse_f64("MM_BIN_STEP", &get_or("MM_BIN_STEP", "40"))?,
            mm_init_inventory_amount: parse_f64("MM_INIT_INVENTORY_AMOUNT", &get("MM_INIT_INVENTORY_AMOUNT")?)?,
            mm_init_quote_amount: parse_f64("MM_INIT_QUOTE_AMOUNT", &get("MM_INIT_QUOTE_AMOUNT")?)?,
            mm_mode,
            mm_live_order_nums: parse_usize("MM_LIVE_ORDER_NUMS", &get_or("MM_LIVE_ORDER_NUMS", "10"))?,
            mm_min_order_size: parse_f64("MM_MIN_ORDER_SIZE", &get("MM_MIN_ORDER_SIZE")?)?,
            mm_max_order_size: parse_f64("MM_MAX_ORDER_SIZE", &get("MM_MAX_ORDER_SIZE")?)?,
            mm_iqv_up_limit: parse_f64("MM_IQV_UP_LIMIT", &get_or("MM_IQV_UP_LIMIT", "0.6"))?,
            mm_iqv_down_limit: parse_f64("MM_IQV_DOWN_LIMIT", &get_or("MM_IQV_DOWN_LIMIT", "-0.6"))?,
            mm_inventory_rb_iqv_ratio: parse_f64("MM_INVENTORY_RB_IQV_RATIO", &get_or("MM_INVENTORY_RB_IQV_RATIO", "0.3"))?,
            mm_quote_rb_iqv_ratio: parse_f64("MM_QUOTE_RB_IQV_RATIO", &get_or("MM_QUOTE_RB_IQV_RATIO", "-0.3"))?,

            auto_mm_vol_lower_threshold: parse_f64("AUTO_MM_VOL_LOWER_THRESHOLD", &get_or("AUTO_MM_VOL_LOWER_THRESHOLD", "0.3")) ?,
            auto_mm_vol_upper_threshold: parse_f64("AUTO_MM_VOL_UPPER_THRESHOLD", &get_or("AUTO_MM_VOL_UPPER_THRESHOLD", "0.8")) ?,

            hg_passive_hedge_ratio: parse_f64("HG_PASSIVE_HEDGE_RATIO", &get_or("HG_PASSIVE_HEDGE_RATIO", "0.02"))?,
            hg_min_hedge_order_size: parse_f64("HG_MIN_HEDGE_ORDER_SIZE", &get("HG_MIN_HEDGE_ORDER_SIZE")?)?,
            hg_active_hedge_iqv_ratio: parse_f64("HG_ACTIVE_HEDGE_IQV_RATIO", &get_or("HG_ACTIVE_HEDGE_IQV_RATIO", "0.65"))?,
            hg_passive_hedge_sp_ratio: parse_f64("HG_PASSIVE_HEDGE_SP_RATIO", &get_or("HG_PASSIVE_HEDGE_SP_RATIO", "0.003"))?,
            hg_passive_hedge_proportion: parse_f64("HG_PASSIVE_HEDGE_PROPORTION", &get_or("HG_PASSIVE_HEDGE_PROPORTION", "0.5"))?,
            hg_passive_hedge_refresh_iqv_ratio: parse_f64(
                "HG_PASSIVE_HEDGE_REFRESH_IQV_RATIO",
                &get_or("HG_PASSIVE_HEDGE_REFRESH_IQV_RATIO", "0.1"),
            )?,
            hg_passive_hedge_refresh_interval_secs: parse_u64(
                "HG_PASSIVE_HEDGE_REFRESH_INTERVAL",
                &get_or("HG_PASSIVE_HEDGE_REFRESH_INTERVAL", "10"),
            )?,
            hg_dual_sided_hedge: parse_bool("HG_DUAL_SIDED_HEDGE", &get_or("HG_DUAL_SIDED_HEDGE", "true"))?,
            hg_gtx_max_try: parse_u64("HG_GTX_MAX_TRY", &get_or("HG_GTX_MAX_TRY", "30"))? as u32,

            vol_his_price_window_secs: parse_u64("VOL_HIS_PRICE_WINDOW", &get_or("VOL_HIS_PRICE_WINDOW", "1"))?,
            vol_his_price_window_limit: parse_usize("VOL_HIS_PRICE_WINDOW_LIMIT", &get_or("VOL_HIS_PRICE_WINDOW_LIMIT", "3600"))?,
            vol_short_window: parse_usize("VOL_SHORT_WINDOW", &get_or("VOL_SHORT_WINDOW", "60"))?,
            vol_long_window: parse_usize("VOL_LONG_WINDOW", &get_or("VOL_LONG_WINDOW", "600"))?,
            vol_ewma_lambda: parse_f64("VOL_EWMA_LAMBDA", &get_or("VOL_EWMA_LAMBDA", "0.94"))?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mm_bin_step_bps <= 0.0 {
            return Err(ConfigError::OutOfRange { key: "MM_BIN_STEP", detail: "must be > 0".into() });
        }
        if !(0.0..1.0).contains(&self.mm_price_up_pct_limit) {
            return Err(ConfigError::OutOfRange { key: "MM_PRICE_UP_PCT_LIMIT", detail: "must be in (0,1)".into() });
        }
        if !(0.0..1.0).contains(&self.mm_price_down_pct_limit) {
            return Err(ConfigError::OutOfRange { key: "MM_PRICE_DOWN_PCT_LIMIT", detail: "must be in (0,1)".into() });
        }
        if !(self.mm_iqv_down_limit <= self.mm_quote_rb_iqv_ratio
            && self.mm_quote_rb_iqv_ratio <= 0.0
            && 0.0 <= self.mm_inventory_rb_iqv_ratio
            && self.mm_inventory_rb_iqv_ratio <= self.mm_iqv_up_limit)
        {
            return Err(ConfigError::OutOfRange {
                key: "MM_IQV_*",
                detail: "must satisfy iqv_down_limit <= quote_rb <= 0 <= inventory_rb <= iqv_up_limit".into(),
            });
        }
        if self.mm_min_order_size <= 0.0 || self.mm_max_order_size < self.mm_min_order_size {
            return Err(ConfigError::OutOfRange {
                key: "MM_MIN_ORDER_SIZE/MM_MAX_ORDER_SIZE",
                detail: "must satisfy 0 < min <= max".into(),
            });
        }
        if self.mm_live_order_nums == 0 {
            return Err(ConfigError::OutOfRange { key: "MM_LIVE_ORDER_NUMS", detail: "must be > 0".into() });
        }
        if self.mm_init_inventory_amount < 0.0 || self.mm_init_quote_amount < 0.0 {
            return Err(ConfigError::OutOfRange {
                key: "MM_INIT_INVENTORY_AMOUNT/MM_INIT_QUOTE_AMOUNT",
                detail: "must be >= 0".into(),
            });
        }
        if self.mm_mode == MmMode::Auto && self.auto_mm_vol_lower_threshold >= self.auto_mm_vol_upper_threshold {
            return Err(ConfigError::OutOfRange {
                key: "AUTO_MM_VOL_LOWER_THRESHOLD/AUTO_MM_VOL_UPPER_THRESHOLD",
                detail: "lower threshold must be < upper threshold".into(),
            });
        }
        if !(0.0..1.0).contains(&self.vol_ewma_lambda) {
            return Err(ConfigError::OutOfRange { key: "VOL_EWMA_LAMBDA", detail: "must be in (0,1)".into() });
        }
        if self.vol_short_window == 0 || self.vol_long_window == 0 {
            return Err(ConfigError::OutOfRange { key: "VOL_SHORT_WINDOW/VOL_LONG_WINDOW", detail: "must be > 0".into() });
        }
        if self.hg_passive_hedge_proportion <= 0.0 || self.hg_passive_hedge_proportion > 1.0 {
            return Err(ConfigError::OutOfRange { key: "HG_PASSIVE_HEDGE_PROPORTION", detail: "must be in (0,1]".into() });
        }
        if self.hg_min_hedge_order_size <= 0.0 {
            return Err(ConfigError::OutOfRange { key: "HG_MIN_HEDGE_ORDER_SIZE", detail: "must be > 0".into() });
        }
        if self.hg_gtx_max_try == 0 {
            return Err(ConfigError::OutOfRange { key: "HG_GTX_MAX_TRY", detail: "must be > 0".into() });
        }
        Ok(())
    }

    pub fn ladder_config(&self) -> crate::strategy::LadderConfig {
        crate::strategy::LadderConfig {
            price_up_pct_limit: self.mm_price_up_pct_limit,
            price_down_pct_limit: self.mm_price_down_pct_limit,
            bin_step_bps: self.mm_bin_step_bps,
            live_order_nums: self.mm_live_order_nums,
            min_order_size: self.mm_min_order_size,
            max_order_size: self.mm_max_order_size,
            iqv_up_limit: self.mm_iqv_up_limit,
            iqv_down_limit: self.mm_iqv_down_limit,
            inventory_rb_iqv_ratio: self.mm_inventory_rb_iqv_ratio,
            quote_rb_iqv_ratio: self.mm_quote_rb_iqv_ratio,
        }
    }

    pub fn hedge_config(&self, init_iqv_ratio: f64) -> crate::hedge::HedgeConfig {
        crate::hedge::HedgeConfig {
            min_hedge_order_size: self.hg_min_hedge_order_size,
            active_hedge_iqv_ratio: self.hg_active_hedge_iqv_ratio,
            passive_hedge_ratio: self.hg_passive_hedge_ratio,
            passive_hedge_sp_ratio: self.hg_passive_hedge_sp_ratio,
            passive_hedge_proportion: self.hg_passive_hedge_proportion,
            refresh_iqv_ratio: self.hg_passive_hedge_refresh_iqv_ratio,
            dual_sided: self.hg_dual_sided_hedge,
            init_iqv_ratio,
            gtx_max_try: self.hg_gtx_max_try,
        }
    }

    pub fn symbol(&self) -> String {
        self.marketplace.symbol_for(&self.underlying_token, &self.quote_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_required() {
        std::env::set_var("MM_UNDERLYING_TOKEN", "SUI");
        std::env::set_var("MM_QUOTE_TOKEN", "USDC");
        std::env::set_var("MM_MARKETPLACE", "hyperliquid");
        std::env::set_var("MM_HEDGE_MARKETPLACE", "binance_perp");
        std::env::set_var("MM_MODE", "spot");
        std::env::set_var("MM_INIT_INVENTORY_AMOUNT", "20");
        std::env::set_var("MM_INIT_QUOTE_AMOUNT", "100");
        std::env::set_var("MM_MIN_ORDER_SIZE", "0.1");
        std::env::set_var("MM_MAX_ORDER_SIZE", "5");
        std::env::set_var("HG_MIN_HEDGE_ORDER_SIZE", "0.01");
    }

    #[test]
    fn loads_valid_config_with_defaults() {
        set_required();
        let cfg = EngineConfig::from_env().unwrap();
        assert_eq!(cfg.mm_bin_step_bps, 40.0);
        assert_eq!(cfg.symbol(), "SUI");
    }

    #[test]
    fn rejects_bad_marketplace() {
        set_required();
        std::env::set_var("MM_MARKETPLACE", "nonsense");
        assert!(matches!(EngineConfig::from_env(), Err(ConfigError::Malformed { key: "MM_MARKETPLACE", .. })));
        std::env::set_var("MM_MARKETPLACE", "hyperliquid");
    }

    #[test]
    fn rejects_zero_bin_step() {
        set_required();
        std::env::set_var("MM_BIN_STEP", "0");
        assert!(matches!(EngineConfig::from_env(), Err(ConfigError::OutOfRange { key: "MM_BIN_STEP", .. })));
        std::env::remove_var("MM_BIN_STEP");
    }

    #[test]
    fn binance_spot_symbol_concatenates() {
        set_required();
        std::env::set_var("MM_MARKETPLACE", "binance_spot");
        let cfg = EngineConfig::from_env().unwrap();
        assert_eq!(cfg.symbol(), "SUIUSDC");
        std::env::set_var("MM_MARKETPLACE", "hyperliquid");
    }
}
