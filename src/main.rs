// mm-engine-rs: market-making core — ladder planner, MM control loop and a
// dual-strategy (active + passive) hedger, wired together behind a venue-
// agnostic exchange adapter. See SPEC_FULL.md for the full contract; this
// file only does startup wiring and task supervision.
mod config;
mod exchange;
mod feed;
mod hedge;
mod runner;
mod signing;
mod strategy;
mod vol;

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use config::{EngineConfig, Marketplace, MmMode};
use exchange::{ExchangeAdapter, LiveExchange, SimExchange};
use feed::{new_stall_flag, HistoricalFeed, MarketDataBuffer, PriceFeed, WsPriceFeed};
use hedge::{ActiveHedge, HedgeConfig, PassiveHedge, PortfolioSnapshot};
use strategy::{AutoStrategy, BidAskStrategy, CurveStrategy, LadderConfig, PortfolioState, SpotStrategy, Strategy};
use vol::VolatilityEstimator;

/// Default geometric decay used by Curve/BidAsk sizing. Not exposed as a
/// config key in §6 — the spec lists it only as a per-variant constant.
const DEFAULT_DECAY_RATE: f64 = 0.95;

/// Writes every log record to stderr and to the rotating file sink named by
/// `--log-file`, satisfying §4.8's dual-sink requirement without pulling in
/// a heavier logging backend than the rest of this stack uses.
struct TeeWriter {
    file: std::fs::File,
}

impl std::io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

struct CliArgs {
    config_file: String,
    log_file: String,
}

fn parse_cli_args() -> CliArgs {
    let mut config_file = ".env".to_string();
    let mut log_file = "mm.log".to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-file" => {
                if let Some(v) = args.next() {
                    config_file = v;
                }
            }
            "--log-file" => {
                if let Some(v) = args.next() {
                    log_file = v;
                }
            }
            other => log::warn!("ignoring unrecognized CLI argument: {other}"),
        }
    }
    CliArgs { config_file, log_file }
}

fn init_logging(log_file: &str) {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .unwrap_or_else(|e| panic!("failed to open log file {log_file}: {e}"));

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
        .init();
}

fn build_strategy(cfg: &EngineConfig, ladder: LadderConfig, portfolio: PortfolioState) -> Box<dyn Strategy> {
    match cfg.mm_mode {
        MmMode::Spot => Box::new(SpotStrategy::new(ladder, portfolio)),
        MmMode::Curve => Box::new(CurveStrategy::new(ladder, portfolio, DEFAULT_DECAY_RATE)),
        MmMode::BidAsk => Box::new(BidAskStrategy::new(ladder, portfolio, DEFAULT_DECAY_RATE)),
        MmMode::Auto => Box::new(AutoStrategy::new(
            ladder,
            portfolio,
            DEFAULT_DECAY_RATE,
            cfg.auto_mm_vol_lower_threshold,
            cfg.auto_mm_vol_upper_threshold,
            0.0,
        )),
    }
}

#[tokio::main]
async fn main() {
    let cli = parse_cli_args();
    dotenvy::from_filename(&cli.config_file).ok();
    init_logging(&cli.log_file);

    log::info!("mm-engine-rs starting (config-file={}, log-file={})", cli.config_file, cli.log_file);

    let cfg = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("config invalid, aborting startup: {e}");
            std::process::exit(1);
        }
    };

    let symbol = cfg.symbol();
    let hedge_symbol = format!("{}-PERP", cfg.underlying_token);
    log::info!("symbol={symbol} hedge_symbol={hedge_symbol} mode={:?}", cfg.mm_mode);

    let shutdown = Arc::new(AtomicBool::new(false));

    // ─── Exchange adapters ──────────────────────────────────────────────────
    let live_trading = std::env::var("MM_LIVE_TRADING").map(|v| v == "true" || v == "1").unwrap_or(false);
    let (exchange, historical, feed_price): (Arc<dyn ExchangeAdapter>, Arc<dyn HistoricalFeed>, Arc<dyn PriceFeed>) =
        if live_trading && cfg.marketplace == Marketplace::Hyperliquid {
            let account_address = std::env::var("HYPERLIQUID_ACCOUNT_ADDRESS")
                .unwrap_or_else(|_| panic!("HYPERLIQUID_ACCOUNT_ADDRESS must be set when MM_LIVE_TRADING=true"));
            let private_key = std::env::var("HYPERLIQUID_PRIVATE_KEY")
                .unwrap_or_else(|_| panic!("HYPERLIQUID_PRIVATE_KEY must be set when MM_LIVE_TRADING=true"));
            let live = Arc::new(LiveExchange::new(account_address, private_key));
            if let Err(e) = live.init().await {
                log::error!("LiveExchange init failed: {e}");
                std::process::exit(1);
            }

            // Reference websocket transport (§2.1) — real venue feeds plug
            // into the same `PriceFeed` trait; this is the template.
            let buffer = Arc::new(MarketDataBuffer::new());
            let stall = new_stall_flag();
            let ws_feed = Arc::new(WsPriceFeed::new(buffer, stall));
            let ws_url = std::env::var("MM_FEED_WS_URL").unwrap_or_else(|_| "wss://api.hyperliquid.xyz/ws".to_string());
            let feed_task = ws_feed.clone();
            let feed_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = feed_task.connect_and_listen(&ws_url, feed_shutdown).await {
                    log::error!("price feed exhausted reconnect budget: {e}");
                }
            });

            (live.clone(), live, ws_feed)
        } else {
            log::info!("dry-run mode: using in-memory SimExchange as both venue and price source");
            let sim = Arc::new(SimExchange::new(cfg.mm_init_inventory_amount.max(1.0)));
            (sim.clone(), sim.clone(), sim)
        };

    // ─── Portfolio / strategy construction ──────────────────────────────────
    let portfolio = PortfolioState::new(
        feed_price.top_of_book(&symbol).await.map(|b| b.mid_price()).unwrap_or(1.0),
        cfg.mm_init_inventory_amount,
        cfg.mm_init_quote_amount,
    )
    .unwrap_or_else(|e| panic!("invalid initial portfolio state: {e}"));
    let init_iqv_ratio = portfolio.init_iqv_ratio;

    let ladder_cfg = cfg.ladder_config();
    let strategy = build_strategy(&cfg, ladder_cfg, portfolio);

    // ─── Volatility monitor wiring ───────────────────────────────────────────
    let shared_vol = runner::SharedVol::new(0.0);
    let estimator = VolatilityEstimator::new(cfg.vol_short_window, cfg.vol_long_window, cfg.vol_ewma_lambda);
    let is_auto = cfg.mm_mode == MmMode::Auto;

    let vol_monitor_cfg = runner::VolMonitorConfig {
        symbol: symbol.clone(),
        window: Duration::from_secs(cfg.vol_his_price_window_secs.max(1)),
        window_limit: cfg.vol_his_price_window_limit,
        is_auto,
    };
    let vol_feed = feed_price.clone();
    let vol_shutdown = shutdown.clone();
    let vol_shared = shared_vol.clone();
    let vol_historical = historical.clone();
    let vol_handle = tokio::spawn(async move {
        runner::run_vol_monitor(vol_monitor_cfg, vol_historical, vol_feed, estimator, vol_shared, vol_shutdown).await;
    });

    // ─── Hedger wiring ────────────────────────────────────────────────────────
    let hedge_cfg: HedgeConfig = cfg.hedge_config(init_iqv_ratio);
    let active_hedge = ActiveHedge::new(hedge_symbol.clone(), hedge_cfg);
    let passive_hedge = PassiveHedge::new(hedge_symbol.clone(), hedge_cfg);

    let (portfolio_tx, portfolio_rx_active) = tokio::sync::watch::channel(PortfolioSnapshot {
        price: feed_price.top_of_book(&symbol).await.map(|b| b.mid_price()).unwrap_or(1.0),
        cur_inventory: cfg.mm_init_inventory_amount,
        cur_quote: cfg.mm_init_quote_amount,
        iqv_move_ratio: 0.0,
    });
    let portfolio_rx_passive = portfolio_tx.subscribe();

    let active_handle = {
        let exchange = exchange.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            runner::run_active_hedge(active_hedge, exchange, portfolio_rx_active, shutdown).await;
        })
    };

    let passive_handle = {
        let exchange = exchange.clone();
        let shutdown = shutdown.clone();
        let refresh_interval = Duration::from_secs(cfg.hg_passive_hedge_refresh_interval_secs.max(1));
        tokio::spawn(async move {
            runner::run_passive_hedge(passive_hedge, exchange, portfolio_rx_passive, refresh_interval, shutdown).await;
        })
    };

    // ─── MM control loop ──────────────────────────────────────────────────────
    let runner_cfg = runner::RunnerConfig {
        symbol: symbol.clone(),
        live_order_nums: cfg.mm_live_order_nums,
        update_interval: Duration::from_secs(cfg.mm_update_interval_secs.max(1)),
    };
    let mm_handle = {
        let exchange = exchange.clone();
        let feed_price = feed_price.clone();
        let shutdown = shutdown.clone();
        let init_inv = cfg.mm_init_inventory_amount;
        let init_quote = cfg.mm_init_quote_amount;
        let mm_shared_vol = is_auto.then(|| shared_vol.clone());
        tokio::spawn(async move {
            runner::run_mm_loop(
                runner_cfg, strategy, exchange, feed_price, portfolio_tx, shutdown, init_inv, init_quote, mm_shared_vol,
            )
            .await;
        })
    };

    // ─── Shutdown on Ctrl-C; supervisor awaits every task ─────────────────────
    let ctrlc_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            ctrlc_shutdown.store(true, Ordering::SeqCst);
        }
    });

    let results = tokio::join!(mm_handle, active_handle, passive_handle, vol_handle);
    let mut exit_code = 0;
    for result in [results.0, results.1, results.2, results.3] {
        if let Err(e) = result {
            log::error!("a core task panicked: {e}");
            exit_code = 1;
        }
    }
    std::process::exit(exit_code);
}
