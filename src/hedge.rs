// Hedger: two cooperating state machines sharing `HedgeState`, driven by
// portfolio snapshots pushed from the runner. The active side continuously
// reconciles a perp position to restore the target IQV once the portfolio
// drifts beyond an activation threshold; the passive side pre-arms
// stop-trigger orders that only open a hedge on an adverse move, then
// protects it with a stop-loss.

use std::fmt;

use crate::exchange::{ExchangeAdapter, GtxOutcome, OrderState, Side};

#[derive(Debug, Clone, Copy)]
pub struct HedgeConfig {
    pub min_hedge_order_size: f64,
    pub active_hedge_iqv_ratio: f64,
    pub passive_hedge_ratio: f64,
    pub passive_hedge_sp_ratio: f64,
    pub passive_hedge_proportion: f64,
    pub refresh_iqv_ratio: f64,
    pub dual_sided: bool,
    pub init_iqv_ratio: f64,
    pub gtx_max_try: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PortfolioSnapshot {
    pub price: f64,
    pub cur_inventory: f64,
    pub cur_quote: f64,
    pub iqv_move_ratio: f64,
}

#[derive(Debug)]
pub enum HedgeError {
    Exchange(crate::exchange::OrderError),
    CancelFailed,
}

impl fmt::Display for HedgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HedgeError::Exchange(e) => write!(f, "exchange error: {e}"),
            HedgeError::CancelFailed => write!(f, "cancel failed during passive-hedge refresh"),
        }
    }
}

impl std::error::Error for HedgeError {}

impl From<crate::exchange::OrderError> for HedgeError {
    fn from(e: crate::exchange::OrderError) -> Self {
        HedgeError::Exchange(e)
    }
}

/// Continuously reconciled hedge: ticks every 1s in the runner's task,
/// solving for the short/long size needed to bring IQV back to
/// `init_iqv_ratio * active_hedge_iqv_ratio`.
pub struct ActiveHedge {
    pub symbol: String,
    pub config: HedgeConfig,
    /// Standing target hedge size (signed: negative = short). Assigned the
    /// newly solved target each tick, not the execution delta — see the
    /// design note on this field in the module's test module.
    pub active_hedge_size: f64,
}

impl ActiveHedge {
    pub fn new(symbol: impl Into<String>, config: HedgeConfig) -> Self {
        Self { symbol: symbol.into(), config, active_hedge_size: 0.0 }
    }

    pub async fn tick(
        &mut self,
        exchange: &dyn ExchangeAdapter,
        snapshot: &PortfolioSnapshot,
    ) -> Result<(), HedgeError> {
        let n = self.config.init_iqv_ratio * self.config.active_hedge_iqv_ratio;
        let i = snapshot.cur_inventory;
        let p = snapshot.price;
        let q = snapshot.cur_quote;

        let target_signed = if snapshot.iqv_move_ratio > self.config.active_hedge_iqv_ratio {
            let x = (i * p - n * i * q - n * q) / p;
            if x <= 0.0 {
                log::warn!("{}: active hedge short solve non-positive (x={x:.6}), skipping round", self.symbol);
                return Ok(());
            }
            Some(-x)
        } else if snapshot.iqv_move_ratio < -self.config.active_hedge_iqv_ratio && self.config.dual_sided {
            let x = (n * i * q + n * q - i * p) / p;
            if x <= 0.0 {
                log::warn!("{}: active hedge long solve non-positive (x={x:.6}), skipping round", self.symbol);
                return Ok(());
            }
            Some(x)
        } else {
            None
        };

        let Some(target_signed) = target_signed else { return Ok(()) };
        let delta = target_signed - self.active_hedge_size;
        if delta.abs() < self.config.min_hedge_order_size {
            return Ok(());
        }

        let side = if delta < 0.0 { Side::Sell } else { Side::Buy };
        let size = delta.abs();
        let outcome = exchange.place_perp_gtx(&self.symbol, side, size, self.config.gtx_max_try).await?;
        if let GtxOutcome::PartiallyFilled { unfilled } | GtxOutcome::Aborted { unfilled } = outcome {
            if unfilled > 0.0 {
                exchange.place_perp_market(&self.symbol, side, unfilled).await?;
            }
        }

        self.active_hedge_size = target_signed;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassiveHedgeState {
    pub passive_hedge_size: f64,
    pub p_hedge_long_trigger_price: f64,
    pub p_hedge_short_trigger_price: f64,
    pub long_trigger_oid: Option<String>,
    pub short_trigger_oid: Option<String>,
    pub stop_loss_oid: Option<String>,
    pub is_on_p_hedge: bool,
}

/// Trigger-order state machine: IDLE/ARMED (pre-armed triggers resting
/// above/below price) / TRIGGERED (a trigger filled, stop-loss now resting).
pub struct PassiveHedge {
    pub symbol: String,
    pub config: HedgeConfig,
    pub state: PassiveHedgeState,
}

impl PassiveHedge {
    pub fn new(symbol: impl Into<String>, config: HedgeConfig) -> Self {
        Self { symbol: symbol.into(), config, state: PassiveHedgeState::default() }
    }

    pub async fn tick(
        &mut self,
        exchange: &dyn ExchangeAdapter,
        snapshot: &PortfolioSnapshot,
    ) -> Result<(), HedgeError> {
        debug_assert_eq!(self.state.is_on_p_hedge, self.state.stop_loss_oid.is_some());

        if self.state.is_on_p_hedge {
            return self.poll_stop_loss(exchange).await;
        }

        if let Some(oid) = self.state.long_trigger_oid.clone() {
            let status = exchange.query_perp_order(&self.symbol, &oid).await?;
            if status.state == OrderState::Filled {
                return self.enter_triggered(exchange, Side::Sell, status.avg_price, 1.0 - self.config.passive_hedge_sp_ratio).await;
            }
        }
        if let Some(oid) = self.state.short_trigger_oid.clone() {
            let status = exchange.query_perp_order(&self.symbol, &oid).await?;
            if status.state == OrderState::Filled {
                return self.enter_triggered(exchange, Side::Buy, status.avg_price, 1.0 + self.config.passive_hedge_sp_ratio).await;
            }
        }

        if snapshot.iqv_move_ratio.abs() <= self.config.refresh_iqv_ratio {
            self.refresh(exchange, snapshot).await
        } else {
            self.rearm_missing(exchange).await
        }
    }

    async fn poll_stop_loss(&mut self, exchange: &dyn ExchangeAdapter) -> Result<(), HedgeError> {
        let Some(oid) = self.state.stop_loss_oid.clone() else { return Ok(()) };
        let status = exchange.query_perp_order(&self.symbol, &oid).await?;
        if status.state == OrderState::Filled {
            self.state.is_on_p_hedge = false;
            self.state.stop_loss_oid = None;
            log::info!("{}: stop-loss filled at {:.6}, passive hedge closed", self.symbol, status.avg_price);
        }
        Ok(())
    }

    async fn enter_triggered(
        &mut self,
        exchange: &dyn ExchangeAdapter,
        stop_loss_side: Side,
        filled_price: f64,
        sp_factor: f64,
    ) -> Result<(), HedgeError> {
        self.state.is_on_p_hedge = true;
        self.state.long_trigger_oid = None;
        self.state.short_trigger_oid = None;
        let stop_price = filled_price * sp_factor;
        let oid = exchange
            .place_perp_trigger(&self.symbol, stop_loss_side, self.state.passive_hedge_size, stop_price)
            .await?;
        self.state.stop_loss_oid = Some(oid);
        Ok(())
    }

    async fn refresh(&mut self, exchange: &dyn ExchangeAdapter, snapshot: &PortfolioSnapshot) -> Result<(), HedgeError> {
        for oid in [self.state.long_trigger_oid.take(), self.state.short_trigger_oid.take()].into_iter().flatten() {
            if !exchange.cancel_perp_order(&self.symbol, &oid).await? {
                return Err(HedgeError::CancelFailed);
            }
        }

        self.state.p_hedge_long_trigger_price = snapshot.price * (1.0 + self.config.passive_hedge_ratio);
        self.state.p_hedge_short_trigger_price = snapshot.price * (1.0 - self.config.passive_hedge_ratio);
        self.state.passive_hedge_size = snapshot.cur_inventory * self.config.passive_hedge_proportion;

        self.state.short_trigger_oid = Some(
            exchange
                .place_perp_trigger(&self.symbol, Side::Sell, self.state.passive_hedge_size, self.state.p_hedge_short_trigger_price)
                .await?,
        );
        if self.config.dual_sided {
            self.state.long_trigger_oid = Some(
                exchange
                    .place_perp_trigger(&self.symbol, Side::Buy, self.state.passive_hedge_size, self.state.p_hedge_long_trigger_price)
                    .await?,
            );
        }
        Ok(())
    }

    async fn rearm_missing(&mut self, exchange: &dyn ExchangeAdapter) -> Result<(), HedgeError> {
        if self.state.short_trigger_oid.is_none() && self.state.passive_hedge_size > 0.0 {
            self.state.short_trigger_oid = Some(
                exchange
                    .place_perp_trigger(&self.symbol, Side::Sell, self.state.passive_hedge_size, self.state.p_hedge_short_trigger_price)
                    .await?,
            );
        }
        if self.config.dual_sided && self.state.long_trigger_oid.is_none() && self.state.passive_hedge_size > 0.0 {
            self.state.long_trigger_oid = Some(
                exchange
                    .place_perp_trigger(&self.symbol, Side::Buy, self.state.passive_hedge_size, self.state.p_hedge_long_trigger_price)
                    .await?,
            );
        } else if !self.config.dual_sided {
            // Recovery path: a long trigger should never be resting when
            // dual-sided hedging is off. If one is somehow set (e.g. config
            // flipped mid-session), cancel it on this refresh pass.
            if let Some(oid) = self.state.long_trigger_oid.take() {
                if !exchange.cancel_perp_order(&self.symbol, &oid).await? {
                    return Err(HedgeError::CancelFailed);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;

    fn base_config() -> HedgeConfig {
        HedgeConfig {
            min_hedge_order_size: 0.01,
            active_hedge_iqv_ratio: 0.65,
            passive_hedge_ratio: 0.02,
            passive_hedge_sp_ratio: 0.003,
            passive_hedge_proportion: 0.5,
            refresh_iqv_ratio: 0.1,
            dual_sided: true,
            init_iqv_ratio: 0.5,
            gtx_max_try: 30,
        }
    }

    // S6: negative solve in the short branch skips the round without
    // mutating active_hedge_size.
    #[tokio::test]
    async fn s6_active_hedge_skips_on_nonpositive_solve() {
        let exch = SimExchange::new(100.0);
        let mut hedge = ActiveHedge::new("SUI", base_config());
        let snapshot = PortfolioSnapshot { price: 100.0, cur_inventory: 10.0, cur_quote: 1000.0, iqv_move_ratio: 0.7 };
        hedge.tick(&exch, &snapshot).await.unwrap();
        assert_eq!(hedge.active_hedge_size, 0.0);
        assert_eq!(exch.position(), 0.0);
    }

    #[tokio::test]
    async fn active_hedge_stores_standing_target_not_delta() {
        let exch = SimExchange::new(100.0);
        let mut hedge = ActiveHedge::new("SUI", base_config());
        // iqv_move just above threshold with a modest inventory keeps x>0.
        let snapshot = PortfolioSnapshot { price: 100.0, cur_inventory: 1.0, cur_quote: 1000.0, iqv_move_ratio: 0.7 };
        hedge.tick(&exch, &snapshot).await.unwrap();
        let n = 0.5 * 0.65;
        let expected_x = (1.0 * 100.0 - n * 1.0 * 1000.0 - n * 1000.0) / 100.0;
        assert!(expected_x > 0.0);
        assert!((hedge.active_hedge_size - (-expected_x)).abs() < 1e-9);

        // A second tick with an unchanged snapshot should compute delta
        // against the *standing* size, so it should now be a no-op (delta
        // below min_hedge_order_size), not re-derive against last delta.
        let before = hedge.active_hedge_size;
        hedge.tick(&exch, &snapshot).await.unwrap();
        assert_eq!(hedge.active_hedge_size, before);
    }

    // S5: long trigger fills at 102, stop-loss SELL trigger arms at 101.694.
    #[tokio::test]
    async fn s5_passive_hedge_trigger_to_stop_loss() {
        let exch = SimExchange::new(100.0);
        let mut passive = PassiveHedge::new("SUI", base_config());
        let snapshot = PortfolioSnapshot { price: 100.0, cur_inventory: 10.0, cur_quote: 1000.0, iqv_move_ratio: 0.0 };

        passive.tick(&exch, &snapshot).await.unwrap();
        assert_eq!(passive.state.p_hedge_long_trigger_price, 102.0);
        assert_eq!(passive.state.p_hedge_short_trigger_price, 98.0);
        assert_eq!(passive.state.passive_hedge_size, 5.0);
        assert!(!passive.state.is_on_p_hedge);

        let long_oid = passive.state.long_trigger_oid.clone().unwrap();
        exch.mark_filled(&long_oid, 102.0);

        passive.tick(&exch, &snapshot).await.unwrap();
        assert!(passive.state.is_on_p_hedge);
        assert_eq!(passive.state.is_on_p_hedge, passive.state.stop_loss_oid.is_some());

        let stop_oid = passive.state.stop_loss_oid.clone().unwrap();
        let (_, stop_price) = exch.trigger_order_status(&stop_oid).unwrap();
        assert!((stop_price - 101.694).abs() < 1e-9);
    }

    #[tokio::test]
    async fn passive_hedge_closes_on_stop_loss_fill() {
        let exch = SimExchange::new(100.0);
        let mut passive = PassiveHedge::new("SUI", base_config());
        let snapshot = PortfolioSnapshot { price: 100.0, cur_inventory: 10.0, cur_quote: 1000.0, iqv_move_ratio: 0.0 };
        passive.tick(&exch, &snapshot).await.unwrap();
        let long_oid = passive.state.long_trigger_oid.clone().unwrap();
        exch.mark_filled(&long_oid, 102.0);
        passive.tick(&exch, &snapshot).await.unwrap();
        let stop_oid = passive.state.stop_loss_oid.clone().unwrap();

        exch.mark_filled(&stop_oid, 101.694);
        passive.tick(&exch, &snapshot).await.unwrap();
        assert!(!passive.state.is_on_p_hedge);
        assert!(passive.state.stop_loss_oid.is_none());
    }

    #[tokio::test]
    async fn single_sided_hedge_never_arms_long_trigger() {
        let exch = SimExchange::new(100.0);
        let mut config = base_config();
        config.dual_sided = false;
        let mut passive = PassiveHedge::new("SUI", config);
        let snapshot = PortfolioSnapshot { price: 100.0, cur_inventory: 10.0, cur_quote: 1000.0, iqv_move_ratio: 0.0 };
        passive.tick(&exch, &snapshot).await.unwrap();
        assert!(passive.state.long_trigger_oid.is_none());
        assert!(passive.state.short_trigger_oid.is_some());
    }
}
