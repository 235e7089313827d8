// Volatility estimation: blends a short-window, long-window and EWMA
// realized-vol estimate into one scalar used by the Auto strategy to pick
// a regime.

/// `sqrt(60)` — annualises one-second log-return samples to a one-minute
/// reference bar. Pinned as a named constant because it must stay bit-exact
/// across the estimator and its tests.
const ANNUALIZATION: f64 = 7.745_966_692_414_834; // 60f64.sqrt()

#[derive(Debug, Clone, Copy, Default)]
pub struct VolComponents {
    pub short_vol: f64,
    pub long_vol: f64,
    pub ewma_vol: f64,
    pub effective_vol: f64,
}

/// Owns its EWMA accumulator and the last computed blend. Earlier designs in
/// this codebase returned the blend without storing it anywhere, which left
/// callers reading a field that was never set; here `effective_vol()` always
/// reflects the most recent `update()` call.
#[derive(Debug, Clone)]
pub struct VolatilityEstimator {
    short_window: usize,
    long_window: usize,
    lambda: f64,
    ewma_vol_squared: f64,
    last: VolComponents,
}

impl VolatilityEstimator {
    pub fn new(short_window: usize, long_window: usize, lambda: f64) -> Self {
        assert!(lambda > 0.0 && lambda < 1.0, "lambda must be in (0,1)");
        Self {
            short_window,
            long_window,
            lambda,
            ewma_vol_squared: 0.0,
            last: VolComponents::default(),
        }
    }

    pub fn effective_vol(&self) -> f64 {
        self.last.effective_vol
    }

    pub fn components(&self) -> VolComponents {
        self.last
    }

    /// Updates internal state from a chronologically ordered price history
    /// (oldest first). Fewer than 2 samples yields an all-zero blend and
    /// leaves `ewma_vol_squared` untouched.
    pub fn update(&mut self, prices: &[f64]) -> VolComponents {
        if prices.len() < 2 {
            self.last = VolComponents::default();
            return self.last;
        }

        let log_returns: Vec<f64> = prices
            .windows(2)
            .map(|w| (w[1] / w[0]).ln())
            .collect();

        let short_vol = stdev_tail(&log_returns, self.short_window) * ANNUALIZATION;
        let long_vol = stdev_tail(&log_returns, self.long_window) * ANNUALIZATION;

        let last_return = *log_returns.last().expect("checked len >= 2 above");
        self.ewma_vol_squared =
            self.lambda * self.ewma_vol_squared + (1.0 - self.lambda) * last_return * last_return;
        let ewma_vol = self.ewma_vol_squared.sqrt() * ANNUALIZATION;

        let effective_vol = 0.3 * short_vol + 0.4 * ewma_vol + 0.3 * long_vol;

        self.last = VolComponents { short_vol, long_vol, ewma_vol, effective_vol };
        self.last
    }
}

/// Population stdev of the last `min(window, returns.len())` returns.
fn stdev_tail(returns: &[f64], window: usize) -> f64 {
    let n = window.min(returns.len());
    if n == 0 {
        return 0.0;
    }
    let tail = &returns[returns.len() - n..];
    let mean = tail.iter().sum::<f64>() / n as f64;
    let var = tail.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_price_series_is_zero_vol() {
        let mut est = VolatilityEstimator::new(4, 4, 0.94);
        let out = est.update(&[100.0, 100.0, 100.0, 100.0, 100.0]);
        assert_eq!(out.short_vol, 0.0);
        assert_eq!(out.long_vol, 0.0);
        assert_eq!(out.ewma_vol, 0.0);
        assert_eq!(out.effective_vol, 0.0);
        assert_eq!(est.effective_vol(), 0.0);
    }

    #[test]
    fn fewer_than_two_samples_is_zero() {
        let mut est = VolatilityEstimator::new(60, 600, 0.94);
        let out = est.update(&[100.0]);
        assert_eq!(out.effective_vol, 0.0);
        let out = est.update(&[]);
        assert_eq!(out.effective_vol, 0.0);
    }

    // S4: alternating +/- ln(1.005) returns, short=long=4, lambda=0.94.
    #[test]
    fn s4_blended_effective_vol_matches_components() {
        let mut est = VolatilityEstimator::new(4, 4, 0.94);
        let out = est.update(&[100.0, 100.5, 100.0, 100.5, 100.0]);

        let expected = 0.3 * out.short_vol + 0.4 * out.ewma_vol + 0.3 * out.long_vol;
        assert!((out.effective_vol - expected).abs() < 1e-9);

        // returns alternate -ln(1.005), +ln(1.005) (from 100.5->100, 100->100.5)
        let r = (100.5f64 / 100.0).ln();
        // stdev of [+r, -r, +r, -r] (population) = r
        let expected_short = r * ANNUALIZATION;
        assert!((out.short_vol - expected_short).abs() < 1e-9);
        assert!((out.long_vol - expected_short).abs() < 1e-9);
    }

    #[test]
    fn geometric_series_ewma_converges() {
        // ewma_vol_squared is a one-step-per-call EWMA, so convergence to the
        // constant-return fixed point needs `update` driven once per sample,
        // not a single call over the whole history.
        let rate = 0.001_f64;
        let mut est = VolatilityEstimator::new(60, 600, 0.94);
        let mut price = 100.0_f64;
        let mut prices = vec![price];
        let mut out = VolComponents::default();
        for _ in 0..2000 {
            price *= 1.0 + rate;
            prices.push(price);
            out = est.update(&prices);
        }
        let expected = ANNUALIZATION * rate.ln_1p().abs();
        assert!((out.ewma_vol - expected).abs() < 1e-6, "{} vs {}", out.ewma_vol, expected);
    }
}
