// =============================================================================
// Price Evolver — per-tick multiplicative drift + noise
// =============================================================================
//
//   price_change = price * (trend_factor + random_factor)
//   random_factor = (rand - 0.5) * base_volatility
//   base_volatility = market_conditions.volatility * 0.3
//
// An active scenario overrides the trend factor and scales the volatility.
// In the batched high-speed path the noise is damped by 1/sqrt(speed) so a
// burst of virtual steps per real tick does not blow up the variance.
//
// After every step the realised return feeds an EWMA (alpha = 0.1) back into
// market volatility, clamped to [0.01, 0.05]; the trend label follows the
// 10-candle return.
// =============================================================================

use rand::Rng;

use crate::types::{ActiveScenario, Candle, MarketConditions, Trend};

/// Noise scale applied to the market volatility.
const VOLATILITY_DAMPING: f64 = 0.3;
/// EWMA weight for the adaptive volatility recompute.
const VOLATILITY_ALPHA: f64 = 0.1;
/// Clamp band for adaptive volatility.
const VOLATILITY_FLOOR: f64 = 0.01;
const VOLATILITY_CEIL: f64 = 0.05;
/// Baseline drift applied per directional trend.
const TREND_DRIFT: f64 = 1e-4;
/// Candle lookback for the trend recompute.
const TREND_LOOKBACK: usize = 10;

/// Result of one price step.
#[derive(Debug, Clone, Copy)]
pub struct PriceStep {
    pub old_price: f64,
    pub new_price: f64,
    pub change: f64,
    /// Synthetic traded volume attributed to this step.
    pub volume: f64,
}

/// Advance the price by one virtual step and fold the realised return back
/// into `conditions.volatility`. The result is clamped to the global band
/// and to `[initial_price * 0.01, initial_price * 100]`.
pub fn evolve<R: Rng>(
    current_price: f64,
    initial_price: f64,
    conditions: &mut MarketConditions,
    scenario: Option<&ActiveScenario>,
    liquidity: f64,
    speed: u32,
    batched: bool,
    rng: &mut R,
) -> PriceStep {
    let mut base_volatility = conditions.volatility * VOLATILITY_DAMPING;
    if batched {
        base_volatility /= (speed.max(1) as f64).sqrt();
    }

    let trend_factor = match scenario {
        Some(s) => {
            base_volatility *= s.volatility_multiplier;
            s.trend_factor()
        }
        None => conditions.trend.direction() * TREND_DRIFT,
    };

    let random_factor = (rng.gen::<f64>() - 0.5) * base_volatility;
    let change = current_price * (trend_factor + random_factor);

    let floor = (initial_price * 0.01).max(crate::engine::params::MIN_PRICE);
    let ceil = (initial_price * 100.0).min(crate::engine::params::MAX_PRICE);
    let new_price = (current_price + change).clamp(floor, ceil);

    // Adaptive volatility: EWMA of the absolute realised return.
    let realised = if current_price > 0.0 {
        (new_price - current_price).abs() / current_price
    } else {
        0.0
    };
    conditions.volatility = ((1.0 - VOLATILITY_ALPHA) * conditions.volatility
        + VOLATILITY_ALPHA * realised)
        .clamp(VOLATILITY_FLOOR, VOLATILITY_CEIL);

    // Synthetic step volume: a sliver of book liquidity, inflated when the
    // step moved the price hard.
    let volume =
        liquidity * 1e-4 * (0.5 + rng.gen::<f64>()) * (1.0 + realised * 10.0);
    conditions.volume += volume;

    PriceStep {
        old_price: current_price,
        new_price,
        change: new_price - current_price,
        volume,
    }
}

/// Recompute the trend label from the last 10 candles: return above +2% is
/// bullish, below -1.5% bearish, otherwise sideways.
pub fn update_trend(conditions: &mut MarketConditions, price_history: &[Candle]) {
    if price_history.len() < 2 {
        return;
    }
    let window = &price_history[price_history.len().saturating_sub(TREND_LOOKBACK)..];
    let first = window.first().map(|c| c.close).unwrap_or(0.0);
    let last = window.last().map(|c| c.close).unwrap_or(0.0);
    if first <= 0.0 {
        return;
    }

    let ret = (last - first) / first;
    conditions.trend = if ret > 0.02 {
        Trend::Bullish
    } else if ret < -0.015 {
        Trend::Bearish
    } else {
        Trend::Sideways
    };
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScenarioType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn conditions() -> MarketConditions {
        MarketConditions {
            volatility: 0.02,
            trend: Trend::Sideways,
            volume: 0.0,
        }
    }

    #[test]
    fn price_stays_positive_and_clamped() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut cond = conditions();
        let mut price = 5.0;
        for _ in 0..10_000 {
            let step = evolve(price, 5.0, &mut cond, None, 1e6, 1, false, &mut rng);
            price = step.new_price;
            assert!(price > 0.0);
            assert!((0.05..=500.0).contains(&price));
        }
    }

    #[test]
    fn volatility_stays_in_adaptive_band() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut cond = conditions();
        let mut price = 5.0;
        for _ in 0..1_000 {
            price = evolve(price, 5.0, &mut cond, None, 1e6, 1, false, &mut rng).new_price;
            assert!((0.01..=0.05).contains(&cond.volatility));
        }
    }

    #[test]
    fn crash_scenario_forces_price_down() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut cond = conditions();
        let scenario = ActiveScenario::new(ScenarioType::Crash, 1.0, 1.0, 1.0);
        let mut price = 5.0;
        for _ in 0..200 {
            price = evolve(
                price,
                5.0,
                &mut cond,
                Some(&scenario),
                1e6,
                1,
                false,
                &mut rng,
            )
            .new_price;
        }
        // -1% drift per step dominates the noise over 200 steps.
        assert!(price < 2.0, "crash should drive price down, got {price}");
    }

    #[test]
    fn pump_scenario_forces_price_up() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut cond = conditions();
        let scenario = ActiveScenario::new(ScenarioType::Pump, 1.0, 1.0, 1.0);
        let mut price = 5.0;
        for _ in 0..200 {
            price = evolve(
                price,
                5.0,
                &mut cond,
                Some(&scenario),
                1e6,
                1,
                false,
                &mut rng,
            )
            .new_price;
        }
        assert!(price > 10.0, "pump should drive price up, got {price}");
    }

    #[test]
    fn batched_path_damps_noise() {
        let steps = |batched: bool| {
            let mut rng = StdRng::seed_from_u64(5);
            let mut cond = conditions();
            let mut max_move = 0.0_f64;
            let mut price = 5.0;
            for _ in 0..500 {
                let step = evolve(price, 5.0, &mut cond, None, 1e6, 400, batched, &mut rng);
                max_move = max_move.max((step.change / step.old_price).abs());
                price = step.new_price;
            }
            max_move
        };
        assert!(steps(true) < steps(false));
    }

    #[test]
    fn trend_updates_from_candle_returns() {
        let candle = |close: f64| Candle {
            timestamp: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        };

        let mut cond = conditions();
        let rising: Vec<Candle> = (0..10).map(|i| candle(5.0 + i as f64 * 0.1)).collect();
        update_trend(&mut cond, &rising);
        assert_eq!(cond.trend, Trend::Bullish);

        let falling: Vec<Candle> = (0..10).map(|i| candle(5.0 - i as f64 * 0.1)).collect();
        update_trend(&mut cond, &falling);
        assert_eq!(cond.trend, Trend::Bearish);

        let flat: Vec<Candle> = (0..10).map(|_| candle(5.0)).collect();
        update_trend(&mut cond, &flat);
        assert_eq!(cond.trend, Trend::Sideways);
    }

    #[test]
    fn trend_ignores_short_history() {
        let mut cond = conditions();
        cond.trend = Trend::Bullish;
        update_trend(&mut cond, &[]);
        assert_eq!(cond.trend, Trend::Bullish);
    }
}
