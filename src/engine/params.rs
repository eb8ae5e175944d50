// =============================================================================
// Simulation Parameters — creation-time configuration and validation
// =============================================================================
//
// Parameters are set when a simulation is created and are immutable apart
// from `time_compression_factor`, which the speed API may change while the
// simulation runs. Validation happens at the REST boundary; anything that
// reaches the engine is already in range.
// =============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{PriceRange, ScenarioType};

/// Bounds for `duration` (seconds).
pub const MIN_DURATION_SECS: u64 = 60;
pub const MAX_DURATION_SECS: u64 = 86_400;
/// Bounds for `volatility_factor`.
pub const MIN_VOLATILITY_FACTOR: f64 = 0.1;
pub const MAX_VOLATILITY_FACTOR: f64 = 10.0;
/// Bounds for `time_compression_factor` (speed).
pub const MIN_SPEED: u32 = 1;
pub const MAX_SPEED: u32 = 1_000;
/// Global price band.
pub const MIN_PRICE: f64 = 1e-6;
pub const MAX_PRICE: f64 = 1e6;

/// Full per-simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParameters {
    pub initial_price: f64,
    pub initial_liquidity: f64,
    pub volatility_factor: f64,
    /// Run length in seconds of virtual time.
    pub duration: u64,
    /// Speed multiplier, mutable via the speed API.
    pub time_compression_factor: u32,
    pub scenario_type: Option<ScenarioType>,
    pub price_range: Option<PriceRange>,
    pub custom_price: Option<f64>,
    #[serde(default)]
    pub use_custom_price: bool,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            initial_price: 1.0,
            initial_liquidity: 1_000_000.0,
            volatility_factor: 1.0,
            duration: 3_600,
            time_compression_factor: 1,
            scenario_type: None,
            price_range: None,
            custom_price: None,
            use_custom_price: false,
        }
    }
}

impl SimulationParameters {
    /// Validate all ranges. Returns every violation, not just the first, so
    /// the API can report them together.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut reasons = Vec::new();

        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&self.duration) {
            reasons.push(format!(
                "duration must be within {MIN_DURATION_SECS}..{MAX_DURATION_SECS} seconds (got {})",
                self.duration
            ));
        }
        if !(MIN_VOLATILITY_FACTOR..=MAX_VOLATILITY_FACTOR).contains(&self.volatility_factor)
            || !self.volatility_factor.is_finite()
        {
            reasons.push(format!(
                "volatilityFactor must be within {MIN_VOLATILITY_FACTOR}..{MAX_VOLATILITY_FACTOR} (got {})",
                self.volatility_factor
            ));
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&self.time_compression_factor) {
            reasons.push(format!(
                "timeCompressionFactor must be within {MIN_SPEED}..{MAX_SPEED} (got {})",
                self.time_compression_factor
            ));
        }
        if self.use_custom_price {
            match self.custom_price {
                Some(p) if p.is_finite() && (MIN_PRICE..=MAX_PRICE).contains(&p) => {}
                Some(p) => reasons.push(format!(
                    "customPrice must be within {MIN_PRICE}..{MAX_PRICE} (got {p})"
                )),
                None => reasons.push("useCustomPrice set without customPrice".to_string()),
            }
        }
        if !self.initial_liquidity.is_finite() || self.initial_liquidity <= 0.0 {
            reasons.push(format!(
                "initialLiquidity must be positive (got {})",
                self.initial_liquidity
            ));
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }

    /// Draw the starting price for a run. Priority: explicit custom price,
    /// then the configured price band (resolving `random`), then the
    /// creation-time `initial_price`.
    pub fn generate_initial_price<R: Rng>(&self, rng: &mut R) -> f64 {
        if self.use_custom_price {
            if let Some(p) = self.custom_price {
                return p.clamp(MIN_PRICE, MAX_PRICE);
            }
        }

        if let Some(range) = self.price_range {
            let band = range.resolve(rng);
            let (lo, hi) = band.bounds();
            return rng.gen_range(lo..hi);
        }

        self.initial_price.clamp(MIN_PRICE, MAX_PRICE)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(SimulationParameters::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_duration_rejected() {
        let mut params = SimulationParameters::default();
        params.duration = 30;
        let reasons = params.validate().unwrap_err();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("duration"));

        params.duration = 100_000;
        assert!(params.validate().is_err());
    }

    #[test]
    fn multiple_violations_all_reported() {
        let params = SimulationParameters {
            duration: 10,
            volatility_factor: 50.0,
            time_compression_factor: 5_000,
            ..SimulationParameters::default()
        };
        let reasons = params.validate().unwrap_err();
        assert_eq!(reasons.len(), 3);
    }

    #[test]
    fn custom_price_requires_value() {
        let params = SimulationParameters {
            use_custom_price: true,
            custom_price: None,
            ..SimulationParameters::default()
        };
        assert!(params.validate().is_err());

        let params = SimulationParameters {
            use_custom_price: true,
            custom_price: Some(0.25),
            ..SimulationParameters::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn custom_price_wins_over_range() {
        let params = SimulationParameters {
            use_custom_price: true,
            custom_price: Some(0.25),
            price_range: Some(PriceRange::Mega),
            ..SimulationParameters::default()
        };
        let mut rng = rand::thread_rng();
        assert_eq!(params.generate_initial_price(&mut rng), 0.25);
    }

    #[test]
    fn mid_range_draws_within_band() {
        let params = SimulationParameters {
            price_range: Some(PriceRange::Mid),
            ..SimulationParameters::default()
        };
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let price = params.generate_initial_price(&mut rng);
            assert!((1.0..10.0).contains(&price), "price {price} outside mid band");
        }
    }

    #[test]
    fn random_range_always_in_global_band() {
        let params = SimulationParameters {
            price_range: Some(PriceRange::Random),
            ..SimulationParameters::default()
        };
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let price = params.generate_initial_price(&mut rng);
            assert!((MIN_PRICE..=MAX_PRICE).contains(&price));
        }
    }
}
