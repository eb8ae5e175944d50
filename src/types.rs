// =============================================================================
// Core Domain Types — Vertex Market Simulator
// =============================================================================
//
// Shared vocabulary for the whole engine: trade actions, market trend,
// TPS operating modes, price categories, scenario forcing, and the
// pool-allocated Trade / Position records.
//
// All wire-facing types serialize with camelCase field names to match the
// dashboard protocol.
// =============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::pool::Poolable;

// ---------------------------------------------------------------------------
// Trade action
// ---------------------------------------------------------------------------

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    /// Signed direction: +1 for buy, -1 for sell.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market trend
// ---------------------------------------------------------------------------

/// Directional bias of the market, recomputed from recent candle returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Sideways,
}

impl Trend {
    /// Signed direction: +1 bullish, -1 bearish, 0 sideways.
    pub fn direction(self) -> f64 {
        match self {
            Self::Bullish => 1.0,
            Self::Bearish => -1.0,
            Self::Sideways => 0.0,
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Sideways => write!(f, "sideways"),
        }
    }
}

// ---------------------------------------------------------------------------
// TPS operating modes
// ---------------------------------------------------------------------------

/// Throughput band the simulation operates in. Each mode carries a target
/// transactions-per-second figure and a multiplier applied both to trader
/// action probability and to external-trade price impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TpsMode {
    Normal,
    Burst,
    Stress,
    Hft,
}

impl TpsMode {
    /// Target transactions per second for this mode.
    pub fn target_tps(self) -> u32 {
        match self {
            Self::Normal => 25,
            Self::Burst => 150,
            Self::Stress => 1_500,
            Self::Hft => 15_000,
        }
    }

    /// Multiplier applied to trader action probability and external-trade
    /// price impact.
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Burst => 1.2,
            Self::Stress => 2.0,
            Self::Hft => 1.8,
        }
    }

    /// Liquidation cascades are only permitted in the high-throughput bands.
    pub fn allows_liquidation_cascade(self) -> bool {
        matches!(self, Self::Stress | Self::Hft)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NORMAL" => Some(Self::Normal),
            "BURST" => Some(Self::Burst),
            "STRESS" => Some(Self::Stress),
            "HFT" => Some(Self::Hft),
            _ => None,
        }
    }
}

impl std::fmt::Display for TpsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Burst => write!(f, "BURST"),
            Self::Stress => write!(f, "STRESS"),
            Self::Hft => write!(f, "HFT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Price categories
// ---------------------------------------------------------------------------

/// Price band a simulated token lives in. Controls the dynamic starting
/// price and how strongly external trades move the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceRange {
    Micro,
    Small,
    Mid,
    Large,
    Mega,
    Random,
}

impl PriceRange {
    /// Inclusive-exclusive price bounds used to draw a dynamic initial price.
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Self::Micro => (0.0001, 0.01),
            Self::Small => (0.01, 1.0),
            Self::Mid => (1.0, 10.0),
            Self::Large => (10.0, 100.0),
            Self::Mega => (100.0, 1_000.0),
            // Random resolves to a concrete band before use.
            Self::Random => (1.0, 10.0),
        }
    }

    /// Resolve `Random` into a concrete band.
    pub fn resolve<R: Rng>(self, rng: &mut R) -> PriceRange {
        if self != Self::Random {
            return self;
        }
        match rng.gen_range(0..5) {
            0 => Self::Micro,
            1 => Self::Small,
            2 => Self::Mid,
            3 => Self::Large,
            _ => Self::Mega,
        }
    }

    /// Classify an arbitrary positive price into its band.
    pub fn for_price(price: f64) -> PriceRange {
        if price < 0.01 {
            Self::Micro
        } else if price < 1.0 {
            Self::Small
        } else if price < 10.0 {
            Self::Mid
        } else if price < 100.0 {
            Self::Large
        } else {
            Self::Mega
        }
    }

    /// Multiplier applied to external-trade price impact for this band.
    pub fn impact_multiplier(self) -> f64 {
        match self {
            Self::Micro => 1.8,
            Self::Small => 1.4,
            Self::Mid | Self::Random => 1.0,
            Self::Large => 0.8,
            Self::Mega => 0.6,
        }
    }

    /// Maximum absolute per-trade impact (as a fraction of price).
    pub fn max_impact(self) -> f64 {
        match self {
            Self::Micro => 0.05,
            Self::Small => 0.03,
            Self::Mid | Self::Random => 0.02,
            Self::Large => 0.015,
            Self::Mega => 0.01,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "micro" => Some(Self::Micro),
            "small" => Some(Self::Small),
            "mid" => Some(Self::Mid),
            "large" => Some(Self::Large),
            "mega" => Some(Self::Mega),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario forcing
// ---------------------------------------------------------------------------

/// A temporary forcing function layered over the price evolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioType {
    Crash,
    Pump,
    Breakout,
    Trend,
    Consolidation,
    Accumulation,
    Distribution,
}

impl ScenarioType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "crash" => Some(Self::Crash),
            "pump" => Some(Self::Pump),
            "breakout" => Some(Self::Breakout),
            "trend" => Some(Self::Trend),
            "consolidation" => Some(Self::Consolidation),
            "accumulation" => Some(Self::Accumulation),
            "distribution" => Some(Self::Distribution),
            _ => None,
        }
    }
}

/// A scenario instance attached to a running simulation. `direction` is
/// only meaningful for breakout/trend (±1); intensity scales the forcing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveScenario {
    pub scenario: ScenarioType,
    pub intensity: f64,
    pub direction: f64,
    pub volatility_multiplier: f64,
}

impl ActiveScenario {
    /// Build a scenario with a configured volatility multiplier. Scenario
    /// families that dampen volatility override the configured value.
    pub fn new(scenario: ScenarioType, intensity: f64, direction: f64, configured_vol: f64) -> Self {
        let volatility_multiplier = match scenario {
            ScenarioType::Crash | ScenarioType::Pump | ScenarioType::Breakout => configured_vol,
            ScenarioType::Trend => 0.5,
            ScenarioType::Consolidation => 0.2,
            ScenarioType::Accumulation | ScenarioType::Distribution => 0.3,
        };
        Self {
            scenario,
            intensity,
            direction: if direction < 0.0 { -1.0 } else { 1.0 },
            volatility_multiplier,
        }
    }

    /// Per-tick trend forcing contributed by this scenario.
    pub fn trend_factor(&self) -> f64 {
        match self.scenario {
            ScenarioType::Crash => -0.01 * self.intensity,
            ScenarioType::Pump => 0.01 * self.intensity,
            ScenarioType::Breakout => 0.005 * self.intensity * self.direction,
            ScenarioType::Trend => 0.002 * self.intensity * self.direction,
            ScenarioType::Consolidation => 0.0,
            ScenarioType::Accumulation => 0.0005 * self.intensity,
            ScenarioType::Distribution => -0.0005 * self.intensity,
        }
    }
}

// ---------------------------------------------------------------------------
// Trader vocabulary
// ---------------------------------------------------------------------------

/// Trading style of a synthetic trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraderStrategy {
    Scalper,
    Swing,
    Momentum,
    Contrarian,
}

/// Exit thresholds for a strategy. Percentages are fractions of entry price;
/// `max_minutes` is measured in virtual minutes.
#[derive(Debug, Clone, Copy)]
pub struct ExitRules {
    pub take_profit: f64,
    pub stop_loss: f64,
    pub max_minutes: f64,
    pub timeout_exit_probability: f64,
    /// When set, the timeout only fires while the position is in profit.
    pub timeout_profit_only: bool,
}

impl TraderStrategy {
    pub fn exit_rules(self) -> ExitRules {
        match self {
            Self::Scalper => ExitRules {
                take_profit: 0.005,
                stop_loss: -0.003,
                max_minutes: 30.0,
                timeout_exit_probability: 1.0,
                timeout_profit_only: false,
            },
            Self::Swing => ExitRules {
                take_profit: 0.02,
                stop_loss: -0.01,
                max_minutes: 180.0,
                timeout_exit_probability: 0.3,
                timeout_profit_only: false,
            },
            Self::Momentum => ExitRules {
                take_profit: 0.03,
                stop_loss: -0.015,
                max_minutes: 120.0,
                timeout_exit_probability: 0.2,
                timeout_profit_only: true,
            },
            Self::Contrarian => ExitRules {
                take_profit: 0.015,
                stop_loss: -0.02,
                max_minutes: 90.0,
                timeout_exit_probability: 0.4,
                timeout_profit_only: false,
            },
        }
    }

    /// Default exit thresholds for traders without a recognised strategy.
    pub fn default_exit_rules() -> ExitRules {
        ExitRules {
            take_profit: 0.01,
            stop_loss: -0.005,
            max_minutes: 60.0,
            timeout_exit_probability: 0.5,
            timeout_profit_only: false,
        }
    }
}

impl std::fmt::Display for TraderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalper => write!(f, "scalper"),
            Self::Swing => write!(f, "swing"),
            Self::Momentum => write!(f, "momentum"),
            Self::Contrarian => write!(f, "contrarian"),
        }
    }
}

/// How aggressively a trader sizes positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSizing {
    Conservative,
    Moderate,
    Aggressive,
}

impl PositionSizing {
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Conservative => 1.0,
            Self::Moderate => 1.5,
            Self::Aggressive => 3.0,
        }
    }
}

/// Identity + running PnL of a synthetic trader, embedded in trades and
/// positions so the dashboard can render them without a second lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraderInfo {
    pub wallet_address: String,
    pub preferred_name: String,
    pub net_pnl: f64,
}

/// Full profile of a synthetic trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraderProfile {
    pub trader: TraderInfo,
    pub strategy: TraderStrategy,
    /// Probability weight in (0, 1] that this trader considers acting on a
    /// given tick.
    pub trading_frequency: f64,
    pub position_sizing: PositionSizing,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_profile: String,
}

// ---------------------------------------------------------------------------
// Market conditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketConditions {
    pub volatility: f64,
    pub trend: Trend,
    pub volume: f64,
}

impl Default for MarketConditions {
    fn default() -> Self {
        Self {
            volatility: 0.02,
            trend: Trend::Sideways,
            volume: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// OHLCV summary of price activity over one aggregation interval. The
/// timestamp is aligned to the interval boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// OHLC integrity: all positive, volume non-negative, and
    /// `low <= min(open, close) <= max(open, close) <= high`.
    pub fn is_valid(&self) -> bool {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
            && self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
            && self.low <= body_low
            && body_high <= self.high
    }
}

// ---------------------------------------------------------------------------
// Trade (pool-allocated)
// ---------------------------------------------------------------------------

/// A single executed trade. Allocated from the trade pool; released when it
/// is evicted from the recent-trades ring or the simulation is deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub timestamp: i64,
    pub trader: TraderInfo,
    pub action: Option<TradeAction>,
    pub price: f64,
    pub quantity: f64,
    pub value: f64,
    pub impact: f64,
}

impl Poolable for Trade {
    fn reset(&mut self) -> bool {
        self.id.clear();
        self.timestamp = 0;
        self.trader = TraderInfo::default();
        self.action = None;
        self.price = 0.0;
        self.quantity = 0.0;
        self.value = 0.0;
        self.impact = 0.0;
        true
    }
}

// ---------------------------------------------------------------------------
// Position (pool-allocated)
// ---------------------------------------------------------------------------

/// An open position held by a synthetic trader. Quantity is signed:
/// positive = long, negative = short.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub trader: TraderInfo,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: i64,
    pub current_pnl: f64,
    pub current_pnl_percentage: f64,
}

impl Position {
    /// Recompute mark-to-market PnL against `price`.
    pub fn mark(&mut self, price: f64) {
        self.current_pnl = (price - self.entry_price) * self.quantity;
        self.current_pnl_percentage = if self.entry_price > 0.0 {
            let dir = if self.quantity >= 0.0 { 1.0 } else { -1.0 };
            dir * ((price - self.entry_price) / self.entry_price) * 100.0
        } else {
            0.0
        };
    }
}

impl Poolable for Position {
    fn reset(&mut self) -> bool {
        self.trader = TraderInfo::default();
        self.entry_price = 0.0;
        self.quantity = 0.0;
        self.entry_time = 0;
        self.current_pnl = 0.0;
        self.current_pnl_percentage = 0.0;
        true
    }
}

/// Pool-allocated payload for the hot `price_update` event path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub timestamp: i64,
    pub price: f64,
    pub volume: f64,
    pub trend: Option<Trend>,
    pub volatility: f64,
}

impl Poolable for PriceUpdate {
    fn reset(&mut self) -> bool {
        self.timestamp = 0;
        self.price = 0.0;
        self.volume = 0.0;
        self.trend = None;
        self.volatility = 0.0;
        true
    }
}

/// A realised position, moved to the append-only closed log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPosition {
    pub trader: TraderInfo,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: i64,
    pub exit_price: f64,
    pub exit_time: i64,
    pub current_pnl: f64,
    pub current_pnl_percentage: f64,
}

// ---------------------------------------------------------------------------
// External market metrics
// ---------------------------------------------------------------------------

/// Monotone counters describing externally injected flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMarketMetrics {
    /// Target TPS for the current mode.
    pub current_tps: u32,
    /// Measured trades per second over the last sampling window.
    pub actual_tps: f64,
    pub queue_depth: usize,
    pub processed_orders: u64,
    pub rejected_orders: u64,
    pub liquidations_triggered: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tps_mode_targets() {
        assert_eq!(TpsMode::Normal.target_tps(), 25);
        assert_eq!(TpsMode::Burst.target_tps(), 150);
        assert_eq!(TpsMode::Stress.target_tps(), 1_500);
        assert_eq!(TpsMode::Hft.target_tps(), 15_000);
    }

    #[test]
    fn tps_mode_parse_roundtrip() {
        for mode in [TpsMode::Normal, TpsMode::Burst, TpsMode::Stress, TpsMode::Hft] {
            assert_eq!(TpsMode::parse(&mode.to_string()), Some(mode));
        }
        assert_eq!(TpsMode::parse("warp"), None);
    }

    #[test]
    fn cascade_only_in_high_bands() {
        assert!(!TpsMode::Normal.allows_liquidation_cascade());
        assert!(!TpsMode::Burst.allows_liquidation_cascade());
        assert!(TpsMode::Stress.allows_liquidation_cascade());
        assert!(TpsMode::Hft.allows_liquidation_cascade());
    }

    #[test]
    fn price_range_classification() {
        assert_eq!(PriceRange::for_price(0.001), PriceRange::Micro);
        assert_eq!(PriceRange::for_price(0.5), PriceRange::Small);
        assert_eq!(PriceRange::for_price(5.0), PriceRange::Mid);
        assert_eq!(PriceRange::for_price(50.0), PriceRange::Large);
        assert_eq!(PriceRange::for_price(500.0), PriceRange::Mega);
    }

    #[test]
    fn random_range_resolves_to_concrete_band() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let band = PriceRange::Random.resolve(&mut rng);
            assert_ne!(band, PriceRange::Random);
        }
    }

    #[test]
    fn scenario_trend_factors() {
        let crash = ActiveScenario::new(ScenarioType::Crash, 2.0, 1.0, 3.0);
        assert!((crash.trend_factor() + 0.02).abs() < 1e-12);
        assert!((crash.volatility_multiplier - 3.0).abs() < 1e-12);

        let consolidation = ActiveScenario::new(ScenarioType::Consolidation, 2.0, 1.0, 3.0);
        assert_eq!(consolidation.trend_factor(), 0.0);
        assert!((consolidation.volatility_multiplier - 0.2).abs() < 1e-12);

        let breakout_down = ActiveScenario::new(ScenarioType::Breakout, 1.0, -1.0, 1.0);
        assert!(breakout_down.trend_factor() < 0.0);
    }

    #[test]
    fn exit_rules_table() {
        let scalper = TraderStrategy::Scalper.exit_rules();
        assert!((scalper.take_profit - 0.005).abs() < 1e-12);
        assert!((scalper.timeout_exit_probability - 1.0).abs() < 1e-12);

        let momentum = TraderStrategy::Momentum.exit_rules();
        assert!(momentum.timeout_profit_only);

        let fallback = TraderStrategy::default_exit_rules();
        assert!((fallback.max_minutes - 60.0).abs() < 1e-12);
    }

    #[test]
    fn candle_validity() {
        let good = Candle {
            timestamp: 0,
            open: 2.0,
            high: 3.0,
            low: 1.0,
            close: 2.5,
            volume: 10.0,
        };
        assert!(good.is_valid());

        let bad = Candle {
            high: 1.5,
            ..good.clone()
        };
        assert!(!bad.is_valid());

        let negative = Candle {
            low: -1.0,
            ..good
        };
        assert!(!negative.is_valid());
    }

    #[test]
    fn position_mark_long_and_short() {
        let mut long = Position {
            entry_price: 10.0,
            quantity: 5.0,
            ..Position::default()
        };
        long.mark(11.0);
        assert!((long.current_pnl - 5.0).abs() < 1e-12);
        assert!(long.current_pnl_percentage > 0.0);

        let mut short = Position {
            entry_price: 10.0,
            quantity: -5.0,
            ..Position::default()
        };
        short.mark(11.0);
        assert!(short.current_pnl < 0.0);
        assert!(short.current_pnl_percentage < 0.0);
    }
}
