// =============================================================================
// Simulation Engine — per-simulation state and the tick loop
// =============================================================================
//
// One engine per simulation id. The engine exclusively owns its
// SimulationState; every mutation happens either from the engine's own tick
// task or from a control operation, with the state lock held for the whole
// step so ticks are strictly serial per simulation.
//
// Lifecycle:
//
//            create                        start                  pause
//   created ────────► initialized ────────► running ────────────► paused
//                                             ▲                     │
//                                             └─────── start ───────┘
//   reset (any state) → initialized        delete (any state) → terminated
//
// The (is_running, is_paused) pair must never be (true, true); every control
// transition re-reads the flags and force-corrects on violation.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::candles::{CandleCoordinator, PriceSample};
use crate::events::{EventSink, EventType, SimEvent};
use crate::pool::{ObjectPool, Pooled};
use crate::queue::TransactionQueue;
use crate::types::{
    ActiveScenario, Candle, ClosedPosition, ExternalMarketMetrics, MarketConditions, Position,
    PriceRange, PriceUpdate, TpsMode, Trade, TradeAction, TraderInfo, TraderProfile,
};

use super::orderbook::OrderBookSnapshot;
use super::params::{SimulationParameters, MAX_PRICE, MAX_SPEED, MIN_PRICE, MIN_SPEED};
use super::price;
use super::traders::{
    self, DecisionAction, DecisionContext, PositionBrief, TraderDecision,
    BASE_ACTION_MULTIPLIER, DEFAULT_TRADER_COUNT, MAX_ACTION_MULTIPLIER,
};

/// Virtual milliseconds one tick advances per unit of speed.
const VIRTUAL_MS_PER_TICK: i64 = 60_000;
/// Recent-trades retention.
const MAX_RECENT_TRADES: usize = 1_000;
/// Price history retention (matches the aggregator's cap).
const MAX_PRICE_HISTORY: usize = 250;
/// Baseline scale for external-trade impact.
const EXTERNAL_IMPACT_SCALE: f64 = 0.1;
/// Pause-to-run settling delay on a fresh start.
const START_SETTLE_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed control-path failures, mapped to HTTP statuses at the API boundary.
#[derive(Debug)]
pub enum ControlError {
    /// Operation illegal in the current lifecycle state. State unchanged.
    InvalidState(String),
    /// Parameter validation failures.
    Validation(Vec<String>),
    /// Stress operation attempted outside STRESS/HFT.
    InvalidMode(String),
    /// Control operation exceeded its deadline.
    Timeout,
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Validation(reasons) => write!(f, "validation failed: {}", reasons.join("; ")),
            Self::InvalidMode(msg) => write!(f, "invalid_mode: {msg}"),
            Self::Timeout => write!(f, "control operation timed out"),
        }
    }
}

impl std::error::Error for ControlError {}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Authoritative in-memory record for one simulation.
pub struct SimulationState {
    pub id: String,
    pub start_time: i64,
    pub current_time: i64,
    pub end_time: i64,
    pub is_running: bool,
    pub is_paused: bool,
    pub parameters: SimulationParameters,
    pub current_price: f64,
    /// Anchor for the price clamp band; re-drawn on reset.
    pub anchor_price: f64,
    pub market_conditions: MarketConditions,
    pub price_history: Vec<Candle>,
    pub order_book: OrderBookSnapshot,
    pub traders: Vec<TraderProfile>,
    pub active_positions: HashMap<String, Pooled<Position>>,
    pub closed_positions: Vec<ClosedPosition>,
    /// Newest first.
    pub recent_trades: VecDeque<Pooled<Trade>>,
    pub trader_rankings: Vec<TraderInfo>,
    pub current_tps_mode: TpsMode,
    pub external_market_metrics: ExternalMarketMetrics,
    pub active_scenario: Option<ActiveScenario>,
    pub tick_count: u64,
    // TPS sampling window.
    trades_in_window: u32,
    window_started: Instant,
}

impl SimulationState {
    fn status(&self) -> &'static str {
        if self.is_running {
            "running"
        } else if self.is_paused {
            "paused"
        } else if self.current_time >= self.end_time {
            "ended"
        } else {
            "initialized"
        }
    }

    /// Re-read the lifecycle flags and force-correct the forbidden
    /// (true, true) combination.
    fn enforce_flag_invariant(&mut self) {
        if self.is_running && self.is_paused {
            error!(
                simulation_id = %self.id,
                "lifecycle invariant violated: running and paused both set — forcing paused"
            );
            self.is_running = false;
        }
    }

    fn price_band(&self) -> PriceRange {
        self.parameters
            .price_range
            .filter(|r| *r != PriceRange::Random)
            .unwrap_or_else(|| PriceRange::for_price(self.anchor_price))
    }
}

// ---------------------------------------------------------------------------
// Serialisable views
// ---------------------------------------------------------------------------

/// Full state snapshot served by the REST API and the WebSocket channel.
/// Cloned values only — the snapshot never aliases live state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSnapshot {
    pub id: String,
    pub status: String,
    pub start_time: i64,
    pub current_time: i64,
    pub end_time: i64,
    pub is_running: bool,
    pub is_paused: bool,
    pub parameters: SimulationParameters,
    pub current_price: f64,
    pub market_conditions: MarketConditions,
    pub price_history: Vec<Candle>,
    pub order_book: OrderBookSnapshot,
    pub traders: Vec<TraderProfile>,
    pub active_positions: Vec<Position>,
    pub closed_positions: Vec<ClosedPosition>,
    pub recent_trades: Vec<Trade>,
    pub trader_rankings: Vec<TraderInfo>,
    pub current_tps_mode: TpsMode,
    pub external_market_metrics: ExternalMarketMetrics,
    pub active_scenario: Option<ActiveScenario>,
    pub tick_count: u64,
}

/// Compact listing entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub id: String,
    pub status: String,
    pub is_running: bool,
    pub is_paused: bool,
    pub current_price: f64,
    pub current_time: i64,
    pub end_time: i64,
    pub trader_count: usize,
    pub current_tps_mode: TpsMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyStatus {
    pub ready: bool,
    pub status: String,
}

/// Options accepted by the reset operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetOptions {
    #[serde(default)]
    pub clear_all_data: Option<bool>,
    #[serde(default)]
    pub reset_price: Option<bool>,
    #[serde(default)]
    pub reset_state: Option<bool>,
}

/// Request body for an externally injected trade.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTradeRequest {
    pub id: Option<String>,
    pub trader_id: Option<String>,
    pub action: TradeAction,
    pub price: Option<f64>,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTradeOutcome {
    pub trade: Trade,
    pub new_price: f64,
    pub impact: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeOutcome {
    pub orders_generated: usize,
    pub estimated_impact: f64,
    pub cascade_size: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Per-simulation engine owning the tick loop and lifecycle API.
pub struct SimulationEngine {
    id: String,
    state: RwLock<SimulationState>,
    hub: Arc<dyn EventSink>,
    coordinator: Arc<CandleCoordinator>,
    queue: Arc<TransactionQueue>,
    trade_pool: Arc<ObjectPool<Trade>>,
    position_pool: Arc<ObjectPool<Position>>,
    price_update_pool: Arc<ObjectPool<PriceUpdate>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    decision_workers: usize,
}

impl SimulationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: SimulationParameters,
        hub: Arc<dyn EventSink>,
        coordinator: Arc<CandleCoordinator>,
        queue: Arc<TransactionQueue>,
        trade_pool: Arc<ObjectPool<Trade>>,
        position_pool: Arc<ObjectPool<Position>>,
        price_update_pool: Arc<ObjectPool<PriceUpdate>>,
        decision_workers: usize,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let mut rng = rand::thread_rng();

        let initial_price = params.generate_initial_price(&mut rng);
        let now = chrono::Utc::now().timestamp_millis();
        let end_time = now + (params.duration as i64) * 1_000;

        let market_conditions = MarketConditions {
            volatility: (0.02 * params.volatility_factor).clamp(0.01, 0.05),
            trend: crate::types::Trend::Sideways,
            volume: 0.0,
        };

        let active_scenario = params.scenario_type.map(|scenario| {
            let direction = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            ActiveScenario::new(scenario, 1.0, direction, params.volatility_factor)
        });

        let traders = traders::generate_traders(DEFAULT_TRADER_COUNT, &mut rng);
        let order_book = OrderBookSnapshot::rebuild_around(
            initial_price,
            params.initial_liquidity,
            market_conditions.volatility,
            now,
        );

        let state = SimulationState {
            id: id.clone(),
            start_time: now,
            current_time: now,
            end_time,
            is_running: false,
            is_paused: false,
            current_price: initial_price,
            anchor_price: initial_price,
            market_conditions,
            price_history: Vec::new(),
            order_book,
            traders,
            active_positions: HashMap::new(),
            closed_positions: Vec::new(),
            recent_trades: VecDeque::new(),
            trader_rankings: Vec::new(),
            current_tps_mode: TpsMode::Normal,
            external_market_metrics: ExternalMarketMetrics {
                current_tps: TpsMode::Normal.target_tps(),
                ..ExternalMarketMetrics::default()
            },
            active_scenario,
            tick_count: 0,
            trades_in_window: 0,
            window_started: Instant::now(),
            parameters: params,
        };

        coordinator.ensure_clean_start(&id);
        coordinator.initialize(&id, now, initial_price);

        info!(
            simulation_id = %id,
            initial_price,
            "simulation created"
        );

        Arc::new(Self {
            id,
            state: RwLock::new(state),
            hub,
            coordinator,
            queue,
            trade_pool,
            position_pool,
            price_update_pool,
            stop_tx: Mutex::new(None),
            decision_workers,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SimulationSnapshot {
        let state = self.state.read();
        SimulationSnapshot {
            id: state.id.clone(),
            status: state.status().to_string(),
            start_time: state.start_time,
            current_time: state.current_time,
            end_time: state.end_time,
            is_running: state.is_running,
            is_paused: state.is_paused,
            parameters: state.parameters.clone(),
            current_price: state.current_price,
            market_conditions: state.market_conditions.clone(),
            price_history: state.price_history.clone(),
            order_book: state.order_book.clone(),
            traders: state.traders.clone(),
            active_positions: state
                .active_positions
                .values()
                .map(|p| (**p).clone())
                .collect(),
            closed_positions: state.closed_positions.clone(),
            recent_trades: state.recent_trades.iter().map(|t| (**t).clone()).collect(),
            trader_rankings: state.trader_rankings.clone(),
            current_tps_mode: state.current_tps_mode,
            external_market_metrics: state.external_market_metrics.clone(),
            active_scenario: state.active_scenario,
            tick_count: state.tick_count,
        }
    }

    pub fn summary(&self) -> SimulationSummary {
        let state = self.state.read();
        SimulationSummary {
            id: state.id.clone(),
            status: state.status().to_string(),
            is_running: state.is_running,
            is_paused: state.is_paused,
            current_price: state.current_price,
            current_time: state.current_time,
            end_time: state.end_time,
            trader_count: state.traders.len(),
            current_tps_mode: state.current_tps_mode,
        }
    }

    pub fn ready(&self) -> ReadyStatus {
        let state = self.state.read();
        ReadyStatus {
            ready: !state.traders.is_empty() && state.current_price > 0.0,
            status: state.status().to_string(),
        }
    }

    /// Write the coordinator's validated candle series into price history.
    pub fn publish_candles(&self, candles: &[Candle]) {
        let mut state = self.state.write();
        let keep = candles.len().min(MAX_PRICE_HISTORY);
        state.price_history = candles[candles.len() - keep..].to_vec();
    }

    // ── Lifecycle control ───────────────────────────────────────────────

    /// Start (or resume) the tick loop. Valid from initialized or paused.
    pub async fn start(self: &Arc<Self>) -> Result<(), ControlError> {
        let resuming = {
            let state = self.state.read();
            if state.is_running {
                return Err(ControlError::InvalidState(
                    "simulation already running".into(),
                ));
            }
            if state.current_time >= state.end_time {
                return Err(ControlError::InvalidState(
                    "simulation has ended — reset before starting".into(),
                ));
            }
            state.is_paused
        };

        if !resuming {
            // Fresh start: guarantee the candle pipeline is clean, then let
            // the wipe settle before the first tick can race it.
            let (start_time, initial_price) = {
                let state = self.state.read();
                (state.start_time, state.current_price)
            };
            self.coordinator.ensure_clean_start(&self.id);
            self.coordinator
                .initialize(&self.id, start_time, initial_price);
            tokio::time::sleep(Duration::from_millis(START_SETTLE_MS)).await;
        }

        {
            let mut state = self.state.write();
            state.is_running = true;
            state.is_paused = false;
            state.enforce_flag_invariant();
        }

        self.spawn_tick_task();
        self.emit_status("started");
        info!(simulation_id = %self.id, resuming, "simulation started");
        Ok(())
    }

    /// Pause the tick loop. Requires running.
    pub fn pause(&self) -> Result<(), ControlError> {
        {
            let state = self.state.read();
            if !state.is_running {
                return Err(ControlError::InvalidState(
                    "simulation is not running".into(),
                ));
            }
        }

        self.halt_tick_task();
        {
            let mut state = self.state.write();
            state.is_running = false;
            state.is_paused = true;
            state.enforce_flag_invariant();
        }

        self.emit_status("paused");
        info!(simulation_id = %self.id, "simulation paused");
        Ok(())
    }

    /// Reset to a freshly initialized state. Valid from any state.
    pub fn reset(&self, options: &ResetOptions) -> Result<(), ControlError> {
        self.halt_tick_task();

        let mut rng = rand::thread_rng();
        let mut state = self.state.write();

        let reset_price = options.reset_price.unwrap_or(true);
        let clear_all = options.clear_all_data.unwrap_or(true);

        // Release every pooled object back before clearing the collections.
        for (_, position) in state.active_positions.drain() {
            self.position_pool.release(position);
        }
        while let Some(trade) = state.recent_trades.pop_back() {
            self.trade_pool.release(trade);
        }

        let now = chrono::Utc::now().timestamp_millis();
        state.start_time = now;
        state.current_time = now;
        state.end_time = now + (state.parameters.duration as i64) * 1_000;
        state.is_running = false;
        state.is_paused = false;
        state.enforce_flag_invariant();

        if reset_price {
            state.current_price = state.parameters.generate_initial_price(&mut rng);
            state.anchor_price = state.current_price;
        }

        state.market_conditions = MarketConditions {
            volatility: (0.02 * state.parameters.volatility_factor).clamp(0.01, 0.05),
            trend: crate::types::Trend::Sideways,
            volume: 0.0,
        };
        state.price_history.clear();
        state.closed_positions.clear();
        state.trader_rankings.clear();
        state.tick_count = 0;
        state.trades_in_window = 0;
        state.window_started = Instant::now();

        if clear_all {
            for trader in &mut state.traders {
                trader.trader.net_pnl = 0.0;
            }
            let mode = state.current_tps_mode;
            state.external_market_metrics = ExternalMarketMetrics {
                current_tps: mode.target_tps(),
                ..ExternalMarketMetrics::default()
            };
        }

        let liquidity = state.parameters.initial_liquidity;
        let volatility = state.market_conditions.volatility;
        let price = state.current_price;
        state.order_book =
            OrderBookSnapshot::rebuild_around(price, liquidity, volatility, now);

        let start_time = state.start_time;
        drop(state);

        self.coordinator.ensure_clean_start(&self.id);
        self.coordinator.initialize(&self.id, start_time, price);

        let snapshot_price = price;
        self.hub.deliver(
            &self.id,
            SimEvent::now(
                EventType::SimulationReset,
                json!({
                    "price": snapshot_price,
                    "clearAllData": clear_all,
                    "resetPrice": reset_price,
                }),
            ),
        );
        info!(simulation_id = %self.id, price = snapshot_price, "simulation reset");
        Ok(())
    }

    /// Tear the simulation down: stop ticking and release all pool-held
    /// objects. The manager removes registry entries afterwards.
    pub fn terminate(&self) {
        self.halt_tick_task();
        let mut state = self.state.write();
        for (_, position) in state.active_positions.drain() {
            self.position_pool.release(position);
        }
        while let Some(trade) = state.recent_trades.pop_back() {
            self.trade_pool.release(trade);
        }
        state.is_running = false;
        state.is_paused = false;
        info!(simulation_id = %self.id, "simulation terminated");
    }

    /// Change the speed multiplier; takes effect on the next tick.
    pub fn set_speed(&self, speed: u32) -> Result<(), ControlError> {
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            return Err(ControlError::Validation(vec![format!(
                "speed must be within {MIN_SPEED}..{MAX_SPEED} (got {speed})"
            )]));
        }
        let mut state = self.state.write();
        state.parameters.time_compression_factor = speed;
        debug!(simulation_id = %self.id, speed, "speed changed");
        Ok(())
    }

    pub fn tps_mode(&self) -> TpsMode {
        self.state.read().current_tps_mode
    }

    /// Switch the TPS operating band.
    pub fn set_tps_mode(&self, mode: TpsMode) {
        let previous = {
            let mut state = self.state.write();
            let previous = state.current_tps_mode;
            state.current_tps_mode = mode;
            state.external_market_metrics.current_tps = mode.target_tps();
            previous
        };

        self.hub.deliver(
            &self.id,
            SimEvent::now(
                EventType::TpsModeChanged,
                json!({
                    "previousMode": previous.to_string(),
                    "mode": mode.to_string(),
                    "targetTps": mode.target_tps(),
                    "multiplier": mode.multiplier(),
                }),
            ),
        );
        info!(simulation_id = %self.id, %mode, "TPS mode changed");
    }

    // ── External flow ───────────────────────────────────────────────────

    /// Inject one externally originated trade and move the price by its
    /// impact.
    pub fn external_trade(
        &self,
        request: &ExternalTradeRequest,
    ) -> Result<ExternalTradeOutcome, ControlError> {
        if !(request.quantity.is_finite() && request.quantity > 0.0) {
            return Err(ControlError::Validation(vec![format!(
                "quantity must be positive (got {})",
                request.quantity
            )]));
        }
        if let Some(price) = request.price {
            if !(price.is_finite() && (MIN_PRICE..=MAX_PRICE).contains(&price)) {
                return Err(ControlError::Validation(vec![format!(
                    "price must be within {MIN_PRICE}..{MAX_PRICE} (got {price})"
                )]));
            }
        }

        let mut state = self.state.write();

        let fill_price = request.price.unwrap_or(state.current_price);
        let value = fill_price * request.quantity;
        let band = state.price_band();
        let mode = state.current_tps_mode;

        let raw_impact = (value / state.parameters.initial_liquidity.max(1.0))
            * EXTERNAL_IMPACT_SCALE
            * mode.multiplier()
            * band.impact_multiplier();
        let impact =
            request.action.direction() * raw_impact.min(band.max_impact());

        let floor = (state.anchor_price * 0.01).max(MIN_PRICE);
        let ceil = (state.anchor_price * 100.0).min(MAX_PRICE);
        let new_price = (state.current_price * (1.0 + impact)).clamp(floor, ceil);
        state.current_price = new_price;

        let mut trade = self.trade_pool.acquire();
        trade.id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        trade.timestamp = state.current_time;
        trade.trader = TraderInfo {
            wallet_address: request
                .trader_id
                .clone()
                .unwrap_or_else(|| "external".to_string()),
            preferred_name: "External".to_string(),
            net_pnl: 0.0,
        };
        trade.action = Some(request.action);
        trade.price = fill_price;
        trade.quantity = request.quantity;
        trade.value = value;
        trade.impact = impact;
        let trade_copy = (*trade).clone();

        state.external_market_metrics.processed_orders += 1;
        state.trades_in_window += 1;
        Self::push_recent_trade(&mut state, trade, &self.trade_pool);

        let current_price = state.current_price;
        drop(state);

        self.hub.deliver(
            &self.id,
            SimEvent::now(
                EventType::Trade,
                serde_json::to_value(&trade_copy).unwrap_or_default(),
            ),
        );
        self.hub.deliver(
            &self.id,
            SimEvent::now(
                EventType::ExternalMarketPressure,
                json!({
                    "impact": impact,
                    "newPrice": current_price,
                    "action": trade_copy.action,
                }),
            ),
        );
        self.queue.add_trade(trade_copy.clone(), &self.id);

        Ok(ExternalTradeOutcome {
            trade: trade_copy,
            new_price: current_price,
            impact,
        })
    }

    /// Stress tool: a burst of synthetic sell orders. Only valid in
    /// STRESS/HFT modes.
    pub fn liquidation_cascade(&self) -> Result<CascadeOutcome, ControlError> {
        let mode = self.tps_mode();
        if !mode.allows_liquidation_cascade() {
            return Err(ControlError::InvalidMode(format!(
                "liquidation cascade requires STRESS or HFT mode (current {mode})"
            )));
        }

        let mut rng = rand::thread_rng();
        let orders = rng.gen_range(15..=40usize);
        let mut state = self.state.write();

        let band = state.price_band();
        let mut total_impact = 0.0;
        let mut cascade_notional = 0.0;
        let mut trade_copies = Vec::with_capacity(orders);

        for i in 0..orders {
            let price = state.current_price;
            let value = state.parameters.initial_liquidity
                * rng.gen_range(0.001..0.01)
                * mode.multiplier();
            let quantity = value / price.max(MIN_PRICE);

            let raw_impact = (value / state.parameters.initial_liquidity.max(1.0))
                * EXTERNAL_IMPACT_SCALE
                * mode.multiplier()
                * band.impact_multiplier();
            let impact = -raw_impact.min(band.max_impact());

            let floor = (state.anchor_price * 0.01).max(MIN_PRICE);
            state.current_price = (price * (1.0 + impact)).max(floor);
            total_impact += impact;
            cascade_notional += value;

            let mut trade = self.trade_pool.acquire();
            trade.id = format!("cascade-{}-{i}", Uuid::new_v4());
            trade.timestamp = state.current_time;
            trade.trader = TraderInfo {
                wallet_address: "liquidation-engine".to_string(),
                preferred_name: "Liquidator".to_string(),
                net_pnl: 0.0,
            };
            trade.action = Some(TradeAction::Sell);
            trade.price = price;
            trade.quantity = quantity;
            trade.value = value;
            trade.impact = impact;
            trade_copies.push((*trade).clone());
            Self::push_recent_trade(&mut state, trade, &self.trade_pool);
        }

        state.external_market_metrics.liquidations_triggered += 1;
        state.external_market_metrics.processed_orders += orders as u64;
        state.trades_in_window += orders as u32;
        drop(state);

        for copy in &trade_copies {
            self.queue.add_priority_trade(copy.clone(), &self.id);
        }
        self.hub.deliver(
            &self.id,
            SimEvent::now(
                EventType::LiquidationCascadeTriggered,
                json!({
                    "ordersGenerated": orders,
                    "estimatedImpact": total_impact,
                    "cascadeSize": cascade_notional,
                }),
            ),
        );
        warn!(
            simulation_id = %self.id,
            orders,
            total_impact,
            "liquidation cascade triggered"
        );

        Ok(CascadeOutcome {
            orders_generated: orders,
            estimated_impact: total_impact,
            cascade_size: cascade_notional,
        })
    }

    // ── Tick machinery ──────────────────────────────────────────────────

    /// Real-tick interval and virtual steps per tick for a speed setting.
    pub fn tick_schedule(speed: u32) -> (Duration, u32) {
        let speed = speed.clamp(MIN_SPEED, MAX_SPEED);
        if speed <= 10 {
            (Duration::from_millis((1_000 / speed) as u64), 1)
        } else if speed <= 50 {
            let steps = ((50 * speed) as f64 / 1_000.0).round().max(1.0) as u32;
            (Duration::from_millis(50), steps)
        } else {
            let steps = ((10 * speed) as f64 / 1_000.0).round().max(1.0) as u32;
            (Duration::from_millis(10), steps)
        }
    }

    fn spawn_tick_task(self: &Arc<Self>) {
        let mut guard = self.stop_tx.lock();
        if guard.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        *guard = Some(stop_tx);
        drop(guard);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_loop(stop_rx).await;
        });
    }

    fn halt_tick_task(&self) {
        if let Some(stop) = self.stop_tx.lock().take() {
            let _ = stop.send(true);
        }
    }

    async fn run_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        debug!(simulation_id = %self.id, "tick loop started");
        loop {
            let speed = {
                let state = self.state.read();
                if !state.is_running {
                    break;
                }
                state.parameters.time_compression_factor
            };
            let (interval, steps) = Self::tick_schedule(speed);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if self.tick(steps).await {
                        // End of virtual time: auto-pause.
                        {
                            let mut state = self.state.write();
                            state.is_running = false;
                            state.is_paused = true;
                            state.enforce_flag_invariant();
                        }
                        self.stop_tx.lock().take();
                        self.emit_status("ended");
                        info!(simulation_id = %self.id, "simulation reached end time — auto-paused");
                        return;
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(simulation_id = %self.id, "tick loop stopped");
    }

    /// Run `steps` virtual steps. Returns true when the simulation reached
    /// its end time.
    async fn tick(self: &Arc<Self>, steps: u32) -> bool {
        let batched = steps > 1;

        for _ in 0..steps {
            // Decision rounds against a snapshot context; the parallel path
            // scatters the population across workers.
            let (ctx, profiles, speed) = {
                let state = self.state.read();
                if !state.is_running {
                    return false;
                }
                let ctx = self.decision_context(&state, steps);
                (Arc::new(ctx), Arc::new(state.traders.clone()), state.parameters.time_compression_factor)
            };

            let decisions = if speed > 10 {
                traders::decide_all_parallel(profiles, ctx.clone(), self.decision_workers)
                    .await
            } else {
                let mut rng = rand::thread_rng();
                traders::decide_all(&profiles, &ctx, &mut rng)
            };

            let ended = self.apply_step(&decisions, batched, speed);
            if ended {
                return true;
            }
        }
        false
    }

    fn decision_context(&self, state: &SimulationState, steps: u32) -> DecisionContext {
        let action_multiplier = (BASE_ACTION_MULTIPLIER * steps as f64)
            .min(MAX_ACTION_MULTIPLIER)
            * state.current_tps_mode.multiplier();

        DecisionContext {
            current_price: state.current_price,
            volatility: state.market_conditions.volatility,
            trend: state.market_conditions.trend,
            closes: state.price_history.iter().map(|c| c.close).collect(),
            now: state.current_time,
            action_multiplier,
            positions: state
                .active_positions
                .iter()
                .map(|(wallet, p)| {
                    (
                        wallet.clone(),
                        PositionBrief {
                            entry_price: p.entry_price,
                            quantity: p.quantity,
                            entry_time: p.entry_time,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Apply one virtual step: price, candles, decisions, book, PnL,
    /// events. Returns true when end time was reached.
    fn apply_step(
        self: &Arc<Self>,
        decisions: &[TraderDecision],
        batched: bool,
        speed: u32,
    ) -> bool {
        let mut rng = rand::thread_rng();
        let mut guard = self.state.write();
        let state = &mut *guard;
        if !state.is_running {
            return false;
        }

        // 1. Advance virtual time.
        let dt = VIRTUAL_MS_PER_TICK * speed as i64;
        state.current_time = (state.current_time + dt).min(state.end_time);
        state.tick_count += 1;

        // 2. Price evolution.
        let scenario = state.active_scenario;
        let liquidity = state.parameters.initial_liquidity;
        let anchor = state.anchor_price;
        let current = state.current_price;
        let step = price::evolve(
            current,
            anchor,
            &mut state.market_conditions,
            scenario.as_ref(),
            liquidity,
            speed,
            batched,
            &mut rng,
        );
        state.current_price = step.new_price;
        price::update_trend(&mut state.market_conditions, &state.price_history);

        // 3. Candle sample (verbatim timestamps, validated at the
        //    coordinator boundary).
        self.coordinator.queue_update(
            &self.id,
            PriceSample {
                timestamp: state.current_time,
                price: state.current_price,
                volume: step.volume,
            },
        );

        // 4. Apply trader decisions sequentially.
        let mut events = Vec::new();
        for decision in decisions {
            self.apply_decision(state, decision, &mut events);
        }

        // Cold-start fairness: never let the tape sit below three entries
        // after a tick.
        if state.recent_trades.len() < 3 {
            let ctx = self.decision_context(state, 1);
            let population = state.traders.clone();
            let forced = traders::force_bootstrap(&population, &ctx, &mut rng);
            for decision in &forced {
                self.apply_decision(state, decision, &mut events);
            }
        }

        // 5. Order book rebuild.
        state.order_book = OrderBookSnapshot::rebuild_around(
            state.current_price,
            liquidity,
            state.market_conditions.volatility,
            state.current_time,
        );

        // 6. Mark open positions to the new price.
        let mark_price = state.current_price;
        for position in state.active_positions.values_mut() {
            position.mark(mark_price);
        }

        // 7. TPS sampling window.
        let elapsed = state.window_started.elapsed();
        if elapsed >= Duration::from_secs(1) {
            state.external_market_metrics.actual_tps =
                state.trades_in_window as f64 / elapsed.as_secs_f64();
            state.trades_in_window = 0;
            state.window_started = Instant::now();
        }
        state.external_market_metrics.queue_depth = self.queue.queue_stats().queued;

        let ended = state.current_time >= state.end_time;

        // 8. Emit events after all state mutations for this step. The
        //    price_update payload cycles through its own pool.
        let price_event = {
            let mut update = self.price_update_pool.acquire();
            update.timestamp = state.current_time;
            update.price = state.current_price;
            update.volume = step.volume;
            update.trend = Some(state.market_conditions.trend);
            update.volatility = state.market_conditions.volatility;
            let payload = serde_json::to_value(&*update).unwrap_or_default();
            self.price_update_pool.release(update);
            SimEvent::new(EventType::PriceUpdate, state.current_time, payload)
        };
        let book_event = SimEvent::new(
            EventType::OrderBook,
            state.current_time,
            serde_json::to_value(&state.order_book).unwrap_or_default(),
        );
        let metrics_event = SimEvent::new(
            EventType::ExternalMarketMetrics,
            state.current_time,
            serde_json::to_value(&state.external_market_metrics).unwrap_or_default(),
        );
        drop(guard);

        self.hub.deliver(&self.id, price_event);
        for event in events {
            self.hub.deliver(&self.id, event);
        }
        self.hub.deliver(&self.id, book_event);
        self.hub.deliver(&self.id, metrics_event);

        ended
    }

    /// Apply one trader decision. Events are collected by the caller and
    /// published only after the state mutation is complete, so a Trade is
    /// never observable before its Position.
    fn apply_decision(
        &self,
        state: &mut SimulationState,
        decision: &TraderDecision,
        events: &mut Vec<SimEvent>,
    ) {
        let wallet = &decision.wallet_address;
        match decision.action {
            DecisionAction::Enter { action } => {
                if state.active_positions.contains_key(wallet) {
                    return; // one position per trader
                }
                let Some(profile) = state
                    .traders
                    .iter()
                    .find(|t| &t.trader.wallet_address == wallet)
                    .cloned()
                else {
                    return;
                };

                let price = state.current_price;
                let mut position = self.position_pool.acquire();
                position.trader = profile.trader.clone();
                position.entry_price = price;
                position.quantity = decision.quantity;
                position.entry_time = state.current_time;
                position.current_pnl = 0.0;
                position.current_pnl_percentage = 0.0;
                let position_copy = (*position).clone();
                state.active_positions.insert(wallet.clone(), position);

                let mut trade = self.trade_pool.acquire();
                trade.id = Uuid::new_v4().to_string();
                trade.timestamp = state.current_time;
                trade.trader = profile.trader.clone();
                trade.action = Some(action);
                trade.price = price;
                trade.quantity = decision.quantity.abs();
                trade.value = price * decision.quantity.abs();
                trade.impact = 0.0;
                let trade_copy = (*trade).clone();

                state.trades_in_window += 1;
                Self::push_recent_trade(state, trade, &self.trade_pool);

                events.push(SimEvent::new(
                    EventType::PositionOpen,
                    state.current_time,
                    serde_json::to_value(&position_copy).unwrap_or_default(),
                ));
                events.push(SimEvent::new(
                    EventType::Trade,
                    state.current_time,
                    serde_json::to_value(&trade_copy).unwrap_or_default(),
                ));
                self.queue.add_trade(trade_copy, &self.id);
            }
            DecisionAction::Exit => {
                let Some(mut position) = state.active_positions.remove(wallet) else {
                    return;
                };
                let price = state.current_price;
                position.mark(price);

                let closed = ClosedPosition {
                    trader: position.trader.clone(),
                    entry_price: position.entry_price,
                    quantity: position.quantity,
                    entry_time: position.entry_time,
                    exit_price: price,
                    exit_time: state.current_time,
                    current_pnl: position.current_pnl,
                    current_pnl_percentage: position.current_pnl_percentage,
                };
                let realized = position.current_pnl;
                let close_action = if position.quantity >= 0.0 {
                    TradeAction::Sell
                } else {
                    TradeAction::Buy
                };
                let quantity = position.quantity.abs();
                self.position_pool.release(position);

                // Update trader PnL and re-rank.
                if let Some(profile) = state
                    .traders
                    .iter_mut()
                    .find(|t| &t.trader.wallet_address == wallet)
                {
                    profile.trader.net_pnl += realized;
                }
                state.trader_rankings = state
                    .traders
                    .iter()
                    .map(|t| t.trader.clone())
                    .collect();
                state
                    .trader_rankings
                    .sort_by(|a, b| b.net_pnl.total_cmp(&a.net_pnl));

                let trader_info = closed.trader.clone();
                state.closed_positions.push(closed.clone());

                let mut trade = self.trade_pool.acquire();
                trade.id = Uuid::new_v4().to_string();
                trade.timestamp = state.current_time;
                trade.trader = trader_info;
                trade.action = Some(close_action);
                trade.price = price;
                trade.quantity = quantity;
                trade.value = price * quantity;
                trade.impact = 0.0;
                let trade_copy = (*trade).clone();

                state.trades_in_window += 1;
                Self::push_recent_trade(state, trade, &self.trade_pool);

                events.push(SimEvent::new(
                    EventType::PositionClose,
                    state.current_time,
                    serde_json::to_value(&closed).unwrap_or_default(),
                ));
                events.push(SimEvent::new(
                    EventType::Trade,
                    state.current_time,
                    serde_json::to_value(&trade_copy).unwrap_or_default(),
                ));
                self.queue.add_trade(trade_copy, &self.id);
            }
        }
    }

    /// Newest-first ring with pool release on eviction.
    fn push_recent_trade(
        state: &mut SimulationState,
        trade: Pooled<Trade>,
        pool: &Arc<ObjectPool<Trade>>,
    ) {
        state.recent_trades.push_front(trade);
        while state.recent_trades.len() > MAX_RECENT_TRADES {
            if let Some(evicted) = state.recent_trades.pop_back() {
                pool.release(evicted);
            }
        }
    }

    fn emit_status(&self, reason: &str) {
        let state = self.state.read();
        self.hub.deliver(
            &self.id,
            SimEvent::now(
                EventType::SimulationStatus,
                json!({
                    "status": state.status(),
                    "isRunning": state.is_running,
                    "isPaused": state.is_paused,
                    "currentTime": state.current_time,
                    "reason": reason,
                }),
            ),
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::pool::MonitoredPool;

    #[allow(clippy::type_complexity)]
    fn deps() -> (
        Arc<dyn EventSink>,
        Arc<CandleCoordinator>,
        Arc<TransactionQueue>,
        Arc<ObjectPool<Trade>>,
        Arc<ObjectPool<Position>>,
        Arc<ObjectPool<PriceUpdate>>,
    ) {
        let hub: Arc<dyn EventSink> = Arc::new(NullEventSink);
        let coordinator = Arc::new(CandleCoordinator::new(hub.clone()));
        let queue = Arc::new(TransactionQueue::new(hub.clone()));
        let trade_pool = Arc::new(ObjectPool::new("trades", 2_000, 200));
        let position_pool = Arc::new(ObjectPool::new("positions", 1_000, 100));
        let price_update_pool = Arc::new(ObjectPool::new("price-updates", 500, 50));
        (hub, coordinator, queue, trade_pool, position_pool, price_update_pool)
    }

    fn engine_with(params: SimulationParameters) -> Arc<SimulationEngine> {
        let (hub, coordinator, queue, trade_pool, position_pool, price_update_pool) = deps();
        SimulationEngine::new(
            params,
            hub,
            coordinator,
            queue,
            trade_pool,
            position_pool,
            price_update_pool,
            4,
        )
    }

    #[test]
    fn cold_start_state() {
        let engine = engine_with(SimulationParameters {
            price_range: Some(PriceRange::Mid),
            duration: 3_600,
            volatility_factor: 1.0,
            ..SimulationParameters::default()
        });
        let snapshot = engine.snapshot();
        assert!((1.0..10.0).contains(&snapshot.current_price));
        assert!(snapshot.price_history.is_empty());
        assert!(snapshot.traders.len() >= 100);
        assert!(!snapshot.is_running);
        assert!(!snapshot.is_paused);
        assert_eq!(snapshot.status, "initialized");
        assert_eq!(snapshot.end_time - snapshot.start_time, 3_600_000);
    }

    #[test]
    fn tick_schedule_table() {
        assert_eq!(
            SimulationEngine::tick_schedule(1),
            (Duration::from_millis(1_000), 1)
        );
        assert_eq!(
            SimulationEngine::tick_schedule(10),
            (Duration::from_millis(100), 1)
        );
        let (interval, steps) = SimulationEngine::tick_schedule(20);
        assert_eq!(interval, Duration::from_millis(50));
        assert_eq!(steps, 1);
        let (interval, steps) = SimulationEngine::tick_schedule(100);
        assert_eq!(interval, Duration::from_millis(10));
        assert_eq!(steps, 1);
        let (interval, steps) = SimulationEngine::tick_schedule(1_000);
        assert_eq!(interval, Duration::from_millis(10));
        assert_eq!(steps, 10);
    }

    #[test]
    fn pause_requires_running() {
        let engine = engine_with(SimulationParameters::default());
        let err = engine.pause().unwrap_err();
        assert!(matches!(err, ControlError::InvalidState(_)));
        // The failed transition must not have mutated state.
        let snapshot = engine.snapshot();
        assert!(!snapshot.is_running);
        assert!(!snapshot.is_paused);
    }

    #[tokio::test]
    async fn start_then_pause_flag_invariant() {
        let engine = engine_with(SimulationParameters::default());
        engine.start().await.unwrap();
        {
            let snapshot = engine.snapshot();
            assert!(snapshot.is_running);
            assert!(!snapshot.is_paused);
        }
        engine.pause().unwrap();
        let snapshot = engine.snapshot();
        assert!(!snapshot.is_running);
        assert!(snapshot.is_paused);
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let engine = engine_with(SimulationParameters::default());
        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await,
            Err(ControlError::InvalidState(_))
        ));
        engine.terminate();
    }

    #[tokio::test]
    async fn tick_advances_time_and_trades() {
        let engine = engine_with(SimulationParameters::default());
        {
            let mut state = engine.state.write();
            state.is_running = true;
        }
        let before = engine.snapshot().current_time;
        engine.tick(1).await;
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.current_time - before, VIRTUAL_MS_PER_TICK);
        // Forced bootstrap guarantees a non-empty tape.
        assert!(snapshot.recent_trades.len() >= 3);
        assert!(snapshot.current_price > 0.0);
        assert_eq!(snapshot.tick_count, 1);
    }

    #[tokio::test]
    async fn reset_restores_initialized_state() {
        let engine = engine_with(SimulationParameters {
            price_range: Some(PriceRange::Mid),
            ..SimulationParameters::default()
        });
        {
            let mut state = engine.state.write();
            state.is_running = true;
        }
        for _ in 0..5 {
            engine.tick(1).await;
        }
        assert!(!engine.snapshot().recent_trades.is_empty());

        engine.reset(&ResetOptions::default()).unwrap();
        let snapshot = engine.snapshot();
        assert!(snapshot.price_history.is_empty());
        assert!(snapshot.recent_trades.is_empty());
        assert!(snapshot.active_positions.is_empty());
        assert!(!snapshot.is_running);
        assert!(!snapshot.is_paused);
        assert_eq!(snapshot.tick_count, 0);
        assert!((1.0..10.0).contains(&snapshot.current_price));
    }

    #[test]
    fn reset_twice_equals_once() {
        let engine = engine_with(SimulationParameters::default());
        engine.reset(&ResetOptions::default()).unwrap();
        let first = engine.snapshot();
        engine.reset(&ResetOptions::default()).unwrap();
        let second = engine.snapshot();

        assert_eq!(first.price_history.len(), second.price_history.len());
        assert_eq!(first.recent_trades.len(), second.recent_trades.len());
        assert_eq!(first.is_running, second.is_running);
        assert_eq!(first.is_paused, second.is_paused);
        assert_eq!(first.tick_count, second.tick_count);
    }

    #[test]
    fn set_speed_last_write_wins() {
        let engine = engine_with(SimulationParameters::default());
        engine.set_speed(5).unwrap();
        engine.set_speed(250).unwrap();
        assert_eq!(
            engine.snapshot().parameters.time_compression_factor,
            250
        );
        assert!(matches!(
            engine.set_speed(5_000),
            Err(ControlError::Validation(_))
        ));
    }

    #[test]
    fn tps_mode_scales_external_impact() {
        let engine = engine_with(SimulationParameters {
            price_range: Some(PriceRange::Mid),
            ..SimulationParameters::default()
        });
        let request = ExternalTradeRequest {
            id: None,
            trader_id: None,
            action: TradeAction::Buy,
            price: None,
            quantity: 1_000.0,
        };

        let baseline = engine.external_trade(&request).unwrap();
        engine.set_tps_mode(TpsMode::Hft);
        let hft = engine.external_trade(&request).unwrap();

        // HFT multiplier is 1.8x the NORMAL baseline. Prices drift between
        // the calls, so compare with a small tolerance.
        let ratio = hft.impact.abs() / baseline.impact.abs();
        assert!(
            (1.6..=2.0).contains(&ratio),
            "impact ratio {ratio} not ~1.8"
        );
        assert_eq!(
            engine.snapshot().external_market_metrics.processed_orders,
            2
        );
    }

    #[test]
    fn external_trade_validation() {
        let engine = engine_with(SimulationParameters::default());
        let request = ExternalTradeRequest {
            id: None,
            trader_id: None,
            action: TradeAction::Buy,
            price: None,
            quantity: -5.0,
        };
        assert!(matches!(
            engine.external_trade(&request),
            Err(ControlError::Validation(_))
        ));
    }

    #[test]
    fn external_impact_is_clamped() {
        let engine = engine_with(SimulationParameters {
            price_range: Some(PriceRange::Mid),
            initial_liquidity: 1_000.0,
            ..SimulationParameters::default()
        });
        // A trade far larger than the book cannot exceed the band cap (2%
        // for mid), even in an aggressive mode.
        engine.set_tps_mode(TpsMode::Stress);
        let outcome = engine
            .external_trade(&ExternalTradeRequest {
                id: None,
                trader_id: None,
                action: TradeAction::Sell,
                price: None,
                quantity: 1_000_000.0,
            })
            .unwrap();
        assert!(outcome.impact <= 0.0);
        assert!(outcome.impact.abs() <= PriceRange::Mid.max_impact() + 1e-12);
    }

    #[test]
    fn cascade_rejected_outside_stress() {
        let engine = engine_with(SimulationParameters::default());
        assert!(matches!(
            engine.liquidation_cascade(),
            Err(ControlError::InvalidMode(_))
        ));

        engine.set_tps_mode(TpsMode::Stress);
        let outcome = engine.liquidation_cascade().unwrap();
        assert!(outcome.orders_generated > 0);
        assert!(outcome.estimated_impact < 0.0);
        assert!(outcome.cascade_size > 0.0);
    }

    #[tokio::test]
    async fn positions_are_unique_per_trader() {
        let engine = engine_with(SimulationParameters::default());
        {
            let mut state = engine.state.write();
            state.is_running = true;
        }
        for _ in 0..50 {
            engine.tick(1).await;
        }
        let snapshot = engine.snapshot();
        let mut wallets: Vec<&str> = snapshot
            .active_positions
            .iter()
            .map(|p| p.trader.wallet_address.as_str())
            .collect();
        let total = wallets.len();
        wallets.sort();
        wallets.dedup();
        assert_eq!(wallets.len(), total);
    }

    #[tokio::test]
    async fn terminate_releases_pooled_objects() {
        let (hub, coordinator, queue, trade_pool, position_pool, price_update_pool) = deps();
        let engine = SimulationEngine::new(
            SimulationParameters::default(),
            hub,
            coordinator,
            queue,
            trade_pool.clone(),
            position_pool.clone(),
            price_update_pool,
            4,
        );
        {
            let mut state = engine.state.write();
            state.is_running = true;
        }
        for _ in 0..20 {
            engine.tick(1).await;
        }
        engine.terminate();

        let trade_stats = trade_pool.stats();
        let position_stats = position_pool.stats();
        assert_eq!(trade_stats.in_use, 0);
        assert_eq!(position_stats.in_use, 0);
    }
}
