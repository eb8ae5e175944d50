// =============================================================================
// Event Model — server-push messages and the sink seams between subsystems
// =============================================================================
//
// Every outbound message is `{simulationId, event: {type, timestamp, data}}`.
// Event types split into two delivery classes inside the hub:
//   - immediate: serialised and dispatched per event, outside the batch
//     window.
//   - batched: accumulated per simulation and flushed every 25 ms inside a
//     `batch_update` envelope.
//
// The `EventSink` / `CandleSink` traits break the engine <-> hub <->
// coordinator reference cycles: back-edges are messages through an injected
// interface, never owning references.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Candle;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Welcome,
    Connection,
    Pong,
    SubscribeResponse,
    UnsubscribeResponse,
    PriceUpdate,
    Trade,
    ProcessedTrade,
    CandleUpdate,
    BatchUpdate,
    OrderBook,
    PositionOpen,
    PositionClose,
    SimulationStatus,
    SimulationReset,
    SimulationState,
    TpsModeChanged,
    TpsStatus,
    StressCapabilities,
    LiquidationCascadeTriggered,
    ExternalMarketPressure,
    ExternalMarketMetrics,
    Error,
}

impl EventType {
    /// Immediate events bypass the 25 ms batch window.
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            Self::PriceUpdate
                | Self::Trade
                | Self::ProcessedTrade
                | Self::SimulationStatus
                | Self::SimulationReset
                | Self::SimulationState
        )
    }

    /// Idempotent events keep only the most recent instance within a batch.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Self::PriceUpdate | Self::OrderBook | Self::ExternalMarketMetrics
        )
    }

    /// Additive events are all retained within a batch.
    pub fn is_additive(self) -> bool {
        matches!(
            self,
            Self::Trade | Self::ProcessedTrade | Self::PositionOpen | Self::PositionClose
        )
    }

    /// Key this event type groups under inside `batch_update.data.updates`.
    pub fn batch_key(self) -> &'static str {
        match self {
            Self::PriceUpdate => "price",
            Self::Trade | Self::ProcessedTrade => "trades",
            Self::PositionOpen | Self::PositionClose => "positions",
            Self::OrderBook => "orderBook",
            Self::ExternalMarketMetrics => "externalMarketMetrics",
            Self::CandleUpdate => "candles",
            Self::TpsModeChanged => "tpsMode",
            Self::ExternalMarketPressure => "externalPressure",
            Self::LiquidationCascadeTriggered => "liquidationCascade",
            _ => "other",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Connection => "connection",
            Self::Pong => "pong",
            Self::SubscribeResponse => "subscribe_response",
            Self::UnsubscribeResponse => "unsubscribe_response",
            Self::PriceUpdate => "price_update",
            Self::Trade => "trade",
            Self::ProcessedTrade => "processed_trade",
            Self::CandleUpdate => "candle_update",
            Self::BatchUpdate => "batch_update",
            Self::OrderBook => "order_book",
            Self::PositionOpen => "position_open",
            Self::PositionClose => "position_close",
            Self::SimulationStatus => "simulation_status",
            Self::SimulationReset => "simulation_reset",
            Self::SimulationState => "simulation_state",
            Self::TpsModeChanged => "tps_mode_changed",
            Self::TpsStatus => "tps_status",
            Self::StressCapabilities => "stress_capabilities",
            Self::LiquidationCascadeTriggered => "liquidation_cascade_triggered",
            Self::ExternalMarketPressure => "external_market_pressure",
            Self::ExternalMarketMetrics => "external_market_metrics",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// The inner event of a server push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: i64,
    pub data: Value,
}

impl SimEvent {
    pub fn new(event_type: EventType, timestamp: i64, data: Value) -> Self {
        Self {
            event_type,
            timestamp,
            data,
        }
    }

    /// Event stamped with the current wall clock.
    pub fn now(event_type: EventType, data: Value) -> Self {
        Self::new(event_type, chrono::Utc::now().timestamp_millis(), data)
    }
}

/// Full outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub simulation_id: String,
    pub event: SimEvent,
}

// ---------------------------------------------------------------------------
// Sink seams
// ---------------------------------------------------------------------------

/// Delivery seam towards the broadcast hub. The engine, coordinator, and
/// transaction queue publish through this interface so none of them holds a
/// concrete hub type.
pub trait EventSink: Send + Sync {
    /// Route an event for the given simulation (immediate or batched is the
    /// sink's concern).
    fn deliver(&self, simulation_id: &str, event: SimEvent);
}

/// Write-back seam from the candle coordinator into simulation state.
pub trait CandleSink: Send + Sync {
    fn publish_candles(&self, simulation_id: &str, candles: &[Candle]);
}

/// A sink that drops everything. Used in tests and during early startup.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn deliver(&self, _simulation_id: &str, _event: SimEvent) {}
}

// =============================================================================
// Tests
// =============================================================================
