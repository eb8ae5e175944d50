pub mod aggregator;
pub mod coordinator;

pub use aggregator::{CandleAggregator, CANDLE_INTERVAL_MS, MAX_RETAINED_CANDLES};
pub use coordinator::{CandleCoordinator, PriceSample};
