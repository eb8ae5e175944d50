// =============================================================================
// Candle Aggregator — per-simulation OHLCV builder
// =============================================================================
//
// Single-owner builder for one simulation's candle series. The live candle
// is updated in place; when an incoming sample lands in a later period the
// current candle closes and a fresh one opens at the sample price. The ring
// is trimmed to the retention cap.
//
// Construction happens exclusively through the coordinator registry, which
// enforces one live aggregator per simulation id.
// =============================================================================

use std::collections::VecDeque;

use tracing::debug;

use crate::types::Candle;

/// Default aggregation interval: 15 minutes.
pub const CANDLE_INTERVAL_MS: i64 = 900_000;
/// Retention cap per simulation.
pub const MAX_RETAINED_CANDLES: usize = 250;

/// OHLCV builder for a single simulation.
pub struct CandleAggregator {
    simulation_id: String,
    interval_ms: i64,
    candles: VecDeque<Candle>,
    current_period: Option<i64>,
    shut_down: bool,
}

impl CandleAggregator {
    pub(crate) fn new(simulation_id: impl Into<String>, interval_ms: i64) -> Self {
        Self {
            simulation_id: simulation_id.into(),
            interval_ms: interval_ms.max(1),
            candles: VecDeque::with_capacity(MAX_RETAINED_CANDLES + 1),
            current_period: None,
            shut_down: false,
        }
    }

    pub fn simulation_id(&self) -> &str {
        &self.simulation_id
    }

    /// Seed the series with an opening candle at the simulation start.
    pub fn initialize(&mut self, start_time: i64, initial_price: f64) {
        self.candles.clear();
        self.current_period = None;
        self.shut_down = false;
        if initial_price > 0.0 {
            self.update_candle(start_time, initial_price, 0.0);
        }
    }

    /// Fold one `(timestamp, price, volume)` sample into the series.
    ///
    /// Timestamps are taken verbatim; the candle boundary is
    /// `floor(timestamp / interval) * interval`.
    pub fn update_candle(&mut self, timestamp: i64, price: f64, volume: f64) {
        if self.shut_down {
            return;
        }

        let period = timestamp.div_euclid(self.interval_ms);

        match self.current_period {
            Some(current) if period <= current => {
                // Same (or late) period: fold into the live candle.
                if let Some(candle) = self.candles.back_mut() {
                    candle.close = price;
                    candle.high = candle.high.max(price);
                    candle.low = candle.low.min(price);
                    candle.volume += volume.max(0.0);
                }
            }
            _ => {
                // New period: open a fresh candle at the sample price.
                self.candles.push_back(Candle {
                    timestamp: period * self.interval_ms,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: volume.max(0.0),
                });
                self.current_period = Some(period);
                while self.candles.len() > MAX_RETAINED_CANDLES {
                    self.candles.pop_front();
                }
            }
        }
    }

    /// The most recent `limit` candles (oldest-first). `None` returns all.
    pub fn candles(&self, limit: Option<usize>) -> Vec<Candle> {
        let take = limit.unwrap_or(self.candles.len()).min(self.candles.len());
        self.candles
            .iter()
            .skip(self.candles.len() - take)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Drop the series but keep the aggregator usable.
    pub fn clear(&mut self) {
        self.candles.clear();
        self.current_period = None;
        debug!(simulation_id = %self.simulation_id, "candle series cleared");
    }

    /// Clear and reopen for a fresh run.
    pub fn reset(&mut self) {
        self.clear();
        self.shut_down = false;
    }

    /// Stop accepting samples. A shut-down aggregator keeps its series for
    /// late readers until the coordinator drops it.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> CandleAggregator {
        CandleAggregator::new("sim-test", CANDLE_INTERVAL_MS)
    }

    #[test]
    fn first_sample_opens_candle() {
        let mut agg = aggregator();
        agg.update_candle(1_000, 5.0, 2.0);
        let candles = agg.candles(None);
        assert_eq!(candles.len(), 1);
        let c = &candles[0];
        assert_eq!(c.timestamp, 0); // aligned to the interval boundary
        assert_eq!(c.open, 5.0);
        assert_eq!(c.high, 5.0);
        assert_eq!(c.low, 5.0);
        assert_eq!(c.close, 5.0);
        assert_eq!(c.volume, 2.0);
    }

    #[test]
    fn same_period_updates_in_place() {
        let mut agg = aggregator();
        agg.update_candle(0, 5.0, 1.0);
        agg.update_candle(10_000, 6.0, 1.0);
        agg.update_candle(20_000, 4.0, 1.0);
        agg.update_candle(30_000, 5.5, 1.0);

        let candles = agg.candles(None);
        assert_eq!(candles.len(), 1);
        let c = &candles[0];
        assert_eq!(c.open, 5.0);
        assert_eq!(c.high, 6.0);
        assert_eq!(c.low, 4.0);
        assert_eq!(c.close, 5.5);
        assert_eq!(c.volume, 4.0);
        assert!(c.is_valid());
    }

    #[test]
    fn period_rollover_opens_new_candle() {
        let mut agg = aggregator();
        agg.update_candle(0, 5.0, 1.0);
        agg.update_candle(CANDLE_INTERVAL_MS, 7.0, 2.0);

        let candles = agg.candles(None);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 5.0);
        assert_eq!(candles[1].open, 7.0);
        assert_eq!(candles[1].timestamp, CANDLE_INTERVAL_MS);
    }

    #[test]
    fn timestamps_non_decreasing_and_aligned() {
        let mut agg = aggregator();
        for i in 0..500 {
            agg.update_candle(i * 400_000, 5.0 + (i % 7) as f64 * 0.1, 1.0);
        }
        let candles = agg.candles(None);
        for pair in candles.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        for c in &candles {
            assert_eq!(c.timestamp % CANDLE_INTERVAL_MS, 0);
        }
    }

    #[test]
    fn retention_cap_evicts_oldest() {
        let mut agg = aggregator();
        for i in 0..(MAX_RETAINED_CANDLES as i64 + 50) {
            agg.update_candle(i * CANDLE_INTERVAL_MS, 5.0, 1.0);
        }
        assert_eq!(agg.len(), MAX_RETAINED_CANDLES);
        let candles = agg.candles(None);
        assert_eq!(candles[0].timestamp, 50 * CANDLE_INTERVAL_MS);
    }

    #[test]
    fn limit_returns_tail() {
        let mut agg = aggregator();
        for i in 0..10 {
            agg.update_candle(i * CANDLE_INTERVAL_MS, 5.0 + i as f64, 1.0);
        }
        let tail = agg.candles(Some(3));
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].open, 12.0);
    }

    #[test]
    fn shutdown_stops_updates() {
        let mut agg = aggregator();
        agg.update_candle(0, 5.0, 1.0);
        agg.shutdown();
        agg.update_candle(CANDLE_INTERVAL_MS, 9.0, 1.0);
        assert_eq!(agg.len(), 1);

        agg.reset();
        agg.update_candle(0, 5.0, 1.0);
        assert_eq!(agg.len(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any sample stream with valid inputs yields a series whose
            // candles all satisfy OHLC integrity, with non-decreasing
            // aligned timestamps, within the retention cap.
            #[test]
            fn series_integrity(
                steps in proptest::collection::vec(
                    (0i64..120_000, 1e-3f64..1e3, 0f64..100.0),
                    1..400,
                )
            ) {
                let mut agg = aggregator();
                let mut ts = 0i64;
                for (dt, price, volume) in steps {
                    ts += dt;
                    agg.update_candle(ts, price, volume);
                }

                let candles = agg.candles(None);
                prop_assert!(candles.len() <= MAX_RETAINED_CANDLES);
                for c in &candles {
                    prop_assert!(c.is_valid());
                    prop_assert_eq!(c.timestamp % CANDLE_INTERVAL_MS, 0);
                }
                for pair in candles.windows(2) {
                    prop_assert!(pair[0].timestamp <= pair[1].timestamp);
                }
            }
        }
    }

    #[test]
    fn identical_timestamp_samples_are_ohlc_stable() {
        let mut agg = aggregator();
        agg.update_candle(1_000, 5.0, 1.0);
        agg.update_candle(1_000, 5.2, 1.0);
        agg.update_candle(1_000, 4.9, 1.0);
        let c = &agg.candles(None)[0];
        assert_eq!(c.open, 5.0);
        assert_eq!(c.close, 4.9);
        assert_eq!(c.high, 5.2);
        assert_eq!(c.low, 4.9);
        assert!(c.is_valid());
    }
}
