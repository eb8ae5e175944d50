// =============================================================================
// Candle Coordinator — pass-through relay between engines and aggregators
// =============================================================================
//
// Services every simulation. Each simulation owns an incoming queue of
// `(timestamp, price, volume)` samples and exactly one aggregator, both held
// in a registry keyed by simulation id. A background flush (25 ms) drains
// queues into the aggregators, validates the resulting candles, writes them
// back into simulation state through the injected `CandleSink`, and emits a
// `candle_update` event.
//
// Samples are consumed verbatim: no timestamp rewriting, no minimum-interval
// suppression. Input validation happens at queue time only.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{CandleSink, EventSink, EventType, SimEvent};
use crate::types::Candle;

use super::aggregator::{CandleAggregator, CANDLE_INTERVAL_MS, MAX_RETAINED_CANDLES};

/// Flush period for queued samples.
pub const FLUSH_INTERVAL_MS: u64 = 25;
/// Consecutive aggregator-creation failures before the queue is dropped.
const MAX_CREATION_FAILURES: u32 = 3;
/// Total failures before the simulation's coordinator state is torn down.
const MAX_TOTAL_FAILURES: u32 = 5;

// ---------------------------------------------------------------------------
// Sample
// ---------------------------------------------------------------------------

/// One raw price/volume observation from a simulation tick.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSample {
    pub timestamp: i64,
    pub price: f64,
    pub volume: f64,
}

impl PriceSample {
    /// Boundary validation: positive finite price within the global band,
    /// non-negative finite volume.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite()
            && self.volume.is_finite()
            && self.price > 0.0
            && (1e-6..=1e6).contains(&self.price)
            && self.volume >= 0.0
    }
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

struct SimEntry {
    aggregator: CandleAggregator,
    queue: Vec<PriceSample>,
    consecutive_creation_failures: u32,
    total_failures: u32,
}

impl SimEntry {
    fn new(simulation_id: &str) -> Self {
        Self {
            aggregator: CandleAggregator::new(simulation_id, CANDLE_INTERVAL_MS),
            queue: Vec::new(),
            consecutive_creation_failures: 0,
            total_failures: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Relay that owns the singleton aggregator registry for all simulations.
pub struct CandleCoordinator {
    entries: Mutex<HashMap<String, SimEntry>>,
    hub: Arc<dyn EventSink>,
    sink: RwLock<Option<Arc<dyn CandleSink>>>,
}

impl CandleCoordinator {
    pub fn new(hub: Arc<dyn EventSink>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hub,
            sink: RwLock::new(None),
        }
    }

    /// Wire the write-back sink. Called once at startup after the
    /// simulation manager exists (the manager implements `CandleSink`).
    pub fn set_candle_sink(&self, sink: Arc<dyn CandleSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Queue one sample for a simulation. Invalid samples are rejected here
    /// and never reach the aggregator.
    pub fn queue_update(&self, simulation_id: &str, sample: PriceSample) -> bool {
        if !sample.is_valid() {
            debug!(
                simulation_id,
                price = sample.price,
                volume = sample.volume,
                "rejected invalid price sample"
            );
            return false;
        }

        let mut entries = self.entries.lock();
        let entry = entries
            .entry(simulation_id.to_string())
            .or_insert_with(|| SimEntry::new(simulation_id));
        entry.queue.push(sample);
        true
    }

    /// Seed the aggregator for a simulation with its opening price.
    pub fn initialize(&self, simulation_id: &str, start_time: i64, initial_price: f64) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(simulation_id.to_string())
            .or_insert_with(|| SimEntry::new(simulation_id));
        entry.aggregator.initialize(start_time, initial_price);
    }

    /// Atomically wipe aggregator, queue, and error counters for a
    /// simulation. Used on create and reset so a run never inherits stale
    /// candles.
    pub fn ensure_clean_start(&self, simulation_id: &str) {
        let mut entries = self.entries.lock();
        entries.insert(simulation_id.to_string(), SimEntry::new(simulation_id));
        info!(simulation_id, "coordinator state reset for clean start");
    }

    /// Clear the candle series but keep the aggregator registered.
    pub fn clear_candles(&self, simulation_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(simulation_id) {
            entry.aggregator.clear();
            entry.queue.clear();
        }
    }

    /// Tear down all coordinator state for a simulation.
    pub fn remove(&self, simulation_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(mut entry) = entries.remove(simulation_id) {
            entry.aggregator.shutdown();
            info!(simulation_id, "coordinator state removed");
        }
    }

    /// Whether a simulation currently has a live aggregator.
    pub fn has_aggregator(&self, simulation_id: &str) -> bool {
        self.entries.lock().contains_key(simulation_id)
    }

    /// Number of live aggregators (one per simulation id by construction).
    pub fn aggregator_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Current candle series for a simulation (oldest-first).
    pub fn candles(&self, simulation_id: &str, limit: Option<usize>) -> Vec<Candle> {
        self.entries
            .lock()
            .get(simulation_id)
            .map(|e| e.aggregator.candles(limit))
            .unwrap_or_default()
    }

    /// Drain and apply every queued sample for every simulation. Returns the
    /// number of samples consumed. Runs on the 25 ms flush task and from
    /// tests directly.
    pub fn flush_all(&self) -> usize {
        // Drain under the lock, publish outside it.
        let mut publishes: Vec<(String, Vec<Candle>)> = Vec::new();
        let mut consumed = 0usize;

        {
            let mut entries = self.entries.lock();
            let mut failed: Vec<String> = Vec::new();

            for (id, entry) in entries.iter_mut() {
                if entry.queue.is_empty() {
                    continue;
                }
                let samples = std::mem::take(&mut entry.queue);
                consumed += samples.len();

                for sample in &samples {
                    entry
                        .aggregator
                        .update_candle(sample.timestamp, sample.price, sample.volume);
                }

                let candles = entry.aggregator.candles(Some(MAX_RETAINED_CANDLES));
                let valid: Vec<Candle> =
                    candles.into_iter().filter(|c| c.is_valid()).collect();

                if valid.is_empty() && !samples.is_empty() {
                    // Samples were consumed but produced nothing usable:
                    // count a transient failure against this simulation.
                    entry.total_failures += 1;
                    entry.consecutive_creation_failures += 1;
                    warn!(
                        simulation_id = %id,
                        failures = entry.total_failures,
                        "candle flush produced no valid candles"
                    );
                    if entry.consecutive_creation_failures >= MAX_CREATION_FAILURES {
                        entry.queue.clear();
                    }
                    if entry.total_failures >= MAX_TOTAL_FAILURES {
                        failed.push(id.clone());
                    }
                    continue;
                }

                entry.consecutive_creation_failures = 0;
                publishes.push((id.clone(), valid));
            }

            for id in failed {
                warn!(simulation_id = %id, "tearing down coordinator state after repeated failures");
                entries.remove(&id);
            }
        }

        let sink = self.sink.read().clone();
        for (id, candles) in publishes {
            if let Some(sink) = &sink {
                sink.publish_candles(&id, &candles);
            }
            let payload = serde_json::json!({
                "candles": candles,
                "candleCount": candles.len(),
            });
            self.hub
                .deliver(&id, SimEvent::now(EventType::CandleUpdate, payload));
        }

        consumed
    }
}

/// Run the periodic flush until the shutdown signal flips.
pub async fn run_flush_task(
    coordinator: Arc<CandleCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                coordinator.flush_all();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("candle coordinator flush task stopping");
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use parking_lot::Mutex as PlMutex;

    fn coordinator() -> CandleCoordinator {
        CandleCoordinator::new(Arc::new(NullEventSink))
    }

    struct RecordingSink {
        published: PlMutex<Vec<(String, Vec<Candle>)>>,
    }

    impl CandleSink for RecordingSink {
        fn publish_candles(&self, simulation_id: &str, candles: &[Candle]) {
            self.published
                .lock()
                .push((simulation_id.to_string(), candles.to_vec()));
        }
    }

    #[test]
    fn rejects_invalid_samples() {
        let coord = coordinator();
        let bad = [
            PriceSample { timestamp: 0, price: 0.0, volume: 1.0 },
            PriceSample { timestamp: 0, price: -1.0, volume: 1.0 },
            PriceSample { timestamp: 0, price: f64::NAN, volume: 1.0 },
            PriceSample { timestamp: 0, price: 2e6, volume: 1.0 },
            PriceSample { timestamp: 0, price: 1e-9, volume: 1.0 },
            PriceSample { timestamp: 0, price: 5.0, volume: -1.0 },
        ];
        for sample in bad {
            assert!(!coord.queue_update("sim-a", sample));
        }
        assert!(coord.queue_update(
            "sim-a",
            PriceSample { timestamp: 0, price: 5.0, volume: 1.0 }
        ));
    }

    #[test]
    fn singleton_aggregator_per_id() {
        let coord = coordinator();
        for _ in 0..10 {
            coord.queue_update(
                "sim-a",
                PriceSample { timestamp: 0, price: 5.0, volume: 1.0 },
            );
            coord.flush_all();
        }
        assert_eq!(coord.aggregator_count(), 1);

        coord.queue_update(
            "sim-b",
            PriceSample { timestamp: 0, price: 5.0, volume: 1.0 },
        );
        assert_eq!(coord.aggregator_count(), 2);
    }

    #[test]
    fn flush_publishes_to_sink() {
        let coord = coordinator();
        let sink = Arc::new(RecordingSink {
            published: PlMutex::new(Vec::new()),
        });
        coord.set_candle_sink(sink.clone());

        coord.queue_update(
            "sim-a",
            PriceSample { timestamp: 1_000, price: 5.0, volume: 2.0 },
        );
        coord.queue_update(
            "sim-a",
            PriceSample { timestamp: 2_000, price: 5.5, volume: 1.0 },
        );
        let consumed = coord.flush_all();
        assert_eq!(consumed, 2);

        let published = sink.published.lock();
        assert_eq!(published.len(), 1);
        let (id, candles) = &published[0];
        assert_eq!(id, "sim-a");
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 5.5);
        assert_eq!(candles[0].volume, 3.0);
    }

    #[test]
    fn timestamps_pass_through_verbatim() {
        let coord = coordinator();
        // Out-of-order and repeated timestamps are all consumed as-is.
        let timestamps = [5_000, 1_000, 1_000, 900_500];
        for ts in timestamps {
            assert!(coord.queue_update(
                "sim-a",
                PriceSample { timestamp: ts, price: 5.0, volume: 0.5 },
            ));
        }
        assert_eq!(coord.flush_all(), 4);
        let candles = coord.candles("sim-a", None);
        // First three land in period 0, the fourth opens period 1.
        assert_eq!(candles.len(), 2);
    }

    #[test]
    fn ensure_clean_start_wipes_everything() {
        let coord = coordinator();
        coord.queue_update(
            "sim-a",
            PriceSample { timestamp: 0, price: 5.0, volume: 1.0 },
        );
        coord.flush_all();
        assert_eq!(coord.candles("sim-a", None).len(), 1);

        coord.ensure_clean_start("sim-a");
        assert!(coord.has_aggregator("sim-a"));
        assert!(coord.candles("sim-a", None).is_empty());
    }

    #[test]
    fn clear_candles_retains_aggregator() {
        let coord = coordinator();
        coord.queue_update(
            "sim-a",
            PriceSample { timestamp: 0, price: 5.0, volume: 1.0 },
        );
        coord.flush_all();
        coord.clear_candles("sim-a");
        assert!(coord.has_aggregator("sim-a"));
        assert!(coord.candles("sim-a", None).is_empty());
    }

    #[test]
    fn remove_tears_down_state() {
        let coord = coordinator();
        coord.queue_update(
            "sim-a",
            PriceSample { timestamp: 0, price: 5.0, volume: 1.0 },
        );
        coord.flush_all();
        coord.remove("sim-a");
        assert!(!coord.has_aggregator("sim-a"));
        assert_eq!(coord.aggregator_count(), 0);
    }

    #[test]
    fn initialize_seeds_opening_candle() {
        let coord = coordinator();
        coord.initialize("sim-a", 1_800_000, 4.2);
        let candles = coord.candles("sim-a", None);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open, 4.2);
        assert_eq!(candles[0].timestamp, 1_800_000);
    }
}
