// =============================================================================
// Transaction Queue — batched post-processing of committed trades
// =============================================================================
//
// Each simulation owns a buffer of queued trades. A buffer flushes when it
// reaches the batch threshold (50) or when 10 ms have passed since its first
// entry, whichever comes first. Batches are processed in chunks of 10 with
// the chunk items handled concurrently; results land in a per-simulation
// processed ring and are pushed to subscribers as `processed_trade` events.
//
// Trades that keep failing validation past the retry budget are recorded in
// a dead-letter log and the queue moves on.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{EventSink, EventType, SimEvent};
use crate::types::Trade;

/// Buffer size that triggers an immediate flush.
const BATCH_THRESHOLD: usize = 50;
/// Age of the oldest buffered entry that triggers a flush.
pub const FLUSH_INTERVAL_MS: u64 = 10;
/// Items processed concurrently per chunk.
const CHUNK_SIZE: usize = 10;
/// Validation retries before a trade is dead-lettered.
const MAX_ATTEMPTS: u32 = 3;
/// Active jobs at or above this degrade queue health.
const DEGRADED_ACTIVE_JOBS: usize = 1_000;
/// Processed results retained per simulation.
const PROCESSED_RETENTION: usize = 1_000;

// ---------------------------------------------------------------------------
// Result / stats types
// ---------------------------------------------------------------------------

/// Outcome of processing one trade.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResult {
    pub trade_id: String,
    pub processed: bool,
    pub timestamp: i64,
    pub simulation_id: String,
}

/// A trade that exhausted its retry budget.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub trade_id: String,
    pub simulation_id: String,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub active_jobs: usize,
    pub processed_total: u64,
    pub failed_total: u64,
    pub dead_letters: usize,
    pub health: &'static str,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct SimBuffer {
    priority: VecDeque<Trade>,
    trades: VecDeque<Trade>,
    first_at: Option<Instant>,
}

impl SimBuffer {
    fn new() -> Self {
        Self {
            priority: VecDeque::new(),
            trades: VecDeque::new(),
            first_at: None,
        }
    }

    fn len(&self) -> usize {
        self.priority.len() + self.trades.len()
    }
}

/// Batched back-pressure queue for trade post-processing.
pub struct TransactionQueue {
    buffers: Mutex<HashMap<String, SimBuffer>>,
    processed: Mutex<HashMap<String, VecDeque<TradeResult>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    active_jobs: AtomicUsize,
    processed_total: AtomicU64,
    failed_total: AtomicU64,
    hub: Arc<dyn EventSink>,
}

impl TransactionQueue {
    pub fn new(hub: Arc<dyn EventSink>) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            processed: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            active_jobs: AtomicUsize::new(0),
            processed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            hub,
        }
    }

    /// Queue a trade copy for post-processing. Returns whether the buffer
    /// crossed the batch threshold (the caller may flush immediately).
    pub fn add_trade(&self, trade: Trade, simulation_id: &str) -> bool {
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry(simulation_id.to_string())
            .or_insert_with(SimBuffer::new);
        if buffer.first_at.is_none() {
            buffer.first_at = Some(Instant::now());
        }
        buffer.trades.push_back(trade);
        buffer.len() >= BATCH_THRESHOLD
    }

    /// Queue a trade at the front of the next batch.
    pub fn add_priority_trade(&self, trade: Trade, simulation_id: &str) -> bool {
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry(simulation_id.to_string())
            .or_insert_with(SimBuffer::new);
        if buffer.first_at.is_none() {
            buffer.first_at = Some(Instant::now());
        }
        buffer.priority.push_back(trade);
        buffer.len() >= BATCH_THRESHOLD
    }

    /// Drain and process one simulation's buffer. Returns the number of
    /// trades processed (successfully or not).
    pub async fn flush_batch(&self, simulation_id: &str) -> usize {
        let batch: Vec<Trade> = {
            let mut buffers = self.buffers.lock();
            match buffers.get_mut(simulation_id) {
                Some(buffer) if buffer.len() > 0 => {
                    buffer.first_at = None;
                    buffer
                        .priority
                        .drain(..)
                        .chain(buffer.trades.drain(..))
                        .collect()
                }
                _ => return 0,
            }
        };

        let total = batch.len();
        self.active_jobs.fetch_add(total, Ordering::Relaxed);

        for chunk in batch.chunks(CHUNK_SIZE) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|trade| self.process_one(trade, simulation_id)),
            )
            .await;

            let mut processed = self.processed.lock();
            let ring = processed
                .entry(simulation_id.to_string())
                .or_insert_with(VecDeque::new);
            for result in results.into_iter().flatten() {
                self.emit_processed(simulation_id, &result);
                ring.push_back(result);
                while ring.len() > PROCESSED_RETENTION {
                    ring.pop_front();
                }
            }
        }

        self.active_jobs.fetch_sub(total, Ordering::Relaxed);
        debug!(simulation_id, total, "trade batch flushed");
        total
    }

    /// Flush every buffer whose first entry is older than the flush
    /// interval, or that already crossed the threshold.
    pub async fn flush_due(&self) -> usize {
        let due: Vec<String> = {
            let buffers = self.buffers.lock();
            buffers
                .iter()
                .filter(|(_, b)| {
                    b.len() >= BATCH_THRESHOLD
                        || b.first_at.is_some_and(|t| {
                            t.elapsed().as_millis() as u64 >= FLUSH_INTERVAL_MS
                        })
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut total = 0;
        for id in due {
            total += self.flush_batch(&id).await;
        }
        total
    }

    /// Validate and process one trade, retrying up to the attempt budget.
    /// Returns `None` when the trade is dead-lettered.
    async fn process_one(&self, trade: &Trade, simulation_id: &str) -> Option<TradeResult> {
        let mut last_reason = String::new();
        for _attempt in 1..=MAX_ATTEMPTS {
            match validate_trade(trade) {
                Ok(()) => {
                    self.processed_total.fetch_add(1, Ordering::Relaxed);
                    return Some(TradeResult {
                        trade_id: trade.id.clone(),
                        processed: true,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                        simulation_id: simulation_id.to_string(),
                    });
                }
                Err(reason) => last_reason = reason,
            }
        }

        self.failed_total.fetch_add(1, Ordering::Relaxed);
        warn!(
            simulation_id,
            trade_id = %trade.id,
            reason = %last_reason,
            "trade dead-lettered after {MAX_ATTEMPTS} attempts"
        );
        self.dead_letters.lock().push(DeadLetter {
            trade_id: trade.id.clone(),
            simulation_id: simulation_id.to_string(),
            reason: last_reason,
            attempts: MAX_ATTEMPTS,
        });
        None
    }

    fn emit_processed(&self, simulation_id: &str, result: &TradeResult) {
        let payload = serde_json::to_value(result).unwrap_or_default();
        self.hub
            .deliver(simulation_id, SimEvent::now(EventType::ProcessedTrade, payload));
    }

    /// Most recent processed results for a simulation (newest last).
    pub fn processed_trades(&self, simulation_id: &str, limit: usize) -> Vec<TradeResult> {
        let processed = self.processed.lock();
        processed
            .get(simulation_id)
            .map(|ring| {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_stats(&self) -> QueueStats {
        let queued = self.buffers.lock().values().map(SimBuffer::len).sum();
        let active_jobs = self.active_jobs.load(Ordering::Relaxed);
        QueueStats {
            queued,
            active_jobs,
            processed_total: self.processed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.lock().len(),
            health: if active_jobs >= DEGRADED_ACTIVE_JOBS {
                "degraded"
            } else {
                "ok"
            },
        }
    }

    /// Drop all buffered and processed state for a simulation.
    pub fn remove_simulation(&self, simulation_id: &str) {
        self.buffers.lock().remove(simulation_id);
        self.processed.lock().remove(simulation_id);
    }
}

fn validate_trade(trade: &Trade) -> Result<(), String> {
    if trade.id.is_empty() {
        return Err("empty trade id".into());
    }
    if trade.trader.wallet_address.is_empty() {
        return Err("empty trader wallet".into());
    }
    if !(trade.price.is_finite() && trade.price > 0.0) {
        return Err(format!("invalid price {}", trade.price));
    }
    if !(trade.quantity.is_finite() && trade.quantity > 0.0) {
        return Err(format!("invalid quantity {}", trade.quantity));
    }
    Ok(())
}

/// Run the periodic flush until the shutdown signal flips.
pub async fn run_queue_task(queue: Arc<TransactionQueue>, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                queue.flush_due().await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("transaction queue task stopping");
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
    use crate::types::{TradeAction, TraderInfo};

    fn queue() -> TransactionQueue {
        TransactionQueue::new(Arc::new(NullEventSink))
    }

    fn trade(id: &str, price: f64, quantity: f64) -> Trade {
        Trade {
            id: id.to_string(),
            timestamp: 1,
            trader: TraderInfo {
                wallet_address: "0xabc".into(),
                preferred_name: "Tester".into(),
                net_pnl: 0.0,
            },
            action: Some(TradeAction::Buy),
            price,
            quantity,
            value: price * quantity,
            impact: 0.0,
        }
    }

    #[tokio::test]
    async fn valid_trades_are_processed() {
        let q = queue();
        for i in 0..5 {
            q.add_trade(trade(&format!("t{i}"), 5.0, 10.0), "sim-a");
        }
        assert_eq!(q.flush_batch("sim-a").await, 5);

        let results = q.processed_trades("sim-a", 10);
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.processed));
        assert_eq!(q.queue_stats().processed_total, 5);
    }

    #[tokio::test]
    async fn invalid_trades_dead_letter() {
        let q = queue();
        q.add_trade(trade("", 5.0, 10.0), "sim-a");
        q.add_trade(trade("t1", -5.0, 10.0), "sim-a");
        q.add_trade(trade("t2", 5.0, 0.0), "sim-a");
        q.flush_batch("sim-a").await;

        let stats = q.queue_stats();
        assert_eq!(stats.failed_total, 3);
        assert_eq!(stats.dead_letters, 3);
        assert!(q.processed_trades("sim-a", 10).is_empty());
    }

    #[tokio::test]
    async fn threshold_reports_flush_needed() {
        let q = queue();
        for i in 0..BATCH_THRESHOLD - 1 {
            assert!(!q.add_trade(trade(&format!("t{i}"), 5.0, 1.0), "sim-a"));
        }
        assert!(q.add_trade(trade("last", 5.0, 1.0), "sim-a"));
    }

    #[tokio::test]
    async fn priority_trades_process_first() {
        let q = queue();
        q.add_trade(trade("normal", 5.0, 1.0), "sim-a");
        q.add_priority_trade(trade("urgent", 5.0, 1.0), "sim-a");
        q.flush_batch("sim-a").await;

        let results = q.processed_trades("sim-a", 10);
        assert_eq!(results[0].trade_id, "urgent");
        assert_eq!(results[1].trade_id, "normal");
    }

    #[tokio::test]
    async fn processed_ring_is_bounded() {
        let q = queue();
        for batch in 0..3 {
            for i in 0..500 {
                q.add_trade(trade(&format!("t{batch}-{i}"), 5.0, 1.0), "sim-a");
            }
            q.flush_batch("sim-a").await;
        }
        let results = q.processed_trades("sim-a", usize::MAX);
        assert_eq!(results.len(), PROCESSED_RETENTION);
        // Newest retained.
        assert_eq!(results.last().unwrap().trade_id, "t2-499");
    }

    #[tokio::test]
    async fn per_simulation_isolation() {
        let q = queue();
        q.add_trade(trade("a", 5.0, 1.0), "sim-a");
        q.add_trade(trade("b", 5.0, 1.0), "sim-b");
        q.flush_batch("sim-a").await;

        assert_eq!(q.processed_trades("sim-a", 10).len(), 1);
        assert!(q.processed_trades("sim-b", 10).is_empty());
        assert_eq!(q.queue_stats().queued, 1);

        q.remove_simulation("sim-b");
        assert_eq!(q.queue_stats().queued, 0);
    }

    #[tokio::test]
    async fn healthy_queue_reports_ok() {
        let q = queue();
        assert_eq!(q.queue_stats().health, "ok");
    }
}
