// =============================================================================
// Central Application State — Vertex Market Simulator
// =============================================================================
//
// The single source of truth for the server process. All subsystems hold
// Arc references to their own state; AppState ties them together, wires the
// sink seams at construction, and owns the background task lifecycle.
//
// Thread safety:
//   - parking_lot locks inside each subsystem.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
//   - A single watch channel fans the shutdown signal out to every
//     periodic task.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::broadcast::{hub as hub_task, BroadcastHub, HubHealth};
use crate::candles::{coordinator as coordinator_task, CandleCoordinator};
use crate::config::ServerConfig;
use crate::engine::SimulationManager;
use crate::pool::{monitor as monitor_task, ObjectPool, PoolMonitor, PoolMonitorSnapshot};
use crate::queue::{self as queue_task, QueueStats, TransactionQueue};
use crate::types::{Position, PriceUpdate, Trade};

/// Default object pool capacities: (max, prefill).
const TRADE_POOL: (usize, usize) = (2_000, 200);
const POSITION_POOL: (usize, usize) = (1_000, 100);
const PRICE_UPDATE_POOL: (usize, usize) = (500, 50);

/// Central application state shared across all async tasks.
pub struct AppState {
    pub config: ServerConfig,
    pub hub: Arc<BroadcastHub>,
    pub coordinator: Arc<CandleCoordinator>,
    pub queue: Arc<TransactionQueue>,
    pub manager: Arc<SimulationManager>,
    pub pool_monitor: Arc<PoolMonitor>,
    pub trade_pool: Arc<ObjectPool<Trade>>,
    pub position_pool: Arc<ObjectPool<Position>>,
    pub price_update_pool: Arc<ObjectPool<PriceUpdate>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct and wire every subsystem. The returned value is wrapped in
    /// `Arc` immediately by the caller.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let hub = Arc::new(BroadcastHub::new());
        let coordinator = Arc::new(CandleCoordinator::new(hub.clone()));
        let queue = Arc::new(TransactionQueue::new(hub.clone()));

        let trade_pool: Arc<ObjectPool<Trade>> =
            Arc::new(ObjectPool::new("trades", TRADE_POOL.0, TRADE_POOL.1));
        let position_pool: Arc<ObjectPool<Position>> = Arc::new(ObjectPool::new(
            "positions",
            POSITION_POOL.0,
            POSITION_POOL.1,
        ));
        let price_update_pool: Arc<ObjectPool<PriceUpdate>> = Arc::new(ObjectPool::new(
            "price-updates",
            PRICE_UPDATE_POOL.0,
            PRICE_UPDATE_POOL.1,
        ));

        let pool_monitor = Arc::new(PoolMonitor::new());
        pool_monitor.register(trade_pool.clone());
        pool_monitor.register(position_pool.clone());
        pool_monitor.register(price_update_pool.clone());

        let manager = Arc::new(SimulationManager::new(
            hub.clone(),
            coordinator.clone(),
            queue.clone(),
            trade_pool.clone(),
            position_pool.clone(),
            price_update_pool.clone(),
            config.max_simulations,
            config.decision_workers,
        ));

        // Close the coordinator -> state back-edge through the sink seam.
        coordinator.set_candle_sink(manager.clone());

        Arc::new(Self {
            config,
            hub,
            coordinator,
            queue,
            manager,
            pool_monitor,
            trade_pool,
            position_pool,
            price_update_pool,
            start_time: std::time::Instant::now(),
        })
    }

    /// Spawn every periodic task. Returns the shutdown trigger and the task
    /// handles; flipping the trigger stops them all.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
    ) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(hub_task::run_flush_task(
                self.hub.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(coordinator_task::run_flush_task(
                self.coordinator.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(queue_task::run_queue_task(
                self.queue.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(monitor_task::run_monitor_task(
                self.pool_monitor.clone(),
                shutdown_rx,
            )),
        ];
        info!(tasks = handles.len(), "background tasks spawned");
        (shutdown_tx, handles)
    }

    /// Stop simulations, delivery, and periodic tasks.
    pub fn shutdown(&self, shutdown_tx: &watch::Sender<bool>) {
        self.manager.shutdown();
        self.hub.shutdown();
        let _ = shutdown_tx.send(true);
        info!("application state shut down");
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    // ── Observability snapshots ─────────────────────────────────────────

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let hub = self.hub.health_check();
        let queue = self.queue.queue_stats();
        let pools = self.pool_monitor.snapshot();
        let degraded = queue.health != "ok" || pools.critical_pools > 0 || !hub.healthy;

        HealthSnapshot {
            status: if degraded { "degraded" } else { "ok" },
            uptime_secs: self.uptime_secs(),
            simulations: self.manager.count(),
            hub,
            queue,
            pools_healthy: pools.healthy_pools,
            pools_total: pools.total_pools,
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let hub = self.hub.health_check();
        let queue = self.queue.queue_stats();
        let pools = self.pool_monitor.snapshot();

        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            simulations: self.manager.count(),
            connected_clients: hub.clients,
            events_sent: hub.events_sent,
            batches_sent: hub.batches_sent,
            corrupt_batches: hub.corrupt_batches,
            connection_errors: hub.connection_errors,
            queue,
            pool_objects: pools.total_objects,
            pool_capacity: pools.total_capacity,
        }
    }

    pub fn pools_snapshot(&self) -> PoolMonitorSnapshot {
        self.pool_monitor.snapshot()
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub simulations: usize,
    pub hub: HubHealth,
    pub queue: QueueStats,
    pub pools_healthy: usize,
    pub pools_total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub simulations: usize,
    pub connected_clients: usize,
    pub events_sent: u64,
    pub batches_sent: u64,
    pub corrupt_batches: u64,
    pub connection_errors: u64,
    pub queue: QueueStats,
    pub pool_objects: usize,
    pub pool_capacity: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulationParameters;

    #[test]
    fn fresh_state_is_healthy() {
        let state = AppState::new(ServerConfig::default());
        let health = state.health_snapshot();
        assert_eq!(health.status, "ok");
        assert_eq!(health.simulations, 0);
        assert_eq!(health.pools_total, 3);
        assert_eq!(health.pools_healthy, 3);
    }

    #[test]
    fn metrics_track_simulations() {
        let state = AppState::new(ServerConfig::default());
        state
            .manager
            .create(SimulationParameters::default())
            .unwrap();
        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.simulations, 1);
        assert!(metrics.pool_capacity >= 3_500);
    }

    #[tokio::test]
    async fn background_tasks_stop_on_shutdown() {
        let state = AppState::new(ServerConfig::default());
        let (shutdown_tx, handles) = state.spawn_background_tasks();
        state.shutdown(&shutdown_tx);
        for handle in handles {
            // Each task observes the signal and returns.
            tokio::time::timeout(std::time::Duration::from_secs(1), handle)
                .await
                .expect("task did not stop")
                .expect("task panicked");
        }
    }
}
