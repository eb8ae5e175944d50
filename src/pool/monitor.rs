// =============================================================================
// Pool Monitor — periodic health scan over registered object pools
// =============================================================================
//
// One monitor per process. Every 10 s it walks the registered pools,
// classifies them by utilization, and runs the emergency ladder on critical
// pools: release_all -> clear -> resize(0.8 x max).
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::object_pool::{MonitoredPool, PoolHealth, PoolStats};

/// Utilization at or above this is a warning.
const WARNING_UTILIZATION: f64 = 0.8;
/// Utilization at or above this triggers emergency recovery.
const CRITICAL_UTILIZATION: f64 = 0.95;
/// Scan period in seconds.
pub const SCAN_INTERVAL_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDetail {
    pub stats: PoolStats,
    pub health: PoolHealth,
    pub level: &'static str,
}

/// Aggregate view served on `/api/object-pools/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMonitorSnapshot {
    pub total_pools: usize,
    pub healthy_pools: usize,
    pub warning_pools: usize,
    pub critical_pools: usize,
    pub total_objects: usize,
    pub total_capacity: usize,
    pub details: Vec<PoolDetail>,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Process-wide scanner over every registered object pool.
pub struct PoolMonitor {
    pools: RwLock<Vec<Arc<dyn MonitoredPool>>>,
}

impl PoolMonitor {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
        }
    }

    /// Register a pool for monitoring. Pools are never unregistered; they
    /// live for the process lifetime.
    pub fn register(&self, pool: Arc<dyn MonitoredPool>) {
        info!(pool = pool.name(), "pool registered with monitor");
        self.pools.write().push(pool);
    }

    /// One scan pass: classify each pool and recover critical ones.
    pub fn scan(&self) -> PoolMonitorSnapshot {
        let pools = self.pools.read().clone();
        let mut details = Vec::with_capacity(pools.len());
        let mut healthy = 0usize;
        let mut warning = 0usize;
        let mut critical = 0usize;
        let mut total_objects = 0usize;
        let mut total_capacity = 0usize;

        for pool in &pools {
            let stats = pool.stats();
            total_objects += stats.created;
            total_capacity += stats.max_size;

            let level = if stats.utilization >= CRITICAL_UTILIZATION {
                critical += 1;
                warn!(
                    pool = %stats.name,
                    utilization = stats.utilization,
                    "pool critical — running emergency recovery"
                );
                self.recover(pool.as_ref(), &stats);
                "critical"
            } else if stats.utilization >= WARNING_UTILIZATION {
                warning += 1;
                warn!(pool = %stats.name, utilization = stats.utilization, "pool utilization warning");
                "warning"
            } else {
                healthy += 1;
                "healthy"
            };

            details.push(PoolDetail {
                health: pool.health_check(),
                stats,
                level,
            });
        }

        debug!(
            pools = details.len(),
            healthy, warning, critical, "pool monitor scan complete"
        );

        PoolMonitorSnapshot {
            total_pools: details.len(),
            healthy_pools: healthy,
            warning_pools: warning,
            critical_pools: critical,
            total_objects,
            total_capacity,
            details,
        }
    }

    /// Emergency ladder for a critical pool. Each rung is guarded so a
    /// failure in one never blocks the next.
    fn recover(&self, pool: &dyn MonitoredPool, stats: &PoolStats) {
        pool.release_all();
        pool.clear();

        let shrunk = ((stats.max_size as f64) * 0.8) as usize;
        if shrunk > 0 {
            pool.resize(shrunk);
        }

        let after = pool.stats();
        if after.utilization >= CRITICAL_UTILIZATION {
            error!(
                pool = %after.name,
                utilization = after.utilization,
                "pool still critical after emergency recovery"
            );
        } else {
            info!(pool = %after.name, utilization = after.utilization, "pool recovered");
        }
    }

    /// Snapshot without triggering recovery (read-only observability path).
    pub fn snapshot(&self) -> PoolMonitorSnapshot {
        let pools = self.pools.read().clone();
        let mut details = Vec::with_capacity(pools.len());
        let mut healthy = 0usize;
        let mut warning = 0usize;
        let mut critical = 0usize;
        let mut total_objects = 0usize;
        let mut total_capacity = 0usize;

        for pool in &pools {
            let stats = pool.stats();
            total_objects += stats.created;
            total_capacity += stats.max_size;
            let level = if stats.utilization >= CRITICAL_UTILIZATION {
                critical += 1;
                "critical"
            } else if stats.utilization >= WARNING_UTILIZATION {
                warning += 1;
                "warning"
            } else {
                healthy += 1;
                "healthy"
            };
            details.push(PoolDetail {
                health: pool.health_check(),
                stats,
                level,
            });
        }

        PoolMonitorSnapshot {
            total_pools: details.len(),
            healthy_pools: healthy,
            warning_pools: warning,
            critical_pools: critical,
            total_objects,
            total_capacity,
            details,
        }
    }
}

impl Default for PoolMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the periodic scan until the shutdown signal flips.
pub async fn run_monitor_task(monitor: Arc<PoolMonitor>, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(SCAN_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                monitor.scan();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("pool monitor stopping");
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
