pub mod monitor;
pub mod object_pool;

pub use monitor::{PoolMonitor, PoolMonitorSnapshot};
pub use object_pool::{MonitoredPool, ObjectPool, PoolHealth, PoolStats, Poolable, Pooled};
