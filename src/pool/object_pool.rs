// =============================================================================
// Object Pool — bounded reuse of hot-path records
// =============================================================================
//
// Trades and positions are allocated at up to 15k/s per simulation; the pool
// bounds that memory and surfaces leak metrics as first-class state.
//
// Accounting model:
//   - `available` holds reset objects ready for reuse.
//   - `in_use` tracks tickets of objects currently held by consumers.
//   - `created` counts live tracked objects (available + in_use).
//   - When the pool is exhausted, the oldest held tickets are written off
//     (forced cleanup) before falling back to an untracked emergency
//     allocation, which is logged as a leak.
// =============================================================================

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A record that can live in an [`ObjectPool`]. `reset` scrubs all fields
/// before the object re-enters the free list; returning `false` discards the
/// object instead.
pub trait Poolable: Default + Send + 'static {
    fn reset(&mut self) -> bool;
}

/// Object-safe view of a pool, used by the monitor.
pub trait MonitoredPool: Send + Sync {
    fn name(&self) -> &str;
    fn stats(&self) -> PoolStats;
    fn health_check(&self) -> PoolHealth;
    fn release_all(&self);
    fn clear(&self);
    fn resize(&self, new_max: usize);
}

// ---------------------------------------------------------------------------
// Pooled handle
// ---------------------------------------------------------------------------

/// A pooled object handle. Dereferences to the inner record; must be handed
/// back via [`ObjectPool::release`] when the consumer is done with it.
#[derive(Debug)]
pub struct Pooled<T> {
    value: T,
    ticket: u64,
    emergency: bool,
}

impl<T> Pooled<T> {
    pub fn is_emergency(&self) -> bool {
        self.emergency
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Serialize> Serialize for Pooled<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Stats / health snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub name: String,
    pub max_size: usize,
    pub available: usize,
    pub in_use: usize,
    pub created: usize,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_reused: u64,
    pub total_created: u64,
    pub total_discarded: u64,
    pub emergency_allocations: u64,
    pub release_efficiency: f64,
    pub utilization: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealth {
    pub healthy: bool,
    pub release_efficiency: f64,
    pub utilization: f64,
    pub issues: Vec<String>,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Fraction of capacity written off in one forced-cleanup pass.
const FORCED_CLEANUP_FRACTION: f64 = 0.10;
/// Minimum hold time before a ticket is eligible for forced cleanup.
const DEFAULT_STALE_HOLD: Duration = Duration::from_secs(30);
/// Release efficiency below this marks the pool unhealthy.
const MIN_RELEASE_EFFICIENCY: f64 = 0.8;
/// Utilization above this marks the pool unhealthy.
const MAX_HEALTHY_UTILIZATION: f64 = 0.9;

struct PoolInner<T> {
    available: Vec<T>,
    /// ticket -> acquisition instant, ordered so the oldest tickets iterate
    /// first during forced cleanup.
    in_use: BTreeMap<u64, Instant>,
    next_ticket: u64,
    created: usize,
    max_size: usize,
}

/// Bounded object pool with leak detection.
pub struct ObjectPool<T: Poolable> {
    name: String,
    stale_hold: Duration,
    inner: Mutex<PoolInner<T>>,
    total_acquired: AtomicU64,
    total_released: AtomicU64,
    total_reused: AtomicU64,
    total_created: AtomicU64,
    total_discarded: AtomicU64,
    emergency_allocations: AtomicU64,
}

impl<T: Poolable> ObjectPool<T> {
    /// Create a pool with the given ceiling, prefilled with `prefill` reset
    /// objects.
    pub fn new(name: impl Into<String>, max_size: usize, prefill: usize) -> Self {
        Self::with_stale_hold(name, max_size, prefill, DEFAULT_STALE_HOLD)
    }

    /// As [`ObjectPool::new`], with an explicit hold-time threshold for
    /// forced cleanup eligibility.
    pub fn with_stale_hold(
        name: impl Into<String>,
        max_size: usize,
        prefill: usize,
        stale_hold: Duration,
    ) -> Self {
        let name = name.into();
        let prefill = prefill.min(max_size);
        let mut available = Vec::with_capacity(prefill);
        for _ in 0..prefill {
            available.push(T::default());
        }
        debug!(pool = %name, max_size, prefill, "object pool created");

        Self {
            name,
            stale_hold,
            inner: Mutex::new(PoolInner {
                available,
                in_use: BTreeMap::new(),
                next_ticket: 1,
                created: prefill,
                max_size,
            }),
            total_acquired: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            total_created: AtomicU64::new(prefill as u64),
            total_discarded: AtomicU64::new(0),
            emergency_allocations: AtomicU64::new(0),
        }
    }

    /// Acquire an object. Never fails: exhaustion falls through forced
    /// cleanup and finally an untracked emergency allocation.
    pub fn acquire(&self) -> Pooled<T> {
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if let Some(value) = inner.available.pop() {
            self.total_reused.fetch_add(1, Ordering::Relaxed);
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.in_use.insert(ticket, Instant::now());
            return Pooled {
                value,
                ticket,
                emergency: false,
            };
        }

        if inner.created < inner.max_size {
            inner.created += 1;
            self.total_created.fetch_add(1, Ordering::Relaxed);
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.in_use.insert(ticket, Instant::now());
            return Pooled {
                value: T::default(),
                ticket,
                emergency: false,
            };
        }

        // Exhausted: write off the oldest stale tickets (up to 10% of
        // capacity) so the pool can keep serving. Freshly held objects are
        // never reclaimed.
        let write_off = ((inner.max_size as f64 * FORCED_CLEANUP_FRACTION) as usize).max(1);
        let victims: Vec<u64> = inner
            .in_use
            .iter()
            .filter(|(_, held_since)| held_since.elapsed() >= self.stale_hold)
            .take(write_off)
            .map(|(ticket, _)| *ticket)
            .collect();
        if !victims.is_empty() {
            for ticket in &victims {
                inner.in_use.remove(ticket);
            }
            inner.created = inner.created.saturating_sub(victims.len());
            self.total_discarded
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            warn!(
                pool = %self.name,
                written_off = victims.len(),
                "pool exhausted — forced cleanup of oldest held objects"
            );

            inner.created += 1;
            self.total_created.fetch_add(1, Ordering::Relaxed);
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.in_use.insert(ticket, Instant::now());
            return Pooled {
                value: T::default(),
                ticket,
                emergency: false,
            };
        }

        // Nothing to clean up. Allocate outside the pool and log the leak.
        self.emergency_allocations.fetch_add(1, Ordering::Relaxed);
        warn!(
            pool = %self.name,
            max_size = inner.max_size,
            "pool at capacity with nothing reclaimable — emergency allocation (potential leak)"
        );
        Pooled {
            value: T::default(),
            ticket: 0,
            emergency: true,
        }
    }

    /// Return an object to the pool. Idempotent: objects that were written
    /// off by forced cleanup, or emergency allocations, are discarded.
    pub fn release(&self, mut pooled: Pooled<T>) {
        if pooled.emergency {
            self.total_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut inner = self.inner.lock();
        if inner.in_use.remove(&pooled.ticket).is_none() {
            // Already written off or double-released.
            self.total_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !pooled.value.reset() {
            inner.created = inner.created.saturating_sub(1);
            self.total_discarded.fetch_add(1, Ordering::Relaxed);
            warn!(pool = %self.name, "reset failed — object discarded");
            return;
        }

        if inner.available.len() >= inner.max_size {
            inner.created = inner.created.saturating_sub(1);
            self.total_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        inner.available.push(pooled.value);
        self.total_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }
}

impl<T: Poolable> MonitoredPool for ObjectPool<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let acquired = self.total_acquired.load(Ordering::Relaxed);
        let released = self.total_released.load(Ordering::Relaxed);
        let release_efficiency = if acquired > 0 {
            released as f64 / acquired as f64
        } else {
            1.0
        };
        let utilization = if inner.max_size > 0 {
            inner.created as f64 / inner.max_size as f64
        } else {
            1.0
        };

        PoolStats {
            name: self.name.clone(),
            max_size: inner.max_size,
            available: inner.available.len(),
            in_use: inner.in_use.len(),
            created: inner.created,
            total_acquired: acquired,
            total_released: released,
            total_reused: self.total_reused.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_discarded: self.total_discarded.load(Ordering::Relaxed),
            emergency_allocations: self.emergency_allocations.load(Ordering::Relaxed),
            release_efficiency,
            utilization,
        }
    }

    fn health_check(&self) -> PoolHealth {
        let stats = self.stats();
        let mut issues = Vec::new();

        // Only judge efficiency once the pool has seen meaningful traffic.
        if stats.total_acquired >= 10 && stats.release_efficiency < MIN_RELEASE_EFFICIENCY {
            issues.push(format!(
                "release efficiency {:.2} below {MIN_RELEASE_EFFICIENCY}",
                stats.release_efficiency
            ));
        }
        if stats.utilization > MAX_HEALTHY_UTILIZATION {
            issues.push(format!(
                "utilization {:.2} above {MAX_HEALTHY_UTILIZATION}",
                stats.utilization
            ));
        }
        if stats.emergency_allocations > 0 {
            issues.push(format!(
                "{} emergency allocations (leak suspected)",
                stats.emergency_allocations
            ));
        }

        PoolHealth {
            healthy: issues.is_empty(),
            release_efficiency: stats.release_efficiency,
            utilization: stats.utilization,
            issues,
        }
    }

    /// Write off every outstanding ticket. Held handles become untracked and
    /// will be discarded on release.
    fn release_all(&self) {
        let mut inner = self.inner.lock();
        let outstanding = inner.in_use.len();
        if outstanding > 0 {
            inner.created = inner.created.saturating_sub(outstanding);
            inner.in_use.clear();
            self.total_discarded
                .fetch_add(outstanding as u64, Ordering::Relaxed);
            warn!(pool = %self.name, outstanding, "released all outstanding objects");
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        let freed = inner.available.len();
        inner.created = inner.created.saturating_sub(freed);
        inner.available.clear();
        self.total_discarded.fetch_add(freed as u64, Ordering::Relaxed);
        debug!(pool = %self.name, freed, "pool cleared");
    }

    fn resize(&self, new_max: usize) {
        let mut inner = self.inner.lock();
        inner.max_size = new_max;
        while inner.available.len() > new_max {
            inner.available.pop();
            inner.created = inner.created.saturating_sub(1);
            self.total_discarded.fetch_add(1, Ordering::Relaxed);
        }
        debug!(pool = %self.name, new_max, "pool resized");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Widget {
        payload: u64,
        poisoned: bool,
    }

    impl Poolable for Widget {
        fn reset(&mut self) -> bool {
            if self.poisoned {
                return false;
            }
            self.payload = 0;
            true
        }
    }

    #[test]
    fn acquire_reuses_released_objects() {
        let pool: ObjectPool<Widget> = ObjectPool::new("widgets", 10, 2);

        let mut a = pool.acquire();
        a.payload = 42;
        pool.release(a);

        let b = pool.acquire();
        // Reset scrubbed the payload.
        assert_eq!(b.payload, 0);

        let stats = pool.stats();
        assert_eq!(stats.total_acquired, 2);
        assert_eq!(stats.total_released, 1);
        assert!(stats.total_reused >= 2);
        pool.release(b);
    }

    #[test]
    fn accounting_bound_holds() {
        let pool: ObjectPool<Widget> = ObjectPool::new("widgets", 8, 0);
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.acquire());
        }
        let stats = pool.stats();
        assert!(stats.in_use + stats.available <= stats.max_size);
        for h in held {
            pool.release(h);
        }
        let stats = pool.stats();
        assert!(stats.in_use + stats.available <= stats.max_size);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn exhaustion_forces_cleanup_of_stale_tickets() {
        // Zero stale threshold makes every held ticket immediately eligible.
        let pool: ObjectPool<Widget> =
            ObjectPool::with_stale_hold("widgets", 10, 0, Duration::ZERO);
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.acquire());
        }

        // Eleventh acquire writes off the oldest ticket instead of failing.
        let extra = pool.acquire();
        assert!(!extra.is_emergency());
        let stats = pool.stats();
        assert!(stats.total_discarded >= 1);
        assert!(stats.created <= stats.max_size);

        // Releasing the written-off handle is a quiet discard.
        let oldest = held.remove(0);
        pool.release(oldest);
        let after = pool.stats();
        assert!(after.total_discarded > stats.total_discarded);
        pool.release(extra);
        for h in held {
            pool.release(h);
        }
    }

    #[test]
    fn rapid_exhaustion_emergency_allocates() {
        // Default stale threshold: a burst of acquires holds every ticket
        // fresh, so the over-capacity acquire cannot reclaim anything and
        // must fall through to the emergency path.
        let pool: ObjectPool<Widget> = ObjectPool::new("widgets", 20, 0);
        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(pool.acquire());
        }

        let extra = pool.acquire();
        assert!(extra.is_emergency());
        let stats = pool.stats();
        assert_eq!(stats.emergency_allocations, 1);
        assert!(!pool.health_check().healthy);

        // Emergency handles are discarded on release, never re-pooled.
        pool.release(extra);
        assert_eq!(pool.stats().available, 0);
        for h in held {
            pool.release(h);
        }
    }

    #[test]
    fn failed_reset_discards() {
        let pool: ObjectPool<Widget> = ObjectPool::new("widgets", 4, 0);
        let mut w = pool.acquire();
        w.poisoned = true;
        pool.release(w);

        let stats = pool.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total_released, 0);
        assert!(stats.total_discarded >= 1);
    }

    #[test]
    fn health_flags_leak() {
        let pool: ObjectPool<Widget> = ObjectPool::new("widgets", 4, 0);
        let mut held = Vec::new();
        // Acquire far past capacity without releasing.
        for _ in 0..20 {
            held.push(pool.acquire());
        }
        let health = pool.health_check();
        assert!(!health.healthy);
        assert!(!health.issues.is_empty());
    }

    #[test]
    fn clear_and_resize() {
        let pool: ObjectPool<Widget> = ObjectPool::new("widgets", 10, 5);
        assert_eq!(pool.stats().available, 5);
        pool.clear();
        assert_eq!(pool.stats().available, 0);

        pool.resize(3);
        assert_eq!(pool.max_size(), 3);
        let stats = pool.stats();
        assert!(stats.available <= 3);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // For any interleaving of acquires and releases, tracked
            // accounting stays within the ceiling; only emergency
            // allocations may exceed it, and they are counted.
            #[test]
            fn accounting_bound(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
                let pool: ObjectPool<Widget> = ObjectPool::new("widgets", 16, 4);
                let mut held: Vec<Pooled<Widget>> = Vec::new();

                for acquire in ops {
                    if acquire {
                        held.push(pool.acquire());
                    } else if let Some(h) = held.pop() {
                        pool.release(h);
                    }
                }

                let stats = pool.stats();
                prop_assert!(stats.in_use + stats.available <= stats.max_size);
                prop_assert!(stats.created <= stats.max_size);
                let tracked_held =
                    held.iter().filter(|h| !h.is_emergency()).count();
                prop_assert!(tracked_held >= stats.in_use);
            }
        }
    }

    #[test]
    fn release_all_writes_off_outstanding() {
        let pool: ObjectPool<Widget> = ObjectPool::new("widgets", 10, 0);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release_all();
        assert_eq!(pool.stats().in_use, 0);

        // Late releases after the write-off are discarded, not re-pooled.
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().available, 0);
    }
}
