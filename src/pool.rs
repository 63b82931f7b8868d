//! Staging pool: FIFO free list of pinned regions
//!
//! One pool exists per stream. Transfers `acquire` a region big enough for
//! their payload and hand it back with `release`, either directly (blocking
//! device-to-host path) or from a device completion callback running on the
//! runtime's notification thread. All pool state sits behind one mutex, so
//! acquires and releases from any mix of threads are serialized.
//!
//! ## Sizing
//!
//! Regions are reused first-in first-out regardless of size. A reused region
//! that is too small is grown in place (old buffer freed, larger one
//! allocated), which keeps steady-state memory near the working-set transfer
//! size rather than the historical maximum.
//!
//! ## Backpressure
//!
//! With [`PoolLimits::max_regions`] set, an `acquire` that would create a
//! region beyond the cap waits for a release instead, up to
//! [`PoolLimits::acquire_timeout`].

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::{PoolLimits, StagingConfig};
use crate::driver::{DriverLog, SharedDriver};
use crate::error::{Result, StagingError};
use crate::region::{RegionId, StagingRegion};
use crate::registry::RegionRegistry;

#[derive(Default)]
struct PoolState {
    free: VecDeque<StagingRegion>,
    /// Regions handed out and not yet released or orphaned
    outstanding: HashSet<RegionId>,
    /// Regions counted against the cap, including allocations in progress
    live: usize,
    orphaned: usize,
    hits: usize,
    misses: usize,
    grows: usize,
    peak_bytes: usize,
    torn_down: bool,
}

enum Source {
    Reused,
    Grown,
    Created,
}

/// Pinned staging pool owned by one stream
///
/// Pools are created and torn down by [`Stream`](crate::Stream); the stream's
/// teardown frees every buffer the pool allocated. A pool has no `Drop` of its
/// own.
pub struct StagingPool {
    driver: SharedDriver,
    log: DriverLog,
    limits: PoolLimits,
    min_region_bytes: usize,
    state: Mutex<PoolState>,
    released: Condvar,
    registry: RegionRegistry,
}

impl StagingPool {
    /// Create an empty pool allocating through `driver`
    #[must_use]
    pub(crate) fn new(driver: SharedDriver, config: &StagingConfig) -> Self {
        let log = DriverLog::new(config.log_driver_calls);
        Self {
            registry: RegionRegistry::new(SharedDriver::clone(&driver), log),
            driver,
            log,
            limits: config.limits.clone(),
            min_region_bytes: config.min_region_bytes,
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    /// Take a region holding at least `min_size` bytes
    ///
    /// Reuses the oldest idle region, growing it if needed, or allocates a
    /// new one. The caller owns the region until it is released.
    ///
    /// # Errors
    ///
    /// - `StagingError::Allocation` if a pinned allocation or free failed;
    ///   no region is granted and pool state is unchanged apart from the
    ///   discarded region.
    /// - `StagingError::PoolExhausted` if the region cap stayed saturated
    ///   for the whole wait budget.
    /// - `StagingError::LifecycleMisuse` after teardown.
    pub fn acquire(&self, min_size: usize) -> Result<StagingRegion> {
        let wanted = min_size.max(1);
        let started = Instant::now();
        let reused = {
            let mut state = self.state.lock();
            loop {
                if state.torn_down {
                    return Err(StagingError::LifecycleMisuse(
                        "acquire on a torn-down staging pool".to_string(),
                    ));
                }
                if let Some(region) = state.free.pop_front() {
                    break Some(region);
                }
                match self.limits.max_regions {
                    Some(limit) if state.live >= limit => {
                        let budget = self.limits.acquire_timeout();
                        let waited = started.elapsed();
                        if waited >= budget {
                            return Err(StagingError::PoolExhausted { limit, waited });
                        }
                        self.released.wait_for(&mut state, budget - waited);
                    }
                    _ => {
                        // Reserve the slot before allocating outside the lock.
                        state.live += 1;
                        break None;
                    }
                }
            }
        };

        let (region, source) = match reused {
            Some(region) if region.capacity() >= wanted => (region, Source::Reused),
            Some(region) => (self.grow(region, wanted)?, Source::Grown),
            None => (self.create(wanted)?, Source::Created),
        };

        let pooled_bytes = self.registry.total_bytes();
        let mut state = self.state.lock();
        match source {
            Source::Reused => state.hits += 1,
            Source::Grown => state.grows += 1,
            Source::Created => state.misses += 1,
        }
        state.peak_bytes = state.peak_bytes.max(pooled_bytes);
        state.outstanding.insert(region.id());
        Ok(region)
    }

    /// Return a region to the back of the free list
    ///
    /// Safe to call from a device completion callback concurrently with
    /// `acquire` on other threads.
    ///
    /// # Errors
    ///
    /// Returns `StagingError::LifecycleMisuse` if the region is not currently
    /// handed out by this pool (released twice, or from another pool).
    pub fn release(&self, region: StagingRegion) -> Result<()> {
        let mut state = self.state.lock();
        if !state.outstanding.remove(&region.id()) {
            return Err(StagingError::LifecycleMisuse(format!(
                "{} released but not outstanding from this pool",
                region.id()
            )));
        }
        state.free.push_back(region);
        drop(state);
        self.released.notify_one();
        Ok(())
    }

    /// Give up on a region whose device operation may still be running
    ///
    /// The region never re-enters the free list; its buffer stays registered
    /// and is freed at teardown.
    pub(crate) fn orphan(&self, region: StagingRegion) {
        let mut state = self.state.lock();
        if state.outstanding.remove(&region.id()) {
            state.orphaned += 1;
        }
        tracing::warn!(region = %region.id(), "staging region orphaned until teardown");
    }

    /// Empty the free list, returning every idle region
    ///
    /// In-flight regions are untouched. Drained regions stop counting against
    /// the cap; their buffers stay registered until teardown.
    pub(crate) fn drain_all(&self) -> Vec<StagingRegion> {
        let mut state = self.state.lock();
        let drained: Vec<StagingRegion> = state.free.drain(..).collect();
        state.live = state.live.saturating_sub(drained.len());
        drop(state);
        self.released.notify_all();
        drained
    }

    /// Free every buffer this pool ever allocated
    ///
    /// Regions still outstanding are reported as misuse and left allocated,
    /// since a device operation may still touch them; everything else is
    /// freed exactly once. Returns the number of buffers freed.
    ///
    /// # Safety
    ///
    /// All device work that used this pool's regions must have completed.
    ///
    /// # Errors
    ///
    /// `StagingError::LifecycleMisuse` if regions were still in flight,
    /// otherwise the first failed free.
    pub(crate) unsafe fn teardown(&self) -> Result<usize> {
        let in_flight: Vec<RegionId> = {
            let mut state = self.state.lock();
            state.torn_down = true;
            state.outstanding.drain().collect()
        };
        let idle = self.drain_all().len();
        self.state.lock().live = 0;
        for id in &in_flight {
            self.registry.retire(*id);
        }
        // SAFETY: idle regions were drained and dropped above, in-flight ones
        // retired, and the caller guarantees device work completed.
        let freed = unsafe { self.registry.release_all() };
        tracing::debug!(
            driver = self.driver.name(),
            idle,
            in_flight = in_flight.len(),
            freed = ?freed.as_ref().ok(),
            "staging pool torn down"
        );
        if !in_flight.is_empty() {
            return Err(StagingError::LifecycleMisuse(format!(
                "{} staging region(s) still in flight at teardown",
                in_flight.len()
            )));
        }
        freed
    }

    /// Registry of every region this pool created
    #[must_use]
    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Growth limits in effect
    #[must_use]
    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    /// Number of idle regions
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of regions currently handed out
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Pool statistics
    #[must_use]
    pub fn stats(&self) -> StagingPoolStats {
        let pooled_bytes = self.registry.total_bytes();
        let live_regions = self.registry.len();
        let state = self.state.lock();
        let lookups = state.hits + state.grows + state.misses;
        StagingPoolStats {
            live_regions,
            free_regions: state.free.len(),
            in_flight: state.outstanding.len(),
            orphaned: state.orphaned,
            pooled_bytes,
            peak_bytes: state.peak_bytes,
            hits: state.hits,
            misses: state.misses,
            grows: state.grows,
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    fn create(&self, wanted: usize) -> Result<StagingRegion> {
        let capacity = wanted.max(self.min_region_bytes);
        match self
            .log
            .allocation("alloc_pinned", self.driver.alloc_pinned(capacity))
        {
            Ok(buffer) => {
                let region = StagingRegion::new(buffer, capacity);
                self.registry.record(&region);
                tracing::debug!(region = %region.id(), capacity, "staging region created");
                Ok(region)
            }
            Err(err) => {
                self.state.lock().live -= 1;
                self.released.notify_one();
                Err(err)
            }
        }
    }

    fn grow(&self, mut region: StagingRegion, wanted: usize) -> Result<StagingRegion> {
        let old_capacity = region.capacity();
        // SAFETY: the region came off the free list, so no device operation
        // still uses its buffer.
        let freed = unsafe { self.driver.free_pinned(region.buffer()) };
        if let Err(err) = self.log.allocation("free_pinned", freed) {
            self.discard(region);
            return Err(err);
        }
        match self
            .log
            .allocation("alloc_pinned", self.driver.alloc_pinned(wanted))
        {
            Ok(buffer) => {
                region.replace_buffer(buffer, wanted);
                self.registry.update(&region);
                tracing::debug!(
                    region = %region.id(),
                    from = old_capacity,
                    to = wanted,
                    "staging region grown"
                );
                Ok(region)
            }
            Err(err) => {
                self.discard(region);
                Err(err)
            }
        }
    }

    /// Drop a region whose buffer is gone (or unknown) after a failed growth
    fn discard(&self, region: StagingRegion) {
        self.registry.retire(region.id());
        self.state.lock().live -= 1;
        self.released.notify_one();
        tracing::warn!(region = %region.id(), "staging region discarded after failed growth");
    }
}

impl fmt::Debug for StagingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingPool")
            .field("driver", &self.driver.name())
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Staging pool statistics
#[derive(Debug, Clone, PartialEq)]
pub struct StagingPoolStats {
    /// Regions whose buffers are currently allocated
    pub live_regions: usize,
    /// Idle regions in the free list
    pub free_regions: usize,
    /// Regions handed out to transfers
    pub in_flight: usize,
    /// Regions parked until teardown after a failed callback registration
    pub orphaned: usize,
    /// Pinned bytes currently allocated
    pub pooled_bytes: usize,
    /// Largest `pooled_bytes` observed
    pub peak_bytes: usize,
    /// Acquires served by an idle region without growth
    pub hits: usize,
    /// Acquires that allocated a new region
    pub misses: usize,
    /// Acquires that grew an idle region
    pub grows: usize,
    /// Hits over all acquires (0.0 - 1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::driver::{FaultPoint, MockDriver};

    fn pool_with(config: &StagingConfig) -> (Arc<MockDriver>, StagingPool) {
        let mock = Arc::new(MockDriver::new());
        let pool = StagingPool::new(mock.clone(), config);
        (mock, pool)
    }

    #[test]
    fn test_acquire_creates_then_reuses() {
        let (_mock, pool) = pool_with(&StagingConfig::default());
        let region = pool.acquire(100).unwrap();
        let id = region.id();
        assert_eq!(region.capacity(), 100);
        assert_eq!(pool.in_flight(), 1);
        pool.release(region).unwrap();
        assert_eq!(pool.free_len(), 1);

        let again = pool.acquire(50).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.capacity(), 100);
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        pool.release(again).unwrap();
    }

    #[test]
    fn test_fifo_order_of_released_regions() {
        let (_mock, pool) = pool_with(&StagingConfig::default());
        let a = pool.acquire(64).unwrap();
        let b = pool.acquire(64).unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.acquire(8).unwrap().id(), a_id);
        assert_eq!(pool.acquire(8).unwrap().id(), b_id);
    }

    #[test]
    fn test_growth_frees_old_buffer_once() {
        let (mock, pool) = pool_with(&StagingConfig::default());
        let small = pool.acquire(16).unwrap();
        let id = small.id();
        pool.release(small).unwrap();

        let grown = pool.acquire(4096).unwrap();
        assert_eq!(grown.id(), id);
        assert!(grown.capacity() >= 4096);
        let stats = mock.stats();
        assert_eq!(stats.pinned_allocs, 2);
        assert_eq!(stats.pinned_frees, 1);
        assert_eq!(stats.live_pinned, 1);
        assert_eq!(pool.stats().grows, 1);
        assert_eq!(pool.registry().total_bytes(), 4096);
        pool.release(grown).unwrap();
    }

    #[test]
    fn test_min_region_bytes_floor() {
        let config = StagingConfig::default().with_min_region_bytes(1024);
        let (_mock, pool) = pool_with(&config);
        let region = pool.acquire(10).unwrap();
        assert_eq!(region.capacity(), 1024);
        let zero = pool.acquire(0).unwrap();
        assert_eq!(zero.capacity(), 1024);
    }

    #[test]
    fn test_failed_allocation_grants_nothing() {
        let (mock, pool) = pool_with(&StagingConfig::default());
        mock.inject_fault(FaultPoint::AllocPinned, 1);
        let err = pool.acquire(32).unwrap_err();
        assert!(err.is_allocation());
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.registry().is_empty());
        assert!(pool.acquire(32).is_ok());
    }

    #[test]
    fn test_failed_growth_discards_region() {
        let (mock, pool) = pool_with(&StagingConfig::default());
        let small = pool.acquire(8).unwrap();
        pool.release(small).unwrap();
        mock.inject_fault(FaultPoint::AllocPinned, 1);

        let err = pool.acquire(1024).unwrap_err();
        assert_eq!(err.driver_call(), Some("alloc_pinned"));
        assert_eq!(pool.free_len(), 0);
        assert!(pool.registry().is_empty());
        assert_eq!(mock.stats().live_pinned, 0);
    }

    #[test]
    fn test_release_twice_or_foreign_is_misuse() {
        let (_mock, pool) = pool_with(&StagingConfig::default());
        let (_other_mock, other) = pool_with(&StagingConfig::default());
        let foreign = other.acquire(8).unwrap();
        let err = pool.release(foreign).unwrap_err();
        assert!(matches!(err, StagingError::LifecycleMisuse(_)));
    }

    #[test]
    fn test_cap_times_out_without_release() {
        let config = StagingConfig::default()
            .with_max_regions(1)
            .with_acquire_timeout(Duration::from_millis(20));
        let (_mock, pool) = pool_with(&config);
        let held = pool.acquire(8).unwrap();
        let err = pool.acquire(8).unwrap_err();
        assert!(matches!(err, StagingError::PoolExhausted { limit: 1, .. }));
        pool.release(held).unwrap();
    }

    #[test]
    fn test_cap_waits_for_release_from_other_thread() {
        let config = StagingConfig::default()
            .with_max_regions(1)
            .with_acquire_timeout(Duration::from_secs(5));
        let (_mock, pool) = pool_with(&config);
        let pool = Arc::new(pool);
        let held = pool.acquire(8).unwrap();
        let held_id = held.id();

        let releaser = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pool.release(held).unwrap();
            })
        };
        let next = pool.acquire(8).unwrap();
        releaser.join().unwrap();
        assert_eq!(next.id(), held_id);
        assert_eq!(pool.registry().len(), 1);
    }

    #[test]
    fn test_teardown_frees_everything_once() {
        let (mock, pool) = pool_with(&StagingConfig::default());
        let regions: Vec<_> = (1..=4).map(|i| pool.acquire(i * 32).unwrap()).collect();
        for region in regions {
            pool.release(region).unwrap();
        }
        // SAFETY: no device work was issued.
        assert_eq!(unsafe { pool.teardown() }.unwrap(), 4);
        assert_eq!(pool.free_len(), 0);
        assert!(pool.registry().is_empty());
        let stats = mock.stats();
        assert_eq!(stats.pinned_frees, 4);
        assert_eq!(stats.invalid_frees, 0);
        assert!(matches!(
            pool.acquire(8),
            Err(StagingError::LifecycleMisuse(_))
        ));
    }

    #[test]
    fn test_teardown_reports_in_flight_regions() {
        let (mock, pool) = pool_with(&StagingConfig::default());
        let idle = pool.acquire(8).unwrap();
        pool.release(idle).unwrap();
        let _busy = pool.acquire(8).unwrap();
        let _busy2 = pool.acquire(8).unwrap();
        // SAFETY: no device work was issued.
        let err = unsafe { pool.teardown() }.unwrap_err();
        assert!(matches!(err, StagingError::LifecycleMisuse(_)));
        // the idle region was reused by `_busy`, so nothing is safe to free
        assert_eq!(mock.stats().pinned_frees, 0);
        assert!(pool.registry().is_empty());
    }

    #[test]
    fn test_drain_all_leaves_in_flight_alone() {
        let (_mock, pool) = pool_with(&StagingConfig::default());
        let a = pool.acquire(8).unwrap();
        let b = pool.acquire(8).unwrap();
        let busy = pool.acquire(8).unwrap();
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        let drained = pool.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.registry().len(), 3);
        pool.release(busy).unwrap();
    }

    #[test]
    fn test_drained_regions_free_their_cap_slots() {
        let config = StagingConfig::default()
            .with_max_regions(1)
            .with_acquire_timeout(Duration::from_millis(20));
        let (mock, pool) = pool_with(&config);
        let first = pool.acquire(8).unwrap();
        let first_id = first.id();
        pool.release(first).unwrap();

        let drained = pool.drain_all();
        assert_eq!(drained.len(), 1);
        drop(drained);

        let next = pool.acquire(8).unwrap();
        assert_ne!(next.id(), first_id);
        assert_eq!(pool.registry().len(), 2);
        pool.release(next).unwrap();
        // SAFETY: no device work was issued.
        assert_eq!(unsafe { pool.teardown() }.unwrap(), 2);
        let stats = mock.stats();
        assert_eq!(stats.live_pinned, 0);
        assert_eq!(stats.invalid_frees, 0);
    }

    #[test]
    fn test_teardown_drains_free_list() {
        let (mock, pool) = pool_with(&StagingConfig::default());
        let held: Vec<_> = (0..3).map(|_| pool.acquire(16).unwrap()).collect();
        for region in held {
            pool.release(region).unwrap();
        }
        assert_eq!(pool.free_len(), 3);
        // SAFETY: no device work was issued.
        assert_eq!(unsafe { pool.teardown() }.unwrap(), 3);
        assert!(pool.drain_all().is_empty());
        assert_eq!(mock.stats().pinned_frees, 3);
    }

    #[test]
    fn test_concurrent_releases_and_acquires_lose_nothing() {
        const RELEASERS: usize = 16;
        const ACQUIRERS: usize = 10;

        for _ in 0..20 {
            let (mock, pool) = pool_with(&StagingConfig::default());
            let pool = Arc::new(pool);
            let held: Vec<_> = (0..RELEASERS).map(|_| pool.acquire(64).unwrap()).collect();
            let barrier = Arc::new(Barrier::new(RELEASERS + ACQUIRERS));

            let releasers: Vec<_> = held
                .into_iter()
                .map(|region| {
                    let (pool, barrier) = (Arc::clone(&pool), Arc::clone(&barrier));
                    thread::spawn(move || {
                        barrier.wait();
                        pool.release(region).unwrap();
                    })
                })
                .collect();
            let acquirers: Vec<_> = (0..ACQUIRERS)
                .map(|_| {
                    let (pool, barrier) = (Arc::clone(&pool), Arc::clone(&barrier));
                    thread::spawn(move || {
                        barrier.wait();
                        pool.acquire(64).unwrap()
                    })
                })
                .collect();
            for handle in releasers {
                handle.join().unwrap();
            }
            let acquired: Vec<StagingRegion> =
                acquirers.into_iter().map(|h| h.join().unwrap()).collect();

            let acquired_ids: HashSet<RegionId> = acquired.iter().map(StagingRegion::id).collect();
            assert_eq!(acquired_ids.len(), ACQUIRERS);

            let total = pool.registry().len();
            let created = total - RELEASERS;
            let satisfied = ACQUIRERS - created;
            assert_eq!(pool.free_len(), RELEASERS - satisfied);
            assert_eq!(pool.in_flight(), ACQUIRERS);

            // Free list and handed-out regions partition the registry.
            let idle: Vec<RegionId> = pool.drain_all().iter().map(StagingRegion::id).collect();
            let idle_ids: HashSet<RegionId> = idle.iter().copied().collect();
            assert_eq!(idle_ids.len(), idle.len());
            assert!(idle_ids.is_disjoint(&acquired_ids));
            assert_eq!(idle_ids.len() + acquired_ids.len(), total);

            for region in acquired {
                pool.release(region).unwrap();
            }
            // SAFETY: no device work was issued.
            assert_eq!(unsafe { pool.teardown() }.unwrap(), total);
            let stats = mock.stats();
            assert_eq!(stats.pinned_frees, stats.pinned_allocs);
            assert_eq!(stats.invalid_frees, 0);
            assert_eq!(stats.live_pinned, 0);
        }
    }

    #[test]
    fn test_orphaned_region_freed_at_teardown() {
        let (mock, pool) = pool_with(&StagingConfig::default());
        let region = pool.acquire(8).unwrap();
        pool.orphan(region);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.stats().orphaned, 1);
        // SAFETY: no device work was issued.
        assert_eq!(unsafe { pool.teardown() }.unwrap(), 1);
        assert_eq!(mock.stats().live_pinned, 0);
    }
}
