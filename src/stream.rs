//! Stream lifecycle
//!
//! A [`Stream`] ties one device stream to its own staging pool. Creating it
//! creates the device stream at the requested priority; destroying it waits
//! for outstanding work, destroys the device stream and frees every pinned
//! buffer the pool ever allocated.
//!
//! ```text
//! create ──► transfers() / marker() / synchronize() ──► destroy
//!                                                          │
//!                    synchronize ─► destroy_stream ─► pool teardown
//! ```

use std::fmt;
use std::sync::Arc;

use crate::bracket::EventBracket;
use crate::config::StagingConfig;
use crate::driver::{DriverLog, SharedDriver};
use crate::error::{Result, StagingError};
use crate::handle::{StreamHandle, StreamPriority};
use crate::pool::StagingPool;
use crate::transfer::{TransferCounters, TransferOrchestrator, TransferStats};

/// Device stream plus the staging pool serving its transfers
pub struct Stream {
    driver: SharedDriver,
    handle: StreamHandle,
    priority: i32,
    pool: Arc<StagingPool>,
    counters: TransferCounters,
    log: DriverLog,
    destroyed: bool,
}

impl Stream {
    /// Create a stream at the configured default priority
    ///
    /// # Errors
    ///
    /// - `StagingError::Config` if `config` is invalid.
    /// - `StagingError::Device` if the priority query or stream creation
    ///   fails; nothing is left allocated.
    pub fn create(driver: SharedDriver, config: &StagingConfig) -> Result<Self> {
        Self::create_with_priority(driver, config.default_priority, config)
    }

    /// Create a stream at an explicit priority
    ///
    /// The priority is resolved against the device's supported range and
    /// clamped into it.
    ///
    /// # Errors
    ///
    /// Same as [`Stream::create`].
    pub fn create_with_priority(
        driver: SharedDriver,
        priority: StreamPriority,
        config: &StagingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let log = DriverLog::new(config.log_driver_calls);
        let range = log.device("stream_priority_range", driver.stream_priority_range())?;
        let level = priority.resolve(range);
        let handle = log.device("create_stream", driver.create_stream(level))?;
        let pool = Arc::new(StagingPool::new(SharedDriver::clone(&driver), config));
        tracing::debug!(
            driver = driver.name(),
            stream = %handle,
            ?priority,
            level,
            "stream created"
        );
        Ok(Self {
            driver,
            handle,
            priority: level,
            pool,
            counters: TransferCounters::default(),
            log,
            destroyed: false,
        })
    }

    /// Device stream handle
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    /// Resolved device priority level
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Staging pool owned by this stream
    #[must_use]
    pub fn pool(&self) -> &StagingPool {
        &self.pool
    }

    /// Driver this stream issues work through
    #[must_use]
    pub fn driver(&self) -> &SharedDriver {
        &self.driver
    }

    /// Transfer entry points for this stream
    #[must_use]
    pub fn transfers(&self) -> TransferOrchestrator<'_> {
        TransferOrchestrator::new(
            &self.driver,
            &self.pool,
            &self.counters,
            self.handle,
            self.log,
        )
    }

    /// Transfer counters for this stream
    #[must_use]
    pub fn transfer_stats(&self) -> TransferStats {
        self.counters.snapshot()
    }

    /// Bracket with nothing between its markers
    ///
    /// Completes once everything issued on the stream so far finished.
    ///
    /// # Errors
    ///
    /// Returns the failing event call.
    pub fn marker(&self) -> Result<EventBracket> {
        EventBracket::marker(&self.driver, self.log, self.handle)
    }

    /// Block until all issued work, completion callbacks included, finished
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Device` if the wait fails.
    pub fn synchronize(&self) -> Result<()> {
        self.log.device(
            "synchronize_stream",
            self.driver.synchronize_stream(self.handle),
        )
    }

    /// Tear the stream down
    ///
    /// Runs every step even when an earlier one fails and reports each
    /// outcome separately. The pool is only torn down after a successful
    /// synchronize; otherwise its buffers are leaked rather than freed under
    /// a copy that may still be running.
    pub fn destroy(mut self) -> DestroyReport {
        self.destroyed = true;
        self.shutdown()
    }

    fn shutdown(&self) -> DestroyReport {
        let synchronize = self.synchronize();
        let stream = self
            .log
            .device("destroy_stream", self.driver.destroy_stream(self.handle));
        let pool = if synchronize.is_ok() {
            // SAFETY: the stream was drained above, so no device operation
            // still touches a pool buffer.
            unsafe { self.pool.teardown() }
        } else {
            Err(StagingError::LifecycleMisuse(
                "pool not torn down: stream could not be synchronized".to_string(),
            ))
        };
        let report = DestroyReport {
            synchronize,
            stream,
            pool,
        };
        if report.is_ok() {
            tracing::debug!(stream = %self.handle, freed = ?report.pool.as_ref().ok(), "stream destroyed");
        } else {
            tracing::warn!(stream = %self.handle, ?report, "stream destroyed with errors");
        }
        report
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        tracing::debug!(stream = %self.handle, "stream dropped without destroy; tearing down");
        let _ = self.shutdown();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("driver", &self.driver.name())
            .field("handle", &self.handle)
            .field("priority", &self.priority)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Outcome of each step of [`Stream::destroy`]
#[derive(Debug)]
pub struct DestroyReport {
    /// Waiting for outstanding work
    pub synchronize: Result<()>,
    /// Destroying the device stream
    pub stream: Result<()>,
    /// Freeing the pool; `Ok` holds the number of buffers freed
    pub pool: Result<usize>,
}

impl DestroyReport {
    /// Whether every step succeeded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.synchronize.is_ok() && self.stream.is_ok() && self.pool.is_ok()
    }

    /// First failure in step order, or the number of buffers freed
    ///
    /// # Errors
    ///
    /// Returns the earliest failing step's error.
    pub fn into_result(self) -> Result<usize> {
        self.synchronize?;
        self.stream?;
        self.pool
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::{FaultPoint, MockDriver, MockDriverConfig};

    fn mock() -> (Arc<MockDriver>, SharedDriver) {
        let mock = Arc::new(MockDriver::new());
        let shared: SharedDriver = mock.clone();
        (mock, shared)
    }

    #[test]
    fn test_create_resolves_priority() {
        let (_mock, driver) = mock();
        let config = StagingConfig::default();
        let highest =
            Stream::create_with_priority(SharedDriver::clone(&driver), StreamPriority::Highest, &config)
                .unwrap();
        assert_eq!(highest.priority(), -5);
        let lowest =
            Stream::create_with_priority(SharedDriver::clone(&driver), StreamPriority::Lowest, &config)
                .unwrap();
        assert_eq!(lowest.priority(), 0);
        let clamped =
            Stream::create_with_priority(driver, StreamPriority::Level(-40), &config).unwrap();
        assert_eq!(clamped.priority(), -5);
    }

    #[test]
    fn test_create_failure_leaves_nothing() {
        let (mock, driver) = mock();
        mock.inject_fault(FaultPoint::CreateStream, 1);
        let err = Stream::create(driver, &StagingConfig::default()).unwrap_err();
        assert_eq!(err.driver_call(), Some("create_stream"));
        assert_eq!(mock.stats().live_streams, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_mock, driver) = mock();
        let config = StagingConfig {
            limits: crate::PoolLimits {
                max_regions: Some(0),
                ..crate::PoolLimits::default()
            },
            ..StagingConfig::default()
        };
        assert!(matches!(
            Stream::create(driver, &config),
            Err(StagingError::Config(_))
        ));
    }

    #[test]
    fn test_destroy_frees_every_region() {
        let (mock, driver) = mock();
        let stream = Stream::create(driver, &StagingConfig::default()).unwrap();
        let device = mock.alloc_device(4096);
        for size in [64usize, 1024, 4096, 16] {
            stream.transfers().write(device, &vec![1u8; size]).unwrap();
        }
        let report = stream.destroy();
        assert!(report.is_ok(), "{report:?}");
        let freed = report.into_result().unwrap();
        assert!(freed >= 1);

        let stats = mock.stats();
        assert_eq!(stats.live_pinned, 0);
        assert_eq!(stats.invalid_frees, 0);
        assert_eq!(stats.live_streams, 0);
        assert_eq!(stats.live_events, 0);
    }

    #[test]
    fn test_destroy_waits_for_in_flight_writes() {
        let mock = Arc::new(MockDriver::with_config(MockDriverConfig {
            copy_latency: Duration::from_millis(10),
            ..MockDriverConfig::default()
        }));
        let stream = Stream::create(mock.clone(), &StagingConfig::default()).unwrap();
        let device = mock.alloc_device(32);
        stream.transfers().write(device, &[8u8; 32]).unwrap();
        assert_eq!(stream.pool().in_flight(), 1);
        stream.destroy().into_result().unwrap();
        assert_eq!(mock.read_device(device, 32).unwrap(), vec![8u8; 32]);
        assert_eq!(mock.stats().live_pinned, 0);
    }

    #[test]
    fn test_destroy_reports_each_failure() {
        let (mock, driver) = mock();
        let stream = Stream::create(driver, &StagingConfig::default()).unwrap();
        let mut out = [0u8; 8];
        let device = mock.alloc_device(8);
        stream.transfers().read_blocking(device, &mut out).unwrap();

        mock.inject_fault(FaultPoint::DestroyStream, 1);
        let report = stream.destroy();
        assert!(report.synchronize.is_ok());
        assert_eq!(
            report.stream.as_ref().unwrap_err().driver_call(),
            Some("destroy_stream")
        );
        assert_eq!(*report.pool.as_ref().unwrap(), 1);
        assert!(!report.is_ok());
        assert_eq!(mock.stats().live_pinned, 0);
    }

    #[test]
    fn test_failed_synchronize_skips_pool_teardown() {
        let (mock, driver) = mock();
        let stream = Stream::create(driver, &StagingConfig::default()).unwrap();
        let device = mock.alloc_device(8);
        stream.transfers().write(device, &[1u8; 8]).unwrap();
        stream.synchronize().unwrap();

        mock.inject_fault(FaultPoint::SynchronizeStream, 1);
        let report = stream.destroy();
        assert!(report.synchronize.is_err());
        assert!(report.stream.is_ok());
        assert!(matches!(report.pool, Err(StagingError::LifecycleMisuse(_))));
        assert_eq!(mock.stats().live_pinned, 1);
    }

    #[test]
    fn test_drop_tears_down() {
        let (mock, driver) = mock();
        {
            let stream = Stream::create(driver, &StagingConfig::default()).unwrap();
            let device = mock.alloc_device(128);
            stream.transfers().write(device, &[0u8; 128]).unwrap();
        }
        let stats = mock.stats();
        assert_eq!(stats.live_pinned, 0);
        assert_eq!(stats.live_streams, 0);
    }

    #[test]
    fn test_marker_orders_behind_writes() {
        let mock = Arc::new(MockDriver::with_config(MockDriverConfig {
            copy_latency: Duration::from_millis(5),
            ..MockDriverConfig::default()
        }));
        let stream = Stream::create(mock.clone(), &StagingConfig::default()).unwrap();
        let device = mock.alloc_device(16);
        stream.transfers().write(device, &[6u8; 16]).unwrap();
        let marker = stream.marker().unwrap();
        marker.wait_until_complete().unwrap();
        assert_eq!(mock.read_device(device, 16).unwrap(), vec![6u8; 16]);
        stream.destroy().into_result().unwrap();
    }
}
