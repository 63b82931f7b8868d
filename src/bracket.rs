//! Event brackets around asynchronous device operations
//!
//! A bracket is a `(before, after)` event pair on one stream. `before` is
//! recorded right before an operation is issued and `after` right after it,
//! so completion of `after` means the operation finished on the device and
//! the distance between the two is the operation's device time.
//!
//! ```text
//!  stream:  ... | before | memcpy / kernel | after | ...
//!                   ^                          ^
//!                 begin()                    end()
//! ```
//!
//! The bracket owns both events and destroys them on drop. A marshalling
//! layer that needs to keep the raw pair takes it with [`EventBracket::into_raw`].

use std::fmt;
use std::time::Duration;

use crate::driver::{DriverLog, SharedDriver};
use crate::error::{Result, StagingError};
use crate::handle::{EventHandle, StreamHandle};

/// Begin/end event pair around one operation on a stream
pub struct EventBracket {
    driver: SharedDriver,
    log: DriverLog,
    stream: StreamHandle,
    before: EventHandle,
    after: EventHandle,
    began: bool,
    ended: bool,
    owned: bool,
}

impl EventBracket {
    /// Create both events; nothing is recorded yet
    pub(crate) fn create(driver: &SharedDriver, log: DriverLog, stream: StreamHandle) -> Result<Self> {
        let before = log.device("create_event", driver.create_event())?;
        let after = match log.device("create_event", driver.create_event()) {
            Ok(after) => after,
            Err(err) => {
                // Best effort; the creation failure is what gets reported.
                let _ = log.device("destroy_event", driver.destroy_event(before));
                return Err(err);
            }
        };
        Ok(Self {
            driver: SharedDriver::clone(driver),
            log,
            stream,
            before,
            after,
            began: false,
            ended: false,
            owned: true,
        })
    }

    /// Bracket with no operation between its markers
    ///
    /// Completion of the bracket means everything issued on the stream before
    /// it has finished.
    pub(crate) fn marker(driver: &SharedDriver, log: DriverLog, stream: StreamHandle) -> Result<Self> {
        let mut bracket = Self::create(driver, log, stream)?;
        bracket.begin()?;
        bracket.end()?;
        Ok(bracket)
    }

    /// Record the `before` marker at the current end of the stream
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Device` if the record call fails.
    pub fn begin(&mut self) -> Result<EventHandle> {
        self.log.device(
            "record_event",
            self.driver.record_event(self.before, self.stream),
        )?;
        self.began = true;
        Ok(self.before)
    }

    /// Record the `after` marker behind the operation just issued
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Device` if the record call fails.
    pub fn end(&mut self) -> Result<EventHandle> {
        self.log.device(
            "record_event",
            self.driver.record_event(self.after, self.stream),
        )?;
        self.ended = true;
        Ok(self.after)
    }

    /// Stream the bracket was recorded on
    #[must_use]
    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    /// Marker positioned before the operation
    #[must_use]
    pub fn before(&self) -> EventHandle {
        self.before
    }

    /// Marker positioned after the operation
    #[must_use]
    pub fn after(&self) -> EventHandle {
        self.after
    }

    /// Whether both markers were recorded
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.began && self.ended
    }

    /// Non-blocking: has the device reached the `before` marker
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Device` if the query fails.
    pub fn has_started(&self) -> Result<bool> {
        if !self.began {
            return Ok(false);
        }
        self.log
            .device("query_event", self.driver.query_event(self.before))
    }

    /// Non-blocking: has the bracketed operation finished
    ///
    /// A bracket whose `after` marker was never recorded never completes.
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Device` if the query fails.
    pub fn is_complete(&self) -> Result<bool> {
        if !self.ended {
            return Ok(false);
        }
        self.log
            .device("query_event", self.driver.query_event(self.after))
    }

    /// Block until the bracketed operation finished
    ///
    /// # Errors
    ///
    /// - `StagingError::LifecycleMisuse` if `after` was never recorded.
    /// - `StagingError::Device` if the wait fails.
    pub fn wait_until_complete(&self) -> Result<()> {
        if !self.ended {
            return Err(StagingError::LifecycleMisuse(
                "waiting on a bracket whose end marker was never recorded".to_string(),
            ));
        }
        self.log
            .device("synchronize_event", self.driver.synchronize_event(self.after))
    }

    /// Device time between the two markers
    ///
    /// # Errors
    ///
    /// - `StagingError::LifecycleMisuse` if a marker was never recorded.
    /// - `StagingError::Device` (`NOT_READY`) if the operation is still
    ///   running.
    pub fn elapsed(&self) -> Result<Duration> {
        if !self.is_recorded() {
            return Err(StagingError::LifecycleMisuse(
                "timing a bracket that was not fully recorded".to_string(),
            ));
        }
        let ms = self.log.device(
            "elapsed_ms",
            self.driver.elapsed_ms(self.before, self.after),
        )?;
        Ok(Duration::from_secs_f64(f64::from(ms.max(0.0)) / 1_000.0))
    }

    /// Hand the raw `(before, after)` pair to the caller
    ///
    /// The caller becomes responsible for destroying both events.
    #[must_use]
    pub fn into_raw(mut self) -> (EventHandle, EventHandle) {
        self.owned = false;
        (self.before, self.after)
    }
}

impl Drop for EventBracket {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        for event in [self.before, self.after] {
            if let Err(err) = self
                .log
                .device("destroy_event", self.driver.destroy_event(event))
            {
                tracing::warn!(%event, error = %err, "failed to destroy bracket event");
            }
        }
    }
}

impl fmt::Debug for EventBracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBracket")
            .field("stream", &self.stream)
            .field("before", &self.before)
            .field("after", &self.after)
            .field("recorded", &self.is_recorded())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::{DeviceDriver, FaultPoint, MockDriver, MockDriverConfig};

    fn setup(config: MockDriverConfig) -> (Arc<MockDriver>, SharedDriver, StreamHandle) {
        let mock = Arc::new(MockDriver::with_config(config));
        let shared: SharedDriver = mock.clone();
        let stream = shared.create_stream(0).unwrap();
        (mock, shared, stream)
    }

    #[test]
    fn test_marker_completes_and_times() {
        let (mock, driver, stream) = setup(MockDriverConfig::default());
        let bracket = EventBracket::marker(&driver, DriverLog::default(), stream).unwrap();
        assert!(bracket.is_recorded());
        bracket.wait_until_complete().unwrap();
        assert!(bracket.is_complete().unwrap());
        assert!(bracket.has_started().unwrap());
        assert!(bracket.elapsed().unwrap() < Duration::from_secs(1));
        assert_eq!(mock.stats().live_events, 2);
        drop(bracket);
        assert_eq!(mock.stats().live_events, 0);
    }

    #[test]
    fn test_unrecorded_bracket_never_completes() {
        let (_mock, driver, stream) = setup(MockDriverConfig::default());
        let bracket = EventBracket::create(&driver, DriverLog::default(), stream).unwrap();
        assert!(!bracket.is_complete().unwrap());
        assert!(!bracket.has_started().unwrap());
        assert!(matches!(
            bracket.wait_until_complete(),
            Err(StagingError::LifecycleMisuse(_))
        ));
        assert!(bracket.elapsed().is_err());
    }

    #[test]
    fn test_into_raw_keeps_events_alive() {
        let (mock, driver, stream) = setup(MockDriverConfig::default());
        let bracket = EventBracket::marker(&driver, DriverLog::default(), stream).unwrap();
        let (before, after) = bracket.into_raw();
        assert_eq!(mock.stats().live_events, 2);
        driver.destroy_event(before).unwrap();
        driver.destroy_event(after).unwrap();
    }

    #[test]
    fn test_record_failure_leaves_bracket_unrecorded() {
        let (mock, driver, stream) = setup(MockDriverConfig::default());
        mock.inject_fault(FaultPoint::RecordEvent, 1);
        let mut bracket = EventBracket::create(&driver, DriverLog::default(), stream).unwrap();
        let err = bracket.begin().unwrap_err();
        assert_eq!(err.driver_call(), Some("record_event"));
        assert!(!bracket.is_recorded());
        drop(bracket);
        assert_eq!(mock.stats().live_events, 0);
    }

    #[test]
    fn test_wait_covers_slow_operation() {
        let (mock, driver, stream) = setup(MockDriverConfig {
            copy_latency: Duration::from_millis(10),
            ..MockDriverConfig::default()
        });
        let device = mock.alloc_device(8);
        let data = [5u8; 8];
        let mut bracket = EventBracket::create(&driver, DriverLog::default(), stream).unwrap();
        bracket.begin().unwrap();
        // SAFETY: `data` outlives the wait below.
        unsafe {
            driver
                .memcpy_htod_async(device, data.as_ptr(), 8, stream)
                .unwrap();
        }
        bracket.end().unwrap();
        bracket.wait_until_complete().unwrap();
        assert_eq!(mock.read_device(device, 8).unwrap(), data.to_vec());
        assert!(bracket.elapsed().unwrap() >= Duration::from_millis(9));
    }
}
