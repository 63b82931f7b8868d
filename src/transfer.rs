//! Transfer orchestration: staged host/device copies
//!
//! Three paths, by direction and by when the caller needs the result:
//!
//! | Path | Staging | Returns | Region recycled |
//! |------|---------|---------|-----------------|
//! | [`TransferOrchestrator::read_blocking`] | yes | after data is in the caller's buffer | immediately, after the wait |
//! | [`TransferOrchestrator::read_async`] | no | right after issuing | n/a |
//! | [`TransferOrchestrator::write`] | yes | right after issuing | by the device completion callback |
//!
//! A host-to-device region is never released by the issuing thread: the
//! device may still be reading it when `write` returns. Its release is a
//! continuation the runtime runs once the copy finished.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;

use crate::bracket::EventBracket;
use crate::driver::{DriverLog, SharedDriver};
use crate::error::{DriverStatus, StagingError, TransferError};
use crate::handle::{DevicePtr, StreamHandle};
use crate::pool::StagingPool;
use crate::region::StagingRegion;

/// Result of a transfer call
pub type TransferResult<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Default)]
pub(crate) struct TransferCounters {
    writes: AtomicU64,
    blocking_reads: AtomicU64,
    async_reads: AtomicU64,
    bytes_to_device: AtomicU64,
    bytes_to_host: AtomicU64,
    failures: AtomicU64,
}

impl TransferCounters {
    pub(crate) fn snapshot(&self) -> TransferStats {
        TransferStats {
            writes: self.writes.load(Ordering::Relaxed),
            blocking_reads: self.blocking_reads.load(Ordering::Relaxed),
            async_reads: self.async_reads.load(Ordering::Relaxed),
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            bytes_to_host: self.bytes_to_host.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-stream transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Host-to-device copies issued
    pub writes: u64,
    /// Blocking device-to-host copies completed
    pub blocking_reads: u64,
    /// Non-blocking device-to-host copies issued
    pub async_reads: u64,
    /// Bytes issued host-to-device
    pub bytes_to_device: u64,
    /// Bytes issued device-to-host
    pub bytes_to_host: u64,
    /// Transfers that returned an error
    pub failures: u64,
}

/// Region owned by a pending completion callback
///
/// Released when the callback runs. If the callback is dropped without
/// running (registration failed) the region is orphaned instead, since the
/// copy that reads it may already be queued.
struct InFlightRegion {
    pool: Arc<StagingPool>,
    region: Option<StagingRegion>,
}

impl InFlightRegion {
    fn complete(mut self, status: DriverStatus) {
        let Some(region) = self.region.take() else {
            return;
        };
        if !status.is_success() {
            tracing::warn!(region = %region.id(), %status, "copy completed with error status");
        }
        if let Err(err) = self.pool.release(region) {
            tracing::error!(error = %err, "completion callback could not release staging region");
        }
    }
}

impl Drop for InFlightRegion {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.pool.orphan(region);
        }
    }
}

/// Caller buffer filled by a non-blocking device-to-host copy
///
/// Holds the buffer until the copy finished. Dropping it without calling
/// [`PendingRead::wait`] blocks until the device is done with the buffer.
pub struct PendingRead {
    bracket: EventBracket,
    buffer: Option<Vec<u8>>,
}

impl PendingRead {
    /// Bracket around the copy
    #[must_use]
    pub fn bracket(&self) -> &EventBracket {
        &self.bracket
    }

    /// Non-blocking completion query
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Device` if the query fails.
    pub fn is_complete(&self) -> crate::Result<bool> {
        self.bracket.is_complete()
    }

    /// Wait for the copy and take the filled buffer
    ///
    /// # Errors
    ///
    /// Returns the wait failure. The buffer is leaked in that case, because
    /// the device may still write into it.
    pub fn wait(mut self) -> crate::Result<Vec<u8>> {
        let Some(buffer) = self.buffer.take() else {
            return Err(StagingError::LifecycleMisuse(
                "pending read already consumed".to_string(),
            ));
        };
        match self.bracket.wait_until_complete() {
            Ok(()) => Ok(buffer),
            Err(err) => {
                std::mem::forget(buffer);
                Err(err)
            }
        }
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        if let Err(err) = self.bracket.wait_until_complete() {
            tracing::error!(error = %err, "pending read dropped before completion; leaking its buffer");
            std::mem::forget(buffer);
        }
    }
}

impl fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRead")
            .field("bracket", &self.bracket)
            .field("bytes", &self.buffer.as_ref().map(Vec::len))
            .finish()
    }
}

/// Issues staged copies on one stream
///
/// Obtained from [`crate::Stream::transfers`].
pub struct TransferOrchestrator<'s> {
    driver: &'s SharedDriver,
    pool: &'s Arc<StagingPool>,
    counters: &'s TransferCounters,
    stream: StreamHandle,
    log: DriverLog,
}

impl<'s> TransferOrchestrator<'s> {
    pub(crate) fn new(
        driver: &'s SharedDriver,
        pool: &'s Arc<StagingPool>,
        counters: &'s TransferCounters,
        stream: StreamHandle,
        log: DriverLog,
    ) -> Self {
        Self {
            driver,
            pool,
            counters,
            stream,
            log,
        }
    }

    /// Device-to-host copy whose result is in `dst` on return
    ///
    /// Stages through a pinned region: the copy lands in the region, the call
    /// waits for the bracket's end marker, copies the region into `dst` and
    /// returns the region to the pool.
    ///
    /// # Errors
    ///
    /// Returns the first failing pool or driver call; the bracket recorded so
    /// far travels with the error.
    pub fn read_blocking(&self, src: DevicePtr, dst: &mut [u8]) -> TransferResult<EventBracket> {
        let bytes = dst.len();
        let mut region = self.pool.acquire(bytes).map_err(|e| self.fail(e.into()))?;
        let mut bracket = match EventBracket::create(self.driver, self.log, self.stream) {
            Ok(bracket) => bracket,
            Err(err) => return Err(self.abandon(region, err, None)),
        };
        if let Err(err) = bracket.begin() {
            return Err(self.abandon(region, err, Some(bracket)));
        }

        // SAFETY: this call owns the region until the copy is known complete.
        let issued = unsafe {
            self.driver
                .memcpy_dtoh_async(region.as_mut_ptr(), src, bytes, self.stream)
        };
        if let Err(err) = self.log.device("memcpy_dtoh_async", issued) {
            let _ = bracket.end();
            return Err(self.abandon(region, err, Some(bracket)));
        }
        if let Err(err) = bracket.end() {
            return Err(self.settle(region, err, bracket));
        }

        let done = match bracket.is_complete() {
            Ok(true) => Ok(()),
            Ok(false) => bracket.wait_until_complete(),
            Err(err) => Err(err),
        };
        if let Err(err) = done {
            return Err(self.settle(region, err, bracket));
        }

        region.copy_into(dst);
        if let Err(err) = self.pool.release(region) {
            return Err(self.fail(TransferError::with_bracket(err, bracket)));
        }
        self.counters.blocking_reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_to_host
            .fetch_add(bytes as u64, Ordering::Relaxed);
        tracing::trace!(stream = %self.stream, %src, bytes, "blocking d2h complete");
        Ok(bracket)
    }

    /// Device-to-host copy straight into `dst`, without waiting
    ///
    /// No staging region is involved. Completion of the returned bracket
    /// means `dst` holds the data.
    ///
    /// # Safety
    ///
    /// `dst` must stay allocated and must not be read or written by anyone
    /// until the returned bracket completed (or the stream was synchronized),
    /// even though the borrow ends when this call returns.
    ///
    /// # Errors
    ///
    /// Returns the failing driver call with the bracket recorded so far.
    pub unsafe fn read_async(&self, src: DevicePtr, dst: &mut [u8]) -> TransferResult<EventBracket> {
        let bytes = dst.len();
        let mut bracket = EventBracket::create(self.driver, self.log, self.stream)
            .map_err(|e| self.fail(e.into()))?;
        if let Err(err) = bracket.begin() {
            return Err(self.fail(TransferError::with_bracket(err, bracket)));
        }
        // SAFETY: forwarded to the caller.
        let issued = unsafe {
            self.driver
                .memcpy_dtoh_async(dst.as_mut_ptr(), src, bytes, self.stream)
        };
        if let Err(err) = self.log.device("memcpy_dtoh_async", issued) {
            let _ = bracket.end();
            return Err(self.fail(TransferError::with_bracket(err, bracket)));
        }
        if let Err(err) = bracket.end() {
            return Err(self.fail(TransferError::with_bracket(err, bracket)));
        }
        self.counters.async_reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_to_host
            .fetch_add(bytes as u64, Ordering::Relaxed);
        tracing::trace!(stream = %self.stream, %src, bytes, "async d2h issued");
        Ok(bracket)
    }

    /// Non-blocking device-to-host copy into an owned buffer
    ///
    /// Safe counterpart of [`Self::read_async`]: the buffer is held by the
    /// returned [`PendingRead`] until the copy finished.
    ///
    /// # Errors
    ///
    /// Returns the failing driver call with the bracket recorded so far.
    pub fn read_async_owned(&self, src: DevicePtr, mut buffer: Vec<u8>) -> TransferResult<PendingRead> {
        // SAFETY: the PendingRead keeps the heap buffer alive and untouched
        // until the bracket completes; moving the Vec does not move its heap
        // allocation.
        let issued = unsafe { self.read_async(src, buffer.as_mut_slice()) };
        match issued {
            Ok(bracket) => Ok(PendingRead {
                bracket,
                buffer: Some(buffer),
            }),
            Err(err) => {
                // The copy may be queued without an end marker; drain the
                // stream before giving the buffer up.
                if err.bracket.is_some() && self.synchronize().is_err() {
                    std::mem::forget(buffer);
                }
                Err(err)
            }
        }
    }

    /// Host-to-device copy through a pinned region
    ///
    /// Copies `src` into a region, issues the device copy from it and
    /// registers a completion callback that returns the region to the pool.
    /// Returns without waiting for the device.
    ///
    /// # Errors
    ///
    /// Returns the first failing pool or driver call; the bracket recorded so
    /// far travels with the error. A region whose copy was queued but whose
    /// callback could not be registered is kept out of the pool until
    /// teardown.
    pub fn write(&self, dst: DevicePtr, src: &[u8]) -> TransferResult<EventBracket> {
        let bytes = src.len();
        let mut region = self.pool.acquire(bytes).map_err(|e| self.fail(e.into()))?;
        region.fill_from(src);
        let mut bracket = match EventBracket::create(self.driver, self.log, self.stream) {
            Ok(bracket) => bracket,
            Err(err) => return Err(self.abandon(region, err, None)),
        };
        if let Err(err) = bracket.begin() {
            return Err(self.abandon(region, err, Some(bracket)));
        }

        // SAFETY: the region moves into the completion callback below and is
        // not touched again until the device finished reading it.
        let issued = unsafe {
            self.driver
                .memcpy_htod_async(dst, region.as_ptr(), bytes, self.stream)
        };
        if let Err(err) = self.log.device("memcpy_htod_async", issued) {
            let _ = bracket.end();
            return Err(self.abandon(region, err, Some(bracket)));
        }
        let ended = bracket.end();

        let lease = InFlightRegion {
            pool: Arc::clone(self.pool),
            region: Some(region),
        };
        let registered = self.log.device(
            "add_callback",
            self.driver
                .add_callback(self.stream, Box::new(move |status| lease.complete(status))),
        );

        match ended.and(registered) {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_to_device
                    .fetch_add(bytes as u64, Ordering::Relaxed);
                tracing::trace!(stream = %self.stream, %dst, bytes, "h2d issued");
                Ok(bracket)
            }
            Err(err) => Err(self.fail(TransferError::with_bracket(err, bracket))),
        }
    }

    /// Typed host-to-device copy
    ///
    /// # Errors
    ///
    /// Same as [`Self::write`].
    pub fn write_typed<T: Pod>(&self, dst: DevicePtr, src: &[T]) -> TransferResult<EventBracket> {
        self.write(dst, bytemuck::cast_slice(src))
    }

    /// Typed blocking device-to-host copy
    ///
    /// # Errors
    ///
    /// Same as [`Self::read_blocking`].
    pub fn read_typed_blocking<T: Pod>(
        &self,
        src: DevicePtr,
        dst: &mut [T],
    ) -> TransferResult<EventBracket> {
        self.read_blocking(src, bytemuck::cast_slice_mut(dst))
    }

    /// Bracket with no operation between its markers
    ///
    /// # Errors
    ///
    /// Returns the failing event call.
    pub fn marker(&self) -> crate::Result<EventBracket> {
        EventBracket::marker(self.driver, self.log, self.stream)
    }

    fn synchronize(&self) -> crate::Result<()> {
        self.log.device(
            "synchronize_stream",
            self.driver.synchronize_stream(self.stream),
        )
    }

    fn fail(&self, err: TransferError) -> TransferError {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        err
    }

    /// Nothing was queued against `region`; it can go straight back.
    fn abandon(
        &self,
        region: StagingRegion,
        err: StagingError,
        bracket: Option<EventBracket>,
    ) -> TransferError {
        if let Err(release) = self.pool.release(region) {
            tracing::error!(error = %release, "could not return unused staging region");
        }
        self.fail(TransferError { error: err, bracket })
    }

    /// A copy against `region` is queued but its completion is unknown.
    fn settle(&self, region: StagingRegion, err: StagingError, bracket: EventBracket) -> TransferError {
        match self.synchronize() {
            Ok(()) => {
                if let Err(release) = self.pool.release(region) {
                    tracing::error!(error = %release, "could not return settled staging region");
                }
            }
            Err(_) => self.pool.orphan(region),
        }
        self.fail(TransferError::with_bracket(err, bracket))
    }
}

impl fmt::Debug for TransferOrchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("stream", &self.stream)
            .field("driver", &self.driver.name())
            .finish_non_exhaustive()
    }
}
