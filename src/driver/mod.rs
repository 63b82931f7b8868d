//! DeviceDriver trait for abstracting the device runtime
//!
//! Everything the staging core needs from the runtime goes through this
//! trait: pinned host memory, streams, events, async copies and host
//! callbacks. Two implementations ship with the crate:
//!
//! - [`MockDriver`]: software device with one worker thread per stream.
//!   Always available; drives the tests and benches.
//! - `CudaDriver` (feature `cuda`): the CUDA driver API via `cudarc`.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{DriverStatus, Result, StagingError};
use crate::handle::{DevicePtr, EventHandle, PriorityRange, StreamHandle};

#[cfg(feature = "cuda")]
mod cuda;
mod mock;

#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;
pub use mock::{FaultPoint, MockDriver, MockDriverConfig, MockDriverStats};

/// Result type for raw driver calls
pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

/// Continuation run by the runtime once preceding work on a stream finished
///
/// Runs on a runtime-owned thread, never on the thread that registered it.
pub type HostCallback = Box<dyn FnOnce(DriverStatus) + Send + 'static>;

/// Driver shared between a stream, its pool and in-flight callbacks
pub type SharedDriver = Arc<dyn DeviceDriver>;

/// Abstraction over device runtimes (CUDA, software mock)
pub trait DeviceDriver: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    // =========================================================================
    // Pinned host memory
    // =========================================================================

    /// Allocate `bytes` of page-locked host memory
    ///
    /// # Errors
    ///
    /// Returns the driver status if the allocation fails.
    fn alloc_pinned(&self, bytes: usize) -> DriverResult<NonNull<u8>>;

    /// Free memory obtained from [`Self::alloc_pinned`]
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_pinned` on this driver, must not have been
    /// freed already, and no pending device operation may still use it.
    ///
    /// # Errors
    ///
    /// Returns the driver status if the free fails.
    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> DriverResult<()>;

    // =========================================================================
    // Streams
    // =========================================================================

    /// Priority bounds supported by the device
    ///
    /// # Errors
    ///
    /// Returns the driver status if the query fails.
    fn stream_priority_range(&self) -> DriverResult<PriorityRange>;

    /// Create a non-blocking stream at the given priority
    ///
    /// # Errors
    ///
    /// Returns the driver status if creation fails.
    fn create_stream(&self, priority: i32) -> DriverResult<StreamHandle>;

    /// Block until all work issued on `stream` (callbacks included) completed
    ///
    /// # Errors
    ///
    /// Returns the driver status if the stream is invalid or faulted.
    fn synchronize_stream(&self, stream: StreamHandle) -> DriverResult<()>;

    /// Destroy a stream
    ///
    /// # Errors
    ///
    /// Returns the driver status if the handle is invalid.
    fn destroy_stream(&self, stream: StreamHandle) -> DriverResult<()>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Create an event with timing enabled
    ///
    /// # Errors
    ///
    /// Returns the driver status if creation fails.
    fn create_event(&self) -> DriverResult<EventHandle>;

    /// Position `event` after all work currently issued on `stream`
    ///
    /// # Errors
    ///
    /// Returns the driver status if either handle is invalid.
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DriverResult<()>;

    /// Non-blocking completion query (`Ok(false)` while pending)
    ///
    /// # Errors
    ///
    /// Returns the driver status if the handle is invalid.
    fn query_event(&self, event: EventHandle) -> DriverResult<bool>;

    /// Block until `event` completed
    ///
    /// # Errors
    ///
    /// Returns the driver status if the handle is invalid.
    fn synchronize_event(&self, event: EventHandle) -> DriverResult<()>;

    /// Milliseconds between two completed events
    ///
    /// # Errors
    ///
    /// Returns `NOT_READY` if either event is still pending.
    fn elapsed_ms(&self, start: EventHandle, end: EventHandle) -> DriverResult<f32>;

    /// Destroy an event
    ///
    /// # Errors
    ///
    /// Returns the driver status if the handle is invalid.
    fn destroy_event(&self, event: EventHandle) -> DriverResult<()>;

    // =========================================================================
    // Copies and callbacks
    // =========================================================================

    /// Enqueue a host-to-device copy of `bytes` from `src`
    ///
    /// # Safety
    ///
    /// `src` must stay valid and unmodified for `bytes` until the copy
    /// completed on the device.
    ///
    /// # Errors
    ///
    /// Returns the driver status if the copy could not be enqueued.
    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> DriverResult<()>;

    /// Enqueue a device-to-host copy of `bytes` into `dst`
    ///
    /// # Safety
    ///
    /// `dst` must stay valid, writable and otherwise untouched for `bytes`
    /// until the copy completed on the device.
    ///
    /// # Errors
    ///
    /// Returns the driver status if the copy could not be enqueued.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DriverResult<()>;

    /// Run `callback` once all work issued on `stream` so far completed
    ///
    /// If registration fails the callback is dropped without running.
    ///
    /// # Errors
    ///
    /// Returns the driver status if the callback could not be registered.
    fn add_callback(&self, stream: StreamHandle, callback: HostCallback) -> DriverResult<()>;
}

/// Status checker every driver call goes through
///
/// Failures are always logged; successes only when per-call logging is on.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DriverLog {
    verbose: bool,
}

impl DriverLog {
    pub(crate) fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn trace<T>(self, call: &'static str, result: &DriverResult<T>) {
        match result {
            Ok(_) if self.verbose => {
                tracing::trace!(target: "pinstage::driver", call, status = %DriverStatus::SUCCESS);
            }
            Ok(_) => {}
            Err(status) => {
                tracing::warn!(target: "pinstage::driver", call, status = %status, "driver call failed");
            }
        }
    }

    /// Map a copy/stream/event call result
    pub(crate) fn device<T>(self, call: &'static str, result: DriverResult<T>) -> Result<T> {
        self.trace(call, &result);
        result.map_err(|status| StagingError::Device { call, status })
    }

    /// Map a pinned allocation call result
    pub(crate) fn allocation<T>(self, call: &'static str, result: DriverResult<T>) -> Result<T> {
        self.trace(call, &result);
        result.map_err(|status| StagingError::Allocation { call, status })
    }
}
