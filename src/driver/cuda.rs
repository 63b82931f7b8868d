//! CUDA driver API backend (feature `cuda`)
//!
//! Thin mapping of [`DeviceDriver`] onto `cudarc::driver::sys`. Every call
//! binds the context to the calling thread first, since streams, events and
//! pinned allocations all belong to it. Raw `CUstream`/`CUevent` pointers
//! travel as opaque 64-bit handles.

use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use cudarc::driver::sys::{self, CUresult};
use cudarc::driver::{CudaContext, DriverError};

use super::{DeviceDriver, DriverResult, HostCallback};
use crate::error::DriverStatus;
use crate::handle::{DevicePtr, EventHandle, PriorityRange, StreamHandle};

fn check(result: CUresult) -> DriverResult<()> {
    if result == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DriverStatus(result as i32))
    }
}

fn status(err: &DriverError) -> DriverStatus {
    DriverStatus(err.0 as i32)
}

fn raw_stream(stream: StreamHandle) -> sys::CUstream {
    stream.as_raw() as usize as sys::CUstream
}

fn raw_event(event: EventHandle) -> sys::CUevent {
    event.as_raw() as usize as sys::CUevent
}

/// Host callback trampoline: reclaims the boxed closure and runs it
unsafe extern "C" fn run_host_callback(_stream: sys::CUstream, result: CUresult, user_data: *mut c_void) {
    // SAFETY: `user_data` is the Box::into_raw of add_callback, handed to the
    // runtime exactly once.
    let callback = unsafe { Box::from_raw(user_data.cast::<HostCallback>()) };
    callback(DriverStatus(result as i32));
}

/// CUDA device driver bound to one device's primary context
pub struct CudaDriver {
    context: Arc<CudaContext>,
}

impl CudaDriver {
    /// Open device `ordinal`
    ///
    /// # Errors
    ///
    /// Returns the driver status if CUDA initialization or context creation
    /// fails.
    pub fn new(ordinal: usize) -> DriverResult<Self> {
        let context = CudaContext::new(ordinal).map_err(|e| status(&e))?;
        Ok(Self { context })
    }

    /// Wrap an existing context
    #[must_use]
    pub fn from_context(context: Arc<CudaContext>) -> Self {
        Self { context }
    }

    /// Underlying context
    #[must_use]
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    fn bind(&self) -> DriverResult<()> {
        self.context.bind_to_thread().map_err(|e| status(&e))
    }
}

impl DeviceDriver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn alloc_pinned(&self, bytes: usize) -> DriverResult<NonNull<u8>> {
        self.bind()?;
        let mut host: *mut c_void = ptr::null_mut();
        // SAFETY: out-pointer is a valid local.
        check(unsafe { sys::cuMemAllocHost_v2(&mut host, bytes) })?;
        NonNull::new(host.cast::<u8>()).ok_or(DriverStatus::OUT_OF_MEMORY)
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> DriverResult<()> {
        self.bind()?;
        // SAFETY: the caller guarantees `ptr` came from cuMemAllocHost and is
        // no longer in use.
        check(unsafe { sys::cuMemFreeHost(ptr.as_ptr().cast::<c_void>()) })
    }

    fn stream_priority_range(&self) -> DriverResult<PriorityRange> {
        self.bind()?;
        let (mut least, mut greatest) = (0i32, 0i32);
        // SAFETY: out-pointers are valid locals.
        check(unsafe { sys::cuCtxGetStreamPriorityRange(&mut least, &mut greatest) })?;
        Ok(PriorityRange { least, greatest })
    }

    fn create_stream(&self, priority: i32) -> DriverResult<StreamHandle> {
        self.bind()?;
        let mut stream: sys::CUstream = ptr::null_mut();
        let flags = sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32;
        // SAFETY: out-pointer is a valid local.
        check(unsafe { sys::cuStreamCreateWithPriority(&mut stream, flags, priority) })?;
        Ok(StreamHandle::from_raw(stream as usize as u64))
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        self.bind()?;
        // SAFETY: handle was produced by create_stream.
        check(unsafe { sys::cuStreamSynchronize(raw_stream(stream)) })
    }

    fn destroy_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        self.bind()?;
        // SAFETY: handle was produced by create_stream.
        check(unsafe { sys::cuStreamDestroy_v2(raw_stream(stream)) })
    }

    fn create_event(&self) -> DriverResult<EventHandle> {
        self.bind()?;
        let mut event: sys::CUevent = ptr::null_mut();
        let flags = sys::CUevent_flags::CU_EVENT_DEFAULT as u32;
        // SAFETY: out-pointer is a valid local.
        check(unsafe { sys::cuEventCreate(&mut event, flags) })?;
        Ok(EventHandle::from_raw(event as usize as u64))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DriverResult<()> {
        self.bind()?;
        // SAFETY: handles were produced by this driver.
        check(unsafe { sys::cuEventRecord(raw_event(event), raw_stream(stream)) })
    }

    fn query_event(&self, event: EventHandle) -> DriverResult<bool> {
        self.bind()?;
        // SAFETY: handle was produced by create_event.
        match unsafe { sys::cuEventQuery(raw_event(event)) } {
            CUresult::CUDA_SUCCESS => Ok(true),
            CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            other => Err(DriverStatus(other as i32)),
        }
    }

    fn synchronize_event(&self, event: EventHandle) -> DriverResult<()> {
        self.bind()?;
        // SAFETY: handle was produced by create_event.
        check(unsafe { sys::cuEventSynchronize(raw_event(event)) })
    }

    fn elapsed_ms(&self, start: EventHandle, end: EventHandle) -> DriverResult<f32> {
        self.bind()?;
        let mut ms = 0f32;
        // SAFETY: out-pointer is a valid local; handles came from create_event.
        check(unsafe { sys::cuEventElapsedTime(&mut ms, raw_event(start), raw_event(end)) })?;
        Ok(ms)
    }

    fn destroy_event(&self, event: EventHandle) -> DriverResult<()> {
        self.bind()?;
        // SAFETY: handle was produced by create_event.
        check(unsafe { sys::cuEventDestroy_v2(raw_event(event)) })
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        self.bind()?;
        // SAFETY: the caller keeps `src` valid until the copy completed.
        check(unsafe {
            sys::cuMemcpyHtoDAsync_v2(dst.0, src.cast::<c_void>(), bytes, raw_stream(stream))
        })
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        self.bind()?;
        // SAFETY: the caller keeps `dst` valid and untouched until the copy
        // completed.
        check(unsafe {
            sys::cuMemcpyDtoHAsync_v2(dst.cast::<c_void>(), src.0, bytes, raw_stream(stream))
        })
    }

    fn add_callback(&self, stream: StreamHandle, callback: HostCallback) -> DriverResult<()> {
        self.bind()?;
        let user_data = Box::into_raw(Box::new(callback));
        // SAFETY: the trampoline reclaims `user_data` exactly once when the
        // runtime invokes it.
        let result = unsafe {
            sys::cuStreamAddCallback(
                raw_stream(stream),
                Some(run_host_callback),
                user_data.cast::<c_void>(),
                0,
            )
        };
        if let Err(status) = check(result) {
            // SAFETY: registration failed, so the runtime never took ownership.
            drop(unsafe { Box::from_raw(user_data) });
            return Err(status);
        }
        Ok(())
    }
}

impl std::fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDriver").finish_non_exhaustive()
    }
}
