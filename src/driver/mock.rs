//! Software device driver
//!
//! Simulates a device well enough to exercise the staging core without GPU
//! hardware:
//!
//! - device memory is a set of host-side blocks addressed by fake device
//!   pointers
//! - each stream owns a worker thread that executes copies, event records and
//!   callbacks strictly in issue order, so completion really is asynchronous
//!   to the issuing thread
//! - pinned allocations are tracked so tests can check that every buffer is
//!   freed exactly once
//! - faults can be injected at individual driver calls

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{DeviceDriver, DriverResult, HostCallback};
use crate::error::DriverStatus;
use crate::handle::{DevicePtr, EventHandle, PriorityRange, StreamHandle};

/// Alignment of simulated pinned buffers (cache line)
const PINNED_ALIGN: usize = 64;
/// First simulated device address
const DEVICE_BASE: u64 = 0x7f00_0000_0000;
/// Alignment of simulated device allocations
const DEVICE_ALIGN: u64 = 256;

/// Configuration for [`MockDriver`]
#[derive(Debug, Clone)]
pub struct MockDriverConfig {
    /// Time each copy takes on the simulated device
    pub copy_latency: Duration,
    /// Numerically largest (lowest) stream priority
    pub priority_least: i32,
    /// Numerically smallest (highest) stream priority
    pub priority_greatest: i32,
    /// Cap on live pinned bytes (`None` = unbounded)
    pub max_pinned_bytes: Option<usize>,
}

impl Default for MockDriverConfig {
    fn default() -> Self {
        Self {
            copy_latency: Duration::ZERO,
            priority_least: 0,
            priority_greatest: -5,
            max_pinned_bytes: None,
        }
    }
}

/// Driver call at which a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `alloc_pinned`
    AllocPinned,
    /// `free_pinned`
    FreePinned,
    /// `create_stream`
    CreateStream,
    /// `synchronize_stream`
    SynchronizeStream,
    /// `destroy_stream`
    DestroyStream,
    /// `create_event`
    CreateEvent,
    /// `record_event`
    RecordEvent,
    /// `synchronize_event`
    SynchronizeEvent,
    /// `memcpy_htod_async`
    MemcpyHtoD,
    /// `memcpy_dtoh_async`
    MemcpyDtoH,
    /// `add_callback`
    AddCallback,
}

impl FaultPoint {
    fn status(self) -> DriverStatus {
        match self {
            Self::AllocPinned => DriverStatus::OUT_OF_MEMORY,
            Self::FreePinned | Self::MemcpyHtoD | Self::MemcpyDtoH => DriverStatus::INVALID_VALUE,
            _ => DriverStatus::UNKNOWN,
        }
    }
}

/// Counters exposed by [`MockDriver::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockDriverStats {
    /// Successful pinned allocations
    pub pinned_allocs: usize,
    /// Successful pinned frees
    pub pinned_frees: usize,
    /// Frees of pointers that were not live (double free or foreign pointer)
    pub invalid_frees: usize,
    /// Pinned buffers currently allocated
    pub live_pinned: usize,
    /// Pinned bytes currently allocated
    pub live_pinned_bytes: usize,
    /// Host-to-device copies executed
    pub htod_copies: usize,
    /// Device-to-host copies executed
    pub dtoh_copies: usize,
    /// Host callbacks executed
    pub callbacks_run: usize,
    /// Streams currently alive
    pub live_streams: usize,
    /// Events currently alive
    pub live_events: usize,
}

struct SendPtr(*mut u8);

// SAFETY: the pointer is only dereferenced by the stream worker under the
// validity contract of memcpy_htod_async/memcpy_dtoh_async.
unsafe impl Send for SendPtr {}

enum Command {
    HtoD {
        dst: DevicePtr,
        src: SendPtr,
        bytes: usize,
    },
    DtoH {
        dst: SendPtr,
        src: DevicePtr,
        bytes: usize,
    },
    Record {
        slot: Arc<EventSlot>,
        generation: u64,
    },
    Callback(HostCallback),
}

#[derive(Default)]
struct EventState {
    /// Bumped on every record; 0 means never recorded
    generation: u64,
    completed_generation: u64,
    completed_at: Option<Instant>,
}

impl EventState {
    fn is_complete(&self) -> bool {
        self.completed_generation == self.generation
    }
}

#[derive(Default)]
struct EventSlot {
    state: Mutex<EventState>,
    done: Condvar,
}

#[derive(Default)]
struct StreamProgress {
    pending: Mutex<usize>,
    idle: Condvar,
}

struct StreamWorker {
    sender: mpsc::Sender<Command>,
    thread: JoinHandle<()>,
    progress: Arc<StreamProgress>,
}

struct DeviceMemory {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl DeviceMemory {
    fn resolve(&mut self, ptr: DevicePtr, bytes: usize) -> Option<&mut [u8]> {
        let (&base, block) = self.blocks.range_mut(..=ptr.0).next_back()?;
        let offset = usize::try_from(ptr.0 - base).ok()?;
        let end = offset.checked_add(bytes)?;
        block.get_mut(offset..end)
    }
}

#[derive(Default)]
struct Counters {
    pinned_allocs: AtomicUsize,
    pinned_frees: AtomicUsize,
    invalid_frees: AtomicUsize,
    htod_copies: AtomicUsize,
    dtoh_copies: AtomicUsize,
    callbacks_run: AtomicUsize,
}

struct Shared {
    config: MockDriverConfig,
    device: Mutex<DeviceMemory>,
    pinned: Mutex<HashMap<usize, Layout>>,
    events: Mutex<HashMap<u64, Arc<EventSlot>>>,
    streams: Mutex<HashMap<u64, StreamWorker>>,
    faults: Mutex<HashMap<FaultPoint, usize>>,
    next_handle: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn execute(&self, command: Command) {
        match command {
            Command::HtoD { dst, src, bytes } => {
                self.simulate_latency();
                let mut device = self.device.lock();
                if let Some(target) = device.resolve(dst, bytes) {
                    // SAFETY: the issuer guarantees `src` is valid for `bytes`
                    // until this command completes.
                    unsafe { std::ptr::copy_nonoverlapping(src.0, target.as_mut_ptr(), bytes) };
                }
                self.counters.htod_copies.fetch_add(1, Ordering::Relaxed);
            }
            Command::DtoH { dst, src, bytes } => {
                self.simulate_latency();
                let mut device = self.device.lock();
                if let Some(source) = device.resolve(src, bytes) {
                    // SAFETY: the issuer guarantees `dst` is valid and
                    // untouched for `bytes` until this command completes.
                    unsafe { std::ptr::copy_nonoverlapping(source.as_ptr(), dst.0, bytes) };
                }
                self.counters.dtoh_copies.fetch_add(1, Ordering::Relaxed);
            }
            Command::Record { slot, generation } => {
                let mut state = slot.state.lock();
                if state.generation == generation {
                    state.completed_generation = generation;
                    state.completed_at = Some(Instant::now());
                }
                slot.done.notify_all();
            }
            Command::Callback(callback) => {
                callback(DriverStatus::SUCCESS);
                self.counters.callbacks_run.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn simulate_latency(&self) {
        if !self.config.copy_latency.is_zero() {
            thread::sleep(self.config.copy_latency);
        }
    }

    fn fault(&self, point: FaultPoint) -> DriverResult<()> {
        let mut faults = self.faults.lock();
        match faults.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(point.status())
            }
            _ => Ok(()),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, stream: StreamHandle, command: Command) -> DriverResult<()> {
        let streams = self.streams.lock();
        let worker = streams
            .get(&stream.as_raw())
            .ok_or(DriverStatus::INVALID_HANDLE)?;
        *worker.progress.pending.lock() += 1;
        if worker.sender.send(command).is_err() {
            let mut pending = worker.progress.pending.lock();
            *pending -= 1;
            worker.progress.idle.notify_all();
            return Err(DriverStatus::INVALID_HANDLE);
        }
        Ok(())
    }

    fn event(&self, event: EventHandle) -> DriverResult<Arc<EventSlot>> {
        self.events
            .lock()
            .get(&event.as_raw())
            .cloned()
            .ok_or(DriverStatus::INVALID_HANDLE)
    }

    fn check_device_range(&self, ptr: DevicePtr, bytes: usize) -> DriverResult<()> {
        if self.device.lock().resolve(ptr, bytes).is_some() {
            Ok(())
        } else {
            Err(DriverStatus::INVALID_VALUE)
        }
    }
}

/// Software device driver with asynchronous, in-order streams
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use pinstage::{MockDriver, SharedDriver};
///
/// let mock = Arc::new(MockDriver::new());
/// let device = mock.alloc_device(1024);
/// mock.write_device(device, &[7u8; 1024]).unwrap();
/// assert_eq!(mock.read_device(device, 4).unwrap(), vec![7, 7, 7, 7]);
/// let _driver: SharedDriver = mock;
/// ```
pub struct MockDriver {
    shared: Arc<Shared>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a driver with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockDriverConfig::default())
    }

    /// Create a driver with custom configuration
    #[must_use]
    pub fn with_config(config: MockDriverConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                device: Mutex::new(DeviceMemory {
                    blocks: BTreeMap::new(),
                    next: DEVICE_BASE,
                }),
                pinned: Mutex::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Allocate zeroed simulated device memory
    pub fn alloc_device(&self, bytes: usize) -> DevicePtr {
        let mut device = self.shared.device.lock();
        let base = device.next;
        let span = (bytes.max(1) as u64).div_ceil(DEVICE_ALIGN) * DEVICE_ALIGN;
        device.next += span;
        device.blocks.insert(base, vec![0u8; bytes]);
        DevicePtr(base)
    }

    /// Free simulated device memory
    ///
    /// # Errors
    ///
    /// Returns `INVALID_VALUE` if `ptr` is not the base of an allocation.
    pub fn free_device(&self, ptr: DevicePtr) -> DriverResult<()> {
        self.shared
            .device
            .lock()
            .blocks
            .remove(&ptr.0)
            .map(|_| ())
            .ok_or(DriverStatus::INVALID_VALUE)
    }

    /// Write device memory directly from the host, bypassing streams
    ///
    /// # Errors
    ///
    /// Returns `INVALID_VALUE` if the range is not inside one allocation.
    pub fn write_device(&self, ptr: DevicePtr, data: &[u8]) -> DriverResult<()> {
        let mut device = self.shared.device.lock();
        let target = device
            .resolve(ptr, data.len())
            .ok_or(DriverStatus::INVALID_VALUE)?;
        target.copy_from_slice(data);
        Ok(())
    }

    /// Read device memory directly from the host, bypassing streams
    ///
    /// # Errors
    ///
    /// Returns `INVALID_VALUE` if the range is not inside one allocation.
    pub fn read_device(&self, ptr: DevicePtr, bytes: usize) -> DriverResult<Vec<u8>> {
        let mut device = self.shared.device.lock();
        device
            .resolve(ptr, bytes)
            .map(|source| source.to_vec())
            .ok_or(DriverStatus::INVALID_VALUE)
    }

    /// Make the next `times` calls at `point` fail
    pub fn inject_fault(&self, point: FaultPoint, times: usize) {
        *self.shared.faults.lock().entry(point).or_insert(0) += times;
    }

    /// Remove all pending injected faults
    pub fn clear_faults(&self) {
        self.shared.faults.lock().clear();
    }

    /// Snapshot of driver counters
    #[must_use]
    pub fn stats(&self) -> MockDriverStats {
        let counters = &self.shared.counters;
        let pinned = self.shared.pinned.lock();
        MockDriverStats {
            pinned_allocs: counters.pinned_allocs.load(Ordering::Relaxed),
            pinned_frees: counters.pinned_frees.load(Ordering::Relaxed),
            invalid_frees: counters.invalid_frees.load(Ordering::Relaxed),
            live_pinned: pinned.len(),
            live_pinned_bytes: pinned.values().map(Layout::size).sum(),
            htod_copies: counters.htod_copies.load(Ordering::Relaxed),
            dtoh_copies: counters.dtoh_copies.load(Ordering::Relaxed),
            callbacks_run: counters.callbacks_run.load(Ordering::Relaxed),
            live_streams: self.shared.streams.lock().len(),
            live_events: self.shared.events.lock().len(),
        }
    }

    fn shutdown_stream(worker: StreamWorker) {
        drop(worker.sender);
        // A callback dropping the last driver reference runs on the worker itself.
        if worker.thread.thread().id() == thread::current().id() {
            return;
        }
        if worker.thread.join().is_err() {
            tracing::error!(target: "pinstage::mock", "stream worker panicked");
        }
    }
}

impl DeviceDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn alloc_pinned(&self, bytes: usize) -> DriverResult<NonNull<u8>> {
        self.shared.fault(FaultPoint::AllocPinned)?;
        if bytes == 0 {
            return Err(DriverStatus::INVALID_VALUE);
        }
        let mut pinned = self.shared.pinned.lock();
        if let Some(max) = self.shared.config.max_pinned_bytes {
            let live: usize = pinned.values().map(Layout::size).sum();
            if live + bytes > max {
                return Err(DriverStatus::OUT_OF_MEMORY);
            }
        }
        let layout =
            Layout::from_size_align(bytes, PINNED_ALIGN).map_err(|_| DriverStatus::INVALID_VALUE)?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(DriverStatus::OUT_OF_MEMORY)?;
        pinned.insert(ptr.as_ptr() as usize, layout);
        self.shared
            .counters
            .pinned_allocs
            .fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> DriverResult<()> {
        self.shared.fault(FaultPoint::FreePinned)?;
        let layout = self.shared.pinned.lock().remove(&(ptr.as_ptr() as usize));
        match layout {
            Some(layout) => {
                // SAFETY: ptr was allocated with this layout and was live.
                unsafe { dealloc(ptr.as_ptr(), layout) };
                self.shared
                    .counters
                    .pinned_frees
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => {
                self.shared
                    .counters
                    .invalid_frees
                    .fetch_add(1, Ordering::Relaxed);
                Err(DriverStatus::INVALID_VALUE)
            }
        }
    }

    fn stream_priority_range(&self) -> DriverResult<PriorityRange> {
        Ok(PriorityRange {
            least: self.shared.config.priority_least,
            greatest: self.shared.config.priority_greatest,
        })
    }

    fn create_stream(&self, priority: i32) -> DriverResult<StreamHandle> {
        self.shared.fault(FaultPoint::CreateStream)?;
        let raw = self.shared.next_handle();
        let (sender, receiver) = mpsc::channel::<Command>();
        let progress = Arc::new(StreamProgress::default());
        let worker_progress = Arc::clone(&progress);
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("mock-stream-{raw}-p{priority}"))
            .spawn(move || {
                for command in receiver {
                    shared.execute(command);
                    let mut pending = worker_progress.pending.lock();
                    *pending -= 1;
                    if *pending == 0 {
                        worker_progress.idle.notify_all();
                    }
                }
            })
            .map_err(|_| DriverStatus::OUT_OF_MEMORY)?;
        self.shared.streams.lock().insert(
            raw,
            StreamWorker {
                sender,
                thread,
                progress,
            },
        );
        Ok(StreamHandle::from_raw(raw))
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        self.shared.fault(FaultPoint::SynchronizeStream)?;
        let progress = self
            .shared
            .streams
            .lock()
            .get(&stream.as_raw())
            .map(|worker| Arc::clone(&worker.progress))
            .ok_or(DriverStatus::INVALID_HANDLE)?;
        let mut pending = progress.pending.lock();
        while *pending > 0 {
            progress.idle.wait(&mut pending);
        }
        Ok(())
    }

    fn destroy_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        self.shared.fault(FaultPoint::DestroyStream)?;
        let worker = self
            .shared
            .streams
            .lock()
            .remove(&stream.as_raw())
            .ok_or(DriverStatus::INVALID_HANDLE)?;
        Self::shutdown_stream(worker);
        Ok(())
    }

    fn create_event(&self) -> DriverResult<EventHandle> {
        self.shared.fault(FaultPoint::CreateEvent)?;
        let raw = self.shared.next_handle();
        self.shared
            .events
            .lock()
            .insert(raw, Arc::new(EventSlot::default()));
        Ok(EventHandle::from_raw(raw))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DriverResult<()> {
        self.shared.fault(FaultPoint::RecordEvent)?;
        let slot = self.shared.event(event)?;
        let generation = {
            let mut state = slot.state.lock();
            state.generation += 1;
            state.completed_at = None;
            state.generation
        };
        let result = self.shared.enqueue(
            stream,
            Command::Record {
                slot: Arc::clone(&slot),
                generation,
            },
        );
        if result.is_err() {
            // Nothing was queued; treat the event as never recorded again.
            let mut state = slot.state.lock();
            state.generation -= 1;
        }
        result
    }

    fn query_event(&self, event: EventHandle) -> DriverResult<bool> {
        let slot = self.shared.event(event)?;
        let complete = slot.state.lock().is_complete();
        Ok(complete)
    }

    fn synchronize_event(&self, event: EventHandle) -> DriverResult<()> {
        self.shared.fault(FaultPoint::SynchronizeEvent)?;
        let slot = self.shared.event(event)?;
        let mut state = slot.state.lock();
        while !state.is_complete() {
            slot.done.wait(&mut state);
        }
        Ok(())
    }

    fn elapsed_ms(&self, start: EventHandle, end: EventHandle) -> DriverResult<f32> {
        let start = self.shared.event(start)?;
        let end = self.shared.event(end)?;
        let started = start.state.lock().completed_at;
        let ended = end.state.lock().completed_at;
        match (started, ended) {
            (Some(started), Some(ended)) => {
                Ok(ended.saturating_duration_since(started).as_secs_f32() * 1_000.0)
            }
            _ => Err(DriverStatus::NOT_READY),
        }
    }

    fn destroy_event(&self, event: EventHandle) -> DriverResult<()> {
        self.shared
            .events
            .lock()
            .remove(&event.as_raw())
            .map(|_| ())
            .ok_or(DriverStatus::INVALID_HANDLE)
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        self.shared.fault(FaultPoint::MemcpyHtoD)?;
        self.shared.check_device_range(dst, bytes)?;
        self.shared.enqueue(
            stream,
            Command::HtoD {
                dst,
                src: SendPtr(src.cast_mut()),
                bytes,
            },
        )
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        self.shared.fault(FaultPoint::MemcpyDtoH)?;
        self.shared.check_device_range(src, bytes)?;
        self.shared.enqueue(
            stream,
            Command::DtoH {
                dst: SendPtr(dst),
                src,
                bytes,
            },
        )
    }

    fn add_callback(&self, stream: StreamHandle, callback: HostCallback) -> DriverResult<()> {
        self.shared.fault(FaultPoint::AddCallback)?;
        self.shared.enqueue(stream, Command::Callback(callback))
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        let workers: Vec<StreamWorker> = self.shared.streams.lock().drain().map(|(_, w)| w).collect();
        for worker in workers {
            Self::shutdown_stream(worker);
        }
        let mut pinned = self.shared.pinned.lock();
        if !pinned.is_empty() {
            tracing::warn!(
                target: "pinstage::mock",
                leaked = pinned.len(),
                "pinned buffers still live at driver drop"
            );
        }
        for (addr, layout) in pinned.drain() {
            // SAFETY: every entry is a live allocation made with `layout`.
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_alloc_free_accounting() {
        let driver = MockDriver::new();
        let ptr = driver.alloc_pinned(128).unwrap();
        assert_eq!(driver.stats().live_pinned_bytes, 128);
        // SAFETY: ptr is live and unused.
        unsafe { driver.free_pinned(ptr).unwrap() };
        // SAFETY: exercising the double-free detection path.
        let second = unsafe { driver.free_pinned(ptr) };
        assert_eq!(second, Err(DriverStatus::INVALID_VALUE));

        let stats = driver.stats();
        assert_eq!(stats.pinned_allocs, 1);
        assert_eq!(stats.pinned_frees, 1);
        assert_eq!(stats.invalid_frees, 1);
        assert_eq!(stats.live_pinned, 0);
    }

    #[test]
    fn test_zero_sized_and_capped_pinned_alloc() {
        let driver = MockDriver::with_config(MockDriverConfig {
            max_pinned_bytes: Some(100),
            ..MockDriverConfig::default()
        });
        assert_eq!(driver.alloc_pinned(0), Err(DriverStatus::INVALID_VALUE));
        assert_eq!(driver.alloc_pinned(101), Err(DriverStatus::OUT_OF_MEMORY));
        let ptr = driver.alloc_pinned(100).unwrap();
        // SAFETY: ptr is live and unused.
        unsafe { driver.free_pinned(ptr).unwrap() };
    }

    #[test]
    fn test_stream_executes_copies_in_order() {
        let driver = MockDriver::new();
        let stream = driver.create_stream(0).unwrap();
        let device = driver.alloc_device(4);
        let first = [1u8, 2, 3, 4];
        let second = [9u8, 9, 9, 9];
        let mut out = [0u8; 4];
        // SAFETY: all host buffers outlive the synchronize below.
        unsafe {
            driver
                .memcpy_htod_async(device, first.as_ptr(), 4, stream)
                .unwrap();
            driver
                .memcpy_dtoh_async(out.as_mut_ptr(), device, 4, stream)
                .unwrap();
            driver
                .memcpy_htod_async(device, second.as_ptr(), 4, stream)
                .unwrap();
        }
        driver.synchronize_stream(stream).unwrap();
        assert_eq!(out, first);
        assert_eq!(driver.read_device(device, 4).unwrap(), second.to_vec());
        driver.destroy_stream(stream).unwrap();
    }

    #[test]
    fn test_copy_outside_device_allocation_rejected() {
        let driver = MockDriver::new();
        let stream = driver.create_stream(0).unwrap();
        let device = driver.alloc_device(8);
        let data = [0u8; 16];
        // SAFETY: rejected before anything is queued.
        let result = unsafe { driver.memcpy_htod_async(device, data.as_ptr(), 16, stream) };
        assert_eq!(result, Err(DriverStatus::INVALID_VALUE));
        driver.destroy_stream(stream).unwrap();
    }

    #[test]
    fn test_event_lifecycle_and_timing() {
        let driver = MockDriver::with_config(MockDriverConfig {
            copy_latency: Duration::from_millis(5),
            ..MockDriverConfig::default()
        });
        let stream = driver.create_stream(-1).unwrap();
        let device = driver.alloc_device(16);
        let data = [3u8; 16];
        let before = driver.create_event().unwrap();
        let after = driver.create_event().unwrap();

        // never-recorded events count as complete
        assert!(driver.query_event(after).unwrap());

        driver.record_event(before, stream).unwrap();
        // SAFETY: `data` outlives the synchronize below.
        unsafe {
            driver
                .memcpy_htod_async(device, data.as_ptr(), 16, stream)
                .unwrap();
        }
        driver.record_event(after, stream).unwrap();
        driver.synchronize_event(after).unwrap();
        assert!(driver.query_event(after).unwrap());
        let ms = driver.elapsed_ms(before, after).unwrap();
        assert!(ms >= 4.0, "elapsed {ms}ms should cover the copy latency");

        driver.destroy_event(before).unwrap();
        driver.destroy_event(after).unwrap();
        assert_eq!(driver.destroy_event(after), Err(DriverStatus::INVALID_HANDLE));
        driver.destroy_stream(stream).unwrap();
    }

    #[test]
    fn test_callback_runs_on_worker_thread() {
        let driver = MockDriver::new();
        let stream = driver.create_stream(0).unwrap();
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        driver
            .add_callback(
                stream,
                Box::new(move |status| {
                    tx.send((status, thread::current().id())).unwrap();
                }),
            )
            .unwrap();
        let (status, id) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(status.is_success());
        assert_ne!(id, caller);
        driver.synchronize_stream(stream).unwrap();
        assert_eq!(driver.stats().callbacks_run, 1);
        driver.destroy_stream(stream).unwrap();
    }

    #[test]
    fn test_injected_faults_are_consumed() {
        let driver = MockDriver::new();
        driver.inject_fault(FaultPoint::AllocPinned, 1);
        assert_eq!(driver.alloc_pinned(8), Err(DriverStatus::OUT_OF_MEMORY));
        let ptr = driver.alloc_pinned(8).unwrap();
        // SAFETY: ptr is live and unused.
        unsafe { driver.free_pinned(ptr).unwrap() };

        driver.inject_fault(FaultPoint::CreateStream, 2);
        driver.clear_faults();
        let stream = driver.create_stream(0).unwrap();
        driver.destroy_stream(stream).unwrap();
        assert_eq!(driver.destroy_stream(stream), Err(DriverStatus::INVALID_HANDLE));
    }
}
