//! # pinstage
//!
//! Pinned host staging for asynchronous host/device copies.
//!
//! Copies between pageable host memory and a device go through page-locked
//! ("pinned") staging buffers. Allocating pinned memory is expensive, so each
//! [`Stream`] keeps a pool of staging regions and recycles them: a region used
//! for a host-to-device copy returns to the pool from the device's completion
//! callback, never from the thread that issued the copy.
//!
//! ## Features
//!
//! - **Per-stream pools**: FIFO reuse with in-place growth, optional region cap
//!   with bounded backpressure
//! - **Completion-driven recycling**: regions come back when the device says
//!   the copy finished
//! - **Event brackets**: every transfer returns a `(before, after)` event pair
//!   for waiting and timing
//! - **Driver seam**: [`DeviceDriver`] with a software [`MockDriver`] and, with
//!   feature `cuda`, a `CudaDriver` on `cudarc`
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pinstage::{MockDriver, StagingConfig, Stream};
//!
//! let device = Arc::new(MockDriver::new());
//! let buffer = device.alloc_device(4);
//!
//! let stream = Stream::create(device.clone(), &StagingConfig::default()).unwrap();
//! let upload = stream.transfers().write(buffer, &[1, 2, 3, 4]).unwrap();
//! upload.wait_until_complete().unwrap();
//!
//! let mut out = [0u8; 4];
//! stream.transfers().read_blocking(buffer, &mut out).unwrap();
//! assert_eq!(out, [1, 2, 3, 4]);
//!
//! assert!(stream.destroy().is_ok());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Stream ──owns──► StagingPool ──owns──► RegionRegistry (all pinned buffers)
//!   │                  ▲   │
//!   │ transfers()      │   └─ FIFO free list of StagingRegion
//!   ▼                  │
//! TransferOrchestrator ┴── acquire / release (issuer or completion callback)
//!   │
//!   └─► EventBracket (before/after events per transfer)
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap)] // CUresult and handle casts
#![allow(clippy::cast_precision_loss)] // usize -> f64 for hit rates
#![allow(clippy::cast_possible_truncation)] // pointer <-> u64 handle casts
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::missing_panics_doc)] // Allow missing Panics doc sections
#![allow(clippy::float_cmp)] // Allow float comparisons in tests

/// Event pairs around asynchronous operations
pub mod bracket;
/// Configuration: pool limits, priority, driver-call logging
pub mod config;
/// Device runtime abstraction and its backends
pub mod driver;
/// Error types
pub mod error;
/// Opaque stream, event and device-pointer handles
pub mod handle;
/// Per-stream staging pool
pub mod pool;
/// Pinned staging regions
pub mod region;
/// Registry owning every pinned buffer of a pool
pub mod registry;
/// Stream creation and teardown
pub mod stream;
/// Staged host/device copies
pub mod transfer;

pub use bracket::EventBracket;
pub use config::{PoolLimits, StagingConfig};
#[cfg(feature = "cuda")]
pub use driver::CudaDriver;
pub use driver::{
    DeviceDriver, DriverResult, FaultPoint, HostCallback, MockDriver, MockDriverConfig,
    MockDriverStats, SharedDriver,
};
pub use error::{DriverStatus, Result, StagingError, TransferError};
pub use handle::{DevicePtr, EventHandle, PriorityRange, StreamHandle, StreamPriority, HANDLE_BYTES};
pub use pool::{StagingPool, StagingPoolStats};
pub use region::{RegionId, StagingRegion};
pub use registry::RegionRegistry;
pub use stream::{DestroyReport, Stream};
pub use transfer::{PendingRead, TransferOrchestrator, TransferResult, TransferStats};
