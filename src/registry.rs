//! Registry of every pinned buffer a stream's pool has allocated
//!
//! The registry owns the underlying buffers. Regions moving through the free
//! pool and in-flight transfers only borrow them, so teardown can free every
//! buffer exactly once no matter where its region currently is.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::driver::{DriverLog, SharedDriver};
use crate::error::{Result, StagingError};
use crate::region::{RegionId, StagingRegion};

#[derive(Clone, Copy)]
struct RegisteredBuffer {
    buffer: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the registry never dereferences the pointer; it only hands it back
// to the driver's free call.
unsafe impl Send for RegisteredBuffer {}

/// Set of all regions ever created for one stream
pub struct RegionRegistry {
    driver: SharedDriver,
    log: DriverLog,
    entries: Mutex<HashMap<RegionId, RegisteredBuffer>>,
}

impl RegionRegistry {
    pub(crate) fn new(driver: SharedDriver, log: DriverLog) -> Self {
        Self {
            driver,
            log,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Track a newly created region; called once per region
    pub(crate) fn record(&self, region: &StagingRegion) {
        let previous = self.entries.lock().insert(
            region.id(),
            RegisteredBuffer {
                buffer: region.buffer(),
                capacity: region.capacity(),
            },
        );
        debug_assert!(previous.is_none(), "{} recorded twice", region.id());
    }

    /// Refresh a region's buffer after growth
    pub(crate) fn update(&self, region: &StagingRegion) {
        if let Some(entry) = self.entries.lock().get_mut(&region.id()) {
            entry.buffer = region.buffer();
            entry.capacity = region.capacity();
        }
    }

    /// Forget a region without freeing its buffer
    ///
    /// Used when the buffer is already gone (failed growth) or must not be
    /// freed because a device operation may still touch it.
    pub(crate) fn retire(&self, id: RegionId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Whether `id` is registered
    #[must_use]
    pub fn contains(&self, id: RegionId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Number of registered regions
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total pinned bytes held by registered regions
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.lock().values().map(|entry| entry.capacity).sum()
    }

    /// Free every registered buffer and clear the registry
    ///
    /// Idempotent: an empty registry is a no-op. Every buffer is attempted
    /// even if an earlier free fails; the first failure is returned. Returns
    /// the number of buffers freed.
    ///
    /// # Safety
    ///
    /// No region of this registry may be used afterwards, and every device
    /// operation that touched one of them must have completed.
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Allocation` naming the first failed free.
    pub unsafe fn release_all(&self) -> Result<usize> {
        let entries: Vec<(RegionId, RegisteredBuffer)> = self.entries.lock().drain().collect();
        let mut freed = 0usize;
        let mut first_error: Option<StagingError> = None;
        for (id, entry) in entries {
            // SAFETY: the buffer came from alloc_pinned, is registered exactly
            // once, and the caller guarantees it is no longer in use.
            let result = unsafe { self.driver.free_pinned(entry.buffer) };
            match self.log.allocation("free_pinned", result) {
                Ok(()) => freed += 1,
                Err(err) => {
                    tracing::warn!(region = %id, bytes = entry.capacity, "failed to free staging buffer");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(freed),
        }
    }
}

impl fmt::Debug for RegionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionRegistry")
            .field("driver", &self.driver.name())
            .field("regions", &self.len())
            .field("bytes", &self.total_bytes())
            .finish()
    }
}
