//! Staging regions
//!
//! A region is one pinned host buffer, the unit the pool hands out and takes
//! back. Regions are deliberately not `Clone`: moving the value is how
//! ownership passes between the free pool and exactly one in-flight transfer.
//! The buffer itself is owned by the stream's [`crate::RegionRegistry`], so
//! dropping a region never frees memory.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier value
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Pinned host buffer plus its capacity
pub struct StagingRegion {
    id: RegionId,
    buffer: NonNull<u8>,
    capacity: usize,
}

// SAFETY: a region is the only handle through which its buffer is accessed
// while it is idle or in flight; moving it between threads moves that access.
unsafe impl Send for StagingRegion {}

impl StagingRegion {
    pub(crate) fn new(buffer: NonNull<u8>, capacity: usize) -> Self {
        Self {
            id: RegionId::next(),
            buffer,
            capacity,
        }
    }

    /// Region identifier
    #[must_use]
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Buffer size in bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn buffer(&self) -> NonNull<u8> {
        self.buffer
    }

    /// Swap in a larger buffer after growth
    pub(crate) fn replace_buffer(&mut self, buffer: NonNull<u8>, capacity: usize) {
        self.buffer = buffer;
        self.capacity = capacity;
    }

    /// Raw pointer for a device read (host-to-device copy source)
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    /// Raw pointer for a device write (device-to-host copy target)
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    /// Copy caller data into the front of the buffer
    ///
    /// # Panics
    ///
    /// Panics if `src` is larger than the region.
    pub fn fill_from(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.capacity,
            "{} holds {} bytes, asked to stage {}",
            self.id,
            self.capacity,
            src.len()
        );
        // SAFETY: the buffer is valid for `capacity` bytes, owned exclusively
        // through `&mut self`, and cannot overlap caller memory.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.buffer.as_ptr(), src.len()) };
    }

    /// Copy the front of the buffer out to the caller
    ///
    /// # Panics
    ///
    /// Panics if `dst` is larger than the region.
    pub fn copy_into(&self, dst: &mut [u8]) {
        assert!(
            dst.len() <= self.capacity,
            "{} holds {} bytes, asked to unstage {}",
            self.id,
            self.capacity,
            dst.len()
        );
        // SAFETY: the buffer is valid for `capacity` bytes and no device
        // operation is writing it while the caller holds the region.
        unsafe { std::ptr::copy_nonoverlapping(self.buffer.as_ptr(), dst.as_mut_ptr(), dst.len()) };
    }
}

impl fmt::Debug for StagingRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingRegion")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_region<F: FnOnce(&mut StagingRegion)>(capacity: usize, f: F) {
        let mut backing = vec![0u8; capacity];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let mut region = StagingRegion::new(ptr, capacity);
        f(&mut region);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = RegionId::next();
        let b = RegionId::next();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn test_fill_then_copy_out() {
        with_region(16, |region| {
            region.fill_from(&[1, 2, 3, 4, 5]);
            let mut out = [0u8; 5];
            region.copy_into(&mut out);
            assert_eq!(out, [1, 2, 3, 4, 5]);
            assert_eq!(region.capacity(), 16);
        });
    }

    #[test]
    #[should_panic(expected = "asked to stage")]
    fn test_fill_larger_than_capacity_panics() {
        with_region(4, |region| region.fill_from(&[0u8; 5]));
    }
}
