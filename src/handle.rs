//! Opaque device handles
//!
//! Streams, events and device pointers cross the crate boundary as plain
//! numbers. Streams and events additionally encode to a fixed 8-byte array so
//! a marshalling layer can carry them without knowing their layout.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size in bytes of an encoded handle
pub const HANDLE_BYTES: usize = 8;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw driver handle
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw driver handle
            #[must_use]
            pub const fn as_raw(self) -> u64 {
                self.0
            }

            /// Encode as opaque bytes (native byte order)
            #[must_use]
            pub fn to_bytes(self) -> [u8; HANDLE_BYTES] {
                self.0.to_ne_bytes()
            }

            /// Decode from opaque bytes produced by [`Self::to_bytes`]
            #[must_use]
            pub fn from_bytes(bytes: [u8; HANDLE_BYTES]) -> Self {
                Self(u64::from_ne_bytes(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

opaque_handle!(
    /// Handle to a device command stream
    StreamHandle
);

opaque_handle!(
    /// Handle to a device completion/timestamp event
    EventHandle
);

/// Device memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Address advanced by `bytes`, or `None` if it would wrap
    #[must_use]
    pub fn offset(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Stream priority bounds reported by the device
///
/// Lower numbers mean higher priority, so `greatest <= least`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRange {
    /// Numerically largest value (lowest priority)
    pub least: i32,
    /// Numerically smallest value (highest priority)
    pub greatest: i32,
}

impl PriorityRange {
    /// Clamp a requested level into the supported range
    #[must_use]
    pub fn clamp(&self, level: i32) -> i32 {
        level.clamp(self.greatest.min(self.least), self.least.max(self.greatest))
    }
}

/// Requested stream priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPriority {
    /// Highest priority the device supports
    #[default]
    Highest,
    /// Lowest priority the device supports
    Lowest,
    /// Device default priority (0)
    Normal,
    /// Explicit level, clamped into the device range
    Level(i32),
}

impl StreamPriority {
    /// Concrete priority level for the given device range
    #[must_use]
    pub fn resolve(self, range: PriorityRange) -> i32 {
        match self {
            Self::Highest => range.greatest,
            Self::Lowest => range.least,
            Self::Normal => range.clamp(0),
            Self::Level(level) => range.clamp(level),
        }
    }
}
