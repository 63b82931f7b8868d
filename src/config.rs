//! Staging configuration
//!
//! Settings can be built in code, parsed from JSON, and overridden from the
//! environment:
//!
//! - `PINSTAGE_LOG_DRIVER_CALLS`: log every driver call status (`1`/`true`)
//! - `PINSTAGE_MAX_REGIONS`: cap on live staging regions per stream
//! - `PINSTAGE_ACQUIRE_TIMEOUT_MS`: wait budget when the cap is reached

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StagingError};
use crate::handle::StreamPriority;

/// Limits on how far a stream's staging pool may grow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    /// Maximum number of live regions (`None` = unbounded)
    pub max_regions: Option<usize>,
    /// How long `acquire` waits for a release once the cap is reached
    pub acquire_timeout_ms: u64,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_regions: None,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolLimits {
    /// Wait budget as a duration
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Configuration for a stream and its staging pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Growth limits
    pub limits: PoolLimits,
    /// Smallest buffer a new region is given (0 = size exactly to the request)
    pub min_region_bytes: usize,
    /// Log every driver call and its status at trace level
    pub log_driver_calls: bool,
    /// Priority used by [`crate::Stream::create`]
    pub default_priority: StreamPriority,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            limits: PoolLimits::default(),
            min_region_bytes: 0,
            log_driver_calls: false,
            default_priority: StreamPriority::Highest,
        }
    }
}

impl StagingConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of live regions
    #[must_use]
    pub fn with_max_regions(mut self, max: usize) -> Self {
        self.limits.max_regions = Some(max);
        self
    }

    /// Set the wait budget used when the cap is reached
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.limits.acquire_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the minimum size of newly allocated regions
    #[must_use]
    pub fn with_min_region_bytes(mut self, bytes: usize) -> Self {
        self.min_region_bytes = bytes;
        self
    }

    /// Enable per-call driver logging
    #[must_use]
    pub fn with_driver_logging(mut self, enabled: bool) -> Self {
        self.log_driver_calls = enabled;
        self
    }

    /// Set the default stream priority
    #[must_use]
    pub fn with_priority(mut self, priority: StreamPriority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Parse from JSON; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Config` if the document is malformed or fails
    /// validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StagingError::Config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PINSTAGE_*` environment overrides
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Config` if a variable is set to an unparsable
    /// value.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var("PINSTAGE_LOG_DRIVER_CALLS") {
            self.log_driver_calls = matches!(value.trim(), "1" | "true" | "yes" | "on");
        }
        if let Ok(value) = std::env::var("PINSTAGE_MAX_REGIONS") {
            let max = value.trim().parse::<usize>().map_err(|e| {
                StagingError::Config(format!("PINSTAGE_MAX_REGIONS={value:?}: {e}"))
            })?;
            self.limits.max_regions = Some(max);
        }
        if let Ok(value) = std::env::var("PINSTAGE_ACQUIRE_TIMEOUT_MS") {
            self.limits.acquire_timeout_ms = value.trim().parse::<u64>().map_err(|e| {
                StagingError::Config(format!("PINSTAGE_ACQUIRE_TIMEOUT_MS={value:?}: {e}"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check the configuration for values the pool cannot honor
    ///
    /// # Errors
    ///
    /// Returns `StagingError::Config` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_regions == Some(0) {
            return Err(StagingError::Config(
                "max_regions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
