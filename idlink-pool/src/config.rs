//! Pool configuration.

use crate::error::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pool configuration.
///
/// Validated once when the pool is built and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live objects (active plus idle).
    pub max_objects: usize,
    /// Maximum number of idle objects kept for reuse.
    pub max_idle: usize,
    /// Idle objects never evicted for age below this count.
    pub min_idle: usize,
    /// Maximum time a borrower waits for capacity, in seconds.
    pub max_wait_seconds: u64,
    /// Idle objects older than this are evicted, in milliseconds.
    pub min_evictable_idle_millis: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_objects: 10,
            max_idle: 10,
            min_idle: 1,
            max_wait_seconds: 150,
            min_evictable_idle_millis: 120_000,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given capacity.
    pub fn new(max_objects: usize) -> Self {
        Self {
            max_objects,
            max_idle: max_objects,
            min_idle: max_objects.min(1),
            ..Default::default()
        }
    }

    /// Set the maximum number of idle objects.
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self.min_idle = self.min_idle.min(max_idle);
        self
    }

    /// Set the minimum number of idle objects.
    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set the maximum wait time.
    pub fn with_max_wait_seconds(mut self, seconds: u64) -> Self {
        self.max_wait_seconds = seconds;
        self
    }

    /// Set the idle eviction age.
    pub fn with_min_evictable_idle_millis(mut self, millis: u64) -> Self {
        self.min_evictable_idle_millis = millis;
        self
    }

    /// Maximum wait as a duration.
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    /// Idle eviction age as a duration.
    pub fn min_evictable_idle(&self) -> Duration {
        Duration::from_millis(self.min_evictable_idle_millis)
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_objects == 0 {
            return Err(PoolError::InvalidConfig(
                "max_objects must be greater than zero".to_string(),
            ));
        }
        if self.max_idle > self.max_objects {
            return Err(PoolError::InvalidConfig(format!(
                "max_idle ({}) exceeds max_objects ({})",
                self.max_idle, self.max_objects
            )));
        }
        if self.min_idle > self.max_idle {
            return Err(PoolError::InvalidConfig(format!(
                "min_idle ({}) exceeds max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        Ok(())
    }
}
