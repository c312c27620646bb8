//! Memory pool configuration.
//!
//! ```toml
//! medium_max_size = 65536
//! pages_per_pool = 16
//! delete_unused_pools = true
//! retained_empty_pools = 1
//! collect_statistics = false
//! debug_guards = false
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Smallest accepted medium allocation limit.
pub const MIN_PAGE_SIZE: u64 = 65_536;

/// Number of medium limits every pool arena spans by default.
pub const DEFAULT_PAGES_PER_POOL: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Largest default-aligned request served by the medium table. Bigger
    /// requests go straight to the backing allocator.
    pub medium_max_size: u64,
    /// Arena size of every pool, in multiples of `medium_max_size`.
    pub pages_per_pool: u64,
    /// Give empty pools back to the backing allocator when blocks are freed.
    pub delete_unused_pools: bool,
    /// Empty pools per table kept around when `delete_unused_pools` is on,
    /// so a table that empties and refills does not churn arenas.
    pub retained_empty_pools: usize,
    /// Keep [`crate::Statistics`] up to date.
    pub collect_statistics: bool,
    /// Tag block headers and poison freed payloads to catch header
    /// overwrites. On by default in debug builds.
    pub debug_guards: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            medium_max_size: MIN_PAGE_SIZE,
            pages_per_pool: DEFAULT_PAGES_PER_POOL,
            delete_unused_pools: true,
            retained_empty_pools: 1,
            collect_statistics: false,
            debug_guards: cfg!(debug_assertions),
        }
    }
}

impl PoolConfig {
    pub fn new(medium_max_size: u64) -> Self {
        Self {
            medium_max_size,
            ..Self::default()
        }
    }

    /// Parses a TOML document. Missing keys take their default value.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_pages_per_pool(mut self, pages_per_pool: u64) -> Self {
        self.pages_per_pool = pages_per_pool;
        self
    }

    #[must_use]
    pub fn with_delete_unused_pools(mut self, delete_unused_pools: bool) -> Self {
        self.delete_unused_pools = delete_unused_pools;
        self
    }

    #[must_use]
    pub fn with_retained_empty_pools(mut self, retained_empty_pools: usize) -> Self {
        self.retained_empty_pools = retained_empty_pools;
        self
    }

    #[must_use]
    pub fn with_statistics(mut self, collect_statistics: bool) -> Self {
        self.collect_statistics = collect_statistics;
        self
    }

    #[must_use]
    pub fn with_debug_guards(mut self, debug_guards: bool) -> Self {
        self.debug_guards = debug_guards;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.medium_max_size < MIN_PAGE_SIZE {
            return Err(PoolError::MediumLimitTooSmall {
                size: self.medium_max_size,
                min: MIN_PAGE_SIZE,
            });
        }

        if self.pages_per_pool < 2 {
            return Err(PoolError::InvalidConfig {
                reason: format!(
                    "pages_per_pool must be at least 2, got {}",
                    self.pages_per_pool
                ),
            });
        }

        if self.arena_size().is_none() {
            return Err(PoolError::InvalidConfig {
                reason: format!(
                    "pool arena of {} x {} bytes overflows",
                    self.pages_per_pool, self.medium_max_size
                ),
            });
        }

        Ok(())
    }

    /// Size of every pool arena, `None` if it does not fit in a `usize`.
    pub fn arena_size(&self) -> Option<u64> {
        self.medium_max_size
            .checked_mul(self.pages_per_pool)
            .filter(|size| usize::try_from(*size).is_ok())
    }
}
