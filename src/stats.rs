//! Allocation statistics, collected when
//! [`crate::PoolConfig::collect_statistics`] is set.

use std::{fmt, time::Duration};

use serde::Serialize;

use crate::memory_pool::Tier;

/// Counters of one allocation tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStatistics {
    /// Allocations currently live.
    pub live_allocations: u64,
    /// Bytes held by live allocations, block headers included.
    pub live_bytes: u64,
    /// Allocations served since the statistics were last cleared.
    pub total_allocations: u64,
    /// Arenas currently held for this tier.
    pub pools: u64,
    /// Bytes of the arenas currently held for this tier.
    pub pool_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub small: TierStatistics,
    pub medium: TierStatistics,
    pub large: TierStatistics,
    /// Time spent inside `allocate`.
    pub allocate_time: Duration,
    /// Time spent inside `free`.
    pub free_time: Duration,
}

impl Statistics {
    pub fn tier(&self, tier: Tier) -> &TierStatistics {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut TierStatistics {
        match tier {
            Tier::Small => &mut self.small,
            Tier::Medium => &mut self.medium,
            Tier::Large => &mut self.large,
        }
    }

    pub fn live_allocations(&self) -> u64 {
        self.small.live_allocations + self.medium.live_allocations + self.large.live_allocations
    }

    pub fn live_bytes(&self) -> u64 {
        self.small.live_bytes + self.medium.live_bytes + self.large.live_bytes
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "time alloc/free (ms): {:.3}/{:.3}",
            self.allocate_time.as_secs_f64() * 1000.0,
            self.free_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "live allocations: {}, bytes: {}",
            self.live_allocations(),
            self.live_bytes()
        )?;

        for (name, tier) in [("small", &self.small), ("medium", &self.medium), ("large", &self.large)] {
            writeln!(
                f,
                " {name:<6} bytes/pool bytes: {}/{} allocations/pools: {}/{}",
                tier.live_bytes, tier.pool_bytes, tier.live_allocations, tier.pools
            )?;
        }

        Ok(())
    }
}

/// Keeps the running [`Statistics`] of a memory pool.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    current: Statistics,
}

impl StatsCollector {
    pub fn record_allocation(&mut self, tier: Tier, bytes: u64, elapsed: Duration) {
        let stats = self.current.tier_mut(tier);
        stats.live_allocations += 1;
        stats.live_bytes += bytes;
        stats.total_allocations += 1;
        self.current.allocate_time += elapsed;
    }

    pub fn record_free(&mut self, tier: Tier, bytes: u64, elapsed: Duration) {
        let stats = self.current.tier_mut(tier);
        debug_assert!(stats.live_allocations > 0 && stats.live_bytes >= bytes);
        stats.live_allocations -= 1;
        stats.live_bytes -= bytes;
        self.current.free_time += elapsed;
    }

    pub fn record_pool_created(&mut self, tier: Tier, bytes: u64) {
        let stats = self.current.tier_mut(tier);
        stats.pools += 1;
        stats.pool_bytes += bytes;
    }

    pub fn record_pool_released(&mut self, tier: Tier, bytes: u64) {
        let stats = self.current.tier_mut(tier);
        debug_assert!(stats.pools > 0 && stats.pool_bytes >= bytes);
        stats.pools -= 1;
        stats.pool_bytes -= bytes;
    }

    /// Every live allocation of `tier` was released at once.
    pub fn record_reset(&mut self, tier: Tier) {
        let stats = self.current.tier_mut(tier);
        stats.live_allocations = 0;
        stats.live_bytes = 0;
    }

    pub fn clear(&mut self) {
        self.current = Statistics::default();
    }

    pub fn snapshot(&self) -> Statistics {
        self.current.clone()
    }
}
