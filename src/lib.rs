//! Pooled sub-allocator for workloads with many small, short lived
//! allocations.
//!
//! A [`MemoryPool`] requests big arenas from a [`BackingAllocator`] and
//! carves them into blocks:
//!
//! ```text
//!  MemoryPool
//! +----------------------------------------------------------------+
//! | small tables (one per size class)                              |
//! |   [16] -> Pool -> Pool        [32] -> Pool    ...   [32768]    |
//! |                                                                |
//! | medium table                                                   |
//! |   Pool -> Pool      first-fit blocks, split and merged         |
//! |                                                                |
//! | large allocations                                              |
//! |   Block -> Block    one backing allocation each                |
//! +----------------------------------------------------------------+
//! ```
//!
//! Small requests are rounded up to one of 45 size classes and served from
//! fixed size blocks. Medium requests are cut out of bigger pools and merged
//! back with their free neighbours when released. Everything else, including
//! any request with a custom alignment, goes straight to the backing
//! allocator.
//!
//! Besides freeing allocations one by one, the pool can release all small
//! and medium allocations at once with [`MemoryPool::reset`], keeping its
//! arenas for the next round.
//!
//! ```
//! use mempool::{MemoryPool, Tier};
//!
//! let mut pool: MemoryPool = MemoryPool::default();
//!
//! let allocation = pool.allocate(24, 0);
//! assert_eq!(allocation.tier(), Tier::Small);
//! assert_eq!(allocation.usable_size(), 32);
//!
//! pool.free(allocation);
//! pool.clear();
//! ```

pub mod backing;
mod block;
pub mod config;
pub mod error;
mod freelist;
mod list;
mod memory_pool;
mod pool;
pub mod size_class;
pub mod stats;
mod table;
mod utils;

pub use backing::{BackingAllocator, CountingAllocator, SystemAllocator};
#[cfg(any(unix, windows))]
pub use backing::{PageAllocator, page_size};
pub use block::{BLOCK_HEADER_SIZE, POISON_BYTE};
pub use config::{DEFAULT_PAGES_PER_POOL, MIN_PAGE_SIZE, PoolConfig};
pub use error::{PoolError, Result};
pub use memory_pool::{Allocation, MemoryPool, Tier};
pub use size_class::{DEFAULT_ALIGNMENT, SMALL_MAX_SIZE, size_class_for};
pub use stats::{Statistics, TierStatistics};
pub use table::{TableKind, TableStats};
