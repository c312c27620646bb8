use std::{
    fmt, mem,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crate::{
    backing::{Arena, BackingAllocator, SystemAllocator},
    block::{self, BLOCK_HEADER_SIZE, FREED_TAG, LIVE_TAG, LargeBlock, POOLED_ALIGNMENT},
    config::{MIN_PAGE_SIZE, PoolConfig},
    error::{PoolError, Result, fatal},
    list::{List, NodeId, Nodes},
    pool::Pool,
    size_class::{DEFAULT_ALIGNMENT, SIZE_CLASSES, SMALL_MAX_SIZE, SizeClassIndex},
    stats::{Statistics, StatsCollector},
    table::{PoolTable, TableId, TableStats},
    utils::{align, checked_align},
};

/// Alignment pool arenas are requested with.
const ARENA_ALIGNMENT: u32 = 16;

/// A medium block is only split when more than this is left over, smaller
/// remainders stay attached to the allocation.
const MEDIUM_SPLIT_THRESHOLD: u64 = SMALL_MAX_SIZE + BLOCK_HEADER_SIZE;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Which path served an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Fixed size block of a small size class.
    Small,
    /// Block split off a medium pool.
    Medium,
    /// Dedicated arena from the backing allocator.
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pooled { pool: NodeId, block: NodeId },
    Large { block: NodeId },
}

/// Memory handed out by a [`MemoryPool`].
///
/// The handle knows which block it came from, so giving it back with
/// [`MemoryPool::free`] needs no pointer arithmetic. It is neither `Clone`
/// nor `Copy`: freeing consumes it.
///
/// The handle does not keep the pool alive. Its memory is valid until the
/// handle is freed, or until the pool is reset, cleared or dropped.
#[must_use = "an allocation that is never freed stays live until the pool is reset"]
pub struct Allocation {
    ptr: NonNull<u8>,
    usable_size: u64,
    /// Bytes taken from the pool or the backing allocator, header included.
    footprint: u64,
    tier: Tier,
    owner: u64,
    stamp: u64,
    slot: Slot,
}

// SAFETY: the handle is an inert token; touching its memory is already unsafe.
unsafe impl Send for Allocation {}

impl Allocation {
    /// First byte of the payload.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn cast<T>(&self) -> NonNull<T> {
        self.ptr.cast()
    }

    /// Bytes that can be used from [`Allocation::as_ptr`] on. Never less
    /// than the requested size.
    #[inline]
    pub fn usable_size(&self) -> u64 {
        self.usable_size
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// The payload as a byte slice.
    ///
    /// # Safety
    ///
    /// The pool that handed out the allocation must not have been reset,
    /// cleared or dropped since.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.usable_size as usize) }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("ptr", &self.ptr)
            .field("usable_size", &self.usable_size)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

/// General purpose sub-allocator for many small, short lived allocations.
///
/// Requests are served by one of three paths, depending on their size
/// rounded up to the alignment:
///
/// ```text
///              size <= 32768         size <= medium_max        anything else
///           +------------------+   +------------------+   +------------------+
///           |   small tables   |   |   medium table   |   |    large list    |
///           | one per size     |   | first-fit blocks |   | one arena per    |
///           | class, fixed     |   | split from pools,|   | allocation       |
///           | size blocks      |   | merged on free   |   |                  |
///           +------------------+   +------------------+   +------------------+
/// ```
///
/// Only default-aligned requests are pooled; stricter alignments always take
/// the large path. Pooled payloads still start on a 16 byte boundary.
///
/// A `MemoryPool` is single threaded: it can move between threads but it
/// cannot be shared. Use one instance per worker.
pub struct MemoryPool<A: BackingAllocator = SystemAllocator> {
    /// Tells allocations of different pools apart
    id: u64,
    config: PoolConfig,
    arena_size: u64,
    backing: A,
    index: SizeClassIndex,
    small_tables: Vec<PoolTable>,
    medium_table: PoolTable,
    /// Every pool of every table
    pools: Nodes<Pool>,
    large: Nodes<LargeBlock>,
    large_allocations: List,
    /// Scratch list of pools on their way back to the backing allocator
    marked_for_release: Vec<Pool>,
    last_stamp: u64,
    stats: Option<StatsCollector>,
}

// SAFETY: the pool exclusively owns every arena it points into, moving it to
// another thread moves all of them along.
unsafe impl<A: BackingAllocator + Send> Send for MemoryPool<A> {}

impl Default for MemoryPool<SystemAllocator> {
    fn default() -> Self {
        Self::new(MIN_PAGE_SIZE, SystemAllocator::new(), true)
    }
}

#[inline]
fn tier_of(table: TableId) -> Tier {
    match table {
        TableId::Small(_) => Tier::Small,
        TableId::Medium => Tier::Medium,
    }
}

#[inline]
fn table_of<'a>(
    small_tables: &'a mut [PoolTable],
    medium_table: &'a mut PoolTable,
    table: TableId,
) -> &'a mut PoolTable {
    match table {
        TableId::Small(class) => &mut small_tables[class as usize],
        TableId::Medium => medium_table,
    }
}

#[inline]
fn elapsed(started: Option<Instant>) -> Duration {
    started.map(|started| started.elapsed()).unwrap_or_default()
}

impl<A: BackingAllocator> MemoryPool<A> {
    /// Creates a pool serving default-aligned requests of up to
    /// `medium_max_size` bytes from pooled arenas.
    ///
    /// Panics if `medium_max_size` is below [`MIN_PAGE_SIZE`]. See
    /// [`MemoryPool::with_config`] for the fallible version.
    #[track_caller]
    pub fn new(medium_max_size: u64, backing: A, delete_unused_pools: bool) -> Self {
        let config = PoolConfig::new(medium_max_size).with_delete_unused_pools(delete_unused_pools);

        match Self::with_config(config, backing) {
            Ok(pool) => pool,
            Err(error) => fatal(error),
        }
    }

    pub fn with_config(config: PoolConfig, backing: A) -> Result<Self> {
        config.validate()?;
        let arena_size = config.arena_size().ok_or_else(|| PoolError::InvalidConfig {
            reason: "pool arena size overflows".to_owned(),
        })?;

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            memory_pool = id,
            medium_max_size = config.medium_max_size,
            arena_size,
            "created memory pool"
        );

        Ok(Self {
            id,
            arena_size,
            backing,
            index: SizeClassIndex::new(),
            small_tables: SIZE_CLASSES.iter().map(|&size| PoolTable::fixed(size)).collect(),
            medium_table: PoolTable::variable(),
            pools: Nodes::new(),
            large: Nodes::new(),
            large_allocations: List::new(),
            marked_for_release: Vec::with_capacity(32),
            last_stamp: 0,
            stats: config.collect_statistics.then(StatsCollector::default),
            config,
        })
    }

    /// Allocates `size` bytes aligned to `alignment`, `0` meaning
    /// [`DEFAULT_ALIGNMENT`].
    ///
    /// Panics if the allocation cannot be served, see
    /// [`MemoryPool::try_allocate`].
    #[track_caller]
    pub fn allocate(&mut self, size: u64, alignment: u32) -> Allocation {
        match self.try_allocate(size, alignment) {
            Ok(allocation) => allocation,
            Err(error) => fatal(error),
        }
    }

    /// Alignments of 1 and 2 are served like the default alignment. Any
    /// stricter alignment takes the large path, even for small sizes.
    pub fn try_allocate(&mut self, size: u64, alignment: u32) -> Result<Allocation> {
        let started = self.stats.is_some().then(Instant::now);

        if size == 0 {
            return Err(PoolError::ZeroSize);
        }
        let alignment = match alignment {
            0 => DEFAULT_ALIGNMENT,
            alignment if !alignment.is_power_of_two() => {
                return Err(PoolError::InvalidAlignment { alignment });
            }
            alignment => alignment.max(DEFAULT_ALIGNMENT),
        };
        let aligned = checked_align(size, alignment as u64)
            .ok_or(PoolError::SizeOverflow { size, alignment })?;

        let allocation = if alignment == DEFAULT_ALIGNMENT && aligned <= SMALL_MAX_SIZE {
            self.allocate_small(aligned)?
        } else if alignment == DEFAULT_ALIGNMENT && aligned <= self.config.medium_max_size {
            self.allocate_medium(aligned)?
        } else {
            self.allocate_large(aligned, alignment)?
        };

        if self.config.debug_guards {
            // SAFETY: every payload is preceded by its header slot.
            unsafe { block::write_tag(allocation.ptr, LIVE_TAG) }
        }
        if let Some(stats) = &mut self.stats {
            stats.record_allocation(allocation.tier, allocation.footprint, elapsed(started));
        }

        tracing::trace!(
            size,
            alignment,
            tier = ?allocation.tier,
            ptr = ?allocation.ptr,
            "allocated"
        );
        Ok(allocation)
    }

    /// Allocates room for one `T`. Types aligned to at most 16 bytes are
    /// pooled, since every pooled payload is 16-byte aligned.
    #[track_caller]
    pub fn allocate_element<T>(&mut self) -> Allocation {
        self.allocate_array::<T>(1)
    }

    /// Allocates room for `count` consecutive `T`s.
    #[track_caller]
    pub fn allocate_array<T>(&mut self, count: u64) -> Allocation {
        match self.try_allocate_array::<T>(count) {
            Ok(allocation) => allocation,
            Err(error) => fatal(error),
        }
    }

    pub fn try_allocate_array<T>(&mut self, count: u64) -> Result<Allocation> {
        let alignment = mem::align_of::<T>() as u32;
        let size = (mem::size_of::<T>() as u64)
            .checked_mul(count)
            .ok_or(PoolError::SizeOverflow { size: u64::MAX, alignment })?;
        let alignment = if alignment as u64 <= POOLED_ALIGNMENT {
            DEFAULT_ALIGNMENT
        } else {
            alignment
        };

        // Zero sized types still get a distinct address.
        self.try_allocate(size.max(1), alignment)
    }

    fn next_stamp(&mut self) -> u64 {
        self.last_stamp += 1;
        self.last_stamp
    }

    fn pooled_allocation(&self, pool: NodeId, block: NodeId, stamp: u64, tier: Tier) -> Allocation {
        let owner = &self.pools[pool];
        let data = owner.block_at(block);

        Allocation {
            ptr: owner.payload(block),
            usable_size: data.usable_size(),
            footprint: data.size,
            tier,
            owner: self.id,
            stamp,
            slot: Slot::Pooled { pool, block },
        }
    }

    /// Moves `pool` to the full list of its table once it ran out of blocks.
    fn retire_if_full(&mut self, pool: NodeId) {
        if self.pools[pool].has_free() {
            return;
        }

        let table = self.pools[pool].table();
        table_of(&mut self.small_tables, &mut self.medium_table, table).retire(&mut self.pools, pool);
    }

    fn allocate_small(&mut self, aligned: u64) -> Result<Allocation> {
        let class = self.index.class_index(aligned);
        let pool = match self.small_tables[class].first_active() {
            Some(pool) => pool,
            None => self.grow_small_table(class)?,
        };

        let stamp = self.next_stamp();
        let Some(block) = self.pools[pool].take_fixed(stamp) else {
            unreachable!("active pool {pool} has no free block");
        };
        self.retire_if_full(pool);

        Ok(self.pooled_allocation(pool, block, stamp, Tier::Small))
    }

    fn allocate_medium(&mut self, aligned: u64) -> Result<Allocation> {
        let needed = align(aligned + BLOCK_HEADER_SIZE, POOLED_ALIGNMENT);
        let stamp = self.next_stamp();

        let mut cursor = self.medium_table.first_active();
        while let Some(pool) = cursor {
            if let Some(block) = self.pools[pool].take_first_fit(needed, MEDIUM_SPLIT_THRESHOLD, stamp) {
                self.retire_if_full(pool);
                return Ok(self.pooled_allocation(pool, block, stamp, Tier::Medium));
            }
            cursor = self.pools.node(pool).next;
        }

        let pool = self.grow_medium_table()?;
        let Some(block) = self.pools[pool].take_first_fit(needed, MEDIUM_SPLIT_THRESHOLD, stamp) else {
            unreachable!("fresh medium pool cannot hold {needed} bytes");
        };
        self.retire_if_full(pool);

        Ok(self.pooled_allocation(pool, block, stamp, Tier::Medium))
    }

    fn allocate_large(&mut self, aligned: u64, alignment: u32) -> Result<Allocation> {
        let payload_offset = align(BLOCK_HEADER_SIZE, alignment as u64);
        let size = payload_offset
            .checked_add(aligned)
            .filter(|size| usize::try_from(*size).is_ok())
            .ok_or(PoolError::SizeOverflow { size: aligned, alignment })?;

        let arena = Arena::acquire(&mut self.backing, size, alignment.max(ARENA_ALIGNMENT))?;
        let stamp = self.next_stamp();
        let block = LargeBlock { arena, payload_offset, stamp };
        let (ptr, usable_size) = (block.payload(), block.usable_size());

        let id = self.large.insert(block);
        self.large_allocations.push_back(&mut self.large, id);
        if let Some(stats) = &mut self.stats {
            stats.record_pool_created(Tier::Large, size);
        }

        Ok(Allocation {
            ptr,
            usable_size,
            footprint: size,
            tier: Tier::Large,
            owner: self.id,
            stamp,
            slot: Slot::Large { block: id },
        })
    }

    fn grow_small_table(&mut self, class: usize) -> Result<NodeId> {
        let class_size = SIZE_CLASSES[class];
        let stride = class_size + BLOCK_HEADER_SIZE;
        let count = self.arena_size / stride;

        let arena = Arena::acquire(&mut self.backing, count * stride, ARENA_ALIGNMENT)?;
        let pool = self
            .pools
            .insert(Pool::with_fixed_blocks(TableId::Small(class as u16), class_size, arena));
        self.small_tables[class].insert(&mut self.pools, pool);

        self.on_pool_created(pool);
        Ok(pool)
    }

    fn grow_medium_table(&mut self) -> Result<NodeId> {
        let arena = Arena::acquire(&mut self.backing, self.arena_size, ARENA_ALIGNMENT)?;
        let pool = self.pools.insert(Pool::with_single_block(TableId::Medium, arena));
        self.medium_table.insert(&mut self.pools, pool);

        self.on_pool_created(pool);
        Ok(pool)
    }

    fn on_pool_created(&mut self, pool: NodeId) {
        let pool = &self.pools[pool];
        let tier = tier_of(pool.table());

        tracing::debug!(
            memory_pool = self.id,
            ?tier,
            arena_size = pool.arena_size(),
            blocks = pool.free_blocks(),
            "created pool"
        );
        if let Some(stats) = &mut self.stats {
            stats.record_pool_created(tier, pool.arena_size());
        }
    }

    /// Gives `allocation` back to the pool.
    ///
    /// Panics if the allocation belongs to another pool, was already
    /// released by [`MemoryPool::reset`], or if debug guards found its
    /// header overwritten.
    #[track_caller]
    pub fn free(&mut self, allocation: Allocation) {
        if let Err(error) = self.try_free(allocation) {
            fatal(error);
        }
    }

    /// A corrupted header is reported only after the block was given back, so
    /// the pool never keeps a block whose handle is gone.
    pub fn try_free(&mut self, allocation: Allocation) -> Result<()> {
        let started = self.stats.is_some().then(Instant::now);
        let ptr = allocation.ptr.as_ptr() as usize;

        if allocation.owner != self.id {
            return Err(PoolError::ForeignAllocation { ptr });
        }
        if !self.owns(&allocation) {
            return Err(PoolError::StaleAllocation { ptr });
        }

        let header = self.check_header(&allocation);
        match allocation.slot {
            Slot::Pooled { pool, block } => self.release_pooled(pool, block, &allocation),
            Slot::Large { block } => self.release_large(block),
        }

        if let Some(stats) = &mut self.stats {
            stats.record_free(allocation.tier, allocation.footprint, elapsed(started));
        }
        tracing::trace!(tier = ?allocation.tier, ptr = ?allocation.ptr, "freed");

        header
    }

    /// True when `allocation` was handed out by this pool and is still live.
    pub fn owns(&self, allocation: &Allocation) -> bool {
        if allocation.owner != self.id {
            return false;
        }

        match allocation.slot {
            Slot::Pooled { pool, block } => self
                .pools
                .get(pool)
                .and_then(|pool| pool.block(block))
                .is_some_and(|block| block.is_used() && block.stamp == allocation.stamp),
            Slot::Large { block } => self
                .large
                .get(block)
                .is_some_and(|block| block.stamp == allocation.stamp),
        }
    }

    /// Checks the header slot of a live allocation when debug guards are on
    /// and tags it as freed.
    fn check_header(&self, allocation: &Allocation) -> Result<()> {
        if !self.config.debug_guards {
            return Ok(());
        }

        // SAFETY: the allocation is live, its header slot is still ours.
        let found = unsafe {
            let found = block::read_tag(allocation.ptr);
            block::write_tag(allocation.ptr, FREED_TAG);
            found
        };

        if found != LIVE_TAG {
            return Err(PoolError::CorruptedHeader {
                ptr: allocation.ptr.as_ptr() as usize,
                found,
            });
        }
        Ok(())
    }

    fn release_pooled(&mut self, pool: NodeId, block: NodeId, allocation: &Allocation) {
        if self.config.debug_guards {
            // SAFETY: the payload is live and `usable_size` bytes long.
            unsafe { block::poison(allocation.ptr, allocation.usable_size) }
        }

        let owner = &mut self.pools[pool];
        let was_full = !owner.has_free();
        let table = owner.table();
        match table {
            TableId::Small(_) => owner.release_fixed(block),
            TableId::Medium => owner.release_coalescing(block),
        }

        let pool_table = table_of(&mut self.small_tables, &mut self.medium_table, table);
        if was_full {
            pool_table.reactivate(&mut self.pools, pool);
        }

        // A reset can leave any number of empty pools behind, so the whole
        // active list is checked on every release.
        if self.config.delete_unused_pools {
            pool_table.collect_empty(
                &mut self.pools,
                self.config.retained_empty_pools,
                &mut self.marked_for_release,
            );
            if !self.marked_for_release.is_empty() {
                self.release_marked(tier_of(table));
            }
        }
    }

    fn release_large(&mut self, block: NodeId) {
        self.large_allocations.remove(&mut self.large, block);
        let block = self.large.remove(block);
        let size = block.arena.size();
        block.arena.release(&mut self.backing);

        if let Some(stats) = &mut self.stats {
            stats.record_pool_released(Tier::Large, size);
        }
    }

    fn release_marked(&mut self, tier: Tier) {
        let mut marked = mem::take(&mut self.marked_for_release);

        for pool in marked.drain(..) {
            let size = pool.arena_size();
            pool.into_arena().release(&mut self.backing);

            tracing::debug!(memory_pool = self.id, ?tier, arena_size = size, "released pool");
            if let Some(stats) = &mut self.stats {
                stats.record_pool_released(tier, size);
            }
        }

        self.marked_for_release = marked;
    }

    /// Creates one pool for every small size class that has none with free
    /// blocks. Trades memory for fewer arena requests later on.
    #[track_caller]
    pub fn preallocate_pools(&mut self) {
        if let Err(error) = self.try_preallocate_pools() {
            fatal(error);
        }
    }

    pub fn try_preallocate_pools(&mut self) -> Result<()> {
        for class in 0..self.small_tables.len() {
            if !self.small_tables[class].has_active() {
                self.grow_small_table(class)?;
            }
        }

        tracing::debug!(memory_pool = self.id, pools = self.pools.len(), "preallocated small pools");
        Ok(())
    }

    /// Releases every small and medium allocation at once, keeping the
    /// arenas for reuse. Large allocations are not affected.
    ///
    /// Handles of the released allocations become stale: freeing one is an
    /// error and their memory will be handed out again.
    pub fn reset(&mut self) {
        for table in &mut self.small_tables {
            table.reset(&mut self.pools);
        }
        self.medium_table.reset(&mut self.pools);

        if let Some(stats) = &mut self.stats {
            stats.record_reset(Tier::Small);
            stats.record_reset(Tier::Medium);
        }
        tracing::debug!(memory_pool = self.id, pools = self.pools.len(), "reset memory pool");
    }

    /// Gives every arena back to the backing allocator.
    ///
    /// Panics if any allocation is still live, see [`MemoryPool::try_clear`].
    #[track_caller]
    pub fn clear(&mut self) {
        if let Err(error) = self.try_clear() {
            fatal(error);
        }
    }

    /// Gives every arena back to the backing allocator. Fails without
    /// touching anything if any allocation is still live.
    pub fn try_clear(&mut self) -> Result<()> {
        let outstanding = self.outstanding_allocations();
        if outstanding > 0 {
            return Err(PoolError::LeakedAllocations { outstanding });
        }

        let pools = self.pools.len();
        self.release_all();
        if let Some(stats) = &mut self.stats {
            stats.clear();
        }

        tracing::info!(memory_pool = self.id, pools, "cleared memory pool");
        Ok(())
    }

    fn release_all(&mut self) {
        for table in &mut self.small_tables {
            table.drain(&mut self.pools, &mut self.marked_for_release);
        }
        self.release_marked(Tier::Small);

        self.medium_table.drain(&mut self.pools, &mut self.marked_for_release);
        self.release_marked(Tier::Medium);

        while let Some(block) = self.large_allocations.pop_front(&mut self.large) {
            let block = self.large.remove(block);
            let size = block.arena.size();
            block.arena.release(&mut self.backing);

            if let Some(stats) = &mut self.stats {
                stats.record_pool_released(Tier::Large, size);
            }
        }
    }

    /// Number of live allocations over all tiers.
    pub fn outstanding_allocations(&self) -> usize {
        let small: usize = self
            .small_tables
            .iter()
            .map(|table| table.used_blocks(&self.pools))
            .sum();

        small + self.medium_table.used_blocks(&self.pools) + self.large_allocations.len()
    }

    /// Snapshot of the table serving small requests of `size` bytes, `None`
    /// when such a request is not served by a small table.
    pub fn small_table_stats(&self, size: u64) -> Option<TableStats> {
        if size == 0 || size > SMALL_MAX_SIZE {
            return None;
        }

        let class = self.index.class_index(align(size, DEFAULT_ALIGNMENT as u64));
        Some(self.small_tables[class].stats(&self.pools))
    }

    pub fn medium_table_stats(&self) -> TableStats {
        self.medium_table.stats(&self.pools)
    }

    pub fn large_allocation_count(&self) -> usize {
        self.large_allocations.len()
    }

    /// Number of small and medium pools currently held.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn backing(&self) -> &A {
        &self.backing
    }

    pub fn backing_mut(&mut self) -> &mut A {
        &mut self.backing
    }

    /// Current statistics, `None` unless the pool was configured with
    /// [`PoolConfig::collect_statistics`].
    pub fn collect_statistics(&self) -> Option<Statistics> {
        self.stats.as_ref().map(StatsCollector::snapshot)
    }

    /// Logs the current statistics at info level.
    pub fn report_statistics(&self) {
        match self.collect_statistics() {
            Some(stats) => tracing::info!(memory_pool = self.id, "memory pool statistics\n{stats}"),
            None => tracing::info!(memory_pool = self.id, "memory pool statistics are disabled"),
        }
    }
}

impl<A: BackingAllocator> Drop for MemoryPool<A> {
    fn drop(&mut self) {
        let outstanding = self.outstanding_allocations();
        if outstanding > 0 {
            tracing::warn!(
                memory_pool = self.id,
                outstanding,
                "memory pool dropped with outstanding allocations"
            );
        }

        self.release_all();
    }
}

impl<A: BackingAllocator> fmt::Debug for MemoryPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("pools", &self.pools.len())
            .field("large_allocations", &self.large_allocations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backing::CountingAllocator, table::TableKind};

    type CountingPool = MemoryPool<CountingAllocator>;

    fn counting_pool(config: PoolConfig) -> CountingPool {
        MemoryPool::with_config(config, CountingAllocator::new(SystemAllocator::new())).unwrap()
    }

    fn small_arenas_pool() -> CountingPool {
        counting_pool(PoolConfig::default().with_pages_per_pool(2))
    }

    #[test]
    fn routes_requests_by_size_and_alignment() {
        let mut pool = counting_pool(PoolConfig::default());

        let small = pool.allocate(100, 0);
        let medium = pool.allocate(40_000, 0);
        let large = pool.allocate(100_000, 0);
        let aligned = pool.allocate(64, 64);

        assert_eq!(small.tier(), Tier::Small);
        assert_eq!(medium.tier(), Tier::Medium);
        assert_eq!(large.tier(), Tier::Large);
        assert_eq!(aligned.tier(), Tier::Large);
        assert_eq!(aligned.as_ptr().as_ptr() as usize % 64, 0);
        assert_eq!(pool.large_allocation_count(), 2);

        for allocation in [small, medium, large, aligned] {
            pool.free(allocation);
        }
        assert_eq!(pool.outstanding_allocations(), 0);
        assert_eq!(pool.large_allocation_count(), 0);
    }

    #[test]
    fn small_alignments_use_default_alignment() {
        let mut pool = counting_pool(PoolConfig::default());

        for alignment in [1, 2, 4] {
            let allocation = pool.allocate(10, alignment);
            assert_eq!(allocation.tier(), Tier::Small);
            pool.free(allocation);
        }
    }

    #[test]
    fn usable_size_matches_size_class() {
        let mut pool = counting_pool(PoolConfig::default().with_debug_guards(false));

        for size in 1..=SMALL_MAX_SIZE {
            let allocation = pool.allocate(size, 0);
            assert_eq!(
                Some(allocation.usable_size()),
                crate::size_class::size_class_for(size),
                "size {size}"
            );
            pool.free(allocation);
        }
    }

    #[test]
    fn freed_block_is_handed_out_again() {
        let mut pool = counting_pool(PoolConfig::default());

        let keep = pool.allocate(64, 0);
        let p = pool.allocate(64, 0);
        let p_ptr = p.as_ptr();
        pool.free(p);

        let q = pool.allocate(64, 0);
        assert_eq!(q.as_ptr(), p_ptr);

        pool.free(q);
        pool.free(keep);
    }

    #[test]
    fn medium_blocks_coalesce_on_free() {
        let mut pool = counting_pool(PoolConfig::new(131_072));

        let a = pool.allocate(40_000, 0);
        let b = pool.allocate(40_000, 0);
        let c = pool.allocate(40_000, 0);
        let d = pool.allocate(40_000, 0);
        let a_ptr = a.as_ptr();

        pool.free(a);
        pool.free(c);
        assert_eq!(pool.medium_table_stats().free_blocks, 3);
        pool.free(b);

        let stats = pool.medium_table_stats();
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.used_blocks, 1);
        assert_eq!(stats.used_bytes + stats.free_bytes, stats.arena_bytes);

        // Served from the merged span of A, B and C.
        let merged = pool.allocate(120_000, 0);
        assert_eq!(merged.tier(), Tier::Medium);
        assert_eq!(merged.as_ptr(), a_ptr);
        assert_eq!(pool.medium_table_stats().pools(), 1);
        assert_eq!(pool.backing().allocations(), 1);

        pool.free(merged);
        pool.free(d);
        let stats = pool.medium_table_stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free_block, stats.arena_bytes);
    }

    #[test]
    fn medium_pools_fill_up_and_grow() {
        let mut pool = small_arenas_pool();

        // Arenas of 128 KiB hold two 60 000 byte blocks each.
        let blocks: Vec<_> = (0..4).map(|_| pool.allocate(60_000, 0)).collect();
        let stats = pool.medium_table_stats();
        assert_eq!(stats.kind, TableKind::Variable);
        assert_eq!(stats.pools(), 2);
        assert_eq!(stats.full_pools, 2);

        for allocation in blocks {
            pool.free(allocation);
        }

        let stats = pool.medium_table_stats();
        assert_eq!(stats.pools(), 1);
        assert_eq!(stats.empty_pools, 1);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn keeps_one_empty_pool_per_class() {
        let mut pool = small_arenas_pool();

        // 131072 / (32768 + 16) = 3 blocks per pool.
        let mut allocations: Vec<_> = (0..9).map(|_| pool.allocate(32_768, 0)).collect();
        assert_eq!(pool.small_table_stats(32_768).unwrap().pools(), 3);

        let last_pool: Vec<_> = allocations.split_off(6);
        for allocation in allocations {
            pool.free(allocation);
        }

        let stats = pool.small_table_stats(32_768).unwrap();
        assert_eq!(stats.pools(), 2);
        assert_eq!(stats.empty_pools, 1);
        assert_eq!(pool.backing().live_allocations(), 2);

        for allocation in last_pool {
            pool.free(allocation);
        }
        let stats = pool.small_table_stats(32_768).unwrap();
        assert_eq!(stats.pools(), 1);
        assert_eq!(stats.empty_pools, 1);
    }

    #[test]
    fn frees_after_reset_release_extra_empty_pools() {
        let mut pool = small_arenas_pool();

        let before: Vec<_> = (0..9).map(|_| pool.allocate(32_768, 0)).collect();
        pool.reset();
        drop(before);
        assert_eq!(pool.small_table_stats(32_768).unwrap().empty_pools, 3);

        let kept = pool.allocate(32_768, 0);
        let freed = pool.allocate(32_768, 0);
        pool.free(freed);

        let stats = pool.small_table_stats(32_768).unwrap();
        assert_eq!(stats.pools(), 2);
        assert_eq!(stats.empty_pools, 1);
        assert_eq!(pool.backing().live_allocations(), 2);

        pool.free(kept);
        assert_eq!(pool.small_table_stats(32_768).unwrap().pools(), 1);
    }

    #[test]
    fn retention_count_is_configurable() {
        let mut keep_all = counting_pool(
            PoolConfig::default().with_pages_per_pool(2).with_delete_unused_pools(false),
        );
        let mut keep_none = counting_pool(
            PoolConfig::default().with_pages_per_pool(2).with_retained_empty_pools(0),
        );

        for pool in [&mut keep_all, &mut keep_none] {
            let allocations: Vec<_> = (0..9).map(|_| pool.allocate(32_768, 0)).collect();
            for allocation in allocations {
                pool.free(allocation);
            }
        }

        assert_eq!(keep_all.small_table_stats(32_768).unwrap().pools(), 3);
        assert_eq!(keep_none.small_table_stats(32_768).unwrap().pools(), 0);
        assert_eq!(keep_none.backing().live_allocations(), 0);
    }

    #[test]
    fn reset_reuses_arenas() {
        let mut pool = small_arenas_pool();

        // 131072 / (64 + 16) = 1638 blocks per pool.
        let first: Vec<_> = (0..4000).map(|_| pool.allocate(64, 0)).collect();
        let medium: Vec<_> = (0..3).map(|_| pool.allocate(50_000, 0)).collect();
        let arenas = pool.backing().allocations();
        assert_eq!(pool.small_table_stats(64).unwrap().pools(), 3);

        pool.reset();
        assert_eq!(pool.outstanding_allocations(), 0);
        assert_eq!(pool.small_table_stats(64).unwrap().full_pools, 0);
        drop(first);
        drop(medium);

        let second: Vec<_> = (0..4000).map(|_| pool.allocate(64, 0)).collect();
        let medium: Vec<_> = (0..3).map(|_| pool.allocate(50_000, 0)).collect();
        assert_eq!(pool.backing().allocations(), arenas);

        for allocation in second.into_iter().chain(medium) {
            pool.free(allocation);
        }
        pool.clear();
        assert_eq!(pool.backing().live_allocations(), 0);
    }

    #[test]
    fn reset_without_allocations_changes_nothing() {
        let mut pool = counting_pool(PoolConfig::default());
        let allocation = pool.allocate(5_000, 0);
        let medium = pool.allocate(50_000, 0);
        pool.free(allocation);
        pool.free(medium);

        let small = pool.small_table_stats(5_000);
        let medium = pool.medium_table_stats();
        pool.reset();

        assert_eq!(pool.small_table_stats(5_000), small);
        assert_eq!(pool.medium_table_stats(), medium);
        assert_eq!(pool.backing().deallocations(), 0);
    }

    #[test]
    fn reset_leaves_large_allocations_alone() {
        let mut pool = counting_pool(PoolConfig::default());
        let large = pool.allocate(1 << 20, 0);

        pool.reset();
        assert_eq!(pool.outstanding_allocations(), 1);
        assert!(pool.owns(&large));

        pool.free(large);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut pool = counting_pool(PoolConfig::default());
        let allocation = pool.allocate(64, 0);

        pool.reset();
        assert!(!pool.owns(&allocation));
        assert!(matches!(
            pool.try_free(allocation),
            Err(PoolError::StaleAllocation { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "is no longer live")]
    fn freeing_after_reset_panics() {
        let mut pool: MemoryPool = MemoryPool::default();
        let allocation = pool.allocate(64, 0);

        pool.reset();
        pool.free(allocation);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut first = counting_pool(PoolConfig::default());
        let mut second = counting_pool(PoolConfig::default());
        let allocation = first.allocate(64, 0);
        let ptr = allocation.as_ptr().as_ptr() as usize;

        assert!(!second.owns(&allocation));
        let error = second.try_free(allocation).unwrap_err();
        assert!(matches!(error, PoolError::ForeignAllocation { ptr: found } if found == ptr));
        assert_eq!(first.outstanding_allocations(), 1);
    }

    #[test]
    fn header_overwrite_is_detected() {
        let mut pool = counting_pool(PoolConfig::default().with_debug_guards(true));
        let allocation = pool.allocate(64, 0);

        unsafe { allocation.as_ptr().sub(BLOCK_HEADER_SIZE as usize).write(0) };

        let error = pool.try_free(allocation).unwrap_err();
        assert!(matches!(error, PoolError::CorruptedHeader { .. }));

        // The block went back to the pool regardless.
        assert_eq!(pool.outstanding_allocations(), 0);
        assert!(pool.try_clear().is_ok());
        assert_eq!(pool.backing().live_allocations(), 0);
    }

    #[test]
    fn large_header_overwrite_still_releases_arena() {
        let mut pool = counting_pool(PoolConfig::default().with_debug_guards(true));
        let allocation = pool.allocate(1 << 20, 0);

        unsafe { allocation.as_ptr().sub(BLOCK_HEADER_SIZE as usize).write(0) };

        let error = pool.try_free(allocation).unwrap_err();
        assert!(matches!(error, PoolError::CorruptedHeader { .. }));
        assert_eq!(pool.large_allocation_count(), 0);
        assert_eq!(pool.backing().live_allocations(), 0);
    }

    #[test]
    fn freed_payload_is_poisoned() {
        let mut pool = counting_pool(PoolConfig::default().with_debug_guards(true));
        let keep = pool.allocate(64, 0);
        let mut allocation = pool.allocate(64, 0);
        unsafe { allocation.as_mut_slice().fill(7) };
        let ptr = allocation.as_ptr();

        pool.free(allocation);

        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|byte| *byte == block::POISON_BYTE));
        pool.free(keep);
    }

    #[test]
    fn clear_releases_every_arena() {
        let mut pool = counting_pool(PoolConfig::default());

        let allocations = vec![
            pool.allocate(16, 0),
            pool.allocate(3_000, 0),
            pool.allocate(60_000, 0),
            pool.allocate(70_000, 0),
        ];
        for allocation in allocations {
            pool.free(allocation);
        }
        assert!(pool.backing().live_allocations() > 0);

        pool.clear();
        assert_eq!(pool.pool_count(), 0);
        assert_eq!(pool.backing().live_allocations(), 0);
        assert_eq!(pool.backing().live_bytes(), 0);
    }

    #[test]
    fn try_clear_keeps_pool_intact_on_leak() {
        let mut pool = counting_pool(PoolConfig::default());
        let allocation = pool.allocate(128, 0);

        let error = pool.try_clear().unwrap_err();
        assert!(matches!(error, PoolError::LeakedAllocations { outstanding: 1 }));
        assert!(pool.owns(&allocation));

        pool.free(allocation);
        pool.clear();
    }

    #[test]
    #[should_panic(expected = "outstanding allocations")]
    fn clear_with_live_allocations_panics() {
        let mut pool: MemoryPool = MemoryPool::default();
        let _allocation = pool.allocate(128, 0);

        pool.clear();
    }

    #[test]
    #[should_panic(expected = "below the minimum page size")]
    fn tiny_medium_limit_panics() {
        let _ = MemoryPool::new(4096, SystemAllocator::new(), true);
    }

    #[test]
    fn invalid_requests_are_errors() {
        let mut pool = counting_pool(PoolConfig::default());

        assert!(matches!(pool.try_allocate(0, 0), Err(PoolError::ZeroSize)));
        assert!(matches!(
            pool.try_allocate(16, 12),
            Err(PoolError::InvalidAlignment { alignment: 12 })
        ));
        assert!(matches!(
            pool.try_allocate(u64::MAX, 0),
            Err(PoolError::SizeOverflow { .. })
        ));
        assert!(matches!(
            pool.try_allocate(u64::MAX - 64, 0),
            Err(PoolError::SizeOverflow { .. } | PoolError::OutOfMemory { .. })
        ));
        assert_eq!(pool.backing().live_allocations(), 0);
    }

    #[test]
    fn typed_helpers_respect_layout() {
        let mut pool = counting_pool(PoolConfig::default());

        let element = pool.allocate_element::<[u32; 5]>();
        assert_eq!(element.tier(), Tier::Small);
        assert_eq!(element.usable_size(), 32);

        let array = pool.allocate_array::<u64>(10);
        assert_eq!(array.tier(), Tier::Small);
        assert!(array.usable_size() >= 80);
        assert_eq!(array.cast::<u64>().as_ptr() as usize % mem::align_of::<u64>(), 0);

        let unit = pool.allocate_element::<()>();
        assert!(unit.usable_size() >= 1);

        unsafe {
            array.cast::<u64>().as_ptr().write(42);
            assert_eq!(array.cast::<u64>().as_ptr().read(), 42);
        }

        for allocation in [element, array, unit] {
            pool.free(allocation);
        }
    }

    #[test]
    fn word_aligned_elements_are_pooled() {
        let mut pool = counting_pool(PoolConfig::default());

        let first = pool.allocate_element::<u64>();
        let arenas = pool.backing().allocations();
        let mut elements: Vec<_> = (0..99).map(|_| pool.allocate_element::<u64>()).collect();
        elements.push(first);

        assert!(elements.iter().all(|element| element.tier() == Tier::Small));
        assert!(elements.iter().all(|element| element.as_ptr().as_ptr() as usize % 8 == 0));
        assert_eq!(pool.backing().allocations(), arenas);
        assert_eq!(pool.large_allocation_count(), 0);

        let pointers = pool.allocate_element::<(usize, *const u8)>();
        assert_eq!(pointers.tier(), Tier::Small);
        elements.push(pointers);

        for element in elements {
            pool.free(element);
        }
    }

    #[test]
    fn medium_payloads_are_16_byte_aligned() {
        let mut pool = counting_pool(PoolConfig::default());

        let mut allocations: Vec<_> = [40_001u64, 33_333, 50_007, 35_000]
            .into_iter()
            .map(|size| pool.allocate(size, 0))
            .collect();
        allocations.push(pool.allocate_array::<u128>(3_000));

        for allocation in &allocations {
            assert_eq!(allocation.tier(), Tier::Medium);
            assert_eq!(allocation.as_ptr().as_ptr() as usize % POOLED_ALIGNMENT as usize, 0);
        }
        for allocation in allocations {
            pool.free(allocation);
        }
    }

    #[test]
    fn over_aligned_types_take_large_path() {
        #[repr(align(32))]
        struct Wide([u8; 32]);

        let mut pool = counting_pool(PoolConfig::default());
        let wide = pool.allocate_element::<Wide>();

        assert_eq!(wide.tier(), Tier::Large);
        assert_eq!(wide.as_ptr().as_ptr() as usize % 32, 0);
        assert!(wide.usable_size() >= mem::size_of::<Wide>() as u64);
        pool.free(wide);
    }

    #[test]
    fn preallocate_creates_one_pool_per_class() {
        let mut pool = small_arenas_pool();

        pool.preallocate_pools();
        assert_eq!(pool.pool_count(), SIZE_CLASSES.len());

        let arenas = pool.backing().allocations();
        let allocation = pool.allocate(300, 0);
        assert_eq!(pool.backing().allocations(), arenas);

        pool.preallocate_pools();
        assert_eq!(pool.pool_count(), SIZE_CLASSES.len());

        pool.free(allocation);
    }

    #[test]
    fn statistics_follow_allocations() {
        let mut pool = counting_pool(PoolConfig::default().with_statistics(true));
        assert!(pool.collect_statistics().is_some());

        let small = pool.allocate(64, 0);
        let medium = pool.allocate(40_000, 0);
        let large = pool.allocate(200_000, 0);

        let stats = pool.collect_statistics().unwrap();
        assert_eq!(stats.small.live_allocations, 1);
        assert_eq!(stats.small.live_bytes, 64 + BLOCK_HEADER_SIZE);
        assert_eq!(stats.medium.live_bytes, 40_000 + BLOCK_HEADER_SIZE);
        assert_eq!(stats.large.pools, 1);
        assert_eq!(stats.small.pools, 1);
        assert_eq!(stats.live_allocations(), 3);

        pool.free(large);
        pool.reset();
        let stats = pool.collect_statistics().unwrap();
        assert_eq!(stats.live_allocations(), 0);
        assert_eq!(stats.large.pools, 0);
        assert_eq!(stats.medium.pools, 1);
        drop((small, medium));

        pool.report_statistics();
        pool.clear();
        assert_eq!(pool.collect_statistics().unwrap(), Statistics::default());
    }

    #[test]
    fn statistics_are_off_by_default() {
        let pool = counting_pool(PoolConfig::default());
        assert!(pool.collect_statistics().is_none());
    }

    #[test]
    fn drop_releases_outstanding_arenas() {
        let mut backing = CountingAllocator::new(SystemAllocator::new());
        {
            let mut pool = MemoryPool::new(MIN_PAGE_SIZE, &mut backing, true);
            let _small = pool.allocate(64, 0);
            let _large = pool.allocate(1 << 20, 0);
        }

        assert_eq!(backing.live_allocations(), 0);
        assert_eq!(backing.allocations(), 2);
    }

    #[test]
    fn pool_is_send() {
        fn assert_send<T: Send>() {}

        assert_send::<MemoryPool>();
        assert_send::<Allocation>();
    }
}
