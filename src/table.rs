//! Pool tables: the groups of pools that serve one kind of request.

use crate::{
    list::{Link, List, NodeId, Nodes},
    pool::Pool,
};

/// Identifies the table a pool belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableId {
    /// Small size class, by index into [`crate::size_class::SIZE_CLASSES`].
    Small(u16),
    /// The medium table.
    Medium,
}

/// How the pools of a table hand out memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Every block of every pool has the same payload size.
    Fixed {
        /// Payload size of the blocks
        class_size: u64,
    },
    /// Blocks are split off a pool on demand and merged back when released.
    Variable,
}

/// Snapshot of one pool table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub kind: TableKind,
    /// Pools with at least one free block.
    pub active_pools: usize,
    /// Pools without free blocks.
    pub full_pools: usize,
    /// Pools with no block in use.
    pub empty_pools: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Bytes held by used blocks, headers included.
    pub used_bytes: u64,
    /// Bytes covered by free blocks, headers included.
    pub free_bytes: u64,
    /// Largest free block of any pool, header included.
    pub largest_free_block: u64,
    /// Total arena bytes of the table.
    pub arena_bytes: u64,
}

impl TableStats {
    #[inline]
    pub fn pools(&self) -> usize {
        self.active_pools + self.full_pools
    }
}

/// A group of pools sharing a [`TableKind`].
///
/// Each pool is in exactly one of the two lists: `active` while it still
/// has free blocks, `full` once it runs out of them.
pub(crate) struct PoolTable {
    kind: TableKind,
    active: List,
    full: List,
}

impl PoolTable {
    pub const fn fixed(class_size: u64) -> Self {
        Self {
            kind: TableKind::Fixed { class_size },
            active: List::new(),
            full: List::new(),
        }
    }

    pub const fn variable() -> Self {
        Self {
            kind: TableKind::Variable,
            active: List::new(),
            full: List::new(),
        }
    }

    #[inline]
    pub fn first_active(&self) -> Link {
        self.active.first()
    }

    #[inline]
    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Adds a freshly created pool to the active list.
    pub fn insert(&mut self, pools: &mut Nodes<Pool>, pool: NodeId) {
        self.active.push_back(pools, pool);
    }

    /// Moves `pool` from the active to the full list once its free list ran
    /// dry.
    pub fn retire(&mut self, pools: &mut Nodes<Pool>, pool: NodeId) {
        debug_assert!(!pools[pool].has_free());
        self.active.remove(pools, pool);
        self.full.push_back(pools, pool);
    }

    /// Moves `pool` from the full back to the active list. Must be called
    /// right after the first block of a full pool was released.
    pub fn reactivate(&mut self, pools: &mut Nodes<Pool>, pool: NodeId) {
        self.full.remove(pools, pool);
        self.active.push_back(pools, pool);
    }

    /// Detaches the pools of the active list that have no used block,
    /// except for the first `retain` of them, and pushes them to `marked`.
    pub fn collect_empty(&mut self, pools: &mut Nodes<Pool>, retain: usize, marked: &mut Vec<Pool>) {
        let mut kept = 0;
        let mut current = self.active.first();

        while let Some(pool) = current {
            if !pools[pool].is_unused() {
                current = pools.node(pool).next;
                continue;
            }

            if kept < retain {
                kept += 1;
                current = pools.node(pool).next;
                continue;
            }

            current = self.active.remove(pools, pool);
            marked.push(pools.remove(pool));
        }
    }

    /// Releases every block of every pool, all pools end up active.
    pub fn reset(&mut self, pools: &mut Nodes<Pool>) {
        let coalesce = self.kind == TableKind::Variable;

        self.active.append(pools, &mut self.full);

        let mut current = self.active.first();
        while let Some(pool) = current {
            pools[pool].reset(coalesce);
            current = pools.node(pool).next;
        }
    }

    /// Detaches every pool of the table and pushes it to `marked`.
    pub fn drain(&mut self, pools: &mut Nodes<Pool>, marked: &mut Vec<Pool>) {
        self.active.append(pools, &mut self.full);

        while let Some(pool) = self.active.pop_front(pools) {
            marked.push(pools.remove(pool));
        }
    }

    /// Number of used blocks over all pools of the table.
    pub fn used_blocks(&self, pools: &Nodes<Pool>) -> usize {
        self.pools(pools).map(|pool| pool.used_blocks()).sum()
    }

    fn pools<'a>(&self, pools: &'a Nodes<Pool>) -> impl Iterator<Item = &'a Pool> {
        self.active
            .iter(pools)
            .chain(self.full.iter(pools))
            .map(|(_, pool)| pool)
    }

    pub fn stats(&self, pools: &Nodes<Pool>) -> TableStats {
        let mut stats = TableStats {
            kind: self.kind,
            active_pools: self.active.len(),
            full_pools: self.full.len(),
            empty_pools: 0,
            used_blocks: 0,
            free_blocks: 0,
            used_bytes: 0,
            free_bytes: 0,
            largest_free_block: 0,
            arena_bytes: 0,
        };

        for pool in self.pools(pools) {
            stats.empty_pools += usize::from(pool.is_unused());
            stats.used_blocks += pool.used_blocks();
            stats.free_blocks += pool.free_blocks();
            stats.used_bytes += pool.used_bytes();
            stats.free_bytes += pool.free_bytes();
            stats.largest_free_block = stats.largest_free_block.max(pool.largest_free_block());
            stats.arena_bytes += pool.arena_size();
        }

        stats
    }
}
