use std::ptr::NonNull;

use crate::{
    backing::Arena,
    block::{Block, BlockState},
    freelist::FreeList,
    list::{List, NodeId, Nodes},
    table::TableId,
};

/// One contiguous arena carved into [`Block`]s.
///
/// Every block of the arena is either in the `used` list or in the `free`
/// list, so the sizes of both lists always add up to the arena size:
///
/// ```text
/// +-------------------------------------------------------------+
/// | +-------+ +------+ +-------+ +-------+ +------------------+ |
/// | | Block | | Free | | Block | | Block | |       Free       | |
/// | +-------+ +------+ +-------+ +-------+ +------------------+ |
/// +-------------------------------------------------------------+
/// ```
///
/// Fixed pools (small size classes) are carved once into same sized blocks
/// that are never split. Variable pools (medium table) start as a single
/// free block spanning the arena that gets split on allocation and merged
/// back on release.
pub(crate) struct Pool {
    /// Table this pool belongs to
    table: TableId,
    arena: Arena,
    /// Bytes held by used blocks, headers included
    used_bytes: u64,
    /// Side table with the metadata of every block of the arena
    blocks: Nodes<Block>,
    used: List,
    free: FreeList,
}

impl Pool {
    /// Carves `arena` into as many blocks of `class_size` payload bytes as
    /// fit, all of them free and in address order.
    pub fn with_fixed_blocks(table: TableId, class_size: u64, arena: Arena) -> Self {
        let stride = class_size + crate::block::BLOCK_HEADER_SIZE;
        let count = (arena.size() / stride) as usize;

        let mut blocks = Nodes::with_capacity(count);
        let mut free = FreeList::new();

        for index in 0..count as u64 {
            let block = blocks.insert(Block::free(index * stride, stride));
            free.append(&mut blocks, block);
        }

        Self {
            table,
            arena,
            used_bytes: 0,
            blocks,
            used: List::new(),
            free,
        }
    }

    /// Turns the whole `arena` into a single free block.
    pub fn with_single_block(table: TableId, arena: Arena) -> Self {
        let mut blocks = Nodes::new();
        let mut free = FreeList::new();

        let block = blocks.insert(Block::free(0, arena.size()));
        free.append(&mut blocks, block);

        Self {
            table,
            arena,
            used_bytes: 0,
            blocks,
            used: List::new(),
            free,
        }
    }

    #[inline]
    pub fn table(&self) -> TableId {
        self.table
    }

    #[inline]
    pub fn arena_size(&self) -> u64 {
        self.arena.size()
    }

    #[inline]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    #[inline]
    pub fn used_blocks(&self) -> usize {
        self.used.len()
    }

    #[inline]
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    /// True when the pool has at least one free block.
    #[inline]
    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    /// True when no block of the pool is in use.
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.used.is_empty()
    }

    #[inline]
    pub fn block(&self, block: NodeId) -> Option<&Block> {
        self.blocks.get(block)
    }

    /// Metadata of a block known to exist.
    #[inline]
    pub fn block_at(&self, block: NodeId) -> &Block {
        &self.blocks[block]
    }

    /// Pointer to the first payload byte of `block`.
    #[inline]
    pub fn payload(&self, block: NodeId) -> NonNull<u8> {
        self.arena.at(self.blocks[block].payload_offset())
    }

    /// Gives the arena back so it can be released.
    pub fn into_arena(self) -> Arena {
        self.arena
    }

    fn mark_used(&mut self, block: NodeId, stamp: u64) {
        let data = &mut self.blocks[block];
        data.state = BlockState::Used;
        data.stamp = stamp;
        self.used_bytes += data.size;
    }

    /// Hands out the first free block of a fixed pool.
    pub fn take_fixed(&mut self, stamp: u64) -> Option<NodeId> {
        let block = self.free.take_first(&mut self.blocks)?;

        self.mark_used(block, stamp);
        self.used.push_back(&mut self.blocks, block);

        Some(block)
    }

    /// Hands out the first free block spanning at least `needed` bytes,
    /// header included. When more than `split_above` bytes would be left
    /// over, the block is shrunk to `needed` bytes and the rest goes back to
    /// the free list as a new block.
    pub fn take_first_fit(&mut self, needed: u64, split_above: u64, stamp: u64) -> Option<NodeId> {
        let block = self.free.find_first_fit(&self.blocks, needed)?;
        self.free.remove(&mut self.blocks, block);

        let remainder = self.blocks[block].size - needed;
        if remainder > split_above {
            let data = &mut self.blocks[block];
            data.size = needed;
            let rest = Block::free(data.offset + needed, remainder);

            let rest = self.blocks.insert(rest);
            self.free.insert_ordered(&mut self.blocks, rest);
        }

        self.mark_used(block, stamp);
        self.used.priority_insert(&mut self.blocks, block);

        Some(block)
    }

    fn unmark_used(&mut self, block: NodeId) {
        self.used.remove(&mut self.blocks, block);
        let size = self.blocks[block].size;
        debug_assert!(self.used_bytes >= size);
        self.used_bytes -= size;
    }

    /// Returns a block of a fixed pool to the front of the free list.
    pub fn release_fixed(&mut self, block: NodeId) {
        self.unmark_used(block);
        self.free.push(&mut self.blocks, block);
    }

    /// Returns a block of a variable pool to the free list in address order
    /// and merges it with its free neighbours.
    pub fn release_coalescing(&mut self, block: NodeId) {
        self.unmark_used(block);
        self.free.insert_ordered(&mut self.blocks, block);
        self.free.coalesce(&mut self.blocks);
    }

    /// Moves every used block back to the free list. With `coalesce` the
    /// free list is rebuilt in address order and fully merged.
    pub fn reset(&mut self, coalesce: bool) {
        while let Some(block) = self.used.pop_front(&mut self.blocks) {
            if coalesce {
                self.free.insert_ordered(&mut self.blocks, block);
            } else {
                self.free.push(&mut self.blocks, block);
            }
        }

        if coalesce {
            self.free.coalesce(&mut self.blocks);
        }
        self.used_bytes = 0;
    }

    /// Bytes covered by the free blocks, headers included.
    pub fn free_bytes(&self) -> u64 {
        self.free.bytes(&self.blocks)
    }

    /// Largest free block, header included.
    pub fn largest_free_block(&self) -> u64 {
        self.free.largest(&self.blocks)
    }
}
