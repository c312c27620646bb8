use crate::{
    block::{Block, BlockState},
    list::{List, NodeId, Nodes},
};

/// Linked list to keep track of the free [`Block`]s of a pool.
///
/// The list shares the block table of its pool with the used list, so
/// moving a block between the two is just relinking its node:
///
/// ```text
///                              Free List
///
///                  +----------------------------------+
///                  |                                  |
/// +-------+    +---|--+    +-------+    +-------+   +-|----+
/// | Block | -> | Free | -> | Block | -> | Block | ->| Free |
/// +-------+    +------+    +-------+    +-------+   +------+
/// ```
///
/// Fixed size pools use it as a LIFO stack, so the most recently freed block
/// is handed out first while its memory is still warm. Variable size pools
/// keep it in address order so neighbouring free blocks can be coalesced.
pub(crate) struct FreeList {
    /// Nodes of the list (indices into the pool's block table)
    items: List,
}

impl FreeList {
    /// Creates a new empty List
    pub const fn new() -> Self {
        Self { items: List::new() }
    }

    /// It tells whether the FreeList is empty or not.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Marks `block` free and puts it at the front of the list, it will be
    /// the next one [`FreeList::take_first`] returns.
    pub fn push(&mut self, blocks: &mut Nodes<Block>, block: NodeId) {
        blocks[block].state = BlockState::Free;
        self.items.push_front(blocks, block);
    }

    /// Marks `block` free and puts it at the back of the list.
    pub fn append(&mut self, blocks: &mut Nodes<Block>, block: NodeId) {
        blocks[block].state = BlockState::Free;
        self.items.push_back(blocks, block);
    }

    /// Marks `block` free and inserts it keeping the list in address order.
    pub fn insert_ordered(&mut self, blocks: &mut Nodes<Block>, block: NodeId) {
        blocks[block].state = BlockState::Free;
        self.items.priority_insert(blocks, block);
    }

    /// Detaches the first block of the list.
    pub fn take_first(&mut self, blocks: &mut Nodes<Block>) -> Option<NodeId> {
        self.items.pop_front(blocks)
    }

    /// Removes a `block` from the FreeList.
    pub fn remove(&mut self, blocks: &mut Nodes<Block>, block: NodeId) {
        self.items.remove(blocks, block);
    }

    /// Returns the first block on the [`FreeList`] that spans at least
    /// `needed` bytes, header included (first-fit).
    pub fn find_first_fit(&self, blocks: &Nodes<Block>, needed: u64) -> Option<NodeId> {
        self.items
            .iter(blocks)
            .find(|(_, block)| block.size >= needed)
            .map(|(id, _)| id)
    }

    /// Coalesces every run of address-adjacent free blocks into a single
    /// block. Returns how many blocks were absorbed.
    pub fn coalesce(&mut self, blocks: &mut Nodes<Block>) -> usize {
        self.items.merge(blocks)
    }

    /// Total size of the free blocks, headers included.
    pub fn bytes(&self, blocks: &Nodes<Block>) -> u64 {
        self.items.iter(blocks).map(|(_, block)| block.size).sum()
    }

    /// Size of the largest free block, header included.
    pub fn largest(&self, blocks: &Nodes<Block>) -> u64 {
        self.items
            .iter(blocks)
            .map(|(_, block)| block.size)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_list(spans: &[(u64, u64)]) -> (Nodes<Block>, FreeList) {
        let mut blocks = Nodes::new();
        let mut list = FreeList::new();

        for &(offset, size) in spans {
            let id = blocks.insert(Block::free(offset, size));
            list.insert_ordered(&mut blocks, id);
        }

        (blocks, list)
    }

    #[test]
    fn first_fit_returns_first_block_large_enough() {
        let (blocks, list) = free_list(&[(0, 64), (128, 256), (512, 1024)]);

        let found = list.find_first_fit(&blocks, 100).unwrap();
        assert_eq!(blocks[found].offset, 128);

        let found = list.find_first_fit(&blocks, 64).unwrap();
        assert_eq!(blocks[found].offset, 0);

        assert!(list.find_first_fit(&blocks, 2048).is_none());
    }

    #[test]
    fn push_is_lifo() {
        let mut blocks = Nodes::new();
        let mut list = FreeList::new();

        let a = blocks.insert(Block::free(0, 32));
        let b = blocks.insert(Block::free(32, 32));
        list.append(&mut blocks, a);
        list.push(&mut blocks, b);

        assert_eq!(list.take_first(&mut blocks), Some(b));
        assert_eq!(list.take_first(&mut blocks), Some(a));
        assert!(list.is_empty());
    }

    #[test]
    fn coalesce_merges_neighbours() {
        let (mut blocks, mut list) = free_list(&[(200, 100), (0, 100), (100, 100), (400, 50)]);

        assert_eq!(list.len(), 4);
        assert_eq!(list.coalesce(&mut blocks), 2);
        assert_eq!(list.len(), 2);
        assert_eq!(list.largest(&blocks), 300);
        assert_eq!(list.bytes(&blocks), 350);
    }

    #[test]
    fn inserted_blocks_are_marked_free() {
        let mut blocks = Nodes::new();
        let mut list = FreeList::new();

        let mut block = Block::free(0, 32);
        block.state = BlockState::Used;
        let id = blocks.insert(block);
        list.insert_ordered(&mut blocks, id);

        assert_eq!(blocks[id].state, BlockState::Free);
    }
}
