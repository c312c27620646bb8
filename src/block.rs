use std::ptr::NonNull;

use crate::{backing::Arena, list::Span};

/// Bytes reserved in front of every payload. Small size classes are
/// multiples of 16, so with 16-byte aligned arenas every small payload stays
/// 16-byte aligned.
pub const BLOCK_HEADER_SIZE: u64 = 16;

/// Alignment every small and medium payload is placed at. Small classes are
/// multiples of it and medium blocks are rounded up to it.
pub const POOLED_ALIGNMENT: u64 = 16;

/// Tag written into the header slot of a live block when debug guards are on.
pub(crate) const LIVE_TAG: u64 = u64::from_le_bytes(*b"LIVE_BLK");
/// Tag written into the header slot of a freed block when debug guards are on.
pub(crate) const FREED_TAG: u64 = u64::from_le_bytes(*b"FREE_BLK");
/// Byte pattern freed payloads are overwritten with when debug guards are on.
pub const POISON_BYTE: u8 = 0xDD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    Free,
    Used,
}

/// This is the metadata of one block of a pool. It does not live inside the
/// arena: the arena only keeps a reserved header slot in front of each
/// payload, the metadata itself sits in the pool's block table.
///
/// ```text
/// arena
/// +--------+---------------------+--------+---------------------+----
/// | header |       payload       | header |       payload       | ...
/// +--------+---------------------+--------+---------------------+----
/// ^                              ^
/// offset                         offset + size
/// ```
///
/// `size` always includes the header slot, so a block spans
/// `[offset, offset + size)` and its usable size is `size - BLOCK_HEADER_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Block {
    /// Offset of the header slot from the start of the arena.
    pub offset: u64,
    /// Size of the block, header included.
    pub size: u64,
    /// Whether the block sits in the free or in the used list.
    pub state: BlockState,
    /// Stamp of the allocation currently holding the block. Only meaningful
    /// while the block is used.
    pub stamp: u64,
}

impl Block {
    pub fn free(offset: u64, size: u64) -> Self {
        debug_assert!(size >= BLOCK_HEADER_SIZE);
        Self {
            offset,
            size,
            state: BlockState::Free,
            stamp: 0,
        }
    }

    #[inline]
    pub fn usable_size(&self) -> u64 {
        self.size - BLOCK_HEADER_SIZE
    }

    #[inline]
    pub fn payload_offset(&self) -> u64 {
        self.offset + BLOCK_HEADER_SIZE
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.state == BlockState::Used
    }
}

impl Span for Block {
    #[inline]
    fn start(&self) -> u64 {
        self.offset
    }

    #[inline]
    fn size(&self) -> u64 {
        self.size
    }

    fn absorb(&mut self, next: Self) {
        debug_assert_eq!(self.end(), next.offset);
        self.size += next.size;
    }
}

/// A request too big or too strictly aligned for the pools. It owns an arena
/// of its own, obtained straight from the backing allocator.
pub(crate) struct LargeBlock {
    pub arena: Arena,
    /// Offset of the payload inside the arena. Never smaller than
    /// [`BLOCK_HEADER_SIZE`] and a multiple of the requested alignment.
    pub payload_offset: u64,
    pub stamp: u64,
}

impl LargeBlock {
    #[inline]
    pub fn usable_size(&self) -> u64 {
        self.arena.size() - self.payload_offset
    }

    #[inline]
    pub fn payload(&self) -> NonNull<u8> {
        self.arena.at(self.payload_offset)
    }
}

/// Writes `tag` into the header slot in front of `payload`.
///
/// **SAFETY**: `payload` must be a payload pointer handed out by a pool, so
/// that the [`BLOCK_HEADER_SIZE`] bytes before it belong to the same arena.
pub(crate) unsafe fn write_tag(payload: NonNull<u8>, tag: u64) {
    unsafe {
        let header = payload.sub(BLOCK_HEADER_SIZE as usize);
        header.cast::<u64>().as_ptr().write_unaligned(tag);
    }
}

/// Reads the tag stored in the header slot in front of `payload`.
///
/// **SAFETY**: same as [`write_tag`].
pub(crate) unsafe fn read_tag(payload: NonNull<u8>) -> u64 {
    unsafe {
        let header = payload.sub(BLOCK_HEADER_SIZE as usize);
        header.cast::<u64>().as_ptr().read_unaligned()
    }
}

/// Overwrites `len` payload bytes with [`POISON_BYTE`].
///
/// **SAFETY**: `payload..payload + len` must be writable memory owned by the
/// caller.
pub(crate) unsafe fn poison(payload: NonNull<u8>, len: u64) {
    unsafe { payload.as_ptr().write_bytes(POISON_BYTE, len as usize) }
}
