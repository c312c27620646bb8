//! Size classes for small allocations.
//!
//! Requests up to [`SMALL_MAX_SIZE`] bytes are rounded up to one of the
//! [`SIZE_CLASSES`]. Every class gets its own pool table of fixed size
//! blocks. The class of a request is found with a single table lookup
//! indexed by `(aligned_size >> 2) - 1`.

/// Alignment used when the caller asks for alignment `0`.
pub const DEFAULT_ALIGNMENT: u32 = 4;

/// Largest request served by the small size classes.
pub const SMALL_MAX_SIZE: u64 = 32_768;

/// Number of small size classes.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Block sizes of the small pool tables, ascending. Every class is a
/// multiple of 16 bytes.
pub const SIZE_CLASSES: [u64; 45] = [
    16, 32, 48, 64, 80, 96, 112, 128,
    160, 192, 224, 256, 288, 320, 384, 448,
    512, 576, 640, 704, 768, 896, 1024, 1168,
    1360, 1632, 2048, 2336, 2720, 3264, 4096, 4368,
    4672, 5040, 5456, 5952, 6544, 7280, 8192, 9360,
    10912, 13104, 16384, 21840, 32768,
];

const LOOKUP_LEN: usize = (SMALL_MAX_SIZE >> 2) as usize;

/// Lookup table from a small aligned size to the index of its size class.
pub(crate) struct SizeClassIndex {
    lookup: Box<[u16]>,
}

impl SizeClassIndex {
    pub fn new() -> Self {
        let mut lookup = vec![0u16; LOOKUP_LEN].into_boxed_slice();
        let mut class = 0;

        for (slot, entry) in lookup.iter_mut().enumerate() {
            let size = ((slot + 1) << 2) as u64;
            while SIZE_CLASSES[class] < size {
                class += 1;
            }
            *entry = class as u16;
        }

        Self { lookup }
    }

    /// Index of the smallest class that holds `aligned_size` bytes.
    /// `aligned_size` must be a non zero multiple of [`DEFAULT_ALIGNMENT`]
    /// no larger than [`SMALL_MAX_SIZE`].
    #[inline]
    pub fn class_index(&self, aligned_size: u64) -> usize {
        debug_assert!(aligned_size > 0 && aligned_size <= SMALL_MAX_SIZE);
        debug_assert_eq!(aligned_size % DEFAULT_ALIGNMENT as u64, 0);

        self.lookup[((aligned_size >> 2) - 1) as usize] as usize
    }
}

/// Block size a small request of `size` bytes ends up with, or `None` when
/// the request is not served by the small size classes.
pub fn size_class_for(size: u64) -> Option<u64> {
    if size == 0 || size > SMALL_MAX_SIZE {
        return None;
    }

    SIZE_CLASSES.iter().copied().find(|class| *class >= size)
}
