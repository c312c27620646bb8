//! Size rounding shared by the pools, the large path and the page allocator.

/// It aligns `to_be_aligned` using `alignment`, which must be a power of two.
///
/// This is used to round request sizes up to the requested alignment, large
/// allocation headers up to the payload alignment and page allocator requests
/// up to [`crate::backing::page_size`].
#[inline]
pub fn align(to_be_aligned: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of overflowing.
#[inline]
pub fn checked_align(to_be_aligned: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    to_be_aligned
        .checked_add(alignment - 1)
        .map(|value| value & !(alignment - 1))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_default_size() {
        let alignments = vec![(1..4, 4), (5..8, 8), (9..12, 12), (13..16, 16)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, 4));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let alignments = vec![(1..4096, 4096), (4097..8192, 8192)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, 4096))
            }
        }
    }

    #[test]
    fn checked_align_detects_overflow() {
        assert_eq!(Some(64), checked_align(33, 32));
        assert_eq!(None, checked_align(u64::MAX - 2, 16));
        assert_eq!(Some(u64::MAX - 15), checked_align(u64::MAX - 15, 16));
    }
}
