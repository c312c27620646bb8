//! Error types of the memory pool.
use thiserror::Error;

/// Result type for memory pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Everything that can go wrong inside a [`crate::MemoryPool`].
///
/// The `try_*` operations hand these back to the caller. The plain
/// operations treat every one of them as a broken precondition and abort the
/// current thread with the error message.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The medium allocation limit is below the minimum page size
    #[error("medium allocation limit of {size} bytes is below the minimum page size of {min} bytes")]
    MediumLimitTooSmall {
        /// The configured limit
        size: u64,
        /// The smallest accepted limit
        min: u64,
    },

    /// A configuration value is out of range
    #[error("invalid memory pool configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration
        reason: String,
    },

    /// A configuration document could not be parsed
    #[error("failed to parse memory pool configuration")]
    ConfigParse(#[from] toml::de::Error),

    /// Zero byte allocations are not supported
    #[error("cannot allocate zero bytes")]
    ZeroSize,

    /// The requested alignment is not a power of two
    #[error("alignment {alignment} is not a power of two")]
    InvalidAlignment {
        /// The rejected alignment
        alignment: u32,
    },

    /// Rounding the request up to its alignment overflowed
    #[error("allocation of {size} bytes aligned to {alignment} overflows")]
    SizeOverflow {
        /// Requested size
        size: u64,
        /// Requested alignment
        alignment: u32,
    },

    /// The backing allocator could not provide an arena
    #[error("backing allocator failed to provide {size} bytes aligned to {alignment}")]
    OutOfMemory {
        /// Arena size that was requested
        size: u64,
        /// Arena alignment that was requested
        alignment: u32,
    },

    /// The allocation was handed out by another memory pool
    #[error("allocation {ptr:#x} does not belong to this memory pool")]
    ForeignAllocation {
        /// Payload address of the allocation
        ptr: usize,
    },

    /// The allocation was already released, by a reset or a clear
    #[error("allocation {ptr:#x} is no longer live in this memory pool")]
    StaleAllocation {
        /// Payload address of the allocation
        ptr: usize,
    },

    /// The header slot in front of the payload was overwritten
    #[error("header of allocation {ptr:#x} was overwritten (found tag {found:#018x})")]
    CorruptedHeader {
        /// Payload address of the allocation
        ptr: usize,
        /// Tag found in the header slot
        found: u64,
    },

    /// `clear` was called while allocations are still live
    #[error("cannot clear memory pool with {outstanding} outstanding allocations")]
    LeakedAllocations {
        /// Number of live allocations
        outstanding: usize,
    },
}

/// Logs `error` and panics with its message.
///
/// Used where the pool cannot continue safely: heap exhaustion, a foreign or
/// stale free, or a clear with live allocations.
#[cold]
#[track_caller]
pub(crate) fn fatal(error: PoolError) -> ! {
    tracing::error!(%error, "memory pool precondition violated");
    panic!("{error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_problem() {
        let error = PoolError::LeakedAllocations { outstanding: 3 };
        assert_eq!(
            error.to_string(),
            "cannot clear memory pool with 3 outstanding allocations"
        );

        let error = PoolError::StaleAllocation { ptr: 0x1000 };
        assert_eq!(
            error.to_string(),
            "allocation 0x1000 is no longer live in this memory pool"
        );
    }

    #[test]
    fn toml_errors_convert() {
        let parse_error = toml::from_str::<toml::Table>("medium_max_size = ").unwrap_err();
        let error = PoolError::from(parse_error);

        assert!(matches!(error, PoolError::ConfigParse(_)));
    }

    #[test]
    #[should_panic(expected = "cannot allocate zero bytes")]
    fn fatal_panics_with_message() {
        fatal(PoolError::ZeroSize);
    }
}
