//! Allocates a burst of temporaries every frame and drops them all at once
//! with `reset`, the way a game loop would.

use mempool::{MemoryPool, PoolConfig, SystemAllocator};

const FRAMES: u64 = 5;
const ALLOCATIONS_PER_FRAME: u64 = 10_000;

fn main() -> mempool::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = PoolConfig::default().with_statistics(true);
    let mut pool = MemoryPool::with_config(config, SystemAllocator::new())?;
    pool.preallocate_pools();

    for frame in 0..FRAMES {
        let mut persistent = None;

        for index in 0..ALLOCATIONS_PER_FRAME {
            let size = 16 + (index * 131 + frame * 7) % 50_000;
            let allocation = pool.try_allocate(size, 0)?;

            if index == 0 {
                persistent = Some(allocation);
            }
        }

        // Everything but large allocations goes away here.
        if let Some(allocation) = persistent.take() {
            pool.free(allocation);
        }
        pool.reset();

        println!(
            "frame {frame}: {} pools, {} outstanding",
            pool.pool_count(),
            pool.outstanding_allocations()
        );
    }

    pool.report_statistics();
    pool.try_clear()
}
