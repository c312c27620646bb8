//! Backs a memory pool with pages mapped straight from the kernel and counts
//! how often the pool goes back to it.

use mempool::{CountingAllocator, MemoryPool, PageAllocator, PoolConfig, page_size};

fn main() -> mempool::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Page size: {} bytes", page_size());

    let config = PoolConfig::default().with_pages_per_pool(4);
    let mut pool = MemoryPool::with_config(config, CountingAllocator::new(PageAllocator))?;

    let mut allocations = Vec::new();
    for size in [24u64, 24, 24, 3_000, 40_000, 40_000, 1 << 20] {
        allocations.push(pool.try_allocate(size, 0)?);
    }
    let aligned = pool.try_allocate(256, 4096)?;
    println!("Page aligned allocation at {:?}", aligned.as_ptr());
    allocations.push(aligned);

    let backing = pool.backing();
    println!(
        "{} mappings, {} bytes mapped, {} live allocations",
        backing.allocations(),
        backing.live_bytes(),
        pool.outstanding_allocations()
    );

    for allocation in allocations {
        pool.try_free(allocation)?;
    }
    pool.try_clear()?;

    let backing = pool.backing();
    println!(
        "After clear: {} unmapped, peak {} bytes",
        backing.deallocations(),
        backing.peak_bytes()
    );
    Ok(())
}
