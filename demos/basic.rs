use mempool::{Allocation, MemoryPool};

fn log_alloc(size: u64, allocation: &Allocation) {
    println!("Requested {size} bytes of memory");
    println!(
        "Received {:?} ({:?}, {} usable bytes)",
        allocation.as_ptr(),
        allocation.tier(),
        allocation.usable_size()
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut pool: MemoryPool = MemoryPool::default();

    let sizes = [8u64, 100, 40_000, 500_000];
    let allocations: Vec<_> = sizes
        .iter()
        .map(|&size| {
            let allocation = pool.allocate(size, 0);
            log_alloc(size, &allocation);
            allocation
        })
        .collect();

    let value = pool.allocate_element::<u32>();
    unsafe {
        value.cast::<u32>().as_ptr().write(23);
        println!("Stored {} at {:?}", value.cast::<u32>().as_ptr().read(), value.as_ptr());
    }
    pool.free(value);

    // A freed small block is handed out again for the next request of its class.
    let first = pool.allocate(64, 0);
    let ptr = first.as_ptr();
    pool.free(first);
    let second = pool.allocate(64, 0);
    println!("Reused freed block: {}", second.as_ptr() == ptr);
    pool.free(second);

    for allocation in allocations {
        pool.free(allocation);
    }
    pool.clear();
}
