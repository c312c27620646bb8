//! Backing allocators: where the pools get their arenas from.

use std::{alloc::Layout, ptr::NonNull};

use crate::error::PoolError;

/// Raw memory source of a [`crate::MemoryPool`].
///
/// The pool asks for whole arenas through this trait and gives them back
/// with the exact same `size` and `alignment` once it is done with them.
/// Implementations carry whatever state they need themselves.
pub trait BackingAllocator {
    /// Requests `size` bytes aligned to `alignment` (a power of two).
    /// Returns `None` when the memory cannot be provided.
    fn allocate(&mut self, size: u64, alignment: u32) -> Option<NonNull<u8>>;

    /// Returns memory obtained from [`BackingAllocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from a call to `allocate` on this same allocator with
    /// the same `size` and `alignment`, and must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: u64, alignment: u32);
}

impl<A: BackingAllocator + ?Sized> BackingAllocator for Box<A> {
    fn allocate(&mut self, size: u64, alignment: u32) -> Option<NonNull<u8>> {
        (**self).allocate(size, alignment)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: u64, alignment: u32) {
        unsafe { (**self).deallocate(ptr, size, alignment) }
    }
}

impl<A: BackingAllocator + ?Sized> BackingAllocator for &mut A {
    fn allocate(&mut self, size: u64, alignment: u32) -> Option<NonNull<u8>> {
        (**self).allocate(size, alignment)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: u64, alignment: u32) {
        unsafe { (**self).deallocate(ptr, size, alignment) }
    }
}

/// Byte fresh system allocations are filled with in debug builds, so reads
/// of uninitialised pool memory stand out.
pub const UNINIT_FILL: u8 = b'X';

/// Process heap allocator, the default backing allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemAllocator {
    fill: Option<u8>,
}

impl SystemAllocator {
    /// Fills fresh memory with [`UNINIT_FILL`] in debug builds only.
    pub const fn new() -> Self {
        Self {
            fill: if cfg!(debug_assertions) {
                Some(UNINIT_FILL)
            } else {
                None
            },
        }
    }

    /// Fills fresh memory with `fill`, or leaves it untouched with `None`.
    pub const fn with_fill(fill: Option<u8>) -> Self {
        Self { fill }
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn heap_layout(size: u64, alignment: u32) -> Option<Layout> {
    // Zero sized layouts are not allowed by the global allocator.
    let size = usize::try_from(size).ok()?.max(1);
    Layout::from_size_align(size, alignment.max(1) as usize).ok()
}

impl BackingAllocator for SystemAllocator {
    fn allocate(&mut self, size: u64, alignment: u32) -> Option<NonNull<u8>> {
        let layout = heap_layout(size, alignment)?;

        unsafe {
            let ptr = NonNull::new(std::alloc::alloc(layout))?;
            if let Some(byte) = self.fill {
                ptr.as_ptr().write_bytes(byte, layout.size());
            }

            Some(ptr)
        }
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: u64, alignment: u32) {
        if let Some(layout) = heap_layout(size, alignment) {
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
        }
    }
}

/// Allocator that maps whole pages straight from the kernel, bypassing the
/// process heap. Sizes are rounded up to [`page_size`] and alignments larger
/// than a page are refused.
#[cfg(any(unix, windows))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocator;

/// Page mapping syscalls of the host kernel.
#[cfg(any(unix, windows))]
trait PlatformMemory {
    /// Maps `len` bytes of zeroed, read-write pages. `len` is a multiple of
    /// the page size.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Unmaps `len` bytes mapped by `request_memory` at `addr`.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    unsafe fn page_size() -> usize;
}

/// Virtual memory page size of the computer. This is usually 4096.
#[cfg(any(unix, windows))]
pub fn page_size() -> usize {
    static PAGE_SIZE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();

    *PAGE_SIZE.get_or_init(|| unsafe { PageAllocator::page_size() })
}

#[cfg(any(unix, windows))]
fn page_span(size: u64) -> Option<usize> {
    let page = page_size() as u64;
    crate::utils::checked_align(size.max(1), page).and_then(|len| usize::try_from(len).ok())
}

#[cfg(any(unix, windows))]
impl BackingAllocator for PageAllocator {
    fn allocate(&mut self, size: u64, alignment: u32) -> Option<NonNull<u8>> {
        if alignment as usize > page_size() {
            return None;
        }

        let len = page_span(size)?;
        unsafe { Self::request_memory(len) }
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: u64, _alignment: u32) {
        if let Some(len) = page_span(size) {
            unsafe { Self::return_memory(ptr.as_ptr(), len) }
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::{PageAllocator, PlatformMemory};

    use std::{os::raw::c_void, ptr::NonNull};

    impl PlatformMemory for PageAllocator {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let addr = unsafe { libc::mmap(std::ptr::null_mut(), len, protection, flags, -1, 0) };
            if addr == libc::MAP_FAILED {
                return None;
            }

            NonNull::new(addr.cast::<u8>())
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            let result = unsafe { libc::munmap(addr.cast::<c_void>(), len) };
            debug_assert_eq!(result, 0, "munmap of {len} bytes failed");
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull, os::raw::c_void};

    use super::{PageAllocator, PlatformMemory};

    use ::windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for PageAllocator {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let addr = unsafe { Memory::VirtualAlloc(None, len, flags, Memory::PAGE_READWRITE) };

            NonNull::new(addr.cast())
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            // MEM_RELEASE frees the whole reservation and wants a zero size.
            let result = unsafe { Memory::VirtualFree(addr.cast::<c_void>(), 0, Memory::MEM_RELEASE) };
            debug_assert!(result.is_ok());
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

/// Wrapper that keeps count of the arenas flowing through another backing
/// allocator. Handy to observe when a pool grows or gives memory back.
#[derive(Debug, Default)]
pub struct CountingAllocator<A = SystemAllocator> {
    inner: A,
    allocations: u64,
    deallocations: u64,
    live_bytes: u64,
    peak_bytes: u64,
}

impl<A: BackingAllocator> CountingAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allocations: 0,
            deallocations: 0,
            live_bytes: 0,
            peak_bytes: 0,
        }
    }

    /// Number of successful `allocate` calls so far.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Number of `deallocate` calls so far.
    pub fn deallocations(&self) -> u64 {
        self.deallocations
    }

    /// Memory handed out and not returned yet.
    pub fn live_allocations(&self) -> u64 {
        self.allocations - self.deallocations
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Highest value [`CountingAllocator::live_bytes`] ever reached.
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn into_inner(self) -> A {
        self.inner
    }
}

impl<A: BackingAllocator> BackingAllocator for CountingAllocator<A> {
    fn allocate(&mut self, size: u64, alignment: u32) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocate(size, alignment)?;

        self.allocations += 1;
        self.live_bytes += size;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);

        Some(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: u64, alignment: u32) {
        self.deallocations += 1;
        self.live_bytes -= size;

        unsafe { self.inner.deallocate(ptr, size, alignment) }
    }
}

/// One contiguous chunk of memory obtained from a [`BackingAllocator`].
///
/// Arenas are not released on drop: the owner has to hand them back with
/// [`Arena::release`] to the allocator they came from.
pub(crate) struct Arena {
    ptr: NonNull<u8>,
    size: u64,
    alignment: u32,
}

impl Arena {
    pub(crate) fn acquire<A: BackingAllocator + ?Sized>(
        backing: &mut A,
        size: u64,
        alignment: u32,
    ) -> Result<Self, PoolError> {
        let ptr = backing
            .allocate(size, alignment)
            .ok_or(PoolError::OutOfMemory { size, alignment })?;

        Ok(Self { ptr, size, alignment })
    }

    /// Gives the arena back to `backing`, which must be the allocator it was
    /// acquired from.
    pub(crate) fn release<A: BackingAllocator + ?Sized>(self, backing: &mut A) {
        // SAFETY: arenas are only built by `acquire` and released once, by
        // value, to the allocator owned by the same memory pool.
        unsafe { backing.deallocate(self.ptr, self.size, self.alignment) }
    }

    #[inline]
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Pointer to the byte `offset` bytes into the arena.
    #[inline]
    pub(crate) fn at(&self, offset: u64) -> NonNull<u8> {
        debug_assert!(offset <= self.size);
        unsafe { self.ptr.add(offset as usize) }
    }
}
