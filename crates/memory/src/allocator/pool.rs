//! Fixed-size block pool allocator
//!
//! The buffer is cut into `block_count` equal blocks. Every unallocated block
//! stores a [`FreeBlock`] node in its first bytes, chaining all free blocks
//! into an intrusive singly-linked list. Allocation pops the head and free
//! pushes the block back, both O(1). Blocks are never split or merged.
//!
//! # Memory Layout
//! ```text
//! | block 0 | block 1 | block 2 | ... | block n-1 |
//!   ^ head    ^ next    (allocated)
//! ```
//! Each block occupies `stride` bytes: the requested block size rounded up to
//! the block alignment.

use core::alloc::Layout;
use core::cell::Cell;
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

use super::stats::StatsCell;
use super::system::SYSTEM;
use super::{
    AllocError, AllocResult, Allocator, AllocatorStats, Region, StatisticsProvider,
    SystemAllocator, REGION_ALIGN,
};
use crate::core::{AllocatorConfig, MemoryUsage, Resettable};
use crate::utils::{align_up, validate_request};

/// Node in the free list
///
/// When a block is free, its first bytes hold a pointer to the next free
/// block.
#[repr(C)]
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// Pool of equally sized blocks with O(1) allocate and free
pub struct PoolAllocator<'a, B: Allocator + ?Sized = SystemAllocator> {
    region: Region<'a, B>,
    block_size: usize,
    block_align: usize,
    stride: usize,
    block_count: usize,
    free_head: Cell<Option<NonNull<FreeBlock>>>,
    free_count: Cell<usize>,
    config: AllocatorConfig,
    stats: StatsCell,
}

impl PoolAllocator<'static> {
    /// Creates a pool over a fresh system buffer
    pub fn with_blocks(
        block_size: usize,
        block_align: usize,
        block_count: usize,
    ) -> AllocResult<Self> {
        Self::new(&SYSTEM, block_size, block_align, block_count)
    }

    pub fn with_blocks_and_config(
        block_size: usize,
        block_align: usize,
        block_count: usize,
        config: AllocatorConfig,
    ) -> AllocResult<Self> {
        Self::with_config(&SYSTEM, block_size, block_align, block_count, config)
    }

    /// Creates a system-backed pool sized and aligned for `T`
    ///
    /// Types smaller than a free-list node get node-sized blocks.
    pub fn for_type<T>(block_count: usize) -> AllocResult<Self> {
        Self::for_type_in::<T>(&SYSTEM, block_count)
    }
}

impl<'a, B: Allocator + ?Sized> PoolAllocator<'a, B> {
    /// Creates a pool of `block_count` blocks drawn from `backing`
    pub fn new(
        backing: &'a B,
        block_size: usize,
        block_align: usize,
        block_count: usize,
    ) -> AllocResult<Self> {
        Self::with_config(
            backing,
            block_size,
            block_align,
            block_count,
            AllocatorConfig::default(),
        )
    }

    /// Creates a pool sized and aligned for `T`, drawn from `backing`
    pub fn for_type_in<T>(backing: &'a B, block_count: usize) -> AllocResult<Self> {
        let layout = Layout::new::<T>();
        let block_size = layout.size().max(size_of::<FreeBlock>());
        Self::new(backing, block_size, layout.align(), block_count)
    }

    /// Creates a pool with an explicit configuration
    ///
    /// # Errors
    /// `InvalidConfig` if the block size cannot hold a free-list node, the
    /// alignment is not a power of two, the count is zero, or the total size
    /// overflows.
    pub fn with_config(
        backing: &'a B,
        block_size: usize,
        block_align: usize,
        block_count: usize,
        config: AllocatorConfig,
    ) -> AllocResult<Self> {
        if block_size < size_of::<FreeBlock>() {
            return Err(AllocError::invalid_config(
                "pool block size is smaller than a free-list node",
            ));
        }
        if !block_align.is_power_of_two() {
            return Err(AllocError::invalid_config("pool block alignment must be a power of two"));
        }
        if block_count == 0 {
            return Err(AllocError::invalid_config("pool block count must be non-zero"));
        }

        let block_align = block_align.max(align_of::<FreeBlock>());
        let stride = align_up(block_size, block_align);
        let capacity = stride
            .checked_mul(block_count)
            .ok_or_else(|| AllocError::invalid_config("pool size overflows usize"))?;

        let region = Region::new(backing, capacity, block_align.max(REGION_ALIGN))?;

        #[cfg(feature = "logging")]
        debug!(
            allocator = "pool",
            block_size,
            block_align,
            block_count,
            capacity,
            backing = backing.name(),
            "created allocator"
        );

        let pool = Self {
            region,
            block_size,
            block_align,
            stride,
            block_count,
            free_head: Cell::new(None),
            free_count: Cell::new(0),
            config,
            stats: StatsCell::new(),
        };
        pool.link_all_blocks();
        Ok(pool)
    }

    /// Chains every block into the free list in ascending address order
    fn link_all_blocks(&self) {
        let mut next = None;
        for index in (0..self.block_count).rev() {
            // SAFETY: index * stride < capacity, and blocks are aligned for
            // FreeBlock because stride and the region start are multiples of
            // block_align >= align_of::<FreeBlock>()
            let node = unsafe { self.region.at(index * self.stride).cast::<FreeBlock>() };
            unsafe { node.write(FreeBlock { next }) };
            next = Some(node);
        }
        self.free_head.set(next);
        self.free_count.set(self.block_count);
    }

    /// Returns the usable size of each block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the alignment every block satisfies
    pub fn block_align(&self) -> usize {
        self.block_align
    }

    /// Distance between consecutive blocks
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Returns the total number of blocks in the pool
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Returns the total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Returns the number of allocated blocks
    pub fn allocated_blocks(&self) -> usize {
        self.block_count - self.free_count.get()
    }

    /// Returns the number of free blocks
    pub fn free_blocks(&self) -> usize {
        self.free_count.get()
    }

    /// Counts the nodes on the free list by walking it
    ///
    /// O(n); agrees with [`free_blocks`](Self::free_blocks) unless the buffer
    /// has been corrupted.
    pub fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.free_head.get();
        while let Some(node) = cursor {
            len += 1;
            // SAFETY: free-list nodes are written only by this allocator and
            // lie inside the region
            cursor = unsafe { node.as_ref().next };
        }
        len
    }

    pub fn is_full(&self) -> bool {
        self.free_head.get().is_none()
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Returns `LeakDetected` while blocks are outstanding
    pub fn check_leaks(&self) -> AllocResult<()> {
        match self.allocated_blocks() {
            0 => Ok(()),
            count => Err(AllocError::leak_detected(self.name(), count, count * self.block_size)),
        }
    }

    fn is_on_free_list(&self, block: NonNull<u8>) -> bool {
        let mut cursor = self.free_head.get();
        while let Some(node) = cursor {
            if node.cast::<u8>() == block {
                return true;
            }
            // SAFETY: see free_list_len
            cursor = unsafe { node.as_ref().next };
        }
        false
    }

    fn reject(&self, ptr: NonNull<u8>, reason: &str) -> AllocError {
        self.config
            .misuse(AllocError::invalid_free(self.name(), ptr.as_ptr() as usize, reason))
    }
}

unsafe impl<B: Allocator + ?Sized> Allocator for PoolAllocator<'_, B> {
    fn allocate(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        validate_request(size, align)?;

        if size > self.block_size {
            return Err(AllocError::exceeds_block_size(size, self.block_size));
        }
        if align > self.block_align {
            return Err(AllocError::unsupported_alignment(align, self.block_align));
        }

        let Some(head) = self.free_head.get() else {
            if self.config.track_stats {
                self.stats.record_failure();
            }
            return Err(AllocError::pool_exhausted(self.block_size, self.block_count));
        };

        // SAFETY: head is a node on the free list, inside the region
        let next = unsafe { head.as_ref().next };
        self.free_head.set(next);
        self.free_count.set(self.free_count.get() - 1);

        let block = head.cast::<u8>();
        if let Some(pattern) = self.config.alloc_pattern {
            // SAFETY: the block is now owned by the caller; block_size bytes
            // fit inside one stride
            unsafe { block.as_ptr().write_bytes(pattern, self.block_size) };
        }
        if self.config.track_stats {
            self.stats.record_allocation(self.block_size);
        }

        #[cfg(feature = "logging")]
        trace!(allocator = "pool", size, align, free = self.free_count.get(), "allocated");

        Ok(block)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        let Some(offset) = self.region.offset_of(ptr) else {
            return Err(self.reject(ptr, "address not owned by this allocator"));
        };
        if offset % self.stride != 0 {
            return Err(self.reject(ptr, "address is not at a block boundary"));
        }
        if self.free_count.get() == self.block_count {
            return Err(self.reject(ptr, "double free: every block is already free"));
        }
        if cfg!(debug_assertions) && self.is_on_free_list(ptr) {
            return Err(self.reject(ptr, "double free: block is already on the free list"));
        }

        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: the block lies inside the region and is dead; the node
            // written below overwrites the start of the pattern
            unsafe { ptr.as_ptr().write_bytes(pattern, self.block_size) };
        }

        let node = ptr.cast::<FreeBlock>();
        // SAFETY: ptr is a block boundary inside the region, aligned for
        // FreeBlock, and no longer in use by the caller
        unsafe {
            node.write(FreeBlock {
                next: self.free_head.get(),
            });
        }
        self.free_head.set(Some(node));
        self.free_count.set(self.free_count.get() + 1);

        if self.config.track_stats {
            self.stats.record_deallocation(self.block_size);
        }

        #[cfg(feature = "logging")]
        trace!(allocator = "pool", offset, free = self.free_count.get(), "freed");

        Ok(())
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(ptr)
    }

    fn address_range(&self) -> Option<Range<usize>> {
        Some(self.region.address_range())
    }

    fn name(&self) -> &'static str {
        "pool"
    }
}

impl<B: Allocator + ?Sized> Resettable for PoolAllocator<'_, B> {
    unsafe fn reset(&self) {
        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: the whole region is rewritten by link_all_blocks below
            unsafe { self.region.fill(0, self.capacity(), pattern) };
        }
        if self.config.track_stats {
            self.stats.record_release(
                self.allocated_blocks(),
                self.stats.snapshot().allocated_bytes,
            );
        }
        self.link_all_blocks();
    }
}

impl<B: Allocator + ?Sized> MemoryUsage for PoolAllocator<'_, B> {
    fn used_memory(&self) -> usize {
        self.allocated_blocks() * self.stride
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.free_blocks() * self.stride)
    }
}

impl<B: Allocator + ?Sized> StatisticsProvider for PoolAllocator<'_, B> {
    fn statistics(&self) -> AllocatorStats {
        self.stats.snapshot()
    }

    fn reset_statistics(&self) {
        self.stats.reset();
    }

    fn statistics_enabled(&self) -> bool {
        self.config.track_stats
    }
}

impl<B: Allocator + ?Sized> Drop for PoolAllocator<'_, B> {
    fn drop(&mut self) {
        let count = self.allocated_blocks();
        self.config
            .report_leaks_on_drop(self.name(), count, count * self.block_size);
    }
}

impl<B: Allocator + ?Sized> fmt::Debug for PoolAllocator<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("block_size", &self.block_size)
            .field("block_align", &self.block_align)
            .field("block_count", &self.block_count)
            .field("free", &self.free_count.get())
            .finish_non_exhaustive()
    }
}

// SAFETY: free-list pointers only refer to blocks of the owned region
unsafe impl<B: Allocator + Sync + ?Sized> Send for PoolAllocator<'_, B> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn production(block_size: usize, block_count: usize) -> PoolAllocator<'static> {
        PoolAllocator::with_blocks_and_config(
            block_size,
            8,
            block_count,
            AllocatorConfig::production(),
        )
        .expect("pool")
    }

    #[test]
    fn test_block_size_below_node_rejected() {
        let err =
            PoolAllocator::with_blocks(size_of::<FreeBlock>() - 1, 1, 4).expect_err("too small");
        assert_eq!(err.kind(), ErrorKind::ConstructionPrecondition);
        assert!(PoolAllocator::with_blocks(16, 8, 0).is_err());
        assert!(PoolAllocator::with_blocks(16, 3, 4).is_err());
    }

    #[test]
    fn test_blocks_come_out_in_address_order() {
        let pool = production(32, 4);
        let a = pool.allocate(32, 8).expect("a");
        let b = pool.allocate(32, 8).expect("b");
        assert_eq!(pool.region.offset_of(a), Some(0));
        assert_eq!(pool.region.offset_of(b), Some(32));
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let pool = production(16, 2);
        let a = pool.allocate(8, 8).expect("a");
        let _b = pool.allocate(8, 8).expect("b");
        let err = pool.allocate(8, 8).expect_err("exhausted");
        assert!(matches!(err, AllocError::PoolExhausted { block_count: 2, .. }));

        unsafe { pool.free(a) }.expect("free a");
        assert_eq!(pool.allocate(16, 8).expect("reuse"), a);
    }

    #[test]
    fn test_rejects_oversized_and_overaligned() {
        let pool = production(16, 2);
        assert!(matches!(
            pool.allocate(17, 8),
            Err(AllocError::ExceedsBlockSize { size: 17, block_size: 16 })
        ));
        assert!(matches!(
            pool.allocate(8, 64),
            Err(AllocError::UnsupportedAlignment { alignment: 64, .. })
        ));
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn test_misaligned_and_foreign_free() {
        let pool = production(32, 4);
        let a = pool.allocate(32, 8).expect("a");
        let inside = unsafe { a.add(8) };
        assert!(unsafe { pool.free(inside) }.expect_err("misaligned").is_invalid_free());

        let other = production(32, 1);
        let foreign = other.allocate(8, 8).expect("foreign");
        assert!(unsafe { pool.free(foreign) }.is_err());
        assert_eq!(pool.allocated_blocks(), 1);

        unsafe {
            pool.free(a).expect("free a");
            other.free(foreign).expect("free foreign");
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_double_free_detected() {
        let pool = production(16, 4);
        let a = pool.allocate(16, 8).expect("a");
        let _b = pool.allocate(16, 8).expect("b");
        unsafe { pool.free(a) }.expect("first free");
        let err = unsafe { pool.free(a) }.expect_err("double free");
        assert!(err.is_invalid_free());
        assert_eq!(pool.free_list_len(), 3);
    }

    #[test]
    fn test_for_type_and_reset() {
        let pool = PoolAllocator::for_type::<u8>(8).expect("pool");
        assert_eq!(pool.block_size(), size_of::<FreeBlock>());

        let pool = PoolAllocator::for_type::<[u64; 4]>(3).expect("pool");
        for _ in 0..3 {
            pool.allocate_layout(Layout::new::<[u64; 4]>()).expect("alloc");
        }
        assert!(pool.is_full());
        unsafe { pool.reset() };
        assert_eq!(pool.free_list_len(), 3);
        assert_eq!(pool.allocated_blocks(), 0);
    }

    #[test]
    fn test_stride_rounds_to_alignment() {
        let pool = PoolAllocator::with_blocks(24, 16, 4).expect("pool");
        assert_eq!(pool.stride(), 32);
        assert_eq!(pool.capacity(), 128);
    }
}
