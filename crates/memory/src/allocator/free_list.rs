//! General-purpose free-list allocator
//!
//! Variable-size allocations over one fixed buffer. Free space is tracked by
//! a doubly-linked list of [`FreeBlock`] nodes stored inside the free spans
//! themselves and kept sorted by address, so a freed block only has to look
//! at its two list neighbours to coalesce.
//!
//! # Algorithm
//!
//! - **Allocation**: first fit. The first free block that can hold the header,
//!   the alignment padding and the payload is taken. Leftover space at its end
//!   becomes a new free block if it can hold one, otherwise it is absorbed
//!   into the allocation.
//! - **Deallocation**: the header in front of the payload gives back the full
//!   span. The span is inserted at its sorted position and merged with an
//!   address-adjacent predecessor and successor.
//!
//! # Memory Layout
//!
//! ```text
//! Allocated span:
//! | padding | AllocationHeader { padding, size } | payload (size bytes) |
//! ^ span start                                  ^ returned pointer
//!
//! Free span:
//! | FreeBlock { size, prev, next } | unused ... |
//! ```
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) in the number of free blocks
//! - **Deallocation**: O(n) for the sorted insert, O(1) coalescing

use core::cell::Cell;
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

use super::stats::StatsCell;
use super::system::SYSTEM;
use super::{
    AllocError, AllocResult, Allocator, AllocatorStats, FragmentationStats, Region,
    StatisticsProvider, SystemAllocator, REGION_ALIGN,
};
use crate::core::{AllocatorConfig, MemoryUsage, Resettable};
use crate::utils::{align_up, alignment_adjustment, validate_request};

type Link = Option<NonNull<FreeBlock>>;

/// Node stored at the start of every free span
#[repr(C)]
#[derive(Clone, Copy)]
struct FreeBlock {
    /// Size of the whole span, this node included
    size: usize,
    prev: Link,
    next: Link,
}

/// Written directly in front of every payload
#[repr(C)]
#[derive(Clone, Copy)]
struct AllocationHeader {
    /// Bytes between the span start and this header
    padding: usize,
    /// Usable payload bytes, absorbed leftovers included
    size: usize,
}

const HEADER_SIZE: usize = size_of::<AllocationHeader>();
const HEADER_ALIGN: usize = align_of::<AllocationHeader>();
const BLOCK_ALIGN: usize = align_of::<FreeBlock>();

/// Smallest span worth keeping on the free list
pub const MIN_BLOCK_SIZE: usize = {
    let node = size_of::<FreeBlock>();
    let header = HEADER_SIZE + 1;
    if node > header { node } else { header }
};

/// One free span, as reported by [`FreeListAllocator::free_spans`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpan {
    /// Offset from the start of the buffer
    pub offset: usize,
    pub size: usize,
}

/// First-fit allocator with block splitting and coalescing
pub struct FreeListAllocator<'a, B: Allocator + ?Sized = SystemAllocator> {
    region: Region<'a, B>,
    head: Cell<Link>,
    used: Cell<usize>,
    live: Cell<usize>,
    config: AllocatorConfig,
    stats: StatsCell,
}

impl FreeListAllocator<'static> {
    /// Creates a free-list allocator over a fresh system buffer
    pub fn with_capacity(capacity: usize) -> AllocResult<Self> {
        Self::new(&SYSTEM, capacity)
    }

    pub fn with_capacity_and_config(capacity: usize, config: AllocatorConfig) -> AllocResult<Self> {
        Self::with_config(&SYSTEM, capacity, config)
    }
}

impl<'a, B: Allocator + ?Sized> FreeListAllocator<'a, B> {
    /// Creates a free-list allocator drawing `capacity` bytes from `backing`
    pub fn new(backing: &'a B, capacity: usize) -> AllocResult<Self> {
        Self::with_config(backing, capacity, AllocatorConfig::default())
    }

    pub fn with_config(
        backing: &'a B,
        capacity: usize,
        config: AllocatorConfig,
    ) -> AllocResult<Self> {
        if capacity < MIN_BLOCK_SIZE {
            return Err(AllocError::invalid_config(
                "free-list allocator capacity must hold at least one free block",
            ));
        }

        let region = Region::new(backing, capacity, REGION_ALIGN)?;

        #[cfg(feature = "logging")]
        debug!(allocator = "free_list", capacity, backing = backing.name(), "created allocator");

        let allocator = Self {
            region,
            head: Cell::new(None),
            used: Cell::new(0),
            live: Cell::new(0),
            config,
            stats: StatsCell::new(),
        };
        allocator.init_single_block();
        Ok(allocator)
    }

    fn init_single_block(&self) {
        // SAFETY: the region start is aligned for FreeBlock and the capacity
        // is at least MIN_BLOCK_SIZE
        let node = unsafe { self.node_at(0) };
        unsafe {
            node.write(FreeBlock {
                size: self.capacity(),
                prev: None,
                next: None,
            });
        }
        self.head.set(Some(node));
        self.used.set(0);
        self.live.set(0);
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Bytes held by live allocations, headers and padding included
    #[inline]
    pub fn used(&self) -> usize {
        self.used.get()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    pub fn live_allocations(&self) -> usize {
        self.live.get()
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Snapshot of the free list in address order
    pub fn free_spans(&self) -> Vec<FreeSpan> {
        self.blocks()
            .map(|node| FreeSpan {
                offset: self.block_offset(node),
                // SAFETY: nodes yielded by blocks() are live free-list nodes
                size: unsafe { node.as_ref().size },
            })
            .collect()
    }

    pub fn free_block_count(&self) -> usize {
        self.blocks().count()
    }

    pub fn largest_free_block(&self) -> usize {
        self.free_spans().iter().map(|span| span.size).max().unwrap_or(0)
    }

    pub fn fragmentation(&self) -> FragmentationStats {
        let spans = self.free_spans();
        let total = spans.iter().map(|span| span.size).sum();
        let largest = spans.iter().map(|span| span.size).max().unwrap_or(0);
        FragmentationStats::calculate(total, largest, spans.len())
    }

    /// Checks the free-list invariants
    ///
    /// Blocks must be in ascending address order, inside the buffer, no
    /// smaller than [`MIN_BLOCK_SIZE`], neither overlapping nor touching (a
    /// touching pair means coalescing was missed), with consistent back
    /// links, and free plus used bytes must equal the capacity.
    pub fn validate(&self) -> AllocResult<()> {
        let max_blocks = self.capacity() / MIN_BLOCK_SIZE + 1;
        let mut expected_prev: Link = None;
        let mut last_end: Option<usize> = None;
        let mut total_free = 0usize;

        for (index, node) in self.blocks().enumerate() {
            if index >= max_blocks {
                return Err(AllocError::corruption("free_list", "free list contains a cycle"));
            }
            let offset = self.block_offset(node);
            // SAFETY: nodes yielded by blocks() are live free-list nodes
            let block = unsafe { node.read() };

            if block.prev != expected_prev {
                return Err(AllocError::corruption("free_list", "back link does not match"));
            }
            if offset % BLOCK_ALIGN != 0
                || block.size < MIN_BLOCK_SIZE
                || offset + block.size > self.capacity()
            {
                return Err(AllocError::corruption("free_list", "free block out of bounds"));
            }
            match last_end {
                Some(end) if offset < end => {
                    return Err(AllocError::corruption(
                        "free_list",
                        "free blocks overlap or are out of order",
                    ));
                }
                Some(end) if offset == end => {
                    return Err(AllocError::corruption(
                        "free_list",
                        "adjacent free blocks were not coalesced",
                    ));
                }
                _ => {}
            }

            last_end = Some(offset + block.size);
            total_free += block.size;
            expected_prev = Some(node);
        }

        if total_free + self.used() != self.capacity() {
            return Err(AllocError::corruption(
                "free_list",
                "free and used bytes do not add up to the capacity",
            ));
        }
        Ok(())
    }

    /// Returns `LeakDetected` while allocations are outstanding
    pub fn check_leaks(&self) -> AllocResult<()> {
        match self.live.get() {
            0 => Ok(()),
            count => Err(AllocError::leak_detected(self.name(), count, self.used())),
        }
    }

    // ------------------------------------------------------------------------
    // Free-list plumbing
    // ------------------------------------------------------------------------

    fn blocks(&self) -> impl Iterator<Item = NonNull<FreeBlock>> + '_ {
        // SAFETY: every link on the list points at a node written by this
        // allocator inside the region
        core::iter::successors(self.head.get(), |node| unsafe { node.as_ref().next })
    }

    #[inline]
    fn block_offset(&self, node: NonNull<FreeBlock>) -> usize {
        node.as_ptr() as usize - self.region.base_addr()
    }

    /// # Safety
    /// `offset` must be inside the buffer and aligned for `FreeBlock`.
    #[inline]
    unsafe fn node_at(&self, offset: usize) -> NonNull<FreeBlock> {
        // SAFETY: forwarded caller contract
        unsafe { self.region.at(offset).cast() }
    }

    /// Links `prev -> middle -> next`, or `prev -> next` when `middle` is
    /// `None`. The caller has already stored `prev`/`next` in `middle`.
    fn relink(&self, prev: Link, next: Link, middle: Link) {
        let (after_prev, before_next) = match middle {
            Some(node) => (Some(node), Some(node)),
            None => (next, prev),
        };
        // SAFETY: prev and next are live free-list nodes
        unsafe {
            match prev {
                Some(prev) => (*prev.as_ptr()).next = after_prev,
                None => self.head.set(after_prev),
            }
            if let Some(next) = next {
                (*next.as_ptr()).prev = before_next;
            }
        }
    }

    /// Neighbours a span starting at `offset` would have in the sorted list
    fn neighbours(&self, offset: usize) -> (Link, Link) {
        let mut prev = None;
        for node in self.blocks() {
            if self.block_offset(node) >= offset {
                return (prev, Some(node));
            }
            prev = Some(node);
        }
        (prev, None)
    }

    /// Merges `node` with address-adjacent list neighbours
    ///
    /// # Safety
    /// `node` must be a live free-list node.
    unsafe fn coalesce(&self, node: NonNull<FreeBlock>) {
        let offset = self.block_offset(node);
        // SAFETY: node and its neighbours are live free-list nodes; each
        // merge unlinks the absorbed node before it can be reached again
        unsafe {
            let block = node.read();
            if let Some(next) = block.next
                && offset + block.size == self.block_offset(next)
            {
                let absorbed = next.read();
                (*node.as_ptr()).size += absorbed.size;
                self.relink(Some(node), absorbed.next, None);
            }

            let block = node.read();
            if let Some(prev) = block.prev
                && self.block_offset(prev) + prev.as_ref().size == offset
            {
                (*prev.as_ptr()).size += block.size;
                self.relink(Some(prev), block.next, None);
            }
        }
    }

    fn out_of_space(&self, size: usize, align: usize) -> AllocError {
        if self.config.track_stats {
            self.stats.record_failure();
        }
        let fragmentation = self.fragmentation();
        let minimum = size.saturating_add(HEADER_SIZE);
        if fragmentation.total_free >= minimum {
            AllocError::fragmented(
                self.name(),
                size,
                align,
                fragmentation.total_free,
                fragmentation.largest_block,
            )
        } else {
            AllocError::out_of_memory(self.name(), size, align, fragmentation.total_free)
        }
    }

    fn reject(&self, ptr: NonNull<u8>, reason: &str) -> AllocError {
        self.config
            .misuse(AllocError::invalid_free(self.name(), ptr.as_ptr() as usize, reason))
    }
}

unsafe impl<B: Allocator + ?Sized> Allocator for FreeListAllocator<'_, B> {
    fn allocate(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        validate_request(size, align)?;

        let header_align = align.max(HEADER_ALIGN);
        let base = self.region.base_addr();

        // First fit
        let mut found = None;
        for node in self.blocks() {
            let offset = self.block_offset(node);
            // SAFETY: live free-list node
            let block_size = unsafe { node.as_ref().size };
            let padding = alignment_adjustment(header_align, base + offset + HEADER_SIZE);
            let needed = padding
                .checked_add(HEADER_SIZE)
                .and_then(|n| n.checked_add(size));
            if needed.is_some_and(|needed| needed <= block_size) {
                found = Some((node, offset, block_size, padding));
                break;
            }
        }
        let Some((node, block_offset, block_size, padding)) = found else {
            return Err(self.out_of_space(size, align));
        };

        // SAFETY: live free-list node; copied out before anything overwrites it
        let FreeBlock { prev, next, .. } = unsafe { node.read() };
        let payload_offset = block_offset + padding + HEADER_SIZE;
        let block_end = block_offset + block_size;
        let split_at = align_up(payload_offset + size, BLOCK_ALIGN);

        let payload_size = if split_at + MIN_BLOCK_SIZE <= block_end {
            // SAFETY: split_at is aligned for FreeBlock and the remainder
            // holds at least MIN_BLOCK_SIZE bytes inside the old block
            let remainder = unsafe { self.node_at(split_at) };
            unsafe {
                remainder.write(FreeBlock {
                    size: block_end - split_at,
                    prev,
                    next,
                });
            }
            self.relink(prev, next, Some(remainder));
            split_at - payload_offset
        } else {
            self.relink(prev, next, None);
            block_end - payload_offset
        };

        // SAFETY: the header lies inside the taken block and is aligned for
        // AllocationHeader because the payload is aligned to header_align
        unsafe {
            self.region
                .at(payload_offset - HEADER_SIZE)
                .cast::<AllocationHeader>()
                .write(AllocationHeader {
                    padding,
                    size: payload_size,
                });
        }

        self.used.set(self.used.get() + padding + HEADER_SIZE + payload_size);
        self.live.set(self.live.get() + 1);

        if let Some(pattern) = self.config.alloc_pattern {
            // SAFETY: payload range lies inside the taken block
            unsafe { self.region.fill(payload_offset, payload_size, pattern) };
        }
        if self.config.track_stats {
            self.stats.record_allocation(payload_size);
        }

        #[cfg(feature = "logging")]
        trace!(
            allocator = "free_list",
            size,
            align,
            offset = payload_offset,
            span = padding + HEADER_SIZE + payload_size,
            "allocated"
        );

        // SAFETY: payload_offset < block_end <= capacity
        Ok(unsafe { self.region.at(payload_offset) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        let Some(payload_offset) = self.region.offset_of(ptr) else {
            return Err(self.reject(ptr, "address not owned by this allocator"));
        };
        if self.live.get() == 0 {
            return Err(self.reject(ptr, "no allocation is live"));
        }
        if payload_offset < HEADER_SIZE || payload_offset % HEADER_ALIGN != 0 {
            return Err(self.reject(ptr, "address is not an allocation payload"));
        }

        let header_offset = payload_offset - HEADER_SIZE;
        // SAFETY: header_offset is inside the buffer and aligned for
        // AllocationHeader; its contents are validated below
        let header = unsafe {
            self.region
                .at(header_offset)
                .cast::<AllocationHeader>()
                .read()
        };
        let span = header
            .padding
            .checked_add(HEADER_SIZE)
            .and_then(|s| s.checked_add(header.size));
        let (block_offset, span) = match (header_offset.checked_sub(header.padding), span) {
            (Some(start), Some(span))
                if start % BLOCK_ALIGN == 0
                    && span >= MIN_BLOCK_SIZE
                    && start + span <= self.capacity() =>
            {
                (start, span)
            }
            _ => return Err(self.reject(ptr, "no allocation header in front of this address")),
        };

        // Sorted position; a span overlapping either neighbour is already free
        let (prev, next) = self.neighbours(block_offset);
        // SAFETY: prev and next are live free-list nodes
        let overlaps_prev = prev.is_some_and(|prev| unsafe {
            self.block_offset(prev) + prev.as_ref().size > block_offset
        });
        let overlaps_next =
            next.is_some_and(|next| block_offset + span > self.block_offset(next));
        if overlaps_prev || overlaps_next {
            return Err(self.reject(ptr, "double free: span overlaps a free block"));
        }

        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: the payload is dead; the node written below may cover
            // part of it, never the other way round
            unsafe { self.region.fill(payload_offset, header.size, pattern) };
        }

        // SAFETY: block_offset is aligned for FreeBlock and the span holds at
        // least MIN_BLOCK_SIZE bytes no one else owns
        let node = unsafe { self.node_at(block_offset) };
        unsafe { node.write(FreeBlock { size: span, prev, next }) };
        self.relink(prev, next, Some(node));
        // SAFETY: node was just linked
        unsafe { self.coalesce(node) };

        self.used.set(self.used.get() - span);
        self.live.set(self.live.get() - 1);
        if self.config.track_stats {
            self.stats.record_deallocation(header.size);
        }

        #[cfg(feature = "logging")]
        trace!(allocator = "free_list", offset = payload_offset, span, "freed");

        Ok(())
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(ptr)
    }

    fn address_range(&self) -> Option<Range<usize>> {
        Some(self.region.address_range())
    }

    fn name(&self) -> &'static str {
        "free_list"
    }
}

impl<B: Allocator + ?Sized> Resettable for FreeListAllocator<'_, B> {
    unsafe fn reset(&self) {
        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: the whole region is rewritten below
            unsafe { self.region.fill(0, self.capacity(), pattern) };
        }
        if self.config.track_stats {
            self.stats
                .record_release(self.live.get(), self.stats.snapshot().allocated_bytes);
        }
        self.init_single_block();
    }
}

impl<B: Allocator + ?Sized> MemoryUsage for FreeListAllocator<'_, B> {
    fn used_memory(&self) -> usize {
        self.used()
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.available())
    }
}

impl<B: Allocator + ?Sized> StatisticsProvider for FreeListAllocator<'_, B> {
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

impl<B: Allocator + ?Sized> Drop for FreeListAllocator<'_, B> {
    fn drop(&mut self) {
        self.config
            .report_leaks_on_drop(self.name(), self.live.get(), self.used());
    }
}

impl<B: Allocator + ?Sized> fmt::Debug for FreeListAllocator<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeListAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("live", &self.live.get())
            .field("free_blocks", &self.free_block_count())
            .finish_non_exhaustive()
    }
}

// SAFETY: list links only refer to nodes inside the owned region
unsafe impl<B: Allocator + Sync + ?Sized> Send for FreeListAllocator<'_, B> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::utils::is_aligned_ptr;

    fn production(capacity: usize) -> FreeListAllocator<'static> {
        FreeListAllocator::with_capacity_and_config(capacity, AllocatorConfig::production())
            .expect("allocator")
    }

    fn span(offset: usize, size: usize) -> FreeSpan {
        FreeSpan { offset, size }
    }

    #[test]
    fn test_metadata_sizes() {
        assert_eq!(HEADER_SIZE, 2 * size_of::<usize>());
        assert_eq!(MIN_BLOCK_SIZE, 3 * size_of::<usize>());
    }

    #[test]
    fn test_starts_as_one_block() {
        let allocator = production(1024);
        assert_eq!(allocator.free_spans(), vec![span(0, 1024)]);
        assert!(allocator.validate().is_ok());
    }

    #[test]
    fn test_split_leaves_remainder() {
        let allocator = production(1024);
        let ptr = allocator.allocate(100, 8).expect("alloc");
        assert_eq!(allocator.region.offset_of(ptr), Some(HEADER_SIZE));
        // 16 + 100 rounded up to the free-block alignment
        assert_eq!(allocator.free_spans(), vec![span(120, 904)]);
        assert_eq!(allocator.used(), 120);
        allocator.validate().expect("valid");
    }

    #[test]
    fn test_sliver_is_absorbed() {
        let allocator = production(64);
        let ptr = allocator.allocate(30, 8).expect("alloc");
        // 48 bytes are left after the header, fewer than header + payload + node
        assert!(allocator.free_spans().is_empty());
        assert_eq!(allocator.used(), 64);

        unsafe { allocator.free(ptr) }.expect("free");
        assert_eq!(allocator.free_spans(), vec![span(0, 64)]);
    }

    #[test]
    fn test_alignment_padding_is_reclaimed() {
        let allocator = production(1024);
        let a = allocator.allocate(8, 8).expect("a");
        let b = allocator.allocate(64, 128).expect("b");
        assert!(is_aligned_ptr(b.as_ptr(), 128));
        allocator.validate().expect("valid");

        unsafe {
            allocator.free(b).expect("free b");
            allocator.free(a).expect("free a");
        }
        assert_eq!(allocator.free_spans(), vec![span(0, 1024)]);
    }

    #[test]
    fn test_fragmented_and_out_of_memory_diagnostics() {
        let allocator = production(256);
        let a = allocator.allocate(40, 8).expect("a");
        let _b = allocator.allocate(40, 8).expect("b");
        let c = allocator.allocate(40, 8).expect("c");
        let _d = allocator.allocate(40, 8).expect("d");
        unsafe {
            allocator.free(a).expect("free a");
            allocator.free(c).expect("free c");
        }
        assert_eq!(
            allocator.free_spans(),
            vec![span(0, 56), span(112, 56), span(224, 32)]
        );

        let err = allocator.allocate(60, 8).expect_err("no single block fits");
        assert!(matches!(err, AllocError::Fragmented { free: 144, largest_block: 56, .. }));
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);

        let err = allocator.allocate(200, 8).expect_err("not enough space at all");
        assert!(matches!(err, AllocError::OutOfMemory { available: 144, .. }));
        allocator.validate().expect("failed allocations change nothing");
    }

    #[test]
    fn test_double_free_rejected() {
        let allocator = production(512);
        let a = allocator.allocate(32, 8).expect("a");
        let b = allocator.allocate(32, 8).expect("b");
        unsafe { allocator.free(a) }.expect("free a");

        let err = unsafe { allocator.free(a) }.expect_err("double free");
        assert!(err.is_invalid_free());
        allocator.validate().expect("state unchanged");
        assert_eq!(allocator.live_allocations(), 1);

        unsafe { allocator.free(b) }.expect("free b");
        assert!(unsafe { allocator.free(b) }.is_err());
        assert_eq!(allocator.free_spans(), vec![span(0, 512)]);
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let allocator = production(128);
        let other = production(128);
        let foreign = other.allocate(8, 8).expect("foreign");
        let _own = allocator.allocate(8, 8).expect("own");
        assert!(unsafe { allocator.free(foreign) }.is_err());
        assert!(!allocator.owns(foreign));
        unsafe { other.free(foreign) }.expect("free foreign");
    }

    #[test]
    fn test_reset() {
        let allocator = production(256);
        allocator.allocate(16, 8).expect("a");
        allocator.allocate(16, 8).expect("b");
        unsafe { allocator.reset() };
        assert_eq!(allocator.free_spans(), vec![span(0, 256)]);
        assert!(allocator.check_leaks().is_ok());
    }

    #[test]
    fn test_tiny_capacity_rejected() {
        let err = FreeListAllocator::with_capacity(MIN_BLOCK_SIZE - 1).expect_err("too small");
        assert_eq!(err.kind(), ErrorKind::ConstructionPrecondition);
    }
}
