//! Main stack allocator implementation
//!
//! # Memory Layout
//! ```text
//! | prev alloc | padding | header | payload | padding | header | payload | free ...
//!                        ^-----------------^
//!                        one allocation; header.padding counts the bytes
//!                        between the previous end and this header
//! ```
//!
//! ## Invariants
//!
//! - Headers form a singly-linked chain from the most recent allocation back
//!   to the first; only the chain head may be freed
//! - `offset` equals the end of the most recent payload (or 0 when empty)
//! - Every header sits directly in front of its payload and is aligned for
//!   `StackHeader`

use core::cell::Cell;
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

use super::{StackFrame, StackMarker};
use crate::allocator::stats::StatsCell;
use crate::allocator::system::SYSTEM;
use crate::allocator::{
    AllocError, AllocResult, Allocator, AllocatorStats, Region, StatisticsProvider,
    SystemAllocator, REGION_ALIGN,
};
use crate::core::{AllocatorConfig, MemoryUsage, Resettable};
use crate::utils::{alignment_adjustment, validate_request};

/// Per-allocation header written directly in front of each payload
#[repr(C)]
#[derive(Debug)]
pub(crate) struct StackHeader {
    /// Previous allocation's header
    prev: Option<NonNull<StackHeader>>,
    /// Bytes between the previous allocation's end and this header
    padding: usize,
}

const HEADER_SIZE: usize = size_of::<StackHeader>();
const HEADER_ALIGN: usize = align_of::<StackHeader>();

/// Stack allocator that supports LIFO allocation and deallocation
///
/// Memory can only be freed in reverse order of allocation. Markers and
/// frames release whole groups of allocations at once.
pub struct StackAllocator<'a, B: Allocator + ?Sized = SystemAllocator> {
    region: Region<'a, B>,
    offset: Cell<usize>,
    top: Cell<Option<NonNull<StackHeader>>>,
    live: Cell<usize>,
    config: AllocatorConfig,
    stats: StatsCell,
}

impl StackAllocator<'static> {
    /// Creates a stack allocator over a fresh system buffer
    pub fn with_capacity(capacity: usize) -> AllocResult<Self> {
        Self::new(&SYSTEM, capacity)
    }

    pub fn with_capacity_and_config(
        capacity: usize,
        config: AllocatorConfig,
    ) -> AllocResult<Self> {
        Self::with_config(&SYSTEM, capacity, config)
    }
}

impl<'a, B: Allocator + ?Sized> StackAllocator<'a, B> {
    /// Creates a stack allocator drawing `capacity` bytes from `backing`
    pub fn new(backing: &'a B, capacity: usize) -> AllocResult<Self> {
        Self::with_config(backing, capacity, AllocatorConfig::default())
    }

    pub fn with_config(
        backing: &'a B,
        capacity: usize,
        config: AllocatorConfig,
    ) -> AllocResult<Self> {
        if capacity <= HEADER_SIZE {
            return Err(AllocError::invalid_config(
                "stack allocator capacity must exceed one allocation header",
            ));
        }

        let region = Region::new(backing, capacity, REGION_ALIGN)?;

        #[cfg(feature = "logging")]
        debug!(allocator = "stack", capacity, backing = backing.name(), "created allocator");

        Ok(Self {
            region,
            offset: Cell::new(0),
            top: Cell::new(None),
            live: Cell::new(0),
            config,
            stats: StatsCell::new(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Bytes consumed, headers and padding included
    #[inline]
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Number of allocations not yet popped
    pub fn live_allocations(&self) -> usize {
        self.live.get()
    }

    pub fn is_empty(&self) -> bool {
        self.top.get().is_none()
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Captures the current stack position
    pub fn mark(&self) -> StackMarker {
        StackMarker {
            offset: self.offset.get(),
            top: self.top.get(),
            allocated_bytes: self.stats.snapshot().allocated_bytes,
            owner: self.region.base_addr(),
        }
    }

    /// Opens a [`StackFrame`] that releases back to the current position
    pub fn frame(&self) -> StackFrame<'_, 'a, B> {
        StackFrame::new(self)
    }

    /// Pops every allocation made after `marker`
    ///
    /// Fails with `InvalidState` if the marker belongs to another allocator
    /// or its position has already been popped and reused.
    ///
    /// # Safety
    /// Every allocation made after the marker becomes invalid.
    pub unsafe fn release(&self, marker: StackMarker) -> AllocResult<()> {
        if marker.owner != self.region.base_addr() {
            return Err(AllocError::invalid_state("marker belongs to another allocator"));
        }
        let current = self.offset.get();
        if marker.offset > current {
            return Err(AllocError::invalid_state("marker lies above the top of the stack"));
        }

        // Walk the chain down to the marker, counting what gets popped.
        // `floor` ends up as the stack offset just before the oldest popped
        // allocation, which must be the marker's offset.
        let mut released = 0;
        let mut floor = current;
        let mut cursor = self.top.get();
        while let Some(header) = cursor {
            let header_offset = self.header_offset(header);
            if header_offset < marker.offset {
                break;
            }
            released += 1;
            // SAFETY: every header in the chain was written by allocate and
            // lies inside the buffer
            let header = unsafe { header.as_ref() };
            floor = header_offset - header.padding;
            cursor = header.prev;
        }
        // A header reused at the marker's old top address still ends
        // somewhere other than the marker's offset
        if cursor != marker.top || floor != marker.offset {
            return Err(AllocError::invalid_state("marker is no longer on the stack"));
        }

        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: everything in [marker.offset, current) belongs to the
            // allocations being released
            unsafe { self.region.fill(marker.offset, current - marker.offset, pattern) };
        }
        if self.config.track_stats {
            let allocated = self.stats.snapshot().allocated_bytes;
            self.stats
                .record_release(released, allocated.saturating_sub(marker.allocated_bytes));
        }

        self.offset.set(marker.offset);
        self.top.set(marker.top);
        self.live.set(self.live.get() - released);

        #[cfg(feature = "logging")]
        trace!(allocator = "stack", released, offset = marker.offset, "released to marker");

        Ok(())
    }

    /// Returns `LeakDetected` while allocations are outstanding
    pub fn check_leaks(&self) -> AllocResult<()> {
        match self.live.get() {
            0 => Ok(()),
            count => Err(AllocError::leak_detected(self.name(), count, self.used())),
        }
    }

    #[inline]
    fn header_offset(&self, header: NonNull<StackHeader>) -> usize {
        header.as_ptr() as usize - self.region.base_addr()
    }

    fn reject(&self, ptr: NonNull<u8>, reason: &str) -> AllocError {
        self.config
            .misuse(AllocError::invalid_free(self.name(), ptr.as_ptr() as usize, reason))
    }
}

unsafe impl<B: Allocator + ?Sized> Allocator for StackAllocator<'_, B> {
    fn allocate(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        validate_request(size, align)?;

        let offset = self.offset.get();
        let available = self.capacity() - offset;
        let strict_align = align.max(HEADER_ALIGN);
        let earliest_payload = self.region.base_addr() + offset + HEADER_SIZE;
        let padding = alignment_adjustment(strict_align, earliest_payload);

        let header_offset = offset + padding;
        let payload_offset = header_offset + HEADER_SIZE;
        let end = match payload_offset.checked_add(size) {
            Some(end) if end <= self.capacity() => end,
            _ => {
                if self.config.track_stats {
                    self.stats.record_failure();
                }
                return Err(AllocError::out_of_memory(self.name(), size, align, available));
            }
        };

        // SAFETY: header_offset + HEADER_SIZE + size <= capacity, and the
        // header address is aligned because the payload is aligned to at
        // least HEADER_ALIGN and HEADER_SIZE is a multiple of it
        let header = unsafe { self.region.at(header_offset).cast::<StackHeader>() };
        unsafe {
            header.write(StackHeader {
                prev: self.top.get(),
                padding,
            });
        }

        self.top.set(Some(header));
        self.offset.set(end);
        self.live.set(self.live.get() + 1);

        if let Some(pattern) = self.config.alloc_pattern {
            // SAFETY: payload range lies inside the buffer
            unsafe { self.region.fill(payload_offset, size, pattern) };
        }
        if self.config.track_stats {
            self.stats.record_allocation(size);
        }

        #[cfg(feature = "logging")]
        trace!(allocator = "stack", size, align, offset = payload_offset, "allocated");

        // SAFETY: payload_offset < end <= capacity
        Ok(unsafe { self.region.at(payload_offset) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        if !self.region.contains(ptr) {
            return Err(self.reject(ptr, "address not owned by this allocator"));
        }
        let Some(top) = self.top.get() else {
            return Err(self.reject(ptr, "stack is empty"));
        };
        if ptr.as_ptr() as usize != top.as_ptr() as usize + HEADER_SIZE {
            return Err(self.reject(ptr, "not the most recent allocation"));
        }

        // SAFETY: top is the live chain head written by allocate
        let header = unsafe { top.read() };
        let header_offset = self.header_offset(top);
        let payload_offset = header_offset + HEADER_SIZE;
        let end = self.offset.get();

        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: payload range lies inside the buffer; the header is
            // already copied out
            unsafe { self.region.fill(payload_offset, end - payload_offset, pattern) };
        }
        if self.config.track_stats {
            self.stats.record_deallocation(end - payload_offset);
        }

        self.offset.set(header_offset - header.padding);
        self.top.set(header.prev);
        self.live.set(self.live.get() - 1);

        #[cfg(feature = "logging")]
        trace!(allocator = "stack", offset = payload_offset, "freed");

        Ok(())
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(ptr)
    }

    fn address_range(&self) -> Option<Range<usize>> {
        Some(self.region.address_range())
    }

    fn name(&self) -> &'static str {
        "stack"
    }
}

impl<B: Allocator + ?Sized> Resettable for StackAllocator<'_, B> {
    unsafe fn reset(&self) {
        let used = self.offset.get();
        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: [0, used) is inside the buffer and nothing in it stays live
            unsafe { self.region.fill(0, used, pattern) };
        }
        if self.config.track_stats {
            self.stats
                .record_release(self.live.get(), self.stats.snapshot().allocated_bytes);
        }

        self.offset.set(0);
        self.top.set(None);
        self.live.set(0);
    }
}

impl<B: Allocator + ?Sized> MemoryUsage for StackAllocator<'_, B> {
    fn used_memory(&self) -> usize {
        self.used()
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.available())
    }
}

impl<B: Allocator + ?Sized> StatisticsProvider for StackAllocator<'_, B> {
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

impl<B: Allocator + ?Sized> Drop for StackAllocator<'_, B> {
    fn drop(&mut self) {
        self.config
            .report_leaks_on_drop(self.name(), self.live.get(), self.used());
    }
}

impl<B: Allocator + ?Sized> fmt::Debug for StackAllocator<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("live", &self.live.get())
            .finish_non_exhaustive()
    }
}

// SAFETY: the header pointers only ever point into the region owned by this
// allocator, so moving the allocator moves everything they refer to
unsafe impl<B: Allocator + Sync + ?Sized> Send for StackAllocator<'_, B> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::is_aligned_ptr;

    fn production(capacity: usize) -> StackAllocator<'static> {
        StackAllocator::with_capacity_and_config(capacity, AllocatorConfig::production())
            .expect("allocator")
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 2 * size_of::<usize>());
        assert_eq!(HEADER_ALIGN, align_of::<usize>());
    }

    #[test]
    fn test_payload_follows_header() {
        let stack = production(256);
        let ptr = stack.allocate(8, 8).expect("alloc");
        assert_eq!(stack.region.offset_of(ptr), Some(HEADER_SIZE));
        assert_eq!(stack.used(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_lifo_free_restores_offset() {
        let stack = production(512);
        let a = stack.allocate(24, 8).expect("a");
        let after_a = stack.used();
        let b = stack.allocate(40, 64).expect("b");
        assert!(is_aligned_ptr(b.as_ptr(), 64));

        unsafe { stack.free(b) }.expect("free b");
        assert_eq!(stack.used(), after_a);
        unsafe { stack.free(a) }.expect("free a");
        assert_eq!(stack.used(), 0);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_out_of_order_free_rejected() {
        let stack = production(256);
        let a = stack.allocate(16, 8).expect("a");
        let b = stack.allocate(16, 8).expect("b");

        let err = unsafe { stack.free(a) }.expect_err("a is not on top");
        assert!(err.is_invalid_free());
        assert_eq!(stack.live_allocations(), 2);

        unsafe {
            stack.free(b).expect("free b");
            stack.free(a).expect("free a");
        }
    }

    #[test]
    fn test_double_free_rejected() {
        let stack = production(128);
        let a = stack.allocate(16, 8).expect("a");
        unsafe { stack.free(a) }.expect("free a");
        assert!(unsafe { stack.free(a) }.is_err());
    }

    #[test]
    fn test_check_leaks() {
        let stack = production(128);
        let a = stack.allocate(16, 8).expect("a");
        assert!(matches!(
            stack.check_leaks(),
            Err(AllocError::LeakDetected { count: 1, .. })
        ));
        unsafe { stack.free(a) }.expect("free a");
        assert!(stack.check_leaks().is_ok());
    }

    #[test]
    fn test_release_to_marker() {
        let stack = production(512);
        let base = stack.allocate(16, 8).expect("base");
        let marker = stack.mark();
        stack.allocate(16, 8).expect("a");
        stack.allocate(64, 32).expect("b");

        unsafe { stack.release(marker) }.expect("release");
        assert_eq!(stack.used(), marker.offset());
        assert_eq!(stack.live_allocations(), 1);
        unsafe { stack.free(base) }.expect("base is on top again");
    }

    #[test]
    fn test_release_rejects_stale_marker() {
        let stack = production(512);
        stack.allocate(16, 8).expect("base");
        let a = stack.allocate(16, 8).expect("a");
        let marker = stack.mark();
        unsafe { stack.free(a) }.expect("free a");

        // c reuses a's header address and covers the marker's offset
        let c = stack.allocate(64, 8).expect("c");
        let used = stack.used();
        let err = unsafe { stack.release(marker) }.expect_err("marker is stale");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
        assert_eq!(stack.live_allocations(), 2);
        assert_eq!(stack.used(), used);

        let d = stack.allocate(16, 8).expect("d");
        assert!(d.as_ptr() as usize >= c.as_ptr() as usize + 64);
    }

    #[test]
    fn test_release_with_nothing_pushed_after_stale_marker() {
        let stack = production(512);
        let a = stack.allocate(32, 8).expect("a");
        let marker = stack.mark();
        unsafe { stack.free(a) }.expect("free a");
        stack.allocate(8, 8).expect("b");

        assert!(unsafe { stack.release(marker) }.is_err());
        assert_eq!(stack.used(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_frame_with_stale_marker_leaves_stack_alone() {
        let stack = production(512);
        let a = stack.allocate(16, 8).expect("a");
        let c = {
            let frame = stack.frame();
            unsafe { frame.allocator().free(a) }.expect("free a");
            frame.allocator().allocate(64, 8).expect("c")
        };
        assert_eq!(stack.live_allocations(), 1);
        assert_eq!(stack.used(), HEADER_SIZE + 64);
        unsafe { stack.free(c) }.expect("c is still on top");
    }

    #[test]
    fn test_frame_releases_on_drop() {
        let stack = production(512);
        stack.allocate(16, 8).expect("base");
        let before = stack.used();
        {
            let frame = stack.frame();
            frame.allocator().allocate(100, 8).expect("scratch");
            frame.allocator().allocate(50, 16).expect("scratch");
        }
        assert_eq!(stack.used(), before);
        assert_eq!(stack.live_allocations(), 1);
    }
}
