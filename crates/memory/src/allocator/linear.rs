//! Linear (bump pointer) allocator
//!
//! Hands out memory by advancing one offset through a fixed buffer.
//! Individual frees are not supported; memory comes back all at once through
//! [`Resettable::reset`], or partially by rewinding to a [`LinearCheckpoint`].

use core::cell::Cell;
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

#[cfg(feature = "logging")]
use tracing::{debug, error, trace};

use super::stats::StatsCell;
use super::system::SYSTEM;
use super::{
    AllocError, AllocResult, Allocator, AllocatorStats, Region, StatisticsProvider,
    SystemAllocator, REGION_ALIGN,
};
use crate::core::{AllocatorConfig, MemoryUsage, Resettable};
use crate::utils::{alignment_adjustment, validate_request};

/// Saved allocator position for [`LinearAllocator::rewind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearCheckpoint {
    offset: usize,
    allocations: usize,
    allocated_bytes: usize,
    generation: u32,
    owner: usize,
}

impl LinearCheckpoint {
    /// Buffer offset recorded by the checkpoint
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Bump pointer allocator over one fixed buffer
pub struct LinearAllocator<'a, B: Allocator + ?Sized = SystemAllocator> {
    region: Region<'a, B>,
    offset: Cell<usize>,
    allocations: Cell<usize>,
    generation: Cell<u32>,
    config: AllocatorConfig,
    stats: StatsCell,
}

impl LinearAllocator<'static> {
    /// Creates a linear allocator over a fresh system buffer
    pub fn with_capacity(capacity: usize) -> AllocResult<Self> {
        Self::new(&SYSTEM, capacity)
    }

    pub fn with_capacity_and_config(capacity: usize, config: AllocatorConfig) -> AllocResult<Self> {
        Self::with_config(&SYSTEM, capacity, config)
    }
}

impl<'a, B: Allocator + ?Sized> LinearAllocator<'a, B> {
    /// Creates a linear allocator drawing `capacity` bytes from `backing`
    pub fn new(backing: &'a B, capacity: usize) -> AllocResult<Self> {
        Self::with_config(backing, capacity, AllocatorConfig::default())
    }

    /// Creates a linear allocator with an explicit configuration
    pub fn with_config(
        backing: &'a B,
        capacity: usize,
        config: AllocatorConfig,
    ) -> AllocResult<Self> {
        if capacity == 0 {
            return Err(AllocError::invalid_config("linear allocator capacity must be non-zero"));
        }

        let region = Region::new(backing, capacity, REGION_ALIGN)?;

        #[cfg(feature = "logging")]
        debug!(allocator = "linear", capacity, backing = backing.name(), "created allocator");

        Ok(Self {
            region,
            offset: Cell::new(0),
            allocations: Cell::new(0),
            generation: Cell::new(0),
            config,
            stats: StatsCell::new(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Bytes consumed since the last reset, alignment padding included
    #[inline]
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Allocations made since the last reset
    pub fn allocation_count(&self) -> usize {
        self.allocations.get()
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Records the current position
    pub fn checkpoint(&self) -> LinearCheckpoint {
        LinearCheckpoint {
            offset: self.offset.get(),
            allocations: self.allocations.get(),
            allocated_bytes: self.stats.snapshot().allocated_bytes,
            generation: self.generation.get(),
            owner: self.region.base_addr(),
        }
    }

    /// Rolls the allocator back to `checkpoint`
    ///
    /// Fails with `InvalidState` if the checkpoint belongs to another
    /// allocator, predates a reset or rewind past it, or lies ahead of the
    /// current position.
    ///
    /// # Safety
    /// Every allocation made after the checkpoint becomes invalid.
    pub unsafe fn rewind(&self, checkpoint: LinearCheckpoint) -> AllocResult<()> {
        if checkpoint.owner != self.region.base_addr() {
            return Err(AllocError::invalid_state("checkpoint belongs to another allocator"));
        }
        if checkpoint.generation != self.generation.get() {
            return Err(AllocError::invalid_state("checkpoint predates a reset"));
        }
        let current = self.offset.get();
        if checkpoint.offset > current {
            return Err(AllocError::invalid_state("checkpoint lies ahead of the current offset"));
        }

        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: [checkpoint.offset, current) is inside the buffer and
            // linear allocations carry no metadata
            unsafe { self.region.fill(checkpoint.offset, current - checkpoint.offset, pattern) };
        }

        if self.config.track_stats {
            let allocated = self.stats.snapshot().allocated_bytes;
            self.stats.record_release(
                self.allocations.get() - checkpoint.allocations,
                allocated.saturating_sub(checkpoint.allocated_bytes),
            );
        }

        self.offset.set(checkpoint.offset);
        self.allocations.set(checkpoint.allocations);
        Ok(())
    }

    /// RAII guard that rewinds to the current position when dropped
    pub fn scope(&self) -> LinearScope<'_, 'a, B> {
        LinearScope {
            allocator: self,
            checkpoint: self.checkpoint(),
        }
    }
}

unsafe impl<B: Allocator + ?Sized> Allocator for LinearAllocator<'_, B> {
    fn allocate(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        validate_request(size, align)?;

        let offset = self.offset.get();
        let available = self.capacity() - offset;
        let adjustment = alignment_adjustment(align, self.region.base_addr() + offset);

        let required = match size.checked_add(adjustment) {
            Some(required) if required <= available => required,
            _ => {
                if self.config.track_stats {
                    self.stats.record_failure();
                }
                return Err(AllocError::out_of_memory(self.name(), size, align, available));
            }
        };

        let payload = offset + adjustment;
        self.offset.set(offset + required);
        self.allocations.set(self.allocations.get() + 1);

        if let Some(pattern) = self.config.alloc_pattern {
            // SAFETY: payload + size <= offset + required <= capacity
            unsafe { self.region.fill(payload, size, pattern) };
        }
        if self.config.track_stats {
            self.stats.record_allocation(size);
        }

        #[cfg(feature = "logging")]
        trace!(allocator = "linear", size, align, offset = payload, "allocated");

        // SAFETY: payload < capacity
        Ok(unsafe { self.region.at(payload) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        Err(self.config.misuse(AllocError::invalid_free(
            self.name(),
            ptr.as_ptr() as usize,
            "linear allocator does not support individual frees",
        )))
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(ptr)
    }

    fn address_range(&self) -> Option<Range<usize>> {
        Some(self.region.address_range())
    }

    fn name(&self) -> &'static str {
        "linear"
    }

    fn supports_free(&self) -> bool {
        false
    }
}

impl<B: Allocator + ?Sized> Resettable for LinearAllocator<'_, B> {
    unsafe fn reset(&self) {
        let used = self.offset.get();
        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: [0, used) is inside the buffer
            unsafe { self.region.fill(0, used, pattern) };
        }
        if self.config.track_stats {
            self.stats
                .record_release(self.allocations.get(), self.stats.snapshot().allocated_bytes);
        }

        self.offset.set(0);
        self.allocations.set(0);
        self.generation.set(self.generation.get().wrapping_add(1));

        #[cfg(feature = "logging")]
        trace!(allocator = "linear", released = used, "reset");
    }
}

impl<B: Allocator + ?Sized> MemoryUsage for LinearAllocator<'_, B> {
    fn used_memory(&self) -> usize {
        self.used()
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.available())
    }
}

impl<B: Allocator + ?Sized> StatisticsProvider for LinearAllocator<'_, B> {
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

impl<B: Allocator + ?Sized> fmt::Debug for LinearAllocator<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("allocations", &self.allocations.get())
            .finish_non_exhaustive()
    }
}

/// Rewinds its allocator to the position at creation when dropped
pub struct LinearScope<'s, 'a, B: Allocator + ?Sized> {
    allocator: &'s LinearAllocator<'a, B>,
    checkpoint: LinearCheckpoint,
}

impl<B: Allocator + ?Sized> LinearScope<'_, '_, B> {
    pub fn checkpoint(&self) -> LinearCheckpoint {
        self.checkpoint
    }
}

impl<B: Allocator + ?Sized> Drop for LinearScope<'_, '_, B> {
    fn drop(&mut self) {
        // SAFETY: the scope borrows the allocator, so the rewind cannot race
        // a reset; allocations made inside the scope end with it
        let result = unsafe { self.allocator.rewind(self.checkpoint) };
        #[cfg(feature = "logging")]
        if let Err(err) = result {
            error!(
                allocator = "linear",
                offset = self.checkpoint.offset(),
                error = %err,
                "linear scope could not rewind"
            );
        }
        #[cfg(not(feature = "logging"))]
        drop(result);
    }
}
