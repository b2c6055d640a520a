//! Accounting proxy
//!
//! [`ProxyAllocator`] owns no memory. It forwards every call to a borrowed
//! backing allocator and attributes the traffic to one named subsystem, so
//! several subsystems can share one physical allocator while their usage is
//! still reported separately.
//!
//! The proxy remembers the size of every allocation it forwarded. A free of
//! an address it never handed out is rejected without reaching the backing
//! allocator.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use hashbrown::HashMap;
#[cfg(feature = "logging")]
use tracing::{debug, trace};

use super::stats::StatsCell;
use super::{AllocError, AllocResult, Allocator, AllocatorStats, StatisticsProvider};
use crate::core::{AllocatorConfig, MemoryUsage};

/// Per-subsystem accounting wrapper around another allocator
///
/// # Examples
/// ```rust
/// use ember_memory::prelude::*;
///
/// let heap = FreeListAllocator::with_capacity(64 * 1024)?;
/// let audio = ProxyAllocator::new(&heap, "audio");
/// let physics = ProxyAllocator::new(&heap, "physics");
///
/// let clip = audio.allocate(512, 16)?;
/// let body = physics.allocate(128, 8)?;
/// assert_eq!(audio.live_bytes(), 512);
/// assert_eq!(physics.live_allocations(), 1);
///
/// unsafe {
///     audio.free(clip)?;
///     physics.free(body)?;
/// }
/// # Ok::<(), ember_memory::MemoryError>(())
/// ```
pub struct ProxyAllocator<'a, A: Allocator + ?Sized> {
    backing: &'a A,
    subsystem: &'static str,
    live: RefCell<HashMap<usize, usize>>,
    live_bytes: Cell<usize>,
    allocations: Cell<usize>,
    frees: Cell<usize>,
    config: AllocatorConfig,
    stats: StatsCell,
}

impl<'a, A: Allocator + ?Sized> ProxyAllocator<'a, A> {
    /// Wraps `backing`, attributing its traffic to `subsystem`
    pub fn new(backing: &'a A, subsystem: &'static str) -> Self {
        Self::with_config(backing, subsystem, AllocatorConfig::default())
    }

    pub fn with_config(backing: &'a A, subsystem: &'static str, config: AllocatorConfig) -> Self {
        #[cfg(feature = "logging")]
        debug!(subsystem, backing = backing.name(), "created proxy allocator");

        Self {
            backing,
            subsystem,
            live: RefCell::new(HashMap::new()),
            live_bytes: Cell::new(0),
            allocations: Cell::new(0),
            frees: Cell::new(0),
            config,
            stats: StatsCell::new(),
        }
    }

    pub fn backing(&self) -> &'a A {
        self.backing
    }

    pub fn subsystem(&self) -> &'static str {
        self.subsystem
    }

    /// Allocations forwarded and not yet freed
    pub fn live_allocations(&self) -> usize {
        self.live.borrow().len()
    }

    /// Requested bytes of the live allocations
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.get()
    }

    /// Successful allocations forwarded so far
    pub fn allocation_count(&self) -> usize {
        self.allocations.get()
    }

    /// Successful frees forwarded so far
    pub fn free_count(&self) -> usize {
        self.frees.get()
    }

    /// Size requested for a live allocation
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.live.borrow().get(&(ptr.as_ptr() as usize)).copied()
    }

    pub fn check_leaks(&self) -> AllocResult<()> {
        match self.live_allocations() {
            0 => Ok(()),
            count => Err(AllocError::leak_detected(self.subsystem, count, self.live_bytes())),
        }
    }
}

unsafe impl<A: Allocator + ?Sized> Allocator for ProxyAllocator<'_, A> {
    fn allocate(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        let ptr = match self.backing.allocate(size, align) {
            Ok(ptr) => ptr,
            Err(err) => {
                if self.config.track_stats {
                    self.stats.record_failure();
                }
                return Err(err);
            }
        };

        self.live.borrow_mut().insert(ptr.as_ptr() as usize, size);
        self.live_bytes.set(self.live_bytes.get() + size);
        self.allocations.set(self.allocations.get() + 1);
        if self.config.track_stats {
            self.stats.record_allocation(size);
        }

        #[cfg(feature = "logging")]
        trace!(subsystem = self.subsystem, size, align, "proxied allocation");

        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        let address = ptr.as_ptr() as usize;
        let Some(size) = self.allocation_size(ptr) else {
            return Err(self.config.misuse(AllocError::invalid_free(
                self.subsystem,
                address,
                "address was not allocated through this proxy",
            )));
        };

        // SAFETY: ptr is live in the backing allocator (it is in the map)
        // and the caller gives it up
        unsafe { self.backing.free(ptr)? };

        self.live.borrow_mut().remove(&address);
        self.live_bytes.set(self.live_bytes.get() - size);
        self.frees.set(self.frees.get() + 1);
        if self.config.track_stats {
            self.stats.record_deallocation(size);
        }

        #[cfg(feature = "logging")]
        trace!(subsystem = self.subsystem, size, "proxied free");

        Ok(())
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.backing.owns(ptr)
    }

    fn name(&self) -> &'static str {
        self.subsystem
    }

    fn supports_free(&self) -> bool {
        self.backing.supports_free()
    }

    fn address_range(&self) -> Option<Range<usize>> {
        self.backing.address_range()
    }
}

impl<A: Allocator + ?Sized> MemoryUsage for ProxyAllocator<'_, A> {
    fn used_memory(&self) -> usize {
        self.live_bytes()
    }

    fn available_memory(&self) -> Option<usize> {
        None
    }
}

impl<A: Allocator + ?Sized> StatisticsProvider for ProxyAllocator<'_, A> {
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

impl<A: Allocator + ?Sized> Drop for ProxyAllocator<'_, A> {
    fn drop(&mut self) {
        self.config
            .report_leaks_on_drop(self.subsystem, self.live_allocations(), self.live_bytes());
    }
}

impl<A: Allocator + ?Sized> fmt::Debug for ProxyAllocator<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAllocator")
            .field("subsystem", &self.subsystem)
            .field("backing", &self.backing.name())
            .field("live_allocations", &self.live_allocations())
            .field("live_bytes", &self.live_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{LinearAllocator, PoolAllocator};
    use crate::core::MisusePolicy;

    #[test]
    fn test_counts_follow_traffic() {
        let pool = PoolAllocator::with_blocks(64, 8, 8).expect("pool");
        let proxy = ProxyAllocator::with_config(&pool, "ui", AllocatorConfig::debug());

        let a = proxy.allocate(48, 8).expect("a");
        let b = proxy.allocate(16, 8).expect("b");
        assert_eq!(proxy.live_allocations(), 2);
        assert_eq!(proxy.live_bytes(), 64);
        assert_eq!(pool.allocated_blocks(), 2);

        unsafe { proxy.free(a) }.expect("free a");
        assert_eq!(proxy.live_allocations(), 1);
        assert_eq!(proxy.live_bytes(), 16);
        assert_eq!(proxy.allocation_count(), 2);
        assert_eq!(proxy.free_count(), 1);

        let stats = proxy.statistics();
        assert_eq!(stats.allocation_count, 2);
        assert_eq!(stats.deallocation_count, 1);
        assert_eq!(stats.peak_allocated_bytes, 64);

        unsafe { proxy.free(b) }.expect("free b");
        assert!(proxy.check_leaks().is_ok());
        assert_eq!(pool.allocated_blocks(), 0);
    }

    #[test]
    fn test_unknown_address_not_forwarded() {
        let pool = PoolAllocator::with_blocks(32, 8, 4).expect("pool");
        let proxy = ProxyAllocator::new(&pool, "net");
        let direct = pool.allocate(32, 8).expect("direct");

        let err = unsafe { proxy.free(direct) }.expect_err("not ours");
        assert!(err.is_invalid_free());
        assert_eq!(pool.allocated_blocks(), 1);
        unsafe { pool.free(direct) }.expect("free direct");
    }

    #[test]
    fn test_backing_rejection_keeps_counters() {
        let linear = LinearAllocator::with_capacity(256).expect("linear");
        let proxy = ProxyAllocator::with_config(
            &linear,
            "scratch",
            AllocatorConfig::default()
                .with_misuse_policy(MisusePolicy::Report)
                .with_leak_check(false),
        );
        let ptr = proxy.allocate(32, 8).expect("alloc");

        // linear allocators never free individually
        assert!(unsafe { proxy.free(ptr) }.is_err());
        assert_eq!(proxy.live_allocations(), 1);
        assert_eq!(proxy.free_count(), 0);
    }

    #[test]
    fn test_failure_passes_through() {
        let pool = PoolAllocator::with_blocks(32, 8, 1).expect("pool");
        let proxy = ProxyAllocator::with_config(&pool, "ai", AllocatorConfig::debug());
        let ptr = proxy.allocate(32, 8).expect("first");

        let err = proxy.allocate(32, 8).expect_err("exhausted");
        assert!(err.is_out_of_memory());
        assert_eq!(proxy.statistics().failed_allocations, 1);
        assert_eq!(proxy.live_allocations(), 1);

        unsafe { proxy.free(ptr) }.expect("free");
    }

    #[test]
    fn test_name_is_subsystem() {
        let pool = PoolAllocator::with_blocks(32, 8, 1).expect("pool");
        let proxy = ProxyAllocator::new(&pool, "render");
        assert_eq!(proxy.name(), "render");
        assert_eq!(proxy.backing().name(), "pool");
    }
}
