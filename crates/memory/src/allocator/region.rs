//! Fixed-capacity buffer drawn from a backing allocator
//!
//! Every partitioning allocator owns exactly one `Region`. The region is
//! allocated once at construction, never grows, and is returned to its
//! backing allocator on drop.

use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use super::{AllocResult, Allocator};

/// One contiguous buffer owned by an allocator
pub struct Region<'a, B: Allocator + ?Sized> {
    backing: &'a B,
    start: NonNull<u8>,
    capacity: usize,
}

impl<'a, B: Allocator + ?Sized> Region<'a, B> {
    /// Draws `capacity` bytes aligned to `align` from `backing`
    pub fn new(backing: &'a B, capacity: usize, align: usize) -> AllocResult<Self> {
        let start = backing.allocate(capacity, align)?;
        Ok(Self {
            backing,
            start,
            capacity,
        })
    }

    /// First byte of the buffer
    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Address of the first byte
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.start.as_ptr() as usize
    }

    /// The allocator the buffer was drawn from
    pub fn backing(&self) -> &'a B {
        self.backing
    }

    /// Offset of `ptr` from the start, if it lies inside the buffer
    #[inline]
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base_addr())?;
        (offset < self.capacity).then_some(offset)
    }

    /// Addresses covered by the buffer
    #[inline]
    pub fn address_range(&self) -> Range<usize> {
        self.base_addr()..self.base_addr() + self.capacity
    }

    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Pointer `offset` bytes into the buffer
    ///
    /// # Safety
    /// `offset` must not exceed the capacity.
    #[inline]
    pub(crate) unsafe fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity);
        // SAFETY: offset is within the allocation (caller contract)
        unsafe { self.start.add(offset) }
    }

    /// Fills `len` bytes starting at `offset` with `pattern`
    ///
    /// # Safety
    /// The range must lie inside the buffer and hold no live bookkeeping.
    #[inline]
    pub(crate) unsafe fn fill(&self, offset: usize, len: usize, pattern: u8) {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: range lies inside the buffer (caller contract)
        unsafe { self.at(offset).as_ptr().write_bytes(pattern, len) };
    }
}

impl<B: Allocator + ?Sized> Drop for Region<'_, B> {
    fn drop(&mut self) {
        if !self.backing.supports_free() {
            return;
        }
        // SAFETY: start was returned by backing.allocate in new() and is freed
        // exactly once. A failing free has already been reported.
        let _ = unsafe { self.backing.free(self.start) };
    }
}

impl<B: Allocator + ?Sized> fmt::Debug for Region<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("backing", &self.backing.name())
            .field("start", &self.start)
            .field("capacity", &self.capacity)
            .finish()
    }
}

// SAFETY: the region exclusively owns its buffer; moving it to another thread
// only requires that the backing allocator can be used from there
unsafe impl<B: Allocator + Sync + ?Sized> Send for Region<'_, B> {}
