//! System allocator implementation
//!
//! Root of every allocator hierarchy: hands out raw buffers from
//! `std::alloc::System`. The allocation layout is kept in a small prefix in
//! front of each block so `free` needs nothing but the address.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use std::alloc::System;

use super::{AllocError, AllocResult, Allocator};
use crate::utils::validate_request;

/// Bytes reserved in front of each block for the layout record
const PREFIX: usize = 16;

#[repr(C)]
struct LayoutRecord {
    size: usize,
    align: usize,
}

const _: () = assert!(size_of::<LayoutRecord>() <= PREFIX);

/// Shared instance backing the `with_capacity` constructors
pub static SYSTEM: SystemAllocator = SystemAllocator;

/// Wrapper for the system's default allocator
///
/// Stateless and thread-safe. It cannot tell its own blocks apart from other
/// heap memory, so [`Allocator::owns`] always answers `false` and `free`
/// trusts its caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl SystemAllocator {
    /// Creates a new `SystemAllocator`
    #[inline]
    pub const fn new() -> Self {
        Self
    }
}

unsafe impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        validate_request(size, align)?;

        let prefix = PREFIX.max(align);
        let total = size
            .checked_add(prefix)
            .ok_or_else(|| AllocError::size_overflow("system allocation"))?;
        let layout = Layout::from_size_align(total, prefix)
            .map_err(|_| AllocError::invalid_layout("system allocation"))?;

        // SAFETY: layout has a non-zero size
        let base = unsafe { System.alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            return Err(AllocError::out_of_memory("system", size, align, 0));
        };

        // SAFETY: prefix < total, so both the payload and the record directly
        // before it lie inside the block. The payload is aligned to
        // max(PREFIX, align) >= align_of::<LayoutRecord>().
        unsafe {
            let payload = base.add(prefix);
            payload
                .cast::<LayoutRecord>()
                .sub(1)
                .write(LayoutRecord { size: total, align: prefix });
            Ok(payload)
        }
    }

    /// # Safety
    /// `ptr` must come from this allocator and must not have been freed.
    unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        // SAFETY: ptr was returned by allocate (caller contract), so the
        // layout record sits directly in front of it and base = ptr - prefix
        unsafe {
            let record = ptr.cast::<LayoutRecord>().sub(1).read();
            let layout = Layout::from_size_align_unchecked(record.size, record.align);
            let base = ptr.sub(record.align);
            System.dealloc(base.as_ptr(), layout);
        }
        Ok(())
    }

    fn owns(&self, _ptr: NonNull<u8>) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::is_aligned_ptr;

    #[test]
    fn test_basic_allocation() {
        let allocator = SystemAllocator::new();
        let ptr = allocator.allocate(64, 8).expect("allocation should succeed");
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, 64);
            assert_eq!(*ptr.as_ptr().add(63), 0xAB);
            allocator.free(ptr).expect("free should succeed");
        }
    }

    #[test]
    fn test_large_alignment() {
        let allocator = SystemAllocator::new();
        for align in [1, 2, 16, 64, 4096] {
            let ptr = allocator.allocate(24, align).expect("allocation should succeed");
            assert!(is_aligned_ptr(ptr.as_ptr(), align));
            unsafe { allocator.free(ptr).expect("free should succeed") };
        }
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let allocator = SystemAllocator::new();
        assert!(allocator.allocate(0, 8).is_err());
        assert!(allocator.allocate(8, 3).is_err());
        assert!(!allocator.owns(NonNull::dangling()));
    }
}
