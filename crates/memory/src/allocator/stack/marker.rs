//! Stack position markers

use core::ptr::NonNull;

use super::allocator::StackHeader;

/// Position in a [`StackAllocator`](super::StackAllocator)
///
/// Obtained from `mark()`; passing it to `release()` pops every allocation
/// made after it at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackMarker {
    pub(super) offset: usize,
    pub(super) top: Option<NonNull<StackHeader>>,
    pub(super) allocated_bytes: usize,
    pub(super) owner: usize,
}

impl StackMarker {
    /// Buffer offset recorded by the marker
    pub fn offset(&self) -> usize {
        self.offset
    }
}
