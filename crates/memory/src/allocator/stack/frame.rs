//! RAII-based stack frame for automatic restoration

#[cfg(feature = "logging")]
use tracing::error;

use super::{StackAllocator, StackMarker};
use crate::allocator::Allocator;

/// RAII helper for stack-based scoped allocation
///
/// Releases every allocation made after the frame was opened when it goes
/// out of scope.
pub struct StackFrame<'s, 'a, B: Allocator + ?Sized> {
    allocator: &'s StackAllocator<'a, B>,
    marker: StackMarker,
}

impl<'s, 'a, B: Allocator + ?Sized> StackFrame<'s, 'a, B> {
    /// Opens a frame at the allocator's current position
    pub fn new(allocator: &'s StackAllocator<'a, B>) -> Self {
        let marker = allocator.mark();
        Self { allocator, marker }
    }

    /// Gets the underlying allocator
    pub fn allocator(&self) -> &'s StackAllocator<'a, B> {
        self.allocator
    }

    pub fn marker(&self) -> StackMarker {
        self.marker
    }

    /// Manually restore and consume this frame
    pub fn restore(self) {
        drop(self);
    }
}

impl<B: Allocator + ?Sized> Drop for StackFrame<'_, '_, B> {
    fn drop(&mut self) {
        // SAFETY: the frame borrows the allocator for its whole life, so
        // allocations made inside it cannot outlive it through this borrow
        let result = unsafe { self.allocator.release(self.marker) };
        #[cfg(feature = "logging")]
        if let Err(err) = result {
            error!(
                allocator = "stack",
                offset = self.marker.offset(),
                error = %err,
                "stack frame could not release its allocations"
            );
        }
        #[cfg(not(feature = "logging"))]
        drop(result);
    }
}
