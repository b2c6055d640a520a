//! Allocator traits
//!
//! The system is built around two traits:
//! - `Allocator`: the capability every variant provides (`allocate`/`free`)
//! - `TypedAllocator`: type-driven helpers layered on top, implemented for
//!   every `Allocator` by a blanket impl
//!
//! # Safety
//!
//! `Allocator` is an unsafe trait: implementors promise that every pointer
//! returned by `allocate` is non-null, aligned to the requested alignment,
//! valid for `size` bytes of reads and writes, and disjoint from every other
//! live allocation of the same instance.

use core::alloc::Layout;
use core::ops::Range;
use core::ptr::NonNull;

use super::AllocResult;

/// The capability shared by every allocator variant
///
/// Methods take `&self`; allocators keep their bookkeeping in `Cell`s so a
/// single instance can be shared by reference between the subsystems of one
/// thread. The trait is object safe, so heterogeneous allocators can be
/// handled as `&dyn Allocator`.
///
/// # Safety
/// - Returned pointers must be valid for reads and writes of `size` bytes
/// - Returned pointers must be aligned to `align`
/// - No two live allocations may overlap
pub unsafe trait Allocator {
    /// Allocates `size` bytes aligned to `align`
    ///
    /// `size` must be positive and `align` a power of two; other values are
    /// rejected with an `InvalidArgument` kind error before any state is
    /// touched. The returned memory is uninitialized.
    fn allocate(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>>;

    /// Returns a previously allocated block to this allocator
    ///
    /// Addresses this instance does not currently own are reported as
    /// `InvalidFree` and leave the allocator unchanged.
    ///
    /// # Safety
    /// - The memory behind `ptr` must not be used after this call
    unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()>;

    /// Whether `ptr` lies inside the memory managed by this instance
    fn owns(&self, ptr: NonNull<u8>) -> bool;

    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Whether individual blocks can be returned through [`free`](Self::free)
    ///
    /// Allocators that only reclaim memory in bulk return `false`; owners
    /// such as regions and value guards then leave the block to the bulk
    /// release instead of calling `free`.
    #[inline]
    fn supports_free(&self) -> bool {
        true
    }

    /// Addresses of every block this instance can hand out
    ///
    /// Allocators that partition one fixed buffer report its span; `None`
    /// means the blocks are not confined to a known range.
    #[inline]
    fn address_range(&self) -> Option<Range<usize>> {
        None
    }

    /// Allocates memory for `layout`
    #[inline]
    fn allocate_layout(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        self.allocate(layout.size(), layout.align())
    }
}

/// Type-safe helpers over [`Allocator`]
///
/// # Examples
/// ```rust
/// use ember_memory::prelude::*;
///
/// let allocator = LinearAllocator::with_capacity(1024)?;
/// let value = allocator.try_alloc_value(String::from("hello"))?;
/// assert_eq!(&*value, "hello");
/// # Ok::<(), ember_memory::MemoryError>(())
/// ```
pub trait TypedAllocator: Allocator {
    /// Allocates uninitialized memory for one `T`
    ///
    /// Sugar for `allocate(size_of::<T>(), align_of::<T>())`.
    #[inline]
    fn allocate_for<T>(&self) -> AllocResult<NonNull<T>> {
        let layout = Layout::new::<T>();
        self.allocate_layout(layout).map(NonNull::cast)
    }

    /// Allocates and initializes memory for one `T`
    ///
    /// # Safety
    /// The caller must release the value with `free_typed::<T>()` (after
    /// dropping it) or leak it deliberately.
    #[inline]
    unsafe fn alloc_init<T>(&self, value: T) -> AllocResult<NonNull<T>> {
        let ptr = self.allocate_for::<T>()?;
        // SAFETY: ptr is freshly allocated, aligned for T and valid for writes
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Frees memory obtained from `allocate_for::<T>()` or `alloc_init`
    ///
    /// # Safety
    /// - `ptr` must have been allocated by this allocator
    /// - If `T` has a destructor, the caller must run it first
    #[inline]
    unsafe fn free_typed<T>(&self, ptr: NonNull<T>) -> AllocResult<()> {
        // SAFETY: forwarded caller contract
        unsafe { self.free(ptr.cast()) }
    }

    /// Safely allocate and initialize a value
    ///
    /// The returned guard drops the value and frees its memory on scope exit.
    #[inline]
    fn try_alloc_value<T>(&self, value: T) -> AllocResult<AllocatedValue<'_, T, Self>> {
        // SAFETY: ownership of the allocation moves into the guard
        let ptr = unsafe { self.alloc_init(value)? };
        Ok(AllocatedValue {
            ptr,
            allocator: self,
        })
    }
}

impl<A: Allocator + ?Sized> TypedAllocator for A {}

/// RAII wrapper for an allocated value
///
/// Drops the value and frees the memory when the guard goes out of scope.
pub struct AllocatedValue<'a, T, A: Allocator + ?Sized> {
    ptr: NonNull<T>,
    allocator: &'a A,
}

impl<T, A: Allocator + ?Sized> AllocatedValue<'_, T, A> {
    /// Address of the value inside the allocator's buffer
    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }
}

impl<T, A: Allocator + ?Sized> core::ops::Deref for AllocatedValue<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ptr is valid and initialized (from alloc_init)
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, A: Allocator + ?Sized> core::ops::DerefMut for AllocatedValue<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: ptr is valid, initialized and uniquely owned by this guard
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, A: Allocator + ?Sized> Drop for AllocatedValue<'_, T, A> {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated by self.allocator via alloc_init and is
        // dropped exactly once here. A failing free has already been reported
        // by the allocator.
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
            if self.allocator.supports_free() {
                let _ = self.allocator.free_typed(self.ptr);
            }
        }
    }
}

// ============================================================================
// Blanket implementations for references
// ============================================================================

// SAFETY: every call is forwarded to the underlying allocator unchanged
unsafe impl<T: Allocator + ?Sized> Allocator for &T {
    #[inline]
    fn allocate(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        (**self).allocate(size, align)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        // SAFETY: same contract as T::free
        unsafe { (**self).free(ptr) }
    }

    #[inline]
    fn owns(&self, ptr: NonNull<u8>) -> bool {
        (**self).owns(ptr)
    }

    #[inline]
    fn name(&self) -> &'static str {
        (**self).name()
    }

    #[inline]
    fn supports_free(&self) -> bool {
        (**self).supports_free()
    }

    #[inline]
    fn address_range(&self) -> Option<Range<usize>> {
        (**self).address_range()
    }
}
