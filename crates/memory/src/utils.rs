//! Alignment arithmetic shared by every allocator
//!
//! All alignments handled here are powers of two. This is asserted in debug
//! builds only; the allocators validate caller-supplied alignments before
//! reaching these helpers.

use crate::error::{MemoryError, MemoryResult};

/// Offset of `address` past the previous multiple of `alignment`
///
/// Equivalent to `address % alignment`, computed with a mask. The result is
/// always in `[0, alignment)`.
///
/// # Examples
/// ```
/// use ember_memory::utils::alignment_offset;
///
/// assert_eq!(alignment_offset(8, 17), 1);
/// assert_eq!(alignment_offset(8, 16), 0);
/// ```
#[inline(always)]
pub const fn alignment_offset(alignment: usize, address: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    address & (alignment - 1)
}

/// Bytes to add to `address` to reach the next multiple of `alignment`
///
/// Zero when `address` is already aligned, otherwise
/// `alignment - alignment_offset(alignment, address)`. The result is always
/// strictly less than `alignment`.
///
/// # Examples
/// ```
/// use ember_memory::utils::alignment_adjustment;
///
/// assert_eq!(alignment_adjustment(8, 17), 7);
/// assert_eq!(alignment_adjustment(8, 16), 0);
/// ```
#[inline(always)]
pub const fn alignment_adjustment(alignment: usize, address: usize) -> usize {
    let offset = alignment_offset(alignment, address);
    if offset == 0 { 0 } else { alignment - offset }
}

/// Aligns a value up to the nearest multiple of alignment
///
/// # Examples
/// ```
/// use ember_memory::utils::align_up;
///
/// assert_eq!(align_up(7, 8), 8);
/// assert_eq!(align_up(8, 8), 8);
/// assert_eq!(align_up(9, 8), 16);
/// ```
#[inline(always)]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Aligns a value down to the nearest multiple of alignment
#[inline(always)]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Checks if a value is aligned to the given alignment
#[inline(always)]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    alignment_offset(alignment, value) == 0
}

/// Check if a pointer is properly aligned
#[inline(always)]
pub fn is_aligned_ptr<T>(ptr: *const T, alignment: usize) -> bool {
    is_aligned(ptr as usize, alignment)
}

/// Checked variant of [`align_up`] for sizes derived from caller input
#[inline]
pub fn checked_align_up(value: usize, alignment: usize) -> MemoryResult<usize> {
    value
        .checked_add(alignment - 1)
        .map(|v| align_down(v, alignment))
        .ok_or_else(|| MemoryError::size_overflow("align_up"))
}

/// Rejects zero sizes and non-power-of-two alignments
#[inline]
pub fn validate_request(size: usize, align: usize) -> MemoryResult<()> {
    if !align.is_power_of_two() {
        return Err(MemoryError::invalid_alignment(align));
    }
    if size == 0 {
        return Err(MemoryError::invalid_layout("zero-sized allocation"));
    }
    if size > isize::MAX as usize - (align - 1) {
        return Err(MemoryError::size_overflow("allocation size"));
    }
    Ok(())
}
