//! A stack allocator for LIFO (Last In, First Out) memory management.
//!
//! ## Modules
//! - `allocator` - Main `StackAllocator` implementation with in-buffer headers
//! - `frame` - RAII helper for automatic stack restoration
//! - `marker` - Position markers for scoped deallocation

pub mod allocator;
pub mod frame;
pub mod marker;

pub use allocator::StackAllocator;
pub use frame::StackFrame;
pub use marker::StackMarker;
