//! # ember-memory
//!
//! Custom memory allocators for the Ember game engine runtime.
//!
//! Every allocator partitions one fixed-capacity buffer drawn from a backing
//! allocator at construction and never grows it afterwards:
//! - [`LinearAllocator`]: bump pointer, reset-only reclamation
//! - [`StackAllocator`]: LIFO with in-buffer headers, markers and frames
//! - [`PoolAllocator`]: fixed-size blocks on an intrusive free list
//! - [`FreeListAllocator`]: variable-size first-fit with splitting and coalescing
//! - [`ProxyAllocator`]: per-subsystem accounting over any other allocator
//!
//! ## Quick Start
//!
//! ```rust
//! use ember_memory::prelude::*;
//!
//! let frame = StackAllocator::with_capacity(4096)?;
//! let a = frame.allocate(64, 16)?;
//! let b = frame.allocate(32, 8)?;
//! unsafe {
//!     frame.free(b)?;
//!     frame.free(a)?;
//! }
//! # Ok::<(), ember_memory::MemoryError>(())
//! ```
//!
//! ## Features
//!
//! - `logging` (default): structured diagnostics through `tracing`
//! - `serde`: `Serialize`/`Deserialize` for [`AllocatorConfig`]
//!
//! ## Threading
//!
//! Allocators keep their bookkeeping in `Cell`s and are therefore `!Sync`.
//! Callers that share one instance between threads must serialize access
//! themselves, e.g. behind a mutex.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rust_2018_idioms)]
// Raw buffer partitioning is the whole point of this crate
#![allow(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Precision loss in usize -> f64 casts is acceptable for stats
#![allow(clippy::cast_precision_loss)]
// Returning &str tied to &self is fine for accessor methods
#![allow(clippy::unnecessary_literal_bound)]
#![allow(clippy::inline_always)]
#![allow(clippy::cast_ptr_alignment)]

// Error types
pub mod error;

// Core modules
pub mod allocator;
pub mod context;
pub mod core;
pub mod hook;
pub mod utils;

// Re-export core types for convenience
pub use crate::allocator::{
    Allocator, AllocatorStats, FreeListAllocator, LinearAllocator, PoolAllocator,
    ProxyAllocator, StackAllocator, StackFrame, StackMarker, SystemAllocator, TypedAllocator,
};
pub use crate::context::MemoryContext;
pub use crate::core::{AllocatorConfig, MemoryUsage, MisusePolicy, Resettable};
pub use crate::error::{AllocError, AllocResult, ErrorKind, MemoryError, MemoryResult, Result};
pub use crate::hook::GlobalHook;

// Public API exports
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::allocator::{
        AllocatedValue, Allocator, AllocatorStats, FragmentationStats, FreeListAllocator,
        LinearAllocator, PoolAllocator, ProxyAllocator, Region, StackAllocator, StackFrame,
        StackMarker, StatisticsProvider, SystemAllocator, TypedAllocator,
    };
    pub use crate::context::MemoryContext;
    pub use crate::core::{AllocatorConfig, MemoryUsage, MisusePolicy, Resettable};
    pub use crate::error::{AllocError, AllocResult, ErrorKind, MemoryError, MemoryResult};
    pub use crate::utils::{alignment_adjustment, alignment_offset};
}
