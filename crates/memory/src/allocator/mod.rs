//! Allocator implementations
//!
//! ## Modules
//! - `traits` - The [`Allocator`] capability and typed helpers on top of it
//! - `system` - [`SystemAllocator`], root of every hierarchy
//! - `region` - The fixed buffer each allocator partitions
//! - `linear` - Bump allocation with reset-only reclamation
//! - `stack` - LIFO allocation with markers and frames
//! - `pool` - Fixed-size blocks on an intrusive free list
//! - `free_list` - Variable-size first-fit with coalescing
//! - `proxy` - Per-subsystem accounting over another allocator
//! - `stats` - Counters shared by all of the above

pub mod free_list;
pub mod linear;
pub mod pool;
pub mod proxy;
pub mod region;
pub mod stack;
pub mod stats;
pub mod system;
pub mod traits;

pub use crate::core::{MemoryUsage, Resettable};
pub use crate::error::{AllocError, AllocResult};

pub use free_list::{FreeListAllocator, FreeSpan};
pub use linear::{LinearAllocator, LinearCheckpoint, LinearScope};
pub use pool::PoolAllocator;
pub use proxy::ProxyAllocator;
pub use region::Region;
pub use stack::{StackAllocator, StackFrame, StackMarker};
pub use stats::{AllocatorStats, FragmentationStats, StatisticsProvider};
pub use system::SystemAllocator;
pub use traits::{AllocatedValue, Allocator, TypedAllocator};

/// Alignment of every buffer drawn from a backing allocator
pub(crate) const REGION_ALIGN: usize = 16;
