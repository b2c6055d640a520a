//! Standalone error types for ember-memory
//!
//! Uses thiserror for clean, idiomatic Rust error definitions. Every variant
//! maps onto one [`ErrorKind`], so callers can branch on the broad category
//! (out of memory, misuse, leak, ...) while logs keep the precise reason.

use core::alloc::Layout;
use core::fmt;

use thiserror::Error;

#[cfg(feature = "logging")]
use tracing::{error, warn};

// ============================================================================
// Error Kinds
// ============================================================================

/// Broad category of a [`MemoryError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request cannot be satisfied within the remaining capacity
    OutOfMemory,
    /// Size or alignment rejected before any state was touched
    InvalidArgument,
    /// `free` called with an address this instance does not currently own
    InvalidFree,
    /// Allocations still outstanding at teardown
    LeakDetected,
    /// Allocator could not be constructed with the given parameters
    ConstructionPrecondition,
    /// In-buffer bookkeeping no longer satisfies its invariants
    Corruption,
    /// Operation not valid in the current lifecycle state
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidArgument => "invalid argument",
            Self::InvalidFree => "invalid free",
            Self::LeakDetected => "leak detected",
            Self::ConstructionPrecondition => "construction precondition",
            Self::Corruption => "corruption",
            Self::InvalidState => "invalid state",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Main Error Type
// ============================================================================

/// Memory management errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    // --- Capacity Errors ---
    #[error("{allocator} out of memory: {requested} bytes at align {align}, {available} available")]
    OutOfMemory {
        allocator: &'static str,
        requested: usize,
        align: usize,
        available: usize,
    },

    #[error(
        "{allocator} fragmented: {requested} bytes at align {align}, largest block {largest_block}"
    )]
    Fragmented {
        allocator: &'static str,
        requested: usize,
        align: usize,
        free: usize,
        largest_block: usize,
    },

    #[error("Pool exhausted: all {block_count} blocks of {block_size} bytes are in use")]
    PoolExhausted {
        block_size: usize,
        block_count: usize,
    },

    // --- Argument Errors ---
    #[error("Invalid alignment: {alignment} is not a power of two")]
    InvalidAlignment { alignment: usize },

    #[error("Unsupported alignment: {alignment} exceeds the maximum of {max}")]
    UnsupportedAlignment { alignment: usize, max: usize },

    #[error("Invalid memory layout: {reason}")]
    InvalidLayout { reason: String },

    #[error("Allocation of {size} bytes exceeds the block size of {block_size} bytes")]
    ExceedsBlockSize { size: usize, block_size: usize },

    #[error("Size overflow during operation: {operation}")]
    SizeOverflow { operation: String },

    // --- Misuse Errors ---
    #[error("Invalid free in {allocator} at {address:#x}: {reason}")]
    InvalidFree {
        allocator: &'static str,
        address: usize,
        reason: String,
    },

    #[error("{allocator} leaked {count} allocation(s) totalling {bytes} bytes")]
    LeakDetected {
        allocator: &'static str,
        count: usize,
        bytes: usize,
    },

    // --- Construction Errors ---
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // --- System Errors ---
    #[error("Memory corruption detected in {component}: {details}")]
    Corruption { component: String, details: String },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },
}

impl MemoryError {
    /// Broad category of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } | Self::Fragmented { .. } | Self::PoolExhausted { .. } => {
                ErrorKind::OutOfMemory
            }
            Self::InvalidAlignment { .. }
            | Self::UnsupportedAlignment { .. }
            | Self::InvalidLayout { .. }
            | Self::ExceedsBlockSize { .. }
            | Self::SizeOverflow { .. } => ErrorKind::InvalidArgument,
            Self::InvalidFree { .. } => ErrorKind::InvalidFree,
            Self::LeakDetected { .. } => ErrorKind::LeakDetected,
            Self::InvalidConfig { .. } => ErrorKind::ConstructionPrecondition,
            Self::Corruption { .. } => ErrorKind::Corruption,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "MEM:ALLOC:OOM",
            Self::Fragmented { .. } => "MEM:ALLOC:FRAGMENTED",
            Self::PoolExhausted { .. } => "MEM:POOL:EXHAUSTED",
            Self::InvalidAlignment { .. } => "MEM:ALLOC:ALIGN",
            Self::UnsupportedAlignment { .. } => "MEM:ALLOC:ALIGN_UNSUPPORTED",
            Self::InvalidLayout { .. } => "MEM:ALLOC:LAYOUT",
            Self::ExceedsBlockSize { .. } => "MEM:POOL:BLOCK_SIZE",
            Self::SizeOverflow { .. } => "MEM:ALLOC:OVERFLOW",
            Self::InvalidFree { .. } => "MEM:FREE:INVALID",
            Self::LeakDetected { .. } => "MEM:TEARDOWN:LEAK",
            Self::InvalidConfig { .. } => "MEM:CONFIG:INVALID",
            Self::Corruption { .. } => "MEM:SYSTEM:CORRUPTION",
            Self::InvalidState { .. } => "MEM:SYSTEM:STATE",
        }
    }

    /// True for every error of kind [`ErrorKind::OutOfMemory`]
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        self.kind() == ErrorKind::OutOfMemory
    }

    /// True for every error of kind [`ErrorKind::InvalidFree`]
    #[must_use]
    pub fn is_invalid_free(&self) -> bool {
        self.kind() == ErrorKind::InvalidFree
    }

    // ============================================================================
    // Convenience Constructors - Capacity Errors
    // ============================================================================

    /// Create out of memory error
    pub fn out_of_memory(
        allocator: &'static str,
        requested: usize,
        align: usize,
        available: usize,
    ) -> Self {
        #[cfg(feature = "logging")]
        warn!(allocator, requested, align, available, "allocation failed: out of memory");

        Self::OutOfMemory {
            allocator,
            requested,
            align,
            available,
        }
    }

    /// Create out of memory error from layout
    pub fn out_of_memory_with_layout(
        allocator: &'static str,
        layout: Layout,
        available: usize,
    ) -> Self {
        Self::out_of_memory(allocator, layout.size(), layout.align(), available)
    }

    /// Create fragmentation error
    pub fn fragmented(
        allocator: &'static str,
        requested: usize,
        align: usize,
        free: usize,
        largest_block: usize,
    ) -> Self {
        #[cfg(feature = "logging")]
        warn!(
            allocator,
            requested, align, free, largest_block, "allocation failed: no free block fits"
        );

        Self::Fragmented {
            allocator,
            requested,
            align,
            free,
            largest_block,
        }
    }

    /// Create pool exhausted error
    pub fn pool_exhausted(block_size: usize, block_count: usize) -> Self {
        #[cfg(feature = "logging")]
        warn!(block_size, block_count, "memory pool exhausted");

        Self::PoolExhausted {
            block_size,
            block_count,
        }
    }

    // ============================================================================
    // Convenience Constructors - Argument Errors
    // ============================================================================

    /// Create invalid alignment error
    pub fn invalid_alignment(alignment: usize) -> Self {
        Self::InvalidAlignment { alignment }
    }

    /// Create unsupported alignment error
    pub fn unsupported_alignment(alignment: usize, max: usize) -> Self {
        Self::UnsupportedAlignment { alignment, max }
    }

    /// Create invalid layout error
    pub fn invalid_layout(reason: &str) -> Self {
        Self::InvalidLayout {
            reason: reason.to_string(),
        }
    }

    /// Create block size exceeded error
    pub fn exceeds_block_size(size: usize, block_size: usize) -> Self {
        Self::ExceedsBlockSize { size, block_size }
    }

    /// Create size overflow error
    pub fn size_overflow(operation: &str) -> Self {
        Self::SizeOverflow {
            operation: operation.to_string(),
        }
    }

    // ============================================================================
    // Convenience Constructors - Misuse and Lifecycle Errors
    // ============================================================================

    /// Create invalid free error
    pub fn invalid_free(allocator: &'static str, address: usize, reason: &str) -> Self {
        #[cfg(feature = "logging")]
        error!(allocator, address, reason, "invalid free");

        Self::InvalidFree {
            allocator,
            address,
            reason: reason.to_string(),
        }
    }

    /// Create leak detected error
    pub fn leak_detected(allocator: &'static str, count: usize, bytes: usize) -> Self {
        #[cfg(feature = "logging")]
        error!(allocator, count, bytes, "allocations outstanding at teardown");

        Self::LeakDetected {
            allocator,
            count,
            bytes,
        }
    }

    /// Create invalid config error
    pub fn invalid_config(reason: &str) -> Self {
        Self::InvalidConfig {
            reason: reason.to_string(),
        }
    }

    /// Create memory corruption error
    pub fn corruption(component: &str, details: &str) -> Self {
        #[cfg(feature = "logging")]
        error!(component, details, "memory corruption detected");

        Self::Corruption {
            component: component.to_string(),
            details: details.to_string(),
        }
    }

    /// Create invalid state error
    pub fn invalid_state(reason: &str) -> Self {
        Self::InvalidState {
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result type for memory operations
pub type MemoryResult<T> = core::result::Result<T, MemoryError>;

/// Generic result type alias
pub type Result<T> = MemoryResult<T>;

/// Type aliases for the allocator module
pub type AllocError = MemoryError;
pub type AllocResult<T> = MemoryResult<T>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_message() {
        let error = MemoryError::out_of_memory("linear", 1024, 8, 512);
        let message = error.to_string();
        assert!(message.contains("1024"));
        assert!(message.contains("512"));
        assert!(message.contains("linear"));
    }

    #[test]
    fn test_error_with_layout() {
        let layout = Layout::new::<u64>();
        let error = MemoryError::out_of_memory_with_layout("stack", layout, 0);
        assert!(error.to_string().contains(&layout.size().to_string()));
    }

    #[test]
    fn test_capacity_errors_share_kind() {
        assert_eq!(
            MemoryError::out_of_memory("linear", 1, 1, 0).kind(),
            ErrorKind::OutOfMemory
        );
        assert_eq!(
            MemoryError::fragmented("free_list", 64, 8, 100, 32).kind(),
            ErrorKind::OutOfMemory
        );
        assert_eq!(
            MemoryError::pool_exhausted(32, 4).kind(),
            ErrorKind::OutOfMemory
        );
        assert!(MemoryError::pool_exhausted(32, 4).is_out_of_memory());
    }

    #[test]
    fn test_argument_errors() {
        assert_eq!(
            MemoryError::invalid_alignment(3).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            MemoryError::exceeds_block_size(64, 32).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            MemoryError::size_overflow("test").kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_invalid_free() {
        let error = MemoryError::invalid_free("stack", 0x1000, "not the top of the stack");
        assert!(error.is_invalid_free());
        assert!(error.to_string().contains("0x1000"));
    }

    #[test]
    fn test_leak_and_config() {
        let error = MemoryError::leak_detected("pool", 3, 96);
        assert_eq!(error.kind(), ErrorKind::LeakDetected);
        assert!(error.to_string().contains("3 allocation"));

        let error = MemoryError::invalid_config("block size too small");
        assert_eq!(error.kind(), ErrorKind::ConstructionPrecondition);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            MemoryError::out_of_memory("linear", 1, 1, 0).code(),
            "MEM:ALLOC:OOM"
        );
        assert_eq!(MemoryError::pool_exhausted(8, 1).code(), "MEM:POOL:EXHAUSTED");
        assert_eq!(
            MemoryError::invalid_free("pool", 0, "x").code(),
            "MEM:FREE:INVALID"
        );
    }
}
