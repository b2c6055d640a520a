//! Allocator configuration
//!
//! One configuration type is shared by every allocator variant. The presets
//! mirror the usual build profiles: `production()` for shipping builds,
//! `debug()` for catching misuse early, `performance()` for benchmarks.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// What to do when a caller misuses an allocator
///
/// Misuse covers invalid frees (unknown address, double free, non-LIFO pop)
/// and allocations still outstanding at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MisusePolicy {
    /// Log the problem and return it as a recoverable error
    #[default]
    Report,
    /// Halt with a panic carrying the error message
    Abort,
}

/// Configuration for every allocator in this crate
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AllocatorConfig {
    /// Enable statistics tracking
    pub track_stats: bool,

    /// Fill patterns for debugging
    pub alloc_pattern: Option<u8>,
    pub dealloc_pattern: Option<u8>,

    /// Reaction to invalid frees and leaks
    pub on_misuse: MisusePolicy,

    /// Run leak detection when the allocator is dropped
    pub check_leaks: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            track_stats: cfg!(debug_assertions),
            alloc_pattern: if cfg!(debug_assertions) { Some(0xCC) } else { None },
            dealloc_pattern: if cfg!(debug_assertions) { Some(0xDD) } else { None },
            on_misuse: MisusePolicy::Report,
            check_leaks: true,
        }
    }
}

impl AllocatorConfig {
    /// Production configuration - stats and fills off, misuse reported
    pub fn production() -> Self {
        Self {
            track_stats: false,
            alloc_pattern: None,
            dealloc_pattern: None,
            on_misuse: MisusePolicy::Report,
            check_leaks: true,
        }
    }

    /// Debug configuration - everything on, misuse is a hard stop
    pub fn debug() -> Self {
        Self {
            track_stats: true,
            alloc_pattern: Some(0xCC),
            dealloc_pattern: Some(0xDD),
            on_misuse: MisusePolicy::Abort,
            check_leaks: true,
        }
    }

    /// Performance configuration - minimal overhead
    pub fn performance() -> Self {
        Self {
            track_stats: false,
            alloc_pattern: None,
            dealloc_pattern: None,
            on_misuse: MisusePolicy::Report,
            check_leaks: false,
        }
    }

    pub fn with_stats(mut self, track_stats: bool) -> Self {
        self.track_stats = track_stats;
        self
    }

    pub fn with_alloc_pattern(mut self, pattern: Option<u8>) -> Self {
        self.alloc_pattern = pattern;
        self
    }

    pub fn with_dealloc_pattern(mut self, pattern: Option<u8>) -> Self {
        self.dealloc_pattern = pattern;
        self
    }

    pub fn with_misuse_policy(mut self, policy: MisusePolicy) -> Self {
        self.on_misuse = policy;
        self
    }

    pub fn with_leak_check(mut self, check_leaks: bool) -> Self {
        self.check_leaks = check_leaks;
        self
    }

    /// Applies the misuse policy to an error produced by a bad free
    ///
    /// Returns the error unchanged under [`MisusePolicy::Report`] and panics
    /// under [`MisusePolicy::Abort`].
    pub(crate) fn misuse(&self, error: MemoryError) -> MemoryError {
        match self.on_misuse {
            MisusePolicy::Report => error,
            MisusePolicy::Abort => panic!("{error}"),
        }
    }

    /// Leak check run from an allocator's `Drop`
    ///
    /// Never panics while the thread is already unwinding.
    pub(crate) fn report_leaks_on_drop(&self, allocator: &'static str, count: usize, bytes: usize) {
        if !self.check_leaks || count == 0 {
            return;
        }
        let error = MemoryError::leak_detected(allocator, count, bytes);
        if self.on_misuse == MisusePolicy::Abort && !std::thread::panicking() {
            panic!("{error}");
        }
    }
}
