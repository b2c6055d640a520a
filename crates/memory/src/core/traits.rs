//! Core traits for memory management
//!
//! Capacity introspection and reset, shared by every allocator.

use core::fmt;

/// Memory usage tracking trait
///
/// Implemented by allocators that can report how much of their buffer is in
/// use. Provides both basic capacity information and convenience methods for
/// monitoring.
pub trait MemoryUsage {
    /// Get currently used memory in bytes
    fn used_memory(&self) -> usize;

    /// Get available memory in bytes (if known)
    fn available_memory(&self) -> Option<usize>;

    /// Get total memory capacity in bytes (if known)
    fn total_memory(&self) -> Option<usize> {
        self.available_memory()
            .map(|available| self.used_memory() + available)
    }

    /// Returns memory usage as a percentage (0.0 to 100.0)
    ///
    /// Returns `None` if total memory is unknown.
    fn memory_usage_percent(&self) -> Option<f32> {
        self.total_memory().map(|total| {
            if total == 0 {
                0.0
            } else {
                (self.used_memory() as f32 / total as f32) * 100.0
            }
        })
    }

    /// Returns a snapshot of the values above
    fn memory_usage(&self) -> BasicMemoryUsage {
        BasicMemoryUsage {
            used: self.used_memory(),
            available: self.available_memory(),
            total: self.total_memory(),
            usage_percent: self.memory_usage_percent(),
        }
    }
}

/// Basic memory usage information
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasicMemoryUsage {
    /// Currently used memory in bytes
    pub used: usize,
    /// Available memory in bytes (None if unlimited)
    pub available: Option<usize>,
    /// Total memory capacity in bytes (None if unlimited)
    pub total: Option<usize>,
    /// Memory usage as percentage (None if cannot be calculated)
    pub usage_percent: Option<f32>,
}

impl fmt::Display for BasicMemoryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "used: {} bytes", self.used)?;

        if let Some(total) = self.total {
            write!(f, ", total: {total} bytes")?;
        }

        if let Some(percent) = self.usage_percent {
            write!(f, " ({percent:.1}%)")?;
        }

        Ok(())
    }
}

/// Allocators that can drop every allocation at once
pub trait Resettable {
    /// Reset allocator to initial state
    ///
    /// # Safety
    /// - All pointers allocated before reset become invalid immediately
    /// - Caller must ensure no live references into the buffer exist
    unsafe fn reset(&self);
}

impl<T: MemoryUsage + ?Sized> MemoryUsage for &T {
    fn used_memory(&self) -> usize {
        (**self).used_memory()
    }

    fn available_memory(&self) -> Option<usize> {
        (**self).available_memory()
    }
}

impl<T: Resettable + ?Sized> Resettable for &T {
    unsafe fn reset(&self) {
        // SAFETY: same contract as T::reset, forwarded unchanged
        unsafe { (**self).reset() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        used: usize,
        available: usize,
    }

    impl MemoryUsage for Fixed {
        fn used_memory(&self) -> usize {
            self.used
        }

        fn available_memory(&self) -> Option<usize> {
            Some(self.available)
        }
    }

    #[test]
    fn test_usage_defaults() {
        let usage = Fixed {
            used: 25,
            available: 75,
        };
        assert_eq!(usage.total_memory(), Some(100));
        assert_eq!(usage.memory_usage_percent(), Some(25.0));
        assert_eq!(usage.memory_usage().to_string(), "used: 25 bytes, total: 100 bytes (25.0%)");
    }

    #[test]
    fn test_empty_capacity() {
        let usage = Fixed {
            used: 0,
            available: 0,
        };
        assert_eq!(usage.memory_usage_percent(), Some(0.0));
    }
}
