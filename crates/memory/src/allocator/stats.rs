//! Allocator statistics tracking
//!
//! Provides the snapshot type returned by every allocator, the `Cell` based
//! recorder the allocators update on their hot path, and fragmentation
//! metrics for the free-list allocator.

use core::cell::Cell;
use core::fmt;

/// Statistics for memory allocators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Total bytes currently allocated
    pub allocated_bytes: usize,
    /// Peak bytes allocated
    pub peak_allocated_bytes: usize,
    /// Total number of allocations
    pub allocation_count: usize,
    /// Total number of deallocations
    pub deallocation_count: usize,
    /// Number of failed allocations
    pub failed_allocations: usize,
    /// Total bytes ever allocated (cumulative)
    pub total_bytes_allocated: usize,
    /// Total bytes ever deallocated (cumulative)
    pub total_bytes_deallocated: usize,
}

impl AllocatorStats {
    /// Creates a new empty stats object
    pub const fn new() -> Self {
        Self {
            allocated_bytes: 0,
            peak_allocated_bytes: 0,
            allocation_count: 0,
            deallocation_count: 0,
            failed_allocations: 0,
            total_bytes_allocated: 0,
            total_bytes_deallocated: 0,
        }
    }

    /// Calculate the average allocation size
    pub fn average_allocation_size(&self) -> Option<f64> {
        if self.allocation_count > 0 {
            Some(self.total_bytes_allocated as f64 / self.allocation_count as f64)
        } else {
            None
        }
    }

    /// Fraction of allocation attempts that succeeded (0.0 to 1.0)
    pub fn allocation_efficiency(&self) -> f64 {
        let total_attempts = self.allocation_count + self.failed_allocations;
        if total_attempts > 0 {
            self.allocation_count as f64 / total_attempts as f64
        } else {
            1.0
        }
    }

    /// Check if there are any active allocations
    pub fn has_active_allocations(&self) -> bool {
        self.allocation_count > self.deallocation_count
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocator Statistics:")?;
        writeln!(f, "  Current allocated: {} bytes", self.allocated_bytes)?;
        writeln!(f, "  Peak allocated: {} bytes", self.peak_allocated_bytes)?;
        writeln!(f, "  Allocations: {}", self.allocation_count)?;
        writeln!(f, "  Deallocations: {}", self.deallocation_count)?;
        writeln!(f, "  Failed allocations: {}", self.failed_allocations)?;

        if let Some(avg) = self.average_allocation_size() {
            writeln!(f, "  Average allocation size: {avg:.2} bytes")?;
        }

        writeln!(
            f,
            "  Allocation efficiency: {:.2}%",
            self.allocation_efficiency() * 100.0
        )
    }
}

/// Single-threaded statistics recorder
///
/// Allocators only touch it when `track_stats` is enabled.
#[derive(Debug, Default)]
pub(crate) struct StatsCell {
    inner: Cell<AllocatorStats>,
}

impl StatsCell {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Cell::new(AllocatorStats::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> AllocatorStats {
        self.inner.get()
    }

    pub(crate) fn reset(&self) {
        self.inner.set(AllocatorStats::new());
    }

    fn update(&self, f: impl FnOnce(&mut AllocatorStats)) {
        let mut stats = self.inner.get();
        f(&mut stats);
        self.inner.set(stats);
    }

    pub(crate) fn record_allocation(&self, size: usize) {
        self.update(|s| {
            s.allocation_count += 1;
            s.total_bytes_allocated = s.total_bytes_allocated.saturating_add(size);
            s.allocated_bytes = s.allocated_bytes.saturating_add(size);
            s.peak_allocated_bytes = s.peak_allocated_bytes.max(s.allocated_bytes);
        });
    }

    pub(crate) fn record_deallocation(&self, size: usize) {
        self.update(|s| {
            s.deallocation_count += 1;
            s.total_bytes_deallocated = s.total_bytes_deallocated.saturating_add(size);
            s.allocated_bytes = s.allocated_bytes.saturating_sub(size);
        });
    }

    pub(crate) fn record_failure(&self) {
        self.update(|s| s.failed_allocations += 1);
    }

    /// Bulk release (reset, rewind, marker release)
    pub(crate) fn record_release(&self, count: usize, bytes: usize) {
        self.update(|s| {
            s.deallocation_count += count;
            s.total_bytes_deallocated = s.total_bytes_deallocated.saturating_add(bytes);
            s.allocated_bytes = s.allocated_bytes.saturating_sub(bytes);
        });
    }
}

/// Statistics provider trait
///
/// Implemented by every allocator in this crate.
pub trait StatisticsProvider {
    /// Get current statistics
    fn statistics(&self) -> AllocatorStats;

    /// Reset statistics
    fn reset_statistics(&self);

    /// Check if statistics collection is enabled
    fn statistics_enabled(&self) -> bool {
        true
    }
}

// ============================================================================
// Fragmentation Statistics
// ============================================================================

/// Fragmentation statistics for memory analysis
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FragmentationStats {
    /// Total free memory across all fragments (bytes)
    pub total_free: usize,

    /// Size of the largest contiguous free block (bytes)
    pub largest_block: usize,

    /// Number of distinct free fragments
    pub fragment_count: usize,

    /// External fragmentation ratio (0-100)
    ///
    /// Calculated as: `100 * (1 - largest_block / total_free)`
    pub fragmentation_percent: u8,
}

impl FragmentationStats {
    /// Calculate fragmentation percentage from free space metrics
    pub fn calculate(total_free: usize, largest_block: usize, fragment_count: usize) -> Self {
        let fragmentation_percent = if total_free > 0 {
            let ratio = 1.0 - (largest_block as f64 / total_free as f64);
            (ratio * 100.0).clamp(0.0, 100.0) as u8
        } else {
            0
        };

        Self {
            total_free,
            largest_block,
            fragment_count,
            fragmentation_percent,
        }
    }

    /// Check if fragmentation is concerning (>50%)
    #[inline]
    pub fn is_fragmented(&self) -> bool {
        self.fragmentation_percent > 50
    }
}

impl fmt::Display for FragmentationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FragmentationStats {{ total_free: {} bytes, largest_block: {} bytes, \
             fragments: {}, fragmentation: {}% }}",
            self.total_free, self.largest_block, self.fragment_count, self.fragmentation_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_allocation_tracks_peak() {
        let stats = StatsCell::new();
        stats.record_allocation(100);
        stats.record_allocation(50);
        stats.record_deallocation(100);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.allocated_bytes, 50);
        assert_eq!(snapshot.peak_allocated_bytes, 150);
        assert_eq!(snapshot.allocation_count, 2);
        assert_eq!(snapshot.deallocation_count, 1);
        assert!(snapshot.has_active_allocations());
    }

    #[test]
    fn test_bulk_release() {
        let stats = StatsCell::new();
        stats.record_allocation(16);
        stats.record_allocation(16);
        stats.record_release(2, 32);
        assert_eq!(stats.snapshot().allocated_bytes, 0);
        assert!(!stats.snapshot().has_active_allocations());

        stats.reset();
        assert_eq!(stats.snapshot(), AllocatorStats::new());
    }

    #[test]
    fn test_efficiency() {
        let stats = StatsCell::new();
        stats.record_allocation(8);
        stats.record_failure();
        assert!((stats.snapshot().allocation_efficiency() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fragmentation_calculate() {
        let stats = FragmentationStats::calculate(1000, 250, 4);
        assert_eq!(stats.fragmentation_percent, 75);
        assert!(stats.is_fragmented());

        let whole = FragmentationStats::calculate(1000, 1000, 1);
        assert_eq!(whole.fragmentation_percent, 0);
        assert_eq!(FragmentationStats::calculate(0, 0, 0).fragmentation_percent, 0);
    }
}
