//! Allocator wiring for subsystems
//!
//! There is no process-wide allocator registry. Entry-point code builds a
//! [`MemoryContext`], fills it with the allocators it owns and hands it (or
//! single allocators taken from it) to the subsystems that need memory.

use core::fmt;

#[cfg(feature = "logging")]
use tracing::debug;

use crate::allocator::Allocator;
use crate::error::{MemoryError, MemoryResult};

/// Default allocator plus named per-subsystem allocators
///
/// # Examples
/// ```rust
/// use ember_memory::prelude::*;
///
/// let heap = FreeListAllocator::with_capacity(64 * 1024)?;
/// let frame = LinearAllocator::with_capacity(16 * 1024)?;
///
/// let mut context = MemoryContext::new(&heap);
/// context.register("frame", &frame)?;
///
/// assert_eq!(context.allocator("frame").name(), "linear");
/// assert_eq!(context.allocator("audio").name(), "free_list");
/// # Ok::<(), ember_memory::MemoryError>(())
/// ```
pub struct MemoryContext<'a> {
    default: &'a dyn Allocator,
    named: Vec<(&'static str, &'a dyn Allocator)>,
}

impl<'a> MemoryContext<'a> {
    pub fn new(default: &'a dyn Allocator) -> Self {
        Self {
            default,
            named: Vec::new(),
        }
    }

    /// Registers `allocator` under `name`
    ///
    /// Names are unique within one context.
    pub fn register(
        &mut self,
        name: &'static str,
        allocator: &'a dyn Allocator,
    ) -> MemoryResult<()> {
        if self.get(name).is_some() {
            return Err(MemoryError::invalid_config(&format!(
                "allocator `{name}` is already registered"
            )));
        }

        #[cfg(feature = "logging")]
        debug!(name, allocator = allocator.name(), "registered allocator");

        self.named.push((name, allocator));
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, name: &'static str, allocator: &'a dyn Allocator) -> MemoryResult<Self> {
        self.register(name, allocator)?;
        Ok(self)
    }

    /// Allocator registered under `name`, if any
    pub fn get(&self, name: &str) -> Option<&'a dyn Allocator> {
        self.named
            .iter()
            .find(|(registered, _)| *registered == name)
            .map(|(_, allocator)| *allocator)
    }

    /// Allocator registered under `name`, or the default one
    pub fn allocator(&self, name: &str) -> &'a dyn Allocator {
        self.get(name).unwrap_or(self.default)
    }

    pub fn default_allocator(&self) -> &'a dyn Allocator {
        self.default
    }

    /// Registered names in registration order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.named.iter().map(|(name, _)| *name)
    }

    pub fn len(&self) -> usize {
        self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty()
    }
}

impl fmt::Debug for MemoryContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let named: Vec<_> = self.named.iter().map(|(name, a)| (*name, a.name())).collect();
        f.debug_struct("MemoryContext")
            .field("default", &self.default.name())
            .field("named", &named)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{PoolAllocator, StackAllocator, SystemAllocator};
    use crate::error::ErrorKind;

    #[test]
    fn test_lookup_and_fallback() {
        let system = SystemAllocator::new();
        let stack = StackAllocator::with_capacity(256).expect("stack");
        let context = MemoryContext::new(&system).with("scratch", &stack).expect("register");

        assert_eq!(context.get("scratch").map(|a| a.name()), Some("stack"));
        assert!(context.get("missing").is_none());
        assert_eq!(context.allocator("missing").name(), "system");
        assert_eq!(context.default_allocator().name(), "system");
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let system = SystemAllocator::new();
        let a = PoolAllocator::with_blocks(32, 8, 4).expect("a");
        let b = PoolAllocator::with_blocks(32, 8, 4).expect("b");
        let mut context = MemoryContext::new(&system);
        context.register("particles", &a).expect("first");

        let err = context.register("particles", &b).expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::ConstructionPrecondition);
        assert_eq!(context.names().collect::<Vec<_>>(), vec!["particles"]);
    }

    #[test]
    fn test_allocations_go_to_registered_allocator() {
        let system = SystemAllocator::new();
        let pool = PoolAllocator::with_blocks(64, 8, 2).expect("pool");
        let context = MemoryContext::new(&system).with("entities", &pool).expect("register");

        let entities = context.allocator("entities");
        let ptr = entities.allocate(48, 8).expect("alloc");
        assert!(pool.owns(ptr));
        unsafe { entities.free(ptr) }.expect("free");
        assert_eq!(pool.allocated_blocks(), 0);
    }
}
