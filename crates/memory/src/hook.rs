//! Process-wide allocation hook
//!
//! [`GlobalHook`] adapts one explicitly installed [`Allocator`] to
//! [`GlobalAlloc`] so it can serve as the program's `#[global_allocator]`.
//! Nothing else in this crate depends on it.
//!
//! ```rust,ignore
//! use ember_memory::GlobalHook;
//!
//! #[global_allocator]
//! static HOOK: GlobalHook = GlobalHook::new();
//!
//! fn main() -> ember_memory::Result<()> {
//!     let heap = ember_memory::FreeListAllocator::with_capacity(64 << 20)?;
//!     HOOK.install(Box::new(heap))?;
//!     run_game();
//!     let heap = HOOK.shutdown()?;
//!     drop(heap);
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle
//!
//! Teardown order is explicit. [`GlobalHook::shutdown`] hands the allocator
//! back only once every allocation routed to it has been freed; while
//! anything is outstanding it reports `LeakDetected` and stays installed, so
//! late frees from static destructors still reach the right allocator.
//!
//! # Routing
//!
//! - Without an installed allocator every request goes to
//!   [`std::alloc::System`].
//! - Allocations made while the hook is already active on the same thread
//!   (for example by a log subscriber reacting to an event emitted by the
//!   installed allocator) also go to `System`.
//! - Frees made while the hook is active cannot reach the installed
//!   allocator. Those inside its [`Allocator::address_range`] are parked in a
//!   fixed set of slots and handed to it once the current call finishes;
//!   everything else goes to `System`.
//! - Other frees are routed by [`Allocator::owns`].
//! - Only allocators that report an address range can be installed, which
//!   rules out [`SystemAllocator`].
//! - A failed allocation is reported to the runtime as a null pointer.
//!
//! [`SystemAllocator`]: crate::allocator::SystemAllocator

use core::alloc::{GlobalAlloc, Layout};
use core::cell::Cell;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::alloc::System;

use parking_lot::Mutex;

use crate::allocator::Allocator;
use crate::error::{AllocError, AllocResult};

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside the hook
struct ReentryGuard {
    armed: bool,
}

impl ReentryGuard {
    /// `None` when the thread is already inside the hook
    fn enter() -> Option<Self> {
        match IN_HOOK.try_with(|flag| flag.replace(true)) {
            Ok(true) => None,
            Ok(false) => Some(Self { armed: true }),
            // Thread-local storage is gone during thread teardown
            Err(_) => Some(Self { armed: false }),
        }
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = IN_HOOK.try_with(|flag| flag.set(false));
        }
    }
}

/// Frees that can wait for the installed allocator at once
const DEFERRED_SLOTS: usize = 64;

/// Marks a slot claimed by a writer that has not published its pointer yet
const CLAIMED: *mut u8 = ptr::without_provenance_mut(1);

/// A re-entrant free parked until the installed allocator is reachable
struct DeferredSlot {
    ptr: AtomicPtr<u8>,
    size: AtomicUsize,
}

impl DeferredSlot {
    const fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(0),
        }
    }
}

struct Installed {
    allocator: Box<dyn Allocator + Send>,
    live: usize,
    live_bytes: usize,
}

enum Teardown {
    NotInstalled,
    Leaking {
        allocator: &'static str,
        count: usize,
        bytes: usize,
    },
    Removed(Box<dyn Allocator + Send>),
}

/// `GlobalAlloc` front end for an explicitly installed allocator
pub struct GlobalHook {
    slot: Mutex<Option<Installed>>,
    /// Address range of the installed allocator, empty when none is installed
    range_start: AtomicUsize,
    range_end: AtomicUsize,
    deferred: [DeferredSlot; DEFERRED_SLOTS],
}

impl GlobalHook {
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_mutex(None),
            range_start: AtomicUsize::new(0),
            range_end: AtomicUsize::new(0),
            deferred: [const { DeferredSlot::empty() }; DEFERRED_SLOTS],
        }
    }

    /// Routes future allocations to `allocator`
    ///
    /// Fails with `InvalidState` if an allocator is already installed and
    /// with `InvalidConfig` if `allocator` does not report an address range.
    pub fn install(&self, allocator: Box<dyn Allocator + Send>) -> AllocResult<()> {
        let Some(range) = allocator.address_range() else {
            let _guard = ReentryGuard::enter();
            drop(allocator);
            return Err(AllocError::invalid_config(
                "a global allocator must report the address range it manages",
            ));
        };

        let rejected = {
            let _guard = ReentryGuard::enter();
            let mut slot = self.slot.lock();
            if slot.is_some() {
                Some(allocator)
            } else {
                self.range_start.store(range.start, Ordering::Release);
                self.range_end.store(range.end, Ordering::Release);
                *slot = Some(Installed {
                    allocator,
                    live: 0,
                    live_bytes: 0,
                });
                None
            }
        };

        match rejected {
            Some(_) => Err(AllocError::invalid_state("a global allocator is already installed")),
            None => Ok(()),
        }
    }

    /// Uninstalls the allocator and hands it back
    ///
    /// Fails with `LeakDetected`, leaving the allocator installed, while
    /// allocations routed to it are still live.
    pub fn shutdown(&self) -> AllocResult<Box<dyn Allocator + Send>> {
        let teardown = {
            let _guard = ReentryGuard::enter();
            let mut slot = self.slot.lock();
            if let Some(installed) = slot.as_mut() {
                self.drain_deferred(installed);
            }
            match slot.take() {
                None => Teardown::NotInstalled,
                Some(installed) if installed.live > 0 => {
                    let teardown = Teardown::Leaking {
                        allocator: installed.allocator.name(),
                        count: installed.live,
                        bytes: installed.live_bytes,
                    };
                    *slot = Some(installed);
                    teardown
                }
                Some(installed) => {
                    self.range_start.store(0, Ordering::Release);
                    self.range_end.store(0, Ordering::Release);
                    Teardown::Removed(installed.allocator)
                }
            }
        };

        match teardown {
            Teardown::NotInstalled => {
                Err(AllocError::invalid_state("no global allocator is installed"))
            }
            Teardown::Leaking {
                allocator,
                count,
                bytes,
            } => Err(AllocError::leak_detected(allocator, count, bytes)),
            Teardown::Removed(allocator) => Ok(allocator),
        }
    }

    pub fn is_installed(&self) -> bool {
        let _guard = ReentryGuard::enter();
        self.slot.lock().is_some()
    }

    /// Allocations routed to the installed allocator and not yet freed
    pub fn live_allocations(&self) -> usize {
        let _guard = ReentryGuard::enter();
        self.slot.lock().as_ref().map_or(0, |installed| installed.live)
    }

    /// Frees waiting for the installed allocator
    pub fn pending_frees(&self) -> usize {
        self.deferred
            .iter()
            .filter(|slot| !slot.ptr.load(Ordering::Acquire).is_null())
            .count()
    }

    fn in_installed_range(&self, address: usize) -> bool {
        let start = self.range_start.load(Ordering::Acquire);
        let end = self.range_end.load(Ordering::Acquire);
        (start..end).contains(&address)
    }

    /// Parks a free of installed-allocator memory made while re-entered
    ///
    /// With every slot taken the block stays allocated and keeps counting as
    /// live, so `shutdown` reports it.
    fn defer(&self, ptr: *mut u8, size: usize) {
        for slot in &self.deferred {
            if slot
                .ptr
                .compare_exchange(ptr::null_mut(), CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                slot.size.store(size, Ordering::Relaxed);
                slot.ptr.store(ptr, Ordering::Release);
                return;
            }
        }
    }

    /// Hands parked frees to the installed allocator
    ///
    /// Runs with the slot lock held and the re-entry guard armed, so frees
    /// issued from inside the allocator land back in the slots and are
    /// picked up by the next pass.
    fn drain_deferred(&self, installed: &mut Installed) {
        loop {
            let mut drained = false;
            for slot in &self.deferred {
                let ptr = slot.ptr.load(Ordering::Acquire);
                if ptr.is_null() || ptr == CLAIMED {
                    continue;
                }
                if slot
                    .ptr
                    .compare_exchange(ptr, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                let size = slot.size.load(Ordering::Relaxed);
                slot.ptr.store(ptr::null_mut(), Ordering::Release);
                drained = true;

                if let Some(block) = NonNull::new(ptr) {
                    installed.release(block, size);
                }
            }
            if !drained {
                break;
            }
        }
    }
}

impl Installed {
    fn release(&mut self, block: NonNull<u8>, size: usize) {
        // SAFETY: the block was handed out by this allocator and the runtime
        // gave it up. A rejected free has already been logged.
        if unsafe { self.allocator.free(block) }.is_ok() {
            self.live -= 1;
            self.live_bytes -= size;
        }
    }
}

impl Default for GlobalHook {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for GlobalHook {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(_guard) = ReentryGuard::enter() else {
            // SAFETY: forwarded GlobalAlloc contract
            return unsafe { System.alloc(layout) };
        };

        let mut slot = self.slot.lock();
        if let Some(installed) = slot.as_mut() {
            let block = match installed.allocator.allocate_layout(layout) {
                Ok(ptr) => {
                    installed.live += 1;
                    installed.live_bytes += layout.size();
                    ptr.as_ptr()
                }
                Err(_) => ptr::null_mut(),
            };
            self.drain_deferred(installed);
            return block;
        }
        drop(slot);
        // SAFETY: forwarded GlobalAlloc contract
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(nonnull) = NonNull::new(ptr) else {
            return;
        };
        let Some(_guard) = ReentryGuard::enter() else {
            if self.in_installed_range(ptr as usize) {
                self.defer(ptr, layout.size());
            } else {
                // SAFETY: blocks outside the installed range came from System
                unsafe { System.dealloc(ptr, layout) };
            }
            return;
        };

        let mut slot = self.slot.lock();
        if let Some(installed) = slot.as_mut()
            && installed.allocator.owns(nonnull)
        {
            installed.release(nonnull, layout.size());
            self.drain_deferred(installed);
            return;
        }
        drop(slot);
        // SAFETY: blocks the installed allocator does not own came from System
        unsafe { System.dealloc(ptr, layout) };
    }
}

impl fmt::Debug for GlobalHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _guard = ReentryGuard::enter();
        let slot = self.slot.lock();
        f.debug_struct("GlobalHook")
            .field("installed", &slot.as_ref().map(|installed| installed.allocator.name()))
            .field("live", &slot.as_ref().map_or(0, |installed| installed.live))
            .field("pending_frees", &self.pending_frees())
            .finish()
    }
}
