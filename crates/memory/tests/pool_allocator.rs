//! Integration tests for the pool allocator.

use std::collections::HashSet;

use ember_memory::prelude::*;
use ember_memory::utils::is_aligned_ptr;
use pretty_assertions::assert_eq;
use rstest::rstest;

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, align(32))]
struct Particle {
    position: [f32; 3],
    velocity: [f32; 3],
    life: f32,
}

#[test]
fn blocks_are_distinct_and_exhaust_exactly() {
    let pool = PoolAllocator::with_blocks(48, 16, 8).unwrap();
    let mut seen = HashSet::new();
    let mut ptrs = Vec::new();

    for _ in 0..8 {
        let ptr = pool.allocate(48, 16).unwrap();
        assert!(is_aligned_ptr(ptr.as_ptr(), 16));
        assert!(seen.insert(ptr.as_ptr() as usize));
        ptrs.push(ptr);
    }
    assert!(pool.is_full());

    let err = pool.allocate(8, 8).unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(err.code(), "MEM:POOL:EXHAUSTED");

    for ptr in ptrs {
        unsafe { pool.free(ptr) }.unwrap();
    }
    assert_eq!(pool.free_list_len(), 8);
}

#[test]
fn freed_block_is_reused_first() {
    let pool = PoolAllocator::with_blocks(32, 8, 4).unwrap();
    let _a = pool.allocate(32, 8).unwrap();
    let b = pool.allocate(32, 8).unwrap();
    unsafe { pool.free(b) }.unwrap();
    assert_eq!(pool.allocate(16, 8).unwrap(), b);
}

#[rstest]
#[case::too_large(65, 8, ErrorKind::InvalidArgument)]
#[case::over_aligned(16, 64, ErrorKind::InvalidArgument)]
#[case::zero_size(0, 8, ErrorKind::InvalidArgument)]
fn unsatisfiable_requests(#[case] size: usize, #[case] align: usize, #[case] kind: ErrorKind) {
    let pool = PoolAllocator::with_blocks(64, 16, 2).unwrap();
    let err = pool.allocate(size, align).unwrap_err();
    assert_eq!(err.kind(), kind);
    assert_eq!(pool.free_blocks(), 2);
}

#[rstest]
#[case::tiny_blocks(4, 8, 4)]
#[case::odd_alignment(32, 12, 4)]
#[case::no_blocks(32, 8, 0)]
fn construction_preconditions(#[case] size: usize, #[case] align: usize, #[case] count: usize) {
    let err = PoolAllocator::with_blocks(size, align, count).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstructionPrecondition);
}

#[test]
fn stride_rounds_up_to_alignment() {
    let pool = PoolAllocator::with_blocks(40, 32, 3).unwrap();
    assert_eq!(pool.stride(), 64);
    assert_eq!(pool.capacity(), 192);

    let a = pool.allocate(40, 32).unwrap();
    let b = pool.allocate(40, 32).unwrap();
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 64);
    unsafe {
        pool.free(a).unwrap();
        pool.free(b).unwrap();
    }
}

#[test]
fn misaligned_and_foreign_frees_rejected() {
    let pool = PoolAllocator::with_blocks(64, 8, 4).unwrap();
    let ptr = pool.allocate(64, 8).unwrap();

    let inner = unsafe { ptr.add(8) };
    assert!(unsafe { pool.free(inner) }.unwrap_err().is_invalid_free());

    let mut outside = 0u64;
    let foreign = core::ptr::NonNull::from(&mut outside).cast::<u8>();
    assert!(unsafe { pool.free(foreign) }.unwrap_err().is_invalid_free());

    assert_eq!(pool.allocated_blocks(), 1);
    unsafe { pool.free(ptr) }.unwrap();
}

#[test]
fn free_when_everything_is_free_rejected() {
    let pool = PoolAllocator::with_blocks(32, 8, 2).unwrap();
    let ptr = pool.allocate(32, 8).unwrap();
    unsafe { pool.free(ptr) }.unwrap();

    let err = unsafe { pool.free(ptr) }.unwrap_err();
    assert!(err.is_invalid_free());
    assert_eq!(pool.free_list_len(), 2);
}

#[test]
fn typed_pool_stores_values() {
    let pool = PoolAllocator::for_type::<Particle>(16).unwrap();
    assert_eq!(pool.block_size(), size_of::<Particle>());
    assert_eq!(pool.block_align(), 32);

    let particle = Particle {
        position: [1.0, 2.0, 3.0],
        velocity: [0.0, -9.8, 0.0],
        life: 2.5,
    };
    let ptr = unsafe { pool.alloc_init(particle) }.unwrap();
    assert_eq!(unsafe { *ptr.as_ptr() }, particle);
    unsafe { pool.free_typed(ptr) }.unwrap();

    {
        let guarded = pool.try_alloc_value(particle).unwrap();
        assert_eq!(guarded.life, 2.5);
        assert_eq!(pool.allocated_blocks(), 1);
    }
    assert_eq!(pool.allocated_blocks(), 0);
}

#[test]
fn reset_relinks_every_block() {
    let pool = PoolAllocator::with_blocks(16, 8, 6).unwrap();
    for _ in 0..5 {
        pool.allocate(16, 8).unwrap();
    }
    unsafe { pool.reset() };
    assert_eq!(pool.free_list_len(), 6);
    pool.check_leaks().unwrap();
}

#[test]
fn stats_count_whole_blocks() {
    let pool =
        PoolAllocator::with_blocks_and_config(64, 8, 4, AllocatorConfig::debug()).unwrap();
    let a = pool.allocate(10, 8).unwrap();
    let b = pool.allocate(20, 8).unwrap();
    unsafe { pool.free(a) }.unwrap();

    let stats = pool.statistics();
    assert_eq!(stats.allocation_count, 2);
    assert_eq!(stats.deallocation_count, 1);
    assert_eq!(stats.allocated_bytes, 64);
    assert_eq!(stats.peak_allocated_bytes, 128);
    assert_eq!(pool.used_memory(), 64);

    unsafe { pool.free(b) }.unwrap();
}
