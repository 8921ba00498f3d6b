//! Buffer pool scenarios: on-demand growth, accounting, idempotent release
//! and allocation rollback.

use capture_core::{CaptureError, CaptureResult};
use capture_pool::{
    AllocFlags, AllocMode, Allocation, BufferPermission, BufferPool, BufferPosition,
    MemoryBackend, PlaneLayout, PoolConfig, SystemHeap, META_PLANE_SIZE,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing_test::traced_test;

fn planes() -> Vec<PlaneLayout> {
    vec![
        PlaneLayout {
            size: 8192,
            stride: 128,
        },
        PlaneLayout {
            size: 4096,
            stride: 128,
        },
    ]
}

fn assert_accounting(pool: &BufferPool) {
    assert_eq!(
        pool.available_count() + pool.in_process_count(),
        pool.allocated_count(),
        "available + in-process must equal allocated"
    );
}

/// Heap that refuses metadata-plane allocations after a number of successes.
struct MetaFailure {
    heap: SystemHeap,
    meta_successes: Mutex<usize>,
}

impl MemoryBackend for MetaFailure {
    fn name(&self) -> &str {
        "meta-failure"
    }

    fn alloc(&self, size: usize, flags: AllocFlags) -> CaptureResult<Allocation> {
        if size == META_PLANE_SIZE {
            let mut remaining = self.meta_successes.lock();
            if *remaining == 0 {
                return Err(CaptureError::AllocationFailed("metadata region exhausted".into()));
            }
            *remaining -= 1;
        }
        self.heap.alloc(size, flags)
    }

    fn free(&self, allocation: &Allocation) -> CaptureResult<()> {
        self.heap.free(allocation)
    }
}

#[test]
fn test_on_demand_growth_scenario() {
    let pool = BufferPool::new("on-demand", Arc::new(SystemHeap::non_cached()));
    pool.configure(PoolConfig::new(planes(), 4, 6, AllocMode::OnDemand))
        .unwrap();
    pool.allocate().unwrap();
    assert_eq!(pool.allocated_count(), 4);
    assert_eq!(pool.available_count(), 4);

    let first_four: Vec<usize> = (0..4).map(|_| pool.acquire(None).unwrap().index).collect();
    assert_eq!(first_four, vec![0, 1, 2, 3]);

    let fifth = pool.acquire(None).unwrap();
    assert_eq!(fifth.index, 4);
    assert_eq!(
        pool.status(4).map(|s| s.permission),
        Some(BufferPermission::InProcess)
    );

    let sixth = pool.acquire(None).unwrap();
    assert_eq!(sixth.index, 5);
    assert_accounting(&pool);

    match pool.acquire(None) {
        Err(CaptureError::NoBufferAvailable {
            allocated,
            allowed_max,
            ..
        }) => {
            assert_eq!(allocated, 6);
            assert_eq!(allowed_max, 6);
        }
        other => panic!("expected NoBufferAvailable, got {other:?}"),
    }
    assert!(pool.acquire(None).unwrap_err().is_retriable());
}

#[test]
fn test_accounting_holds_across_mixed_traffic() {
    let pool = BufferPool::new("mixed", Arc::new(SystemHeap::cached()));
    pool.configure(PoolConfig::new(planes(), 3, 8, AllocMode::OnDemand))
        .unwrap();
    pool.allocate().unwrap();

    let mut held = Vec::new();
    for round in 0..40usize {
        if round % 3 == 2 {
            if let Some(index) = held.pop() {
                pool.release(index, BufferPosition::InService).unwrap();
            }
        } else if let Ok(slot) = pool.acquire(None) {
            held.push(slot.index);
        }
        assert_accounting(&pool);
        assert!(pool.allocated_count() <= 8);
    }
    for index in held {
        pool.release(index, BufferPosition::None).unwrap();
    }
    assert_eq!(pool.in_process_count(), 0);
    pool.teardown().unwrap();
}

#[test]
#[traced_test]
fn test_double_release_is_idempotent() {
    let pool = BufferPool::new("idempotent", Arc::new(SystemHeap::non_cached()));
    pool.configure(PoolConfig::new(planes(), 2, 2, AllocMode::AllAtOnce))
        .unwrap();
    pool.allocate().unwrap();

    let slot = pool.acquire(None).unwrap();
    pool.release(slot.index, BufferPosition::InDriver).unwrap();
    let available = pool.available_count();

    pool.release(slot.index, BufferPosition::InDriver).unwrap();
    assert_eq!(pool.available_count(), available);
    assert!(logs_contain("buffer already available, ignoring release"));
}

#[test]
fn test_metadata_failure_rolls_back_everything() {
    let backend = Arc::new(MetaFailure {
        heap: SystemHeap::non_cached(),
        meta_successes: Mutex::new(2),
    });
    let pool = BufferPool::new("rollback", backend.clone());
    pool.configure(
        PoolConfig::new(planes(), 4, 4, AllocMode::AllAtOnce).with_metadata_plane(true),
    )
    .unwrap();

    let err = pool.allocate().unwrap_err();
    assert!(matches!(err, CaptureError::AllocationFailed(_)), "{err}");
    assert_eq!(pool.allocated_count(), 0);
    assert_eq!(backend.heap.live_allocations(), 0);
    assert!(!pool.is_allocated());
}

#[test]
fn test_reset_keeps_memory_and_returns_slots() {
    let heap = Arc::new(SystemHeap::non_cached());
    let pool = BufferPool::new("reset", heap.clone());
    pool.configure(PoolConfig::new(planes(), 3, 3, AllocMode::AllAtOnce))
        .unwrap();
    pool.allocate().unwrap();
    let live = heap.live_allocations();

    pool.acquire(None).unwrap();
    pool.acquire(None).unwrap();
    pool.reset().unwrap();

    assert_eq!(pool.available_count(), 3);
    assert_eq!(heap.live_allocations(), live);
    // Memory is still held, so the next allocate is skipped.
    pool.allocate().unwrap();
    assert_eq!(heap.live_allocations(), live);
    assert_eq!(pool.acquire(None).unwrap().index, 0);
}
