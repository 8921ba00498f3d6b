//! Display-surface style buffer source.
//!
//! Surface buffers are owned by an external queue (a display compositor, a
//! preview window). The pool never allocates or frees them; it borrows them
//! with `dequeue`, presents them with `enqueue` and hands unused ones back
//! with `cancel`. The surface also dictates how many of its buffers must stay
//! queued at all times (`min_undequeued`).

use crate::backend::{AllocFlags, Allocation, MemoryBackend, SystemHeap};
use capture_core::{CaptureError, CaptureResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One buffer borrowed from a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceBuffer {
    /// Surface-side handle.
    pub descriptor: i32,
    /// Per-plane memory. Plane 0's address identifies the buffer.
    pub planes: Vec<Allocation>,
}

impl SurfaceBuffer {
    /// Address used to match a dequeued buffer to its pool slot.
    #[must_use]
    pub fn identity_address(&self) -> u64 {
        self.planes.first().map_or(0, |p| p.address)
    }
}

/// Capability set of a surface-style backend.
pub trait SurfaceQueue: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Borrow the next free buffer. May block on the surface's own
    /// availability signal.
    fn dequeue(&self) -> CaptureResult<SurfaceBuffer>;

    /// Present a borrowed buffer.
    fn enqueue(&self, descriptor: i32) -> CaptureResult<()>;

    /// Return a borrowed buffer without presenting it.
    fn cancel(&self, descriptor: i32) -> CaptureResult<()>;

    /// Buffers that must remain queued inside the surface.
    fn min_undequeued(&self) -> usize;
}

struct SurfaceState {
    buffers: HashMap<i32, SurfaceBuffer>,
    free: VecDeque<i32>,
    dequeued: HashSet<i32>,
    presented: u64,
}

/// In-process surface with a fixed buffer set.
///
/// Presented buffers are consumed immediately and become free again, so the
/// surface behaves like a display that never holds on to a frame.
pub struct SimulatedSurface {
    min_undequeued: usize,
    dequeue_timeout: Option<Duration>,
    heap: SystemHeap,
    state: Mutex<SurfaceState>,
    available: Condvar,
}

impl SimulatedSurface {
    /// Surface with `buffer_count` buffers of the given plane sizes.
    pub fn new(
        buffer_count: usize,
        plane_sizes: &[usize],
        min_undequeued: usize,
    ) -> CaptureResult<Self> {
        let heap = SystemHeap::cached();
        let flags = AllocFlags {
            cached: true,
            map: true,
            sync_force: false,
        };

        let mut buffers = HashMap::with_capacity(buffer_count);
        let mut free = VecDeque::with_capacity(buffer_count);
        for _ in 0..buffer_count {
            let planes = plane_sizes
                .iter()
                .map(|&size| heap.alloc(size, flags))
                .collect::<CaptureResult<Vec<_>>>()?;
            let descriptor = planes.first().map_or(-1, |p| p.descriptor);
            free.push_back(descriptor);
            buffers.insert(descriptor, SurfaceBuffer { descriptor, planes });
        }

        Ok(Self {
            min_undequeued,
            dequeue_timeout: Some(Duration::from_millis(100)),
            heap,
            state: Mutex::new(SurfaceState {
                buffers,
                free,
                dequeued: HashSet::new(),
                presented: 0,
            }),
            available: Condvar::new(),
        })
    }

    /// How long `dequeue` waits for a free buffer. `None` waits forever.
    #[must_use]
    pub fn with_dequeue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Buffers currently borrowed.
    #[must_use]
    pub fn dequeued_count(&self) -> usize {
        self.state.lock().dequeued.len()
    }

    /// Buffers presented so far.
    #[must_use]
    pub fn presented_count(&self) -> u64 {
        self.state.lock().presented
    }

    /// Bytes of surface memory, all buffers included.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.heap.live_bytes()
    }

    fn give_back(&self, descriptor: i32, present: bool) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if !state.dequeued.remove(&descriptor) {
            return Err(CaptureError::backend(
                "simulated-surface",
                format!("descriptor {descriptor} is not dequeued"),
            ));
        }
        if present {
            state.presented += 1;
        }
        state.free.push_back(descriptor);
        drop(state);
        self.available.notify_one();
        Ok(())
    }
}

impl SurfaceQueue for SimulatedSurface {
    fn name(&self) -> &str {
        "simulated-surface"
    }

    fn dequeue(&self) -> CaptureResult<SurfaceBuffer> {
        let deadline = self.dequeue_timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(descriptor) = state.free.pop_front() {
                state.dequeued.insert(descriptor);
                let buffer = state.buffers.get(&descriptor).cloned().ok_or_else(|| {
                    CaptureError::backend("simulated-surface", "free list out of sync")
                })?;
                debug!(descriptor, "surface buffer dequeued");
                return Ok(buffer);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        warn!("surface dequeue timed out");
                        return Err(CaptureError::backend(
                            "simulated-surface",
                            "no free buffer before timeout",
                        ));
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    fn enqueue(&self, descriptor: i32) -> CaptureResult<()> {
        self.give_back(descriptor, true)
    }

    fn cancel(&self, descriptor: i32) -> CaptureResult<()> {
        self.give_back(descriptor, false)
    }

    fn min_undequeued(&self) -> usize {
        self.min_undequeued
    }
}
