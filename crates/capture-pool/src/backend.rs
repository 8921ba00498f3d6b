//! Memory allocation backends.
//!
//! A pool never allocates memory itself. It asks an injected [`MemoryBackend`]
//! for one allocation per plane and gives it back with `free`. Concrete
//! backends differ only in where the memory comes from:
//!
//! - [`SystemHeap`]: generic CPU memory, cached or not.
//! - [`ReservedHeap`]: a fixed number of allocations served from a reserved
//!   region, falling back to a [`SystemHeap`] past that count.
//!
//! Display-surface style allocators use a different capability set and live in
//! [`crate::surface`].

use bytes::{Bytes, BytesMut};
use capture_core::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, trace};

/// Process-wide descriptor counter so descriptors never collide across heaps.
static NEXT_DESCRIPTOR: AtomicI32 = AtomicI32::new(3);

fn next_descriptor() -> i32 {
    NEXT_DESCRIPTOR.fetch_add(1, Ordering::Relaxed)
}

/// Flags passed with every allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags {
    /// Request CPU-cached memory.
    pub cached: bool,
    /// Request a CPU mapping (non-zero address).
    pub map: bool,
    /// Force cache maintenance on every hand-off.
    pub sync_force: bool,
}

/// Region an allocation was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Generic heap.
    System,
    /// Reserved fast region.
    Reserved,
}

/// Result of a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Backend descriptor.
    pub descriptor: i32,
    /// Mapped address, 0 when no mapping was requested.
    pub address: u64,
    /// Size in bytes.
    pub size: usize,
    /// Region the memory came from.
    pub region: Region,
}

/// Allocation capability injected into a `BufferPool`.
pub trait MemoryBackend: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Allocate `size` bytes.
    fn alloc(&self, size: usize, flags: AllocFlags) -> CaptureResult<Allocation>;

    /// Return an allocation obtained from [`MemoryBackend::alloc`].
    fn free(&self, allocation: &Allocation) -> CaptureResult<()>;
}

/// Generic heap backend storing each allocation in a `BytesMut`.
///
/// An optional byte limit makes the heap refuse allocations once the live total
/// would exceed it, which is how a constrained region (or an out-of-memory
/// condition) is modelled.
pub struct SystemHeap {
    name: String,
    cached: bool,
    limit_bytes: Option<usize>,
    region: Region,
    buffers: Mutex<HashMap<i32, BytesMut>>,
}

impl SystemHeap {
    /// CPU-cached heap.
    #[must_use]
    pub fn cached() -> Self {
        Self::with_name("system-heap-cached", true)
    }

    /// Uncached heap.
    #[must_use]
    pub fn non_cached() -> Self {
        Self::with_name("system-heap", false)
    }

    fn with_name(name: &str, cached: bool) -> Self {
        Self {
            name: name.to_string(),
            cached,
            limit_bytes: None,
            region: Region::System,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Cap the live bytes this heap will hand out.
    #[must_use]
    pub fn with_limit(mut self, limit_bytes: usize) -> Self {
        self.limit_bytes = Some(limit_bytes);
        self
    }

    fn reserved_region(limit_bytes: Option<usize>) -> Self {
        Self {
            name: "reserved-region".to_string(),
            cached: false,
            limit_bytes,
            region: Region::Reserved,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this heap hands out cached memory by default.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Number of allocations not yet freed.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Total bytes not yet freed.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.buffers.lock().values().map(BytesMut::len).sum()
    }

    /// Copy `data` into an allocation at `offset`.
    pub fn write(&self, descriptor: i32, offset: usize, data: &[u8]) -> CaptureResult<()> {
        let mut buffers = self.buffers.lock();
        let buf = buffers.get_mut(&descriptor).ok_or_else(|| {
            CaptureError::backend(&self.name, format!("unknown descriptor {descriptor}"))
        })?;
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                CaptureError::InvalidArgument(format!(
                    "write of {} bytes at {offset} exceeds allocation of {} bytes",
                    data.len(),
                    buf.len()
                ))
            })?;
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy of an allocation's current contents.
    #[must_use]
    pub fn snapshot(&self, descriptor: i32) -> Option<Bytes> {
        self.buffers
            .lock()
            .get(&descriptor)
            .map(|buf| Bytes::copy_from_slice(buf))
    }
}

impl MemoryBackend for SystemHeap {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, size: usize, flags: AllocFlags) -> CaptureResult<Allocation> {
        if size == 0 {
            return Err(CaptureError::InvalidArgument(
                "allocation size must be > 0".into(),
            ));
        }

        let mut buffers = self.buffers.lock();
        if let Some(limit) = self.limit_bytes {
            let live: usize = buffers.values().map(BytesMut::len).sum();
            if live + size > limit {
                return Err(CaptureError::AllocationFailed(format!(
                    "{}: {size} bytes requested, {} of {limit} bytes in use",
                    self.name, live
                )));
            }
        }

        let buf = BytesMut::zeroed(size);
        let descriptor = next_descriptor();
        let address = if flags.map { buf.as_ptr() as u64 } else { 0 };
        buffers.insert(descriptor, buf);

        trace!(
            backend = %self.name,
            descriptor,
            size,
            cached = flags.cached || self.cached,
            "allocated"
        );

        Ok(Allocation {
            descriptor,
            address,
            size,
            region: self.region,
        })
    }

    fn free(&self, allocation: &Allocation) -> CaptureResult<()> {
        match self.buffers.lock().remove(&allocation.descriptor) {
            Some(_) => Ok(()),
            None => Err(CaptureError::backend(
                &self.name,
                format!("double free of descriptor {}", allocation.descriptor),
            )),
        }
    }
}

/// Reserved-region backend with a bounded number of fast allocations.
///
/// The first `reserved_slots` outstanding allocations come from the reserved
/// region; later requests fall back to the generic heap.
pub struct ReservedHeap {
    region: SystemHeap,
    fallback: SystemHeap,
    reserved_slots: usize,
    reserved: Mutex<HashSet<i32>>,
}

impl ReservedHeap {
    /// Reserved region serving at most `reserved_slots` allocations.
    #[must_use]
    pub fn new(reserved_slots: usize, fallback: SystemHeap) -> Self {
        Self {
            region: SystemHeap::reserved_region(None),
            fallback,
            reserved_slots,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Cap the reserved region's total bytes as well as its count.
    #[must_use]
    pub fn with_region_limit(mut self, limit_bytes: usize) -> Self {
        self.region = SystemHeap::reserved_region(Some(limit_bytes));
        self
    }

    /// Allocations currently served from the reserved region.
    #[must_use]
    pub fn reserved_in_use(&self) -> usize {
        self.reserved.lock().len()
    }

    /// Allocations currently served from the fallback heap.
    #[must_use]
    pub fn fallback_in_use(&self) -> usize {
        self.fallback.live_allocations()
    }
}

impl MemoryBackend for ReservedHeap {
    fn name(&self) -> &str {
        "reserved-heap"
    }

    fn alloc(&self, size: usize, flags: AllocFlags) -> CaptureResult<Allocation> {
        let mut reserved = self.reserved.lock();
        if reserved.len() < self.reserved_slots {
            match self.region.alloc(size, flags) {
                Ok(allocation) => {
                    reserved.insert(allocation.descriptor);
                    return Ok(allocation);
                }
                Err(CaptureError::AllocationFailed(reason)) => {
                    debug!(%reason, "reserved region exhausted, falling back");
                }
                Err(e) => return Err(e),
            }
        }
        drop(reserved);
        self.fallback.alloc(size, flags)
    }

    fn free(&self, allocation: &Allocation) -> CaptureResult<()> {
        if self.reserved.lock().remove(&allocation.descriptor) {
            self.region.free(allocation)
        } else {
            self.fallback.free(allocation)
        }
    }
}
