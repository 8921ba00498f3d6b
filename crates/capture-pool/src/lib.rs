//! Hardware buffer pools for the capture pipeline.
//!
//! A [`BufferPool`] owns a bounded set of multi-plane buffer slots and tracks
//! who holds each one. Memory comes from an injected backend:
//!
//! - [`MemoryBackend`] implementations ([`SystemHeap`], [`ReservedHeap`]) for
//!   pools that allocate and free their own planes.
//! - [`SurfaceQueue`] implementations ([`SimulatedSurface`]) for pools that
//!   borrow buffers from a display surface.
//!
//! # Example
//!
//! ```
//! use capture_pool::{AllocMode, BufferPool, BufferPosition, PlaneLayout, PoolConfig, SystemHeap};
//! use std::sync::Arc;
//!
//! let pool = BufferPool::new("jpeg", Arc::new(SystemHeap::cached()));
//! let planes = vec![PlaneLayout { size: 64 * 1024, stride: 256 }];
//! pool.configure(PoolConfig::new(planes, 3, 3, AllocMode::AllAtOnce).with_metadata_plane(true))?;
//! pool.allocate()?;
//!
//! let slot = pool.acquire(None)?;
//! assert_eq!(slot.planes.len(), 2);
//! pool.release(slot.index, BufferPosition::None)?;
//! pool.teardown()?;
//! # Ok::<(), capture_core::CaptureError>(())
//! ```

pub mod backend;
pub mod pool;
pub mod slot;
pub mod surface;

pub use backend::{AllocFlags, Allocation, MemoryBackend, Region, ReservedHeap, SystemHeap};
pub use pool::{AllocMode, BufferPool, PoolConfig};
pub use slot::{
    BufferPermission, BufferPosition, BufferSlot, MemoryKind, Plane, PlaneLayout, SlotStatus,
    MAX_PLANES, MAX_SLOTS, META_PLANE_SIZE,
};
pub use surface::{SimulatedSurface, SurfaceBuffer, SurfaceQueue};
