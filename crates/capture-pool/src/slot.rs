//! Buffer slot model: per-plane memory plus the ownership state pair.
//!
//! Ownership of a slot is tracked explicitly with two tags rather than inferred
//! from who holds a pointer:
//!
//! - [`BufferPosition`]: where the buffer currently physically is
//!   (driver queue, HAL, display service).
//! - [`BufferPermission`]: whether the pool may hand it out
//!   (`Available`) or someone is working on it (`InProcess`).
//!
//! A slot with permission `InProcess` must never be handed out again until it
//! has been returned to `Available`. Every transition goes through
//! `BufferPool`'s single status update funnel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on slot indices (`index_offset + allowed_max`).
pub const MAX_SLOTS: usize = 32;

/// Upper bound on planes per slot, metadata plane included.
pub const MAX_PLANES: usize = 5;

/// Size of the metadata plane appended when a pool carries per-frame metadata.
pub const META_PLANE_SIZE: usize = 32 * 1024;

/// Where a buffer currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPosition {
    /// Not queued anywhere.
    #[default]
    None,
    /// Queued to the capture driver.
    InDriver,
    /// Held by the camera HAL.
    InHal,
    /// Handed to the display / consumer service.
    InService,
}

/// Whether the pool may hand a buffer out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPermission {
    /// Not materialized, or owned by an external surface.
    #[default]
    None,
    /// Free to be acquired.
    Available,
    /// Acquired and not yet released.
    InProcess,
}

/// Position/permission pair recorded on every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotStatus {
    /// Physical location.
    pub position: BufferPosition,
    /// Hand-out permission.
    pub permission: BufferPermission,
}

impl SlotStatus {
    /// Build a status pair.
    #[must_use]
    pub const fn new(position: BufferPosition, permission: BufferPermission) -> Self {
        Self {
            position,
            permission,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.position, self.permission)
    }
}

/// CPU caching policy requested for slot memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Uncached, device-coherent memory.
    #[default]
    NonCached,
    /// CPU-cached memory.
    Cached,
    /// CPU-cached memory with forced cache sync on every hand-off.
    CachedSyncForce,
}

impl MemoryKind {
    /// Expected allocation latency in microseconds per MiB.
    ///
    /// Allocations slower than this are logged as warnings.
    #[must_use]
    pub fn estimated_us_per_mib(self) -> u64 {
        match self {
            MemoryKind::NonCached => 1600,
            MemoryKind::Cached | MemoryKind::CachedSyncForce => 670,
        }
    }
}

/// Geometry of one image plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneLayout {
    /// Plane size in bytes.
    pub size: usize,
    /// Bytes per line.
    pub stride: usize,
}

/// One materialized plane of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Plane {
    /// Backend descriptor, `None` until allocated.
    pub descriptor: Option<i32>,
    /// Mapped CPU address, 0 when unmapped.
    pub address: u64,
    /// Plane size in bytes.
    pub size: usize,
    /// Bytes per line.
    pub stride: usize,
}

impl Plane {
    fn from_layout(layout: PlaneLayout) -> Self {
        Self {
            descriptor: None,
            address: 0,
            size: layout.size,
            stride: layout.stride,
        }
    }

    /// True once the backend has produced memory for this plane.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.descriptor.is_some()
    }
}

/// One pool slot: plane geometry, memory and ownership state.
///
/// `BufferPool::acquire` hands out a snapshot of this struct; the pool keeps
/// the authoritative copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSlot {
    /// Index within the pool (offset included).
    pub index: usize,
    /// Image planes followed by the metadata plane, if any.
    pub planes: Vec<Plane>,
    /// Whether the last plane is the metadata plane.
    pub has_metadata_plane: bool,
    /// Memory caching policy.
    pub kind: MemoryKind,
    /// Ownership state.
    pub status: SlotStatus,
}

impl BufferSlot {
    pub(crate) fn new(
        index: usize,
        layouts: &[PlaneLayout],
        has_metadata_plane: bool,
        kind: MemoryKind,
    ) -> Self {
        let mut planes: Vec<Plane> = layouts.iter().copied().map(Plane::from_layout).collect();
        if has_metadata_plane {
            planes.push(Plane::from_layout(PlaneLayout {
                size: META_PLANE_SIZE,
                stride: META_PLANE_SIZE,
            }));
        }
        Self {
            index,
            planes,
            has_metadata_plane,
            kind,
            status: SlotStatus::default(),
        }
    }

    /// Number of image planes (metadata plane excluded).
    #[must_use]
    pub fn image_plane_count(&self) -> usize {
        if self.has_metadata_plane {
            self.planes.len().saturating_sub(1)
        } else {
            self.planes.len()
        }
    }

    /// Total image bytes (metadata plane excluded).
    #[must_use]
    pub fn image_bytes(&self) -> usize {
        self.planes[..self.image_plane_count()]
            .iter()
            .map(|p| p.size)
            .sum()
    }

    /// The metadata plane, if the pool carries one.
    #[must_use]
    pub fn metadata_plane(&self) -> Option<&Plane> {
        if self.has_metadata_plane {
            self.planes.last()
        } else {
            None
        }
    }

    /// True when every plane has backing memory.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        !self.planes.is_empty() && self.planes.iter().all(Plane::is_allocated)
    }

    pub(crate) fn clear_memory(&mut self) {
        for plane in &mut self.planes {
            plane.descriptor = None;
            plane.address = 0;
        }
    }
}
