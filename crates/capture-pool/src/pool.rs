//! Bounded pool of hardware buffer slots.
//!
//! # Design
//!
//! One pool-wide lock protects the slot array and the available-index queue.
//! Every permission/position change goes through `PoolState::update_status`,
//! so the `available + in_process == allocated` invariant is maintained in one
//! place.
//!
//! ## Allocation modes
//!
//! | Mode | `allocate()` | `acquire()` on exhaustion |
//! |------|--------------|---------------------------|
//! | `AllAtOnce` | `requested` slots | `NoBufferAvailable` |
//! | `OnDemand` | `requested` slots | grows by one slot synchronously |
//! | `SilentGrowth` | `requested` slots, then a worker grows to `allowed_max` | `NoBufferAvailable` |
//!
//! ## Rollback
//!
//! A slot is materialized in two passes: metadata planes for every slot in the
//! batch first, then image planes. If either pass fails, everything the batch
//! allocated so far is freed before `AllocationFailed` is returned, so no slot
//! is ever left half-initialized.
//!
//! ## Surface pools
//!
//! Pools built with [`BufferPool::with_surface`] borrow their buffers from a
//! [`SurfaceQueue`]. `allocate()` dequeues each buffer once to learn its
//! planes and cancels it back; `acquire()` dequeues and matches by address;
//! `release()` presents the buffer.
//!
//! # Example
//!
//! ```
//! use capture_pool::{AllocMode, BufferPool, BufferPosition, PlaneLayout, PoolConfig, SystemHeap};
//! use std::sync::Arc;
//!
//! let pool = BufferPool::new("bayer", Arc::new(SystemHeap::non_cached()));
//! let planes = vec![PlaneLayout { size: 4096, stride: 64 }];
//! pool.configure(PoolConfig::new(planes, 2, 4, AllocMode::OnDemand))?;
//! pool.allocate()?;
//!
//! let slot = pool.acquire(None)?;
//! pool.release(slot.index, BufferPosition::InHal)?;
//! # Ok::<(), capture_core::CaptureError>(())
//! ```

use crate::backend::{AllocFlags, Allocation, MemoryBackend};
use crate::slot::{
    BufferPermission, BufferPosition, BufferSlot, MemoryKind, PlaneLayout, SlotStatus, MAX_PLANES,
    MAX_SLOTS,
};
use crate::surface::SurfaceQueue;
use capture_core::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const MIB: u64 = 1024 * 1024;

/// Expected surface dequeue latency in microseconds per MiB.
const SURFACE_US_PER_MIB: u64 = 3300;

/// How a pool materializes slots beyond the requested count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocMode {
    /// Materialize `requested` slots and never grow implicitly.
    #[default]
    AllAtOnce,
    /// Grow by one slot inside `acquire` when exhausted.
    OnDemand,
    /// Grow to `allowed_max` on a background worker after `allocate`.
    SilentGrowth,
}

/// Pool geometry and growth policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Image plane geometry, shared by every slot.
    pub planes: Vec<PlaneLayout>,
    /// Slots materialized by `allocate()`.
    pub requested_count: usize,
    /// Upper bound on materialized slots.
    pub allowed_max: usize,
    /// Growth policy, read from the `alloc_mode` key.
    #[serde(rename = "alloc_mode", alias = "mode")]
    pub mode: AllocMode,
    /// First slot index; lower indices belong to another owner.
    #[serde(default)]
    pub index_offset: usize,
    /// Append a metadata plane to every slot.
    #[serde(default)]
    pub metadata_plane: bool,
    /// Request CPU mappings for image planes.
    #[serde(default)]
    pub needs_mapping: bool,
    /// Caching policy for image planes.
    #[serde(default)]
    pub memory: MemoryKind,
}

impl PoolConfig {
    /// Config with the remaining options at their defaults.
    #[must_use]
    pub fn new(
        planes: Vec<PlaneLayout>,
        requested_count: usize,
        allowed_max: usize,
        mode: AllocMode,
    ) -> Self {
        Self {
            planes,
            requested_count,
            allowed_max,
            mode,
            index_offset: 0,
            metadata_plane: false,
            needs_mapping: false,
            memory: MemoryKind::default(),
        }
    }

    /// Set the first slot index.
    #[must_use]
    pub fn with_index_offset(mut self, offset: usize) -> Self {
        self.index_offset = offset;
        self
    }

    /// Enable or disable the metadata plane.
    #[must_use]
    pub fn with_metadata_plane(mut self, enabled: bool) -> Self {
        self.metadata_plane = enabled;
        self
    }

    /// Enable or disable CPU mappings.
    #[must_use]
    pub fn with_mapping(mut self, enabled: bool) -> Self {
        self.needs_mapping = enabled;
        self
    }

    /// Set the caching policy.
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryKind) -> Self {
        self.memory = memory;
        self
    }

    /// Check counts and plane geometry.
    pub fn validate(&self) -> CaptureResult<()> {
        if self.planes.is_empty() {
            return Err(CaptureError::InvalidArgument(
                "at least one image plane is required".into(),
            ));
        }
        let total_planes = self.planes.len() + usize::from(self.metadata_plane);
        if total_planes > MAX_PLANES {
            return Err(CaptureError::InvalidArgument(format!(
                "{total_planes} planes exceed the maximum of {MAX_PLANES}"
            )));
        }
        if let Some(i) = self.planes.iter().position(|p| p.size == 0) {
            return Err(CaptureError::InvalidArgument(format!(
                "plane {i} has zero size"
            )));
        }
        if self.requested_count > self.allowed_max {
            return Err(CaptureError::InvalidArgument(format!(
                "requested count {} exceeds allowed max {}",
                self.requested_count, self.allowed_max
            )));
        }
        if self.allowed_max + self.index_offset > MAX_SLOTS {
            return Err(CaptureError::InvalidArgument(format!(
                "allowed max {} with offset {} exceeds {MAX_SLOTS} slots",
                self.allowed_max, self.index_offset
            )));
        }
        Ok(())
    }

    fn alloc_flags(&self) -> AllocFlags {
        AllocFlags {
            cached: self.memory != MemoryKind::NonCached,
            map: self.needs_mapping,
            sync_force: self.memory == MemoryKind::CachedSyncForce,
        }
    }
}

#[derive(Clone)]
enum Provider {
    Memory(Arc<dyn MemoryBackend>),
    Surface(Arc<dyn SurfaceQueue>),
}

impl Provider {
    fn name(&self) -> &str {
        match self {
            Provider::Memory(backend) => backend.name(),
            Provider::Surface(surface) => surface.name(),
        }
    }
}

struct SlotEntry {
    slot: BufferSlot,
    backing: Vec<Allocation>,
    surface_descriptor: Option<i32>,
}

#[derive(Default)]
struct PoolState {
    config: Option<PoolConfig>,
    entries: Vec<SlotEntry>,
    available: VecDeque<usize>,
    allocated: usize,
    is_allocated: bool,
    skip_allocation: bool,
    growing: bool,
    dequeued: usize,
}

impl PoolState {
    fn offset(&self) -> usize {
        self.config.as_ref().map_or(0, |c| c.index_offset)
    }

    fn is_valid_index(&self, index: usize) -> bool {
        let offset = self.offset();
        index >= offset && index < offset + self.allocated
    }

    fn entry(&self, index: usize) -> Option<&SlotEntry> {
        index
            .checked_sub(self.offset())
            .and_then(|pos| self.entries.get(pos))
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut SlotEntry> {
        let offset = self.offset();
        index
            .checked_sub(offset)
            .and_then(|pos| self.entries.get_mut(pos))
    }

    /// The single place where slot ownership changes.
    fn update_status(
        &mut self,
        index: usize,
        position: BufferPosition,
        permission: BufferPermission,
    ) -> CaptureResult<()> {
        let entry = self.entry_mut(index).ok_or_else(|| {
            CaptureError::InvalidOperation(format!("status update for unknown slot {index}"))
        })?;
        let previous = entry.slot.status;
        entry.slot.status = SlotStatus::new(position, permission);
        trace!(index, from = %previous, to = %entry.slot.status, "slot status");
        Ok(())
    }

    fn allocated_entries(&self) -> &[SlotEntry] {
        &self.entries[..self.allocated.min(self.entries.len())]
    }

    fn count_permission(&self, permission: BufferPermission) -> usize {
        self.allocated_entries()
            .iter()
            .filter(|e| e.slot.status.permission == permission)
            .count()
    }

    /// Mark every allocated slot available and queue them in index order.
    fn reset_sequence(&mut self, position: BufferPosition) -> CaptureResult<()> {
        let offset = self.offset();
        self.available.clear();
        for index in offset..offset + self.allocated {
            self.update_status(index, position, BufferPermission::Available)?;
            self.available.push_back(index);
        }
        Ok(())
    }

    fn commit(&mut self, pos: usize, allocations: Vec<Allocation>) {
        if let Some(entry) = self.entries.get_mut(pos) {
            for (plane, allocation) in entry.slot.planes.iter_mut().zip(&allocations) {
                plane.descriptor = Some(allocation.descriptor);
                plane.address = allocation.address;
            }
            entry.backing = allocations;
        }
    }
}

struct PoolInner {
    name: String,
    provider: Provider,
    state: Mutex<PoolState>,
    growth: Mutex<Option<JoinHandle<()>>>,
    stop_growth: AtomicBool,
    total_acquires: AtomicU64,
    total_releases: AtomicU64,
}

/// Pool of hardware buffer slots with explicit ownership tracking.
///
/// Cheap to clone; clones share the same slots. Memory is released by
/// [`BufferPool::teardown`], or forcibly when the last clone is dropped.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.inner.name)
            .field("backend", &self.inner.provider.name())
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Pool backed by an allocation backend.
    pub fn new(name: impl Into<String>, backend: Arc<dyn MemoryBackend>) -> Self {
        Self::with_provider(name.into(), Provider::Memory(backend))
    }

    /// Pool backed by a display-surface queue.
    pub fn with_surface(name: impl Into<String>, surface: Arc<dyn SurfaceQueue>) -> Self {
        Self::with_provider(name.into(), Provider::Surface(surface))
    }

    fn with_provider(name: String, provider: Provider) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                provider,
                state: Mutex::new(PoolState::default()),
                growth: Mutex::new(None),
                stop_growth: AtomicBool::new(false),
                total_acquires: AtomicU64::new(0),
                total_releases: AtomicU64::new(0),
            }),
        }
    }

    /// Validate and record slot geometry for `[offset, offset + allowed_max)`.
    pub fn configure(&self, config: PoolConfig) -> CaptureResult<()> {
        config.validate()?;
        if matches!(self.inner.provider, Provider::Surface(_)) {
            if config.mode != AllocMode::AllAtOnce {
                return Err(CaptureError::InvalidArgument(
                    "surface pools only support all-at-once allocation".into(),
                ));
            }
            if config.metadata_plane {
                return Err(CaptureError::InvalidArgument(
                    "surface pools do not carry a metadata plane".into(),
                ));
            }
        }

        let mut state = self.inner.state.lock();
        if state.is_allocated {
            error!(pool = %self.inner.name, "configure called while buffers are allocated");
            return Err(CaptureError::InvalidOperation(format!(
                "pool '{}' is allocated; tear it down before reconfiguring",
                self.inner.name
            )));
        }

        state.entries = (0..config.allowed_max)
            .map(|pos| SlotEntry {
                slot: BufferSlot::new(
                    config.index_offset + pos,
                    &config.planes,
                    config.metadata_plane,
                    config.memory,
                ),
                backing: Vec::new(),
                surface_descriptor: None,
            })
            .collect();
        state.available.clear();
        state.allocated = 0;
        state.skip_allocation = false;

        info!(
            pool = %self.inner.name,
            backend = %self.inner.provider.name(),
            planes = config.planes.len(),
            requested = config.requested_count,
            allowed_max = config.allowed_max,
            mode = ?config.mode,
            offset = config.index_offset,
            metadata_plane = config.metadata_plane,
            "BufferPool configured"
        );
        state.config = Some(config);
        Ok(())
    }

    /// Materialize the requested slots.
    ///
    /// Skipped (and the skip cleared) when called right after [`BufferPool::reset`],
    /// since the memory is still held.
    pub fn allocate(&self) -> CaptureResult<()> {
        let mut state = self.inner.state.lock();
        let config = self.require_config(&state)?;

        if state.skip_allocation {
            info!(pool = %self.inner.name, "allocation skipped, buffers retained across reset");
            state.skip_allocation = false;
            return Ok(());
        }
        if state.is_allocated {
            info!(pool = %self.inner.name, allocated = state.allocated, "already allocated");
            return Ok(());
        }

        let requested = config.requested_count;
        match &self.inner.provider {
            Provider::Memory(backend) => {
                let slots: Vec<BufferSlot> = state.entries[..requested]
                    .iter()
                    .map(|e| e.slot.clone())
                    .collect();
                let allocations =
                    materialize(backend.as_ref(), &self.inner.name, &slots, config.alloc_flags())?;
                for (pos, slot_allocations) in allocations.into_iter().enumerate() {
                    state.commit(pos, slot_allocations);
                }
                state.allocated = requested;
                state.reset_sequence(BufferPosition::None)?;
            }
            Provider::Surface(surface) => {
                self.allocate_surface(surface.as_ref(), &mut state, requested)?;
            }
        }
        state.is_allocated = true;

        info!(
            pool = %self.inner.name,
            allocated = state.allocated,
            allowed_max = config.allowed_max,
            "BufferPool allocated"
        );

        let grow_in_background =
            config.mode == AllocMode::SilentGrowth && state.allocated < config.allowed_max;
        drop(state);
        if grow_in_background {
            self.spawn_growth_worker();
        }
        Ok(())
    }

    fn allocate_surface(
        &self,
        surface: &dyn SurfaceQueue,
        state: &mut PoolState,
        requested: usize,
    ) -> CaptureResult<()> {
        let started = Instant::now();
        let mut borrowed = Vec::with_capacity(requested);
        for pos in 0..requested {
            let needed = state.entries[pos].slot.image_plane_count();
            let outcome = surface.dequeue().and_then(|buffer| {
                if buffer.planes.len() < needed {
                    let _ = surface.cancel(buffer.descriptor);
                    Err(CaptureError::AllocationFailed(format!(
                        "surface buffer has {} planes, slot needs {needed}",
                        buffer.planes.len()
                    )))
                } else {
                    Ok(buffer)
                }
            });
            match outcome {
                Ok(buffer) => borrowed.push(buffer),
                Err(e) => {
                    for buffer in &borrowed {
                        if let Err(cancel_err) = surface.cancel(buffer.descriptor) {
                            warn!(pool = %self.inner.name, error = %cancel_err, "rollback cancel failed");
                        }
                    }
                    error!(pool = %self.inner.name, slot = pos, error = %e, "surface allocation failed");
                    return Err(CaptureError::AllocationFailed(format!(
                        "surface slot {pos}: {e}"
                    )));
                }
            }
        }

        let bytes: usize = borrowed
            .iter()
            .flat_map(|b| b.planes.iter().map(|p| p.size))
            .sum();
        check_latency(&self.inner.name, SURFACE_US_PER_MIB, bytes, started.elapsed());

        for (pos, buffer) in borrowed.iter().enumerate() {
            state.commit(pos, buffer.planes.clone());
        }
        state.allocated = requested;
        state.reset_sequence(BufferPosition::InService)?;
        state.available.clear();

        let mut first_error = None;
        for buffer in &borrowed {
            if let Err(e) = surface.cancel(buffer.descriptor) {
                warn!(pool = %self.inner.name, descriptor = buffer.descriptor, error = %e, "cancel after allocation failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => {
                release_memory(&self.inner.provider, &self.inner.name, state);
                Err(CaptureError::AllocationFailed(e.to_string()))
            }
        }
    }

    /// Hand out a free slot and mark it `IN_PROCESS`.
    ///
    /// `preferred` is honored when that index is currently available;
    /// otherwise the oldest available slot is returned.
    pub fn acquire(&self, preferred: Option<usize>) -> CaptureResult<BufferSlot> {
        let mut state = self.inner.state.lock();
        let config = self.require_config(&state)?;
        if !state.is_allocated {
            error!(pool = %self.inner.name, "acquire on an unallocated pool");
            return Err(CaptureError::InvalidOperation(format!(
                "pool '{}' is not allocated",
                self.inner.name
            )));
        }

        if let Provider::Surface(surface) = &self.inner.provider {
            let surface = Arc::clone(surface);
            return self.acquire_surface(surface.as_ref(), state, &config);
        }

        let mut grown = false;
        loop {
            let picked = match preferred.and_then(|p| state.available.iter().position(|&i| i == p)) {
                Some(pos) => state.available.remove(pos),
                None => state.available.pop_front(),
            };

            if let Some(index) = picked {
                let permission = state
                    .entry(index)
                    .map(|e| e.slot.status.permission)
                    .unwrap_or_default();
                if permission != BufferPermission::Available {
                    error!(pool = %self.inner.name, index, ?permission, "queued slot is not available");
                    return Err(CaptureError::InvalidOperation(format!(
                        "slot {index} was queued while {permission:?}"
                    )));
                }
                state.update_status(index, BufferPosition::InHal, BufferPermission::InProcess)?;
                self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.inner.name, index, "buffer acquired");
                return state
                    .entry(index)
                    .map(|e| e.slot.clone())
                    .ok_or_else(|| CaptureError::InvalidOperation(format!("slot {index} vanished")));
            }

            if config.mode == AllocMode::OnDemand && !grown && state.allocated < config.allowed_max {
                self.grow_locked(&mut state, &config, 1)?;
                grown = true;
                continue;
            }

            warn!(
                pool = %self.inner.name,
                allocated = state.allocated,
                allowed_max = config.allowed_max,
                "Pool exhausted - backpressure detected"
            );
            return Err(CaptureError::NoBufferAvailable {
                pool: self.inner.name.clone(),
                allocated: state.allocated,
                allowed_max: config.allowed_max,
            });
        }
    }

    fn acquire_surface(
        &self,
        surface: &dyn SurfaceQueue,
        mut state: parking_lot::MutexGuard<'_, PoolState>,
        config: &PoolConfig,
    ) -> CaptureResult<BufferSlot> {
        let min_undequeued = surface.min_undequeued();
        let limit = config.requested_count.saturating_sub(min_undequeued);
        if state.dequeued >= limit {
            info!(
                pool = %self.inner.name,
                dequeued = state.dequeued,
                requested = config.requested_count,
                min_undequeued,
                "surface floor reached, skipping dequeue"
            );
            return Err(CaptureError::NoBufferAvailable {
                pool: self.inner.name.clone(),
                allocated: state.allocated,
                allowed_max: limit,
            });
        }
        // Reserve before unlocking so concurrent acquirers respect the floor.
        state.dequeued += 1;
        drop(state);

        let dequeued = surface.dequeue();

        let mut state = self.inner.state.lock();
        let buffer = match dequeued {
            Ok(buffer) => buffer,
            Err(e) => {
                state.dequeued -= 1;
                return Err(e);
            }
        };

        let address = buffer.identity_address();
        let index = state
            .allocated_entries()
            .iter()
            .find(|e| e.slot.planes.first().map(|p| p.address) == Some(address))
            .map(|e| e.slot.index);

        let Some(index) = index else {
            state.dequeued -= 1;
            drop(state);
            info!(pool = %self.inner.name, descriptor = buffer.descriptor, "dequeued buffer unknown to pool, cancelling");
            if let Err(e) = surface.cancel(buffer.descriptor) {
                warn!(pool = %self.inner.name, error = %e, "cancel of unknown buffer failed");
            }
            return Err(CaptureError::InvalidOperation(format!(
                "surface returned buffer {} not owned by pool '{}'",
                buffer.descriptor, self.inner.name
            )));
        };

        if let Some(entry) = state.entry_mut(index) {
            entry.surface_descriptor = Some(buffer.descriptor);
        }
        state.update_status(index, BufferPosition::InHal, BufferPermission::InProcess)?;
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.inner.name, index, "surface buffer acquired");
        state
            .entry(index)
            .map(|e| e.slot.clone())
            .ok_or_else(|| CaptureError::InvalidOperation(format!("slot {index} vanished")))
    }

    /// Return a slot and record where it ended up.
    ///
    /// Releasing a slot that is already available is a logged no-op. Surface
    /// pools present the buffer and always record `IN_SERVICE`.
    pub fn release(&self, index: usize, position: BufferPosition) -> CaptureResult<()> {
        let mut state = self.inner.state.lock();
        self.check_index(&state, index)?;

        let (status, surface_descriptor) = match state.entry(index) {
            Some(entry) => (entry.slot.status, entry.surface_descriptor),
            None => return Err(CaptureError::InvalidOperation(format!("slot {index} missing"))),
        };

        if status.permission == BufferPermission::Available {
            info!(pool = %self.inner.name, index, "buffer already available, ignoring release");
            return Ok(());
        }

        match &self.inner.provider {
            Provider::Memory(_) => {
                state.update_status(index, position, BufferPermission::Available)?;
                state.available.push_back(index);
            }
            Provider::Surface(surface) => {
                if status.position == BufferPosition::InHal {
                    if let Some(descriptor) = surface_descriptor {
                        surface.enqueue(descriptor)?;
                        state.dequeued = state.dequeued.saturating_sub(1);
                    }
                }
                if let Some(entry) = state.entry_mut(index) {
                    entry.surface_descriptor = None;
                }
                state.update_status(index, BufferPosition::InService, BufferPermission::Available)?;
            }
        }

        self.inner.total_releases.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.inner.name, index, ?position, "buffer released");
        Ok(())
    }

    /// Return a slot without presenting it.
    pub fn cancel(&self, index: usize) -> CaptureResult<()> {
        let Provider::Surface(surface) = &self.inner.provider else {
            return self.release(index, BufferPosition::None);
        };

        let mut state = self.inner.state.lock();
        self.check_index(&state, index)?;
        let descriptor = state.entry_mut(index).and_then(|e| e.surface_descriptor.take());
        match descriptor {
            Some(descriptor) => {
                surface.cancel(descriptor)?;
                state.dequeued = state.dequeued.saturating_sub(1);
                state.update_status(index, BufferPosition::InService, BufferPermission::Available)?;
                self.inner.total_releases.fetch_add(1, Ordering::Relaxed);
            }
            None => debug!(pool = %self.inner.name, index, "cancel of buffer not held in HAL"),
        }
        Ok(())
    }

    /// Materialize up to `count` more slots, clamped to `allowed_max`.
    ///
    /// Returns how many slots were added.
    pub fn grow(&self, count: usize) -> CaptureResult<usize> {
        let mut state = self.inner.state.lock();
        let config = self.require_config(&state)?;
        if !state.is_allocated {
            return Err(CaptureError::InvalidOperation(format!(
                "pool '{}' is not allocated",
                self.inner.name
            )));
        }
        if config.mode == AllocMode::SilentGrowth {
            return Err(CaptureError::InvalidOperation(
                "silent-growth pools grow on their background worker".into(),
            ));
        }
        self.grow_locked(&mut state, &config, count)
    }

    fn grow_locked(
        &self,
        state: &mut PoolState,
        config: &PoolConfig,
        count: usize,
    ) -> CaptureResult<usize> {
        let Provider::Memory(backend) = &self.inner.provider else {
            return Err(CaptureError::InvalidOperation(
                "surface pools cannot grow".into(),
            ));
        };

        let begin = state.allocated;
        let count = count.min(config.allowed_max.saturating_sub(begin));
        if count == 0 {
            return Ok(0);
        }

        let slots: Vec<BufferSlot> = state.entries[begin..begin + count]
            .iter()
            .map(|e| e.slot.clone())
            .collect();
        let allocations =
            materialize(backend.as_ref(), &self.inner.name, &slots, config.alloc_flags())?;

        for (i, slot_allocations) in allocations.into_iter().enumerate() {
            state.commit(begin + i, slot_allocations);
            let index = config.index_offset + begin + i;
            state.allocated += 1;
            state.update_status(index, BufferPosition::None, BufferPermission::Available)?;
            state.available.push_back(index);
        }

        warn!(
            pool = %self.inner.name,
            old_size = begin,
            new_size = state.allocated,
            requested = config.requested_count,
            allowed_max = config.allowed_max,
            "Pool grown beyond previous size"
        );
        Ok(count)
    }

    /// Free the highest slot when the pool has grown past its requested count.
    pub fn shrink(&self) -> CaptureResult<()> {
        let mut state = self.inner.state.lock();
        let config = self.require_config(&state)?;
        let Provider::Memory(backend) = &self.inner.provider else {
            return Err(CaptureError::InvalidOperation(
                "surface pools cannot shrink".into(),
            ));
        };
        if state.growing {
            return Err(CaptureError::InvalidOperation(
                "background growth in progress".into(),
            ));
        }
        if state.allocated <= config.requested_count {
            return Err(CaptureError::InvalidOperation(format!(
                "allocated {} is not above requested {}",
                state.allocated, config.requested_count
            )));
        }

        let pos = state.allocated - 1;
        let index = config.index_offset + pos;
        if state.entries[pos].slot.status.permission == BufferPermission::InProcess {
            return Err(CaptureError::BufferInUse { index });
        }

        free_all(backend.as_ref(), &self.inner.name, &state.entries[pos].backing);
        let entry = &mut state.entries[pos];
        entry.backing.clear();
        entry.slot.clear_memory();
        state.available.retain(|&i| i != index);
        state.update_status(index, BufferPosition::None, BufferPermission::None)?;
        state.allocated -= 1;

        info!(pool = %self.inner.name, index, allocated = state.allocated, "Pool shrunk");
        Ok(())
    }

    /// Return every held slot to `AVAILABLE` without freeing memory.
    ///
    /// The next [`BufferPool::allocate`] is skipped.
    pub fn reset(&self) -> CaptureResult<()> {
        self.stop_growth_worker();

        let mut state = self.inner.state.lock();
        if !state.is_allocated {
            debug!(pool = %self.inner.name, "reset on unallocated pool");
            return Ok(());
        }

        let held = state.count_permission(BufferPermission::InProcess);
        match &self.inner.provider {
            Provider::Memory(_) => state.reset_sequence(BufferPosition::None)?,
            Provider::Surface(surface) => {
                let offset = state.offset();
                for index in offset..offset + state.allocated {
                    let descriptor = state.entry_mut(index).and_then(|e| e.surface_descriptor.take());
                    if let Some(descriptor) = descriptor {
                        if let Err(e) = surface.cancel(descriptor) {
                            warn!(pool = %self.inner.name, index, error = %e, "cancel during reset failed");
                        }
                    }
                    state.update_status(index, BufferPosition::InService, BufferPermission::Available)?;
                }
                state.dequeued = 0;
            }
        }
        state.skip_allocation = true;

        info!(pool = %self.inner.name, returned = held, "BufferPool reset");
        Ok(())
    }

    /// Release backend memory for every allocated slot.
    ///
    /// Refuses with `BufferInUse` while any slot is `IN_PROCESS`; nothing is
    /// freed in that case.
    pub fn teardown(&self) -> CaptureResult<()> {
        self.stop_growth_worker();

        let mut state = self.inner.state.lock();
        if !state.is_allocated {
            return Ok(());
        }
        let offset = state.offset();
        if let Some(pos) = state
            .allocated_entries()
            .iter()
            .position(|e| e.slot.status.permission == BufferPermission::InProcess)
        {
            warn!(pool = %self.inner.name, index = offset + pos, "teardown refused, buffer still in process");
            return Err(CaptureError::BufferInUse {
                index: offset + pos,
            });
        }

        let freed = state.allocated;
        release_memory(&self.inner.provider, &self.inner.name, &mut state);
        info!(pool = %self.inner.name, freed, "BufferPool torn down");
        Ok(())
    }

    fn spawn_growth_worker(&self) {
        self.inner.stop_growth.store(false, Ordering::Release);
        let weak = Arc::downgrade(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("pool-grow-{}", self.inner.name))
            .spawn(move || growth_loop(&weak));
        match spawned {
            Ok(handle) => *self.inner.growth.lock() = Some(handle),
            Err(e) => error!(pool = %self.inner.name, error = %e, "failed to spawn growth worker"),
        }
    }

    fn stop_growth_worker(&self) {
        self.inner.stop_growth.store(true, Ordering::Release);
        let handle = self.inner.growth.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(pool = %self.inner.name, "growth worker panicked");
            }
        }
    }

    fn require_config(&self, state: &PoolState) -> CaptureResult<PoolConfig> {
        state.config.clone().ok_or_else(|| {
            error!(pool = %self.inner.name, "operation on unconfigured pool");
            CaptureError::InvalidOperation(format!("pool '{}' is not configured", self.inner.name))
        })
    }

    fn check_index(&self, state: &PoolState, index: usize) -> CaptureResult<()> {
        if state.is_allocated && state.is_valid_index(index) {
            return Ok(());
        }
        error!(pool = %self.inner.name, index, allocated = state.allocated, "index out of range");
        Err(CaptureError::InvalidOperation(format!(
            "slot {index} outside [{}, {})",
            state.offset(),
            state.offset() + state.allocated
        )))
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether `allocate()` has completed.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.inner.state.lock().is_allocated
    }

    /// Slots currently backed by memory.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.inner.state.lock().allocated
    }

    /// Slots that may be acquired right now.
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .count_permission(BufferPermission::Available)
    }

    /// Slots currently handed out.
    #[must_use]
    pub fn in_process_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .count_permission(BufferPermission::InProcess)
    }

    /// Ownership state of one slot.
    #[must_use]
    pub fn status(&self, index: usize) -> Option<SlotStatus> {
        self.inner.state.lock().entry(index).map(|e| e.slot.status)
    }

    /// Snapshot of one slot.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<BufferSlot> {
        self.inner.state.lock().entry(index).map(|e| e.slot.clone())
    }

    /// Total successful acquisitions.
    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    /// Total releases that changed a slot's state.
    #[must_use]
    pub fn total_releases(&self) -> u64 {
        self.inner.total_releases.load(Ordering::Relaxed)
    }

    /// Log every allocated slot's state at debug level.
    pub fn dump_state(&self) {
        let state = self.inner.state.lock();
        debug!(
            pool = %self.inner.name,
            allocated = state.allocated,
            queued = ?state.available,
            "pool state"
        );
        for entry in state.allocated_entries() {
            debug!(
                pool = %self.inner.name,
                index = entry.slot.index,
                status = %entry.slot.status,
                planes = entry.slot.planes.len(),
                "slot"
            );
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.stop_growth.store(true, Ordering::Release);
        if let Some(handle) = self.growth.get_mut().take() {
            // The worker may itself be dropping the last handle.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        let state = self.state.get_mut();
        if !state.is_allocated {
            return;
        }
        for entry in state.allocated_entries() {
            if entry.slot.status.permission == BufferPermission::InProcess {
                warn!(
                    pool = %self.name,
                    index = entry.slot.index,
                    "forcing free of in-process buffer at pool destruction, upstream leak"
                );
            }
        }
        release_memory(&self.provider, &self.name, state);
    }
}

fn growth_loop(pool: &Weak<PoolInner>) {
    loop {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.stop_growth.load(Ordering::Acquire) {
            return;
        }
        match grow_one(&inner) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(pool = %inner.name, error = %e, "background growth stopped");
                return;
            }
        }
    }
}

/// Add one slot from the growth worker, allocating outside the pool lock.
fn grow_one(inner: &PoolInner) -> CaptureResult<bool> {
    let Provider::Memory(backend) = &inner.provider else {
        return Ok(false);
    };

    let (slot, flags, pos) = {
        let mut state = inner.state.lock();
        let Some(config) = state.config.as_ref() else {
            return Ok(false);
        };
        if !state.is_allocated || state.allocated >= config.allowed_max {
            return Ok(false);
        }
        let flags = config.alloc_flags();
        let pos = state.allocated;
        state.growing = true;
        (state.entries[pos].slot.clone(), flags, pos)
    };

    let result = materialize(backend.as_ref(), &inner.name, std::slice::from_ref(&slot), flags);

    let mut state = inner.state.lock();
    state.growing = false;
    let mut allocations = result?;
    if inner.stop_growth.load(Ordering::Acquire) || !state.is_allocated || state.allocated != pos {
        for slot_allocations in &allocations {
            free_all(backend.as_ref(), &inner.name, slot_allocations);
        }
        return Ok(false);
    }

    state.commit(pos, allocations.pop().unwrap_or_default());
    state.allocated += 1;
    state.update_status(slot.index, BufferPosition::None, BufferPermission::Available)?;
    state.available.push_back(slot.index);
    debug!(pool = %inner.name, index = slot.index, allocated = state.allocated, "silently grown");
    Ok(true)
}

/// Allocate every plane of `slots`: metadata planes first, then image planes.
///
/// On failure everything allocated by this call is freed again.
fn materialize(
    backend: &dyn MemoryBackend,
    pool: &str,
    slots: &[BufferSlot],
    flags: AllocFlags,
) -> CaptureResult<Vec<Vec<Allocation>>> {
    let meta_flags = AllocFlags {
        map: true,
        ..AllocFlags::default()
    };

    let mut metas: Vec<Option<Allocation>> = Vec::with_capacity(slots.len());
    for slot in slots {
        let Some(plane) = slot.metadata_plane() else {
            metas.push(None);
            continue;
        };
        match backend.alloc(plane.size, meta_flags) {
            Ok(allocation) => metas.push(Some(allocation)),
            Err(e) => {
                error!(pool, index = slot.index, error = %e, "metadata plane allocation failed");
                free_all(backend, pool, metas.iter().flatten());
                return Err(CaptureError::AllocationFailed(format!(
                    "slot {} metadata plane: {e}",
                    slot.index
                )));
            }
        }
    }

    let mut images: Vec<Vec<Allocation>> = Vec::with_capacity(slots.len());
    for slot in slots {
        let started = Instant::now();
        let count = slot.image_plane_count();
        let mut planes = Vec::with_capacity(count + 1);
        for (plane_index, plane) in slot.planes[..count].iter().enumerate() {
            match backend.alloc(plane.size, flags) {
                Ok(allocation) => planes.push(allocation),
                Err(e) => {
                    error!(pool, index = slot.index, plane = plane_index, error = %e, "image plane allocation failed");
                    free_all(
                        backend,
                        pool,
                        planes
                            .iter()
                            .chain(images.iter().flatten())
                            .chain(metas.iter().flatten()),
                    );
                    return Err(CaptureError::AllocationFailed(format!(
                        "slot {} plane {plane_index}: {e}",
                        slot.index
                    )));
                }
            }
        }
        check_latency(
            pool,
            slot.kind.estimated_us_per_mib(),
            slot.image_bytes(),
            started.elapsed(),
        );
        images.push(planes);
    }

    Ok(images
        .into_iter()
        .zip(metas)
        .map(|(mut planes, meta)| {
            planes.extend(meta);
            planes
        })
        .collect())
}

fn free_all<'a>(
    backend: &dyn MemoryBackend,
    pool: &str,
    allocations: impl IntoIterator<Item = &'a Allocation>,
) {
    for allocation in allocations {
        if let Err(e) = backend.free(allocation) {
            warn!(pool, descriptor = allocation.descriptor, error = %e, "free failed");
        }
    }
}

/// Free (or cancel) every allocated slot and return the pool to unallocated.
fn release_memory(provider: &Provider, pool: &str, state: &mut PoolState) {
    let allocated = state.allocated.min(state.entries.len());
    for entry in &mut state.entries[..allocated] {
        match provider {
            Provider::Memory(backend) => free_all(backend.as_ref(), pool, &entry.backing),
            Provider::Surface(surface) => {
                if let Some(descriptor) = entry.surface_descriptor.take() {
                    if let Err(e) = surface.cancel(descriptor) {
                        warn!(pool, descriptor, error = %e, "cancel during teardown failed");
                    }
                }
            }
        }
        entry.backing.clear();
        entry.slot.clear_memory();
        entry.slot.status = SlotStatus::default();
    }
    state.available.clear();
    state.allocated = 0;
    state.dequeued = 0;
    state.is_allocated = false;
    state.skip_allocation = false;
}

fn check_latency(pool: &str, us_per_mib: u64, bytes: usize, elapsed: Duration) {
    let estimate = Duration::from_micros(us_per_mib * bytes as u64 / MIB).max(Duration::from_millis(1));
    if elapsed > estimate {
        warn!(
            pool,
            bytes,
            elapsed_us = elapsed.as_micros() as u64,
            estimated_us = estimate.as_micros() as u64,
            "allocation slower than estimated"
        );
    }
}
