//! Cross-stream frame correlation by timestamp.
//!
//! # Design
//!
//! One synchronizer is built per capture session and shared by the selectors
//! of every participating stream. All cross-stream state lives behind a single
//! lock, since a match decision compares every stream's pending list at once.
//!
//! Per stream there are three lists of sync objects (a frame key plus its
//! millisecond timestamp):
//!
//! - `unsynced`: arrived, no partner found yet.
//! - `synced`: partnered on every other stream, waiting for a consumer.
//! - `output`: handed out together with its partners, not yet consumed.
//!
//! When a frame arrives it is compared against every other stream's `unsynced`
//! list. A complete match moves one object per stream to `synced` and destroys
//! everything older, so no stream can later see an older frame as synced.
//! Without a complete match, the arriving stream's `unsynced` list is trimmed
//! to `min_retained` before the new object is appended.
//!
//! Destroying a sync object releases its buffer (recorded as `IN_HAL`), unlocks
//! the frame and attempts to destroy it.

use crate::frame::{BufferTarget, FrameArena, FrameKey};
use crate::selector::Selection;
use capture_core::{CaptureError, CaptureResult, StreamId};
use capture_pool::{BufferPool, BufferPosition};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const NS_PER_MS: u64 = 1_000_000;

/// Synchronizer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Route normal hold/select traffic through the synchronizer.
    pub enabled: bool,
    /// Largest timestamp difference treated as the same instant (inclusive).
    pub tolerance_ms: u64,
    /// Unmatched objects kept per stream when a new frame does not match.
    pub min_retained: usize,
    /// Count undelivered output frames against the hold capacity.
    pub subtract_output_backlog: bool,
    /// Unsynced objects per stream above which new frames are refused.
    pub max_unsynced: usize,
    /// Wait per selection try.
    pub wait_time_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tolerance_ms: 2,
            min_retained: 1,
            subtract_output_backlog: true,
            max_unsynced: 100,
            wait_time_ms: 2000,
        }
    }
}

impl SyncConfig {
    /// Check limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_unsynced == 0 {
            return Err("dual.max_unsynced must be at least 1".to_string());
        }
        if self.min_retained >= self.max_unsynced {
            return Err(format!(
                "dual.min_retained ({}) must be below dual.max_unsynced ({})",
                self.min_retained, self.max_unsynced
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncObject {
    key: FrameKey,
    target: BufferTarget,
    timestamp_ms: u64,
}

struct StreamState {
    hold_capacity: usize,
    pool: BufferPool,
    unsynced: VecDeque<SyncObject>,
    synced: VecDeque<SyncObject>,
    output: VecDeque<SyncObject>,
}

#[derive(Default)]
struct DualState {
    streams: BTreeMap<StreamId, StreamState>,
}

/// Registry correlating frames across independently clocked streams.
pub struct DualStreamSynchronizer {
    arena: Arc<FrameArena>,
    config: SyncConfig,
    state: Mutex<DualState>,
    matched: Condvar,
    canceled: AtomicBool,
}

impl std::fmt::Debug for DualStreamSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualStreamSynchronizer")
            .field("config", &self.config)
            .field("streams", &self.stream_count())
            .finish_non_exhaustive()
    }
}

fn within(a: u64, b: u64, tolerance: u64) -> bool {
    a.abs_diff(b) <= tolerance
}

impl DualStreamSynchronizer {
    /// Synchronizer over frames owned by `arena`.
    #[must_use]
    pub fn new(arena: Arc<FrameArena>, config: SyncConfig) -> Self {
        Self {
            arena,
            config,
            state: Mutex::new(DualState::default()),
            matched: Condvar::new(),
            canceled: AtomicBool::new(false),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a stream, or update its capacity and pool if already known.
    pub fn register_stream(
        &self,
        stream: StreamId,
        hold_capacity: usize,
        pool: BufferPool,
    ) -> CaptureResult<()> {
        if hold_capacity == 0 {
            return Err(CaptureError::InvalidArgument(
                "hold capacity must be at least 1".into(),
            ));
        }
        let mut state = self.state.lock();
        match state.streams.get_mut(&stream) {
            Some(existing) => {
                existing.hold_capacity = hold_capacity;
                existing.pool = pool;
            }
            None => {
                state.streams.insert(
                    stream,
                    StreamState {
                        hold_capacity,
                        pool,
                        unsynced: VecDeque::new(),
                        synced: VecDeque::new(),
                        output: VecDeque::new(),
                    },
                );
            }
        }
        info!(%stream, hold_capacity, streams = state.streams.len(), "stream registered for synchronization");
        Ok(())
    }

    /// Change a registered stream's hold capacity.
    pub fn set_hold_capacity(&self, stream: StreamId, hold_capacity: usize) -> CaptureResult<()> {
        if hold_capacity == 0 {
            return Err(CaptureError::InvalidArgument(
                "hold capacity must be at least 1".into(),
            ));
        }
        let mut state = self.state.lock();
        let st = state
            .streams
            .get_mut(&stream)
            .ok_or_else(|| unregistered(stream))?;
        st.hold_capacity = hold_capacity;
        Ok(())
    }

    /// Clear and forget a stream.
    pub fn unregister_stream(&self, stream: StreamId) -> CaptureResult<()> {
        let mut st = self
            .state
            .lock()
            .streams
            .remove(&stream)
            .ok_or_else(|| unregistered(stream))?;
        let released = self.clear_stream(stream, &mut st);
        info!(%stream, released, "stream unregistered");
        self.matched.notify_all();
        Ok(())
    }

    /// Whether `stream` is registered.
    #[must_use]
    pub fn is_registered(&self, stream: StreamId) -> bool {
        self.state.lock().streams.contains_key(&stream)
    }

    /// Registered streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Offer a frame from `stream`. Returns whether it completed a match.
    ///
    /// The frame is locked for as long as the synchronizer holds it.
    pub fn hold_frame(
        &self,
        stream: StreamId,
        key: FrameKey,
        target: BufferTarget,
    ) -> CaptureResult<bool> {
        let timestamp_ns = self
            .arena
            .timestamp_ns(key)
            .ok_or_else(|| CaptureError::InvalidArgument(format!("unknown {key}")))?;
        let object = SyncObject {
            key,
            target,
            timestamp_ms: timestamp_ns / NS_PER_MS,
        };

        let mut state = self.state.lock();
        let own = state
            .streams
            .get(&stream)
            .ok_or_else(|| unregistered(stream))?;
        if own.unsynced.len() >= self.config.max_unsynced {
            error!(%stream, pending = own.unsynced.len(), "too many unsynced frames, refusing");
            return Err(CaptureError::InvalidOperation(format!(
                "{stream} has {} unsynced frames",
                own.unsynced.len()
            )));
        }
        self.arena.lock(key)?;

        let tolerance = self.config.tolerance_ms;
        let mut partners = Vec::new();
        let mut complete = state.streams.len() >= 2;
        for (&other, st) in &state.streams {
            if other == stream {
                continue;
            }
            match st
                .unsynced
                .iter()
                .position(|o| within(o.timestamp_ms, object.timestamp_ms, tolerance))
            {
                Some(pos) => partners.push((other, pos)),
                None => {
                    complete = false;
                    break;
                }
            }
        }

        if !complete {
            let min_retained = self.config.min_retained;
            if let Some(st) = state.streams.get_mut(&stream) {
                while st.unsynced.len() > min_retained {
                    if let Some(stale) = st.unsynced.pop_front() {
                        trace!(%stream, timestamp_ms = stale.timestamp_ms, "unsynced frame trimmed");
                        self.destroy(&st.pool, stale);
                    }
                }
                st.unsynced.push_back(object);
            }
            trace!(%stream, timestamp_ms = object.timestamp_ms, "frame waiting for partner");
            return Ok(false);
        }

        for (other, pos) in partners {
            if let Some(st) = state.streams.get_mut(&other) {
                let stale: Vec<SyncObject> = st.unsynced.drain(..pos).collect();
                for object in stale {
                    self.destroy(&st.pool, object);
                }
                if let Some(partner) = st.unsynced.pop_front() {
                    st.synced.push_back(partner);
                }
                self.enforce_capacity(other, st);
            }
        }
        if let Some(st) = state.streams.get_mut(&stream) {
            let stale: Vec<SyncObject> = st.unsynced.drain(..).collect();
            for object in stale {
                self.destroy(&st.pool, object);
            }
            st.synced.push_back(object);
            self.enforce_capacity(stream, st);
        }

        debug!(%stream, timestamp_ms = object.timestamp_ms, "frames synchronized");
        drop(state);
        self.matched.notify_all();
        Ok(true)
    }

    /// Pop one synchronized frame for `stream`.
    ///
    /// When the stream's output list is empty, one synced object of every
    /// stream is published to its output list first, so partners are handed
    /// out together. Each try waits up to `wait_time_ms` for a match.
    pub fn select_frames(&self, stream: StreamId, try_count: u32) -> CaptureResult<Selection> {
        let wait = Duration::from_millis(self.config.wait_time_ms);
        let mut state = self.state.lock();
        if !state.streams.contains_key(&stream) {
            return Err(unregistered(stream));
        }

        for attempt in 0..try_count.max(1) {
            let deadline = Instant::now() + wait;
            loop {
                if self.canceled.load(Ordering::Acquire) {
                    debug!(%stream, "synchronized selection canceled");
                    return Ok(Selection::Canceled);
                }
                let st = state
                    .streams
                    .get_mut(&stream)
                    .ok_or_else(|| unregistered(stream))?;
                if let Some(object) = st.output.pop_front() {
                    self.arena.add_ref(object.key)?;
                    self.arena.unlock(object.key)?;
                    debug!(%stream, key = %object.key, timestamp_ms = object.timestamp_ms, "synchronized frame selected");
                    return Ok(Selection::Selected(object.key));
                }
                if !st.synced.is_empty() {
                    Self::publish(&mut state);
                    continue;
                }
                if self.matched.wait_until(&mut state, deadline).timed_out() {
                    debug!(%stream, attempt, try_count, "synchronized selection timed out, retrying");
                    break;
                }
            }
        }
        Ok(Selection::TimedOut)
    }

    fn publish(state: &mut DualState) {
        for (stream, st) in &mut state.streams {
            if st.output.len() >= st.hold_capacity {
                warn!(%stream, output = st.output.len(), hold_capacity = st.hold_capacity, "output list over capacity");
            }
            if let Some(object) = st.synced.pop_front() {
                st.output.push_back(object);
            }
        }
    }

    /// Wake every waiter in `select_frames`; they return `Canceled`.
    pub fn wake_all(&self) {
        self.canceled.store(true, Ordering::Release);
        drop(self.state.lock());
        self.matched.notify_all();
    }

    /// Clear the cancellation flag.
    pub fn reset_cancel(&self) {
        self.canceled.store(false, Ordering::Release);
    }

    /// Release every object held for `stream`. Returns how many were released.
    pub fn clear(&self, stream: StreamId) -> usize {
        let mut state = self.state.lock();
        let Some(st) = state.streams.get_mut(&stream) else {
            debug!(%stream, "clear on unregistered stream");
            return 0;
        };
        let released = self.clear_stream(stream, st);
        debug!(%stream, released, "sync lists cleared");
        released
    }

    /// Force-release, on every stream, synced or published objects whose
    /// timestamp matches `key`'s. Returns how many were released.
    pub fn release_frames(&self, stream: StreamId, key: FrameKey) -> CaptureResult<usize> {
        let timestamp_ms = self
            .arena
            .timestamp_ns(key)
            .ok_or_else(|| CaptureError::InvalidArgument(format!("unknown {key}")))?
            / NS_PER_MS;
        let tolerance = self.config.tolerance_ms;

        let mut state = self.state.lock();
        if !state.streams.contains_key(&stream) {
            return Err(unregistered(stream));
        }
        let mut released = 0;
        for st in state.streams.values_mut() {
            let mut matching = take_matching(&mut st.synced, timestamp_ms, tolerance);
            matching.extend(take_matching(&mut st.output, timestamp_ms, tolerance));
            released += matching.len();
            for object in matching {
                self.destroy(&st.pool, object);
            }
        }
        warn!(%stream, %key, timestamp_ms, released, "synchronized frames force-released");
        Ok(released)
    }

    /// Objects of `stream` waiting for a partner.
    #[must_use]
    pub fn unsynced_len(&self, stream: StreamId) -> usize {
        self.state
            .lock()
            .streams
            .get(&stream)
            .map_or(0, |st| st.unsynced.len())
    }

    /// Objects of `stream` matched and waiting for a consumer.
    #[must_use]
    pub fn synced_len(&self, stream: StreamId) -> usize {
        self.state
            .lock()
            .streams
            .get(&stream)
            .map_or(0, |st| st.synced.len())
    }

    /// Objects of `stream` published and not yet consumed.
    #[must_use]
    pub fn output_len(&self, stream: StreamId) -> usize {
        self.state
            .lock()
            .streams
            .get(&stream)
            .map_or(0, |st| st.output.len())
    }

    fn enforce_capacity(&self, stream: StreamId, st: &mut StreamState) {
        let backlog = if self.config.subtract_output_backlog {
            st.output.len()
        } else {
            0
        };
        if st.synced.len() + backlog <= st.hold_capacity {
            return;
        }
        let keep = st.hold_capacity.saturating_sub(backlog);
        while st.synced.len() > keep {
            if let Some(object) = st.synced.pop_front() {
                debug!(%stream, timestamp_ms = object.timestamp_ms, keep, "synced frame over capacity evicted");
                self.destroy(&st.pool, object);
            }
        }
    }

    fn clear_stream(&self, stream: StreamId, st: &mut StreamState) -> usize {
        let objects: Vec<SyncObject> = st
            .unsynced
            .drain(..)
            .chain(st.synced.drain(..))
            .chain(st.output.drain(..))
            .collect();
        let released = objects.len();
        for object in objects {
            self.destroy(&st.pool, object);
        }
        trace!(%stream, released, "stream cleared");
        released
    }

    fn destroy(&self, pool: &BufferPool, object: SyncObject) {
        match self.arena.buffer_index(object.key, object.target) {
            Some(index) => {
                if let Err(e) = pool.release(index, BufferPosition::InHal) {
                    warn!(key = %object.key, index, error = %e, "buffer release failed");
                }
            }
            None => warn!(key = %object.key, "sync object has no buffer for its target"),
        }
        if let Err(e) = self.arena.unlock(object.key) {
            warn!(key = %object.key, error = %e, "unlock failed");
        }
        self.arena.try_destroy(object.key);
    }
}

impl Drop for DualStreamSynchronizer {
    fn drop(&mut self) {
        let streams = std::mem::take(&mut self.state.get_mut().streams);
        for (stream, mut st) in streams {
            self.clear_stream(stream, &mut st);
        }
    }
}

fn take_matching(
    list: &mut VecDeque<SyncObject>,
    timestamp_ms: u64,
    tolerance: u64,
) -> Vec<SyncObject> {
    let (matching, keep): (Vec<SyncObject>, Vec<SyncObject>) = list
        .drain(..)
        .partition(|o| within(o.timestamp_ms, timestamp_ms, tolerance));
    *list = keep.into();
    matching
}

fn unregistered(stream: StreamId) -> CaptureError {
    CaptureError::InvalidOperation(format!("{stream} is not registered for synchronization"))
}
