//! Frames and the arena that owns them.
//!
//! # Design
//!
//! Hold lists and sync objects never own a frame. They store its [`FrameKey`]
//! and go through the [`FrameArena`] for every state change. A frame leaves the
//! arena through exactly one path, [`FrameArena::try_destroy`], which only
//! succeeds when the frame is complete, unlocked and unreferenced.
//!
//! Reference accounting:
//!
//! | Operation | `locked` | `ref_count` |
//! |-----------|----------|-------------|
//! | `lock` (frame enters a hold list) | `true` | `+1` |
//! | `unlock` (frame leaves a hold list) | `false` | `-1` |
//! | `add_ref` / `release_ref` | unchanged | `±1` |

use capture_core::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Arena key of a frame. Unique for the lifetime of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameKey(pub u64);

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame-{}", self.0)
    }
}

/// Autofocus state captured with the frame's dynamic metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfState {
    /// Autofocus idle.
    #[default]
    Inactive,
    /// Lens still moving.
    Scanning,
    /// Focus locked.
    Focused,
    /// Focus could not be achieved.
    Failed,
}

impl AfState {
    /// True while the lens has not settled.
    #[must_use]
    pub fn is_converging(self) -> bool {
        matches!(self, AfState::Scanning)
    }
}

/// Role of a buffer attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Input of the pipeline stage.
    Source,
    /// Output of the pipeline stage, optionally one of several.
    Destination {
        /// Output position for stages with multiple outputs.
        position: Option<usize>,
    },
}

/// A pool slot referenced by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef {
    /// Pipeline stage that produced or consumed the buffer.
    pub pipe_id: u32,
    /// Source or destination.
    pub role: BufferRole,
    /// Pool slot index.
    pub index: usize,
}

/// Which of a frame's buffers a selector manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTarget {
    /// Pipeline stage id.
    pub pipe_id: u32,
    /// Source buffer when true, destination otherwise.
    pub is_source: bool,
    /// Destination position; `None` picks the first destination of the stage.
    pub dst_position: Option<usize>,
}

impl BufferTarget {
    /// Source buffer of `pipe_id`.
    #[must_use]
    pub const fn source(pipe_id: u32) -> Self {
        Self {
            pipe_id,
            is_source: true,
            dst_position: None,
        }
    }

    /// Destination buffer of `pipe_id`.
    #[must_use]
    pub const fn destination(pipe_id: u32, dst_position: Option<usize>) -> Self {
        Self {
            pipe_id,
            is_source: false,
            dst_position,
        }
    }

    fn matches(&self, buffer: &BufferRef) -> bool {
        if buffer.pipe_id != self.pipe_id {
            return false;
        }
        match (self.is_source, buffer.role) {
            (true, BufferRole::Source) => true,
            (false, BufferRole::Destination { position }) => {
                self.dst_position.is_none() || self.dst_position == position
            }
            _ => false,
        }
    }
}

/// One capture exposure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Arena key.
    pub key: FrameKey,
    /// Capture sequence number.
    pub frame_count: u32,
    /// Capture timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Every pipeline stage has finished with the frame.
    pub complete: bool,
    /// Held by a hold list or sync list.
    pub locked: bool,
    /// Outstanding references.
    pub ref_count: u32,
    /// Autofocus snapshot.
    pub af_state: AfState,
    /// Attached pool slots.
    pub buffers: Vec<BufferRef>,
}

impl Frame {
    fn is_destroyable(&self) -> bool {
        self.complete && !self.locked && self.ref_count == 0
    }
}

/// Owner of every live frame.
#[derive(Debug)]
pub struct FrameArena {
    next_key: AtomicU64,
    destroyed: AtomicU64,
    frames: Mutex<HashMap<FrameKey, Frame>>,
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameArena {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_key: AtomicU64::new(1),
            destroyed: AtomicU64::new(0),
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new, incomplete frame with no references.
    pub fn create(&self, frame_count: u32, timestamp_ns: u64) -> FrameKey {
        let key = FrameKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.frames.lock().insert(
            key,
            Frame {
                key,
                frame_count,
                timestamp_ns,
                complete: false,
                locked: false,
                ref_count: 0,
                af_state: AfState::default(),
                buffers: Vec::new(),
            },
        );
        trace!(%key, frame_count, timestamp_ns, "frame created");
        key
    }

    fn with_frame<R>(&self, key: FrameKey, f: impl FnOnce(&mut Frame) -> R) -> CaptureResult<R> {
        let mut frames = self.frames.lock();
        frames
            .get_mut(&key)
            .map(f)
            .ok_or_else(|| CaptureError::InvalidArgument(format!("unknown {key}")))
    }

    /// Attach a pool slot to the frame.
    pub fn attach_buffer(&self, key: FrameKey, buffer: BufferRef) -> CaptureResult<()> {
        self.with_frame(key, |frame| frame.buffers.push(buffer))
    }

    /// Record the autofocus snapshot.
    pub fn set_af_state(&self, key: FrameKey, state: AfState) -> CaptureResult<()> {
        self.with_frame(key, |frame| frame.af_state = state)
    }

    /// Mark the frame complete.
    pub fn set_complete(&self, key: FrameKey) -> CaptureResult<()> {
        self.with_frame(key, |frame| frame.complete = true)
    }

    /// Lock the frame and take the holder's reference.
    pub fn lock(&self, key: FrameKey) -> CaptureResult<()> {
        self.with_frame(key, |frame| {
            if frame.locked {
                warn!(%key, "frame locked twice");
            }
            frame.locked = true;
            frame.ref_count += 1;
        })
    }

    /// Unlock the frame and drop the holder's reference.
    pub fn unlock(&self, key: FrameKey) -> CaptureResult<()> {
        self.with_frame(key, |frame| {
            frame.locked = false;
            frame.ref_count = frame.ref_count.saturating_sub(1);
        })
    }

    /// Take an additional reference.
    pub fn add_ref(&self, key: FrameKey) -> CaptureResult<u32> {
        self.with_frame(key, |frame| {
            frame.ref_count += 1;
            frame.ref_count
        })
    }

    /// Drop a reference.
    pub fn release_ref(&self, key: FrameKey) -> CaptureResult<u32> {
        self.with_frame(key, |frame| {
            if frame.ref_count == 0 {
                warn!(%key, "reference released on unreferenced frame");
            }
            frame.ref_count = frame.ref_count.saturating_sub(1);
            frame.ref_count
        })
    }

    /// Remove the frame if it is complete, unlocked and unreferenced.
    ///
    /// Returns whether the frame was destroyed.
    pub fn try_destroy(&self, key: FrameKey) -> bool {
        let mut frames = self.frames.lock();
        match frames.get(&key) {
            Some(frame) if frame.is_destroyable() => {
                frames.remove(&key);
                self.destroyed.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "frame destroyed");
                true
            }
            Some(frame) => {
                trace!(
                    %key,
                    complete = frame.complete,
                    locked = frame.locked,
                    ref_count = frame.ref_count,
                    "frame kept alive"
                );
                false
            }
            None => false,
        }
    }

    /// Drop the caller's reference and destroy the frame if possible.
    pub fn release(&self, key: FrameKey) -> CaptureResult<bool> {
        self.release_ref(key)?;
        Ok(self.try_destroy(key))
    }

    /// Snapshot of a frame.
    #[must_use]
    pub fn get(&self, key: FrameKey) -> Option<Frame> {
        self.frames.lock().get(&key).cloned()
    }

    /// Capture sequence number of a frame.
    #[must_use]
    pub fn frame_count(&self, key: FrameKey) -> Option<u32> {
        self.frames.lock().get(&key).map(|f| f.frame_count)
    }

    /// Capture timestamp of a frame in nanoseconds.
    #[must_use]
    pub fn timestamp_ns(&self, key: FrameKey) -> Option<u64> {
        self.frames.lock().get(&key).map(|f| f.timestamp_ns)
    }

    /// Autofocus snapshot of a frame.
    #[must_use]
    pub fn af_state(&self, key: FrameKey) -> Option<AfState> {
        self.frames.lock().get(&key).map(|f| f.af_state)
    }

    /// Pool slot index of the buffer matching `target`.
    #[must_use]
    pub fn buffer_index(&self, key: FrameKey, target: BufferTarget) -> Option<usize> {
        self.frames
            .lock()
            .get(&key)
            .and_then(|f| f.buffers.iter().find(|b| target.matches(b)))
            .map(|b| b.index)
    }

    /// Whether the frame is still alive.
    #[must_use]
    pub fn contains(&self, key: FrameKey) -> bool {
        self.frames.lock().contains_key(&key)
    }

    /// Live frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// True when no frame is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Frames destroyed so far.
    #[must_use]
    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }
}
