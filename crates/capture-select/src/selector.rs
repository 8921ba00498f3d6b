//! Per-stream frame hold lists and selection policies.
//!
//! # Design
//!
//! A [`FrameHoldingSelector`] keeps two FIFO hold lists of locked frames:
//! the normal list, bounded by `hold_capacity`, and an HDR list that only
//! admits the frames of the current HDR bracket. A frame moves through
//!
//! ```text
//! ARRIVED -> HELD (locked, queued) -> SELECTED (unlocked, referenced by caller)
//!                                  -> EVICTED  (unlocked, buffer released, destroyed if free)
//! ```
//!
//! Selection policies pop from the normal list and evict frames that fail
//! their gate (focus still converging, flash not yet at full output, flash
//! still firing, sequence number too low). A gated policy that runs out of
//! budget yields [`Selection::NotFound`]; [`FrameHoldingSelector::select_frames`]
//! then falls back to plain FIFO selection.
//!
//! When a [`DualStreamSynchronizer`] is attached, normal holds and
//! `select_frames` go through it instead of the local list.

use crate::activity::{CaptureActivity, NoActivity};
use crate::dual::DualStreamSynchronizer;
use crate::frame::{BufferTarget, FrameArena, FrameKey};
use crate::hold_list::{BlockingBoundedQueue, PopOutcome};
use capture_core::{CaptureError, CaptureResult, StreamId};
use capture_pool::{BufferPool, BufferPosition};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Frames held in the HDR list per bracket.
const HDR_BRACKET_LEN: u32 = 3;

/// Selector tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Frames kept in the normal hold list.
    pub hold_capacity: usize,
    /// Wait per hold-list pop.
    pub wait_time_ms: u64,
    /// Pops allowed to the focus and frame-count gates.
    pub focus_attempts: u32,
    /// Pause after evicting a frame that failed a polling gate.
    pub poll_interval_ms: u64,
    /// Extra pops allowed to the flash gate beyond the hold capacity.
    pub flash_timeout_count: u32,
    /// Wall-clock budget of the burst gate.
    pub burst_budget_ms: u64,
    /// Frames between the HDR drop count and the first bracket frame.
    pub hdr_delay: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            hold_capacity: 1,
            wait_time_ms: 2000,
            focus_attempts: 15,
            poll_interval_ms: 30,
            flash_timeout_count: 10,
            burst_budget_ms: 3000,
            hdr_delay: 1,
        }
    }
}

impl SelectorConfig {
    /// Check limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.hold_capacity == 0 {
            return Err("selector.hold_capacity must be at least 1".to_string());
        }
        if self.wait_time_ms == 0 {
            return Err("selector.wait_time_ms must be positive".to_string());
        }
        if self.focus_attempts == 0 {
            return Err("selector.focus_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Which hold list an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    /// Capacity-bounded list used by every policy except HDR.
    Normal,
    /// Bracket list used by HDR capture.
    Hdr,
}

/// Rule used to pick the delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Oldest held frame.
    Normal,
    /// Skip frames whose autofocus is still converging.
    FocusGated,
    /// Skip frames captured before the main flash reached full output.
    FlashGated,
    /// Skip frames captured while the flash is still firing.
    BurstGated,
    /// Skip frames numbered below `min_frame_count`.
    FrameCountGated {
        /// Lowest acceptable capture sequence number.
        min_frame_count: u32,
    },
    /// Oldest frame of the HDR list.
    Hdr,
}

impl SelectionPolicy {
    /// Whether the policy filters frames and may come up empty.
    #[must_use]
    pub fn is_gated(self) -> bool {
        matches!(
            self,
            SelectionPolicy::FocusGated
                | SelectionPolicy::FlashGated
                | SelectionPolicy::BurstGated
                | SelectionPolicy::FrameCountGated { .. }
        )
    }
}

/// Outcome of a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// A frame was delivered. The caller holds one reference to it.
    Selected(FrameKey),
    /// Every wait elapsed with nothing to deliver.
    TimedOut,
    /// The selector was canceled.
    Canceled,
    /// A gated policy exhausted its budget without a matching frame.
    NotFound,
}

impl Selection {
    /// Delivered frame, if any.
    #[must_use]
    pub fn frame(self) -> Option<FrameKey> {
        match self {
            Selection::Selected(key) => Some(key),
            _ => None,
        }
    }

    /// Convert a timeout into [`CaptureError::SelectionTimedOut`], for callers
    /// that treat exhausting the budget as a failure.
    pub fn into_frame(self, attempts: u32) -> CaptureResult<Option<FrameKey>> {
        match self {
            Selection::Selected(key) => Ok(Some(key)),
            Selection::TimedOut => Err(CaptureError::SelectionTimedOut { attempts }),
            Selection::Canceled | Selection::NotFound => Ok(None),
        }
    }
}

/// Capture intent used to choose a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    /// The capture fires the main flash.
    pub flash_required: bool,
    /// HDR bracket capture.
    pub hdr: bool,
    /// Snapshot taken during video recording.
    pub recording: bool,
    /// Multi-shot capture.
    pub burst: bool,
    /// Long exposure capture.
    pub long_exposure: bool,
    /// Bounded waits per pop.
    pub try_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct HeldFrame {
    key: FrameKey,
    target: BufferTarget,
}

/// Hold lists and selection policies for one capture stream.
pub struct FrameHoldingSelector {
    stream: StreamId,
    arena: Arc<FrameArena>,
    pool: Option<BufferPool>,
    activity: Arc<dyn CaptureActivity>,
    normal: BlockingBoundedQueue<HeldFrame>,
    hdr: BlockingBoundedQueue<HeldFrame>,
    hold_capacity: AtomicUsize,
    config: SelectorConfig,
    first_frame: AtomicBool,
    evicted: AtomicU64,
    dual: Option<Arc<DualStreamSynchronizer>>,
    // Serializes evict-then-push so concurrent producers cannot overshoot capacity.
    insert: Mutex<()>,
}

impl std::fmt::Debug for FrameHoldingSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHoldingSelector")
            .field("stream", &self.stream)
            .field("hold_capacity", &self.hold_capacity())
            .field("normal", &self.normal.len())
            .field("hdr", &self.hdr.len())
            .field("dual", &self.dual.is_some())
            .finish_non_exhaustive()
    }
}

impl FrameHoldingSelector {
    /// Selector for `stream` with no buffer pool and no capture activity.
    #[must_use]
    pub fn new(stream: StreamId, arena: Arc<FrameArena>, config: SelectorConfig) -> Self {
        let wait = Duration::from_millis(config.wait_time_ms);
        Self {
            stream,
            arena,
            pool: None,
            activity: Arc::new(NoActivity),
            normal: BlockingBoundedQueue::new(wait),
            hdr: BlockingBoundedQueue::new(wait),
            hold_capacity: AtomicUsize::new(config.hold_capacity.max(1)),
            config,
            first_frame: AtomicBool::new(true),
            evicted: AtomicU64::new(0),
            dual: None,
            insert: Mutex::new(()),
        }
    }

    /// Pool that evicted buffers are returned to.
    #[must_use]
    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Flash and HDR state consulted by the gated policies.
    #[must_use]
    pub fn with_activity(mut self, activity: Arc<dyn CaptureActivity>) -> Self {
        self.activity = activity;
        self
    }

    /// Route normal traffic through `dual`, registering this stream with it.
    ///
    /// Requires a pool, since the synchronizer releases buffers on its own.
    pub fn with_synchronizer(mut self, dual: Arc<DualStreamSynchronizer>) -> CaptureResult<Self> {
        let pool = self.require_pool()?.clone();
        dual.register_stream(self.stream, self.hold_capacity(), pool)?;
        self.dual = Some(dual);
        Ok(self)
    }

    /// Stream this selector serves.
    #[must_use]
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Current normal-list capacity.
    #[must_use]
    pub fn hold_capacity(&self) -> usize {
        self.hold_capacity.load(Ordering::Acquire)
    }

    /// Frames currently held in `kind`.
    #[must_use]
    pub fn held_count(&self, kind: ListKind) -> usize {
        self.list(kind).len()
    }

    /// Whether a consumer is blocked on `kind`.
    #[must_use]
    pub fn is_waiting(&self, kind: ListKind) -> bool {
        self.list(kind).is_waiting()
    }

    /// Whether the selector is canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.normal.is_canceled()
    }

    /// Frames evicted so far.
    #[must_use]
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Whether a synchronizer is attached.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.dual.is_some()
    }

    /// Change the normal-list capacity. Takes effect on the next hold.
    pub fn set_hold_capacity(&self, capacity: usize) -> CaptureResult<()> {
        if capacity == 0 {
            return Err(CaptureError::InvalidArgument(
                "hold capacity must be at least 1".into(),
            ));
        }
        if let Some(dual) = &self.dual {
            dual.set_hold_capacity(self.stream, capacity)?;
        }
        self.hold_capacity.store(capacity, Ordering::Release);
        debug!(stream = %self.stream, capacity, "hold capacity changed");
        Ok(())
    }

    /// Change the wait used by every later pop.
    pub fn set_wait_time(&self, wait: Duration) {
        self.normal.set_wait_time(wait);
        self.hdr.set_wait_time(wait);
    }

    /// Mark the start of a capture sequence; the next burst selection is focus-gated.
    pub fn begin_sequence(&self) {
        self.first_frame.store(true, Ordering::Release);
    }

    /// Hold a completed frame.
    ///
    /// Normal holds evict the oldest frame first when the list is full. HDR
    /// holds admit only the current bracket and release every other frame
    /// immediately.
    pub fn hold_frame(&self, key: FrameKey, kind: ListKind, target: BufferTarget) -> CaptureResult<()> {
        self.require_pool()?;
        let held = HeldFrame { key, target };
        match kind {
            ListKind::Normal => match &self.dual {
                Some(dual) => dual.hold_frame(self.stream, key, target).map(|_| ()),
                None => self.hold_normal(held),
            },
            ListKind::Hdr => self.hold_hdr(held),
        }
    }

    fn hold_normal(&self, held: HeldFrame) -> CaptureResult<()> {
        let _insert = self.insert.lock();
        let capacity = self.hold_capacity();
        while self.normal.len() >= capacity {
            match self.normal.try_pop() {
                Some(oldest) => {
                    debug!(stream = %self.stream, key = %oldest.key, capacity, "hold list full, evicting oldest");
                    self.evict(oldest);
                }
                None => break,
            }
        }
        self.push(&self.normal, held)
    }

    fn hold_hdr(&self, held: HeldFrame) -> CaptureResult<()> {
        let frame_count = self
            .arena
            .frame_count(held.key)
            .ok_or_else(|| CaptureError::InvalidArgument(format!("unknown {}", held.key)))?;
        let base = self
            .activity
            .hdr_drop_count()
            .saturating_add(self.config.hdr_delay);
        let in_bracket = frame_count > base && frame_count <= base.saturating_add(HDR_BRACKET_LEN);
        if !in_bracket {
            trace!(stream = %self.stream, key = %held.key, frame_count, base, "frame outside HDR bracket, releasing");
            self.release_buffer(held);
            self.arena.try_destroy(held.key);
            return Ok(());
        }
        debug!(stream = %self.stream, key = %held.key, frame_count, "HDR bracket frame held");
        self.push(&self.hdr, held)
    }

    fn push(&self, list: &BlockingBoundedQueue<HeldFrame>, held: HeldFrame) -> CaptureResult<()> {
        self.arena.lock(held.key)?;
        if let Err(rejected) = list.push(held) {
            warn!(stream = %self.stream, key = %rejected.key, "hold list rejected frame");
            self.evict(rejected);
        }
        Ok(())
    }

    /// Pop a frame using `policy`, with up to `try_count` bounded waits per pop.
    pub fn select_frame(&self, policy: SelectionPolicy, try_count: u32) -> CaptureResult<Selection> {
        self.require_pool()?;
        let selection = match policy {
            SelectionPolicy::Normal => self.settle(self.pop(&self.normal, try_count)),
            SelectionPolicy::Hdr => self.settle(self.pop(&self.hdr, try_count)),
            SelectionPolicy::FocusGated => self.select_focused(try_count),
            SelectionPolicy::FlashGated => self.select_flash(try_count),
            SelectionPolicy::BurstGated => self.select_burst(try_count),
            SelectionPolicy::FrameCountGated { min_frame_count } => {
                self.select_min_frame_count(min_frame_count, try_count)
            }
        }?;
        trace!(stream = %self.stream, ?policy, ?selection, "selection finished");
        Ok(selection)
    }

    /// Pick the policy for `request`, select, and fall back to FIFO selection
    /// when a gated or HDR policy yields nothing.
    pub fn select_frames(&self, request: CaptureRequest) -> CaptureResult<Selection> {
        self.require_pool()?;
        if let Some(dual) = &self.dual {
            let selection = dual.select_frames(self.stream, request.try_count)?;
            self.first_frame.store(false, Ordering::Release);
            return Ok(selection);
        }

        let policy = Self::policy_for(&request);
        let mut selection = self.select_frame(policy, request.try_count)?;
        let falls_back = policy.is_gated() || policy == SelectionPolicy::Hdr;
        if falls_back && matches!(selection, Selection::NotFound | Selection::TimedOut) {
            info!(stream = %self.stream, ?policy, ?selection, "gated selection failed, falling back to normal");
            selection = self.select_frame(SelectionPolicy::Normal, request.try_count)?;
        }
        self.first_frame.store(false, Ordering::Release);
        Ok(selection)
    }

    /// Policy used by [`select_frames`](Self::select_frames) for `request`.
    #[must_use]
    pub fn policy_for(request: &CaptureRequest) -> SelectionPolicy {
        if request.flash_required && !request.burst {
            SelectionPolicy::FlashGated
        } else if request.hdr {
            SelectionPolicy::Hdr
        } else if request.recording {
            SelectionPolicy::Normal
        } else if request.burst {
            SelectionPolicy::BurstGated
        } else if request.long_exposure {
            SelectionPolicy::Normal
        } else {
            SelectionPolicy::FocusGated
        }
    }

    /// Run [`select_frame`](Self::select_frame) on tokio's blocking pool.
    pub async fn select_frame_async(
        self: Arc<Self>,
        policy: SelectionPolicy,
        try_count: u32,
    ) -> CaptureResult<Selection> {
        tokio::task::spawn_blocking(move || self.select_frame(policy, try_count))
            .await
            .map_err(|e| CaptureError::InvalidOperation(format!("selection task failed: {e}")))?
    }

    fn select_focused(&self, try_count: u32) -> CaptureResult<Selection> {
        for attempt in 0..self.config.focus_attempts {
            let held = match self.pop(&self.normal, try_count) {
                PopOutcome::Item(held) => held,
                other => return self.settle(other),
            };
            let af_state = self.arena.af_state(held.key).unwrap_or_default();
            if !af_state.is_converging() {
                return self.deliver(held);
            }
            debug!(stream = %self.stream, key = %held.key, attempt, ?af_state, "focus converging, skipping frame");
            self.evict(held);
            thread::sleep(self.config.poll_interval());
        }
        warn!(stream = %self.stream, attempts = self.config.focus_attempts, "no focused frame found");
        Ok(Selection::NotFound)
    }

    fn select_flash(&self, try_count: u32) -> CaptureResult<Selection> {
        let Some(flash_frame) = self.activity.start_main_flash() else {
            warn!(stream = %self.stream, "main flash target unavailable, pre-flash did not run");
            return Ok(Selection::NotFound);
        };
        let target = flash_frame.saturating_add(1);
        let selection = self.flash_gate(target, try_count);
        self.activity.stop_main_flash();
        selection
    }

    fn flash_gate(&self, target: u32, try_count: u32) -> CaptureResult<Selection> {
        let limit = self.config.flash_timeout_count as usize + self.hold_capacity();
        for attempt in 0..limit {
            let held = match self.pop(&self.normal, try_count) {
                PopOutcome::Item(held) => held,
                PopOutcome::Canceled => return Ok(Selection::Canceled),
                PopOutcome::TimedOut => {
                    debug!(stream = %self.stream, attempt, target, "waiting for flash frame");
                    continue;
                }
            };
            let frame_count = self.arena.frame_count(held.key).unwrap_or(0);
            if frame_count >= target {
                debug!(stream = %self.stream, key = %held.key, frame_count, target, "flash frame selected");
                return self.deliver(held);
            }
            trace!(stream = %self.stream, key = %held.key, frame_count, target, "frame before main flash, skipping");
            self.evict(held);
        }
        warn!(stream = %self.stream, target, limit, "no frame captured under main flash");
        Ok(Selection::NotFound)
    }

    fn select_burst(&self, try_count: u32) -> CaptureResult<Selection> {
        if self.first_frame.load(Ordering::Acquire) {
            let selection = self.select_focused(try_count)?;
            if matches!(selection, Selection::Selected(_) | Selection::Canceled) {
                return Ok(selection);
            }
        }

        let poll = self.config.poll_interval_ms.max(1);
        let iterations = (self.config.burst_budget_ms / poll).max(1);
        for _ in 0..iterations {
            let held = match self.pop(&self.normal, try_count) {
                PopOutcome::Item(held) => held,
                other => return self.settle(other),
            };
            if !self.activity.flash_firing() {
                return self.deliver(held);
            }
            debug!(stream = %self.stream, key = %held.key, "flash still firing, skipping frame");
            self.evict(held);
            thread::sleep(self.config.poll_interval());
        }
        warn!(stream = %self.stream, budget_ms = self.config.burst_budget_ms, "flash kept firing through burst budget");
        Ok(Selection::NotFound)
    }

    fn select_min_frame_count(&self, min_frame_count: u32, try_count: u32) -> CaptureResult<Selection> {
        for _ in 0..self.config.focus_attempts {
            let held = match self.pop(&self.normal, try_count) {
                PopOutcome::Item(held) => held,
                other => return self.settle(other),
            };
            let frame_count = self.arena.frame_count(held.key).unwrap_or(0);
            if frame_count >= min_frame_count {
                return self.deliver(held);
            }
            trace!(stream = %self.stream, key = %held.key, frame_count, min_frame_count, "frame too old, skipping");
            self.evict(held);
        }
        Ok(Selection::NotFound)
    }

    /// Drain `kind`, releasing every held frame. Returns how many were released.
    ///
    /// Refused, with nothing released, while a consumer is waiting on the list.
    pub fn clear(&self, kind: ListKind) -> CaptureResult<usize> {
        let list = self.list(kind);
        if list.is_waiting() {
            error!(stream = %self.stream, ?kind, "clear refused while a consumer is waiting");
            return Ok(0);
        }
        let released = self.drain(list);
        list.reset_cancel();
        if kind == ListKind::Normal {
            if let Some(dual) = &self.dual {
                dual.clear(self.stream);
            }
        }
        debug!(stream = %self.stream, ?kind, released, "hold list cleared");
        Ok(released)
    }

    /// Wake every blocked selection; each returns [`Selection::Canceled`].
    ///
    /// Held frames stay queued until [`clear`](Self::clear) or [`release`](Self::release).
    pub fn cancel(&self) {
        self.normal.wake_all();
        self.hdr.wake_all();
        if let Some(dual) = &self.dual {
            dual.wake_all();
        }
        debug!(stream = %self.stream, "selector canceled");
    }

    /// Clear the cancellation flag.
    pub fn reset_cancel(&self) {
        self.normal.reset_cancel();
        self.hdr.reset_cancel();
        if let Some(dual) = &self.dual {
            dual.reset_cancel();
        }
    }

    /// Release every held frame regardless of waiters and reset cancellation.
    pub fn release(&self) -> usize {
        let released = self.drain(&self.normal) + self.drain(&self.hdr);
        let released = released + self.dual.as_ref().map_or(0, |d| d.clear(self.stream));
        self.reset_cancel();
        info!(stream = %self.stream, released, "selector released");
        released
    }

    fn list(&self, kind: ListKind) -> &BlockingBoundedQueue<HeldFrame> {
        match kind {
            ListKind::Normal => &self.normal,
            ListKind::Hdr => &self.hdr,
        }
    }

    fn require_pool(&self) -> CaptureResult<&BufferPool> {
        self.pool.as_ref().ok_or_else(|| {
            error!(stream = %self.stream, "selector has no buffer pool");
            CaptureError::InvalidOperation(format!("{} has no buffer pool", self.stream))
        })
    }

    fn pop(&self, list: &BlockingBoundedQueue<HeldFrame>, try_count: u32) -> PopOutcome<HeldFrame> {
        let tries = try_count.max(1);
        for attempt in 1..=tries {
            match list.wait_and_pop() {
                PopOutcome::Item(held) if list.is_canceled() => {
                    self.evict(held);
                    return PopOutcome::Canceled;
                }
                PopOutcome::TimedOut => {
                    trace!(stream = %self.stream, attempt, tries, "hold list wait timed out");
                }
                outcome => return outcome,
            }
        }
        PopOutcome::TimedOut
    }

    fn settle(&self, outcome: PopOutcome<HeldFrame>) -> CaptureResult<Selection> {
        match outcome {
            PopOutcome::Item(held) => self.deliver(held),
            PopOutcome::TimedOut => Ok(Selection::TimedOut),
            PopOutcome::Canceled => Ok(Selection::Canceled),
        }
    }

    fn deliver(&self, held: HeldFrame) -> CaptureResult<Selection> {
        self.arena.add_ref(held.key)?;
        self.arena.unlock(held.key)?;
        debug!(stream = %self.stream, key = %held.key, "frame selected");
        Ok(Selection::Selected(held.key))
    }

    fn drain(&self, list: &BlockingBoundedQueue<HeldFrame>) -> usize {
        let drained = list.drain();
        let released = drained.len();
        for held in drained {
            self.evict(held);
        }
        released
    }

    fn evict(&self, held: HeldFrame) {
        self.release_buffer(held);
        if let Err(e) = self.arena.unlock(held.key) {
            warn!(stream = %self.stream, key = %held.key, error = %e, "unlock failed");
        }
        self.arena.try_destroy(held.key);
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    fn release_buffer(&self, held: HeldFrame) {
        let Some(pool) = &self.pool else { return };
        match self.arena.buffer_index(held.key, held.target) {
            Some(index) => {
                if let Err(e) = pool.release(index, BufferPosition::None) {
                    warn!(stream = %self.stream, key = %held.key, index, error = %e, "buffer release failed");
                }
            }
            None => warn!(stream = %self.stream, key = %held.key, "held frame has no buffer for its target"),
        }
    }
}

impl Drop for FrameHoldingSelector {
    fn drop(&mut self) {
        let released = self.drain(&self.normal) + self.drain(&self.hdr);
        if released > 0 {
            debug!(stream = %self.stream, released, "held frames released on drop");
        }
        if let Some(dual) = &self.dual {
            if dual.is_registered(self.stream) {
                if let Err(e) = dual.unregister_stream(self.stream) {
                    warn!(stream = %self.stream, error = %e, "unregister on drop failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ManualActivity;
    use crate::dual::SyncConfig;
    use crate::frame::{AfState, BufferRef, BufferRole};
    use capture_pool::{AllocMode, BufferPermission, PlaneLayout, PoolConfig, SystemHeap};
    use std::time::Instant;
    use tracing_test::traced_test;

    const TARGET: BufferTarget = BufferTarget::destination(0, None);
    const STREAM: StreamId = StreamId(0);

    fn quick(hold_capacity: usize) -> SelectorConfig {
        SelectorConfig {
            hold_capacity,
            wait_time_ms: 20,
            focus_attempts: 5,
            poll_interval_ms: 1,
            flash_timeout_count: 2,
            burst_budget_ms: 10,
            hdr_delay: 1,
        }
    }

    fn pool(count: usize) -> BufferPool {
        let pool = BufferPool::new("preview", Arc::new(SystemHeap::non_cached()));
        pool.configure(PoolConfig::new(
            vec![PlaneLayout {
                size: 256,
                stride: 16,
            }],
            count,
            count,
            AllocMode::AllAtOnce,
        ))
        .unwrap();
        pool.allocate().unwrap();
        pool
    }

    struct Fixture {
        arena: Arc<FrameArena>,
        pool: BufferPool,
        activity: Arc<ManualActivity>,
        selector: FrameHoldingSelector,
    }

    fn fixture(config: SelectorConfig) -> Fixture {
        let arena = Arc::new(FrameArena::new());
        let pool = pool(16);
        let activity = Arc::new(ManualActivity::new());
        let selector = FrameHoldingSelector::new(STREAM, Arc::clone(&arena), config)
            .with_pool(pool.clone())
            .with_activity(activity.clone());
        Fixture {
            arena,
            pool,
            activity,
            selector,
        }
    }

    impl Fixture {
        fn frame(&self, frame_count: u32, af_state: AfState) -> (FrameKey, usize) {
            let slot = self.pool.acquire(None).unwrap();
            let key = self
                .arena
                .create(frame_count, u64::from(frame_count) * 33_000_000);
            self.arena
                .attach_buffer(
                    key,
                    BufferRef {
                        pipe_id: 0,
                        role: BufferRole::Destination { position: None },
                        index: slot.index,
                    },
                )
                .unwrap();
            self.arena.set_af_state(key, af_state).unwrap();
            self.arena.set_complete(key).unwrap();
            (key, slot.index)
        }

        fn hold(&self, frame_count: u32) -> (FrameKey, usize) {
            let (key, index) = self.frame(frame_count, AfState::Focused);
            self.selector.hold_frame(key, ListKind::Normal, TARGET).unwrap();
            (key, index)
        }

        fn is_released(&self, index: usize) -> bool {
            self.pool.status(index).map(|s| s.permission) == Some(BufferPermission::Available)
        }
    }

    #[test]
    fn test_capacity_one_evicts_oldest_before_insert() {
        let f = fixture(quick(1));
        let (a, a_index) = f.hold(1);
        let (b, _) = f.hold(2);

        assert!(!f.arena.contains(a));
        assert!(f.is_released(a_index));
        assert_eq!(f.selector.held_count(ListKind::Normal), 1);
        assert_eq!(
            f.selector.select_frame(SelectionPolicy::Normal, 1).unwrap(),
            Selection::Selected(b)
        );
    }

    #[test]
    fn test_each_evicted_buffer_released_once() {
        let f = fixture(quick(3));
        let releases_before = f.pool.total_releases();
        for fc in 0..7 {
            f.hold(fc);
        }
        assert_eq!(f.selector.held_count(ListKind::Normal), 3);
        assert_eq!(f.selector.evicted_count(), 4);
        assert_eq!(f.pool.total_releases() - releases_before, 4);
        assert_eq!(f.pool.in_process_count(), 3);
    }

    #[test]
    fn test_selected_frame_is_unlocked_and_referenced() {
        let f = fixture(quick(2));
        let (a, _) = f.hold(1);
        assert!(f.arena.get(a).unwrap().locked);

        let selection = f.selector.select_frame(SelectionPolicy::Normal, 1).unwrap();
        assert_eq!(selection.frame(), Some(a));
        let frame = f.arena.get(a).unwrap();
        assert!(!frame.locked);
        assert_eq!(frame.ref_count, 1);
        assert!(f.arena.release(a).unwrap());
    }

    #[test]
    fn test_empty_list_times_out() {
        let f = fixture(quick(1));
        let started = Instant::now();
        let selection = f.selector.select_frame(SelectionPolicy::Normal, 2).unwrap();
        assert_eq!(selection, Selection::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(matches!(
            selection.into_frame(2),
            Err(CaptureError::SelectionTimedOut { attempts: 2 })
        ));
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_selection() {
        let config = SelectorConfig {
            wait_time_ms: 10_000,
            ..quick(1)
        };
        let f = fixture(config);
        let selector = Arc::new(f.selector);
        let waiter = tokio::spawn(Arc::clone(&selector).select_frame_async(SelectionPolicy::Normal, 3));

        while !selector.is_waiting(ListKind::Normal) {
            tokio::task::yield_now().await;
        }
        let started = Instant::now();
        selector.cancel();
        let selection = waiter.await.unwrap().unwrap();
        assert_eq!(selection, Selection::Canceled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_clear_refused_while_waiting() {
        let config = SelectorConfig {
            wait_time_ms: 10_000,
            ..quick(2)
        };
        let f = fixture(config);
        let selector = Arc::new(f.selector);
        let waiter = {
            let selector = Arc::clone(&selector);
            thread::spawn(move || selector.select_frame(SelectionPolicy::Hdr, 1))
        };
        while !selector.is_waiting(ListKind::Hdr) {
            thread::yield_now();
        }

        assert_eq!(selector.clear(ListKind::Hdr).unwrap(), 0);

        selector.cancel();
        assert_eq!(waiter.join().unwrap().unwrap(), Selection::Canceled);
        assert_eq!(selector.clear(ListKind::Hdr).unwrap(), 0);
        selector.reset_cancel();
        assert!(!selector.is_canceled());
    }

    #[test]
    fn test_clear_releases_held_frames() {
        let f = fixture(quick(3));
        let (a, a_index) = f.hold(1);
        let (b, b_index) = f.hold(2);
        assert_eq!(f.selector.clear(ListKind::Normal).unwrap(), 2);
        assert!(!f.arena.contains(a));
        assert!(!f.arena.contains(b));
        assert!(f.is_released(a_index));
        assert!(f.is_released(b_index));
    }

    #[test]
    fn test_hdr_list_holds_only_bracket() {
        let f = fixture(quick(1));
        f.activity.set_hdr_drop_count(5);

        let mut keys = Vec::new();
        for fc in 6..=10 {
            let (key, index) = f.frame(fc, AfState::Focused);
            f.selector.hold_frame(key, ListKind::Hdr, TARGET).unwrap();
            keys.push((fc, key, index));
        }

        assert_eq!(f.selector.held_count(ListKind::Hdr), 3);
        for (fc, key, index) in keys {
            let held = (7..=9).contains(&fc);
            assert_eq!(f.arena.contains(key), held, "frame {fc}");
            assert_eq!(f.is_released(index), !held, "frame {fc}");
        }
        let first = f.selector.select_frame(SelectionPolicy::Hdr, 1).unwrap();
        assert_eq!(first.frame().and_then(|k| f.arena.frame_count(k)), Some(7));
    }

    #[test]
    fn test_focus_gate_skips_converging_frames() {
        let f = fixture(quick(3));
        for (fc, af) in [(1, AfState::Scanning), (2, AfState::Scanning), (3, AfState::Focused)] {
            let (key, _) = f.frame(fc, af);
            f.selector.hold_frame(key, ListKind::Normal, TARGET).unwrap();
        }
        let selection = f.selector.select_frame(SelectionPolicy::FocusGated, 1).unwrap();
        assert_eq!(selection.frame().and_then(|k| f.arena.frame_count(k)), Some(3));
        assert_eq!(f.selector.evicted_count(), 2);
    }

    #[test]
    fn test_focus_gate_reports_not_found() {
        let f = fixture(quick(8));
        for fc in 0..6 {
            let (key, _) = f.frame(fc, AfState::Scanning);
            f.selector.hold_frame(key, ListKind::Normal, TARGET).unwrap();
        }
        assert_eq!(
            f.selector.select_frame(SelectionPolicy::FocusGated, 1).unwrap(),
            Selection::NotFound
        );
        assert_eq!(f.selector.held_count(ListKind::Normal), 1);
    }

    #[test]
    fn test_flash_gate_waits_for_full_output() {
        let f = fixture(quick(4));
        f.activity.set_flash_frame(Some(10));
        for fc in 9..=12 {
            f.hold(fc);
        }
        let selection = f.selector.select_frame(SelectionPolicy::FlashGated, 1).unwrap();
        assert_eq!(selection.frame().and_then(|k| f.arena.frame_count(k)), Some(11));
        assert!(!f.activity.main_flash_running());
        assert_eq!(f.selector.held_count(ListKind::Normal), 1);
    }

    #[test]
    #[traced_test]
    fn test_flash_without_preflash_falls_back_to_normal() {
        let f = fixture(quick(2));
        let (a, _) = f.hold(1);
        let request = CaptureRequest {
            flash_required: true,
            try_count: 1,
            ..CaptureRequest::default()
        };
        assert_eq!(f.selector.select_frames(request).unwrap(), Selection::Selected(a));
        assert!(logs_contain("main flash target unavailable"));
        assert!(logs_contain("falling back to normal"));
    }

    #[test]
    fn test_hdr_request_without_bracket_falls_back_to_normal() {
        let f = fixture(quick(2));
        let (a, _) = f.hold(1);
        assert_eq!(f.selector.held_count(ListKind::Hdr), 0);
        let request = CaptureRequest {
            hdr: true,
            try_count: 1,
            ..CaptureRequest::default()
        };
        assert_eq!(f.selector.select_frames(request).unwrap(), Selection::Selected(a));
        assert_eq!(f.selector.held_count(ListKind::Normal), 0);
    }

    #[test]
    fn test_burst_skips_frames_while_flash_fires() {
        let f = fixture(quick(2));
        let (first, _) = f.hold(1);
        let long_exposure = CaptureRequest {
            long_exposure: true,
            try_count: 1,
            ..CaptureRequest::default()
        };
        assert_eq!(f.selector.select_frames(long_exposure).unwrap(), Selection::Selected(first));

        f.activity.set_flash_firing(true);
        let (skipped, index) = f.hold(2);
        assert_eq!(
            f.selector.select_frame(SelectionPolicy::BurstGated, 1).unwrap(),
            Selection::TimedOut
        );
        assert!(!f.arena.contains(skipped));
        assert!(f.is_released(index));
    }

    #[test]
    fn test_first_burst_frame_is_focus_gated() {
        let f = fixture(quick(3));
        for (fc, af) in [(1, AfState::Scanning), (2, AfState::Focused)] {
            let (key, _) = f.frame(fc, af);
            f.selector.hold_frame(key, ListKind::Normal, TARGET).unwrap();
        }
        let selection = f.selector.select_frame(SelectionPolicy::BurstGated, 1).unwrap();
        assert_eq!(selection.frame().and_then(|k| f.arena.frame_count(k)), Some(2));
    }

    #[test]
    fn test_frame_count_gate() {
        let f = fixture(quick(4));
        for fc in [3, 4, 8] {
            f.hold(fc);
        }
        let selection = f
            .selector
            .select_frame(SelectionPolicy::FrameCountGated { min_frame_count: 5 }, 1)
            .unwrap();
        assert_eq!(selection.frame().and_then(|k| f.arena.frame_count(k)), Some(8));
    }

    #[test]
    fn test_policy_dispatch() {
        let base = CaptureRequest::default();
        let pick = |r: CaptureRequest| FrameHoldingSelector::policy_for(&r);
        assert_eq!(pick(CaptureRequest { flash_required: true, ..base }), SelectionPolicy::FlashGated);
        assert_eq!(
            pick(CaptureRequest { flash_required: true, burst: true, ..base }),
            SelectionPolicy::BurstGated
        );
        assert_eq!(pick(CaptureRequest { hdr: true, ..base }), SelectionPolicy::Hdr);
        assert_eq!(pick(CaptureRequest { recording: true, burst: true, ..base }), SelectionPolicy::Normal);
        assert_eq!(pick(CaptureRequest { long_exposure: true, ..base }), SelectionPolicy::Normal);
        assert_eq!(pick(base), SelectionPolicy::FocusGated);
    }

    #[test]
    fn test_missing_pool_is_invalid_operation() {
        let arena = Arc::new(FrameArena::new());
        let selector = FrameHoldingSelector::new(STREAM, Arc::clone(&arena), quick(1));
        let key = arena.create(1, 0);
        assert!(matches!(
            selector.hold_frame(key, ListKind::Normal, TARGET),
            Err(CaptureError::InvalidOperation(_))
        ));
        assert!(matches!(
            selector.select_frame(SelectionPolicy::Normal, 1),
            Err(CaptureError::InvalidOperation(_))
        ));
        let dual = Arc::new(DualStreamSynchronizer::new(arena, SyncConfig::default()));
        assert!(selector.with_synchronizer(dual).is_err());
    }

    #[test]
    fn test_set_hold_capacity() {
        let f = fixture(quick(1));
        assert!(matches!(
            f.selector.set_hold_capacity(0),
            Err(CaptureError::InvalidArgument(_))
        ));
        f.selector.set_hold_capacity(2).unwrap();
        f.hold(1);
        f.hold(2);
        assert_eq!(f.selector.held_count(ListKind::Normal), 2);
    }

    #[test]
    fn test_release_drains_both_lists() {
        let f = fixture(quick(2));
        f.activity.set_hdr_drop_count(0);
        f.hold(1);
        let (key, _) = f.frame(2, AfState::Focused);
        f.selector.hold_frame(key, ListKind::Hdr, TARGET).unwrap();
        f.selector.cancel();

        assert_eq!(f.selector.release(), 2);
        assert!(!f.selector.is_canceled());
        assert_eq!(f.pool.in_process_count(), 0);
    }

    #[test]
    fn test_synchronized_streams_select_matching_frames() {
        let arena = Arc::new(FrameArena::new());
        let pool = pool(8);
        let dual = Arc::new(DualStreamSynchronizer::new(
            Arc::clone(&arena),
            SyncConfig {
                enabled: true,
                wait_time_ms: 50,
                ..SyncConfig::default()
            },
        ));
        let make = |stream: u32| {
            FrameHoldingSelector::new(StreamId(stream), Arc::clone(&arena), quick(1))
                .with_pool(pool.clone())
                .with_synchronizer(Arc::clone(&dual))
                .unwrap()
        };
        let preview = make(0);
        let reprocess = make(1);

        let mut keys = Vec::new();
        for (selector, ts_ms) in [(&preview, 100), (&reprocess, 101)] {
            let slot = pool.acquire(None).unwrap();
            let key = arena.create(1, ts_ms * 1_000_000);
            arena
                .attach_buffer(
                    key,
                    BufferRef {
                        pipe_id: 0,
                        role: BufferRole::Destination { position: None },
                        index: slot.index,
                    },
                )
                .unwrap();
            arena.set_complete(key).unwrap();
            selector.hold_frame(key, ListKind::Normal, TARGET).unwrap();
            keys.push(key);
        }

        let request = CaptureRequest {
            try_count: 1,
            ..CaptureRequest::default()
        };
        assert_eq!(preview.select_frames(request).unwrap(), Selection::Selected(keys[0]));
        assert_eq!(reprocess.select_frames(request).unwrap(), Selection::Selected(keys[1]));
    }

    #[test]
    fn test_dropped_selector_leaves_synchronizer() {
        let arena = Arc::new(FrameArena::new());
        let pool = pool(4);
        let dual = Arc::new(DualStreamSynchronizer::new(
            Arc::clone(&arena),
            SyncConfig {
                enabled: true,
                ..SyncConfig::default()
            },
        ));
        let make = |stream: u32| {
            FrameHoldingSelector::new(StreamId(stream), Arc::clone(&arena), quick(1))
                .with_pool(pool.clone())
                .with_synchronizer(Arc::clone(&dual))
                .unwrap()
        };
        let preview = make(0);
        let reprocess = make(1);

        let slot = pool.acquire(None).unwrap();
        let key = arena.create(1, 100_000_000);
        arena
            .attach_buffer(
                key,
                BufferRef {
                    pipe_id: 0,
                    role: BufferRole::Destination { position: None },
                    index: slot.index,
                },
            )
            .unwrap();
        arena.set_complete(key).unwrap();
        reprocess.hold_frame(key, ListKind::Normal, TARGET).unwrap();
        assert_eq!(dual.unsynced_len(StreamId(1)), 1);

        drop(reprocess);
        assert!(!dual.is_registered(StreamId(1)));
        assert!(dual.is_registered(preview.stream()));
        assert_eq!(dual.stream_count(), 1);
        assert!(!arena.contains(key));
        assert_eq!(pool.in_process_count(), 0);
    }

}
