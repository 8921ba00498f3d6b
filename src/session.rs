//! Capture session wiring.
//!
//! A [`CaptureSession`] is the per-session registry that owns everything the
//! capture path shares between streams:
//!
//! - **`arena`**: the [`FrameArena`] every frame lives in.
//! - **`pool`**: the [`BufferPool`] frames draw their output buffers from,
//!   backed by a [`SystemHeap`] or, when `pool.reserved_slots > 0`, a
//!   [`ReservedHeap`].
//! - **`synchronizer`**: one [`DualStreamSynchronizer`], present only when
//!   `dual.enabled` is set.
//! - **`selectors`**: one [`FrameHoldingSelector`] per registered stream.
//!
//! The session also stands in for the pipeline's completion callback
//! ([`CaptureSession::submit_frame`]) and the consumer's release path
//! ([`CaptureSession::consume`]), which is what the integration tests drive.

use crate::config::CaptureConfig;
use anyhow::{anyhow, Context, Result};
use capture_core::StreamId;
use capture_pool::{BufferPool, BufferPosition, MemoryBackend, MemoryKind, ReservedHeap, SystemHeap};
use capture_select::{
    AfState, BufferRef, BufferRole, BufferTarget, CaptureActivity, DualStreamSynchronizer,
    FrameArena, FrameHoldingSelector, FrameKey, ListKind, NoActivity,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Pipeline stage whose output buffers the session manages.
pub const OUTPUT_PIPE: u32 = 0;

const OUTPUT_TARGET: BufferTarget = BufferTarget::destination(OUTPUT_PIPE, None);

/// Per-session registry of the arena, pool, synchronizer and selectors.
pub struct CaptureSession {
    config: CaptureConfig,
    arena: Arc<FrameArena>,
    pool: BufferPool,
    activity: Arc<dyn CaptureActivity>,
    synchronizer: Option<Arc<DualStreamSynchronizer>>,
    selectors: BTreeMap<StreamId, Arc<FrameHoldingSelector>>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("application", &self.config.application.name)
            .field("pool", &self.pool)
            .field("streams", &self.selectors.keys().collect::<Vec<_>>())
            .field("synchronized", &self.synchronizer.is_some())
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Validate `config`, then configure and allocate the pool.
    pub fn new(config: CaptureConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow!(e))
            .context("invalid capture configuration")?;

        let pool = BufferPool::new(config.pool.name.clone(), Self::backend(&config));
        pool.configure(config.pool.layout.clone())
            .with_context(|| format!("failed to configure pool '{}'", config.pool.name))?;
        pool.allocate()
            .with_context(|| format!("failed to allocate pool '{}'", config.pool.name))?;

        let arena = Arc::new(FrameArena::new());
        let synchronizer = config
            .dual
            .enabled
            .then(|| Arc::new(DualStreamSynchronizer::new(Arc::clone(&arena), config.dual.clone())));

        info!(
            application = %config.application.name,
            pool = %config.pool.name,
            allocated = pool.allocated_count(),
            synchronized = synchronizer.is_some(),
            "capture session created"
        );

        Ok(Self {
            config,
            arena,
            pool,
            activity: Arc::new(NoActivity),
            synchronizer,
            selectors: BTreeMap::new(),
        })
    }

    fn backend(config: &CaptureConfig) -> Arc<dyn MemoryBackend> {
        let heap = match config.pool.layout.memory {
            MemoryKind::NonCached => SystemHeap::non_cached(),
            MemoryKind::Cached | MemoryKind::CachedSyncForce => SystemHeap::cached(),
        };
        match config.pool.reserved_slots {
            0 => Arc::new(heap),
            reserved => Arc::new(ReservedHeap::new(reserved, heap)),
        }
    }

    /// Flash and HDR state handed to streams added after this call.
    #[must_use]
    pub fn with_activity(mut self, activity: Arc<dyn CaptureActivity>) -> Self {
        self.activity = activity;
        self
    }

    /// Create the selector for `stream`, registering it with the synchronizer
    /// when dual-stream mode is enabled.
    pub fn add_stream(&mut self, stream: StreamId) -> Result<Arc<FrameHoldingSelector>> {
        if self.selectors.contains_key(&stream) {
            return Err(anyhow!("{stream} is already registered"));
        }
        let mut selector =
            FrameHoldingSelector::new(stream, Arc::clone(&self.arena), self.config.selector.clone())
                .with_pool(self.pool.clone())
                .with_activity(Arc::clone(&self.activity));
        if let Some(dual) = &self.synchronizer {
            selector = selector
                .with_synchronizer(Arc::clone(dual))
                .with_context(|| format!("failed to register {stream} for synchronization"))?;
        }
        let selector = Arc::new(selector);
        self.selectors.insert(stream, Arc::clone(&selector));
        info!(%stream, "stream added");
        Ok(selector)
    }

    /// Selector of `stream`.
    #[must_use]
    pub fn selector(&self, stream: StreamId) -> Option<Arc<FrameHoldingSelector>> {
        self.selectors.get(&stream).cloned()
    }

    /// Frame arena shared by every stream.
    #[must_use]
    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }

    /// Output buffer pool.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Synchronizer, when dual-stream mode is enabled.
    #[must_use]
    pub fn synchronizer(&self) -> Option<&Arc<DualStreamSynchronizer>> {
        self.synchronizer.as_ref()
    }

    /// Configuration the session was built from.
    #[must_use]
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Complete one exposure on `stream`: take an output buffer, create the
    /// frame and hand it to the stream's selector.
    ///
    /// On failure the buffer goes back to the pool and the frame is destroyed.
    pub fn submit_frame(
        &self,
        stream: StreamId,
        frame_count: u32,
        timestamp_ns: u64,
        af_state: AfState,
        kind: ListKind,
    ) -> Result<FrameKey> {
        let selector = self
            .selectors
            .get(&stream)
            .ok_or_else(|| anyhow!("{stream} is not registered"))?;
        let slot = self
            .pool
            .acquire(None)
            .with_context(|| format!("no output buffer for frame {frame_count} on {stream}"))?;

        let key = self.arena.create(frame_count, timestamp_ns);
        let held = self
            .arena
            .attach_buffer(
                key,
                BufferRef {
                    pipe_id: OUTPUT_PIPE,
                    role: BufferRole::Destination { position: None },
                    index: slot.index,
                },
            )
            .and_then(|()| self.arena.set_af_state(key, af_state))
            .and_then(|()| self.arena.set_complete(key))
            .and_then(|()| selector.hold_frame(key, kind, OUTPUT_TARGET));
        if let Err(e) = held {
            self.discard(key, slot.index);
            return Err(e).with_context(|| format!("failed to hold {key} on {stream}"));
        }
        Ok(key)
    }

    fn discard(&self, key: FrameKey, index: usize) {
        if let Err(e) = self.pool.release(index, BufferPosition::None) {
            warn!(%key, index, error = %e, "buffer release failed");
        }
        let destroyed = self.arena.set_complete(key).is_ok() && self.arena.try_destroy(key);
        if !destroyed && self.arena.contains(key) {
            warn!(%key, "discarded frame is still referenced");
        }
    }

    /// Return a delivered frame: release its output buffer and drop the
    /// consumer's reference. Returns whether the frame was destroyed.
    pub fn consume(&self, key: FrameKey) -> Result<bool> {
        if let Some(index) = self.arena.buffer_index(key, OUTPUT_TARGET) {
            self.pool
                .release(index, BufferPosition::None)
                .with_context(|| format!("failed to release buffer of {key}"))?;
        }
        Ok(self.arena.release(key)?)
    }

    /// Wake every blocked selection on every stream.
    pub fn cancel_all(&self) {
        for selector in self.selectors.values() {
            selector.cancel();
        }
    }

    /// Release every held frame and free the pool's memory.
    pub fn shutdown(mut self) -> Result<()> {
        let selectors = std::mem::take(&mut self.selectors);
        let mut released = 0;
        for (stream, selector) in selectors {
            released += selector.release();
            if let Some(dual) = &self.synchronizer {
                if let Err(e) = dual.unregister_stream(stream) {
                    warn!(%stream, error = %e, "unregister failed");
                }
            }
        }
        self.synchronizer = None;
        self.pool.teardown().context("pool teardown failed")?;
        info!(released, live_frames = self.arena.len(), "capture session shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplicationConfig, PoolSection};
    use capture_pool::{AllocMode, PlaneLayout, PoolConfig};
    use capture_select::{SelectorConfig, SyncConfig};

    fn config(reserved_slots: usize) -> CaptureConfig {
        CaptureConfig {
            application: ApplicationConfig {
                name: "session-test".to_string(),
                log_level: "debug".to_string(),
            },
            pool: PoolSection {
                name: "output".to_string(),
                layout: PoolConfig::new(
                    vec![PlaneLayout {
                        size: 1024,
                        stride: 32,
                    }],
                    4,
                    4,
                    AllocMode::AllAtOnce,
                ),
                reserved_slots,
            },
            selector: SelectorConfig {
                wait_time_ms: 20,
                ..SelectorConfig::default()
            },
            dual: SyncConfig::default(),
        }
    }

    #[test]
    fn test_session_rejects_invalid_config() {
        let mut bad = config(0);
        bad.pool.layout.allowed_max = 2;
        let err = CaptureSession::new(bad).unwrap_err();
        assert!(format!("{err:#}").contains("invalid capture configuration"));
    }

    #[test]
    fn test_submit_select_consume() {
        let mut session = CaptureSession::new(config(2)).unwrap();
        let selector = session.add_stream(StreamId(0)).unwrap();
        assert!(session.add_stream(StreamId(0)).is_err());

        let key = session
            .submit_frame(StreamId(0), 1, 1_000, AfState::Focused, ListKind::Normal)
            .unwrap();
        let selection = selector
            .select_frame(capture_select::SelectionPolicy::Normal, 1)
            .unwrap();
        assert_eq!(selection.frame(), Some(key));

        assert!(session.consume(key).unwrap());
        assert_eq!(session.pool().in_process_count(), 0);
        session.shutdown().unwrap();
    }

    #[test]
    fn test_failed_hold_returns_buffer_and_frame() {
        let mut dual = config(0);
        dual.dual.enabled = true;
        let mut session = CaptureSession::new(dual).unwrap();
        session.add_stream(StreamId(0)).unwrap();
        session
            .synchronizer()
            .unwrap()
            .unregister_stream(StreamId(0))
            .unwrap();

        let err = session
            .submit_frame(StreamId(0), 1, 0, AfState::Focused, ListKind::Normal)
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to hold"));
        assert_eq!(session.pool().in_process_count(), 0);
        assert!(session.arena().is_empty());
    }

    #[test]
    fn test_unknown_stream() {
        let session = CaptureSession::new(config(0)).unwrap();
        assert!(session
            .submit_frame(StreamId(3), 1, 0, AfState::Focused, ListKind::Normal)
            .is_err());
        assert!(session.selector(StreamId(3)).is_none());
    }
}
