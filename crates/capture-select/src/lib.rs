//! Frame hold lists, selection policies and dual-stream synchronization.
//!
//! The capture pipeline hands every completed frame to the
//! [`FrameHoldingSelector`] of its stream. The selector keeps a short,
//! capacity-bounded history of locked frames and delivers one when a consumer
//! asks, according to a [`SelectionPolicy`]. Streams that must be captured at
//! the same instant share a [`DualStreamSynchronizer`].
//!
//! Frames live in a [`FrameArena`]; everything else refers to them by
//! [`FrameKey`]. Buffers evicted along the way go back to the stream's
//! [`capture_pool::BufferPool`].
//!
//! # Example
//!
//! ```
//! use capture_core::StreamId;
//! use capture_pool::{AllocMode, BufferPool, PlaneLayout, PoolConfig, SystemHeap};
//! use capture_select::{
//!     BufferRef, BufferRole, BufferTarget, FrameArena, FrameHoldingSelector, ListKind,
//!     Selection, SelectionPolicy, SelectorConfig,
//! };
//! use std::sync::Arc;
//!
//! let pool = BufferPool::new("preview", Arc::new(SystemHeap::non_cached()));
//! pool.configure(PoolConfig::new(
//!     vec![PlaneLayout { size: 4096, stride: 64 }],
//!     4,
//!     4,
//!     AllocMode::AllAtOnce,
//! ))?;
//! pool.allocate()?;
//!
//! let arena = Arc::new(FrameArena::new());
//! let selector = Arc::new(
//!     FrameHoldingSelector::new(StreamId(0), Arc::clone(&arena), SelectorConfig::default())
//!         .with_pool(pool.clone()),
//! );
//!
//! let slot = pool.acquire(None)?;
//! let key = arena.create(1, 33_000_000);
//! arena.attach_buffer(
//!     key,
//!     BufferRef { pipe_id: 0, role: BufferRole::Destination { position: None }, index: slot.index },
//! )?;
//! arena.set_complete(key)?;
//! selector.hold_frame(key, ListKind::Normal, BufferTarget::destination(0, None))?;
//!
//! let selection = tokio_test::block_on(
//!     Arc::clone(&selector).select_frame_async(SelectionPolicy::Normal, 1),
//! )?;
//! assert_eq!(selection, Selection::Selected(key));
//! # Ok::<(), capture_core::CaptureError>(())
//! ```

pub mod activity;
pub mod dual;
pub mod frame;
pub mod hold_list;
pub mod selector;

pub use activity::{CaptureActivity, ManualActivity, NoActivity};
pub use dual::{DualStreamSynchronizer, SyncConfig};
pub use frame::{AfState, BufferRef, BufferRole, BufferTarget, Frame, FrameArena, FrameKey};
pub use hold_list::{BlockingBoundedQueue, PopOutcome};
pub use selector::{
    CaptureRequest, FrameHoldingSelector, ListKind, Selection, SelectionPolicy, SelectorConfig,
};
