//! # Rust Capture
//!
//! Buffer pooling and frame selection for camera capture pipelines.
//!
//! The heavy lifting lives in the workspace crates; this crate wires them
//! together for one capture session and carries the application-level glue.
//!
//! ## Crate Structure
//!
//! - **`capture-core`**: the `CaptureError` taxonomy and `StreamId`.
//! - **`capture-pool`**: `BufferPool`, its slot state machine and the memory
//!   and surface backends.
//! - **`capture-select`**: the frame arena, per-stream hold lists and
//!   selection policies, and the dual-stream synchronizer.
//! - **`config`**: Figment-based loading of `config/capture.toml` with
//!   `RUST_CAPTURE_` environment overrides.
//! - **`tracing_setup`**: subscriber initialization (pretty, compact, JSON).
//! - **`session`**: `CaptureSession`, the per-session registry that owns the
//!   arena, pool, synchronizer and selectors.

pub mod config;
pub mod session;
pub mod tracing_setup;

pub use capture_core::{CaptureError, CaptureResult, StreamId};
pub use capture_pool::{AllocMode, BufferPool, BufferPosition, PoolConfig};
pub use capture_select::{
    AfState, CaptureRequest, FrameHoldingSelector, FrameKey, ListKind, Selection, SelectionPolicy,
};
pub use config::CaptureConfig;
pub use session::CaptureSession;
