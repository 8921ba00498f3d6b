//! Core types shared by the capture crates.
//!
//! - [`error`]: the [`CaptureError`] taxonomy and [`CaptureResult`] alias
//! - [`StreamId`]: identity of one logical capture stream
//!
//! Both `capture-pool` and `capture-select` report failures through the same
//! error enum so callers can branch on one type regardless of which component
//! refused the request.

pub mod error;

pub use error::{CaptureError, CaptureResult};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one capture stream (one sensor / pipeline instance).
///
/// Used as the registry key by the dual-stream synchronizer and as a log field
/// everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
