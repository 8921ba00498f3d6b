//! Capture-activity collaborators consulted by the gated selection policies.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicI64, Ordering};

/// Flash and HDR state owned by the capture pipeline.
pub trait CaptureActivity: Send + Sync {
    /// Start the main flash and return the sequence number of the last frame
    /// before it reaches full output. `None` when the pre-flash never ran.
    fn start_main_flash(&self) -> Option<u32>;

    /// Stop the main flash.
    fn stop_main_flash(&self);

    /// True while a pre-flash has fired and the flash is not yet off.
    fn flash_firing(&self) -> bool;

    /// Sequence number of the last frame dropped before the HDR bracket.
    fn hdr_drop_count(&self) -> u32;
}

/// Activity with no flash and no HDR bracket.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoActivity;

impl CaptureActivity for NoActivity {
    fn start_main_flash(&self) -> Option<u32> {
        None
    }

    fn stop_main_flash(&self) {}

    fn flash_firing(&self) -> bool {
        false
    }

    fn hdr_drop_count(&self) -> u32 {
        0
    }
}

/// Activity whose state is set directly, for tools and tests.
#[derive(Debug, Default)]
pub struct ManualActivity {
    flash_frame: AtomicI64,
    flash_running: AtomicBool,
    firing: AtomicBool,
    hdr_drop_count: AtomicU32,
}

impl ManualActivity {
    /// Activity with no flash scheduled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flash_frame: AtomicI64::new(-1),
            ..Self::default()
        }
    }

    /// Schedule the main flash at `frame_count`; `None` marks the pre-flash as missing.
    pub fn set_flash_frame(&self, frame_count: Option<u32>) {
        self.flash_frame
            .store(frame_count.map_or(-1, i64::from), Ordering::Release);
    }

    /// Set whether the flash is still firing.
    pub fn set_flash_firing(&self, firing: bool) {
        self.firing.store(firing, Ordering::Release);
    }

    /// Set the HDR drop count.
    pub fn set_hdr_drop_count(&self, count: u32) {
        self.hdr_drop_count.store(count, Ordering::Release);
    }

    /// Whether the main flash is currently running.
    #[must_use]
    pub fn main_flash_running(&self) -> bool {
        self.flash_running.load(Ordering::Acquire)
    }
}

impl CaptureActivity for ManualActivity {
    fn start_main_flash(&self) -> Option<u32> {
        let frame = u32::try_from(self.flash_frame.load(Ordering::Acquire)).ok()?;
        self.flash_running.store(true, Ordering::Release);
        Some(frame)
    }

    fn stop_main_flash(&self) {
        self.flash_running.store(false, Ordering::Release);
    }

    fn flash_firing(&self) -> bool {
        self.firing.load(Ordering::Acquire)
    }

    fn hdr_drop_count(&self) -> u32 {
        self.hdr_drop_count.load(Ordering::Acquire)
    }
}
