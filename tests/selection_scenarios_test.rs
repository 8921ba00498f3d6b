//! End-to-end selection scenarios driven through a `CaptureSession`.

use anyhow::Result;
use capture_pool::{AllocMode, PlaneLayout, PoolConfig};
use capture_select::{SelectorConfig, SyncConfig};
use rust_capture::config::{ApplicationConfig, CaptureConfig, PoolSection};
use rust_capture::{AfState, CaptureRequest, CaptureSession, ListKind, Selection, SelectionPolicy, StreamId};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PREVIEW: StreamId = StreamId(0);
const REPROCESS: StreamId = StreamId(1);
const MS: u64 = 1_000_000;

fn config(hold_capacity: usize, wait_time_ms: u64, dual: bool) -> CaptureConfig {
    CaptureConfig {
        application: ApplicationConfig {
            name: "selection-scenarios".to_string(),
            log_level: "debug".to_string(),
        },
        pool: PoolSection {
            name: "output".to_string(),
            layout: PoolConfig::new(
                vec![PlaneLayout {
                    size: 16 * 1024,
                    stride: 128,
                }],
                8,
                8,
                AllocMode::AllAtOnce,
            ),
            reserved_slots: 0,
        },
        selector: SelectorConfig {
            hold_capacity,
            wait_time_ms,
            poll_interval_ms: 1,
            ..SelectorConfig::default()
        },
        dual: SyncConfig {
            enabled: dual,
            wait_time_ms,
            ..SyncConfig::default()
        },
    }
}

#[test]
fn test_capacity_one_delivers_newest() -> Result<()> {
    let mut session = CaptureSession::new(config(1, 50, false))?;
    let selector = session.add_stream(PREVIEW)?;

    let a = session.submit_frame(PREVIEW, 1, 33 * MS, AfState::Focused, ListKind::Normal)?;
    let b = session.submit_frame(PREVIEW, 2, 66 * MS, AfState::Focused, ListKind::Normal)?;

    assert!(!session.arena().contains(a), "A must be evicted before B is held");
    assert_eq!(session.pool().in_process_count(), 1);

    let selection = selector.select_frame(SelectionPolicy::Normal, 1)?;
    assert_eq!(selection, Selection::Selected(b));
    assert!(session.consume(b)?);
    session.shutdown()
}

#[test]
fn test_holding_k_of_n_releases_each_buffer_once() -> Result<()> {
    let mut session = CaptureSession::new(config(3, 50, false))?;
    let selector = session.add_stream(PREVIEW)?;
    let releases_before = session.pool().total_releases();

    for fc in 0..8 {
        session.submit_frame(PREVIEW, fc, u64::from(fc) * 33 * MS, AfState::Focused, ListKind::Normal)?;
        if fc >= 3 {
            assert_eq!(selector.held_count(ListKind::Normal), 3);
        }
    }

    assert_eq!(selector.evicted_count(), 5);
    assert_eq!(session.pool().total_releases() - releases_before, 5);
    assert_eq!(session.pool().in_process_count(), 3);
    assert_eq!(session.arena().len(), 3);
    session.shutdown()
}

#[tokio::test]
async fn test_cancel_unblocks_waiting_consumer() -> Result<()> {
    let mut session = CaptureSession::new(config(1, 30_000, false))?;
    let selector = session.add_stream(PREVIEW)?;

    let waiter = tokio::task::spawn_blocking({
        let selector = Arc::clone(&selector);
        move || selector.select_frame(SelectionPolicy::Normal, 5)
    });
    while !selector.is_waiting(ListKind::Normal) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let started = Instant::now();
    session.cancel_all();
    let selection = waiter.await??;
    assert_eq!(selection, Selection::Canceled);
    assert!(started.elapsed() < Duration::from_millis(500));

    selector.reset_cancel();
    session.shutdown()
}

#[test]
fn test_gated_request_falls_back_to_oldest_frame() -> Result<()> {
    let mut session = CaptureSession::new(config(2, 20, false))?;
    let selector = session.add_stream(PREVIEW)?;

    let key = session.submit_frame(PREVIEW, 1, 0, AfState::Scanning, ListKind::Normal)?;
    let request = CaptureRequest {
        try_count: 1,
        ..CaptureRequest::default()
    };
    // Focus never settles; the fallback pass has nothing left either.
    let selection = selector.select_frames(request)?;
    assert_eq!(selection, Selection::TimedOut);
    assert!(!session.arena().contains(key));

    let key = session.submit_frame(PREVIEW, 2, 0, AfState::Focused, ListKind::Normal)?;
    assert_eq!(selector.select_frames(request)?, Selection::Selected(key));
    session.consume(key)?;
    session.shutdown()
}

#[test]
fn test_dual_streams_within_tolerance_are_paired() -> Result<()> {
    let mut session = CaptureSession::new(config(1, 50, true))?;
    let preview = session.add_stream(PREVIEW)?;
    let reprocess = session.add_stream(REPROCESS)?;

    let a = session.submit_frame(PREVIEW, 1, 100 * MS, AfState::Focused, ListKind::Normal)?;
    let b = session.submit_frame(REPROCESS, 1, 101 * MS, AfState::Focused, ListKind::Normal)?;

    let request = CaptureRequest {
        try_count: 1,
        ..CaptureRequest::default()
    };
    assert_eq!(preview.select_frames(request)?, Selection::Selected(a));
    let dual = session.synchronizer().expect("dual mode enabled");
    assert_eq!(dual.output_len(REPROCESS), 1, "partner published on the same cycle");
    assert_eq!(reprocess.select_frames(request)?, Selection::Selected(b));

    session.consume(a)?;
    session.consume(b)?;
    session.shutdown()
}

#[test]
fn test_dual_streams_outside_tolerance_are_evicted() -> Result<()> {
    let mut session = CaptureSession::new(config(1, 20, true))?;
    let preview = session.add_stream(PREVIEW)?;
    session.add_stream(REPROCESS)?;

    let a = session.submit_frame(PREVIEW, 1, 100 * MS, AfState::Focused, ListKind::Normal)?;
    let b = session.submit_frame(REPROCESS, 1, 130 * MS, AfState::Focused, ListKind::Normal)?;
    let dual = Arc::clone(session.synchronizer().expect("dual mode enabled"));
    assert_eq!(dual.unsynced_len(PREVIEW), 1);
    assert_eq!(dual.unsynced_len(REPROCESS), 1);

    let request = CaptureRequest {
        try_count: 1,
        ..CaptureRequest::default()
    };
    assert_eq!(preview.select_frames(request)?, Selection::TimedOut);

    // Two more unmatched frames per stream push both past min_retained.
    for (i, ts) in [(2, 200), (3, 300)] {
        session.submit_frame(PREVIEW, i, ts * MS, AfState::Focused, ListKind::Normal)?;
        session.submit_frame(REPROCESS, i, (ts + 50) * MS, AfState::Focused, ListKind::Normal)?;
    }
    assert!(!session.arena().contains(a));
    assert!(!session.arena().contains(b));
    assert_eq!(dual.unsynced_len(PREVIEW), 2);
    session.shutdown()
}
