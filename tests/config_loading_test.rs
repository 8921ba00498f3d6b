//! Figment loading: TOML files, environment overrides and validation.

use anyhow::{Context, Result};
use capture_pool::{AllocMode, MemoryKind};
use rust_capture::config::CaptureConfig;
use rust_capture::tracing_setup::{self, TracingConfig};
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const BASE: &str = r#"
[application]
name = "Loader Test"
log_level = "debug"

[pool]
name = "bayer"
requested_count = 2
allowed_max = 4
alloc_mode = "silent_growth"
metadata_plane = true
memory = "cached_sync_force"

[[pool.planes]]
size = 65536
stride = 256

[selector]
hold_capacity = 2

[dual]
enabled = true
tolerance_ms = 3
"#;

fn write_config(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new().context("create temp config")?;
    file.write_all(contents.as_bytes())?;
    Ok(file)
}

#[test]
#[serial]
fn test_load_from_file() -> Result<()> {
    let file = write_config(BASE)?;
    let config = CaptureConfig::load_from(file.path())?;

    assert_eq!(config.application.name, "Loader Test");
    assert_eq!(config.pool.name, "bayer");
    assert_eq!(config.pool.layout.mode, AllocMode::SilentGrowth);
    assert_eq!(config.pool.layout.memory, MemoryKind::CachedSyncForce);
    assert!(config.pool.layout.metadata_plane);
    assert_eq!(config.pool.layout.planes.len(), 1);
    assert_eq!(config.pool.reserved_slots, 0);
    assert_eq!(config.selector.hold_capacity, 2);
    // Unset keys keep their defaults.
    assert_eq!(config.selector.wait_time_ms, 2000);
    assert_eq!(config.selector.hdr_delay, 1);
    assert!(config.dual.enabled);
    assert_eq!(config.dual.tolerance_ms, 3);
    assert_eq!(config.dual.min_retained, 1);

    config.validate().map_err(anyhow::Error::msg)?;
    Ok(())
}

#[test]
#[serial]
fn test_legacy_mode_key_is_accepted() -> Result<()> {
    let file = write_config(&BASE.replace("alloc_mode = \"silent_growth\"", "mode = \"on_demand\""))?;
    let config = CaptureConfig::load_from(file.path())?;
    assert_eq!(config.pool.layout.mode, AllocMode::OnDemand);
    Ok(())
}

#[test]
#[serial]
fn test_environment_overrides_file() -> Result<()> {
    let file = write_config(BASE)?;
    std::env::set_var("RUST_CAPTURE_SELECTOR__HOLD_CAPACITY", "3");
    std::env::set_var("RUST_CAPTURE_DUAL__TOLERANCE_MS", "5");
    let loaded = CaptureConfig::load_from(file.path());
    std::env::remove_var("RUST_CAPTURE_SELECTOR__HOLD_CAPACITY");
    std::env::remove_var("RUST_CAPTURE_DUAL__TOLERANCE_MS");

    let config = loaded?;
    assert_eq!(config.selector.hold_capacity, 3);
    assert_eq!(config.dual.tolerance_ms, 5);
    Ok(())
}

#[test]
#[serial]
fn test_validation_rejects_oversized_pool() -> Result<()> {
    let file = write_config(&BASE.replace("allowed_max = 4", "allowed_max = 40"))?;
    let config = CaptureConfig::load_from(file.path())?;
    let err = config.validate().unwrap_err();
    assert!(err.contains("pool"), "{err}");
    Ok(())
}

#[test]
#[serial]
fn test_missing_section_is_a_load_error() -> Result<()> {
    let file = write_config("[application]\nname = \"no pool\"\n")?;
    assert!(CaptureConfig::load_from(file.path()).is_err());
    Ok(())
}

#[test]
#[serial]
fn test_shipped_config_is_valid() -> Result<()> {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/capture.toml");
    let config = CaptureConfig::load_from(path)?;
    config.validate().map_err(anyhow::Error::msg)?;
    tracing_setup::init(TracingConfig::from_capture_config(&config).map_err(anyhow::Error::msg)?)
        .map_err(anyhow::Error::msg)?;
    Ok(())
}
