//! Capture configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/capture.toml` (base configuration)
//! 2. Environment variables prefixed with `RUST_CAPTURE_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use rust_capture::config::CaptureConfig;
//!
//! let config = CaptureConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use capture_pool::{PoolConfig, MAX_SLOTS};
use capture_select::{SelectorConfig, SyncConfig};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/capture.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RUST_CAPTURE_";

/// Top-level capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Buffer pool geometry and backend selection
    pub pool: PoolSection,
    /// Hold list and selection policy tuning
    #[serde(default)]
    pub selector: SelectorConfig,
    /// Dual-stream synchronization
    #[serde(default)]
    pub dual: SyncConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// `[pool]` section: the pool geometry plus backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSection {
    /// Pool name used in logs
    #[serde(default = "default_pool_name")]
    pub name: String,
    /// Plane geometry, counts and growth policy
    #[serde(flatten)]
    pub layout: PoolConfig,
    /// Slots served from the reserved region (0 = plain system heap)
    #[serde(default)]
    pub reserved_slots: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_name() -> String {
    "capture".to_string()
}

impl CaptureConfig {
    /// Load configuration from `config/capture.toml` and environment variables
    ///
    /// Example override: `RUST_CAPTURE_SELECTOR__HOLD_CAPACITY=3`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        self.pool
            .layout
            .validate()
            .map_err(|e| format!("Invalid pool configuration: {e}"))?;
        if self.pool.reserved_slots > MAX_SLOTS {
            return Err(format!(
                "Invalid reserved_slots {}. Must be at most {MAX_SLOTS}",
                self.pool.reserved_slots
            ));
        }
        if self.selector.hold_capacity > self.pool.layout.allowed_max {
            return Err(format!(
                "selector.hold_capacity {} exceeds pool.allowed_max {}",
                self.selector.hold_capacity, self.pool.layout.allowed_max
            ));
        }

        self.selector.validate()?;
        self.dual.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_pool::{AllocMode, PlaneLayout};

    fn sample() -> CaptureConfig {
        CaptureConfig {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "info".to_string(),
            },
            pool: PoolSection {
                name: "preview".to_string(),
                layout: PoolConfig::new(
                    vec![PlaneLayout {
                        size: 4096,
                        stride: 64,
                    }],
                    4,
                    6,
                    AllocMode::OnDemand,
                ),
                reserved_slots: 0,
            },
            selector: SelectorConfig::default(),
            dual: SyncConfig::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = sample();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_pool_geometry() {
        let mut config = sample();
        config.pool.layout.requested_count = 7;
        let err = config.validate().unwrap_err();
        assert!(err.contains("pool"), "{err}");
    }

    #[test]
    fn test_hold_capacity_bounded_by_pool() {
        let mut config = sample();
        config.selector.hold_capacity = 7;
        assert!(config.validate().is_err());
    }
}
