//! Session configuration.
//!
//! All timing and filtering knobs of the bridge live here so callers can
//! tune them per deployment instead of relying on hard-coded values.

use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;
use crate::retry::RetryConfig;

/// Settings for one scale session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a discovery scan runs before giving up, in milliseconds.
    pub scan_timeout_ms: u64,
    /// Devices weaker than this RSSI are ignored during scanning.
    pub min_rssi: i16,
    /// Backoff settings for the connection attempt.
    pub connect_retry: RetryConfig,
    /// Budget for each measurement source before falling back to the next.
    pub read_timeout_ms: u64,
    /// Measurements arriving closer together than this are treated as one
    /// burst; the first reading of the burst wins.
    pub measurement_debounce_ms: u64,
    /// Consecutive similar readings required before a standard GATT weight
    /// (which has no stability flag of its own) counts as stable.
    pub stability_threshold: u32,
    /// Two readings within this many kilograms count as "the same".
    pub stability_tolerance_kg: f64,
    /// Verify the 4-byte MIC when decrypting vendor payloads. Disable only
    /// for captures produced by firmware that emits unauthenticated frames.
    pub verify_mic: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            scan_timeout_ms: 30_000,
            min_rssi: -90,
            connect_retry: RetryConfig {
                max_attempts: 5,
                base_delay_ms: 1000,
                max_delay_ms: 10_000,
                backoff_multiplier: 2.0,
            },
            read_timeout_ms: 30_000,
            measurement_debounce_ms: 200,
            stability_threshold: 3,
            stability_tolerance_kg: 0.05,
            verify_mic: true,
        }
    }
}

impl SessionConfig {
    /// Loads the config from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub async fn load_config(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Session config not found at {:?}, using defaults.", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).await?;
        match serde_json::from_str(&content) {
            Ok(config) => {
                info!("Loaded session config from {:?}", path);
                Ok(config)
            }
            Err(e) => {
                warn!("Failed to parse session config ({}), using defaults.", e);
                Ok(Self::default())
            }
        }
    }

    /// Saves the config as pretty-printed JSON.
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, content).await?;
        info!("Saved session config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SessionConfig::default();
        assert!(config.verify_mic);
        assert_eq!(config.read_timeout_ms, 30_000);
        assert!(config.connect_retry.max_attempts >= 1);
        assert!(config.measurement_debounce_ms > 0);
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let config = SessionConfig::load_config(Path::new("/nonexistent/scale.json"))
            .await
            .unwrap();
        assert_eq!(config.scan_timeout_ms, SessionConfig::default().scan_timeout_ms);
    }
}
