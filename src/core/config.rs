use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{FetchError, FetchResult};

const APP_DIR_NAME: &str = "InterfaceOficial";
const SETTINGS_FILE: &str = "download_settings.json";

/// Hard ceiling on parallel transfers against remote hosts.
pub const CONCURRENCY_CEILING: usize = 16;

/// Tunables for the content acquisition pipeline.
///
/// Durations are persisted as milliseconds; missing fields fall back to defaults,
/// so a partial `download_settings.json` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Upper bound applied to the concurrency limit of every batch.
    pub max_concurrency: usize,
    /// Total attempts for transient network failures (first try included).
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub retry_base_delay: Duration,
    #[serde(with = "millis")]
    pub retry_max_delay: Duration,
    /// Bounds one transfer attempt, response body included.
    #[serde(with = "millis")]
    pub attempt_timeout: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Cadence of `BatchState` snapshots.
    #[serde(with = "millis")]
    pub progress_interval: Duration,
    /// Weight of the newest throughput sample in the speed EWMA.
    pub speed_smoothing: f64,
    pub user_agent: String,
    pub check_disk_space: bool,
    /// Free space required on top of the batch's known bytes.
    pub min_free_disk_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: CONCURRENCY_CEILING,
            max_attempts: 4,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(15),
            progress_interval: Duration::from_millis(250),
            speed_smoothing: 0.3,
            user_agent: "InterfaceOficial/0.1.0".to_string(),
            check_disk_space: true,
            min_free_disk_bytes: 64 * 1024 * 1024,
        }
    }
}

impl DownloadConfig {
    /// Validate a caller's concurrency limit and clamp it to the configured ceiling.
    pub fn effective_concurrency(&self, requested: usize) -> FetchResult<usize> {
        if requested == 0 {
            return Err(FetchError::InvalidConcurrency(requested));
        }
        let ceiling = self.max_concurrency.clamp(1, CONCURRENCY_CEILING);
        Ok(requested.min(ceiling))
    }

    /// Backoff before retry number `attempt` (1-based): base, 2×base, 4×base … capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .retry_base_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        delay.min(self.retry_max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn smoothing(&self) -> f64 {
        if self.speed_smoothing.is_finite() && self.speed_smoothing > 0.0 {
            self.speed_smoothing.min(1.0)
        } else {
            1.0
        }
    }

    pub fn load(path: &Path) -> FetchResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| FetchError::io(path, source))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(error) => {
                if path.exists() {
                    tracing::warn!("Ignoring unreadable download settings {:?}: {}", path, error);
                }
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> FetchResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FetchError::io(parent, source))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| FetchError::io(path, source))
    }

    /// `<data dir>/InterfaceOficial/download_settings.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
            .join(SETTINGS_FILE)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
