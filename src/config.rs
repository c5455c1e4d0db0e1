use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MediaSDKError;

pub const DEFAULT_TIMEOUT_MS: u64 = 300_000; // 5 minutes
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 3] = [2_000, 5_000, 10_000];
pub const DEFAULT_BACKFILL_QUEUE_CAPACITY: u32 = 2;

#[derive(uniffi::Record)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadManagerConfig {
    /// Self hosted API origin. When set, credentials travel as query parameters instead of
    /// headers, since the origin redirects to object storage which would drop custom headers.
    pub custom_origin: Option<String>,
    /// Timeout of thumbnail and whole file requests. Streamed downloads are not bounded.
    pub timeout_ms: u64,
    /// Wait before each retry of a failed transport call. One more attempt than entries.
    pub retry_delays_ms: Vec<u64>,
    /// Directory for the persistent thumbnail cache, none disables it.
    pub thumbnail_cache_dir: Option<String>,
    pub is_desktop: bool,
    pub video_processing_enabled: bool,
    pub backfill_queue_capacity: u32,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            custom_origin: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            thumbnail_cache_dir: None,
            is_desktop: false,
            video_processing_enabled: false,
            backfill_queue_capacity: DEFAULT_BACKFILL_QUEUE_CAPACITY,
        }
    }
}

impl DownloadManagerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    /// Custom origin without trailing slashes, blank values count as unset.
    pub fn custom_origin(&self) -> Option<&str> {
        self.custom_origin
            .as_deref()
            .map(|origin| origin.trim().trim_end_matches('/'))
            .filter(|origin| !origin.is_empty())
    }

    pub fn to_ron(&self) -> Result<String, MediaSDKError> {
        Ok(ron::ser::to_string(self)?)
    }

    pub fn from_ron(config: &str) -> Result<Self, MediaSDKError> {
        Ok(ron::de::from_str(config)?)
    }
}

/// Serializes a config so the host can store it next to its other settings.
#[uniffi::export]
pub fn export_download_config(config: DownloadManagerConfig) -> Result<String, MediaSDKError> {
    config.to_ron()
}

#[uniffi::export]
pub fn import_download_config(config: String) -> Result<DownloadManagerConfig, MediaSDKError> {
    DownloadManagerConfig::from_ron(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ron_round_trip() {
        let config = DownloadManagerConfig {
            custom_origin: Some("https://photos.example.org/".to_string()),
            is_desktop: true,
            backfill_queue_capacity: 5,
            ..Default::default()
        };

        let exported = config.to_ron().unwrap();
        let imported = DownloadManagerConfig::from_ron(&exported).unwrap();
        assert_eq!(imported, config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let imported = DownloadManagerConfig::from_ron("(is_desktop: true)").unwrap();
        assert!(imported.is_desktop);
        assert_eq!(imported.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(imported.backfill_queue_capacity, 2);
        assert_eq!(imported.retry_delays().len(), 3);
    }

    #[test]
    fn test_invalid_ron_is_config_error() {
        let err = DownloadManagerConfig::from_ron("(timeout_ms: \"soon\")").unwrap_err();
        assert!(matches!(err, MediaSDKError::ConfigError { .. }));
    }

    #[test]
    fn test_custom_origin_normalization() {
        let mut config = DownloadManagerConfig::default();
        assert_eq!(config.custom_origin(), None);

        config.custom_origin = Some("  ".to_string());
        assert_eq!(config.custom_origin(), None);

        config.custom_origin = Some("https://api.example.org//".to_string());
        assert_eq!(config.custom_origin(), Some("https://api.example.org"));
    }
}
