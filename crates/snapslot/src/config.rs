//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_METADATA_DIR: &str = "/metadata/ota";
const DEFAULT_IMAGES_DIR: &str = "/data/gsi/ota";
const DEFAULT_MAPPING_TIMEOUT_MS: u64 = 15_000;

/// Locations and timeouts the engine operates with. All paths are the
/// engine's exclusive domain; no other component writes there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the state file, boot indicator, and per-snapshot
    /// status records.
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
    /// Storage area for file-backed COW images.
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,
    /// Default budget for one top-level mapping call. The device composer
    /// subtracts elapsed time from this as it walks the layers.
    #[serde(default = "default_mapping_timeout", with = "timeout_ms")]
    pub mapping_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            metadata_dir: default_metadata_dir(),
            images_dir: default_images_dir(),
            mapping_timeout: default_mapping_timeout(),
        }
    }
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from(DEFAULT_METADATA_DIR)
}

fn default_images_dir() -> PathBuf {
    PathBuf::from(DEFAULT_IMAGES_DIR)
}

fn default_mapping_timeout() -> Duration {
    Duration::from_millis(DEFAULT_MAPPING_TIMEOUT_MS)
}

mod timeout_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.metadata_dir, PathBuf::from("/metadata/ota"));
        assert_eq!(config.mapping_timeout, Duration::from_secs(15));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.images_dir, PathBuf::from("/data/gsi/ota"));
    }

    #[test]
    fn timeout_round_trips_as_millis() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"mapping_timeout": 2500}"#).unwrap();
        assert_eq!(config.mapping_timeout, Duration::from_millis(2500));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mapping_timeout\":2500"));
    }
}
