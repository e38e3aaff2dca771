//! Engine configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersyncConfig {
    /// Sync queue driver.
    pub scheduler: SchedulerConfig,
    /// Message pump and retention.
    pub router: RouterConfig,
    /// Conflict detection and default strategy.
    pub resolver: ResolverConfig,
    /// Durable storage backend.
    pub persistence: PersistenceConfig,
    /// Event bus sizing.
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between queue drains.
    pub tick_ms: u64,
    /// Time a single drain may spend before yielding to the next tick. Defaults to `tick_ms`.
    pub drain_budget_ms: Option<u64>,
    /// Deadline applied to requests that carry none.
    pub default_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Interval between message queue pumps.
    pub tick_ms: u64,
    /// How long terminal messages stay queryable.
    pub message_retention_secs: u64,
    /// Turn each directed delivery into a Delta sync from sender to recipient.
    pub relay_deliveries: bool,
}

/// How Delta sync decides a differing target field is a real conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDetection {
    /// Target version moved past the version seen at the last sync from this source.
    #[default]
    Watermark,
    /// Source was last modified no later than the target.
    WallClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub default_strategy: String,
    pub conflict_detection: ConflictDetection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// Root directory for the json backend.
    pub dir: PathBuf,
    /// Attempts after the first failed write.
    pub max_retries: u32,
    /// Base delay between attempts; doubles each retry.
    pub retry_backoff_ms: u64,
    /// Pending writes buffered before new ones are dropped.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

// ============================================================
// Defaults
// ============================================================

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            drain_budget_ms: None,
            default_timeout_ms: None,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            message_retention_secs: 3_600,
            relay_deliveries: false,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_strategy: crate::resolver::NEWEST_WINS.into(),
            conflict_detection: ConflictDetection::default(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            dir: PathBuf::from("./tiersync-data"),
            max_retries: 3,
            retry_backoff_ms: 100,
            queue_capacity: 1_024,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1_024 }
    }
}

// ============================================================
// Loading
// ============================================================

impl TiersyncConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("{} in {}, using defaults", e, path.display());
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> tiersync_core::Result<Self> {
        toml::from_str(content).map_err(|e| tiersync_core::Error::Config(e.to_string()))
    }

    /// Render the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn drain_budget(&self) -> Duration {
        self.drain_budget_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.tick())
    }
}

impl RouterConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.message_retention_secs)
    }
}

impl PersistenceConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TiersyncConfig::default();
        assert_eq!(config.scheduler.tick_ms, 1_000);
        assert_eq!(config.scheduler.drain_budget(), Duration::from_millis(1_000));
        assert_eq!(config.router.tick_ms, 100);
        assert_eq!(config.router.message_retention_secs, 3_600);
        assert!(!config.router.relay_deliveries);
        assert_eq!(config.resolver.default_strategy, "newest_wins");
        assert_eq!(config.resolver.conflict_detection, ConflictDetection::Watermark);
        assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
        assert_eq!(config.persistence.max_retries, 3);
        assert_eq!(config.events.capacity, 1_024);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = TiersyncConfig::from_toml(
            r#"
            [scheduler]
            tick_ms = 250

            [resolver]
            conflict_detection = "wall_clock"

            [persistence]
            backend = "json"
            dir = "/var/lib/tiersync"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.tick_ms, 250);
        assert_eq!(config.scheduler.drain_budget(), Duration::from_millis(250));
        assert_eq!(config.resolver.conflict_detection, ConflictDetection::WallClock);
        assert_eq!(config.resolver.default_strategy, "newest_wins");
        assert_eq!(config.persistence.backend, PersistenceBackend::Json);
        assert_eq!(config.persistence.dir, PathBuf::from("/var/lib/tiersync"));
        assert_eq!(config.router.tick_ms, 100);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = TiersyncConfig::from_toml("scheduler = 5").unwrap_err();
        assert!(matches!(err, tiersync_core::Error::Config(_)));
    }

    #[test]
    fn toml_roundtrip_of_defaults() {
        let rendered = TiersyncConfig::default().to_toml();
        let parsed = TiersyncConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.router.message_retention_secs, 3_600);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let config = TiersyncConfig::load(Path::new("/nonexistent/tiersync.toml"));
        assert_eq!(config.scheduler.tick_ms, 1_000);
    }
}
