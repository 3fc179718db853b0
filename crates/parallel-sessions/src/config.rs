use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::memory_db::BackendConfig;
use crate::promotion::{DEFAULT_AUTO_PROMOTE_THRESHOLD, MAX_IMPORTANCE};
use crate::sessions::IsolationMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelSessionsConfig {
    /// When false the maintenance task is never started.
    pub enabled: bool,
    pub max_concurrent: usize,
    pub isolation: IsolationMode,
    pub idle_timeout_ms: u64,
    pub maintenance_interval_ms: u64,
    pub db_path: PathBuf,
    pub memory: MemoryConfig,
    pub briefing: BriefingConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub auto_promote_threshold: u8,
    /// Expiry applied to saves without one. 0 keeps memories forever.
    pub default_ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BriefingConfig {
    pub max_channel_memories: usize,
    pub max_global_knowledge: usize,
    pub max_work_items: usize,
    pub min_importance: u8,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
    pub enable_wal: bool,
    pub vacuum_on_startup: bool,
}

impl Default for ParallelSessionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 5,
            isolation: IsolationMode::PerChat,
            idle_timeout_ms: 30 * 60 * 1000,
            maintenance_interval_ms: 60 * 1000,
            db_path: PathBuf::from("data/parallel-sessions.db"),
            memory: MemoryConfig::default(),
            briefing: BriefingConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            auto_promote_threshold: DEFAULT_AUTO_PROMOTE_THRESHOLD,
            default_ttl_ms: 0,
        }
    }
}

impl Default for BriefingConfig {
    fn default() -> Self {
        Self {
            max_channel_memories: 10,
            max_global_knowledge: 10,
            max_work_items: 5,
            min_importance: 3,
            min_confidence: 0.5,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            busy_timeout_ms: 5000,
            enable_wal: true,
            vacuum_on_startup: false,
        }
    }
}

impl ParallelSessionsConfig {
    /// Load `.env` if present, then read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup, falling back to defaults for
    /// missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str, default: String| lookup(key).unwrap_or(default);

        let config = Self {
            enabled: parse_var(&get, "PARALLEL_SESSIONS_ENABLED", defaults.enabled)?,
            max_concurrent: parse_var(&get, "PARALLEL_SESSIONS_MAX_CONCURRENT", defaults.max_concurrent)?,
            isolation: parse_var(&get, "PARALLEL_SESSIONS_ISOLATION", defaults.isolation)?,
            idle_timeout_ms: parse_var(&get, "PARALLEL_SESSIONS_IDLE_TIMEOUT_MS", defaults.idle_timeout_ms)?,
            maintenance_interval_ms: parse_var(
                &get,
                "PARALLEL_SESSIONS_MAINTENANCE_INTERVAL_MS",
                defaults.maintenance_interval_ms,
            )?,
            db_path: PathBuf::from(get(
                "PARALLEL_SESSIONS_DB_PATH",
                defaults.db_path.to_string_lossy().into_owned(),
            )),
            memory: MemoryConfig {
                auto_promote_threshold: parse_var(
                    &get,
                    "MEMORY_AUTO_PROMOTE_THRESHOLD",
                    defaults.memory.auto_promote_threshold,
                )?,
                default_ttl_ms: parse_var(&get, "MEMORY_DEFAULT_TTL_MS", defaults.memory.default_ttl_ms)?,
            },
            briefing: BriefingConfig {
                max_channel_memories: parse_var(
                    &get,
                    "BRIEFING_MAX_CHANNEL_MEMORIES",
                    defaults.briefing.max_channel_memories,
                )?,
                max_global_knowledge: parse_var(
                    &get,
                    "BRIEFING_MAX_GLOBAL_KNOWLEDGE",
                    defaults.briefing.max_global_knowledge,
                )?,
                max_work_items: parse_var(&get, "BRIEFING_MAX_WORK_ITEMS", defaults.briefing.max_work_items)?,
                min_importance: parse_var(&get, "BRIEFING_MIN_IMPORTANCE", defaults.briefing.min_importance)?,
                min_confidence: parse_var(&get, "BRIEFING_MIN_CONFIDENCE", defaults.briefing.min_confidence)?,
            },
            store: StoreConfig {
                pool_size: parse_var(&get, "STORE_POOL_SIZE", defaults.store.pool_size)?,
                busy_timeout_ms: parse_var(&get, "STORE_BUSY_TIMEOUT_MS", defaults.store.busy_timeout_ms)?,
                enable_wal: parse_var(&get, "STORE_ENABLE_WAL", defaults.store.enable_wal)?,
                vacuum_on_startup: parse_var(&get, "STORE_VACUUM_ON_STARTUP", defaults.store.vacuum_on_startup)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if self.memory.auto_promote_threshold > MAX_IMPORTANCE {
            bail!(
                "memory.auto_promote_threshold must be within 0-{}, got {}",
                MAX_IMPORTANCE,
                self.memory.auto_promote_threshold
            );
        }
        if self.briefing.min_importance > MAX_IMPORTANCE {
            bail!(
                "briefing.min_importance must be within 0-{}, got {}",
                MAX_IMPORTANCE,
                self.briefing.min_importance
            );
        }
        if !(0.0..=1.0).contains(&self.briefing.min_confidence) {
            bail!(
                "briefing.min_confidence must be within 0.0-1.0, got {}",
                self.briefing.min_confidence
            );
        }
        if self.maintenance_interval_ms == 0 {
            bail!("maintenance_interval_ms must be positive");
        }
        if self.store.pool_size == 0 {
            bail!("store.pool_size must be at least 1");
        }
        Ok(())
    }

    /// Store settings for [`crate::SharedMemoryBackend`].
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            db_path: Some(self.db_path.clone()),
            pool_size: self.store.pool_size,
            busy_timeout_ms: self.store.busy_timeout_ms,
            enable_wal: self.store.enable_wal,
            vacuum_on_startup: self.store.vacuum_on_startup,
            auto_promote_threshold: self.memory.auto_promote_threshold,
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Enabled: {}", self.enabled);
        info!("- Max Concurrent Sessions: {}", self.max_concurrent);
        info!("- Isolation: {}", self.isolation);
        info!("- Idle Timeout: {}ms", self.idle_timeout_ms);
        info!("- Maintenance Interval: {}ms", self.maintenance_interval_ms);
        info!("- Database: {}", self.db_path.display());
        info!("- Auto-promote Threshold: {}", self.memory.auto_promote_threshold);
        info!("- Default Memory TTL: {}ms", self.memory.default_ttl_ms);
        info!(
            "- Briefing Limits: {} channel, {} global, {} work (min importance {}, min confidence {:.2})",
            self.briefing.max_channel_memories,
            self.briefing.max_global_knowledge,
            self.briefing.max_work_items,
            self.briefing.min_importance,
            self.briefing.min_confidence
        );
        info!(
            "- Store: pool {}, busy timeout {}ms, WAL {}",
            self.store.pool_size, self.store.busy_timeout_ms, self.store.enable_wal
        );
    }
}

fn parse_var<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr + ToString,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str, String) -> String,
{
    let raw = get(key, default.to_string());
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value for {}: {:?}", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ParallelSessionsConfig::default();
        config.validate().unwrap();
        assert_eq!(config.memory.auto_promote_threshold, 8);
        assert_eq!(config.memory.default_ttl_ms, 0);
        assert!(config.max_concurrent >= 1);
    }

    #[test]
    fn test_empty_environment_yields_defaults() {
        let config = ParallelSessionsConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, ParallelSessionsConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = ParallelSessionsConfig::from_lookup(lookup_from(&[
            ("PARALLEL_SESSIONS_MAX_CONCURRENT", "2"),
            ("PARALLEL_SESSIONS_ISOLATION", "per-peer"),
            ("PARALLEL_SESSIONS_ENABLED", "false"),
            ("PARALLEL_SESSIONS_DB_PATH", "/tmp/ps.db"),
            ("MEMORY_AUTO_PROMOTE_THRESHOLD", "6"),
            ("MEMORY_DEFAULT_TTL_MS", "86400000"),
            ("BRIEFING_MIN_CONFIDENCE", "0.75"),
            ("STORE_ENABLE_WAL", "false"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.isolation, IsolationMode::PerPeer);
        assert!(!config.enabled);
        assert_eq!(config.db_path, PathBuf::from("/tmp/ps.db"));
        assert_eq!(config.memory.auto_promote_threshold, 6);
        assert_eq!(config.memory.default_ttl_ms, 86_400_000);
        assert_eq!(config.briefing.min_confidence, 0.75);
        assert!(!config.store.enable_wal);
    }

    #[test]
    fn test_unparseable_value_names_the_variable() {
        let err = ParallelSessionsConfig::from_lookup(lookup_from(&[(
            "PARALLEL_SESSIONS_MAX_CONCURRENT",
            "many",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("PARALLEL_SESSIONS_MAX_CONCURRENT"));
    }

    #[test]
    fn test_zero_max_concurrent_is_rejected() {
        let result = ParallelSessionsConfig::from_lookup(lookup_from(&[(
            "PARALLEL_SESSIONS_MAX_CONCURRENT",
            "0",
        )]));
        assert!(result.is_err());
    }

    #[test]
    fn test_threshold_above_ten_is_rejected() {
        let mut config = ParallelSessionsConfig::default();
        config.memory.auto_promote_threshold = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confidence_outside_unit_range_is_rejected() {
        let mut config = ParallelSessionsConfig::default();
        config.briefing.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ParallelSessionsConfig = serde_json::from_str(
            r#"{ "max_concurrent": 3, "isolation": "per-channel", "memory": { "default_ttl_ms": 1000 } }"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.isolation, IsolationMode::PerChannel);
        assert_eq!(config.memory.default_ttl_ms, 1000);
        assert_eq!(config.memory.auto_promote_threshold, 8);
        assert_eq!(config.briefing, BriefingConfig::default());
    }

    #[test]
    fn test_backend_config_carries_store_settings() {
        let mut config = ParallelSessionsConfig::default();
        config.store.pool_size = 7;
        config.memory.auto_promote_threshold = 9;
        let backend = config.backend_config();
        assert_eq!(backend.pool_size, 7);
        assert_eq!(backend.auto_promote_threshold, 9);
        assert_eq!(backend.db_path, Some(config.db_path.clone()));
    }
}
