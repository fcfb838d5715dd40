// Engine configuration: layered loading plus hot-swappable runtime tunables

pub mod listener;
pub mod source;
pub mod worker;

use anyhow::Result;
use arc_swap::ArcSwap;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::strategy::CompensationFailurePolicy;

pub use listener::{ConfigChangeListener, EngineConfigListener};
pub use source::ConfigNotifier;
pub use worker::{WorkerPool, WorkerPoolError};

/// Main configuration structure for the saga engine
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Retry tunables applied on top of per-state retry rules
    pub retry: RetryConfig,
    /// Forward/compensate decision policy
    pub policy: PolicyConfig,
    /// Config change listener worker pool
    pub listener: ListenerConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Used when a retry rule does not declare max_attempts
    pub default_max_attempts: u32,
    /// Upper bound for a single backoff interval
    pub max_interval_ms: u64,
    /// Add up to 10% random jitter to retry intervals
    pub jitter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Retry or ignore where the definition allows, otherwise compensate
    Default,
    /// Compensate on any task failure
    AlwaysCompensate,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Strategy selected when the engine is built
    pub strategy: StrategyKind,
    /// Treat every failure as if the business had forced compensation
    pub force_compensation: bool,
    /// How a compensation that itself fails is classified
    pub compensation_failure: CompensationFailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Threads dedicated to applying configuration changes
    pub worker_threads: usize,
    pub thread_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines instead of human readable ones
    pub json_logs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                default_max_attempts: 3,
                max_interval_ms: 60_000, // 1 minute
                jitter: false,
            },
            policy: PolicyConfig {
                strategy: StrategyKind::Default,
                force_compensation: false,
                compensation_failure: CompensationFailurePolicy::Uncompensated,
            },
            listener: ListenerConfig {
                worker_threads: 1,
                thread_name: "saga-config".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (saga-engine.toml, .saga-engine-rc)
    /// 3. Environment variables (prefixed with SAGA_ENGINE__)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("saga-engine.toml").exists() {
            builder = builder.add_source(File::with_name("saga-engine"));
        }

        if Path::new(".saga-engine-rc").exists() {
            builder = builder.add_source(File::new(".saga-engine-rc", FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("SAGA_ENGINE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load from an explicit TOML file layered over the defaults
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path).format(FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse raw TOML text (as delivered by a config source) over the defaults.
    /// Keys absent from the text keep their default values.
    pub fn from_toml_str(raw: &str) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Shared view of the current configuration. Readers always see a complete
/// config; updates replace it atomically.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<ArcSwap<EngineConfig>>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn get(&self) -> Arc<EngineConfig> {
        self.current.load_full()
    }

    pub fn store(&self, config: EngineConfig) {
        self.current.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [retry]
            default_max_attempts = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.default_max_attempts, 7);
        assert_eq!(config.retry.max_interval_ms, 60_000);
        assert_eq!(config.policy.strategy, StrategyKind::Default);
    }

    #[test]
    fn test_policy_enums_parse_from_snake_case() {
        let config = EngineConfig::from_toml_str(
            r#"
            [policy]
            strategy = "always_compensate"
            compensation_failure = "escalate"
            force_compensation = true
            "#,
        )
        .unwrap();

        assert_eq!(config.policy.strategy, StrategyKind::AlwaysCompensate);
        assert_eq!(
            config.policy.compensation_failure,
            CompensationFailurePolicy::Escalate
        );
        assert!(config.policy.force_compensation);
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        assert!(EngineConfig::from_toml_str("[retry\nbroken").is_err());
    }

    #[test]
    fn test_save_and_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");

        let mut config = EngineConfig::default();
        config.listener.worker_threads = 4;
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[observability]\nlog_level = \"debug\"\njson_logs = false").unwrap();

        let loaded = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(loaded.observability.log_level, "debug");
        assert!(!loaded.observability.json_logs);
    }

    #[test]
    fn test_handle_swaps_whole_config() {
        let handle = ConfigHandle::default();
        let before = handle.get();

        let mut next = EngineConfig::default();
        next.retry.default_max_attempts = 9;
        handle.store(next);

        assert_eq!(before.retry.default_max_attempts, 3);
        assert_eq!(handle.get().retry.default_max_attempts, 9);
    }
}
