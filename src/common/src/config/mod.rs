use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Object storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DSN of the bucket holding all tenants' blocks.
    ///
    /// Supported schemes: `file://`, `memory://`, `s3://`.
    ///
    /// Env: TESSERA__STORAGE__DSN
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file:///.data/blocks"),
        }
    }
}

/// Blocks cleaner configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Enable the cleaner service.
    ///
    /// Env: TESSERA__CLEANER__ENABLED
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Local directory for the per-tenant block metadata cache.
    ///
    /// Env: TESSERA__CLEANER__DATA_DIR
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Number of block metadata objects fetched concurrently per tenant.
    ///
    /// Env: TESSERA__CLEANER__META_SYNC_CONCURRENCY
    #[serde(default = "default_meta_sync_concurrency")]
    pub meta_sync_concurrency: usize,

    /// Minimum age a block's deletion mark must reach before the block is
    /// hard-deleted. Partial blocks with a confirmed mark bypass this delay.
    ///
    /// Env: TESSERA__CLEANER__DELETION_DELAY
    #[serde(with = "humantime_serde", default = "default_deletion_delay")]
    pub deletion_delay: Duration,

    /// Interval between cleanup runs. One extra run happens at startup.
    ///
    /// Env: TESSERA__CLEANER__CLEANUP_INTERVAL
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,

    /// Number of tenants processed concurrently within one run.
    ///
    /// Env: TESSERA__CLEANER__CLEANUP_CONCURRENCY
    #[serde(default = "default_cleanup_concurrency")]
    pub cleanup_concurrency: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_data_dir() -> String {
    String::from(".data/cleaner")
}

fn default_meta_sync_concurrency() -> usize {
    20
}

fn default_deletion_delay() -> Duration {
    Duration::from_secs(12 * 3600)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_cleanup_concurrency() -> usize {
    8
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            data_dir: default_data_dir(),
            meta_sync_concurrency: default_meta_sync_concurrency(),
            deletion_delay: default_deletion_delay(),
            cleanup_interval: default_cleanup_interval(),
            cleanup_concurrency: default_cleanup_concurrency(),
        }
    }
}

impl CleanerConfig {
    /// Validate the cleaner configuration.
    ///
    /// Checks:
    /// - Deletion delay and cleanup interval are positive
    /// - Concurrency limits are at least 1
    pub fn validate(&self) -> Result<(), CleanerConfigError> {
        let zero = Duration::from_secs(0);

        if self.deletion_delay <= zero {
            return Err(CleanerConfigError::InvalidDuration {
                field: "deletion_delay",
                duration: self.deletion_delay,
            });
        }
        if self.cleanup_interval <= zero {
            return Err(CleanerConfigError::InvalidDuration {
                field: "cleanup_interval",
                duration: self.cleanup_interval,
            });
        }

        if self.meta_sync_concurrency == 0 {
            return Err(CleanerConfigError::InvalidConcurrency {
                field: "meta_sync_concurrency",
            });
        }
        if self.cleanup_concurrency == 0 {
            return Err(CleanerConfigError::InvalidConcurrency {
                field: "cleanup_concurrency",
            });
        }

        Ok(())
    }
}

/// Errors that can occur during cleaner configuration validation.
#[derive(Error, Debug)]
pub enum CleanerConfigError {
    #[error("invalid {field}: {duration:?} must be positive")]
    InvalidDuration {
        field: &'static str,
        duration: Duration,
    },

    #[error("invalid {field}: must be at least 1")]
    InvalidConcurrency { field: &'static str },
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Object storage holding the block store.
    pub storage: StorageConfig,
    /// Blocks cleaner service configuration.
    pub cleaner: CleanerConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(std::path::Path::new("tessera.toml"))
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TESSERA__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
