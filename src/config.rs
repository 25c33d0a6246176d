use std::path::PathBuf;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::coordinator::{DEFAULT_BACKUP_THRESHOLD, ExecutionOptions};
use crate::logging::LogConfig;

pub const CONFIG_FILE: &str = "ferry.toml";

/// Runtime settings.
///
/// Layered lowest to highest: built-in defaults, `ferry.toml` in the working
/// directory, `FERRY_*` environment variables, then command line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub parallelism: usize,
    /// Files at least this many bytes are teed into the backup cache.
    pub backup_threshold: u64,
    pub cache_dir: Option<PathBuf>,
    pub keep_backups: bool,
    pub rename_conflicts: bool,
    pub json_logs: bool,
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            backup_threshold: DEFAULT_BACKUP_THRESHOLD,
            cache_dir: None,
            keep_backups: false,
            rename_conflicts: true,
            json_logs: false,
            verbose: false,
        }
    }
}

impl AppConfig {
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self, figment::Error> {
        Self::from_figment(Self::figment(overrides))
    }

    pub fn figment<T: Serialize>(overrides: Option<&T>) -> Figment {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed("FERRY_"));
        match overrides {
            Some(args) => figment.merge(Serialized::defaults(args)),
            None => figment,
        }
    }

    pub fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        let mut config: AppConfig = figment.extract()?;
        config.parallelism = config.parallelism.max(1);
        Ok(config)
    }

    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            parallelism: self.parallelism,
            backup_threshold: self.backup_threshold,
            cache_dir: self.cache_dir.clone(),
            keep_backups: self.keep_backups,
            rename_conflicts: self.rename_conflicts,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            json: self.json_logs,
            verbose: self.verbose,
        }
    }
}
