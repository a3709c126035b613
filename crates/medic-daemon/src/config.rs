//! Daemon configuration
//!
//! Loaded from a TOML file, then overridden from the environment, then
//! validated. Every field has a default, so running without a file is
//! valid. Secrets are never read from the file.

use crate::error::ConfigError;
use crate::logging;
use medic_backends::{ClassifierSettings, FactorySettings, NotificationSettings};
use medic_core::{ReconcileConfig, UnrecoverableRule, DEFAULT_UNRECOVERABLE_MARKER};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Comma-separated allow-list override
pub const PIPELINES_ENV: &str = "MEDIC_PIPELINES";
/// Database path override
pub const DATABASE_ENV: &str = "MEDIC_DATABASE";

const HOUR: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MedicConfig {
    pub poll_interval_secs: u64,
    pub fetch_window_hours: u64,
    pub initial_budget: i64,
    /// Monitored pipelines; empty means all
    pub pipelines: Vec<String>,
    pub database_path: PathBuf,
    pub call_timeout_secs: u64,
    pub ledger_retention_hours: u64,
    pub notify_on_rerun: bool,
    pub unrecoverable_markers: Vec<String>,
    pub log: LogConfig,
    pub factory: Option<FactorySettings>,
    pub classifier: Option<ClassifierSettings>,
    pub notification: NotificationSettings,
}

impl Default for MedicConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 120,
            fetch_window_hours: 2,
            initial_budget: medic_core::DEFAULT_INITIAL_BUDGET,
            pipelines: Vec::new(),
            database_path: PathBuf::from("pipeline_monitor.db"),
            call_timeout_secs: 60,
            ledger_retention_hours: 24,
            notify_on_rerun: false,
            unrecoverable_markers: vec![DEFAULT_UNRECOVERABLE_MARKER.to_string()],
            log: LogConfig::default(),
            factory: None,
            classifier: None,
            notification: NotificationSettings::default(),
        }
    }
}

impl MedicConfig {
    /// Load from `path` (defaults when `None`), apply env overrides, validate
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content =
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|source| ConfigError::Io {
                            path: path.to_path_buf(),
                            source,
                        })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse without overrides or validation
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `MEDIC_PIPELINES` / `MEDIC_DATABASE` through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(pipelines) = lookup(PIPELINES_ENV) {
            self.pipelines = pipelines
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(path) = lookup(DATABASE_ENV).filter(|p| !p.trim().is_empty()) {
            self.database_path = PathBuf::from(path);
        }
    }

    /// Reject values the loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.poll_interval_secs == 0 {
            errors.push("poll_interval_secs must be greater than 0".to_string());
        }
        if self.fetch_window_hours == 0 {
            errors.push("fetch_window_hours must be greater than 0".to_string());
        }
        if self.initial_budget < 1 {
            errors.push("initial_budget must be at least 1".to_string());
        }
        if self.call_timeout_secs == 0 {
            errors.push("call_timeout_secs must be greater than 0".to_string());
        }
        if self.ledger_retention_hours <= self.fetch_window_hours {
            errors.push(
                "ledger_retention_hours must be greater than fetch_window_hours".to_string(),
            );
        }
        if self.database_path.as_os_str().is_empty() {
            errors.push("database_path must not be empty".to_string());
        }
        if let Err(e) = logging::filter_for(&self.log.level) {
            errors.push(format!("log.level: {e}"));
        }
        if let Some(factory) = &self.factory {
            for field in factory.missing_fields() {
                errors.push(format!("factory.{field} must not be empty"));
            }
        }
        if let Some(classifier) = &self.classifier {
            if classifier.endpoint.trim().is_empty() {
                errors.push("classifier.endpoint must not be empty".to_string());
            }
            if classifier.model.trim().is_empty() {
                errors.push("classifier.model must not be empty".to_string());
            }
            if classifier.max_tokens == 0 {
                errors.push("classifier.max_tokens must be greater than 0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Tunables handed to the reconciler
    #[must_use]
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            initial_budget: self.initial_budget,
            fetch_window: Duration::from_secs(self.fetch_window_hours * HOUR),
            call_timeout: self.call_timeout(),
            ledger_retention: Duration::from_secs(self.ledger_retention_hours * HOUR),
            pipelines: self.pipelines.iter().cloned().collect(),
            unrecoverable: UnrecoverableRule::new(&self.unrecoverable_markers),
            notify_on_rerun: self.notify_on_rerun,
        }
    }
}
