//! Store configuration.
//!
//! # Responsibility
//! - Describe where a store finds its model definition and data file.
//! - Load the same settings from process environment.
//!
//! # Invariants
//! - `model_name` is a valid model identifier; it names both the model
//!   definition file and the store file.
//! - Paths are used as given; nothing here touches the filesystem.

use crate::model::schema::is_valid_name;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_MODEL_DIR: &str = "TIDESTORE_MODEL_DIR";
pub const ENV_DATA_DIR: &str = "TIDESTORE_DATA_DIR";
pub const ENV_FILE_PROTECTION: &str = "TIDESTORE_FILE_PROTECTION";
pub const ENV_BUSY_TIMEOUT_MS: &str = "TIDESTORE_BUSY_TIMEOUT_MS";

const MODEL_FILE_SUFFIX: &str = "model.json";
const STORE_FILE_SUFFIX: &str = "sqlite";
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// At-rest protection applied to the store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileProtection {
    /// Owner-only access; the file is unreadable to other users.
    Complete,
    /// Leave permissions as created by the process umask.
    None,
}

impl FileProtection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "complete" => Some(Self::Complete),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Settings needed to open one persistent store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub model_name: String,
    /// Directory holding `<model_name>.model.json`.
    pub model_dir: PathBuf,
    /// Process-owned directory holding `<model_name>.sqlite`.
    pub data_dir: PathBuf,
    pub file_protection: FileProtection,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(
        model_name: impl Into<String>,
        model_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            model_dir: model_dir.into(),
            data_dir: data_dir.into(),
            file_protection: FileProtection::Complete,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Builds a config from `TIDESTORE_*` environment variables.
    ///
    /// # Errors
    /// - `MissingVar` when the model or data directory is not set.
    /// - `InvalidValue` when an optional variable cannot be parsed.
    /// - `InvalidModelName` when `model_name` fails validation.
    pub fn from_env(model_name: impl Into<String>) -> Result<Self, ConfigError> {
        let model_dir = required_var(ENV_MODEL_DIR)?;
        let data_dir = required_var(ENV_DATA_DIR)?;
        let mut config = Self::new(model_name, model_dir, data_dir);

        if let Ok(value) = std::env::var(ENV_FILE_PROTECTION) {
            config.file_protection =
                FileProtection::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                    var: ENV_FILE_PROTECTION,
                    value: value.clone(),
                })?;
        }

        if let Ok(value) = std::env::var(ENV_BUSY_TIMEOUT_MS) {
            let millis = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: ENV_BUSY_TIMEOUT_MS,
                    value: value.clone(),
                })?;
            config.busy_timeout = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_file_protection(mut self, protection: FileProtection) -> Self {
        self.file_protection = protection;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_name(&self.model_name) {
            return Err(ConfigError::InvalidModelName(self.model_name.clone()));
        }
        Ok(())
    }

    /// Location of the model definition file.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir
            .join(format!("{}.{MODEL_FILE_SUFFIX}", self.model_name))
    }

    /// Location of the SQLite store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}.{STORE_FILE_SUFFIX}", self.model_name))
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingVar(&'static str),
    InvalidValue { var: &'static str, value: String },
    InvalidModelName(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingVar(name) => write!(f, "environment variable `{name}` is not set"),
            Self::InvalidValue { var, value } => {
                write!(f, "environment variable `{var}` has invalid value `{value}`")
            }
            Self::InvalidModelName(name) => write!(f, "invalid model name `{name}`"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::{
        ConfigError, FileProtection, StoreConfig, ENV_BUSY_TIMEOUT_MS, ENV_DATA_DIR,
        ENV_FILE_PROTECTION, ENV_MODEL_DIR,
    };
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn derived_paths_use_model_name() {
        let config = StoreConfig::new("Accounts", "/models", "/data");
        assert_eq!(
            config.model_path(),
            PathBuf::from("/models/Accounts.model.json")
        );
        assert_eq!(config.store_path(), PathBuf::from("/data/Accounts.sqlite"));
        assert_eq!(config.file_protection, FileProtection::Complete);
    }

    #[test]
    fn validate_rejects_path_like_model_names() {
        let config = StoreConfig::new("../escape", "/models", "/data");
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidModelName("../escape".to_string()))
        );
    }

    #[test]
    fn file_protection_parse_is_case_insensitive() {
        assert_eq!(
            FileProtection::parse(" Complete "),
            Some(FileProtection::Complete)
        );
        assert_eq!(FileProtection::parse("none"), Some(FileProtection::None));
        assert_eq!(FileProtection::parse("partial"), None);
    }

    // All env cases live in one test; env vars are process-global.
    #[test]
    fn from_env_reads_required_and_optional_vars() {
        std::env::remove_var(ENV_MODEL_DIR);
        std::env::remove_var(ENV_DATA_DIR);
        assert_eq!(
            StoreConfig::from_env("Accounts"),
            Err(ConfigError::MissingVar(ENV_MODEL_DIR))
        );

        std::env::set_var(ENV_MODEL_DIR, "/models");
        std::env::set_var(ENV_DATA_DIR, "/data");
        std::env::set_var(ENV_FILE_PROTECTION, "none");
        std::env::set_var(ENV_BUSY_TIMEOUT_MS, "250");
        let config = StoreConfig::from_env("Accounts").unwrap();
        assert_eq!(config.file_protection, FileProtection::None);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));

        std::env::set_var(ENV_BUSY_TIMEOUT_MS, "soon");
        assert!(matches!(
            StoreConfig::from_env("Accounts"),
            Err(ConfigError::InvalidValue { var: ENV_BUSY_TIMEOUT_MS, .. })
        ));

        for name in [
            ENV_MODEL_DIR,
            ENV_DATA_DIR,
            ENV_FILE_PROTECTION,
            ENV_BUSY_TIMEOUT_MS,
        ] {
            std::env::remove_var(name);
        }
    }
}
