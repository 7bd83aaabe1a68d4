//! Stack configuration and test-environment detection.
//!
//! # Responsibility
//! - Describe how a stack locates its model and backing store.
//! - Carry the test-mode switch explicitly instead of reading global state.
//!
//! # Invariants
//! - `model_name` is a valid model name.
//! - `store_name` never contains path separators.
//! - `is_test_environment()` is computed once per process and only takes
//!   effect when a caller injects it into a config.

use crate::model::schema::is_valid_name;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Extension of the primary store file.
pub const STORE_FILE_EXTENSION: &str = "sqlite";

static TEST_ENVIRONMENT: Lazy<bool> =
    Lazy::new(|| detect_test_environment(|key| std::env::var(key).ok()));

/// Backing store flavor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    InMemory,
    #[default]
    OnDisk,
}

#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    InvalidModelName(String),
    InvalidStoreName(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "invalid stack config: {err}"),
            Self::InvalidModelName(name) => write!(f, "invalid model name `{name}`"),
            Self::InvalidStoreName(name) => write!(f, "invalid store name `{name}`"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

/// Construction parameters of a `DataStack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Identifies the schema resource `<model_name>.model.json`.
    pub model_name: String,
    /// Directory holding the model and an optional seed store.
    /// Defaults to the directory of the running executable.
    #[serde(default)]
    pub bundle_location: Option<PathBuf>,
    #[serde(default)]
    pub store_type: StoreType,
    /// Base name of the store file. Defaults to `model_name`.
    #[serde(default)]
    pub store_name: Option<String>,
    /// Directory of the store file. Defaults to the per-user data directory.
    #[serde(default)]
    pub store_directory: Option<PathBuf>,
    /// Collapses every queue to synchronous execution and skips backup
    /// exclusion.
    #[serde(default)]
    pub test_mode: bool,
}

impl StackConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            bundle_location: None,
            store_type: StoreType::default(),
            store_name: None,
            store_directory: None,
            test_mode: false,
        }
    }

    /// Parses and validates a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_bundle_location(mut self, bundle: impl Into<PathBuf>) -> Self {
        self.bundle_location = Some(bundle.into());
        self
    }

    pub fn with_store_type(mut self, store_type: StoreType) -> Self {
        self.store_type = store_type;
        self
    }

    pub fn with_store_name(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = Some(store_name.into());
        self
    }

    pub fn with_store_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.store_directory = Some(directory.into());
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Applies the process-wide test-environment detection result.
    pub fn with_detected_test_mode(self) -> Self {
        self.with_test_mode(is_test_environment())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_name(&self.model_name) {
            return Err(ConfigError::InvalidModelName(self.model_name.clone()));
        }
        if let Some(store_name) = &self.store_name {
            let trimmed = store_name.trim();
            if trimmed.is_empty()
                || trimmed.contains(['/', '\\'])
                || trimmed == "."
                || trimmed == ".."
            {
                return Err(ConfigError::InvalidStoreName(store_name.clone()));
            }
        }
        Ok(())
    }

    /// Base name used for the store file and its side files.
    pub fn effective_store_name(&self) -> &str {
        self.store_name.as_deref().unwrap_or(&self.model_name)
    }

    /// File name of the primary store file, e.g. `Model.sqlite`.
    pub fn store_file_name(&self) -> String {
        format!("{}.{STORE_FILE_EXTENSION}", self.effective_store_name())
    }
}

/// Returns whether this process looks like a test run.
///
/// Indicators: a test-runner service name ending in `xctest`, an injected
/// test bundle, or a truthy `CI` variable.
pub fn is_test_environment() -> bool {
    *TEST_ENVIRONMENT
}

fn detect_test_environment<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let runner_service = lookup("XPC_SERVICE_NAME")
        .map(|value| value.ends_with("xctest"))
        .unwrap_or(false);
    let injected_bundle = lookup("XCInjectBundleInto").is_some();
    let ci = lookup("CI")
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            !value.is_empty() && value != "0" && value != "false"
        })
        .unwrap_or(false);

    runner_service || injected_bundle || ci
}
