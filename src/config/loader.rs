//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`TunerConfig`], and run
//! validation before returning.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::TunerConfig;

/// Load a [`TunerConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(TunerConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_file(path: &Path) -> Result<TunerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`TunerConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<TunerConfig, ConfigError> {
    let config: TunerConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to [`TunerConfig::default`].
///
/// A file that exists but fails to parse or validate is still an error;
/// only a missing file selects the defaults.
///
/// # Panics
///
/// This function never panics.
pub fn load_or_default(path: &Path) -> Result<TunerConfig, ConfigError> {
    if path.exists() {
        load_from_file(path)
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Ok(TunerConfig::default())
    }
}
