//! Home directory resolution for fleetbeat
//!
//! # Precedence
//!
//! 1. `FLEETBEAT_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` platform default
//!
//! Tests and containerized deployments set `FLEETBEAT_HOME` so the global
//! config file and the default database land in a controlled directory.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Get the home directory for fleetbeat operations
///
/// # Errors
///
/// Returns an error if `FLEETBEAT_HOME` is unset (or blank) and the platform
/// home directory cannot be determined.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("FLEETBEAT_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir().context("Could not determine home directory")
}

/// Directory holding the global config file and the default database.
pub fn config_dir(home: &std::path::Path) -> PathBuf {
    home.join(".config/fleetbeat")
}
