//! Configuration discovery and resolution

use super::types::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Explicit config file does not exist
    #[error("Configuration not found: {0}")]
    NotFound(PathBuf),
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Path to config file override
    pub config_path: Option<PathBuf>,
    /// Override database path
    pub database: Option<PathBuf>,
    /// Override delivery services
    pub services: Option<Vec<String>>,
    /// Override dispatcher executable name
    pub executable: Option<String>,
    /// Override dispatcher service filter
    pub service: Option<String>,
}

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables
/// 3. Explicit config file, else repo-local `.fleetbeat.toml` (current dir up to git root)
/// 4. Global config (~/.config/fleetbeat/config.toml)
/// 5. Defaults
///
/// An explicit config path that does not exist is an error; unreadable
/// discovered files are logged and skipped.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    current_dir: &Path,
    home_dir: &Path,
) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    // 4. Try global config
    let global_config_path = crate::home::config_dir(home_dir).join("config.toml");
    if global_config_path.exists() {
        match load_config_file(&global_config_path) {
            Ok(file_config) => merge_config(&mut config, file_config),
            Err(e) => warn!("Failed to parse global config at {global_config_path:?}: {e}"),
        }
    }

    // 3. Explicit file wins over repo-local discovery
    if let Some(ref explicit) = overrides.config_path {
        if !explicit.exists() {
            return Err(ConfigError::NotFound(explicit.clone()));
        }
        merge_config(&mut config, load_config_file(explicit)?);
    } else if let Some(repo_config) = find_repo_local_config(current_dir) {
        match load_config_file(&repo_config) {
            Ok(file_config) => merge_config(&mut config, file_config),
            Err(e) => warn!("Failed to parse repo config at {repo_config:?}: {e}"),
        }
    }

    // 2. Apply environment variables
    apply_env_overrides(&mut config);

    // 1. Apply command-line overrides
    apply_cli_overrides(&mut config, overrides);

    Ok(config)
}

/// Find repo-local config file
///
/// Searches current directory and parent directories up to git root
fn find_repo_local_config(current_dir: &Path) -> Option<PathBuf> {
    let mut dir = current_dir;

    loop {
        let config_path = dir.join(".fleetbeat.toml");
        if config_path.exists() {
            return Some(config_path);
        }

        if dir.join(".git").exists() {
            break;
        }

        dir = dir.parent()?;
    }

    None
}

/// A parsed config file plus the top-level sections it actually declares
struct FileConfig {
    config: Config,
    sections: toml::Table,
}

/// Load config from a TOML file
fn load_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let sections: toml::Table = toml::from_str(&contents)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(FileConfig { config, sections })
}

/// Merge file config into base config.
///
/// A section present in the file replaces the base section as a whole;
/// sections the file omits keep what earlier sources set.
fn merge_config(base: &mut Config, file: FileConfig) {
    let FileConfig { config, sections } = file;
    if sections.contains_key("store") {
        if config.store.path.is_some() {
            base.store.path = config.store.path;
        }
        base.store.busy_timeout_ms = config.store.busy_timeout_ms;
    }
    if sections.contains_key("outbox") {
        base.outbox = config.outbox;
    }
    if sections.contains_key("heartbeat") {
        base.heartbeat = config.heartbeat;
    }
    if sections.contains_key("dispatcher") {
        base.dispatcher = config.dispatcher;
    }
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut Config) {
    if let Ok(db) = std::env::var("FLEETBEAT_DB") {
        if !db.trim().is_empty() {
            config.store.path = Some(PathBuf::from(db.trim()));
        }
    }

    if let Ok(services) = std::env::var("FLEETBEAT_SERVICES") {
        let parsed = split_services(&services);
        if !parsed.is_empty() {
            config.outbox.services = parsed;
        }
    }

    if let Ok(raw) = std::env::var("FLEETBEAT_MAX_MESSAGE_LENGTH") {
        match raw.trim().parse::<usize>() {
            Ok(len) if len > 0 => config.outbox.max_message_length = len,
            _ => warn!("Ignoring invalid FLEETBEAT_MAX_MESSAGE_LENGTH={raw:?}"),
        }
    }
}

/// Apply command-line overrides
fn apply_cli_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(ref database) = overrides.database {
        config.store.path = Some(database.clone());
    }

    if let Some(ref services) = overrides.services {
        config.outbox.services = services.clone();
    }

    if let Some(ref executable) = overrides.executable {
        config.dispatcher.executable = executable.clone();
    }

    if let Some(ref service) = overrides.service {
        config.dispatcher.service = Some(service.clone());
    }
}

/// Split a comma-separated service list, dropping blanks
pub(crate) fn split_services(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn clear_env() {
        unsafe {
            env::remove_var("FLEETBEAT_DB");
            env::remove_var("FLEETBEAT_SERVICES");
            env::remove_var("FLEETBEAT_MAX_MESSAGE_LENGTH");
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let overrides = ConfigOverrides::default();

        let config = resolve_config(&overrides, temp_dir.path(), temp_dir.path()).unwrap();

        assert_eq!(config.outbox.services, vec!["activemq", "email"]);
        assert_eq!(config.outbox.max_message_length, 4000);
        assert!(config.store.path.is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let overrides = ConfigOverrides::default();

        unsafe {
            env::set_var("FLEETBEAT_DB", "/tmp/coord.db");
            env::set_var("FLEETBEAT_SERVICES", "influx, elastic,,");
            env::set_var("FLEETBEAT_MAX_MESSAGE_LENGTH", "128");
        }

        let config = resolve_config(&overrides, temp_dir.path(), temp_dir.path()).unwrap();

        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/coord.db")));
        assert_eq!(config.outbox.services, vec!["influx", "elastic"]);
        assert_eq!(config.outbox.max_message_length, 128);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_max_length_env_is_ignored() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        unsafe { env::set_var("FLEETBEAT_MAX_MESSAGE_LENGTH", "zero") };

        let config =
            resolve_config(&ConfigOverrides::default(), temp_dir.path(), temp_dir.path()).unwrap();
        assert_eq!(config.outbox.max_message_length, 4000);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_cli_overrides_beat_env() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        unsafe { env::set_var("FLEETBEAT_DB", "/tmp/env.db") };

        let overrides = ConfigOverrides {
            database: Some(PathBuf::from("/tmp/cli.db")),
            services: Some(vec!["email".to_string()]),
            executable: Some("reaper".to_string()),
            service: Some("email".to_string()),
            config_path: None,
        };

        let config = resolve_config(&overrides, temp_dir.path(), temp_dir.path()).unwrap();

        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/cli.db")));
        assert_eq!(config.outbox.services, vec!["email"]);
        assert_eq!(config.dispatcher.executable, "reaper");
        assert_eq!(config.dispatcher.service.as_deref(), Some("email"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_repo_local_overrides_global() {
        clear_env();
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();

        let global_dir = crate::home::config_dir(home.path());
        std::fs::create_dir_all(&global_dir).unwrap();
        std::fs::write(
            global_dir.join("config.toml"),
            "[outbox]\nservices = [\"influx\"]\nmax_message_length = 10\n",
        )
        .unwrap();

        std::fs::create_dir(repo.path().join(".git")).unwrap();
        std::fs::write(
            repo.path().join(".fleetbeat.toml"),
            "[outbox]\nservices = [\"elastic\"]\n",
        )
        .unwrap();
        let nested = repo.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let config = resolve_config(&ConfigOverrides::default(), &nested, home.path()).unwrap();

        assert_eq!(config.outbox.services, vec!["elastic"]);
        // whole section replaced, so the global length does not leak through
        assert_eq!(config.outbox.max_message_length, 4000);
    }

    #[test]
    #[serial]
    fn test_repo_local_without_section_keeps_global_section() {
        clear_env();
        let home = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();

        let global_dir = crate::home::config_dir(home.path());
        std::fs::create_dir_all(&global_dir).unwrap();
        std::fs::write(
            global_dir.join("config.toml"),
            "[outbox]\nservices = [\"influx\"]\n\n[store]\nbusy_timeout_ms = 250\n",
        )
        .unwrap();

        std::fs::create_dir(repo.path().join(".git")).unwrap();
        std::fs::write(
            repo.path().join(".fleetbeat.toml"),
            "[heartbeat]\nolder_than_secs = 30\n",
        )
        .unwrap();

        let config = resolve_config(&ConfigOverrides::default(), repo.path(), home.path()).unwrap();

        assert_eq!(config.outbox.services, vec!["influx"]);
        assert_eq!(config.store.busy_timeout_ms, 250);
        assert_eq!(config.heartbeat.older_than_secs, 30);
    }

    #[test]
    #[serial]
    fn test_explicit_config_missing_is_error() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let overrides = ConfigOverrides {
            config_path: Some(temp_dir.path().join("missing.toml")),
            ..Default::default()
        };

        let result = resolve_config(&overrides, temp_dir.path(), temp_dir.path());
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    #[serial]
    fn test_malformed_global_config_handled_gracefully() {
        clear_env();
        let home = TempDir::new().unwrap();
        let global_dir = crate::home::config_dir(home.path());
        std::fs::create_dir_all(&global_dir).unwrap();
        std::fs::write(global_dir.join("config.toml"), "invalid toml [[[").unwrap();

        let config =
            resolve_config(&ConfigOverrides::default(), home.path(), home.path()).unwrap();
        assert_eq!(config.outbox.services, vec!["activemq", "email"]);
    }

    #[test]
    fn test_split_services() {
        assert_eq!(split_services("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_services(" , ").is_empty());
    }
}
