//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/folio/config.toml)
//! 3. Environment variables (FOLIO_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable prefix
const ENV_PREFIX: &str = "FOLIO";

const DEFAULT_IMPORT_BATCH_SIZE: usize = 50;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Directory holding the SQLite store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Chapters per transaction when importing a session
    #[serde(default = "default_import_batch_size")]
    pub import_batch_size: usize,

    /// How long a write waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Write CLI logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            import_batch_size: DEFAULT_IMPORT_BATCH_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (FOLIO_DATA_DIR, FOLIO_IMPORT_BATCH_SIZE,
    ///    FOLIO_BUSY_TIMEOUT_MS, FOLIO_LOG_FILE)
    /// 2. Config file (~/.config/folio/config.toml or FOLIO_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at a specific data directory (tests, tools)
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // FOLIO_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // FOLIO_IMPORT_BATCH_SIZE
        if let Ok(val) = std::env::var(format!("{}_IMPORT_BATCH_SIZE", ENV_PREFIX)) {
            match val.parse() {
                Ok(n) => self.import_batch_size = n,
                Err(_) => warn!(value = %val, "Ignoring invalid FOLIO_IMPORT_BATCH_SIZE"),
            }
        }

        // FOLIO_BUSY_TIMEOUT_MS
        if let Ok(val) = std::env::var(format!("{}_BUSY_TIMEOUT_MS", ENV_PREFIX)) {
            match val.parse() {
                Ok(n) => self.busy_timeout_ms = n,
                Err(_) => warn!(value = %val, "Ignoring invalid FOLIO_BUSY_TIMEOUT_MS"),
            }
        }

        // FOLIO_LOG_FILE (empty clears it)
        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    fn validate(&self) -> Result<()> {
        if self.import_batch_size == 0 {
            bail!("import_batch_size must be at least 1");
        }
        Ok(())
    }

    /// Set a single field from its config-file key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "import_batch_size" => {
                self.import_batch_size = value
                    .parse()
                    .with_context(|| format!("Invalid import_batch_size: {}", value))?
            }
            "busy_timeout_ms" => {
                self.busy_timeout_ms = value
                    .parse()
                    .with_context(|| format!("Invalid busy_timeout_ms: {}", value))?
            }
            "log_file" => {
                self.log_file = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            other => bail!("Unknown config key: {}", other),
        }
        self.validate()
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with FOLIO_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("folio")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("folio.db")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("folio")
}

fn default_import_batch_size() -> usize {
    DEFAULT_IMPORT_BATCH_SIZE
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "FOLIO_DATA_DIR",
        "FOLIO_IMPORT_BATCH_SIZE",
        "FOLIO_BUSY_TIMEOUT_MS",
        "FOLIO_LOG_FILE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.import_batch_size, 50);
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert!(config.log_file.is_none());
        assert!(config.data_dir.ends_with("folio"));
    }

    #[test]
    fn test_sqlite_path() {
        let config = Config::with_data_dir("/srv/folio");
        assert_eq!(config.sqlite_path(), PathBuf::from("/srv/folio/folio.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("FOLIO_DATA_DIR", "/tmp/folio-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/folio-test"));
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("FOLIO_IMPORT_BATCH_SIZE", "10");
        env::set_var("FOLIO_BUSY_TIMEOUT_MS", "250");
        config.apply_env_overrides();
        assert_eq!(config.import_batch_size, 10);
        assert_eq!(config.busy_timeout_ms, 250);

        // Unparseable values leave the current setting alone
        env::set_var("FOLIO_IMPORT_BATCH_SIZE", "lots");
        config.apply_env_overrides();
        assert_eq!(config.import_batch_size, 10);
    }

    #[test]
    fn test_env_override_log_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("FOLIO_LOG_FILE", "/var/log/folio.log");
        config.apply_env_overrides();
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/folio.log")));

        // Empty string clears it
        env::set_var("FOLIO_LOG_FILE", "");
        config.apply_env_overrides();
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/folio"),
            import_batch_size: 25,
            busy_timeout_ms: 1_000,
            log_file: Some(PathBuf::from("/tmp/folio.log")),
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("import_batch_size"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            import_batch_size = 5
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.import_batch_size, 5);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let _guard = EnvGuard::new(ENV_VARS);
        assert!(Config::load_from_str("import_batch_size = 0").is_err());
    }

    #[test]
    fn test_set_by_key() {
        let mut config = Config::default();
        config.set("busy_timeout_ms", "42").unwrap();
        config.set("log_file", "").unwrap();
        assert_eq!(config.busy_timeout_ms, 42);
        assert!(config.set("import_batch_size", "x").is_err());
        assert!(config.set("sync_url", "ws://x").is_err());
    }

    #[test]
    fn test_save_and_load_path() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::with_data_dir(dir.path().join("data"));
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }
}
