//! # Tether Configuration
//!
//! Configuration for the store, the fetch transport and the work queue.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TETHER_DB_PATH=/var/lib/app/tether.db                              │
//! │     TETHER_BASE_URL=https://api.example.com/v1/                        │
//! │     TETHER_USER_AGENT=my-app/2.0                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tether/tether.toml (Linux)                               │
//! │     ~/Library/Application Support/dev.tether.tether/tether.toml (macOS)│
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [store]
//! path = "/var/lib/app/tether.db"   # ":memory:" for a throwaway store
//! max_connections = 4
//! connect_timeout_secs = 30
//!
//! [fetch]
//! base_url = "https://api.example.com/v1/"
//! user_agent = "tether/0.1"
//! # timeout_secs unset = no timeout
//!
//! [queue]
//! name = "tether"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use tether_db::DbConfig;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Store Settings
// =============================================================================

/// Where and how the local store is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Database file. `None` uses the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection acquire timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            path: None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// =============================================================================
// Fetch Settings
// =============================================================================

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Relative request URLs are joined onto this.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout (seconds). Unset means a hung request stalls its
    /// work item and everything queued behind it.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_user_agent() -> String {
    format!("tether/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for FetchSettings {
    fn default() -> Self {
        FetchSettings {
            base_url: None,
            user_agent: default_user_agent(),
            timeout_secs: None,
        }
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Name recorded on the queue's log lines.
    #[serde(default = "default_queue_name")]
    pub name: String,
}

fn default_queue_name() -> String {
    "tether".to_string()
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            name: default_queue_name(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete tether configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub fetch: FetchSettings,

    #[serde(default)]
    pub queue: QueueSettings,
}

impl TetherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config for an isolated in-memory store. Used by tests and the CLI's `--db :memory:`.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.store.path = Some(PathBuf::from(tether_db::pool::MEMORY_PATH));
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tether.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading tether config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load tether config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file, creating parent directories.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Tether config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(ref base) = self.fetch.base_url {
            let parsed = url::Url::parse(base)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "Base URL must start with http:// or https://, got: {}",
                    base
                )));
            }
        }

        if self.store.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.queue.name.trim().is_empty() {
            return Err(SyncError::InvalidConfig("queue name must not be empty".into()));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("TETHER_DB_PATH") {
            debug!(path = %path, "Overriding store path from environment");
            self.store.path = Some(PathBuf::from(path));
        }

        if let Some(url) = lookup("TETHER_BASE_URL") {
            debug!(url = %url, "Overriding base URL from environment");
            self.fetch.base_url = Some(url);
        }

        if let Some(agent) = lookup("TETHER_USER_AGENT") {
            self.fetch.user_agent = agent;
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("dev", "tether", "tether")
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("tether.toml"))
    }

    /// Returns the default database path.
    fn default_database_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().join("tether.db"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Builds the store configuration.
    pub fn db_config(&self) -> SyncResult<DbConfig> {
        let path = self
            .store
            .path
            .clone()
            .or_else(Self::default_database_path)
            .ok_or_else(|| SyncError::InvalidConfig("No database path available".into()))?;

        let config = if path.as_os_str() == tether_db::pool::MEMORY_PATH {
            DbConfig::in_memory()
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            DbConfig::new(path)
                .max_connections(self.store.max_connections)
                .connect_timeout(Duration::from_secs(self.store.connect_timeout_secs))
        };

        Ok(config)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.fetch.base_url.as_deref()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.fetch.timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TetherConfig::default();
        assert_eq!(config.store.max_connections, 4);
        assert!(config.fetch.user_agent.starts_with("tether/"));
        assert_eq!(config.fetch.timeout_secs, None);
        assert_eq!(config.queue.name, "tether");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TetherConfig::default();

        config.fetch.base_url = Some("ftp://example.com".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.fetch.base_url = Some("not a url".into());
        assert!(config.validate().is_err());

        config.fetch.base_url = Some("https://api.example.com/v1/".into());
        assert!(config.validate().is_ok());

        config.store.max_connections = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = TetherConfig::default();
        config.apply_overrides(|key| match key {
            "TETHER_DB_PATH" => Some("/tmp/override.db".to_string()),
            "TETHER_BASE_URL" => Some("http://localhost:9000/".to_string()),
            _ => None,
        });

        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/override.db")));
        assert_eq!(config.base_url(), Some("http://localhost:9000/"));
        assert!(config.fetch.user_agent.starts_with("tether/"));
    }

    #[test]
    fn test_in_memory_db_config() {
        let db = TetherConfig::in_memory().db_config().unwrap();
        assert!(db.is_in_memory());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tether.toml");

        let mut config = TetherConfig::default();
        config.fetch.timeout_secs = Some(15);
        config.queue.name = "articles".into();
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[fetch]"));
        assert!(contents.contains("[queue]"));

        let loaded: TetherConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.request_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(loaded.queue.name, "articles");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: TetherConfig = toml::from_str("[fetch]\nbase_url = \"https://x.dev/\"\n").unwrap();
        assert_eq!(config.base_url(), Some("https://x.dev/"));
        assert_eq!(config.store.max_connections, 4);
    }
}
