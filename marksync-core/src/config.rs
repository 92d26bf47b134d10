//! Process-wide configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.marksync/
//!   config.yaml      (mode 0600, written by `marksync init`)
//!   marksync.db      (default SQLite change log)
//!   run/control.sock (server control socket)
//! ```
//!
//! # API pattern
//!
//! Filesystem functions take an explicit `home` (`fn_at(home: &Path, …)`) so
//! tests can point them at a `TempDir`. [`home`] resolves the real one.
//!
//! Configuration is loaded once at startup and shared read-only afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::kinds::KindClasses;

pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_DATABASE: &str = "marksync.db";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:5042";
pub const DEFAULT_PROTOCOL: &str = "annotations";

// ---------------------------------------------------------------------------
// 1. Config types
// ---------------------------------------------------------------------------

/// Root of `config.yaml`. Every section and field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Connection parameters of the embedded SQLite change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file. Relative paths resolve against `~/.marksync/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: None,
            max_connections: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Listener, protocol handler and session tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Protocol handler id, resolved once at startup.
    pub protocol: String,
    /// Per-record send + acknowledgment deadline during catch-up.
    pub catchup_ack_timeout_ms: u64,
    /// Frames buffered per session before the oldest is dropped.
    pub relay_queue_capacity: usize,
    /// Kind codes that supersede each other at one address.
    pub exclusive_kind_groups: KindClasses,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            catchup_ack_timeout_ms: 10_000,
            relay_queue_capacity: 256,
            exclusive_kind_groups: KindClasses::default(),
        }
    }
}

impl ServerConfig {
    pub fn catchup_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.catchup_ack_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.relay_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.relay_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.server.catchup_ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.catchup_ack_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.storage.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_connections must be at least 1".to_string(),
            ));
        }
        self.server.exclusive_kind_groups.validate()
    }

    /// Absolute database path for this home.
    pub fn database_path(&self, home: &Path) -> PathBuf {
        match &self.storage.database {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => marksync_root(home).join(path),
            None => marksync_root(home).join(DEFAULT_DATABASE),
        }
    }
}

// ---------------------------------------------------------------------------
// 2. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.marksync/`
pub fn marksync_root(home: &Path) -> PathBuf {
    home.join(".marksync")
}

/// `<home>/.marksync/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    marksync_root(home).join(CONFIG_FILE)
}

/// `<home>/.marksync/`, created with mode `0700` if absent.
pub fn ensure_root_at(home: &Path) -> Result<PathBuf, ConfigError> {
    let dir = marksync_root(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load `<home>/.marksync/config.yaml`.
///
/// Returns defaults if the file does not exist,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save `config` to `<home>/.marksync/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &Config) -> Result<(), ConfigError> {
    config.validate()?;
    ensure_root_at(home)?;
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 5. Init
// ---------------------------------------------------------------------------

/// Write the default config if none exists; return the effective config.
///
/// Idempotent: an existing file is loaded and returned unchanged.
pub fn init_at(home: &Path) -> Result<Config, ConfigError> {
    if config_path_at(home).exists() {
        return load_at(home);
    }
    let config = Config::default();
    save_at(home, &config)?;
    Ok(config)
}

/// Home directory of the current user.
pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
