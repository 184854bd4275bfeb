//! Service configuration.
//!
//! Values come from an optional TOML file (`NEXUS_STOCK_CONFIG`, default
//! `nexus-stock.toml`) and are then overridden by `NEXUS_STOCK_*`
//! environment variables. Every section has defaults, so an absent file
//! yields a runnable local setup.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::sync::RemoteTarget;

pub const CONFIG_PATH_VAR: &str = "NEXUS_STOCK_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "nexus-stock.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub sync: SyncConfig,
    pub admin: AdminConfig,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Request body cap in bytes.
    pub body_limit: usize,
    /// Bearer keys accepted from peer instances replaying their sync queue.
    pub api_keys: Vec<Zeroizing<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            body_limit: 2 * 1024 * 1024,
            api_keys: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("body_limit", &self.body_limit)
            .field(
                "api_keys",
                &self.api_keys.iter().map(|_| "<redacted>").collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            retention_days: 14,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub remote_url: Option<String>,
    pub api_key: Option<Zeroizing<String>>,
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Synced outbox rows older than this are purged at startup.
    pub retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            api_key: None,
            interval_secs: 30,
            batch_size: 50,
            retention_days: 30,
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("remote_url", &self.remote_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("interval_secs", &self.interval_secs)
            .field("batch_size", &self.batch_size)
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// The remote store, when a URL is configured.
    pub fn remote_target(&self) -> Option<RemoteTarget> {
        let url = self.remote_url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        let key = self
            .api_key
            .as_ref()
            .map(|k| k.as_str().to_string())
            .unwrap_or_default();
        Some(RemoteTarget::new(url, key))
    }
}

/// Seed account created on first start when the users table is empty.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub email: String,
    pub full_name: String,
    pub password: Option<Zeroizing<String>>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            email: "admin@nexus-stock.local".into(),
            full_name: "Administrator".into(),
            password: None,
        }
    }
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("email", &self.email)
            .field("full_name", &self.full_name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Load from the file named by `NEXUS_STOCK_CONFIG` and the process
    /// environment.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let explicit = std::env::var_os(CONFIG_PATH_VAR).is_some();
        let mut config = Self::from_file(Path::new(&path), explicit)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// A missing file is only an error when it was asked for explicitly.
    fn from_file(path: &Path, required: bool) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read config file {}", path.display())),
        }
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(bind) = var("NEXUS_STOCK_BIND") {
            self.server.bind = bind;
        }
        if let Some(keys) = var("NEXUS_STOCK_API_KEYS") {
            self.server.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| Zeroizing::new(k.to_string()))
                .collect();
        }
        if let Some(dir) = var("NEXUS_STOCK_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("NEXUS_STOCK_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(dir);
        }
        if let Some(url) = var("NEXUS_STOCK_REMOTE_URL") {
            self.sync.remote_url = Some(url);
        }
        if let Some(key) = var("NEXUS_STOCK_REMOTE_API_KEY") {
            self.sync.api_key = Some(Zeroizing::new(key));
        }
        if let Some(secs) = var("NEXUS_STOCK_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("NEXUS_STOCK_SYNC_INTERVAL_SECS is not a number: {secs}"))?;
        }
        if let Some(email) = var("NEXUS_STOCK_ADMIN_EMAIL") {
            self.admin.email = email;
        }
        if let Some(password) = var("NEXUS_STOCK_ADMIN_PASSWORD") {
            self.admin.password = Some(Zeroizing::new(password));
        }
        Ok(())
    }
}
