//! Unified configuration for schoolhub.
//!
//! Configuration is read from `schoolhub.toml` and layered:
//! file → environment (`SCHOOLHUB_*`, optionally from `.env`) → CLI flags.
//! Every section is optional and falls back to sensible defaults.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [database]
//! path = "data/schoolhub.db"
//!
//! [uploads]
//! dir = "data/uploads"
//! max_bytes = 10485760
//!
//! [live]
//! heartbeat_secs = 25
//! subscriber_buffer = 64
//!
//! [display]
//! timezone = "+01:00"
//! page_size = 20
//!
//! [session]
//! ttl_hours = 168
//! cookie_name = "schoolhub_session"
//! secure = false
//!
//! [logging]
//! level = "info"
//! json = false
//! dir = "data/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::timefmt::SchoolTz;

pub const DEFAULT_CONFIG_FILE: &str = "schoolhub.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS and verbose errors for local development.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/schoolhub.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsSection {
    #[serde(default = "default_upload_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for UploadsSection {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            max_bytes: default_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSection {
    /// Seconds between heartbeat comments on an open event stream.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Events buffered per subscriber before new ones are dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_heartbeat_secs() -> u64 {
    25
}

fn default_subscriber_buffer() -> usize {
    64
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplaySection {
    /// Fixed UTC offset used to render and parse dates, e.g. "+01:00".
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_page_size() -> u32 {
    20
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Adds the `Secure` attribute to the session cookie.
    #[serde(default)]
    pub secure: bool,
}

fn default_ttl_hours() -> i64 {
    24 * 7
}

fn default_cookie_name() -> String {
    "schoolhub_session".to_string()
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            cookie_name: default_cookie_name(),
            secure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// Contents of `schoolhub.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub uploads: UploadsSection,
    #[serde(default)]
    pub live: LiveSection,
    #[serde(default)]
    pub display: DisplaySection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse schoolhub.toml")
    }

    /// Load the file if it exists, otherwise defaults; then apply the
    /// environment layer.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize schoolhub.toml")
    }

    /// Apply `SCHOOLHUB_*` overrides. The lookup is injected so tests do
    /// not have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SCHOOLHUB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("SCHOOLHUB_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("SCHOOLHUB_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("SCHOOLHUB_UPLOAD_DIR") {
            self.uploads.dir = PathBuf::from(dir);
        }
        if let Some(tz) = lookup("SCHOOLHUB_TIMEZONE") {
            self.display.timezone = tz;
        }
        if let Some(level) = lookup("SCHOOLHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("SCHOOLHUB_LOG_JSON") {
            self.logging.json = json != "false" && json != "0";
        }
        if let Some(secure) = lookup("SCHOOLHUB_SECURE_COOKIES") {
            self.session.secure = secure != "false" && secure != "0";
        }
    }

    /// Parsed display timezone; falls back to UTC when invalid (a warning
    /// is reported by [`AppConfig::validate`]).
    pub fn school_tz(&self) -> SchoolTz {
        SchoolTz::parse(&self.display.timezone).unwrap_or_default()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if SchoolTz::parse(&self.display.timezone).is_none() {
            warnings.push(format!(
                "Invalid display.timezone '{}': expected 'UTC' or an offset like '+02:00'",
                self.display.timezone
            ));
        }
        if self.display.page_size == 0 {
            warnings.push("display.page_size must be greater than zero".to_string());
        }
        if self.live.heartbeat_secs == 0 {
            warnings.push("live.heartbeat_secs must be greater than zero".to_string());
        }
        if self.live.subscriber_buffer == 0 {
            warnings.push("live.subscriber_buffer must be greater than zero".to_string());
        }
        if self.session.ttl_hours <= 0 {
            warnings.push("session.ttl_hours must be positive".to_string());
        }
        if self.uploads.max_bytes == 0 {
            warnings.push("uploads.max_bytes must be greater than zero".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }
}

/// Default per-user config location (`~/.config/schoolhub/schoolhub.toml`),
/// used when no `schoolhub.toml` exists in the working directory.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|d| d.join("schoolhub").join(DEFAULT_CONFIG_FILE))
        .filter(|p| p.exists())
        .unwrap_or(local)
}
