//! Configuration resolution for hostpanel.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. System config (`/etc/hostpanel/config.toml`)
//! 3. User config (`$XDG_CONFIG_HOME/hostpanel/config.toml`) or an explicit file
//! 4. Environment variables (`HOSTPANEL_*`)
//! 5. CLI arguments (applied by the binary, highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// System-wide config file location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/hostpanel/config.toml";

/// Complete hostpanel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PanelConfig {
    pub paths: PathsConfig,
    pub accounts: AccountsConfig,
    pub timeouts: TimeoutsConfig,
    pub php: PhpConfig,
    pub tls: TlsConfig,
    pub engines: EnginesConfig,
    pub log: LogConfig,
}

/// Host filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub registry: PathBuf,
    pub sites_root: PathBuf,
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
    pub php_root: PathBuf,
    pub socket_dir: PathBuf,
    pub letsencrypt_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            registry: PathBuf::from("/var/lib/hostpanel/registry.db"),
            sites_root: PathBuf::from("/srv/hostpanel/sites"),
            sites_available: PathBuf::from("/etc/nginx/sites-available"),
            sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            php_root: PathBuf::from("/etc/php"),
            socket_dir: PathBuf::from("/run/php"),
            letsencrypt_root: PathBuf::from("/etc/letsencrypt"),
        }
    }
}

/// Service accounts that own and serve site files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Account the runtime pool runs as and that owns project files.
    pub site_owner: String,
    /// Group the web server runs under.
    pub web_group: String,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            site_owner: "hostpanel".to_string(),
            web_group: "www-data".to_string(),
        }
    }
}

/// Time bounds for external operations, in seconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub step_secs: u64,
    pub package_secs: u64,
    pub pipeline_deadline_secs: u64,
    pub pool_settle_ms: u64,
    pub lock_retry_attempts: u32,
    pub lock_retry_backoff_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            step_secs: 120,
            package_secs: 600,
            pipeline_deadline_secs: 1800,
            pool_settle_ms: 2000,
            lock_retry_attempts: 5,
            lock_retry_backoff_ms: 3000,
        }
    }
}

impl TimeoutsConfig {
    pub const fn step(&self) -> Duration {
        Duration::from_secs(self.step_secs)
    }

    pub const fn package(&self) -> Duration {
        Duration::from_secs(self.package_secs)
    }

    pub const fn pipeline_deadline(&self) -> Duration {
        Duration::from_secs(self.pipeline_deadline_secs)
    }

    pub const fn pool_settle(&self) -> Duration {
        Duration::from_millis(self.pool_settle_ms)
    }

    pub const fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }
}

/// PHP runtime selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhpConfig {
    /// Used when neither a manifest constraint nor an installed runtime exists.
    pub default_version: String,
    /// Versions below this are raised to it.
    pub minimum_version: String,
}

impl Default for PhpConfig {
    fn default() -> Self {
        Self {
            default_version: "8.2".to_string(),
            minimum_version: "7.4".to_string(),
        }
    }
}

/// Certificate issuance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub contact_email: Option<String>,
    /// Also request a certificate for `www.<domain>`.
    pub include_www: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            contact_email: None,
            include_www: true,
        }
    }
}

/// Root connection strings for the database engines.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EnginesConfig {
    pub mysql_root_dsn: Option<String>,
    pub postgres_root_dsn: Option<String>,
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "hostpanel_orchestrator=info,hostpanel=info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// When `explicit` is given it replaces the user config file and must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<PanelConfig> {
    let mut layers = vec![PathBuf::from(SYSTEM_CONFIG_PATH)];
    match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            layers.push(path.to_path_buf());
        }
        None => layers.extend(user_config_path()),
    }

    let mut merged = toml::Table::new();
    for path in layers.iter().filter(|p| p.exists()) {
        merge_tables(&mut merged, load_table(path)?);
    }

    let mut config: PanelConfig = toml::Value::Table(merged)
        .try_into()
        .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Per-user config file path.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hostpanel").join("config.toml"))
}

fn load_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    content.parse::<toml::Table>().map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay `overlay` onto `base`, recursing into sub-tables so a file that
/// sets one key of a section keeps the rest from lower layers.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn apply_env_overrides(config: &mut PanelConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("HOSTPANEL_REGISTRY") {
        config.paths.registry = PathBuf::from(val);
    }
    if let Some(val) = var("HOSTPANEL_SITES_ROOT") {
        config.paths.sites_root = PathBuf::from(val);
    }
    if let Some(val) = var("HOSTPANEL_SITE_OWNER") {
        config.accounts.site_owner = val;
    }
    if let Some(val) = var("HOSTPANEL_CONTACT_EMAIL") {
        config.tls.contact_email = Some(val);
    }
    if let Some(val) = var("HOSTPANEL_MYSQL_ROOT_DSN") {
        config.engines.mysql_root_dsn = Some(val);
    }
    if let Some(val) = var("HOSTPANEL_POSTGRES_ROOT_DSN") {
        config.engines.postgres_root_dsn = Some(val);
    }
    if let Some(n) = var("HOSTPANEL_STEP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.timeouts.step_secs = n;
    }
    if let Some(n) = var("HOSTPANEL_PIPELINE_DEADLINE_SECS").and_then(|v| v.parse().ok()) {
        config.timeouts.pipeline_deadline_secs = n;
    }
    if let Some(val) = var("HOSTPANEL_LOG") {
        config.log.filter = val;
    }
}
