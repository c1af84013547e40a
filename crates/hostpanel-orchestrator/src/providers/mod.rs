//! Capability providers: thin async interfaces over the host tools the
//! orchestrator drives, plus their Debian/Ubuntu implementations.
//!
//! Everything above this module talks to the host only through these
//! traits, so tests swap in [`fake::FakeHost`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::runtime::PhpVersion;
use crate::storage::{DatabaseStats, Engine};

pub mod apt;
pub mod certbot;
pub mod cmd;
pub mod fsutil;
pub mod nginx;
pub mod php_fpm;
pub mod relational;
pub mod site_files;
pub mod systemd;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use cmd::{CommandOutput, HostCommand};
pub use fsutil::WriteOutcome;

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The tool ran and reported failure.
    #[error("{command} failed (exit {}): {diagnostics}", exit_label(*.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("{command} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// The package manager's lock is held by another process. Transient.
    #[error("package manager is locked: {0}")]
    LockContention(String),

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{engine} error: {message}")]
    Engine { engine: Engine, message: String },

    /// A postcondition did not hold after the action ran.
    #[error("check failed: {0}")]
    Check(String),

    #[error("{0}")]
    Unsupported(String),
}

fn exit_label(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

impl ProviderError {
    /// Worth retrying after a short backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockContention(_))
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Certificate material for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificatePaths {
    pub fullchain: PathBuf,
    pub private_key: PathBuf,
}

/// Ownership and mode policy for a project tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionSpec {
    pub root: PathBuf,
    pub owner: String,
    /// Group of the web server; added to the owner's group so it can read.
    pub web_group: String,
    /// Relative to `root`; made writable by the owner.
    pub writable: Vec<PathBuf>,
}

/// Who runs a project tool, where, and with which runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInvocation {
    pub root: PathBuf,
    pub php: PhpVersion,
    pub owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerMode {
    /// Install from the lock file.
    Install,
    /// Re-resolve constraints, rewriting the lock file.
    Update,
}

/// Install-if-absent over the OS package manager.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Packages from `packages` that are not installed.
    async fn missing(&self, packages: &[String]) -> Result<Vec<String>, ProviderError>;

    /// Install whatever is missing. A held package lock surfaces as
    /// [`ProviderError::LockContention`].
    async fn ensure_installed(&self, packages: &[String]) -> Result<(), ProviderError>;
}

/// Service manager.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn restart(&self, service: &str) -> Result<(), ProviderError>;
    async fn is_active(&self, service: &str) -> bool;
}

/// Web-server virtual hosts.
///
/// Configs live under `sites-available`; a site is served when
/// `sites-enabled/<site>` links to one of them.
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Atomically install a config. Identical content is a no-op.
    async fn write_virtual_host(
        &self,
        name: &str,
        content: &str,
    ) -> Result<WriteOutcome, ProviderError>;

    async fn read_virtual_host(&self, name: &str) -> Result<Option<String>, ProviderError>;

    /// Remove a config. Missing configs are not an error.
    async fn remove_virtual_host(&self, name: &str) -> Result<(), ProviderError>;

    /// Point `sites-enabled/<site>` at `sites-available/<config>`.
    async fn enable(&self, site: &str, config: &str) -> Result<(), ProviderError>;

    /// Remove `sites-enabled/<site>`. Missing links are not an error.
    async fn disable(&self, site: &str) -> Result<(), ProviderError>;

    /// Name of the config `sites-enabled/<site>` points at, if any.
    async fn enabled_config(&self, site: &str) -> Result<Option<String>, ProviderError>;

    /// Syntax-check the whole configuration.
    async fn validate_config(&self) -> Result<(), ProviderError>;

    async fn reload(&self) -> Result<(), ProviderError>;

    /// Service name, for health checks.
    fn service(&self) -> &str;
}

/// Language-runtime worker pools.
#[async_trait]
pub trait RuntimePool: Send + Sync {
    /// Runtime releases present on the host.
    async fn installed_versions(&self) -> Result<Vec<PhpVersion>, ProviderError>;

    /// Atomically install the pool config for `domain`. Identical content
    /// is a no-op. Configs for the same domain under other versions are
    /// removed so only one pool binds the socket.
    async fn write_pool_config(
        &self,
        version: PhpVersion,
        domain: &str,
        content: &str,
    ) -> Result<WriteOutcome, ProviderError>;

    /// Version whose pool directory holds a config for `domain`.
    async fn pool_version(&self, domain: &str) -> Result<Option<PhpVersion>, ProviderError>;

    /// Remove every pool config for `domain`; returns the versions touched.
    async fn remove_pool_configs(&self, domain: &str) -> Result<Vec<PhpVersion>, ProviderError>;

    async fn socket_ready(&self, socket: &Path) -> bool;
}

/// TLS certificate issuance.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// A usable certificate is on disk or served by the domain.
    async fn exists(&self, domain: &str) -> bool;

    /// Certificate material on this host, if present and non-trivial.
    async fn local_certificate(&self, domain: &str) -> Option<CertificatePaths>;

    async fn issue(&self, domain: &str, contact_email: Option<&str>) -> Result<(), ProviderError>;

    /// Remove local certificate material. Absent material is not an error.
    async fn remove(&self, domain: &str) -> Result<(), ProviderError>;
}

/// Engine-level database and user administration.
#[async_trait]
pub trait RelationalAdmin: Send + Sync {
    async fn create_user(
        &self,
        engine: Engine,
        username: &str,
        password: &str,
    ) -> Result<(), ProviderError>;

    async fn drop_user(&self, engine: Engine, username: &str) -> Result<(), ProviderError>;

    /// Create `name` and grant `owner` full rights on it.
    async fn create_database(
        &self,
        engine: Engine,
        name: &str,
        owner: &str,
    ) -> Result<(), ProviderError>;

    async fn drop_database(&self, engine: Engine, name: &str, owner: &str)
    -> Result<(), ProviderError>;

    async fn stats(&self, engine: Engine, name: &str) -> Result<DatabaseStats, ProviderError>;
}

/// Project file tree operations.
#[async_trait]
pub trait SiteFiles: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn read_to_string(&self, path: &Path) -> Result<Option<String>, ProviderError>;

    /// Unpack a delivered archive into `dest`, creating it.
    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), ProviderError>;

    async fn apply_permissions(&self, spec: &PermissionSpec) -> Result<(), ProviderError>;

    /// Recursively remove `path`. Missing paths are not an error.
    async fn remove_tree(&self, path: &Path) -> Result<(), ProviderError>;
}

/// Framework tooling run inside a project as its owner.
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn composer(
        &self,
        invocation: &ToolInvocation,
        mode: ComposerMode,
    ) -> Result<CommandOutput, ProviderError>;

    async fn artisan(
        &self,
        invocation: &ToolInvocation,
        args: &[String],
    ) -> Result<CommandOutput, ProviderError>;
}

/// The full set of providers an orchestrator runs against.
#[derive(Clone)]
pub struct Providers {
    pub packages: Arc<dyn PackageManager>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub proxy: Arc<dyn ReverseProxy>,
    pub pool: Arc<dyn RuntimePool>,
    pub certs: Arc<dyn CertificateAuthority>,
    pub relational: Arc<dyn RelationalAdmin>,
    pub files: Arc<dyn SiteFiles>,
    pub toolchain: Arc<dyn Toolchain>,
}

impl Providers {
    /// Real providers for a Debian-family host with nginx, php-fpm,
    /// certbot, and systemd.
    pub fn host(config: &hostpanel_core::PanelConfig) -> Self {
        let timeouts = &config.timeouts;
        let supervisor = Arc::new(systemd::Systemd::new(timeouts.step()));
        Self {
            packages: Arc::new(apt::Apt::new(timeouts.package())),
            proxy: Arc::new(nginx::Nginx::new(
                config.paths.sites_available.clone(),
                config.paths.sites_enabled.clone(),
                timeouts.step(),
            )),
            pool: Arc::new(php_fpm::PhpFpm::new(config.paths.php_root.clone())),
            certs: Arc::new(certbot::Certbot::new(
                config.paths.letsencrypt_root.clone(),
                config.tls.include_www,
                timeouts.step(),
            )),
            relational: Arc::new(relational::SqlAdmin::new(
                config.engines.mysql_root_dsn.clone(),
                config.engines.postgres_root_dsn.clone(),
            )),
            files: Arc::new(site_files::HostFiles::new(timeouts.step())),
            toolchain: Arc::new(site_files::PhpToolchain::new(timeouts.package())),
            supervisor,
        }
    }
}
