//! In-memory host for tests.
//!
//! One `FakeHost` implements every provider trait over shared state, logs
//! each call as a short line (`"restart php8.2-fpm"`), and can be told to
//! fail, stall, or report lock contention on a named operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::cmd::CommandOutput;
use super::fsutil::WriteOutcome;
use super::{
    CertificateAuthority, CertificatePaths, ComposerMode, PackageManager, PermissionSpec,
    ProcessSupervisor, ProviderError, Providers, RelationalAdmin, ReverseProxy, RuntimePool,
    SiteFiles, ToolInvocation, Toolchain,
};
use crate::runtime::PhpVersion;
use crate::storage::{DatabaseStats, Engine};

const PROXY_SERVICE: &str = "nginx";

#[derive(Debug, Clone)]
enum Failure {
    Command(String),
    Lock,
}

#[derive(Debug, Clone)]
struct Injected {
    failure: Failure,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<String>,
    failures: HashMap<String, Injected>,
    delays: HashMap<String, Duration>,

    packages: BTreeSet<String>,
    inactive: HashSet<String>,
    restarts: HashMap<String, usize>,

    vhosts: BTreeMap<String, String>,
    enabled: BTreeMap<String, String>,

    php_versions: Vec<PhpVersion>,
    pools: BTreeMap<String, (PhpVersion, String)>,
    sockets_down: bool,

    certificates: BTreeSet<String>,
    served_elsewhere: BTreeSet<String>,

    users: BTreeSet<(Engine, String)>,
    databases: BTreeSet<(Engine, String)>,

    files: BTreeMap<PathBuf, String>,
    archives: HashMap<PathBuf, Vec<(String, String)>>,
}

/// Shared in-memory host. Clone the `Arc` to inspect state after a run.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    /// A host with PHP 8.2 installed and nginx running.
    pub fn new() -> Arc<Self> {
        let host = Self::default();
        host.lock().php_versions = vec![PhpVersion::new(8, 2)];
        Arc::new(host)
    }

    /// Every provider slot backed by this host.
    pub fn providers(self: &Arc<Self>) -> Providers {
        Providers {
            packages: self.clone(),
            supervisor: self.clone(),
            proxy: self.clone(),
            pool: self.clone(),
            certs: self.clone(),
            relational: self.clone(),
            files: self.clone(),
            toolchain: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- setup ---------------------------------------------------------------

    /// Fail `op` every time with `diagnostics`.
    pub fn fail(&self, op: &str, diagnostics: &str) {
        self.inject(op, Failure::Command(diagnostics.to_string()), None);
    }

    /// Fail `op` once with `diagnostics`, then succeed.
    pub fn fail_once(&self, op: &str, diagnostics: &str) {
        self.inject(op, Failure::Command(diagnostics.to_string()), Some(1));
    }

    /// Report a held package lock on the next `times` calls of `op`.
    pub fn lock_contention(&self, op: &str, times: usize) {
        self.inject(op, Failure::Lock, Some(times));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    fn inject(&self, op: &str, failure: Failure, remaining: Option<usize>) {
        self.lock()
            .failures
            .insert(op.to_string(), Injected { failure, remaining });
    }

    /// Make `op` take `delay` before acting.
    pub fn delay(&self, op: &str, delay: Duration) {
        self.lock().delays.insert(op.to_string(), delay);
    }

    pub fn set_php_versions(&self, versions: &[PhpVersion]) {
        self.lock().php_versions = versions.to_vec();
    }

    pub fn set_inactive(&self, service: &str) {
        self.lock().inactive.insert(service.to_string());
    }

    pub fn set_sockets_down(&self, down: bool) {
        self.lock().sockets_down = down;
    }

    /// Certificate material already present locally.
    pub fn add_certificate(&self, domain: &str) {
        self.lock().certificates.insert(domain.to_string());
    }

    /// The domain serves a certificate this host did not issue.
    pub fn serve_certificate_elsewhere(&self, domain: &str) {
        self.lock().served_elsewhere.insert(domain.to_string());
    }

    pub fn put_file(&self, path: impl Into<PathBuf>, content: &str) {
        self.lock().files.insert(path.into(), content.to_string());
    }

    /// Register an archive whose extraction yields `entries` (relative
    /// path, content).
    pub fn put_archive(&self, path: impl Into<PathBuf>, entries: &[(&str, &str)]) {
        self.lock().archives.insert(
            path.into(),
            entries
                .iter()
                .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
                .collect(),
        );
    }

    // --- inspection ----------------------------------------------------------

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls whose line starts with `prefix`.
    pub fn calls_to(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn restarts(&self, service: &str) -> usize {
        self.lock().restarts.get(service).copied().unwrap_or(0)
    }

    pub fn installed_packages(&self) -> Vec<String> {
        self.lock().packages.iter().cloned().collect()
    }

    pub fn vhost(&self, name: &str) -> Option<String> {
        self.lock().vhosts.get(name).cloned()
    }

    pub fn enabled_target(&self, site: &str) -> Option<String> {
        self.lock().enabled.get(site).cloned()
    }

    pub fn pool(&self, domain: &str) -> Option<(PhpVersion, String)> {
        self.lock().pools.get(domain).cloned()
    }

    pub fn has_certificate(&self, domain: &str) -> bool {
        self.lock().certificates.contains(domain)
    }

    pub fn has_user(&self, engine: Engine, username: &str) -> bool {
        self.lock().users.contains(&(engine, username.to_string()))
    }

    pub fn has_database(&self, engine: Engine, name: &str) -> bool {
        self.lock().databases.contains(&(engine, name.to_string()))
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    /// Any file at or below `path`.
    pub fn path_exists(&self, path: &Path) -> bool {
        self.lock().files.keys().any(|p| p.starts_with(path))
    }

    // --- call plumbing -------------------------------------------------------

    /// Log the call, honour any delay, then apply any injected failure.
    async fn enter(&self, op: &str, detail: &str) -> Result<(), ProviderError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(if detail.is_empty() {
                op.to_string()
            } else {
                format!("{op} {detail}")
            });
            state.delays.get(op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let Some(injected) = state.failures.get_mut(op) else {
            return Ok(());
        };
        let failure = injected.failure.clone();
        match &mut injected.remaining {
            Some(0) => return Ok(()),
            Some(n) => *n -= 1,
            None => {}
        }
        Err(match failure {
            Failure::Command(diagnostics) => ProviderError::CommandFailed {
                command: format!("{op} {detail}").trim_end().to_string(),
                code: Some(1),
                diagnostics,
            },
            Failure::Lock => ProviderError::LockContention(
                "Could not get lock /var/lib/dpkg/lock-frontend".into(),
            ),
        })
    }
}

fn engine_exists(engine: Engine, what: &str) -> ProviderError {
    ProviderError::Engine {
        engine,
        message: format!("{what} already exists"),
    }
}

#[async_trait]
impl PackageManager for FakeHost {
    async fn missing(&self, packages: &[String]) -> Result<Vec<String>, ProviderError> {
        let state = self.lock();
        Ok(packages
            .iter()
            .filter(|p| !state.packages.contains(*p))
            .cloned()
            .collect())
    }

    async fn ensure_installed(&self, packages: &[String]) -> Result<(), ProviderError> {
        self.enter("install", &packages.join(" ")).await?;
        self.lock().packages.extend(packages.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for FakeHost {
    async fn restart(&self, service: &str) -> Result<(), ProviderError> {
        self.enter("restart", service).await?;
        *self.lock().restarts.entry(service.to_string()).or_default() += 1;
        Ok(())
    }

    async fn is_active(&self, service: &str) -> bool {
        !self.lock().inactive.contains(service)
    }
}

#[async_trait]
impl ReverseProxy for FakeHost {
    async fn write_virtual_host(
        &self,
        name: &str,
        content: &str,
    ) -> Result<WriteOutcome, ProviderError> {
        self.enter("write-vhost", name).await?;
        let mut state = self.lock();
        if state.vhosts.get(name).map(String::as_str) == Some(content) {
            return Ok(WriteOutcome::Unchanged);
        }
        state.vhosts.insert(name.to_string(), content.to_string());
        Ok(WriteOutcome::Written)
    }

    async fn read_virtual_host(&self, name: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.lock().vhosts.get(name).cloned())
    }

    async fn remove_virtual_host(&self, name: &str) -> Result<(), ProviderError> {
        self.enter("remove-vhost", name).await?;
        self.lock().vhosts.remove(name);
        Ok(())
    }

    async fn enable(&self, site: &str, config: &str) -> Result<(), ProviderError> {
        self.enter("enable", &format!("{site} {config}")).await?;
        self.lock()
            .enabled
            .insert(site.to_string(), config.to_string());
        Ok(())
    }

    async fn disable(&self, site: &str) -> Result<(), ProviderError> {
        self.enter("disable", site).await?;
        self.lock().enabled.remove(site);
        Ok(())
    }

    async fn enabled_config(&self, site: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.lock().enabled.get(site).cloned())
    }

    async fn validate_config(&self) -> Result<(), ProviderError> {
        self.enter("validate-proxy", "").await
    }

    async fn reload(&self) -> Result<(), ProviderError> {
        self.enter("reload-proxy", "").await
    }

    fn service(&self) -> &str {
        PROXY_SERVICE
    }
}

#[async_trait]
impl RuntimePool for FakeHost {
    async fn installed_versions(&self) -> Result<Vec<PhpVersion>, ProviderError> {
        let mut versions = self.lock().php_versions.clone();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        Ok(versions)
    }

    async fn write_pool_config(
        &self,
        version: PhpVersion,
        domain: &str,
        content: &str,
    ) -> Result<WriteOutcome, ProviderError> {
        self.enter("write-pool", &format!("{version} {domain}")).await?;
        let mut state = self.lock();
        if state.pools.get(domain) == Some(&(version, content.to_string())) {
            return Ok(WriteOutcome::Unchanged);
        }
        state
            .pools
            .insert(domain.to_string(), (version, content.to_string()));
        Ok(WriteOutcome::Written)
    }

    async fn pool_version(&self, domain: &str) -> Result<Option<PhpVersion>, ProviderError> {
        Ok(self.lock().pools.get(domain).map(|(v, _)| *v))
    }

    async fn remove_pool_configs(&self, domain: &str) -> Result<Vec<PhpVersion>, ProviderError> {
        self.enter("remove-pool", domain).await?;
        Ok(self.lock().pools.remove(domain).map(|(v, _)| v).into_iter().collect())
    }

    async fn socket_ready(&self, _socket: &Path) -> bool {
        !self.lock().sockets_down
    }
}

#[async_trait]
impl CertificateAuthority for FakeHost {
    async fn exists(&self, domain: &str) -> bool {
        let state = self.lock();
        state.certificates.contains(domain) || state.served_elsewhere.contains(domain)
    }

    async fn local_certificate(&self, domain: &str) -> Option<CertificatePaths> {
        self.lock().certificates.contains(domain).then(|| {
            let live = Path::new("/etc/letsencrypt/live").join(domain);
            CertificatePaths {
                fullchain: live.join("fullchain.pem"),
                private_key: live.join("privkey.pem"),
            }
        })
    }

    async fn issue(&self, domain: &str, _contact_email: Option<&str>) -> Result<(), ProviderError> {
        self.enter("issue-cert", domain).await?;
        self.lock().certificates.insert(domain.to_string());
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<(), ProviderError> {
        self.enter("remove-cert", domain).await?;
        self.lock().certificates.remove(domain);
        Ok(())
    }
}

#[async_trait]
impl RelationalAdmin for FakeHost {
    async fn create_user(
        &self,
        engine: Engine,
        username: &str,
        _password: &str,
    ) -> Result<(), ProviderError> {
        self.enter("create-user", &format!("{engine} {username}"))
            .await?;
        if !self.lock().users.insert((engine, username.to_string())) {
            return Err(engine_exists(engine, &format!("user {username}")));
        }
        Ok(())
    }

    async fn drop_user(&self, engine: Engine, username: &str) -> Result<(), ProviderError> {
        self.enter("drop-user", &format!("{engine} {username}")).await?;
        self.lock().users.remove(&(engine, username.to_string()));
        Ok(())
    }

    async fn create_database(
        &self,
        engine: Engine,
        name: &str,
        owner: &str,
    ) -> Result<(), ProviderError> {
        self.enter("create-db", &format!("{engine} {name} {owner}"))
            .await?;
        if !self.lock().databases.insert((engine, name.to_string())) {
            return Err(engine_exists(engine, &format!("database {name}")));
        }
        Ok(())
    }

    async fn drop_database(
        &self,
        engine: Engine,
        name: &str,
        _owner: &str,
    ) -> Result<(), ProviderError> {
        self.enter("drop-db", &format!("{engine} {name}")).await?;
        self.lock().databases.remove(&(engine, name.to_string()));
        Ok(())
    }

    async fn stats(&self, engine: Engine, name: &str) -> Result<DatabaseStats, ProviderError> {
        self.enter("stats", &format!("{engine} {name}")).await?;
        if !self.has_database(engine, name) {
            return Err(ProviderError::Engine {
                engine,
                message: format!("unknown database {name}"),
            });
        }
        Ok(DatabaseStats {
            size_mb: 1.5,
            table_count: 12,
        })
    }
}

#[async_trait]
impl SiteFiles for FakeHost {
    async fn exists(&self, path: &Path) -> bool {
        self.path_exists(path)
    }

    async fn read_to_string(&self, path: &Path) -> Result<Option<String>, ProviderError> {
        Ok(self.file(path))
    }

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), ProviderError> {
        self.enter("extract", &dest.display().to_string()).await?;
        let mut state = self.lock();
        let entries = state.archives.get(archive).cloned().ok_or_else(|| {
            ProviderError::CommandFailed {
                command: format!("unzip -o -q {}", archive.display()),
                code: Some(9),
                diagnostics: format!("cannot find or open {}", archive.display()),
            }
        })?;
        for (rel, content) in entries {
            state.files.insert(dest.join(rel), content);
        }
        Ok(())
    }

    async fn apply_permissions(&self, spec: &PermissionSpec) -> Result<(), ProviderError> {
        self.enter("permissions", &spec.root.display().to_string())
            .await
    }

    async fn remove_tree(&self, path: &Path) -> Result<(), ProviderError> {
        self.enter("remove-tree", &path.display().to_string()).await?;
        self.lock().files.retain(|p, _| !p.starts_with(path));
        Ok(())
    }
}

#[async_trait]
impl Toolchain for FakeHost {
    async fn composer(
        &self,
        invocation: &ToolInvocation,
        mode: ComposerMode,
    ) -> Result<CommandOutput, ProviderError> {
        let op = match mode {
            ComposerMode::Install => "composer-install",
            ComposerMode::Update => "composer-update",
        };
        self.enter(op, &invocation.php.to_string()).await?;
        Ok(CommandOutput {
            code: Some(0),
            stdout: "Generating optimized autoload files".into(),
            stderr: String::new(),
        })
    }

    async fn artisan(
        &self,
        invocation: &ToolInvocation,
        args: &[String],
    ) -> Result<CommandOutput, ProviderError> {
        self.enter("artisan", &args.join(" ")).await?;
        if args.first().map(String::as_str) == Some("storage:link") {
            self.put_file(invocation.root.join("public/storage/.link"), "");
        }
        Ok(CommandOutput {
            code: Some(0),
            ..CommandOutput::default()
        })
    }
}
