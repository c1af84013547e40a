//! Step executor.
//!
//! Runs a [`Plan`] against the providers. Each step checks whether it is
//! already satisfied, applies its action, then verifies the result, all
//! under a per-step timeout. Package-manager lock contention is retried
//! with a fixed backoff; anything else ends the run.

use std::time::{Duration, Instant};

use hostpanel_core::config::TimeoutsConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::planner::{ArtisanGuard, Criticality, Plan, RestartWhen, Step};
use crate::providers::{ComposerMode, ProviderError, Providers, ToolInvocation, WriteOutcome};
use crate::templates;

/// Phrases composer prints when the lock file no longer fits the manifest.
const RESOLUTION_MARKERS: &[&str] = &[
    "lock file",
    "constraint",
    "Your requirements could not be resolved",
];

/// How often to look for the pool socket while settling.
const SOCKET_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub step_timeout: Duration,
    pub long_step_timeout: Duration,
    pub deadline: Duration,
    pub lock_retry_attempts: u32,
    pub lock_retry_backoff: Duration,
}

impl ExecutorSettings {
    pub const fn from_timeouts(timeouts: &TimeoutsConfig) -> Self {
        Self {
            step_timeout: timeouts.step(),
            long_step_timeout: timeouts.package(),
            deadline: timeouts.pipeline_deadline(),
            lock_retry_attempts: timeouts.lock_retry_attempts,
            lock_retry_backoff: timeouts.lock_retry_backoff(),
        }
    }
}

/// What happened to one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// Already satisfied; nothing was run.
    Skipped(&'static str),
}

/// Per-step record of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn was_applied(&self, step: &str) -> bool {
        self.applied.iter().any(|s| s == step)
    }
}

/// Result of a teardown run, which does not stop at the first failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownOutcome {
    /// Required steps that failed, as `step: error`.
    pub failures: Vec<String>,
    /// Best-effort steps that failed or were skipped.
    pub warnings: Vec<String>,
}

/// State carried between the steps of one run.
#[derive(Debug, Default)]
struct RunState {
    pool_written: bool,
}

#[derive(Clone)]
pub struct Executor {
    providers: Providers,
    settings: ExecutorSettings,
}

impl Executor {
    pub const fn new(providers: Providers, settings: ExecutorSettings) -> Self {
        Self {
            providers,
            settings,
        }
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// Cancellation and the pipeline deadline are checked between steps,
    /// never while a step is running.
    pub async fn run(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let started = Instant::now();
        let mut state = RunState::default();
        let mut report = RunReport::default();
        info!(operation = plan.operation, domain = %plan.domain, steps = plan.steps.len(), "running plan");

        for planned in &plan.steps {
            let name = planned.step.name();
            if cancel.is_cancelled() {
                warn!(domain = %plan.domain, next_step = %name, "run cancelled");
                return Err(OrchestratorError::Cancelled { next_step: name });
            }
            if started.elapsed() >= self.settings.deadline {
                warn!(domain = %plan.domain, next_step = %name, "pipeline deadline passed");
                return Err(OrchestratorError::step(
                    name,
                    ProviderError::Timeout {
                        command: format!("{} pipeline", plan.operation),
                        timeout: self.settings.deadline,
                    },
                ));
            }

            match self.run_step(&planned.step, &mut state, cancel).await {
                Ok(StepOutcome::Applied) => report.applied.push(name),
                Ok(StepOutcome::Skipped(_)) => report.skipped.push(name),
                Err(e) => return Err(OrchestratorError::step(name, e)),
            }
        }

        info!(
            operation = plan.operation,
            domain = %plan.domain,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "plan complete"
        );
        Ok(report)
    }

    /// Run a teardown plan to the end, collecting failures by criticality.
    pub async fn run_teardown(&self, plan: &Plan) -> TeardownOutcome {
        let never = CancellationToken::new();
        let mut state = RunState::default();
        let mut outcome = TeardownOutcome::default();

        for planned in &plan.steps {
            let name = planned.step.name();
            if planned.criticality == Criticality::AfterRequired && !outcome.failures.is_empty() {
                warn!(domain = %plan.domain, step = %name, "skipped after a required step failed");
                outcome
                    .warnings
                    .push(format!("{name}: skipped because an earlier required step failed"));
                continue;
            }
            if let Err(e) = self.run_step(&planned.step, &mut state, &never).await {
                let line = format!("{name}: {e}");
                if planned.criticality == Criticality::Required {
                    warn!(domain = %plan.domain, step = %name, error = %e, "required teardown step failed");
                    outcome.failures.push(line);
                } else {
                    warn!(domain = %plan.domain, step = %name, error = %e, "best-effort teardown step failed");
                    outcome.warnings.push(line);
                }
            }
        }
        outcome
    }

    /// One step with its timeout and lock-contention retries.
    async fn run_step(
        &self,
        step: &Step,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ProviderError> {
        let name = step.name();
        let timeout = if step.is_long_running() {
            self.settings.long_step_timeout
        } else {
            self.settings.step_timeout
        };
        let attempts = self.settings.lock_retry_attempts.max(1);

        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = tokio::time::timeout(timeout, self.execute(step, state))
                .await
                .unwrap_or_else(|_| {
                    Err(ProviderError::Timeout {
                        command: name.clone(),
                        timeout,
                    })
                });
            match result {
                Ok(outcome) => {
                    match outcome {
                        StepOutcome::Applied => info!(
                            step = %name,
                            elapsed_ms = started.elapsed().as_millis(),
                            "step applied"
                        ),
                        StepOutcome::Skipped(reason) => info!(step = %name, reason, "step skipped"),
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        step = %name,
                        attempt,
                        attempts,
                        backoff_ms = self.settings.lock_retry_backoff.as_millis(),
                        "transient failure, retrying: {e}"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(self.settings.lock_retry_backoff) => {}
                        () = cancel.cancelled() => return Err(e),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Precondition, action, postcondition.
    #[allow(clippy::too_many_lines)]
    async fn execute(&self, step: &Step, state: &mut RunState) -> Result<StepOutcome, ProviderError> {
        let p = &self.providers;
        match step {
            Step::InstallPackages { packages } => {
                if p.packages.missing(packages).await?.is_empty() {
                    return Ok(StepOutcome::Skipped("packages already installed"));
                }
                p.packages.ensure_installed(packages).await?;
                let still_missing = p.packages.missing(packages).await?;
                if !still_missing.is_empty() {
                    return Err(ProviderError::Check(format!(
                        "packages still missing after install: {}",
                        still_missing.join(", ")
                    )));
                }
            }

            Step::ApplyPermissions(spec) => p.files.apply_permissions(spec).await?,

            Step::WritePoolConfig {
                version,
                domain,
                content,
            } => {
                let previous = p.pool.pool_version(domain).await?;
                let outcome = p.pool.write_pool_config(*version, domain, content).await?;
                if p.pool.pool_version(domain).await? != Some(*version) {
                    return Err(ProviderError::Check(format!(
                        "pool config for {domain} not found under PHP {version}"
                    )));
                }
                // The old version's master still serves the removed pool.
                if let Some(old) = previous.filter(|old| old != version) {
                    let service = old.fpm_service();
                    if let Err(e) = p.supervisor.restart(&service).await {
                        warn!(%service, domain, error = %e, "could not restart the previous PHP version");
                    }
                }
                if outcome == WriteOutcome::Unchanged {
                    return Ok(StepOutcome::Skipped("pool config unchanged"));
                }
                state.pool_written = true;
            }

            Step::RestartPool {
                service,
                socket,
                settle,
                when,
            } => {
                if *when == RestartWhen::IfChanged && !state.pool_written {
                    let socket_up = match socket {
                        Some(socket) => p.pool.socket_ready(socket).await,
                        None => true,
                    };
                    if socket_up && p.supervisor.is_active(service).await {
                        return Ok(StepOutcome::Skipped("pool unchanged and running"));
                    }
                }
                p.supervisor.restart(service).await?;
                if let Some(socket) = socket {
                    self.settle(socket, *settle).await;
                    if !p.pool.socket_ready(socket).await {
                        return Err(ProviderError::Check(format!(
                            "{service} restarted but {} did not appear",
                            socket.display()
                        )));
                    }
                }
                if !p.supervisor.is_active(service).await {
                    return Err(ProviderError::Check(format!(
                        "{service} is not active after restart"
                    )));
                }
            }

            Step::ResolveDependencies(invocation) => self.resolve_dependencies(invocation).await?,

            Step::Artisan {
                invocation,
                args,
                guard,
            } => {
                if let Some(reason) = self.artisan_satisfied(invocation, *guard).await? {
                    return Ok(StepOutcome::Skipped(reason));
                }
                p.toolchain.artisan(invocation, args).await?;
            }

            Step::WriteVirtualHost { name, spec } | Step::SecureVirtualHost { name, spec } => {
                let cert = p.certs.local_certificate(&spec.domain).await;
                if matches!(step, Step::SecureVirtualHost { .. }) && cert.is_none() {
                    return Ok(StepOutcome::Skipped("no local certificate"));
                }
                let content = templates::virtual_host(spec, cert.as_ref());
                let outcome = p.proxy.write_virtual_host(name, &content).await?;
                if p.proxy.read_virtual_host(name).await?.as_deref() != Some(content.as_str()) {
                    return Err(ProviderError::Check(format!(
                        "virtual host {name} does not hold the rendered config"
                    )));
                }
                if outcome == WriteOutcome::Unchanged {
                    return Ok(StepOutcome::Skipped("virtual host unchanged"));
                }
            }

            Step::EnableSite { site, config } => {
                if p.proxy.enabled_config(site).await?.as_deref() == Some(config.as_str()) {
                    return Ok(StepOutcome::Skipped("site already enabled"));
                }
                p.proxy.enable(site, config).await?;
                if p.proxy.enabled_config(site).await?.as_deref() != Some(config.as_str()) {
                    return Err(ProviderError::Check(format!(
                        "{site} does not point at {config}"
                    )));
                }
            }

            Step::ValidateProxy => p.proxy.validate_config().await?,

            Step::ReloadProxy => p.proxy.reload().await?,

            Step::EnsureCertificate {
                domain,
                contact_email,
            } => {
                if p.certs.exists(domain).await {
                    return Ok(StepOutcome::Skipped("certificate already present"));
                }
                p.certs.issue(domain, contact_email.as_deref()).await?;
                if !p.certs.exists(domain).await {
                    return Err(ProviderError::Check(format!(
                        "no certificate for {domain} after issuance"
                    )));
                }
            }

            Step::WriteSuspendedHost {
                live,
                suspended,
                domain,
                include_www,
            } => {
                let live_config = p.proxy.read_virtual_host(live).await?;
                if live_config.is_none() {
                    warn!(domain = %domain, "live virtual host missing, suspending without TLS");
                }
                let content =
                    templates::suspended_host(domain, *include_www, live_config.as_deref());
                if p.proxy.write_virtual_host(suspended, &content).await? == WriteOutcome::Unchanged {
                    return Ok(StepOutcome::Skipped("suspended host unchanged"));
                }
            }

            Step::CheckHealth { services, socket } => {
                for service in services {
                    if !p.supervisor.is_active(service).await {
                        return Err(ProviderError::Check(format!("{service} is not active")));
                    }
                }
                if let Some(socket) = socket
                    && !p.pool.socket_ready(socket).await
                {
                    return Err(ProviderError::Check(format!(
                        "pool socket {} is missing",
                        socket.display()
                    )));
                }
            }

            Step::RemovePoolConfig { domain } => {
                if p.pool.pool_version(domain).await?.is_none() {
                    return Ok(StepOutcome::Skipped("no pool config"));
                }
                let removed = p.pool.remove_pool_configs(domain).await?;
                debug!(domain = %domain, ?removed, "removed pool configs");
                if let Some(version) = p.pool.pool_version(domain).await? {
                    return Err(ProviderError::Check(format!(
                        "pool config for {domain} still present under PHP {version}"
                    )));
                }
            }

            Step::DisableSite { site } => {
                if p.proxy.enabled_config(site).await?.is_none() {
                    return Ok(StepOutcome::Skipped("site not enabled"));
                }
                p.proxy.disable(site).await?;
            }

            Step::RemoveVirtualHosts { names } => {
                for name in names {
                    p.proxy.remove_virtual_host(name).await?;
                    if p.proxy.read_virtual_host(name).await?.is_some() {
                        return Err(ProviderError::Check(format!(
                            "virtual host {name} still present"
                        )));
                    }
                }
            }

            Step::RemoveCertificate { domain } => {
                if p.certs.local_certificate(domain).await.is_none() {
                    return Ok(StepOutcome::Skipped("no local certificate"));
                }
                p.certs.remove(domain).await?;
            }

            Step::RemoveRoot { root } => {
                if !p.files.exists(root).await {
                    return Ok(StepOutcome::Skipped("root already removed"));
                }
                p.files.remove_tree(root).await?;
                if p.files.exists(root).await {
                    return Err(ProviderError::Check(format!(
                        "{} still exists",
                        root.display()
                    )));
                }
            }
        }
        Ok(StepOutcome::Applied)
    }

    /// Poll for the socket until it appears or `settle` runs out.
    async fn settle(&self, socket: &std::path::Path, settle: Duration) {
        let until = Instant::now() + settle;
        while !self.providers.pool.socket_ready(socket).await && Instant::now() < until {
            tokio::time::sleep(SOCKET_POLL.min(settle)).await;
        }
    }

    /// `composer install`, falling back once to `composer update` when the
    /// lock file cannot be honoured.
    async fn resolve_dependencies(&self, invocation: &ToolInvocation) -> Result<(), ProviderError> {
        let toolchain = &self.providers.toolchain;
        match toolchain.composer(invocation, ComposerMode::Install).await {
            Ok(_) => Ok(()),
            Err(ProviderError::CommandFailed { diagnostics, .. }) if needs_update(&diagnostics) => {
                warn!(root = %invocation.root.display(), "lock file out of date, running composer update");
                toolchain
                    .composer(invocation, ComposerMode::Update)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn artisan_satisfied(
        &self,
        invocation: &ToolInvocation,
        guard: Option<ArtisanGuard>,
    ) -> Result<Option<&'static str>, ProviderError> {
        let files = &self.providers.files;
        Ok(match guard {
            None => None,
            Some(ArtisanGuard::UnlessAppKey) => {
                let env = files.read_to_string(&invocation.root.join(".env")).await?;
                env.as_deref()
                    .is_some_and(has_app_key)
                    .then_some("APP_KEY already set")
            }
            Some(ArtisanGuard::UnlessStorageLinked) => files
                .exists(&invocation.root.join("public").join("storage"))
                .await
                .then_some("storage already linked"),
        })
    }
}

fn needs_update(diagnostics: &str) -> bool {
    let lower = diagnostics.to_lowercase();
    RESOLUTION_MARKERS
        .iter()
        .any(|m| lower.contains(&m.to_lowercase()))
}

/// `.env` has a non-empty `APP_KEY=` line.
fn has_app_key(env: &str) -> bool {
    env.lines().any(|line| {
        line.trim()
            .strip_prefix("APP_KEY=")
            .is_some_and(|v| !v.trim().trim_matches('"').is_empty())
    })
}
